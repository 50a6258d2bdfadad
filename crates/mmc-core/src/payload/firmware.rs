//! Firmware image loading and chunking for FFU downloads.

use std::path::Path;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FirmwareError {
    #[error("Wrong firmware size: image is empty")]
    Empty,
    #[error("Firmware data size ({size}) is not aligned to {sector} byte sectors")]
    Misaligned { size: usize, sector: usize },
    #[error("Invalid chunk size {0}: must be a non-zero multiple of 512 no larger than {1}")]
    InvalidChunkSize(usize, usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Vendor firmware bundle held in memory.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    data: Vec<u8>,
}

impl FirmwareImage {
    pub fn from_bytes(data: Vec<u8>) -> Result<Self, FirmwareError> {
        if data.is_empty() {
            return Err(FirmwareError::Empty);
        }
        Ok(Self { data })
    }

    /// Read the whole file; a short read surfaces as an IO error.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, FirmwareError> {
        Self::from_bytes(std::fs::read(path)?)
    }

    /// Fail unless the image is a whole number of `sector` byte sectors.
    pub fn check_alignment(&self, sector: usize) -> Result<(), FirmwareError> {
        if self.data.len() % sector != 0 {
            return Err(FirmwareError::Misaligned {
                size: self.data.len(),
                sector,
            });
        }
        Ok(())
    }

    pub fn raw_data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of 512-byte blocks the device should report once programmed.
    pub fn sectors(&self) -> u32 {
        (self.data.len() / 512) as u32
    }
}

/// Chunk tracking state for stateful sending.
#[derive(Debug, Default, Clone)]
pub struct ChunkState {
    /// Current chunk index.
    pub current: usize,
    /// Total number of chunks.
    pub total: usize,
    /// Current byte offset.
    pub offset: usize,
    /// Size of each chunk.
    pub chunk_size: usize,
    /// Total data size.
    pub data_size: usize,
}

impl ChunkState {
    pub fn new(data_size: usize, chunk_size: usize) -> Self {
        let total = if data_size == 0 || chunk_size == 0 {
            0
        } else {
            data_size.div_ceil(chunk_size)
        };
        Self {
            current: 0,
            total,
            offset: 0,
            chunk_size,
            data_size,
        }
    }

    /// Get next chunk from data, advancing state.
    pub fn next_chunk<'a>(&mut self, data: &'a [u8]) -> Option<&'a [u8]> {
        if self.chunk_size == 0 || self.offset >= data.len() || self.offset >= self.data_size {
            return None;
        }

        let remaining = (self.data_size - self.offset).min(data.len() - self.offset);
        let chunk_len = remaining.min(self.chunk_size);

        let chunk = &data[self.offset..self.offset + chunk_len];
        self.offset += chunk_len;
        self.current += 1;

        Some(chunk)
    }

    pub fn is_done(&self) -> bool {
        self.current >= self.total
    }

    /// Back to the first byte.
    pub fn reset(&mut self) {
        self.current = 0;
        self.offset = 0;
    }

    pub fn progress_pct(&self) -> u8 {
        if self.total == 0 {
            100
        } else {
            ((self.current * 100) / self.total) as u8
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHUNK: usize = 512 * 1024;

    #[test]
    fn test_chunk_state() {
        let data = vec![1u8; 1300 * 1024];
        let mut state = ChunkState::new(data.len(), CHUNK);

        assert_eq!(state.total, 3);
        assert!(!state.is_done());

        assert_eq!(state.next_chunk(&data).unwrap().len(), CHUNK);
        assert_eq!(state.progress_pct(), 33);
        assert_eq!(state.next_chunk(&data).unwrap().len(), CHUNK);
        assert_eq!(state.next_chunk(&data).unwrap().len(), 1300 * 1024 - 2 * CHUNK);

        assert!(state.next_chunk(&data).is_none());
        assert!(state.is_done());

        state.reset();
        assert_eq!(state.offset, 0);
        assert!(!state.is_done());
    }

    #[test]
    fn test_empty_image_rejected() {
        assert!(matches!(FirmwareImage::from_bytes(Vec::new()), Err(FirmwareError::Empty)));
    }

    #[test]
    fn test_alignment() {
        let image = FirmwareImage::from_bytes(vec![0; 4096 + 512]).unwrap();
        assert!(image.check_alignment(512).is_ok());
        assert!(matches!(
            image.check_alignment(4096),
            Err(FirmwareError::Misaligned { size: 4608, sector: 4096 })
        ));
        assert_eq!(image.sectors(), 9);
    }

    #[test]
    fn test_from_missing_file() {
        assert!(matches!(
            FirmwareImage::from_file("/nonexistent/fw.bin"),
            Err(FirmwareError::Io(_))
        ));
    }
}
