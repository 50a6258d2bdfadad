//! MMC session: configuration plus the orchestrator front ends drive.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::events::{LogLevel, MmcEvent, MmcObserver, TracingObserver};
use crate::ops::ffu::{self, FfuMode, FfuOptions, FfuReport};
use crate::ops::{erase, write_protect};
use crate::payload::FirmwareImage;
use crate::protocol::constants::MMC_IOC_MAX_BYTES;
use crate::protocol::{CommandBatch, CommandDescriptor, CommandResponse};
use crate::transport::{MmcTransport, TransportError};

/// Configuration for an MMC session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// FFU download variant used when none is given.
    pub ffu_mode: FfuMode,
    /// FFU chunk size in bytes.
    pub ffu_chunk_size: usize,
    /// Permit irreversible operations such as permanent write protection.
    pub allow_dangerous: bool,
    /// Sanitize timeout in milliseconds; 0 leaves it to the transport.
    pub sanitize_timeout_ms: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ffu_mode: FfuMode::Default,
            ffu_chunk_size: MMC_IOC_MAX_BYTES,
            allow_dangerous: false,
            sanitize_timeout_ms: 0,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: SessionConfig =
            toml::from_str(&content).with_context(|| format!("Invalid config {}", path.display()))?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn ffu_options(&self) -> FfuOptions {
        FfuOptions {
            mode: self.ffu_mode,
            chunk_size: self.ffu_chunk_size,
        }
    }
}

/// Owns one device and runs transactions against it, reporting every
/// command to the observer.
pub struct MmcSession<T: MmcTransport, O: MmcObserver> {
    transport: T,
    config: SessionConfig,
    observer: Arc<O>,
}

impl<T: MmcTransport> MmcSession<T, TracingObserver> {
    /// Create a new session with default tracing observer.
    pub fn new(transport: T, config: SessionConfig) -> Self {
        Self::with_observer(transport, config, Arc::new(TracingObserver))
    }
}

impl<T: MmcTransport, O: MmcObserver + 'static> MmcSession<T, O> {
    /// Create a new session with a custom observer.
    pub fn with_observer(transport: T, config: SessionConfig, observer: Arc<O>) -> Self {
        Self {
            transport,
            config,
            observer,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn device(&self) -> &str {
        self.transport.device_name()
    }

    /// Transport view that reports to the session observer.
    pub fn transport(&self) -> ObservableTransport<'_, T, O> {
        ObservableTransport {
            inner: &self.transport,
            observer: &self.observer,
        }
    }

    /// Run `op` against the device, naming the operation and device if it
    /// fails.
    pub fn execute<R>(
        &self,
        operation: &str,
        op: impl FnOnce(&ObservableTransport<'_, T, O>) -> crate::Result<R>,
    ) -> Result<R> {
        let transport = self.transport();
        op(&transport).map_err(|e| {
            self.observer.on_event(&MmcEvent::Log {
                level: LogLevel::Error,
                message: format!("{}: {}", operation, e),
            });
            anyhow::Error::new(e).context(format!("{} failed on {}", operation, self.device()))
        })
    }

    /// Download and install `image`. Options not given fall back to the
    /// session configuration.
    pub fn run_ffu(&self, image: &FirmwareImage, options: Option<FfuOptions>) -> Result<FfuReport> {
        let options = options.unwrap_or_else(|| self.config.ffu_options());
        info!(device = self.device(), mode = %options.mode, bytes = image.len(), "Starting FFU");
        self.execute("FFU", |t| ffu::run(t, image, &options, self.observer.as_ref()))
    }

    /// User-area write protection honouring `allow_dangerous`.
    pub fn set_user_write_protect(
        &self,
        kind: write_protect::UserWpType,
        start: u32,
        count: u32,
    ) -> Result<()> {
        self.execute("User write protection", |t| {
            write_protect::user_set(t, kind, start, count, self.config.allow_dangerous)
        })
    }

    /// Boot-area write protection honouring `allow_dangerous`.
    pub fn set_boot_write_protect(&self, partition: Option<u8>, permanent: bool) -> Result<()> {
        self.execute("Boot write protection", |t| {
            write_protect::boot_set(t, partition, permanent, self.config.allow_dangerous)
        })
    }

    /// Sanitize with the configured timeout unless one is given.
    pub fn sanitize(&self, timeout_ms: Option<u32>) -> Result<()> {
        let timeout_ms = timeout_ms.unwrap_or(self.config.sanitize_timeout_ms);
        self.execute("Sanitize", |t| erase::sanitize(t, timeout_ms))
    }
}

/// Load a firmware file for [`MmcSession::run_ffu`].
pub fn load_firmware<P: AsRef<Path>>(path: P) -> Result<FirmwareImage> {
    let path = path.as_ref();
    info!(path = %path.display(), "Loading firmware image");
    FirmwareImage::from_file(path).with_context(|| format!("Failed to load firmware {}", path.display()))
}

/// Transport wrapper that emits command events.
pub struct ObservableTransport<'a, T: MmcTransport, O: MmcObserver> {
    inner: &'a T,
    observer: &'a Arc<O>,
}

impl<T: MmcTransport, O: MmcObserver> MmcTransport for ObservableTransport<'_, T, O> {
    fn issue(&self, cmd: &mut CommandDescriptor) -> Result<CommandResponse, TransportError> {
        let (opcode, arg) = (cmd.opcode, cmd.arg);
        let res = self.inner.issue(cmd);
        self.observer.on_event(&MmcEvent::CommandIssued {
            opcode,
            arg,
            ok: res.is_ok(),
        });
        res
    }

    fn issue_batch(&self, batch: &mut CommandBatch) -> Result<Vec<CommandResponse>, TransportError> {
        let opcodes = batch.commands().iter().map(|c| c.opcode).collect();
        let res = self.inner.issue_batch(batch);
        self.observer.on_event(&MmcEvent::BatchIssued {
            opcodes,
            ok: res.is_ok(),
        });
        res
    }

    fn capacity_blocks(&self) -> Result<u64, TransportError> {
        self.inner.capacity_blocks()
    }

    fn device_name(&self) -> &str {
        self.inner.device_name()
    }
}
