//! Field firmware update.
//!
//! The download loop is the same for every [`FfuMode`]; the mode only
//! decides how each chunk is wrapped in commands and whether MODE_CONFIG is
//! switched per chunk or once per session.
//!
//! After every chunk NUM_OF_FW_SEC_PROG is polled. A zero count means the
//! device discarded the download, which restarts from the first byte up to
//! [`MAX_RESTARTS`] times.

pub mod machine;
pub mod mode;

use tracing::{info, instrument, warn};

pub use machine::{FfuContext, FfuState, MAX_RESTARTS};
pub use mode::{FfuMode, Transfer, enter_mode, exit_mode};

use crate::error::{MmcError, Result};
use crate::events::{FfuPhase, MmcEvent, MmcObserver};
use crate::payload::{ChunkState, FirmwareImage};
use crate::protocol::{CommandBatch, CommandDescriptor};
use crate::protocol::constants::*;
use crate::register::fields::*;
use crate::register::{ExtCsd, Revision};
use crate::transport::MmcTransport;

/// Download parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FfuOptions {
    pub mode: FfuMode,
    /// Bytes per chunk; ignored by the single-block modes.
    pub chunk_size: usize,
}

impl Default for FfuOptions {
    fn default() -> Self {
        Self {
            mode: FfuMode::Default,
            chunk_size: MMC_IOC_MAX_BYTES,
        }
    }
}

/// How the update finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfuOutcome {
    /// FFU_STATUS reported success after the install request.
    Installed,
    /// The device has no MODE_OPERATION_CODES support; a CMD0, hardware
    /// reset or power cycle completes the installation.
    RebootRequired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FfuReport {
    pub mode: FfuMode,
    pub passes: u32,
    pub sectors_programmed: u32,
    pub outcome: FfuOutcome,
}

/// Chunk sizes accepted from the caller.
pub fn validate_chunk_size(size: usize) -> Result<usize> {
    if size == 0 || size > MMC_IOC_MAX_BYTES || size % MMC_BLOCK_SIZE != 0 {
        return Err(MmcError::precondition(format!(
            "Invalid chunk size {}: must be a non-zero multiple of {} no larger than {}",
            size, MMC_BLOCK_SIZE, MMC_IOC_MAX_BYTES
        )));
    }
    Ok(size)
}

/// Revision, capability and update-disable gate.
pub fn check_support(csd: &ExtCsd) -> Result<()> {
    csd.require_revision(Revision::V5_0, "FFU")?;
    if csd.supported_modes() & EXT_CSD_FFU == 0 {
        return Err(MmcError::unsupported("FFU", "SUPPORTED_MODES does not advertise FFU"));
    }
    if csd.fw_config() & EXT_CSD_UPDATE_DISABLE != 0 {
        return Err(MmcError::unsupported("FFU", "firmware update was disabled"));
    }
    Ok(())
}

/// Emits phase changes once per actual transition.
struct PhaseTracker<'a> {
    observer: &'a dyn MmcObserver,
    phase: FfuPhase,
}

impl PhaseTracker<'_> {
    fn enter(&mut self, to: FfuPhase) {
        if self.phase != to {
            self.observer.on_event(&MmcEvent::PhaseChanged { from: self.phase, to });
            self.phase = to;
        }
    }
}

/// Download `image` and install it.
#[instrument(skip_all, fields(device = transport.device_name(), mode = %options.mode, size = image.len()))]
pub fn run<T: MmcTransport + ?Sized>(
    transport: &T,
    image: &FirmwareImage,
    options: &FfuOptions,
    observer: &dyn MmcObserver,
) -> Result<FfuReport> {
    let mut ctx = FfuContext::new();
    let mut phases = PhaseTracker {
        observer,
        phase: FfuPhase::Validate,
    };

    let result = run_inner(transport, image, options, &mut ctx, &mut phases);
    match &result {
        Ok(report) => {
            phases.enter(FfuPhase::Complete);
            observer.on_event(&MmcEvent::Complete);
            info!(passes = report.passes, outcome = ?report.outcome, "FFU finished");
        }
        Err(e) => {
            ctx.goto_state(FfuState::Aborted);
            phases.enter(FfuPhase::Error);
            warn!(error = %e, "FFU aborted");
        }
    }
    result
}

fn run_inner<T: MmcTransport + ?Sized>(
    transport: &T,
    image: &FirmwareImage,
    options: &FfuOptions,
    ctx: &mut FfuContext,
    phases: &mut PhaseTracker<'_>,
) -> Result<FfuReport> {
    let chunk_size = validate_chunk_size(options.chunk_size)?;
    let csd = ExtCsd::read(transport)?;
    check_support(&csd)?;
    image
        .check_alignment(csd.data_sector_bytes())
        .map_err(|e| MmcError::precondition(e.to_string()))?;
    ctx.goto_state(FfuState::Supported);

    let csd = download(transport, image, options.mode, chunk_size, csd.ffu_arg(), ctx, phases)?;

    let outcome = if csd.ffu_features() == 0 {
        ctx.goto_state(FfuState::RebootRequired);
        warn!("Please reboot to complete firmware installation");
        FfuOutcome::RebootRequired
    } else {
        phases.enter(FfuPhase::Install);
        install(transport, ctx)?;
        ctx.goto_state(FfuState::Done);
        FfuOutcome::Installed
    };

    Ok(FfuReport {
        mode: options.mode,
        passes: ctx.passes,
        sectors_programmed: ctx.sectors_programmed,
        outcome,
    })
}

/// Leave FFU mode, reporting but otherwise ignoring failure.
fn exit_best_effort<T: MmcTransport + ?Sized>(transport: &T) {
    if let Err(e) = transport.issue(&mut exit_mode()) {
        warn!(error = %e, "Exit FFU mode failed");
    }
}

fn switch_mode<T: MmcTransport + ?Sized>(transport: &T, mut cmd: CommandDescriptor) -> Result<()> {
    let (index, value) = cmd.switch_target().unwrap_or_default();
    transport
        .issue(&mut cmd)
        .map_err(|source| MmcError::SwitchFailed { index, value, source })?;
    Ok(())
}

/// Send every chunk, restarting on a zero programmed count. Returns the
/// EXT_CSD read after the last pass.
fn download<T: MmcTransport + ?Sized>(
    transport: &T,
    image: &FirmwareImage,
    mode: FfuMode,
    chunk_size: usize,
    arg: u32,
    ctx: &mut FfuContext,
    phases: &mut PhaseTracker<'_>,
) -> Result<ExtCsd> {
    let data = image.raw_data();
    let total = data.len() as u64;
    let mut chunks = ChunkState::new(data.len(), mode.effective_chunk_size(chunk_size));

    'pass: loop {
        ctx.passes += 1;
        chunks.reset();
        phases.enter(FfuPhase::Download);
        if mode.session_scoped() {
            switch_mode(transport, enter_mode())?;
            ctx.goto_state(FfuState::ModeEntered);
        }
        ctx.goto_state(FfuState::Downloading);

        while let Some(chunk) = chunks.next_chunk(data) {
            if let Err(source) = mode.transfer(chunk, arg).issue(transport) {
                exit_best_effort(transport);
                return Err(source.into());
            }

            let sectors = match ExtCsd::read(transport) {
                Ok(csd) => csd.fw_sectors_programmed(),
                Err(e) => {
                    exit_best_effort(transport);
                    return Err(e);
                }
            };
            ctx.sectors_programmed = sectors;

            if sectors == 0 {
                exit_best_effort(transport);
                if ctx.take_restart() {
                    warn!(restarts_left = ctx.restarts_left, "Programming failed. Retrying...");
                    ctx.goto_state(FfuState::RetryFromStart);
                    phases.enter(FfuPhase::Retry);
                    continue 'pass;
                }
                return Err(MmcError::rejected(
                    "FFU download",
                    format!("no sectors programmed after {} passes", ctx.passes),
                ));
            }

            phases.observer.on_event(&MmcEvent::Progress {
                phase: FfuPhase::Download,
                current: sectors as u64 * MMC_BLOCK_SIZE as u64,
                total,
            });
        }
        break;
    }

    if mode.session_scoped() {
        switch_mode(transport, exit_mode())?;
        ctx.goto_state(FfuState::ModeExited);
    }

    let csd = ExtCsd::read(transport)?;
    ctx.sectors_programmed = csd.fw_sectors_programmed();
    let programmed = ctx.sectors_programmed as u64 * MMC_BLOCK_SIZE as u64;
    if programmed != total {
        return Err(MmcError::rejected(
            "FFU download",
            format!("FW size {} and bytes {} programmed mismatch", total, programmed),
        ));
    }
    info!(bytes = total, "Programmed {}/{} bytes", programmed, total);
    Ok(csd)
}

/// Re-enter FFU mode and request installation, then check FFU_STATUS.
fn install<T: MmcTransport + ?Sized>(transport: &T, ctx: &mut FfuContext) -> Result<()> {
    info!("Installing firmware");
    let mut batch = CommandBatch::new(vec![
        enter_mode(),
        CommandDescriptor::switch(EXT_CSD_MODE_OPERATION_CODES as u8, EXT_CSD_FFU_INSTALL),
    ]);
    if let Err(source) = transport.issue_batch(&mut batch) {
        exit_best_effort(transport);
        return Err(source.into());
    }
    ctx.goto_state(FfuState::InstallRequested);

    let status = ExtCsd::read(transport)?.ffu_status();
    ctx.goto_state(FfuState::InstallChecked);
    if status != 0 {
        return Err(MmcError::rejected(
            "FFU install",
            format!("FFU_STATUS 0x{:02x}", status),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{NullObserver, RecordingObserver};
    use crate::transport::MockTransport;

    const MODE_CONFIG: u8 = EXT_CSD_MODE_CONFIG as u8;

    fn image(len: usize) -> FirmwareImage {
        FirmwareImage::from_bytes((0..len).map(|i| i as u8).collect()).unwrap()
    }

    fn options(mode: FfuMode, chunk_size: usize) -> FfuOptions {
        FfuOptions { mode, chunk_size }
    }

    #[test]
    fn test_default_mode_installs() {
        let mock = MockTransport::new();
        let report = run(&mock, &image(12 * 1024), &options(FfuMode::Default, 4096), &NullObserver).unwrap();

        assert_eq!(report.outcome, FfuOutcome::Installed);
        assert_eq!(report.passes, 1);
        assert_eq!(report.sectors_programmed, 24);
        assert_eq!(mock.batch_sizes(), vec![4, 4, 4, 2]);

        let writes = mock.switch_writes();
        assert_eq!(&writes[writes.len() - 2..], &[(MODE_CONFIG, 1), (EXT_CSD_MODE_OPERATION_CODES as u8, 1)]);
        let data_cmd = mock
            .command_log()
            .into_iter()
            .find(|c| c.opcode == MMC_WRITE_MULTIPLE_BLOCK)
            .unwrap();
        assert_eq!(data_cmd.arg, 0xC0DE_0000);
        assert_eq!(data_cmd.blocks, 8);
    }

    #[test]
    fn test_zero_progress_restarts_from_start() {
        let mock = MockTransport::new();
        mock.zero_progress_polls(2);
        let recorder = RecordingObserver::default();
        let report = run(&mock, &image(8 * 1024), &options(FfuMode::Default, 4096), &recorder).unwrap();

        assert_eq!(report.passes, 3);
        assert_eq!(report.outcome, FfuOutcome::Installed);
        let retries = recorder
            .events()
            .iter()
            .filter(|e| matches!(e, MmcEvent::PhaseChanged { to: FfuPhase::Retry, .. }))
            .count();
        assert_eq!(retries, 2);
    }

    #[test]
    fn test_restarts_are_bounded() {
        let mock = MockTransport::new();
        mock.zero_progress_polls(100);
        let err = run(&mock, &image(4096), &options(FfuMode::Opt1, 4096), &NullObserver).unwrap_err();

        assert!(matches!(err, MmcError::DeviceRejected { .. }));
        assert!(err.to_string().contains("after 4 passes"));
        assert_eq!(mock.switch_writes().last(), Some(&(MODE_CONFIG, 0)));
        assert!(
            !mock
                .switch_writes()
                .contains(&(EXT_CSD_MODE_OPERATION_CODES as u8, EXT_CSD_FFU_INSTALL))
        );
    }

    #[test]
    fn test_misaligned_image_issues_no_mutation() {
        let mock = MockTransport::new();
        mock.set_ext_csd_byte(EXT_CSD_DATA_SECTOR_SIZE, 1);
        let err = run(&mock, &image(512 * 3), &FfuOptions::default(), &NullObserver).unwrap_err();

        assert!(matches!(err, MmcError::Precondition(_)));
        assert!(mock.mutating_commands().is_empty());
        assert_eq!(mock.command_log().len(), 1);
    }

    #[test]
    fn test_support_gate() {
        let mock = MockTransport::new();
        mock.set_ext_csd_byte(EXT_CSD_FW_CONFIG, EXT_CSD_UPDATE_DISABLE);
        assert!(matches!(
            run(&mock, &image(512), &FfuOptions::default(), &NullObserver),
            Err(MmcError::Unsupported { .. })
        ));

        let mock = MockTransport::new();
        mock.set_ext_csd_byte(EXT_CSD_REV, EXT_CSD_REV_V4_5);
        assert!(run(&mock, &image(512), &FfuOptions::default(), &NullObserver).is_err());
        assert!(mock.mutating_commands().is_empty());
    }

    #[test]
    fn test_invalid_chunk_size_touches_nothing() {
        let mock = MockTransport::new();
        for size in [0, 1000, MMC_IOC_MAX_BYTES + 512] {
            assert!(run(&mock, &image(4096), &options(FfuMode::Default, size), &NullObserver).is_err());
        }
        assert!(mock.command_log().is_empty());
    }

    #[test]
    fn test_session_scoped_mode_switches_once() {
        let mock = MockTransport::new();
        run(&mock, &image(4 * 1024), &options(FfuMode::Opt1, 1024), &NullObserver).unwrap();

        assert_eq!(mock.batch_sizes(), vec![2, 2, 2, 2, 2]);
        assert_eq!(
            mock.switch_writes(),
            vec![
                (MODE_CONFIG, 1),
                (MODE_CONFIG, 0),
                (MODE_CONFIG, 1),
                (EXT_CSD_MODE_OPERATION_CODES as u8, 1)
            ]
        );
    }

    #[test]
    fn test_single_block_mode_ignores_chunk_size() {
        let mock = MockTransport::new();
        let report = run(&mock, &image(1024), &options(FfuMode::Opt4, 4096), &NullObserver).unwrap();
        assert_eq!(report.sectors_programmed, 2);

        let writes: Vec<_> = mock
            .command_log()
            .into_iter()
            .filter(|c| c.opcode == MMC_WRITE_BLOCK)
            .collect();
        assert_eq!(writes.len(), 2);
        assert!(writes.iter().all(|c| c.blocks == 1 && c.data.len() == 512));
        assert_eq!(mock.batch_sizes(), vec![2]);
    }

    #[test]
    fn test_open_ended_mode() {
        let mock = MockTransport::new();
        run(&mock, &image(2048), &options(FfuMode::Opt2, 1024), &NullObserver).unwrap();
        let stops = mock
            .command_log()
            .iter()
            .filter(|c| c.opcode == MMC_STOP_TRANSMISSION)
            .count();
        assert_eq!(stops, 2);
    }

    #[test]
    fn test_install_failure_status() {
        let mock = MockTransport::new();
        mock.set_install_status(0x10);
        let err = run(&mock, &image(512), &FfuOptions::default(), &NullObserver).unwrap_err();
        assert!(matches!(err, MmcError::DeviceRejected { operation: "FFU install", .. }));
    }

    #[test]
    fn test_no_install_feature_requires_reboot() {
        let mock = MockTransport::new();
        mock.set_ext_csd_byte(EXT_CSD_FFU_FEATURES, 0);
        let report = run(&mock, &image(512), &FfuOptions::default(), &NullObserver).unwrap();
        assert_eq!(report.outcome, FfuOutcome::RebootRequired);
        assert!(
            !mock
                .switch_writes()
                .iter()
                .any(|&(index, _)| index as usize == EXT_CSD_MODE_OPERATION_CODES)
        );
    }

    #[test]
    fn test_transport_error_attempts_mode_exit() {
        let mock = MockTransport::new();
        mock.fail_opcode(MMC_WRITE_MULTIPLE_BLOCK);
        let err = run(&mock, &image(4096), &FfuOptions::default(), &NullObserver).unwrap_err();

        assert!(matches!(err, MmcError::Transport(_)));
        assert_eq!(mock.command_log().last().and_then(|c| c.switch_target()), Some((MODE_CONFIG, 0)));
    }

    #[test]
    fn test_progress_events() {
        let mock = MockTransport::new();
        let recorder = RecordingObserver::default();
        run(&mock, &image(2048), &options(FfuMode::Default, 1024), &recorder).unwrap();

        let progress: Vec<_> = recorder
            .events()
            .into_iter()
            .filter_map(|e| match e {
                MmcEvent::Progress { current, total, .. } => Some((current, total)),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![(1024, 2048), (2048, 2048)]);
        assert!(matches!(recorder.events().last(), Some(MmcEvent::Complete)));
    }
}
