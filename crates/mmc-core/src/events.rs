//! Event system for UI decoupling.
//!
//! Front ends subscribe to command traffic and FFU progress without the
//! transactions knowing who is listening.

use std::fmt;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Firmware update phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfuPhase {
    /// Checking revision, capability and image geometry.
    Validate,
    /// Sending firmware chunks.
    Download,
    /// Download restarted from the first byte.
    Retry,
    /// Requesting installation.
    Install,
    /// Finished; a power cycle may still be needed.
    Complete,
    /// Aborted.
    Error,
}

impl fmt::Display for FfuPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FfuPhase::Validate => write!(f, "Validate"),
            FfuPhase::Download => write!(f, "Download"),
            FfuPhase::Retry => write!(f, "Retry"),
            FfuPhase::Install => write!(f, "Install"),
            FfuPhase::Complete => write!(f, "Complete"),
            FfuPhase::Error => write!(f, "Error"),
        }
    }
}

/// Events emitted while talking to a device.
#[derive(Debug, Clone)]
pub enum MmcEvent {
    /// One command went out through `issue`.
    CommandIssued { opcode: u8, arg: u32, ok: bool },
    /// One atomic batch went out.
    BatchIssued { opcodes: Vec<u8>, ok: bool },
    /// FFU phase changed.
    PhaseChanged { from: FfuPhase, to: FfuPhase },
    /// Progress of the current FFU pass in bytes.
    Progress { phase: FfuPhase, current: u64, total: u64 },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// Transaction finished successfully.
    Complete,
}

/// Observer trait for receiving device events.
pub trait MmcObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &MmcEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl MmcObserver for NullObserver {
    fn on_event(&self, _event: &MmcEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl MmcObserver for TracingObserver {
    fn on_event(&self, event: &MmcEvent) {
        match event {
            MmcEvent::CommandIssued { opcode, arg, ok } => {
                tracing::trace!(opcode, arg = %format!("0x{:08X}", arg), ok, "Command");
            }
            MmcEvent::BatchIssued { opcodes, ok } => {
                tracing::trace!(?opcodes, ok, "Batch");
            }
            MmcEvent::PhaseChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Phase changed");
            }
            MmcEvent::Progress { phase, current, total } => {
                let pct = if *total > 0 { (*current * 100) / *total } else { 0 };
                tracing::debug!(phase = %phase, progress = %format!("{}%", pct), "Programmed {}/{} bytes", current, total);
            }
            MmcEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            MmcEvent::Complete => {
                tracing::info!("Operation complete");
            }
        }
    }
}

/// Records every event for assertions.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingObserver {
    pub events: std::sync::Mutex<Vec<MmcEvent>>,
}

#[cfg(test)]
impl RecordingObserver {
    pub fn events(&self) -> Vec<MmcEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl MmcObserver for RecordingObserver {
    fn on_event(&self, event: &MmcEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observers_accept_every_event() {
        let recorder = RecordingObserver::default();
        let events = [
            MmcEvent::CommandIssued { opcode: 6, arg: 0, ok: true },
            MmcEvent::PhaseChanged {
                from: FfuPhase::Validate,
                to: FfuPhase::Download,
            },
            MmcEvent::Progress {
                phase: FfuPhase::Download,
                current: 0,
                total: 0,
            },
            MmcEvent::Complete,
        ];
        for event in &events {
            NullObserver.on_event(event);
            TracingObserver.on_event(event);
            recorder.on_event(event);
        }
        assert_eq!(recorder.events().len(), 4);
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(FfuPhase::Install.to_string(), "Install");
    }
}
