//! FFU transaction state.

use std::fmt;

/// Where the firmware update currently stands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FfuState {
    #[default]
    Idle,
    /// Revision, capability and image checks passed.
    Supported,
    /// MODE_CONFIG switched to FFU for the whole session.
    ModeEntered,
    /// Chunks going out, sectors polled after each.
    Downloading,
    /// Programmed count was zero; starting over from byte 0.
    RetryFromStart,
    ModeExited,
    InstallRequested,
    InstallChecked,
    /// Downloaded, device needs a reset to install.
    RebootRequired,
    Done,
    Aborted,
}

impl fmt::Display for FfuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FfuState::Idle => "IDLE",
            FfuState::Supported => "SUPPORTED",
            FfuState::ModeEntered => "MODE_ENTERED",
            FfuState::Downloading => "DOWNLOADING",
            FfuState::RetryFromStart => "RETRY_FROM_START",
            FfuState::ModeExited => "MODE_EXITED",
            FfuState::InstallRequested => "INSTALL_REQUESTED",
            FfuState::InstallChecked => "INSTALL_CHECKED",
            FfuState::RebootRequired => "REBOOT_REQUIRED",
            FfuState::Done => "DONE",
            FfuState::Aborted => "ABORTED",
        };
        f.write_str(name)
    }
}

impl FfuState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FfuState::RebootRequired | FfuState::Done | FfuState::Aborted)
    }
}

/// Restarts allowed after a zero programmed-sectors poll.
pub const MAX_RESTARTS: u32 = 3;

/// Runtime state of one FFU transaction.
#[derive(Debug, Default)]
pub struct FfuContext {
    pub state: FfuState,
    /// Full download passes started, including the first.
    pub passes: u32,
    pub restarts_left: u32,
    /// Last NUM_OF_FW_SEC_PROG value read.
    pub sectors_programmed: u32,
}

impl FfuContext {
    pub fn new() -> Self {
        Self {
            restarts_left: MAX_RESTARTS,
            ..Self::default()
        }
    }

    /// Transition to a new state.
    pub fn goto_state(&mut self, new_state: FfuState) {
        tracing::info!(from = %self.state, to = %new_state, "State transition");
        self.state = new_state;
    }

    /// Consume one restart if any remain.
    pub fn take_restart(&mut self) -> bool {
        if self.restarts_left == 0 {
            return false;
        }
        self.restarts_left -= 1;
        true
    }
}
