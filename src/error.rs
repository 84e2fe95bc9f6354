use std::io;

use thiserror::Error;

/// Failures that end the control loop early.
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("cannot query terminal size: {0}")]
    SizeQuery(#[source] io::Error),

    #[error("window too small ({width}x{height})")]
    WindowTooSmall { width: u16, height: u16 },

    #[error("terminal I/O failed: {0}")]
    Terminal(#[from] io::Error),

    #[error("trace ingestion stopped on an error")]
    IngestionFailed,
}

impl ControlError {
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            ControlError::SizeQuery(_) => ExitStatus::ResizeFailed,
            ControlError::WindowTooSmall { .. } => ExitStatus::WindowTooSmall,
            ControlError::Terminal(_) | ControlError::IngestionFailed => ExitStatus::Fault,
        }
    }
}

/// Process exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    /// Fatal error before the terminal was taken over.
    Startup,
    /// Panic or terminal failure while running.
    Fault,
    ResizeFailed,
    WindowTooSmall,
}

impl ExitStatus {
    pub const fn code(self) -> u8 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::Startup => 1,
            ExitStatus::Fault => 2,
            ExitStatus::ResizeFailed => 3,
            ExitStatus::WindowTooSmall => 4,
        }
    }
}

impl From<ExitStatus> for std::process::ExitCode {
    fn from(status: ExitStatus) -> Self {
        std::process::ExitCode::from(status.code())
    }
}
