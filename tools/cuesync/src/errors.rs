use thiserror::Error;

#[derive(Debug, Error)]
pub enum CuesyncError {
    #[error("io error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    ConfigParse(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("cli error: {0}")]
    Cli(String),
    #[error("marker store error: {0}")]
    Database(String),
    #[error("supervisor: failed to launch `{command}`: {reason}")]
    ProcessLaunch { command: String, reason: String },
    #[error("supervisor: `{command}` exited during startup grace period (exit code {code:?}): {output}")]
    ProcessEarlyExit {
        command: String,
        code: Option<i32>,
        output: String,
    },
    #[error("supervisor: `{command}` did not exit within {timeout_secs:.1}s of stop request")]
    ProcessShutdownTimeout { command: String, timeout_secs: f64 },
    #[error("supervisor: `{command}` matched no stream: {detail}")]
    NoMatchingStream { command: String, detail: String },
    #[error("supervisor: process error: {0}")]
    Process(String),
    #[error("capture error: {0}")]
    Capture(String),
    #[error("stimulus sink error: {0}")]
    StimulusSink(String),
    #[error("malformed marker label: {0:?}")]
    MalformedMarkerLabel(String),
    #[error("session interrupted: {0}")]
    Interrupted(String),
}

impl CuesyncError {
    /// Short tag naming the component that produced the error.
    pub fn component(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::ConfigParse(_) | Self::InvalidConfig(_) => "config",
            Self::Cli(_) => "cli",
            Self::Database(_) => "marker_store",
            Self::ProcessLaunch { .. }
            | Self::ProcessEarlyExit { .. }
            | Self::ProcessShutdownTimeout { .. }
            | Self::NoMatchingStream { .. }
            | Self::Process(_) => "supervisor",
            Self::Capture(_) => "frame_logger",
            Self::StimulusSink(_) => "stimulus_sink",
            Self::MalformedMarkerLabel(_) => "marker_channel",
            Self::Interrupted(_) => "session",
        }
    }
}
