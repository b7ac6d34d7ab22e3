use std::{fmt, io, path::PathBuf, time::Duration};

use thiserror::Error;

/// Lifecycle phase an error was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Load,
    Spawn,
    Dial,
    Call,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Load => "load",
            Phase::Spawn => "spawn",
            Phase::Dial => "dial",
            Phase::Call => "call",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("no free port available for plugin `{name}`")]
    Allocation {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to read plugin directory {}", .path.display())]
    Discovery {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("plugin `{name}` failed to spawn {}", .path.display())]
    Spawn {
        name: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The child exited. `message` is its stderr when it wrote any, else the
    /// exit status.
    #[error("plugin `{name}` exited during {phase}: {message}")]
    Exited {
        name: String,
        phase: Phase,
        message: String,
    },

    #[error("plugin `{name}` did not accept connections on {addr} within {timeout:?}")]
    NotReady {
        name: String,
        addr: String,
        timeout: Duration,
    },

    #[error("failed to connect to plugin `{name}` at {addr}")]
    Connect {
        name: String,
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("plugin `{name}` has not been started")]
    NotStarted { name: String },

    #[error("plugin `{name}` is not connected")]
    NotConnected { name: String },

    #[error("plugin `{name}` has no function `{function}`")]
    UnknownFunction { name: String, function: String },

    #[error("plugin `{name}` function `{function}` failed: {message}")]
    Remote {
        name: String,
        function: String,
        message: String,
    },

    #[error("call to `{function}` on plugin `{name}` timed out after {timeout:?}")]
    CallTimeout {
        name: String,
        function: String,
        timeout: Duration,
    },

    #[error("transport error calling `{function}` on plugin `{name}`")]
    Transport {
        name: String,
        function: String,
        #[source]
        source: io::Error,
    },

    #[error("plugin `{name}` is in a failed state; reload it to retry")]
    Failed { name: String },

    #[error("plugin `{name}` has already been started")]
    AlreadyStarted { name: String },
}

impl PluginError {
    pub fn phase(&self) -> Phase {
        match self {
            PluginError::Allocation { .. } | PluginError::Discovery { .. } => Phase::Load,
            PluginError::Spawn { .. }
            | PluginError::NotReady { .. }
            | PluginError::AlreadyStarted { .. } => Phase::Spawn,
            PluginError::Exited { phase, .. } => *phase,
            PluginError::Connect { .. } | PluginError::NotStarted { .. } => Phase::Dial,
            PluginError::NotConnected { .. }
            | PluginError::UnknownFunction { .. }
            | PluginError::Remote { .. }
            | PluginError::CallTimeout { .. }
            | PluginError::Transport { .. }
            | PluginError::Failed { .. } => Phase::Call,
        }
    }
}

pub type Result<T, E = PluginError> = std::result::Result<T, E>;
