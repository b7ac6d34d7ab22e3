use std::{
    fmt,
    path::{Path, PathBuf},
};

use serde_json::{Map, Value};

use crate::{client::RpcClient, process::ChildProcess};

/// Lifecycle of a plugin record. `Failed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    Unstarted,
    Started,
    Connected,
    Invoking,
    Failed,
}

/// One discovered plugin executable and its connection state.
///
/// The address is fixed when the record is created. The record exclusively
/// owns the child process and the RPC connection; dropping it kills the child.
#[derive(Debug)]
pub struct Plugin {
    name: String,
    executable: PathBuf,
    host: String,
    port: u16,
    /// Caller bookkeeping; never read by the runtime.
    pub metadata: Map<String, Value>,
    state: PluginState,
    connection: Option<RpcClient>,
    process: Option<ChildProcess>,
}

impl Plugin {
    pub fn new(
        name: impl Into<String>,
        executable: impl Into<PathBuf>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            name: name.into(),
            executable: executable.into(),
            host: host.into(),
            port,
            metadata: Map::new(),
            state: PluginState::Unstarted,
            connection: None,
            process: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` as dialed by the runtime.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn state(&self) -> PluginState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(ChildProcess::pid)
    }

    /// Diagnostic view of the record. Not a stable format.
    pub fn describe(&self) -> Value {
        serde_json::json!({
            "Host": self.host,
            "Name": self.name,
            "PluginFile": self.executable.display().to_string(),
            "Port": self.port.to_string(),
        })
    }

    pub(crate) fn set_started(&mut self, process: ChildProcess) {
        self.process = Some(process);
        self.state = PluginState::Started;
    }

    pub(crate) fn set_connected(&mut self, client: RpcClient) {
        self.connection = Some(client);
        self.state = PluginState::Connected;
    }

    /// Returns an `Invoking` record to `Connected` once its reply arrived.
    pub(crate) fn finish_call(&mut self) {
        debug_assert_eq!(self.state, PluginState::Invoking);
        self.state = PluginState::Connected;
    }

    /// Moves a connected record to `Invoking` and lends out its connection.
    pub(crate) fn begin_call(&mut self) -> Option<&mut RpcClient> {
        let client = self.connection.as_mut()?;
        self.state = PluginState::Invoking;
        Some(client)
    }

    /// Marks the record failed and drops its connection. The process, if
    /// any, is kept so its exit report can still be read.
    pub(crate) fn fail(&mut self) {
        self.connection = None;
        self.state = PluginState::Failed;
    }

    pub(crate) fn process_mut(&mut self) -> Option<&mut ChildProcess> {
        self.process.as_mut()
    }

    /// Started without a child, for tests serving the plugin in-process.
    #[cfg(test)]
    pub(crate) fn mark_started(&mut self) {
        self.state = PluginState::Started;
    }
}

impl fmt::Display for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.describe())
    }
}
