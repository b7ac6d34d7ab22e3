//! Spawn, connect and invoke lifecycle for a single plugin record.
//!
//! Every wait is bounded by [`RuntimeConfig`]. `start` does not return until
//! the child accepts TCP connections, exits, or the readiness window closes,
//! so callers never have to guess whether the process came up. Failures are
//! returned to the caller tagged with their phase; nothing is retried.

use std::{io, time::Duration};

use tokio::{
    net::TcpStream,
    time::{sleep_until, timeout, timeout_at, Instant},
};
use warden_plugin_sdk::ErrorCode;

use crate::{
    client::RpcClient,
    config::RuntimeConfig,
    error::{Phase, PluginError, Result},
    plugin::{Plugin, PluginState},
    process::ChildProcess,
};

/// How long to wait for the exit report of a child whose socket just failed.
const EXIT_GRACE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Default)]
pub struct Runtime {
    config: RuntimeConfig,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Spawns the plugin executable and waits until it accepts connections.
    pub async fn start(&self, plugin: &mut Plugin) -> Result<()> {
        let name = plugin.name().to_string();
        match plugin.state() {
            PluginState::Unstarted => {}
            PluginState::Failed => return Err(PluginError::Failed { name }),
            _ => return Err(PluginError::AlreadyStarted { name }),
        }

        tracing::info!(
            plugin = %name,
            port = plugin.port(),
            executable = %plugin.executable().display(),
            "spawning plugin"
        );
        let process = match ChildProcess::spawn(plugin.executable(), plugin.port()) {
            Ok(process) => process,
            Err(source) => {
                plugin.fail();
                metrics::counter!("warden_spawns_total", "outcome" => "spawn_error").increment(1);
                return Err(PluginError::Spawn {
                    name,
                    path: plugin.executable().to_path_buf(),
                    source,
                });
            }
        };
        plugin.set_started(process);

        if let Err(err) = self.wait_ready(plugin).await {
            tracing::warn!(plugin = %name, error = %err, "plugin failed to become ready");
            plugin.fail();
            metrics::counter!("warden_spawns_total", "outcome" => "not_ready").increment(1);
            return Err(err);
        }
        tracing::info!(plugin = %name, pid = ?plugin.pid(), "plugin ready");
        metrics::counter!("warden_spawns_total", "outcome" => "ready").increment(1);
        Ok(())
    }

    async fn wait_ready(&self, plugin: &mut Plugin) -> Result<()> {
        let name = plugin.name().to_string();
        let addr = plugin.addr();
        let ready_timeout = self.config.ready_timeout();
        let interval = self.config.probe_interval();
        let deadline = Instant::now() + ready_timeout;
        let Some(process) = plugin.process_mut() else {
            return Ok(());
        };

        loop {
            if let Some(report) = process.try_exit() {
                return Err(PluginError::Exited {
                    name,
                    phase: Phase::Spawn,
                    message: report.message(),
                });
            }
            match timeout_at(deadline, TcpStream::connect(&addr)).await {
                Ok(Ok(_probe)) => return Ok(()),
                Ok(Err(err)) => tracing::trace!(plugin = %name, error = %err, "readiness probe refused"),
                Err(_) => break,
            }
            let next_probe = (Instant::now() + interval).min(deadline);
            tokio::select! {
                report = process.wait_exit() => {
                    return Err(PluginError::Exited {
                        name,
                        phase: Phase::Spawn,
                        message: report.message(),
                    });
                }
                _ = sleep_until(next_probe) => {}
            }
            if Instant::now() >= deadline {
                break;
            }
        }

        Err(PluginError::NotReady {
            name,
            addr,
            timeout: ready_timeout,
        })
    }

    /// Opens the RPC connection to a started plugin.
    pub async fn dial(&self, plugin: &mut Plugin) -> Result<()> {
        let name = plugin.name().to_string();
        match plugin.state() {
            PluginState::Failed => return Err(PluginError::Failed { name }),
            PluginState::Unstarted => return Err(PluginError::NotStarted { name }),
            PluginState::Connected | PluginState::Invoking => return Ok(()),
            PluginState::Started => {}
        }

        let addr = plugin.addr();
        let connect = timeout(self.config.connect_timeout(), RpcClient::connect(&addr)).await;
        let source = match connect {
            Ok(Ok(client)) => {
                tracing::debug!(plugin = %name, %addr, "connected to plugin");
                plugin.set_connected(client);
                return Ok(());
            }
            Ok(Err(err)) => err,
            Err(_) => io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect timed out after {:?}", self.config.connect_timeout()),
            ),
        };

        let err = match exit_error(plugin, Phase::Dial).await {
            Some(exited) => exited,
            None => PluginError::Connect { name, addr, source },
        };
        plugin.fail();
        Err(err)
    }

    /// Sends one request and waits for the reply, bounded by the call timeout.
    ///
    /// A missing function or a handler error leaves the connection usable.
    /// Any transport failure or timeout marks the record failed.
    pub async fn call(&self, plugin: &mut Plugin, function: &str, payload: &str) -> Result<String> {
        let name = plugin.name().to_string();
        match plugin.state() {
            PluginState::Failed => return Err(PluginError::Failed { name }),
            PluginState::Invoking => {
                // The previous call was dropped mid-flight; its reply may
                // still be in the socket.
                plugin.fail();
                return Err(PluginError::Failed { name });
            }
            _ => {}
        }

        let call_timeout = self.config.call_timeout();
        let Some(client) = plugin.begin_call() else {
            return Err(PluginError::NotConnected { name });
        };
        let outcome = timeout(call_timeout, client.call(function, payload)).await;

        match outcome {
            Ok(Ok(Ok(result))) => {
                plugin.finish_call();
                metrics::counter!("warden_calls_total", "outcome" => "ok").increment(1);
                Ok(result)
            }
            Ok(Ok(Err(rpc))) => {
                plugin.finish_call();
                metrics::counter!("warden_calls_total", "outcome" => "rpc_error").increment(1);
                let function = function.to_string();
                Err(match rpc.code {
                    ErrorCode::UnknownFunction => PluginError::UnknownFunction { name, function },
                    ErrorCode::HandlerFailed | ErrorCode::BadRequest => PluginError::Remote {
                        name,
                        function,
                        message: rpc.message,
                    },
                })
            }
            Ok(Err(source)) => {
                metrics::counter!("warden_calls_total", "outcome" => "transport_error").increment(1);
                let err = match exit_error(plugin, Phase::Call).await {
                    Some(exited) => exited,
                    None => PluginError::Transport {
                        name,
                        function: function.to_string(),
                        source,
                    },
                };
                tracing::warn!(error = %err, "plugin call failed");
                plugin.fail();
                Err(err)
            }
            Err(_) => {
                metrics::counter!("warden_calls_total", "outcome" => "timeout").increment(1);
                let err = match exit_error(plugin, Phase::Call).await {
                    Some(exited) => exited,
                    None => PluginError::CallTimeout {
                        name,
                        function: function.to_string(),
                        timeout: call_timeout,
                    },
                };
                tracing::warn!(error = %err, "plugin call failed");
                plugin.fail();
                Err(err)
            }
        }
    }

    /// `start`, `dial`, then `call`; the first failure is returned as is.
    pub async fn invoke(&self, plugin: &mut Plugin, function: &str, payload: &str) -> Result<String> {
        self.start(plugin).await?;
        self.dial(plugin).await?;
        self.call(plugin, function, payload).await
    }
}

/// If the child has exited (or does so shortly), the exit report explains the
/// failure better than the socket error does.
async fn exit_error(plugin: &mut Plugin, phase: Phase) -> Option<PluginError> {
    let name = plugin.name().to_string();
    let process = plugin.process_mut()?;
    let report = match process.try_exit().cloned() {
        Some(report) => report,
        None => timeout(EXIT_GRACE, process.wait_exit()).await.ok()?.clone(),
    };
    Some(PluginError::Exited {
        name,
        phase,
        message: report.message(),
    })
}
