use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use anyhow::{bail, Context, Result};
use tokio::{
    io::BufReader,
    net::{TcpListener, TcpStream},
};

use crate::protocol::{read_line, write_message, ErrorCode, Request, Response};

type Handler = Arc<dyn Fn(String) -> Result<String> + Send + Sync>;

/// Plugin-side RPC server. Register functions, then serve on the port the
/// host passed on the command line.
#[derive(Clone, Default)]
pub struct PluginServer {
    handlers: HashMap<String, Handler>,
}

impl PluginServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `name`, replacing any earlier registration.
    pub fn register<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(String) -> Result<String> + Send + Sync + 'static,
    {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    pub fn functions(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Reads the port from the process arguments and serves until the
    /// process is killed.
    pub async fn run_from_args(self) -> Result<()> {
        let port = port_from_args(std::env::args().skip(1))?;
        self.serve_port(port).await
    }

    /// Binds `0.0.0.0:<port>` and serves connections forever.
    pub async fn serve_port(self, port: u16) -> Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind plugin server on {addr}"))?;
        self.serve(listener).await
    }

    /// Accept loop over an already bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let handlers = Arc::new(self.handlers);
        tracing::info!(addr = ?listener.local_addr().ok(), "plugin server ready");
        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let handlers = handlers.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, &handlers).await {
                    tracing::warn!(error = %err, peer = %peer_addr, "connection closed with error");
                }
            });
        }
    }
}

fn port_from_args(mut args: impl Iterator<Item = String>) -> Result<u16> {
    let Some(raw) = args.next() else {
        bail!("usage: <plugin> <port>");
    };
    if args.next().is_some() {
        bail!("expected exactly one argument, the port number");
    }
    raw.trim()
        .parse::<u16>()
        .with_context(|| format!("invalid port argument `{raw}`"))
}

async fn handle_connection(stream: TcpStream, handlers: &HashMap<String, Handler>) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    while let Some(line) = read_line(&mut reader).await? {
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => dispatch(handlers, request),
            Err(err) => Response::err(0, ErrorCode::BadRequest, err.to_string()),
        };
        write_message(&mut write_half, &response).await?;
    }
    Ok(())
}

fn dispatch(handlers: &HashMap<String, Handler>, request: Request) -> Response {
    let Some(handler) = handlers.get(&request.function) else {
        return Response::err(
            request.id,
            ErrorCode::UnknownFunction,
            format!("no function `{}`", request.function),
        );
    };
    match handler(request.payload) {
        Ok(result) => Response::ok(request.id, result),
        Err(err) => Response::err(request.id, ErrorCode::HandlerFailed, format!("{err:#}")),
    }
}
