use tokio::net::TcpListener;
use warden_plugin_sdk::PluginServer;

/// Writes an executable `/bin/sh` script into `dir`.
#[cfg(unix)]
pub(crate) fn script(dir: &std::path::Path, name: &str, body: &str) -> std::path::PathBuf {
    use std::{io::Write, os::unix::fs::PermissionsExt};

    let path = dir.join(name);
    {
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh\n{body}").unwrap();
        file.sync_all().unwrap();
    }
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Serves the test handlers in-process on an OS-assigned port; `Execute` echoes.
pub(crate) async fn echo_server() -> u16 {
    let listener = TcpListener::bind("0.0.0.0:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = PluginServer::new()
        .register("Execute", Ok)
        .register("Upper", |payload: String| Ok(payload.to_uppercase()))
        .register("Fail", |_| anyhow::bail!("handler exploded"));
    tokio::spawn(server.serve(listener));
    port
}
