//! Demo plugin: `Execute` and `ExecuteV2` both return their payload.

use warden_plugin_sdk::PluginServer;

#[tokio::main]
async fn main() {
    let server = PluginServer::new()
        .register("Execute", Ok)
        .register("ExecuteV2", Ok);
    if let Err(err) = server.run_from_args().await {
        eprintln!("echo-plugin: {err:#}");
        std::process::exit(1);
    }
}
