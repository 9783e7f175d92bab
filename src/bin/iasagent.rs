use anyhow::{Context, Result};
use tracing::info;

use ias::ipc::{self, AgentServer, CheckInOptions};
use ias::logging;
use ias::settings::DEFAULT_DAEMON_ENDPOINT;

fn main() {
    if let Err(err) = real_main() {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

fn real_main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let debug = args.iter().any(|a| a == "--debug");
    logging::init(debug);

    let daemon = args
        .iter()
        .find(|a| !a.starts_with("--"))
        .cloned()
        .or_else(|| std::env::var("IAS_DAEMON_ENDPOINT").ok())
        .unwrap_or_else(|| DEFAULT_DAEMON_ENDPOINT.to_string());

    let uid = ipc::current_uid();
    let server = AgentServer::bind("127.0.0.1:0", uid)?;
    let endpoint = server.endpoint();
    let token = server.token().to_string();
    let handle = server.spawn();
    info!(%endpoint, uid, "agent listening");

    ipc::check_in_with_daemon(&CheckInOptions::new(daemon), &endpoint, uid, &token)
        .context("check-in with daemon failed")?;

    info!("waiting for work from the daemon");
    handle.join();
    Ok(())
}
