use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::{Context, Result};
use hookpipe_common::{select_platform, PipeName, PipeSecurityMode};
use hookpipe_server::NamedPipeServer;
use tracing::info;

/// Echo server example that upper-cases every request it receives.
///
/// Pipe security follows HOOKPIPE_PIPE_SECURITY (`default` or `sandboxed`).
fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let name = std::env::args().nth(1).unwrap_or_else(|| "hookpipe-echo".to_string());
    let name = PipeName::new(name).context("Invalid pipe name")?;

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal, stopping server...");
        r.store(false, Ordering::SeqCst);
    })
    .context("Failed to set signal handler")?;

    let platform = select_platform(PipeSecurityMode::from_env())?;
    let server = NamedPipeServer::start_new_server(&name, &*platform, |request, connection| {
        info!("Echoing '{}'", request);
        if !connection.try_send_response(&request.to_uppercase()) {
            anyhow::bail!("client went away before the reply");
        }
        Ok(())
    })
    .with_context(|| format!("Failed to start server on '{name}'"))?;

    println!("Echo server listening on '{name}'");
    println!("Press Ctrl+C to stop the server gracefully");

    while running.load(Ordering::SeqCst) && server.is_running() {
        std::thread::sleep(std::time::Duration::from_millis(200));
    }

    server.dispose();
    let stats = server.stats();
    println!(
        "✓ Server stopped: {} connections, {} requests, {} faults",
        stats.connections_accepted, stats.requests_handled, stats.handler_faults
    );
    Ok(())
}
