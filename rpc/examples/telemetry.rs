use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use hookpipe_common::{select_platform, PipeName, PipeSecurityMode};
use hookpipe_rpc::{
    EventQueue, NotificationPump, RpcClient, RpcDispatcher, RpcMethod, RpcNotification,
};
use hookpipe_server::NamedPipeServer;
use tracing::info;

/// Batch of file paths opened inside the monitored process
struct OnCreateFile;

impl RpcNotification for OnCreateFile {
    const NAME: &'static str = "OnCreateFile";
    type Params = Vec<String>;
}

/// Liveness check the monitored side runs before it starts reporting
struct Ping;

impl RpcMethod for Ping {
    const NAME: &'static str = "Ping";
    type Params = ();
    type Output = String;
}

/// Supervisor and monitored side in one process: the monitored side records
/// simulated file opens into an event queue and a pump ships them to the
/// supervisor twice a second until Ctrl+C.
fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal, stopping...");
        r.store(false, Ordering::SeqCst);
    })
    .context("Failed to set signal handler")?;

    // Supervisor
    let name = PipeName::unique("hookpipe-telemetry");
    let mut dispatcher = RpcDispatcher::new();
    dispatcher
        .register_method::<Ping, _>(|()| Ok("pong".to_string()))
        .register_notification::<OnCreateFile, _>(|files| {
            for file in files {
                println!("opened: {file}");
            }
            Ok(())
        });
    let platform = select_platform(PipeSecurityMode::from_env())?;
    let server = NamedPipeServer::start_new_server(&name, &*platform, dispatcher.into_handler())
        .context("Failed to start supervisor")?;

    // Monitored side
    let mut client = RpcClient::connect(name.clone(), Duration::from_secs(3))?;
    println!("Supervisor says {}", client.call::<Ping>(&())?);

    let queue = EventQueue::new();
    let pump = NotificationPump::start::<OnCreateFile, String>(client, queue.clone())?;

    let mut counter = 0u64;
    while running.load(Ordering::SeqCst) && pump.is_running() {
        counter += 1;
        queue.push(format!("/var/log/sample-{counter}.log"));
        thread::sleep(Duration::from_millis(120));
    }

    let summary = pump.stop()?;
    server.dispose();
    println!(
        "✓ Delivered {} events in {} batches",
        summary.events_sent, summary.batches_sent
    );
    Ok(())
}
