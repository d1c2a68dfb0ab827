use std::time::Duration;

use anyhow::{bail, Context, Result};
use hookpipe_client::{ClientConfig, NamedPipeClient, PipeName};

/// Sends each command line argument to a running server and prints the reply.
///
/// Start the server side with `cargo run -p hookpipe-server --example echo`.
fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let name = args.next().unwrap_or_else(|| "hookpipe-echo".to_string());
    let messages: Vec<String> = args.collect();
    let messages = if messages.is_empty() {
        vec!["hello".to_string(), "from".to_string(), "hookpipe".to_string()]
    } else {
        messages
    };

    let name = PipeName::new(name).context("Invalid pipe name")?;
    let config = ClientConfig::new().with_read_timeout(Some(Duration::from_secs(5)));
    let mut client = NamedPipeClient::with_config(name.clone(), config);

    println!("Connecting to '{name}'...");
    if !client.connect(Duration::from_secs(3))? {
        bail!("No server listening on '{name}'");
    }

    for message in &messages {
        client.send_request(message)?;
        let response = client.read_raw_response().context("Failed to read response")?;
        println!("{message} -> {response}");
    }

    client.dispose();
    println!("✓ Done");
    Ok(())
}
