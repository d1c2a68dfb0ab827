use std::{
    sync::{mpsc, Arc, OnceLock},
    thread,
    time::{Duration, Instant},
};

use hookpipe_client::NamedPipeClient;
use hookpipe_common::{DefaultPipePlatform, IpcError, PipeName, SandboxedPipePlatform};
use hookpipe_server::{Connection, NamedPipeServer, ShutdownHandle};
use proptest::prelude::*;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn echo(request: &str, connection: &mut Connection) -> anyhow::Result<()> {
    connection.try_send_response(request);
    Ok(())
}

fn connected_client(name: &PipeName) -> NamedPipeClient {
    let mut client = NamedPipeClient::new(name.clone());
    assert!(client.connect(Duration::from_secs(3)).unwrap(), "server did not accept");
    client
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn round_trip(client: &mut NamedPipeClient, request: &str) -> Result<String, IpcError> {
    client.send_request(request)?;
    client.read_raw_response()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn echo_returns_every_frame_safe_message(message in "[^\r\n]{0,200}") {
        init_tracing();
        let name = PipeName::unique("hookpipe-prop");
        let server = NamedPipeServer::start_new_server(&name, &DefaultPipePlatform, echo).unwrap();

        let mut client = connected_client(&name);
        prop_assert_eq!(round_trip(&mut client, &message).unwrap(), message);

        client.dispose();
        server.dispose();
    }
}

#[test]
fn connect_without_server_returns_false_near_deadline() {
    init_tracing();
    let mut client = NamedPipeClient::new(PipeName::unique("hookpipe-nobody"));

    let started = Instant::now();
    assert!(!client.connect(Duration::from_millis(250)).unwrap());
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(250), "returned early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1250), "returned late: {elapsed:?}");
    assert!(!client.is_connected());
}

#[test]
fn one_connection_serves_sequential_requests_in_order() {
    init_tracing();
    let name = PipeName::unique("hookpipe-seq");
    let mut seen = 0u32;
    let server =
        NamedPipeServer::start_new_server(&name, &DefaultPipePlatform, move |request, connection| {
            seen += 1;
            connection.try_send_response(&format!("{seen}:{request}"));
            Ok(())
        })
        .unwrap();

    let mut client = connected_client(&name);
    for (i, message) in ["alpha", "beta", "gamma", "delta"].iter().enumerate() {
        assert_eq!(round_trip(&mut client, message).unwrap(), format!("{}:{message}", i + 1));
    }

    assert_eq!(server.stats().connections_accepted, 1);
    assert_eq!(server.stats().requests_handled, 4);
}

#[test]
fn handler_may_answer_more_than_once() {
    init_tracing();
    let name = PipeName::unique("hookpipe-multi");
    let server =
        NamedPipeServer::start_new_server(&name, &DefaultPipePlatform, |request, connection| {
            for part in request.split(',') {
                connection.try_send_response(part);
            }
            Ok(())
        })
        .unwrap();

    let mut client = connected_client(&name);
    client.send_request("one,two,three").unwrap();
    assert_eq!(client.read_raw_response().unwrap(), "one");
    assert_eq!(client.read_raw_response().unwrap(), "two");
    assert_eq!(client.read_raw_response().unwrap(), "three");

    server.dispose();
}

#[test]
fn second_server_on_bound_name_conflicts_until_first_is_disposed() {
    init_tracing();
    let name = PipeName::unique("hookpipe-bind");
    let first = NamedPipeServer::start_new_server(&name, &DefaultPipePlatform, echo).unwrap();

    let second = NamedPipeServer::start_new_server(&name, &DefaultPipePlatform, echo);
    assert!(matches!(second, Err(IpcError::BindConflict { .. })));

    first.dispose();

    let third = NamedPipeServer::start_new_server(&name, &DefaultPipePlatform, echo).unwrap();
    let mut client = connected_client(&name);
    assert_eq!(round_trip(&mut client, "again").unwrap(), "again");
    third.dispose();
}

#[test]
fn faulting_handler_leaves_server_available() {
    init_tracing();
    let name = PipeName::unique("hookpipe-fault");
    let server =
        NamedPipeServer::start_new_server(&name, &DefaultPipePlatform, |request, connection| {
            match request {
                "fail" => anyhow::bail!("refusing '{request}'"),
                "panic" => panic!("handler exploded"),
                _ => {
                    connection.try_send_response(request);
                    Ok(())
                }
            }
        })
        .unwrap();

    let mut failing = connected_client(&name);
    assert!(round_trip(&mut failing, "fail").is_err());
    assert!(!failing.is_connected());

    let mut panicking = connected_client(&name);
    assert!(round_trip(&mut panicking, "panic").is_err());

    let mut healthy = connected_client(&name);
    assert_eq!(round_trip(&mut healthy, "still here").unwrap(), "still here");

    let stats = server.stats();
    assert_eq!(stats.handler_faults, 2);
    assert_eq!(stats.connections_accepted, 3);
    assert!(server.is_running());
}

#[test]
fn uppercase_server_round_trip_and_disposal() {
    init_tracing();
    let name = PipeName::new("test-pipe-A").unwrap();
    let server =
        NamedPipeServer::start_new_server(&name, &DefaultPipePlatform, |request, connection| {
            connection.try_send_response(&request.to_uppercase());
            Ok(())
        })
        .unwrap();

    let mut client = NamedPipeClient::new(name.clone());
    assert!(client.connect(Duration::from_millis(3000)).unwrap());
    client.send_request("hello").unwrap();
    assert_eq!(client.read_raw_response().unwrap(), "HELLO");

    // Disposal must interrupt the idle connection the client still holds
    server.dispose();
    assert!(!server.is_running());
    assert!(client.read_raw_response().is_err());

    let mut late = NamedPipeClient::new(name);
    assert!(!late.connect(Duration::from_millis(1000)).unwrap());
}

#[test]
fn response_comes_from_handler_not_request() {
    init_tracing();
    let name = PipeName::unique("hookpipe-random");
    let _server = NamedPipeServer::start_new_server(&name, &DefaultPipePlatform, |_, connection| {
        connection.try_send_response("RandomResponse");
        Ok(())
    })
    .unwrap();

    let mut client = connected_client(&name);
    let response = round_trip(&mut client, "TestMessage").unwrap();
    assert_ne!(response, "TestMessage");
    assert_eq!(response, "RandomResponse");
}

#[test]
fn dispose_is_idempotent() {
    init_tracing();
    let name = PipeName::unique("hookpipe-dispose");
    let server = NamedPipeServer::start_new_server(&name, &DefaultPipePlatform, echo).unwrap();

    server.dispose();
    server.dispose();
    assert!(!server.is_running());
    drop(server);

    let mut client = NamedPipeClient::new(name);
    assert!(!client.connect(Duration::from_millis(100)).unwrap());
}

#[test]
fn dispose_from_inside_handler() {
    init_tracing();
    let name = PipeName::unique("hookpipe-self-stop");
    let slot: Arc<OnceLock<Arc<NamedPipeServer>>> = Arc::new(OnceLock::new());

    let handler_slot = slot.clone();
    let server =
        NamedPipeServer::start_new_server(&name, &DefaultPipePlatform, move |request, connection| {
            connection.try_send_response(request);
            if request == "stop" {
                if let Some(server) = handler_slot.get() {
                    server.dispose();
                }
            }
            Ok(())
        })
        .unwrap();
    let server = Arc::new(server);
    assert!(slot.set(server.clone()).is_ok());

    let mut client = connected_client(&name);
    assert_eq!(round_trip(&mut client, "stop").unwrap(), "stop");
    assert!(wait_until(|| !server.is_running()));

    // Joining from the test thread after the handler already stopped it
    server.dispose();
    let mut late = NamedPipeClient::new(name);
    assert!(!late.connect(Duration::from_millis(100)).unwrap());
}

#[test]
fn stop_during_handler_closes_idle_connection() {
    init_tracing();
    let name = PipeName::unique("hookpipe-stop-idle");
    let slot: Arc<OnceLock<ShutdownHandle>> = Arc::new(OnceLock::new());

    let handler_slot = slot.clone();
    let server =
        NamedPipeServer::start_new_server(&name, &DefaultPipePlatform, move |request, connection| {
            connection.try_send_response(request);
            if let Some(handle) = handler_slot.get() {
                handle.shutdown();
            }
            Ok(())
        })
        .unwrap();
    assert!(slot.set(server.shutdown_handle()).is_ok());

    // The client keeps its end open and sends nothing more
    let mut client = connected_client(&name);
    assert_eq!(round_trip(&mut client, "last").unwrap(), "last");

    let (done_tx, done_rx) = mpsc::channel();
    let disposer = thread::spawn(move || {
        server.dispose();
        let _ = done_tx.send(());
    });
    assert!(
        done_rx.recv_timeout(Duration::from_secs(3)).is_ok(),
        "dispose waited on an idle client"
    );
    disposer.join().unwrap();
    assert!(client.read_raw_response().is_err());
}

#[test]
fn dispose_during_slow_handler_closes_connection() {
    init_tracing();
    let name = PipeName::unique("hookpipe-stop-slow");
    let server =
        NamedPipeServer::start_new_server(&name, &DefaultPipePlatform, |request, connection| {
            thread::sleep(Duration::from_millis(200));
            connection.try_send_response(request);
            Ok(())
        })
        .unwrap();

    let mut client = connected_client(&name);
    client.send_request("slow").unwrap();
    thread::sleep(Duration::from_millis(50));

    let started = Instant::now();
    server.dispose();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!server.is_running());

    // Whatever the handler managed to write, the connection ends after it
    let mut frames = 0;
    while client.read_raw_response().is_ok() {
        frames += 1;
        assert!(frames <= 1, "connection kept serving after dispose");
    }
}

#[test]
fn shutdown_handle_stops_from_another_thread() {
    init_tracing();
    let name = PipeName::unique("hookpipe-handle");
    let server = NamedPipeServer::start_new_server(&name, &DefaultPipePlatform, echo).unwrap();
    let handle = server.shutdown_handle();

    let mut client = connected_client(&name);
    assert_eq!(round_trip(&mut client, "before").unwrap(), "before");

    thread::spawn(move || handle.shutdown()).join().unwrap();
    assert!(!server.is_running());
    assert!(client.read_raw_response().is_err());
    server.dispose();
}

#[test]
fn embedded_newline_is_rejected_client_side() {
    init_tracing();
    let name = PipeName::unique("hookpipe-invalid");
    let _server = NamedPipeServer::start_new_server(&name, &DefaultPipePlatform, echo).unwrap();

    let mut client = connected_client(&name);
    assert!(matches!(client.send_request("two\nlines"), Err(IpcError::InvalidFrame(_))));
    assert!(client.is_connected());
    assert_eq!(round_trip(&mut client, "fine").unwrap(), "fine");
}

#[test]
fn sandboxed_platform_serves_clients() {
    init_tracing();
    let name = PipeName::unique("hookpipe-sandboxed");
    let platform = SandboxedPipePlatform::new().unwrap();
    let _server = NamedPipeServer::start_new_server(&name, &platform, echo).unwrap();

    let mut client = connected_client(&name);
    assert_eq!(round_trip(&mut client, "guarded").unwrap(), "guarded");
}
