use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver};
use hookpipe_client::NamedPipeClient;
use hookpipe_common::{DefaultPipePlatform, IpcError, PipeName};
use hookpipe_rpc::{
    message::{HANDLER_ERROR, METHOD_NOT_FOUND, PARSE_ERROR},
    EventQueue, NotificationPump, RpcClient, RpcClientError, RpcDispatcher, RpcMethod,
    RpcNotification,
};
use hookpipe_server::NamedPipeServer;
use serde::{Deserialize, Serialize};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileOpen {
    file_name:  String,
    access_row: u32,
}

struct Describe;

impl RpcMethod for Describe {
    const NAME: &'static str = "DescribeFileOpen";
    type Params = FileOpen;
    type Output = String;
}

struct Undeclared;

impl RpcMethod for Undeclared {
    const NAME: &'static str = "NotRegistered";
    type Params = ();
    type Output = ();
}

struct Fails;

impl RpcMethod for Fails {
    const NAME: &'static str = "always_fails";
    type Params = ();
    type Output = ();
}

struct OnCreateFile;

impl RpcNotification for OnCreateFile {
    const NAME: &'static str = "OnCreateFile";
    type Params = Vec<String>;
}

/// Server with every contract above registered; notification batches are
/// forwarded to the returned receiver
fn start_server(name: &PipeName) -> (NamedPipeServer, Receiver<Vec<String>>) {
    let (batches_tx, batches_rx) = unbounded();

    let mut dispatcher = RpcDispatcher::new();
    dispatcher
        .register_method::<Describe, _>(|open| {
            Ok(format!("{}@{}", open.file_name, open.access_row))
        })
        .register_method::<Fails, _>(|()| anyhow::bail!("nothing works"))
        .register_notification::<OnCreateFile, _>(move |files| {
            batches_tx.send(files)?;
            Ok(())
        });

    let handler = dispatcher.into_handler();
    let server = NamedPipeServer::start_new_server(name, &DefaultPipePlatform, handler).unwrap();
    (server, batches_rx)
}

#[test]
fn call_round_trip() {
    init_tracing();
    let name = PipeName::unique("hookpipe-rpc-call");
    let (_server, _batches) = start_server(&name);

    let mut client = RpcClient::connect(name, Duration::from_secs(3)).unwrap();
    for row in 0..3 {
        let described = client
            .call::<Describe>(&FileOpen {
                file_name:  "/etc/passwd".into(),
                access_row: row,
            })
            .unwrap();
        assert_eq!(described, format!("/etc/passwd@{row}"));
    }
}

#[test]
fn unknown_method_is_a_remote_error() {
    init_tracing();
    let name = PipeName::unique("hookpipe-rpc-unknown");
    let (_server, _batches) = start_server(&name);

    let mut client = RpcClient::connect(name, Duration::from_secs(3)).unwrap();
    match client.call::<Undeclared>(&()) {
        Err(RpcClientError::Remote(error)) => assert_eq!(error.code, METHOD_NOT_FOUND),
        other => panic!("expected method-not-found, got {other:?}"),
    }

    match client.call::<Fails>(&()) {
        Err(RpcClientError::Remote(error)) => {
            assert_eq!(error.code, HANDLER_ERROR);
            assert_eq!(error.message, "nothing works");
        }
        other => panic!("expected handler error, got {other:?}"),
    }

    // The connection survives remote errors
    assert!(client.is_connected());
}

#[test]
fn raw_garbage_gets_parse_error() {
    init_tracing();
    let name = PipeName::unique("hookpipe-rpc-garbage");
    let (_server, _batches) = start_server(&name);

    let mut pipe = NamedPipeClient::new(name);
    assert!(pipe.connect(Duration::from_secs(3)).unwrap());
    pipe.send_request("{not json").unwrap();
    let reply: serde_json::Value =
        serde_json::from_str(&pipe.read_raw_response().unwrap()).unwrap();
    assert_eq!(reply["error"]["code"], PARSE_ERROR);
}

#[test]
fn connect_without_server_is_connect_timeout() {
    init_tracing();
    let name = PipeName::unique("hookpipe-rpc-absent");
    let result = RpcClient::connect(name, Duration::from_millis(50));
    match result {
        Err(RpcClientError::Transport(IpcError::ConnectTimeout { .. })) => {}
        Err(other) => panic!("expected connect timeout, got {other}"),
        Ok(_) => panic!("connected to a server that does not exist"),
    }
}

#[test]
fn notifications_arrive_without_reply() {
    init_tracing();
    let name = PipeName::unique("hookpipe-rpc-notify");
    let (_server, batches) = start_server(&name);

    let mut client = RpcClient::connect(name, Duration::from_secs(3)).unwrap();
    client.notify::<OnCreateFile>(&vec!["a.txt".to_string()]).unwrap();
    client.notify::<OnCreateFile>(&vec!["b.txt".to_string(), "c.txt".to_string()]).unwrap();

    assert_eq!(batches.recv_timeout(Duration::from_secs(2)).unwrap(), vec!["a.txt"]);
    assert_eq!(batches.recv_timeout(Duration::from_secs(2)).unwrap(), vec!["b.txt", "c.txt"]);

    // A call after the notifications still gets its own response
    let described = client
        .call::<Describe>(&FileOpen {
            file_name:  "after".into(),
            access_row: 1,
        })
        .unwrap();
    assert_eq!(described, "after@1");
}

#[test]
fn pump_batches_queued_events() {
    init_tracing();
    let name = PipeName::unique("hookpipe-rpc-pump");
    let (_server, batches) = start_server(&name);

    let client = RpcClient::connect(name, Duration::from_secs(3)).unwrap();
    let queue = EventQueue::new();
    for file in ["one", "two", "three"] {
        queue.push(file.to_string());
    }

    let interval = Duration::from_millis(50);
    let pump =
        NotificationPump::with_interval::<OnCreateFile, String>(client, queue.clone(), interval)
            .unwrap();

    // Everything queued before the first tick travels as one notification
    let first = batches.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(first, vec!["one", "two", "three"]);

    // Empty intervals send nothing
    assert!(batches.recv_timeout(Duration::from_millis(200)).is_err());

    queue.push("four".to_string());
    queue.push("five".to_string());
    let summary = pump.stop().unwrap();
    assert!(queue.is_empty());

    let mut rest = Vec::new();
    while rest.len() < 2 {
        let batch = batches.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(!batch.is_empty());
        rest.extend(batch);
    }
    assert_eq!(rest, vec!["four", "five"]);
    assert_eq!(summary.events_sent, 5);
    assert!(summary.batches_sent >= 2 && summary.batches_sent <= 3);
}

#[test]
fn pump_stops_when_server_goes_away() {
    init_tracing();
    let name = PipeName::unique("hookpipe-rpc-pump-gone");
    let (server, _batches) = start_server(&name);

    let client = RpcClient::connect(name, Duration::from_secs(3)).unwrap();
    let queue = EventQueue::new();
    let interval = Duration::from_millis(20);
    let pump =
        NotificationPump::with_interval::<OnCreateFile, String>(client, queue.clone(), interval)
            .unwrap();

    server.dispose();

    // Keep feeding until a write notices the closed pipe
    let deadline = std::time::Instant::now() + Duration::from_secs(3);
    while pump.is_running() && std::time::Instant::now() < deadline {
        queue.push("lost".to_string());
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(!pump.is_running());
    assert!(matches!(pump.stop(), Err(RpcClientError::Transport(_))));
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct PlainOpen {
    file_name:   String,
    access_mask: u32,
}

struct RecordOpen;

impl RpcNotification for RecordOpen {
    const NAME: &'static str = "record_open";
    type Params = PlainOpen;
}

#[test]
fn params_without_rename_go_out_camel_cased() {
    init_tracing();
    let name = PipeName::unique("hookpipe-rpc-camel");
    let (frames_tx, frames_rx) = unbounded();
    let _server =
        NamedPipeServer::start_new_server(&name, &DefaultPipePlatform, move |frame, _connection| {
            frames_tx.send(frame.to_string())?;
            Ok(())
        })
        .unwrap();

    let mut client = RpcClient::connect(name, Duration::from_secs(3)).unwrap();
    client
        .notify::<RecordOpen>(&PlainOpen {
            file_name:   "/etc/shadow".into(),
            access_mask: 1,
        })
        .unwrap();

    let frame: serde_json::Value =
        serde_json::from_str(&frames_rx.recv_timeout(Duration::from_secs(2)).unwrap()).unwrap();
    assert_eq!(frame["method"], "recordOpen");
    assert_eq!(
        frame["params"],
        serde_json::json!({ "fileName": "/etc/shadow", "accessMask": 1 })
    );
}

#[test]
fn plain_params_reach_the_dispatcher_intact() {
    init_tracing();
    let name = PipeName::unique("hookpipe-rpc-plain");
    let (opens_tx, opens_rx) = unbounded();
    let mut dispatcher = RpcDispatcher::new();
    dispatcher.register_notification::<RecordOpen, _>(move |open| {
        opens_tx.send(open)?;
        Ok(())
    });
    let handler = dispatcher.into_handler();
    let _server = NamedPipeServer::start_new_server(&name, &DefaultPipePlatform, handler).unwrap();

    let mut client = RpcClient::connect(name, Duration::from_secs(3)).unwrap();
    let open = PlainOpen {
        file_name:   "C:/Windows/win.ini".into(),
        access_mask: 0x80,
    };
    client.notify::<RecordOpen>(&open).unwrap();
    assert_eq!(opens_rx.recv_timeout(Duration::from_secs(2)).unwrap(), open);
}

#[test]
fn pump_splits_bursts_larger_than_a_frame() {
    init_tracing();
    let name = PipeName::unique("hookpipe-rpc-burst");
    let (_server, batches) = start_server(&name);

    let client = RpcClient::connect(name, Duration::from_secs(3)).unwrap();
    let queue = EventQueue::new();
    for n in 0..20_000 {
        queue.push(format!("/var/lib/hookpipe/burst/some/deeply/nested/directory/file-{n:06}.dat"));
    }

    let interval = Duration::from_millis(50);
    let pump =
        NotificationPump::with_interval::<OnCreateFile, String>(client, queue.clone(), interval)
            .unwrap();

    let mut received = Vec::new();
    let mut batch_count = 0;
    while received.len() < 20_000 {
        received.extend(batches.recv_timeout(Duration::from_secs(5)).unwrap());
        batch_count += 1;
    }
    assert!(batch_count >= 2);
    assert!(received[0].ends_with("file-000000.dat"));
    assert!(received[19_999].ends_with("file-019999.dat"));

    // The pump keeps delivering after the burst
    assert!(pump.is_running());
    queue.push("after-burst".to_string());
    assert_eq!(batches.recv_timeout(Duration::from_secs(2)).unwrap(), vec!["after-burst"]);

    let summary = pump.stop().unwrap();
    assert_eq!(summary.events_sent, 20_001);
}

