//! End-to-end tests against the `farcall-rpc` binary.
//!
//! Each test launches `farcall-rpc serve --port 0`, reads the assigned port
//! from stdout, then talks to it over TCP.

use farcall::{ClientOptions, RpcClient, RpcError};
use farcall_rpc::Calculator;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

const BIN: &str = env!("CARGO_BIN_EXE_farcall-rpc");

/// Spawn the demo host and wait for its `RPC_PORT=` line.
async fn spawn_host(share: &str) -> (Child, String) {
    let mut child = Command::new(BIN)
        .args(["serve", "--port", "0", "--share", share])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .expect("Failed to spawn farcall-rpc");

    let stdout = child.stdout.take().expect("stdout is piped");
    let mut lines = BufReader::new(stdout).lines();
    let port = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(line) = lines.next_line().await.unwrap() {
            if let Some(port) = line.strip_prefix("RPC_PORT=") {
                return port.trim().to_string();
            }
        }
        panic!("farcall-rpc exited without reporting a port");
    })
    .await
    .expect("Timed out waiting for RPC_PORT");

    (child, format!("127.0.0.1:{}", port))
}

async fn connect(addr: &str) -> RpcClient {
    let client = RpcClient::connect_tcp(addr, ClientOptions::new().with_auto_reopen(false));
    client.open(&CancellationToken::new()).await.unwrap();
    client
}

#[tokio::test]
async fn test_add_and_divide() {
    let (_host, addr) = spawn_host("session").await;
    let client = connect(&addr).await;
    let ct = CancellationToken::new();

    let calculator = client.get_service::<Calculator>(&ct).await.unwrap();
    assert_eq!(calculator.add(3, 5, &ct).await.unwrap(), 8);
    assert_eq!(calculator.divide(-9, 3, &ct).await.unwrap(), -3);
    assert_eq!(calculator.last_result(&ct).await.unwrap(), -3);

    match calculator.divide(1, 0, &ct).await {
        Err(RpcError::ServerException(exception)) => assert_eq!(exception.type_name, "DivideByZero"),
        other => panic!("expected DivideByZero, got {other:?}"),
    }

    calculator.set_last_result(42, &ct).await.unwrap();
    assert_eq!(calculator.last_result(&ct).await.unwrap(), 42);

    drop(calculator);
    client.close(&ct).await.unwrap();
}

#[tokio::test]
async fn test_session_sharing_reuses_instance() {
    let (_host, addr) = spawn_host("session").await;
    let client = connect(&addr).await;
    let ct = CancellationToken::new();

    let first = client.get_service::<Calculator>(&ct).await.unwrap();
    let second = client.get_service::<Calculator>(&ct).await.unwrap();
    assert_eq!(first, second);

    first.add(1, 1, &ct).await.unwrap();
    assert_eq!(second.last_result(&ct).await.unwrap(), 2);
}

#[tokio::test]
async fn test_no_sharing_creates_fresh_instances() {
    let (_host, addr) = spawn_host("none").await;
    let client = connect(&addr).await;
    let ct = CancellationToken::new();

    let first = client.get_service::<Calculator>(&ct).await.unwrap();
    let second = client.get_service::<Calculator>(&ct).await.unwrap();
    assert_ne!(first.proxy().instance_id(), second.proxy().instance_id());

    first.add(10, 1, &ct).await.unwrap();
    assert_eq!(second.last_result(&ct).await.unwrap(), 0);
}

#[tokio::test]
async fn test_computed_event_reaches_subscriber() {
    let (_host, addr) = spawn_host("session").await;
    let client = connect(&addr).await;
    let ct = CancellationToken::new();
    let calculator = client.get_service::<Calculator>(&ct).await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let subscription = calculator
        .on_computed(move |result| sink.lock().unwrap().push(result), &ct)
        .await
        .unwrap();

    calculator.add(2, 3, &ct).await.unwrap();
    calculator.add(4, 4, &ct).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while seen.lock().unwrap().len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Computed events were not delivered");
    assert_eq!(*seen.lock().unwrap(), vec![5, 8]);

    calculator.unsubscribe(subscription, &ct).await.unwrap();
    calculator.add(1, 1, &ct).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(seen.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_call_subcommand_prints_result() {
    let (_host, addr) = spawn_host("host").await;

    let output = Command::new(BIN)
        .args(["call", "--addr", &addr, "--op", "add", "3", "5"])
        .output()
        .await
        .unwrap();
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "8");

    let output = Command::new(BIN)
        .args(["call", "--addr", &addr, "--op", "divide", "1", "0"])
        .output()
        .await
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("DivideByZero"));
}
