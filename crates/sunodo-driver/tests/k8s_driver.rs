//! Cluster driver against a scripted API server.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::mpsc;
use std::thread;

use serde_json::{Value, json};
use sunodo_driver::{
    DriverConfig, DriverError, K8sDriver, KubeClient, NodeDriver, NodeStatus, ResourceDefinition,
    build_driver,
};
use sunodo_store::{Address, DApp};
use url::Url;

struct Recorded {
    method: String,
    path: String,
    authorization: Option<String>,
    body: String,
}

fn read_request(socket: &mut std::net::TcpStream) -> String {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let read = socket.read(&mut chunk).expect("read request");
        if read == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..read]);
        let text = String::from_utf8_lossy(&buffer);
        if let Some(split) = text.find("\r\n\r\n") {
            let length = text[..split]
                .lines()
                .find_map(|line| {
                    line.to_ascii_lowercase()
                        .strip_prefix("content-length:")
                        .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                })
                .unwrap_or(0);
            if buffer.len() >= split + 4 + length {
                break;
            }
        }
    }
    String::from_utf8_lossy(&buffer).to_string()
}

fn parse(request: &str) -> Recorded {
    let (head, body) = request.split_once("\r\n\r\n").unwrap_or((request, ""));
    let mut lines = head.lines();
    let mut start = lines.next().unwrap_or_default().split_whitespace();
    let method = start.next().unwrap_or_default().to_string();
    let path = start.next().unwrap_or_default().to_string();
    let authorization = lines.find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.eq_ignore_ascii_case("authorization")
            .then(|| value.trim().to_string())
    });
    Recorded {
        method,
        path,
        authorization,
        body: body.to_string(),
    }
}

/// Answer each request with the next `(status, body)` pair.
fn spawn_api_server(replies: Vec<(u16, Value)>) -> (Url, mpsc::Receiver<Recorded>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
    let address = listener.local_addr().expect("listener addr");
    let (tx, rx) = mpsc::channel();

    thread::spawn(move || {
        for (status, body) in replies {
            let (mut socket, _) = listener.accept().expect("accept");
            let request = read_request(&mut socket);
            let _ = tx.send(parse(&request));
            let payload = body.to_string();
            let response = format!(
                "HTTP/1.1 {status} Scripted\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                payload.len(),
                payload
            );
            socket.write_all(response.as_bytes()).expect("write response");
            socket.flush().expect("flush");
        }
    });

    (Url::parse(&format!("http://{address}/")).expect("url"), rx)
}

fn driver(url: Url) -> K8sDriver {
    let client = KubeClient::new(url, "sunodo").unwrap().with_token("secret-token");
    K8sDriver::new(client, ResourceDefinition::default())
}

fn dapp() -> DApp {
    let mut dapp = DApp::new(Address::new([0x0a; 20]), 9_000);
    dapp.block_number = 7;
    dapp
}

#[tokio::test]
async fn start_posts_custom_resource() {
    let (url, requests) = spawn_api_server(vec![(201, json!({ "kind": "DApp" }))]);
    let status = driver(url).start(&dapp(), "QmSnapshot").await.unwrap();
    assert_eq!(status, NodeStatus::Starting);

    let request = requests.recv().unwrap();
    assert_eq!(request.method, "POST");
    assert_eq!(request.path, "/apis/sunodo.io/v1alpha1/namespaces/sunodo/dapps");
    assert_eq!(request.authorization.as_deref(), Some("Bearer secret-token"));
    let body: Value = serde_json::from_str(&request.body).unwrap();
    assert_eq!(body["metadata"]["name"], format!("dapp-{}", "0a".repeat(20)));
    assert_eq!(body["spec"]["location"], "QmSnapshot");
    assert_eq!(body["spec"]["blockNumber"], "7");
}

fn already_exists() -> (u16, Value) {
    (
        409,
        json!({ "kind": "Status", "reason": "AlreadyExists", "message": "dapps already exists" }),
    )
}

fn resource_path() -> String {
    format!(
        "/apis/sunodo.io/v1alpha1/namespaces/sunodo/dapps/dapp-{}",
        "0a".repeat(20)
    )
}

#[tokio::test]
async fn start_of_existing_resource_is_not_an_error() {
    let (url, requests) = spawn_api_server(vec![
        already_exists(),
        (200, json!({ "spec": { "location": "QmSnapshot" } })),
    ]);
    let status = driver(url).start(&dapp(), "QmSnapshot").await.unwrap();
    assert_eq!(status, NodeStatus::Started);

    assert_eq!(requests.recv().unwrap().method, "POST");
    let lookup = requests.recv().unwrap();
    assert_eq!(lookup.method, "GET");
    assert_eq!(lookup.path, resource_path());
    assert!(requests.try_recv().is_err());
}

#[tokio::test]
async fn start_from_new_location_patches_existing_resource() {
    let (url, requests) = spawn_api_server(vec![
        already_exists(),
        (200, json!({ "spec": { "location": "QmOld" } })),
        (200, json!({ "spec": { "location": "QmNew" } })),
    ]);
    let status = driver(url).start(&dapp(), "QmNew").await.unwrap();
    assert_eq!(status, NodeStatus::Starting);

    assert_eq!(requests.recv().unwrap().method, "POST");
    assert_eq!(requests.recv().unwrap().method, "GET");
    let patch = requests.recv().unwrap();
    assert_eq!(patch.method, "PATCH");
    assert_eq!(patch.path, resource_path());
    assert_eq!(patch.authorization.as_deref(), Some("Bearer secret-token"));
    let body: Value = serde_json::from_str(&patch.body).unwrap();
    assert_eq!(body["spec"]["location"], "QmNew");
    assert_eq!(body["spec"]["blockNumber"], "7");
}

#[tokio::test]
async fn start_surfaces_server_errors() {
    let (url, _requests) = spawn_api_server(vec![(500, json!({ "message": "etcd unavailable" }))]);
    let err = driver(url).start(&dapp(), "QmSnapshot").await.unwrap_err();
    match err {
        DriverError::Api { status, message } => {
            assert_eq!(status, 500);
            assert_eq!(message, "etcd unavailable");
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn stop_deletes_named_resource() {
    let (url, requests) = spawn_api_server(vec![(200, json!({ "status": "Success" }))]);
    let status = driver(url).stop(&dapp()).await.unwrap();
    assert_eq!(status, NodeStatus::Stopping);

    let request = requests.recv().unwrap();
    assert_eq!(request.method, "DELETE");
    assert_eq!(request.path, resource_path());
}

#[tokio::test]
async fn stop_of_missing_resource_propagates() {
    let (url, _requests) = spawn_api_server(vec![(404, json!({ "message": "not found" }))]);
    let err = driver(url).stop(&dapp()).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn fly_driver_rejects_every_call() {
    let driver = build_driver(&DriverConfig::Fly).unwrap();
    assert!(matches!(
        driver.start(&dapp(), "QmSnapshot").await,
        Err(DriverError::Unsupported(kind)) if kind == "fly"
    ));
    assert!(matches!(driver.stop(&dapp()).await, Err(DriverError::Unsupported(_))));
}
