use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::routing::post;
use axum::Router;

use netmarshal::adapters::xmlrpc::XmlRpcAdapter;
use netmarshal::adapters::StationAdapter;
use netmarshal::store::types::Vfo;
use netmarshal::ProtocolError;

type Captured = Arc<Mutex<Vec<String>>>;

const OK_RESPONSE: &str = "<?xml version=\"1.0\"?><methodResponse><params><param>\
                           <value><string>ok</string></value></param></params></methodResponse>";

async fn capture(State(bodies): State<Captured>, body: String) -> &'static str {
    bodies.lock().unwrap().push(body);
    OK_RESPONSE
}

/// Endpoint that records every request body posted to /RPC2.
async fn spawn_endpoint() -> (std::net::SocketAddr, Captured) {
    let captured: Captured = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new()
        .route("/RPC2", post(capture))
        .with_state(captured.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, captured)
}

fn adapter_for(addr: std::net::SocketAddr) -> XmlRpcAdapter {
    XmlRpcAdapter::new(&addr.ip().to_string(), addr.port(), Duration::from_secs(2))
}

#[tokio::test]
async fn waterfall_offset_goes_out_as_a_shell_command() {
    let (addr, captured) = spawn_endpoint().await;
    let mut adapter = adapter_for(addr);

    adapter.set_waterfall(1500).await.unwrap();

    let bodies = captured.lock().unwrap();
    assert_eq!(bodies.len(), 1);
    assert!(bodies[0].contains("<methodName>main.shell</methodName>"));
    assert!(bodies[0].contains("<string>FLDIGI.WFHZ:1500</string>"));
}

#[tokio::test]
async fn frequency_with_vfo_selects_the_vfo_first() {
    let (addr, captured) = spawn_endpoint().await;
    let mut adapter = adapter_for(addr);

    adapter
        .set_frequency(14_070_000, Some(Vfo::B))
        .await
        .unwrap();

    let bodies = captured.lock().unwrap();
    assert_eq!(bodies.len(), 2);
    assert!(bodies[0].contains("<methodName>rig.set_AB</methodName>"));
    assert!(bodies[0].contains("<string>B</string>"));
    assert!(bodies[1].contains("<methodName>rig.set_verify_frequency</methodName>"));
    assert!(bodies[1].contains("<string>14070000</string>"));
}

#[tokio::test]
async fn health_probe_sends_an_empty_parameter_list() {
    let (addr, captured) = spawn_endpoint().await;
    let mut adapter = adapter_for(addr);

    adapter.health_check().await.unwrap();

    let bodies = captured.lock().unwrap();
    assert_eq!(bodies.len(), 1);
    assert!(bodies[0].contains("<methodName>main.get_version</methodName>"));
    assert!(bodies[0].contains("<params/>"));
}

#[tokio::test]
async fn server_errors_are_transient_but_client_errors_are_not() {
    use axum::http::StatusCode;

    let app = Router::new().route(
        "/RPC2",
        post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "") }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    let mut adapter = adapter_for(addr);
    match adapter.health_check().await {
        Err(ProtocolError::Transient(_)) => {}
        other => panic!("expected transient on 503, got {:?}", other),
    }

    // No /RPC2 route at all: a 404 is not worth retrying.
    let bare = Router::new();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, bare).await.unwrap();
    });
    let mut adapter = adapter_for(addr);
    match adapter.health_check().await {
        Err(ProtocolError::Permanent(_)) => {}
        other => panic!("expected permanent on 404, got {:?}", other),
    }
}

#[tokio::test]
async fn refused_endpoint_fails_as_transient() {
    let refused = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr
    };
    let mut adapter = adapter_for(refused);

    match adapter.health_check().await {
        Err(ProtocolError::Transient(_)) => {}
        other => panic!("expected transient failure, got {:?}", other),
    }
}
