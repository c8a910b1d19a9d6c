use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, Method, Request, StatusCode, Uri, header};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower::ServiceExt;

use hub_gateway::config::types::{
    BackendConfig, GatewaySettings, HttpProxyConfig, HubConfig, SseRelayConfig, Transport,
};
use hub_gateway::gateway::{bootstrap, serve};
use hub_gateway::router::{AppState, build_router};

async fn spawn_upstream(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Replies with a JSON description of whatever it received.
async fn mirror(method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Json<Value> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    Json(json!({
        "method": method.as_str(),
        "path": uri.path(),
        "query": uri.query(),
        "api_key": header("x-api-key"),
        "host": header("host"),
        "body": String::from_utf8_lossy(&body),
    }))
}

fn mirror_upstream() -> Router {
    Router::new()
        .route(
            "/api/teapot",
            get(|| async { (StatusCode::IM_A_TEAPOT, "short and stout") }),
        )
        .route(
            "/api/old",
            get(|| async { (StatusCode::FOUND, [(header::LOCATION, "/api/new")]) }),
        )
        .fallback(mirror)
}

fn http_backend(id: &str, url: String, headers: BTreeMap<String, String>) -> BackendConfig {
    BackendConfig {
        id: id.to_string(),
        transport: Transport::HttpProxy(HttpProxyConfig {
            url,
            headers,
            timeout_secs: Some(5),
        }),
    }
}

fn sse_backend(id: &str, addr: SocketAddr) -> BackendConfig {
    BackendConfig {
        id: id.to_string(),
        transport: Transport::SseRelay(SseRelayConfig {
            url: format!("http://{addr}/sse"),
            message_url: Some(format!("http://{addr}/message")),
            headers: BTreeMap::new(),
            timeout_secs: Some(5),
        }),
    }
}

async fn gateway_with(backends: Vec<BackendConfig>) -> (AppState, Router) {
    let state = bootstrap(
        HubConfig { backends },
        GatewaySettings::new("http://hub.test", "*"),
    )
    .await
    .unwrap();
    let app = build_router(state.clone());
    (state, app)
}

async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Bytes) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, bytes)
}

#[tokio::test]
async fn proxy_strips_prefix_and_injects_static_headers() {
    let addr = spawn_upstream(mirror_upstream()).await;
    let mut headers = BTreeMap::new();
    headers.insert("X-Api-Key".to_string(), "from-config".to_string());
    let (_state, app) =
        gateway_with(vec![http_backend("docs", format!("http://{addr}/api"), headers)]).await;

    let request = Request::get("/mcp/docs/v1/items?q=rust")
        .header("x-api-key", "from-client")
        .header("host", "hub.test")
        .body(Body::empty())
        .unwrap();
    let (status, bytes) = call(&app, request).await;
    assert_eq!(status, StatusCode::OK);

    let seen: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(seen["method"], "GET");
    assert_eq!(seen["path"], "/api/v1/items");
    assert_eq!(seen["query"], "q=rust");
    assert_eq!(seen["api_key"], "from-config");
    assert_eq!(seen["host"], addr.to_string());
}

#[tokio::test]
async fn proxy_forwards_post_body_to_base_url() {
    let addr = spawn_upstream(mirror_upstream()).await;
    let (_state, app) = gateway_with(vec![http_backend(
        "docs",
        format!("http://{addr}/api"),
        BTreeMap::new(),
    )])
    .await;

    let request = Request::post("/mcp/docs")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"jsonrpc":"2.0","id":7}"#))
        .unwrap();
    let (status, bytes) = call(&app, request).await;
    assert_eq!(status, StatusCode::OK);

    let seen: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(seen["method"], "POST");
    assert_eq!(seen["path"], "/api");
    assert_eq!(seen["body"], r#"{"jsonrpc":"2.0","id":7}"#);
}

#[tokio::test]
async fn proxy_passes_upstream_status_through() {
    let addr = spawn_upstream(mirror_upstream()).await;
    let (_state, app) = gateway_with(vec![http_backend(
        "docs",
        format!("http://{addr}/api"),
        BTreeMap::new(),
    )])
    .await;

    let (status, bytes) = call(
        &app,
        Request::get("/mcp/docs/teapot").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::IM_A_TEAPOT);
    assert_eq!(&bytes[..], b"short and stout");
}

#[tokio::test]
async fn proxy_returns_redirects_to_the_client() {
    let addr = spawn_upstream(mirror_upstream()).await;
    let (_state, app) = gateway_with(vec![http_backend(
        "docs",
        format!("http://{addr}/api"),
        BTreeMap::new(),
    )])
    .await;

    let response = app
        .clone()
        .oneshot(Request::get("/mcp/docs/old").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(response.headers()[header::LOCATION], "/api/new");
}

#[tokio::test]
async fn proxy_forwards_any_method_on_the_backend_root() {
    let addr = spawn_upstream(mirror_upstream()).await;
    let (_state, app) = gateway_with(vec![http_backend(
        "docs",
        format!("http://{addr}/api"),
        BTreeMap::new(),
    )])
    .await;

    for method in [Method::PUT, Method::DELETE] {
        let request = Request::builder()
            .method(method.clone())
            .uri("/mcp/docs?force=1")
            .body(Body::from("payload"))
            .unwrap();
        let (status, bytes) = call(&app, request).await;
        assert_eq!(status, StatusCode::OK);

        let seen: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(seen["method"], method.as_str());
        assert_eq!(seen["path"], "/api");
        assert_eq!(seen["query"], "force=1");
        assert_eq!(seen["body"], "payload");
    }

    let request = Request::builder()
        .method(Method::PUT)
        .uri("/mcp/docs/start")
        .body(Body::empty())
        .unwrap();
    let (status, bytes) = call(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    let seen: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(seen["path"], "/api/start");
}

#[tokio::test]
async fn unreachable_target_is_bad_gateway() {
    let (_state, app) = gateway_with(vec![http_backend(
        "down",
        "http://127.0.0.1:1".to_string(),
        BTreeMap::new(),
    )])
    .await;

    let (status, bytes) = call(
        &app,
        Request::get("/mcp/down/anything").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert!(body["error"].as_str().unwrap().contains("down"));
}

#[tokio::test]
async fn stopped_remote_backend_is_unavailable_until_started() {
    let addr = spawn_upstream(mirror_upstream()).await;
    let (_state, app) = gateway_with(vec![http_backend(
        "docs",
        format!("http://{addr}/api"),
        BTreeMap::new(),
    )])
    .await;

    let (status, _) = call(&app, Request::post("/mcp/docs/stop").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, _) = call(&app, Request::get("/mcp/docs/x").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let (status, bytes) =
        call(&app, Request::post("/mcp/docs/start").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["status"], "running");

    let (status, _) = call(&app, Request::get("/mcp/docs/x").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
}

async fn message_json(body: Bytes) -> Json<Value> {
    let request: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    Json(json!({"jsonrpc": "2.0", "id": request["id"], "result": {"ok": true}}))
}

async fn message_event_stream(body: Bytes) -> Response {
    let request: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let reply = json!({"jsonrpc": "2.0", "id": request["id"], "result": {"streamed": true}});
    (
        [("content-type", "text/event-stream")],
        format!("event: message\ndata: {reply}\n\n"),
    )
        .into_response()
}

#[tokio::test]
async fn sse_relay_request_returns_json_reply() {
    let addr = spawn_upstream(Router::new().route("/message", post(message_json))).await;
    let (_state, app) = gateway_with(vec![sse_backend("events", addr)]).await;

    let request = Request::post("/mcp/events")
        .body(Body::from(r#"{"jsonrpc":"2.0","id":3,"method":"ping"}"#))
        .unwrap();
    let (status, bytes) = call(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    let reply: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(reply["id"], 3);
    assert_eq!(reply["result"]["ok"], true);
}

#[tokio::test]
async fn sse_relay_request_unwraps_event_stream_reply() {
    let addr = spawn_upstream(Router::new().route("/message", post(message_event_stream))).await;
    let (_state, app) = gateway_with(vec![sse_backend("events", addr)]).await;

    let request = Request::post("/mcp/events")
        .body(Body::from(r#"{"jsonrpc":"2.0","id":4}"#))
        .unwrap();
    let (status, bytes) = call(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    let reply: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(reply["id"], 4);
    assert_eq!(reply["result"]["streamed"], true);
}

#[tokio::test]
async fn sse_relay_request_propagates_upstream_error() {
    let upstream = Router::new().route(
        "/message",
        post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
    );
    let addr = spawn_upstream(upstream).await;
    let (_state, app) = gateway_with(vec![sse_backend("events", addr)]).await;

    let (status, bytes) = call(
        &app,
        Request::post("/mcp/events").body(Body::from("{}")).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(&bytes[..], b"boom");
}

/// Sends on drop, so the test can observe the upstream stream being torn down.
struct DropSignal(mpsc::UnboundedSender<()>);

impl Drop for DropSignal {
    fn drop(&mut self) {
        let _ = self.0.send(());
    }
}

async fn ticking(
    State(closed): State<mpsc::UnboundedSender<()>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let guard = DropSignal(closed);
    let events = futures::stream::unfold((0u64, guard), |(n, guard)| async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let event = Event::default()
            .event("tick")
            .id(n.to_string())
            .data(format!("{{\"n\":{n}}}"));
        Some((Ok::<Event, Infallible>(event), (n + 1, guard)))
    });
    Sse::new(events)
}

async fn serve_gateway(state: AppState) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(listener, state));
    addr
}

async fn read_until_tick(response: reqwest::Response) -> BoxStream<'static, reqwest::Result<Bytes>> {
    let mut stream = response.bytes_stream().boxed();
    let mut seen = String::new();
    while !seen.contains("tick") {
        let chunk = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("no event relayed")
            .expect("stream ended early")
            .unwrap();
        seen.push_str(&String::from_utf8_lossy(&chunk));
    }
    assert!(seen.contains("\"n\":"), "unexpected relay output: {seen}");
    stream
}

#[tokio::test]
async fn client_disconnect_closes_upstream_stream() {
    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
    let upstream = Router::new()
        .route("/sse", get(ticking))
        .with_state(closed_tx);
    let upstream_addr = spawn_upstream(upstream).await;

    let (state, _app) = gateway_with(vec![sse_backend("events", upstream_addr)]).await;
    let gateway_addr = serve_gateway(state.clone()).await;

    let response = reqwest::get(format!("http://{gateway_addr}/mcp/events/sse"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"))
    );

    let stream = read_until_tick(response).await;
    drop(stream);

    tokio::time::timeout(Duration::from_secs(5), closed_rx.recv())
        .await
        .expect("upstream stream was not closed after client disconnect");

    state.shutdown.cancel();
}

#[tokio::test]
async fn shutdown_ends_open_event_streams() {
    let (closed_tx, _closed_rx) = mpsc::unbounded_channel();
    let upstream = Router::new()
        .route("/sse", get(ticking))
        .with_state(closed_tx);
    let upstream_addr = spawn_upstream(upstream).await;

    let (state, _app) = gateway_with(vec![sse_backend("events", upstream_addr)]).await;
    let gateway_addr = serve_gateway(state.clone()).await;

    let response = reqwest::get(format!("http://{gateway_addr}/mcp/events/sse"))
        .await
        .unwrap();
    let mut stream = read_until_tick(response).await;

    state.shutdown.cancel();

    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(Ok(_)) = stream.next().await {}
    })
    .await;
    assert!(drained.is_ok(), "event stream stayed open after shutdown");
}
