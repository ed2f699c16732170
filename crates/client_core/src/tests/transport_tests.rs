use super::*;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message as FrameOut, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use shared::domain::ConversationId;
use tokio::net::TcpListener;
use uuid::Uuid;

#[derive(Clone)]
struct WsServerState {
    frames: Vec<String>,
    connections: Arc<Mutex<Vec<String>>>,
    client_closes: Arc<Mutex<u32>>,
}

async fn ws_handler(
    State(state): State<WsServerState>,
    Path(conversation_id): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    state.connections.lock().await.push(conversation_id);
    ws.on_upgrade(move |socket| serve_socket(socket, state))
}

async fn serve_socket(mut socket: WebSocket, state: WsServerState) {
    // Give the client a beat to attach its frame subscriber.
    tokio::time::sleep(Duration::from_millis(100)).await;
    for frame in &state.frames {
        if socket.send(FrameOut::Text(frame.clone())).await.is_err() {
            return;
        }
    }
    while let Some(Ok(message)) = socket.recv().await {
        if matches!(message, FrameOut::Close(_)) {
            break;
        }
    }
    *state.client_closes.lock().await += 1;
}

async fn spawn_ws_server(frames: Vec<String>) -> Result<(Url, WsServerState)> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let state = WsServerState {
        frames,
        connections: Arc::new(Mutex::new(Vec::new())),
        client_closes: Arc::new(Mutex::new(0)),
    };
    let app = Router::new()
        .route("/api/chat/ws/:id", get(ws_handler))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((Url::parse(&format!("http://{addr}"))?, state))
}

#[test]
fn push_url_is_derived_from_the_rest_base_url() {
    let conversation = ConversationId(Uuid::nil());

    let plain = WebSocketPushConnector::new(Url::parse("http://localhost:8000").unwrap());
    assert_eq!(
        plain.push_url(conversation).unwrap().as_str(),
        format!("ws://localhost:8000/api/chat/ws/{}", Uuid::nil())
    );

    let tls = WebSocketPushConnector::new(Url::parse("https://chat.example.com").unwrap());
    assert_eq!(
        tls.push_url(conversation).unwrap().scheme(),
        "wss"
    );

    let odd = WebSocketPushConnector::new(Url::parse("ftp://example.com").unwrap());
    assert!(odd.push_url(conversation).is_err());
}

#[tokio::test]
async fn delivers_text_frames_for_the_requested_conversation() {
    let conversation = ConversationId(Uuid::new_v4());
    let frame = r#"{"type":"new_message","message":{}}"#.to_string();
    let (base_url, state) = spawn_ws_server(vec![frame.clone()]).await.expect("spawn");

    let connector = WebSocketPushConnector::new(base_url);
    let session = connector.connect(conversation).await.expect("connect");
    let mut frames = session.subscribe_frames();

    let received = tokio::time::timeout(Duration::from_secs(2), frames.recv())
        .await
        .expect("frame timeout")
        .expect("frame");
    assert_eq!(received, frame);
    assert_eq!(
        *state.connections.lock().await,
        vec![conversation.to_string()]
    );
}

#[tokio::test]
async fn close_is_observed_by_the_server() {
    let conversation = ConversationId(Uuid::new_v4());
    let (base_url, state) = spawn_ws_server(Vec::new()).await.expect("spawn");

    let connector = WebSocketPushConnector::new(base_url);
    let session = connector.connect(conversation).await.expect("connect");
    session.close().await;

    let mut observed = false;
    for _ in 0..50 {
        if *state.client_closes.lock().await == 1 {
            observed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(observed, "server never saw the close frame");
}

#[tokio::test]
async fn missing_connector_refuses_to_connect() {
    let err = MissingPushConnector
        .connect(ConversationId(Uuid::nil()))
        .await
        .map(|_| ())
        .expect_err("must fail");
    assert!(err.to_string().contains("push transport unavailable"));
}
