//! Integration tests for the signaling endpoint.
//!
//! Each test binds a node on an ephemeral port with the local
//! coordinator and drives it over a real WebSocket, the way a client
//! would. Media flow needs ICE and is out of reach here; everything up
//! to and including SDP exchange is exercised for real.
//!
//! Run with: cargo test -p cascade-server --test signal_tests

use cascade_server::config::Config;
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use webrtc::api::APIBuilder;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

struct TestServer {
    addr: std::net::SocketAddr,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl TestServer {
    async fn start(configure: impl FnOnce(&mut Config)) -> anyhow::Result<Self> {
        let mut config = Config::default();
        configure(&mut config);

        let (router, _server) = cascade_server::create_app(config).await?;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .ok();
        });

        Ok(Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    fn http_url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    fn session_url(&self, sid: &str) -> String {
        format!("ws://{}/session/{}", self.addr, sid)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn connect(server: &TestServer, sid: &str) -> anyhow::Result<WsClient> {
    let (ws, _) = connect_async(server.session_url(sid)).await?;
    Ok(ws)
}

async fn send_rpc(ws: &mut WsClient, payload: &impl Serialize) -> anyhow::Result<()> {
    ws.send(Message::text(serde_json::to_string(payload)?))
        .await?;
    Ok(())
}

/// Reads frames until one parses as JSON and satisfies the predicate.
async fn recv_until(
    ws: &mut WsClient,
    mut pred: impl FnMut(&Value) -> bool,
) -> anyhow::Result<Value> {
    loop {
        let frame = timeout(RECV_TIMEOUT, ws.next())
            .await?
            .ok_or_else(|| anyhow::anyhow!("socket closed"))??;
        if let Message::Text(text) = frame {
            let value: Value = serde_json::from_str(text.as_str())?;
            if pred(&value) {
                return Ok(value);
            }
        }
    }
}

async fn recv_reply(ws: &mut WsClient, id: i64) -> anyhow::Result<Value> {
    recv_until(ws, |v| v["id"] == json!(id)).await
}

/// Builds a client-side peer connection with one audio transceiver and a
/// local offer, the way a publisher starts a join.
async fn client_offer() -> anyhow::Result<(RTCPeerConnection, RTCSessionDescription)> {
    let mut media_engine = webrtc::api::media_engine::MediaEngine::default();
    media_engine.register_default_codecs()?;
    let api = APIBuilder::new().with_media_engine(media_engine).build();
    let pc = api
        .new_peer_connection(Default::default())
        .await?;
    pc.add_transceiver_from_kind(RTPCodecType::Audio, None)
        .await?;
    let offer = pc.create_offer(None).await?;
    pc.set_local_description(offer.clone()).await?;
    Ok((pc, offer))
}

fn sign_token(sid: &str, key: &str) -> String {
    #[derive(Serialize)]
    struct Claims {
        sid: String,
        exp: i64,
        iat: i64,
    }
    let now = chrono::Utc::now().timestamp();
    encode(
        &Header::default(),
        &Claims {
            sid: sid.to_owned(),
            exp: now + 600,
            iat: now,
        },
        &EncodingKey::from_secret(key.as_bytes()),
    )
    .unwrap()
}

#[tokio::test]
async fn liveness_and_metrics_endpoints() {
    let server = TestServer::start(|_| {}).await.unwrap();
    let client = reqwest::Client::new();

    let live = client.get(server.http_url("/")).send().await.unwrap();
    assert_eq!(live.status(), 200);
    assert_eq!(live.text().await.unwrap(), "OK");

    let metrics = client.get(server.http_url("/metrics")).send().await.unwrap();
    assert_eq!(metrics.status(), 200);
    let body = metrics.text().await.unwrap();
    assert!(body.contains("cascade_sessions"));
    assert!(body.contains("cascade_clients"));
    assert!(body.contains("cascade_proxy_clients"));
}

#[tokio::test]
async fn ping_replies_pong() {
    let server = TestServer::start(|_| {}).await.unwrap();
    let mut ws = connect(&server, "room-ping").await.unwrap();

    send_rpc(&mut ws, &json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
        .await
        .unwrap();
    let reply = recv_reply(&mut ws, 1).await.unwrap();
    assert_eq!(reply["result"], "pong");
}

#[tokio::test]
async fn unknown_method_is_rejected() {
    let server = TestServer::start(|_| {}).await.unwrap();
    let mut ws = connect(&server, "room-unknown").await.unwrap();

    send_rpc(&mut ws, &json!({"jsonrpc": "2.0", "id": 2, "method": "bogus"}))
        .await
        .unwrap();
    let reply = recv_reply(&mut ws, 2).await.unwrap();
    assert_eq!(reply["error"]["code"], -32601);
}

#[tokio::test]
async fn upgrade_requires_valid_token_when_auth_enabled() {
    let server = TestServer::start(|c| {
        c.signal.auth.enabled = true;
        c.signal.auth.key = "secret".to_owned();
    })
    .await
    .unwrap();

    // No token at all.
    assert!(connect(&server, "room-auth").await.is_err());

    // Token signed for a different session.
    let wrong = sign_token("other-room", "secret");
    let url = format!("{}?access_token={}", server.session_url("room-auth"), wrong);
    assert!(connect_async(url.as_str()).await.is_err());

    // Matching token gets through.
    let good = sign_token("room-auth", "secret");
    let url = format!("{}?access_token={}", server.session_url("room-auth"), good);
    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
    send_rpc(&mut ws, &json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
        .await
        .unwrap();
    let reply = recv_reply(&mut ws, 1).await.unwrap();
    assert_eq!(reply["result"], "pong");
}

#[tokio::test]
async fn join_returns_answer_and_counts_session() {
    let server = TestServer::start(|_| {}).await.unwrap();
    let mut ws = connect(&server, "room-join").await.unwrap();

    let (pc, offer) = client_offer().await.unwrap();
    send_rpc(
        &mut ws,
        &json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "join",
            "params": {"sid": "room-join", "uid": "c1", "offer": offer},
        }),
    )
    .await
    .unwrap();

    let reply = recv_reply(&mut ws, 1).await.unwrap();
    assert_eq!(reply["result"]["type"], "answer", "reply: {reply}");
    let sdp = reply["result"]["sdp"].as_str().unwrap();
    assert!(sdp.contains("m=audio"));

    // The answer is a valid remote description for the client.
    let answer: RTCSessionDescription =
        serde_json::from_value(reply["result"].clone()).unwrap();
    pc.set_remote_description(answer).await.unwrap();

    let metrics = reqwest::Client::new()
        .get(server.http_url("/metrics"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(metrics.contains("cascade_sessions 1"));
    assert!(metrics.contains("cascade_clients 1"));
}

#[tokio::test]
async fn second_join_on_same_connection_fails() {
    let server = TestServer::start(|_| {}).await.unwrap();
    let mut ws = connect(&server, "room-dup").await.unwrap();

    let (_pc1, offer1) = client_offer().await.unwrap();
    send_rpc(
        &mut ws,
        &json!({
            "jsonrpc": "2.0", "id": 1, "method": "join",
            "params": {"sid": "room-dup", "uid": "c1", "offer": offer1},
        }),
    )
    .await
    .unwrap();
    recv_reply(&mut ws, 1).await.unwrap();

    let (_pc2, offer2) = client_offer().await.unwrap();
    send_rpc(
        &mut ws,
        &json!({
            "jsonrpc": "2.0", "id": 2, "method": "join",
            "params": {"sid": "room-dup", "uid": "c1", "offer": offer2},
        }),
    )
    .await
    .unwrap();
    let reply = recv_reply(&mut ws, 2).await.unwrap();
    assert_eq!(reply["error"]["code"], 500);
}

#[tokio::test]
async fn join_with_invalid_offer_fails() {
    let server = TestServer::start(|_| {}).await.unwrap();
    let mut ws = connect(&server, "room-bad-sdp").await.unwrap();

    send_rpc(
        &mut ws,
        &json!({
            "jsonrpc": "2.0", "id": 1, "method": "join",
            "params": {
                "sid": "room-bad-sdp",
                "offer": {"type": "offer", "sdp": "this is not sdp"},
            },
        }),
    )
    .await
    .unwrap();
    let reply = recv_reply(&mut ws, 1).await.unwrap();
    assert_eq!(reply["error"]["code"], 500);
}

#[tokio::test]
async fn presence_set_broadcasts_with_monotone_revision() {
    let server = TestServer::start(|_| {}).await.unwrap();
    let mut ws = connect(&server, "room-presence").await.unwrap();

    let (_pc, offer) = client_offer().await.unwrap();
    send_rpc(
        &mut ws,
        &json!({
            "jsonrpc": "2.0", "id": 1, "method": "join",
            "params": {"sid": "room-presence", "uid": "c1", "offer": offer},
        }),
    )
    .await
    .unwrap();
    recv_reply(&mut ws, 1).await.unwrap();

    send_rpc(
        &mut ws,
        &json!({
            "jsonrpc": "2.0", "method": "presence_set",
            "params": {"name": "alice"},
        }),
    )
    .await
    .unwrap();

    let presence = recv_until(&mut ws, |v| v["method"] == "presence").await.unwrap();
    let first_rev = presence["params"]["revision"].as_u64().unwrap();
    assert!(first_rev >= 1);
    assert_eq!(presence["params"]["meta"]["c1"]["name"], "alice");

    // A later joiner sees the snapshot without waiting for an update.
    let mut ws2 = connect(&server, "room-presence").await.unwrap();
    let (_pc2, offer2) = client_offer().await.unwrap();
    send_rpc(
        &mut ws2,
        &json!({
            "jsonrpc": "2.0", "id": 1, "method": "join",
            "params": {"sid": "room-presence", "uid": "c2", "offer": offer2},
        }),
    )
    .await
    .unwrap();
    recv_reply(&mut ws2, 1).await.unwrap();

    let snapshot = recv_until(&mut ws2, |v| v["method"] == "presence").await.unwrap();
    assert!(snapshot["params"]["revision"].as_u64().unwrap() >= first_rev);
    assert_eq!(snapshot["params"]["meta"]["c1"]["name"], "alice");
}

#[tokio::test]
async fn second_subscriber_gets_server_offer_for_published_track() {
    let server = TestServer::start(|_| {}).await.unwrap();

    // C1 joins and renegotiates so its audio track is actually sent.
    let mut ws1 = connect(&server, "room-fanout").await.unwrap();
    let (_pc1, offer1) = client_offer().await.unwrap();
    send_rpc(
        &mut ws1,
        &json!({
            "jsonrpc": "2.0", "id": 1, "method": "join",
            "params": {"sid": "room-fanout", "uid": "c1", "offer": offer1},
        }),
    )
    .await
    .unwrap();
    recv_reply(&mut ws1, 1).await.unwrap();

    // C2 joins the same session; the subscriber side must eventually
    // produce a server-initiated offer once C1's media lands. Without
    // ICE the track never arrives, but the subscriber datachannel alone
    // forces an offer toward C2.
    let mut ws2 = connect(&server, "room-fanout").await.unwrap();
    let (_pc2, offer2) = client_offer().await.unwrap();
    send_rpc(
        &mut ws2,
        &json!({
            "jsonrpc": "2.0", "id": 1, "method": "join",
            "params": {"sid": "room-fanout", "uid": "c2", "offer": offer2},
        }),
    )
    .await
    .unwrap();
    recv_reply(&mut ws2, 1).await.unwrap();

    let offer = recv_until(&mut ws2, |v| v["method"] == "offer").await.unwrap();
    assert_eq!(offer["params"]["type"], "offer");
    assert!(offer["params"]["sdp"].as_str().unwrap().contains("m=application"));
}

#[tokio::test]
async fn session_is_removed_when_last_peer_leaves() {
    let server = TestServer::start(|_| {}).await.unwrap();
    let mut ws = connect(&server, "room-r1").await.unwrap();

    let (_pc, offer) = client_offer().await.unwrap();
    send_rpc(
        &mut ws,
        &json!({
            "jsonrpc": "2.0", "id": 1, "method": "join",
            "params": {"sid": "room-r1", "uid": "c1", "offer": offer},
        }),
    )
    .await
    .unwrap();
    recv_reply(&mut ws, 1).await.unwrap();

    ws.close(None).await.unwrap();
    drop(ws);

    // Close propagation is asynchronous; poll the gauge.
    let client = reqwest::Client::new();
    let mut cleaned = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let body = client
            .get(server.http_url("/metrics"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        if body.contains("cascade_sessions 0") && body.contains("cascade_clients 0") {
            cleaned = true;
            break;
        }
    }
    assert!(cleaned, "session/client gauges did not return to zero");
}

#[tokio::test]
async fn trickle_before_join_is_an_error_only_for_requests() {
    let server = TestServer::start(|_| {}).await.unwrap();
    let mut ws = connect(&server, "room-trickle").await.unwrap();

    // As a notification: dropped quietly, the connection stays usable.
    send_rpc(
        &mut ws,
        &json!({
            "jsonrpc": "2.0", "method": "trickle",
            "params": {"target": 0, "candidate": {"candidate": "candidate:1 1 udp 1 127.0.0.1 5000 typ host"}},
        }),
    )
    .await
    .unwrap();

    send_rpc(&mut ws, &json!({"jsonrpc": "2.0", "id": 9, "method": "ping"}))
        .await
        .unwrap();
    let reply = recv_reply(&mut ws, 9).await.unwrap();
    assert_eq!(reply["result"], "pong");
}
