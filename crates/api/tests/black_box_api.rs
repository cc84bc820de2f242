use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use futures::{SinkExt, StreamExt};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::StatusCode;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio_tungstenite::tungstenite::Message;

use labflow_api::app::{AppServices, build_app};
use labflow_auth::{JwtClaims, Permission, ResourceAcl};
use labflow_core::{OrganizationId, ScopeRef, UserId};
use labflow_events::EventSink;
use labflow_infra::config::EngineConfig;
use labflow_infra::datastore::{Device, DeviceStatus};

const JWT_SECRET: &str = "test-secret";

struct TestServer {
    addr: std::net::SocketAddr,
    client: reqwest::Client,
    services: Arc<AppServices>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        let mut config = EngineConfig::default();
        config.server.jwt_secret = Some(JWT_SECRET.to_string());
        config.scheduler.enabled = false;
        config.workers.min_idle_poll = Duration::from_millis(5);
        config.workers.max_idle_poll = Duration::from_millis(20);

        // Same wiring as prod, bound to an ephemeral port.
        let services = AppServices::build(config).await.expect("failed to wire engine");
        services.start().await.expect("failed to start workers");
        let app = build_app(services.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            client: reqwest::Client::new(),
            services,
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    fn ws_url(&self, token: &str) -> String {
        format!("ws://{}/ws?token={token}", self.addr)
    }

    async fn get(&self, path: &str, token: Option<&str>) -> reqwest::Response {
        let mut req = self.client.get(self.url(path));
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }
        req.send().await.unwrap()
    }

    async fn post(&self, path: &str, token: &str, body: Option<Value>) -> reqwest::Response {
        let mut req = self.client.post(self.url(path)).bearer_auth(token);
        if let Some(body) = body {
            req = req.json(&body);
        }
        req.send().await.unwrap()
    }

    async fn get_json(&self, path: &str, token: &str) -> Value {
        let res = self.get(path, Some(token)).await;
        assert_eq!(res.status(), StatusCode::OK);
        res.json().await.unwrap()
    }

    /// Polls until `check` accepts the body; the worker pool runs asynchronously.
    async fn eventually(&self, path: &str, token: &str, check: impl Fn(&Value) -> bool) -> Value {
        for _ in 0..200 {
            let body = self.get_json(path, token).await;
            if check(&body) {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met within timeout for {path}");
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn mint_jwt(user: UserId, org: OrganizationId, permissions: Vec<Permission>) -> String {
    let now = Utc::now();
    let claims = JwtClaims {
        sub: user,
        org,
        permissions,
        issued_at: now,
        expires_at: now + ChronoDuration::minutes(10),
    };

    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .expect("failed to encode jwt")
}

fn operator_token() -> String {
    mint_jwt(
        UserId::new(),
        OrganizationId::new(),
        vec![Permission::OPS_READ, Permission::OPS_WRITE],
    )
}

fn notification(id: &str, channel: &str, recipient: &str) -> Value {
    json!({
        "job": "send_notification",
        "args": {
            "notification_id": id,
            "user_id": UserId::new(),
            "channel": channel,
            "recipient": recipient,
            "subject": "Run finished",
        },
    })
}

fn attempts_of<'a>(recent: &'a Value, job_id: &'a str) -> impl Iterator<Item = &'a Value> {
    recent
        .as_array()
        .into_iter()
        .flatten()
        .filter(move |r| r["job_id"] == job_id)
}

async fn next_text<S>(stream: &mut S) -> Value
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

#[tokio::test]
async fn health_and_metrics_are_public() {
    let srv = TestServer::spawn().await;

    assert_eq!(srv.get("/health", None).await.status(), StatusCode::OK);

    let res = srv.get("/metrics", None).await;
    assert_eq!(res.status(), StatusCode::OK);
    let body = res.text().await.unwrap();
    assert!(body.contains("jobs_enqueued_total"));
    assert!(body.contains("queue_depth"));
}

#[tokio::test]
async fn operator_routes_require_auth_and_permission() {
    let srv = TestServer::spawn().await;

    let res = srv.get("/ops/queues", None).await;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "unauthorized");

    let reader = mint_jwt(UserId::new(), OrganizationId::new(), vec![Permission::OPS_READ]);
    let body = srv.get_json("/ops/queues", &reader).await;
    assert_eq!(body["realtime"]["slots"], 16);

    let res = srv
        .post("/ops/jobs", &reader, Some(json!({"job": "purge_dead_letters"})))
        .await;
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "forbidden");
}

#[tokio::test]
async fn enqueue_runs_job_and_dedupes_by_idempotency_key() {
    let srv = TestServer::spawn().await;
    let token = operator_token();

    let mut request = notification("n-1", "email", "ada@example.org");
    request["idempotency_key"] = json!("notify:n-1");

    let res = srv.post("/ops/jobs", &token, Some(request.clone())).await;
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let first: Value = res.json().await.unwrap();
    assert_eq!(first["duplicate"], false);
    let job_id = first["job_id"].as_str().unwrap().to_string();

    let second: Value = srv
        .post("/ops/jobs", &token, Some(request))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(second["duplicate"], true);
    assert_eq!(second["job_id"], first["job_id"]);

    let recent = srv
        .eventually("/ops/jobs/recent", &token, |body| {
            attempts_of(body, &job_id).next().is_some()
        })
        .await;
    let record = attempts_of(&recent, &job_id).next().unwrap();
    assert_eq!(record["outcome"], "success");
    assert_eq!(record["attempt"], 0);

    let history = srv.get_json(&format!("/ops/jobs/{job_id}"), &token).await;
    assert_eq!(history["attempts"].as_array().unwrap().len(), 1);

    let latency = srv.get_json("/ops/handlers/latency", &token).await;
    assert_eq!(latency["send_notification"]["count"], 1);
}

#[tokio::test]
async fn unknown_jobs_and_bad_ids_are_rejected() {
    let srv = TestServer::spawn().await;
    let token = operator_token();

    let res = srv
        .post("/ops/jobs", &token, Some(json!({"job": "does_not_exist"})))
        .await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "unknown_job");

    let res = srv.post("/ops/dead-letters/not-a-uuid/retry", &token, None).await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let missing = format!("/ops/dead-letters/{}/retry", uuid::Uuid::now_v7());
    let res = srv.post(&missing, &token, None).await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn permanent_failure_is_dead_lettered_and_replayable() {
    let srv = TestServer::spawn().await;
    let token = operator_token();

    // The log notifier rejects blank recipients, which is a permanent failure.
    let ack: Value = srv
        .post("/ops/jobs", &token, Some(notification("n-bad", "sms", " ")))
        .await
        .json()
        .await
        .unwrap();
    let job_id = ack["job_id"].as_str().unwrap().to_string();

    let dead = srv
        .eventually("/ops/dead-letters", &token, |body| body["total"] == 1)
        .await;
    let record = &dead["records"][0];
    assert_eq!(record["envelope"]["id"], job_id.as_str());
    assert_eq!(record["error"]["code"], "permanent");

    let res = srv
        .post(&format!("/ops/dead-letters/{job_id}/retry"), &token, None)
        .await;
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let replayed: Value = res.json().await.unwrap();
    assert_eq!(replayed["job_id"], job_id.as_str());

    // Replayed with attempt 0, fails permanently again, back in the store.
    let recent = srv
        .eventually("/ops/jobs/recent", &token, |body| attempts_of(body, &job_id).count() == 2)
        .await;
    assert!(attempts_of(&recent, &job_id).all(|r| r["attempt"] == 0 && r["outcome"] == "permanent_failure"));
    srv.eventually("/ops/dead-letters", &token, |body| body["total"] == 1)
        .await;

    let metrics = srv.get("/metrics", None).await.text().await.unwrap();
    assert!(metrics.contains("dead_letters_total"));
}

#[tokio::test]
async fn websocket_rejects_missing_or_invalid_credentials() {
    let srv = TestServer::spawn().await;

    let anonymous = format!("ws://{}/ws", srv.addr);
    assert!(tokio_tungstenite::connect_async(anonymous.as_str()).await.is_err());
    assert!(tokio_tungstenite::connect_async(srv.ws_url("not-a-jwt").as_str()).await.is_err());
    assert_eq!(srv.services.sessions.connection_count(), 0);
}

#[tokio::test]
async fn abandoned_handshake_holds_no_session() {
    let srv = TestServer::spawn().await;
    let token = mint_jwt(UserId::new(), OrganizationId::new(), vec![Permission::DEVICE_READ]);

    // A valid upgrade request whose client hangs up before the upgrade.
    let mut raw = tokio::net::TcpStream::connect(srv.addr).await.unwrap();
    let request = format!(
        "GET /ws HTTP/1.1\r\nHost: {}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\
         Sec-WebSocket-Version: 13\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
         Authorization: Bearer {token}\r\n\r\n",
        srv.addr
    );
    raw.write_all(request.as_bytes()).await.unwrap();
    drop(raw);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(srv.services.sessions.connection_count(), 0);
    assert_eq!(srv.services.metrics.active_connections(), 0);

    // A completed handshake on the same server is still counted and released.
    let (socket, _) = tokio_tungstenite::connect_async(srv.ws_url(&token).as_str())
        .await
        .unwrap();
    let (mut tx, mut rx) = socket.split();
    assert_eq!(next_text(&mut rx).await["type"], "session.ready");
    assert_eq!(srv.services.metrics.active_connections(), 1);

    tx.send(Message::Close(None)).await.unwrap();
    for _ in 0..200 {
        if srv.services.metrics.active_connections() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(srv.services.metrics.active_connections(), 0);
}

#[tokio::test]
async fn websocket_delivers_job_events_to_authorized_subscribers() {
    let srv = TestServer::spawn().await;
    let operator = operator_token();

    let user = UserId::new();
    let org = OrganizationId::new();
    srv.services
        .directory
        .insert(ScopeRef::device("dev-1"), ResourceAcl::organization_wide(org));
    srv.services
        .data
        .upsert_device(Device {
            id: "dev-1".into(),
            organization_id: org,
            name: "incubator".into(),
            status: DeviceStatus::Offline,
            last_heartbeat_at: None,
        })
        .await
        .unwrap();

    let token = mint_jwt(user, org, vec![Permission::DEVICE_READ, Permission::ORGANIZATION_READ]);
    let (socket, _) = tokio_tungstenite::connect_async(srv.ws_url(&token).as_str())
        .await
        .unwrap();
    let (mut tx, mut rx) = socket.split();

    let ready = next_text(&mut rx).await;
    assert_eq!(ready["type"], "session.ready");
    assert_eq!(ready["user_id"], user.to_string());

    for scope in [ScopeRef::device("dev-1"), ScopeRef::organization(org)] {
        let msg = json!({"op": "subscribe", "scope": scope});
        tx.send(Message::text(msg.to_string())).await.unwrap();
        let reply = next_text(&mut rx).await;
        assert_eq!(reply["type"], "session.subscribed");
    }

    // Another organization's scope is refused and never indexed.
    let foreign = json!({"op": "subscribe", "scope": ScopeRef::organization(OrganizationId::new())});
    tx.send(Message::text(foreign.to_string())).await.unwrap();
    let reply = next_text(&mut rx).await;
    assert_eq!(reply["type"], "session.error");
    assert_eq!(reply["code"], "tenant_mismatch");

    let heartbeat = json!({
        "job": "process_device_heartbeat",
        "args": {
            "heartbeat_id": "hb-1",
            "device_id": "dev-1",
            "received_at": Utc::now(),
            "battery": 80.0,
        },
    });
    let res = srv.post("/ops/jobs", &operator, Some(heartbeat)).await;
    assert_eq!(res.status(), StatusCode::ACCEPTED);

    let mut seen = Vec::new();
    while seen.len() < 2 {
        let frame = next_text(&mut rx).await;
        seen.push(frame["type"].as_str().unwrap().to_string());
    }
    seen.sort();
    assert_eq!(seen, vec!["device.heartbeat", "device.status_changed"]);

    // Direct publication reaches the same session.
    srv.services
        .events
        .emit(ScopeRef::organization(org), "experiment.summary_ready", json!({"experiment_id": "e-1"}));
    let frame = next_text(&mut rx).await;
    assert_eq!(frame["type"], "experiment.summary_ready");
    assert_eq!(frame["payload"]["experiment_id"], "e-1");

    let connections = srv.get_json("/ops/connections", &operator).await;
    assert_eq!(connections["active"], 1);
    assert_eq!(connections["scopes"].as_array().unwrap().len(), 2);

    // Eviction closes the socket after a session.evicted frame.
    let body: Value = srv
        .post(&format!("/ops/connections/users/{user}/evict"), &operator, None)
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(body["evicted"], 1);
    let frame = next_text(&mut rx).await;
    assert_eq!(frame["type"], "session.evicted");
    assert_eq!(frame["reason"], "access_revoked");
}
