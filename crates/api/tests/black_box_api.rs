use std::collections::HashMap;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{Duration as ChronoDuration, Utc};
use hmac::{Hmac, Mac};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::StatusCode;
use serde_json::{Value, json};
use sha2::Sha256;

use artforge_api::app::{App, build_app};
use artforge_auth::JwtClaims;
use artforge_core::UserId;
use artforge_infra::config::AppConfig;
use artforge_infra::ledger::LedgerStore;
use artforge_ledger::RedemptionCode;

const JWT_SECRET: &str = "test-secret";
const WEBHOOK_SECRET: &str = "test-webhook-secret";

struct TestServer {
    base_url: String,
    app: App,
    handle: tokio::task::JoinHandle<()>,
    client: reqwest::Client,
}

impl TestServer {
    async fn spawn() -> Self {
        let env: HashMap<&str, &str> = [
            ("JWT_SECRET", JWT_SECRET),
            ("WEBHOOK_SECRET", WEBHOOK_SECRET),
            ("PUBLIC_BASE_URL", "https://art.example"),
            ("WORKER_POLL_MS", "20"),
        ]
        .into_iter()
        .collect();
        let config = AppConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()))
            .expect("test config");

        // Same router as prod, bound to an ephemeral port.
        let app = build_app(config).await.expect("failed to build app");
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let router = app.router.clone();
        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self {
            base_url,
            app,
            handle,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// A fresh user holding `points`, funded through a redemption code.
    async fn user_with(&self, points: u64) -> (UserId, String) {
        let user = UserId::new();
        let token = mint_jwt(user);
        if points > 0 {
            let code = format!("FUND-{}", UserId::new().to_string().replace('-', ""));
            let code = &code[..24];
            self.app
                .services
                .ledger
                .create_code(RedemptionCode::new(code, points, None, 0, Utc::now()).unwrap())
                .await
                .unwrap();
            let res = self
                .client
                .post(self.url("/credits/redeem"))
                .bearer_auth(&token)
                .json(&json!({ "code": code }))
                .send()
                .await
                .unwrap();
            assert_eq!(res.status(), StatusCode::OK);
        }
        (user, token)
    }

    async fn points(&self, token: &str) -> u64 {
        let body: Value = self
            .client
            .get(self.url("/balance"))
            .bearer_auth(token)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        body["points"].as_u64().unwrap()
    }

    async fn submit_edit(&self, token: &str) -> reqwest::Response {
        self.client
            .post(self.url("/jobs/edit"))
            .bearer_auth(token)
            .json(&json!({ "image": "https://cdn.example/in.png", "prompt": "harbor at dusk" }))
            .send()
            .await
            .unwrap()
    }

    async fn webhook(&self, body: &Value) -> reqwest::Response {
        let raw = serde_json::to_vec(body).unwrap();
        let ts = Utc::now().timestamp().to_string();
        self.client
            .post(self.url("/webhooks/edit"))
            .header("webhook-id", "msg_1")
            .header("webhook-timestamp", &ts)
            .header("webhook-signature", sign("msg_1", &ts, &raw))
            .header("content-type", "application/json")
            .body(raw)
            .send()
            .await
            .unwrap()
    }

    /// Poll the job until it reports `status`.
    async fn job_eventually(&self, token: &str, id: &str, status: &str) -> Value {
        // Webhooks are applied by the background worker.
        for _ in 0..100 {
            let res = self
                .client
                .get(self.url(&format!("/jobs/{id}")))
                .bearer_auth(token)
                .send()
                .await
                .unwrap();
            if res.status() == StatusCode::OK {
                let body: Value = res.json().await.unwrap();
                if body["status"] == status {
                    return body;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job {id} never reached {status}");
    }

    async fn works(&self, token: &str, query: &str) -> Value {
        self.client
            .get(self.url(&format!("/works{query}")))
            .bearer_auth(token)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn mint_jwt(user: UserId) -> String {
    let now = Utc::now();
    let claims = JwtClaims {
        sub: user,
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

fn sign(id: &str, ts: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(WEBHOOK_SECRET.as_bytes()).unwrap();
    mac.update(id.as_bytes());
    mac.update(b".");
    mac.update(ts.as_bytes());
    mac.update(b".");
    mac.update(body);
    format!("v1,{}", STANDARD.encode(mac.finalize().into_bytes()))
}

#[tokio::test]
async fn auth_required_for_protected_endpoints() {
    let srv = TestServer::spawn().await;

    for path in ["/whoami", "/jobs", "/works", "/balance", "/transactions"] {
        let res = srv.client.get(srv.url(path)).send().await.unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED, "{path}");
    }
    let res = srv.client.get(srv.url("/health")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn user_context_is_derived_from_token() {
    let srv = TestServer::spawn().await;
    let user = UserId::new();

    let res = srv
        .client
        .get(srv.url("/whoami"))
        .bearer_auth(mint_jwt(user))
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["user_id"].as_str().unwrap(), user.to_string());
}

#[tokio::test]
async fn submit_then_succeed_archives_a_work() {
    let srv = TestServer::spawn().await;
    let (_, token) = srv.user_with(20).await;

    let res = srv.submit_edit(&token).await;
    assert_eq!(res.status(), StatusCode::CREATED);
    let created: Value = res.json().await.unwrap();
    let id = created["id"].as_str().unwrap().to_string();
    assert_eq!(created["input"]["prompt"], "harbor at dusk");
    assert_eq!(srv.points(&token).await, 5);

    let res = srv
        .webhook(&json!({
            "id": id,
            "status": "succeeded",
            "output": ["https://provider.example/out.png"],
            "metrics": {"predict_time": 1.5},
        }))
        .await;
    assert_eq!(res.status(), StatusCode::OK);

    let job = srv.job_eventually(&token, &id, "succeeded").await;
    assert_eq!(job["type"], "edit");

    let mut works = srv.works(&token, "").await;
    for _ in 0..50 {
        if works["total"] == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        works = srv.works(&token, "").await;
    }
    assert_eq!(works["total"], 1);
    let work = &works["items"][0];
    assert_eq!(work["prediction_id"], id.as_str());
    assert_eq!(work["original_image"], "https://cdn.example/in.png");
    assert_eq!(srv.points(&token).await, 5);

    assert_eq!(srv.works(&token, "?type=avatar").await["total"], 0);
    let res = srv
        .client
        .get(srv.url("/works?type=sketch"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let work_id = work["id"].as_str().unwrap();
    let res = srv
        .client
        .delete(srv.url(&format!("/works/{work_id}")))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);
    assert_eq!(srv.works(&token, "").await["total"], 0);
}

#[tokio::test]
async fn failed_job_refunds_the_points() {
    let srv = TestServer::spawn().await;
    let (_, token) = srv.user_with(15).await;

    let created: Value = srv.submit_edit(&token).await.json().await.unwrap();
    let id = created["id"].as_str().unwrap().to_string();
    assert_eq!(srv.points(&token).await, 0);

    srv.webhook(&json!({"id": id, "status": "failed", "error": "nsfw"})).await;
    let job = srv.job_eventually(&token, &id, "failed").await;
    assert_eq!(job["error"], "nsfw");

    for _ in 0..50 {
        if srv.points(&token).await == 15 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(srv.points(&token).await, 15);

    let txs: Value = srv
        .client
        .get(srv.url("/transactions"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let kinds: Vec<&str> = txs["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["kind"].as_str().unwrap())
        .collect();
    assert!(kinds.contains(&"refund"), "{kinds:?}");
}

#[tokio::test]
async fn submit_rejections() {
    let srv = TestServer::spawn().await;
    let (_, token) = srv.user_with(5).await;

    let res = srv.submit_edit(&token).await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "insufficient_credit");

    let res = srv
        .client
        .post(srv.url("/jobs/sketch"))
        .bearer_auth(&token)
        .json(&json!({"prompt": "x"}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    // Remove-bg costs 5 but needs an image.
    let res = srv
        .client
        .post(srv.url("/jobs/remove-bg"))
        .bearer_auth(&token)
        .json(&json!({"prompt": "no image"}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert_eq!(srv.points(&token).await, 5);
}

#[tokio::test]
async fn webhook_signature_and_body_checks() {
    let srv = TestServer::spawn().await;

    // No signature headers at all.
    let res = srv
        .client
        .post(srv.url("/webhooks/edit"))
        .body(r#"{"id":"stub-1","status":"processing"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    // Wrong signature: acknowledged, never applied.
    let ts = Utc::now().timestamp().to_string();
    let res = srv
        .client
        .post(srv.url("/webhooks/edit"))
        .header("webhook-id", "msg_1")
        .header("webhook-timestamp", &ts)
        .header("webhook-signature", "v1,AAAA")
        .body(r#"{"id":"stub-1","status":"processing"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    // Correctly signed garbage.
    let raw = b"not json".to_vec();
    let res = srv
        .client
        .post(srv.url("/webhooks/edit"))
        .header("webhook-id", "msg_2")
        .header("webhook-timestamp", &ts)
        .header("webhook-signature", sign("msg_2", &ts, &raw))
        .body(raw)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    // Unknown job ids are acknowledged.
    let res = srv.webhook(&json!({"id": "nobody", "status": "succeeded"})).await;
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn jobs_and_works_are_private_to_their_owner() {
    let srv = TestServer::spawn().await;
    let (_, alice) = srv.user_with(15).await;
    let (_, bob) = srv.user_with(0).await;

    let created: Value = srv.submit_edit(&alice).await.json().await.unwrap();
    let id = created["id"].as_str().unwrap().to_string();

    let res = srv
        .client
        .get(srv.url(&format!("/jobs/{id}")))
        .bearer_auth(&bob)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let bobs_jobs: Value = srv
        .client
        .get(srv.url("/jobs"))
        .bearer_auth(&bob)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(bobs_jobs["total"], 0);

    srv.webhook(&json!({
        "id": id,
        "status": "succeeded",
        "output": ["https://provider.example/out.png"],
    }))
    .await;
    srv.job_eventually(&alice, &id, "succeeded").await;

    let mut alices = srv.works(&alice, "").await;
    for _ in 0..50 {
        if alices["total"] == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        alices = srv.works(&alice, "").await;
    }
    assert_eq!(alices["total"], 1);
    assert_eq!(srv.works(&bob, "").await["total"], 0);

    let work_id = alices["items"][0]["id"].as_str().unwrap();
    let res = srv
        .client
        .delete(srv.url(&format!("/works/{work_id}")))
        .bearer_auth(&bob)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn stream_delivers_snapshot_then_terminal_status() {
    let srv = TestServer::spawn().await;
    let (_, token) = srv.user_with(15).await;

    let created: Value = srv.submit_edit(&token).await.json().await.unwrap();
    let id = created["id"].as_str().unwrap().to_string();

    let mut res = srv
        .client
        .get(srv.url(&format!("/jobs/{id}/stream")))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let mut seen = String::new();
    let first = tokio::time::timeout(Duration::from_secs(5), res.chunk())
        .await
        .expect("no snapshot")
        .unwrap()
        .expect("stream closed early");
    seen.push_str(&String::from_utf8_lossy(&first));
    assert!(seen.contains("event: status"), "{seen}");
    assert!(seen.contains("starting"), "{seen}");

    srv.webhook(&json!({"id": id, "status": "failed", "error": "boom"})).await;

    // The stream ends after the terminal event.
    let rest = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(chunk) = res.chunk().await.unwrap() {
            seen.push_str(&String::from_utf8_lossy(&chunk));
        }
    })
    .await;
    assert!(rest.is_ok(), "stream did not close: {seen}");
    assert!(seen.contains("failed"), "{seen}");
}
