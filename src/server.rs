use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::commands;
use crate::store::UserStore;
use crate::tasks::TaskQueue;
use crate::telegram::{Notifier, Update};

/// Shared handler state, cloned per request.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<UserStore>,
    pub notifier: Arc<Notifier>,
    pub authorized_chat: String,
    pub tasks: TaskQueue,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/telegram", post(telegram_webhook))
        .route("/health", get(health))
        .route("/setup-webhook", get(setup_webhook))
        .route("/webhook-info", get(webhook_info))
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}

async fn log_request(request: Request, next: Next) -> Response {
    info!("{} {}", request.method(), request.uri().path());
    next.run(request).await
}

/// Acknowledge immediately and unconditionally. The provider retries
/// deliveries aggressively when acknowledgment is slow, so all processing
/// happens on the task queue, detached from this response. The body is
/// taken as raw bytes and parsed in the detached task; even garbage
/// payloads get a 200.
async fn telegram_webhook(State(state): State<AppState>, body: Bytes) -> StatusCode {
    let task_state = state.clone();
    state
        .tasks
        .submit(async move { process_update(task_state, body).await })
        .await;

    StatusCode::OK
}

/// Webhook processing, past the acknowledgment. Every failure path logs
/// and returns; nothing here can fail the request that spawned it.
async fn process_update(state: AppState, body: Bytes) {
    let update: Update = match serde_json::from_slice(&body) {
        Ok(update) => update,
        Err(e) => {
            warn!("Ignoring malformed webhook payload: {}", e);
            return;
        }
    };

    let Some((text, sender)) = update.message_parts() else {
        debug!("Webhook update carries no text or chat, ignoring");
        return;
    };

    if sender != state.authorized_chat {
        warn!("Ignoring message from unauthorized chat {}", sender);
        return;
    }

    info!("Received command: {}", text);
    let reply = commands::respond(&state.store, text).await;
    state.notifier.notify(&reply).await;
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let store = if state.store.is_connected() {
        "connected"
    } else {
        "not connected"
    };

    Json(json!({
        "server": "running",
        "store": store,
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn setup_webhook(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(url) = params.get("url") else {
        return (StatusCode::BAD_REQUEST, "Missing url query parameter").into_response();
    };

    match state.notifier.set_webhook(url).await {
        Ok(result) => result.to_string().into_response(),
        Err(e) => {
            error!("Failed to set webhook: {e:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to set webhook: {e:#}"),
            )
                .into_response()
        }
    }
}

async fn webhook_info(State(state): State<AppState>) -> Response {
    match state.notifier.webhook_info().await {
        Ok(info) => Json(info).into_response(),
        Err(e) => {
            error!("Failed to fetch webhook info: {e:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to fetch webhook info: {e:#}"),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreCredentials;
    use chrono::DateTime;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SEND_MESSAGE_PATH: &str = "/bottest-token/sendMessage";

    fn make_state(firestore: Option<&MockServer>, telegram: &MockServer) -> AppState {
        let store = match firestore {
            Some(server) => {
                let credentials = StoreCredentials {
                    project_id: "test-project".to_string(),
                    access_token: "test-token".to_string(),
                };
                Arc::new(UserStore::with_api_base(Some(credentials), server.uri()))
            }
            None => Arc::new(UserStore::disabled()),
        };

        AppState {
            store,
            notifier: Arc::new(Notifier::with_api_base(
                "test-token".to_string(),
                "777".to_string(),
                telegram.uri(),
            )),
            authorized_chat: "777".to_string(),
            tasks: TaskQueue::tracked(),
        }
    }

    async fn mount_telegram_ok(server: &MockServer, expected_sends: u64) {
        Mock::given(method("POST"))
            .and(path(SEND_MESSAGE_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
            .expect(expected_sends)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_unauthorized_sender_is_acked_but_never_answered() {
        let telegram = MockServer::start().await;
        mount_telegram_ok(&telegram, 0).await;

        let state = make_state(None, &telegram);
        let payload = json!({ "message": { "text": "/emails", "chat": { "id": 999 } } });

        let status =
            telegram_webhook(State(state.clone()), Bytes::from(payload.to_string())).await;
        assert_eq!(status, StatusCode::OK);

        state.tasks.drain().await;
        // The telegram mock's expect(0) verifies on drop.
    }

    #[tokio::test]
    async fn test_authorized_numeric_chat_gets_a_reply() {
        let firestore = MockServer::start().await;
        let telegram = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path(
                "/projects/test-project/databases/(default)/documents:runQuery",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&firestore)
            .await;

        Mock::given(method("POST"))
            .and(path(SEND_MESSAGE_PATH))
            .and(body_json(json!({ "chat_id": "777", "text": "No emails found." })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
            .expect(1)
            .mount(&telegram)
            .await;

        let state = make_state(Some(&firestore), &telegram);
        // Numeric chat id in the payload matches the configured string form.
        let payload = json!({ "message": { "text": "/emails", "chat": { "id": 777 } } });

        let status =
            telegram_webhook(State(state.clone()), Bytes::from(payload.to_string())).await;
        assert_eq!(status, StatusCode::OK);

        state.tasks.drain().await;
    }

    #[tokio::test]
    async fn test_malformed_and_partial_payloads_are_acked_silently() {
        let telegram = MockServer::start().await;
        mount_telegram_ok(&telegram, 0).await;

        let state = make_state(None, &telegram);

        let status =
            telegram_webhook(State(state.clone()), Bytes::from_static(b"not json")).await;
        assert_eq!(status, StatusCode::OK);

        let no_chat = json!({ "message": { "text": "/emails" } });
        let status =
            telegram_webhook(State(state.clone()), Bytes::from(no_chat.to_string())).await;
        assert_eq!(status, StatusCode::OK);

        state.tasks.drain().await;
    }

    #[tokio::test]
    async fn test_health_reports_store_state() {
        let telegram = MockServer::start().await;
        let state = make_state(None, &telegram);

        let body = health(State(state)).await.0;

        assert_eq!(body["server"], "running");
        assert_eq!(body["store"], "not connected");
        let timestamp = body["timestamp"].as_str().unwrap();
        assert!(timestamp.parse::<DateTime<Utc>>().is_ok());
    }

    #[tokio::test]
    async fn test_setup_webhook_requires_url() {
        let telegram = MockServer::start().await;
        let state = make_state(None, &telegram);

        let response = setup_webhook(State(state), Query(HashMap::new())).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_setup_webhook_registers_with_provider() {
        let telegram = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/bottest-token/setWebhook"))
            .and(body_json(json!({ "url": "https://pub.example.com/telegram" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
            .expect(1)
            .mount(&telegram)
            .await;

        let state = make_state(None, &telegram);
        let params = HashMap::from([("url".to_string(), "https://pub.example.com".to_string())]);

        let response = setup_webhook(State(state), Query(params)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_webhook_route_acks_over_http() {
        let telegram = MockServer::start().await;
        mount_telegram_ok(&telegram, 0).await;

        let state = make_state(None, &telegram);
        let tasks = state.tasks.clone();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });

        let client = reqwest::Client::new();
        let response = client
            .post(format!("http://{addr}/telegram"))
            .body("definitely not an update")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);

        let response = client
            .get(format!("http://{addr}/health"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["server"], "running");

        tasks.drain().await;
    }
}
