//! Twilio webhook server.
//!
//! `/message` and `/call` sit behind [`validate_twilio_request`], which rejects
//! requests whose `X-Twilio-Signature` does not match the configured auth
//! token. `/`, `/health` and `/metrics` are open.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{header, request::Parts, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::error::RelayError;
use crate::metrics::Metrics;
use crate::relay::{Relay, RelayReport};
use crate::twilio::{self, WebhookPayload};
use crate::VERSION;

const MAX_BODY_BYTES: usize = 64 * 1024;

const EMPTY_RESPONSE: &str = r#"<?xml version="1.0" encoding="UTF-8"?><Response></Response>"#;
const REJECT_RESPONSE: &str =
    r#"<?xml version="1.0" encoding="UTF-8"?><Response><Reject/></Response>"#;

#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
    pub metrics: Metrics,
    /// Twilio auth token; empty disables validation
    pub auth_token: Arc<str>,
    /// Externally visible base URL, when behind a proxy
    pub public_url: Option<Arc<str>>,
}

pub fn router(state: AppState) -> Router {
    let hooks = Router::new()
        .route("/message", post(message))
        .route("/call", post(call))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            validate_twilio_request,
        ));

    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .merge(hooks)
        .with_state(state)
}

/// Bind and serve until SIGINT or SIGTERM.
pub async fn serve(state: AppState, addr: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;
    info!("Webhook server listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(crate::shutdown_signal())
        .await
        .context("Webhook server error")?;

    info!("Webhook server stopped");
    Ok(())
}

/// Reject requests that do not carry a valid Twilio signature.
pub async fn validate_twilio_request(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, RelayError> {
    let (parts, body) = request.into_parts();
    let bytes = to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| RelayError::ParseFailed(format!("unreadable body: {e}")))?;

    let fields: Vec<(String, String)> = url::form_urlencoded::parse(&bytes).into_owned().collect();
    let url = request_url(&parts, state.public_url.as_deref());
    let signature = parts
        .headers
        .get(twilio::SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if !twilio::validate_request(&url, &fields, signature, &state.auth_token) {
        warn!("Rejected webhook with invalid signature for {}", url);
        state.metrics.rejected.inc();
        return Err(RelayError::ValidationFailed);
    }

    debug!("Webhook signature valid for {}", url);
    Ok(next.run(Request::from_parts(parts, Body::from(bytes))).await)
}

/// Rebuild the URL Twilio signed.
fn request_url(parts: &Parts, public_url: Option<&str>) -> String {
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");

    if let Some(base) = public_url {
        return format!("{}{}", base.trim_end_matches('/'), path_and_query);
    }

    let header_value = |name: &str| {
        parts
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let scheme = header_value("x-forwarded-proto").unwrap_or_else(|| "http".to_string());
    let host = header_value(header::HOST.as_str())
        .or_else(|| parts.uri.authority().map(|a| a.to_string()))
        .unwrap_or_else(|| "localhost".to_string());

    format!("{scheme}://{host}{path_and_query}")
}

async fn index() -> String {
    format!("smsbot v{}", VERSION)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let registry = state.relay.registry();
    Json(json!({
        "version": VERSION,
        "owners": registry.owners(),
        "subscribers": registry.list().await,
    }))
}

async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.encode() {
        Ok(text) => text.into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {:#}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn message(
    State(state): State<AppState>,
    Form(fields): Form<HashMap<String, String>>,
) -> Result<Response, RelayError> {
    let _timer = state.metrics.request_time.start_timer();
    let payload = parse_payload(&state, "/message", &fields)?;

    info!("Received SMS from {}", payload.from_number());
    debug!("{}", payload);
    dispatch(&state, &payload).await;
    state.metrics.messages.inc();

    Ok(twiml(EMPTY_RESPONSE))
}

async fn call(
    State(state): State<AppState>,
    Form(fields): Form<HashMap<String, String>>,
) -> Result<Response, RelayError> {
    let _timer = state.metrics.request_time.start_timer();
    let payload = parse_payload(&state, "/call", &fields)?;

    info!("Received call from {}, rejecting", payload.from_number());
    dispatch(&state, &payload).await;
    state.metrics.calls.inc();

    // Calls are always rejected
    Ok(twiml(REJECT_RESPONSE))
}

fn parse_payload(
    state: &AppState,
    route: &str,
    fields: &HashMap<String, String>,
) -> Result<WebhookPayload, RelayError> {
    WebhookPayload::parse(fields).map_err(|e| {
        warn!("{} on {}", e, route);
        let relay = state.relay.clone();
        let notice = format!("smsbot received an unrecognised webhook on {route}");
        tokio::spawn(async move {
            relay.notify_owners(&notice).await;
        });
        e
    })
}

async fn dispatch(state: &AppState, payload: &WebhookPayload) {
    let RelayReport { delivered, failed } = state.relay.relay(payload).await;
    state.metrics.send_failures.inc_by(failed as u64);
    if failed > 0 {
        warn!("Relayed to {} subscriber(s), {} failed", delivered, failed);
    } else {
        debug!("Relayed to {} subscriber(s)", delivered);
    }
}

fn twiml(body: &'static str) -> Response {
    ([(header::CONTENT_TYPE, "text/xml")], body).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{Method, Request as HttpRequest};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::relay::tests::RecordingNotifier;
    use crate::subscribers::SubscriberRegistry;

    const SECRET: &str = "twilio-secret";

    struct TestApp {
        state: AppState,
        notifier: Arc<RecordingNotifier>,
    }

    impl TestApp {
        fn new(auth_token: &str, public_url: Option<&str>) -> Self {
            let registry = Arc::new(SubscriberRegistry::new(vec![900], vec![1, 2]));
            let notifier = Arc::new(RecordingNotifier::default());
            let state = AppState {
                relay: Arc::new(Relay::new(registry, notifier.clone())),
                metrics: Metrics::new().unwrap(),
                auth_token: Arc::from(auth_token),
                public_url: public_url.map(Arc::from),
            };
            Self { state, notifier }
        }

        async fn send(&self, request: Request) -> Response {
            router(self.state.clone()).oneshot(request).await.unwrap()
        }

        async fn sent(&self) -> Vec<(i64, String)> {
            self.notifier.sent.lock().await.clone()
        }
    }

    fn encode(fields: &[(&str, &str)]) -> (Vec<(String, String)>, String) {
        let owned: Vec<(String, String)> = fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(owned.iter())
            .finish();
        (owned, body)
    }

    fn signed_post(path: &str, fields: &[(&str, &str)], signed_url: &str) -> Request {
        let (owned, body) = encode(fields);
        let signature = twilio::compute_signature(SECRET, signed_url, &owned);
        HttpRequest::builder()
            .method(Method::POST)
            .uri(path)
            .header(header::HOST, "example.com")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(twilio::SIGNATURE_HEADER, signature)
            .body(Body::from(body))
            .unwrap()
    }

    async fn body_string(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    const SMS: &[(&str, &str)] = &[
        ("From", "+15551234567"),
        ("Body", "hi"),
        ("SmsMessageSid", "SM1"),
    ];

    #[tokio::test]
    async fn test_signed_message_relayed_to_each_subscriber() {
        let app = TestApp::new(SECRET, None);
        let response = app
            .send(signed_post("/message", SMS, "http://example.com/message"))
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/xml");
        assert_eq!(body_string(response).await, EMPTY_RESPONSE);

        let sent = app.sent().await;
        assert_eq!(sent.len(), 2);
        let mut recipients: Vec<_> = sent.iter().map(|(r, _)| *r).collect();
        recipients.sort();
        assert_eq!(recipients, vec![1, 2]);
        for (_, text) in &sent {
            assert!(text.contains("+15551234567"));
            assert!(text.contains("hi"));
        }
        assert_eq!(app.state.metrics.messages.get(), 1);
    }

    #[tokio::test]
    async fn test_bad_signature_is_forbidden() {
        let app = TestApp::new(SECRET, None);
        let response = app
            .send(signed_post("/message", SMS, "http://example.com/other"))
            .await;

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(app.sent().await.is_empty());
        assert_eq!(app.state.metrics.rejected.get(), 1);
    }

    #[tokio::test]
    async fn test_missing_signature_is_forbidden() {
        let app = TestApp::new(SECRET, None);
        let (_, body) = encode(SMS);
        let request = HttpRequest::builder()
            .method(Method::POST)
            .uri("/call")
            .header(header::HOST, "example.com")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body))
            .unwrap();

        assert_eq!(app.send(request).await.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_no_secret_skips_validation() {
        let app = TestApp::new("", None);
        let (_, body) = encode(SMS);
        let request = HttpRequest::builder()
            .method(Method::POST)
            .uri("/message")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(twilio::SIGNATURE_HEADER, "not-a-signature")
            .body(Body::from(body))
            .unwrap();

        assert_eq!(app.send(request).await.status(), StatusCode::OK);
        assert_eq!(app.sent().await.len(), 2);
    }

    #[tokio::test]
    async fn test_public_url_used_for_signature() {
        let app = TestApp::new(SECRET, Some("https://sms.example.org/"));
        let response = app
            .send(signed_post("/message", SMS, "https://sms.example.org/message"))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_call_is_rejected() {
        let app = TestApp::new(SECRET, None);
        let fields = &[("CallSid", "CA1"), ("From", "+15557654321"), ("To", "+15550000000")];
        let response = app
            .send(signed_post("/call", fields, "http://example.com/call"))
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, REJECT_RESPONSE);
        let sent = app.sent().await;
        assert_eq!(sent.len(), 2);
        assert!(sent[0].1.contains("Call From"));
        assert_eq!(app.state.metrics.calls.get(), 1);
    }

    #[tokio::test]
    async fn test_unrecognised_payload_is_bad_request() {
        let app = TestApp::new(SECRET, None);
        let fields = &[("From", "+1"), ("Body", "no sid")];
        let response = app
            .send(signed_post("/message", fields, "http://example.com/message"))
            .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        // Owner notice is sent from a spawned task
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let sent = app.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 900);
    }

    #[tokio::test]
    async fn test_health() {
        let app = TestApp::new(SECRET, None);
        let request = HttpRequest::builder().uri("/health").body(Body::empty()).unwrap();
        let response = app.send(request).await;

        assert_eq!(response.status(), StatusCode::OK);
        let value: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(value["version"], VERSION);
        assert_eq!(value["owners"], json!([900]));
        assert_eq!(value["subscribers"], json!([1, 2]));
    }

    #[tokio::test]
    async fn test_index_and_metrics() {
        let app = TestApp::new(SECRET, None);

        let request = HttpRequest::builder().uri("/").body(Body::empty()).unwrap();
        let body = body_string(app.send(request).await).await;
        assert_eq!(body, format!("smsbot v{}", VERSION));

        let request = HttpRequest::builder().uri("/metrics").body(Body::empty()).unwrap();
        let body = body_string(app.send(request).await).await;
        assert!(body.contains("webhook_message_count"));
    }

    #[test]
    fn test_request_url_from_headers() {
        let request = HttpRequest::builder()
            .uri("/message?x=1")
            .header(header::HOST, "relay.local:8080")
            .header("x-forwarded-proto", "https")
            .body(Body::empty())
            .unwrap();
        let (parts, _) = request.into_parts();
        assert_eq!(request_url(&parts, None), "https://relay.local:8080/message?x=1");
        assert_eq!(
            request_url(&parts, Some("https://public.example")),
            "https://public.example/message?x=1"
        );
    }
}
