//! HTTP API server: provider webhooks, the CRM event inbox, operator actions,
//! and the stored-media route.
//!
//! Webhook routes are never gated (providers and the CRM cannot send our
//! bearer token). Everything under `/api/` is.

use crate::gateway::{Relay, SendRequest};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use zaprelay_channels::{
    qr::qr_data_url,
    storage::{is_safe_file_name, mime_for_file},
};
use zaprelay_core::{
    config::ApiConfig,
    error::RelayError,
    model::{MessageKind, ProviderKind},
};

type ApiError = (StatusCode, Json<Value>);

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    relay: Arc<Relay>,
    api_key: Option<String>,
    media_dir: PathBuf,
}

/// Constant-time string comparison to prevent timing attacks on API token validation.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// Check bearer token auth. Returns `None` if authorized, `Some(response)` if rejected.
fn check_auth(headers: &HeaderMap, api_key: &Option<String>) -> Option<ApiError> {
    let key = api_key.as_ref()?;

    let Some(header) = headers.get("authorization") else {
        return Some((
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "missing Authorization header"})),
        ));
    };

    let Ok(value) = header.to_str() else {
        return Some((
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "invalid Authorization header"})),
        ));
    };

    let token = value.strip_prefix("Bearer ").unwrap_or("");
    if !constant_time_eq(token, key) {
        return Some((
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "invalid token"})),
        ));
    }

    None
}

/// Map a relay error onto an HTTP status.
fn error_response(e: RelayError) -> ApiError {
    let status = match &e {
        RelayError::NotFound(_) => StatusCode::NOT_FOUND,
        RelayError::Conflict(_) => StatusCode::CONFLICT,
        RelayError::Config(_) | RelayError::Flow(_) => StatusCode::BAD_REQUEST,
        RelayError::Channel(_)
        | RelayError::Crm(_)
        | RelayError::CrmAuth(_)
        | RelayError::Provider(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!("api: {e}");
    }
    (status, Json(json!({"error": e.to_string()})))
}

fn bad_request(msg: impl std::fmt::Display) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": format!("invalid request: {msg}")})),
    )
}

/// Decode an optional JSON body; an empty body yields the type's default.
fn optional_json<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(bad_request)
}

fn required_json<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(bad_request)
}

// ---------------------------------------------------------------------------
// CRM webhook body decoding
// ---------------------------------------------------------------------------

/// Decode a CRM webhook body: JSON when it looks like JSON, otherwise
/// `application/x-www-form-urlencoded` with bracketed keys.
fn decode_crm_body(headers: &HeaderMap, body: &Bytes) -> Result<Value, String> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let text = std::str::from_utf8(body).map_err(|e| format!("body is not UTF-8: {e}"))?;

    if content_type.contains("json") || text.trim_start().starts_with('{') {
        return serde_json::from_str(text).map_err(|e| format!("invalid JSON: {e}"));
    }
    Ok(parse_form(text))
}

/// Parse a form body into nested JSON.
///
/// `data[MESSAGES][0][message][text]=hi` becomes
/// `{"data": {"MESSAGES": [{"message": {"text": "hi"}}]}}`. Objects whose keys
/// are exactly `0..n` become arrays.
fn parse_form(body: &str) -> Value {
    let mut root = Map::new();
    for pair in body.split('&').filter(|p| !p.is_empty()) {
        let (raw_key, raw_value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = form_decode(raw_key);
        let value = form_decode(raw_value);
        let path = key_path(&key);
        if path.is_empty() {
            continue;
        }
        insert_path(&mut root, &path, value);
    }
    let mut value = Value::Object(root);
    arrayify(&mut value);
    value
}

fn form_decode(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => spaced,
    }
}

/// `a[b][c]` -> `["a", "b", "c"]`.
fn key_path(key: &str) -> Vec<String> {
    let Some(open) = key.find('[') else {
        return vec![key.to_string()];
    };
    let mut path = vec![key[..open].to_string()];
    let mut rest = &key[open..];
    while let Some(stripped) = rest.strip_prefix('[') {
        match stripped.find(']') {
            Some(close) => {
                path.push(stripped[..close].to_string());
                rest = &stripped[close + 1..];
            }
            None => break,
        }
    }
    path
}

fn insert_path(map: &mut Map<String, Value>, path: &[String], value: String) {
    let (head, tail) = (&path[0], &path[1..]);
    if tail.is_empty() {
        map.insert(head.clone(), Value::String(value));
        return;
    }
    let entry = map
        .entry(head.clone())
        .or_insert_with(|| Value::Object(Map::new()));
    if !entry.is_object() {
        *entry = Value::Object(Map::new());
    }
    if let Value::Object(child) = entry {
        insert_path(child, tail, value);
    }
}

fn arrayify(value: &mut Value) {
    let Value::Object(map) = value else {
        return;
    };
    for child in map.values_mut() {
        arrayify(child);
    }
    let sequential = !map.is_empty()
        && (0..map.len()).all(|i| map.contains_key(&i.to_string()));
    if sequential {
        let items = (0..map.len())
            .filter_map(|i| map.remove(&i.to_string()))
            .collect();
        *value = Value::Array(items);
    }
}

/// Event name of a CRM callback. Settings-page callbacks carry `PLACEMENT`
/// instead of `event`.
fn crm_event_type(payload: &Value) -> String {
    if let Some(event) = payload.get("event").and_then(Value::as_str) {
        if !event.trim().is_empty() {
            return event.trim().to_string();
        }
    }
    if let Some(placement) = payload.get("PLACEMENT").and_then(Value::as_str) {
        if placement.starts_with("SETTING_CONNECTOR") {
            return placement.to_string();
        }
        return "PLACEMENT".to_string();
    }
    "UNKNOWN".to_string()
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /api/health`: uptime plus queue and failure counts.
async fn health(
    headers: HeaderMap,
    State(state): State<ApiState>,
) -> Result<Json<Value>, ApiError> {
    if let Some(err) = check_auth(&headers, &state.api_key) {
        return Err(err);
    }
    let store = state.relay.store();
    let queue = store.queue_counts().await.map_err(error_response)?;
    let failures = state.relay.failures().count().await.map_err(error_response)?;
    let instances: Map<String, Value> = store
        .count_instances_by_status()
        .await
        .map_err(error_response)?
        .into_iter()
        .map(|(status, n)| (status, json!(n)))
        .collect();

    Ok(Json(json!({
        "status": "ok",
        "uptime_secs": state.relay.uptime().elapsed().as_secs(),
        "instances": instances,
        "queue": {
            "pending": queue.pending,
            "processing": queue.processing,
            "done": queue.done,
            "failed": queue.failed,
        },
        "side_effect_failures": failures,
    })))
}

async fn provider_webhook(
    state: &ApiState,
    kind: ProviderKind,
    instance_id: &str,
    body: &Bytes,
) -> Result<Json<Value>, ApiError> {
    let payload: Value = required_json(body)?;
    let summary = state
        .relay
        .handle_provider_webhook(kind, instance_id, &payload)
        .await
        .map_err(error_response)?;
    let mut response = json!({"success": true});
    if let (Value::Object(out), Ok(Value::Object(fields))) =
        (&mut response, serde_json::to_value(&summary))
    {
        out.extend(fields);
    }
    Ok(Json(response))
}

/// `POST /webhooks/gateway/{instance_id}`
async fn gateway_webhook(
    State(state): State<ApiState>,
    Path(instance_id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    provider_webhook(&state, ProviderKind::Gateway, &instance_id, &body).await
}

/// `POST /webhooks/aggregator/{instance_id}`
async fn aggregator_webhook(
    State(state): State<ApiState>,
    Path(instance_id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    provider_webhook(&state, ProviderKind::Aggregator, &instance_id, &body).await
}

/// `POST /webhooks/crm/{tenant_id}`: enqueue and acknowledge.
///
/// The CRM expects a fast answer, so nothing here waits on processing. With
/// `process_on_enqueue` a worker pass for the new entry is spawned after the
/// entry is durable.
async fn crm_webhook(
    headers: HeaderMap,
    State(state): State<ApiState>,
    Path(tenant_id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let payload = decode_crm_body(&headers, &body).map_err(bad_request)?;
    let event_type = crm_event_type(&payload);
    let queue = state.relay.queue_config().clone();

    let event_id = state
        .relay
        .store()
        .enqueue_event(&tenant_id, &event_type, &payload, queue.max_attempts)
        .await
        .map_err(error_response)?;
    info!("crm webhook: {event_type} for tenant {tenant_id} queued as {event_id}");

    if queue.process_on_enqueue {
        let relay = state.relay.clone();
        let id = event_id.clone();
        tokio::spawn(async move {
            if let Err(e) = relay.process_batch(queue.batch_size, Some(&id)).await {
                warn!("crm webhook: worker pass after {id} failed: {e}");
            }
        });
    }

    Ok(Json(json!({"success": true, "event_id": event_id})))
}

#[derive(Debug, Default, Deserialize)]
struct ProcessRequest {
    event_id: Option<String>,
    limit: Option<usize>,
}

/// `POST /api/queue/process`: run one worker pass now.
async fn process_queue(
    headers: HeaderMap,
    State(state): State<ApiState>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    if let Some(err) = check_auth(&headers, &state.api_key) {
        return Err(err);
    }
    let request: ProcessRequest = optional_json(&body)?;
    let limit = request
        .limit
        .unwrap_or(state.relay.queue_config().batch_size);
    let processed = state
        .relay
        .process_batch(limit, request.event_id.as_deref())
        .await
        .map_err(error_response)?;
    Ok(Json(json!({"success": true, "processed": processed})))
}

#[derive(Debug, Deserialize)]
struct SendMessageRequest {
    instance_id: String,
    #[serde(default)]
    phone_number: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    message_type: Option<String>,
    #[serde(default)]
    media_url: Option<String>,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    contact_id: Option<String>,
}

/// `POST /api/messages/send`
async fn send_message(
    headers: HeaderMap,
    State(state): State<ApiState>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    if let Some(err) = check_auth(&headers, &state.api_key) {
        return Err(err);
    }
    let request: SendMessageRequest = required_json(&body)?;
    if request.message.trim().is_empty() && request.media_url.is_none() {
        return Err(bad_request("message or media_url is required"));
    }

    let mut phone = request.phone_number;
    if phone.trim().is_empty() {
        if let Some(contact_id) = &request.contact_id {
            phone = state
                .relay
                .store()
                .get_contact(contact_id)
                .await
                .map_err(error_response)?
                .phone;
        }
    }

    let record = state
        .relay
        .send_api_message(SendRequest {
            instance_id: request.instance_id,
            phone,
            text: request.message,
            kind: request
                .message_type
                .as_deref()
                .map(MessageKind::parse_lenient)
                .unwrap_or_default(),
            media_url: request.media_url,
            conversation_id: request.conversation_id,
        })
        .await
        .map_err(error_response)?;

    Ok(Json(json!({
        "success": true,
        "message_id": record.id,
        "conversation_id": record.conversation_id,
        "provider_message_id": record.provider_message_id,
    })))
}

#[derive(Debug, Default, Deserialize)]
struct TakeoverRequest {
    operator: Option<String>,
}

/// `POST /api/conversations/{id}/takeover`
async fn takeover(
    headers: HeaderMap,
    State(state): State<ApiState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    if let Some(err) = check_auth(&headers, &state.api_key) {
        return Err(err);
    }
    let request: TakeoverRequest = optional_json(&body)?;
    let conversation = state
        .relay
        .take_over(&id, request.operator)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({"success": true, "conversation": conversation})))
}

/// `POST /api/conversations/{id}/release`
async fn release(
    headers: HeaderMap,
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if let Some(err) = check_auth(&headers, &state.api_key) {
        return Err(err);
    }
    let conversation = state.relay.release(&id).await.map_err(error_response)?;
    Ok(Json(json!({"success": true, "conversation": conversation})))
}

/// `POST /api/conversations/{id}/read`
async fn mark_read(
    headers: HeaderMap,
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if let Some(err) = check_auth(&headers, &state.api_key) {
        return Err(err);
    }
    state.relay.mark_read(&id).await.map_err(error_response)?;
    Ok(Json(json!({"success": true})))
}

#[derive(Debug, Deserialize)]
struct MappingRequest {
    tenant_id: String,
    instance_id: String,
    line_id: i64,
}

/// `POST /api/channel-mappings`
async fn create_mapping(
    headers: HeaderMap,
    State(state): State<ApiState>,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if let Some(err) = check_auth(&headers, &state.api_key) {
        return Err(err);
    }
    let request: MappingRequest = required_json(&body)?;
    let mapping = state
        .relay
        .create_mapping(&request.tenant_id, &request.instance_id, request.line_id)
        .await
        .map_err(error_response)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({"success": true, "mapping": mapping})),
    ))
}

/// `POST /api/integrations/{id}/register-connector`
async fn register_connector(
    headers: HeaderMap,
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if let Some(err) = check_auth(&headers, &state.api_key) {
        return Err(err);
    }
    let integration = state
        .relay
        .register_connector(&id)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({
        "success": true,
        "integration_id": integration.id,
        "connector_registered": integration.config.connector_registered,
        "activated_lines": integration.config.activated_lines,
    })))
}

/// `GET /api/instances/{id}/qr`: pending pairing QR as a PNG data URL.
async fn instance_qr(
    headers: HeaderMap,
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if let Some(err) = check_auth(&headers, &state.api_key) {
        return Err(err);
    }
    let instance = state
        .relay
        .store()
        .get_instance(&id)
        .await
        .map_err(error_response)?;
    let qr = match state.relay.instance_qr(&id).await.map_err(error_response)? {
        Some(code) => Some(qr_data_url(&code).map_err(error_response)?),
        None => None,
    };
    Ok(Json(json!({
        "instance_id": instance.id,
        "status": instance.status.as_str(),
        "qr": qr,
    })))
}

/// `GET /media/{file}`: files written by the media store.
async fn media(
    State(state): State<ApiState>,
    Path(file): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if !is_safe_file_name(&file) {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid file name"})),
        ));
    }
    let bytes = tokio::fs::read(state.media_dir.join(&file))
        .await
        .map_err(|e| {
            debug!("media: {file} not readable: {e}");
            (StatusCode::NOT_FOUND, Json(json!({"error": "not found"})))
        })?;
    Ok(([(header::CONTENT_TYPE, mime_for_file(&file))], bytes))
}

/// Build the router with all routes.
fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/webhooks/gateway/{instance_id}", post(gateway_webhook))
        .route("/webhooks/aggregator/{instance_id}", post(aggregator_webhook))
        .route("/webhooks/crm/{tenant_id}", post(crm_webhook))
        .route("/api/health", get(health))
        .route("/api/queue/process", post(process_queue))
        .route("/api/messages/send", post(send_message))
        .route("/api/conversations/{id}/takeover", post(takeover))
        .route("/api/conversations/{id}/release", post(release))
        .route("/api/conversations/{id}/read", post(mark_read))
        .route("/api/channel-mappings", post(create_mapping))
        .route(
            "/api/integrations/{id}/register-connector",
            post(register_connector),
        )
        .route("/api/instances/{id}/qr", get(instance_qr))
        .route("/media/{file}", get(media))
        .layer(axum::extract::DefaultBodyLimit::max(8 * 1024 * 1024))
        .with_state(state)
}

/// Start the API server. Returns when the listener fails or the server exits.
pub async fn serve(config: ApiConfig, relay: Arc<Relay>, media_dir: PathBuf) {
    let api_key = if config.api_key.is_empty() {
        None
    } else {
        Some(config.api_key.clone())
    };
    if api_key.is_none() {
        warn!("API key is empty: /api/* routes are unauthenticated");
    }

    let state = ApiState {
        relay,
        api_key,
        media_dir,
    };
    let app = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("API server failed to bind {addr}: {e}");
            return;
        }
    };

    info!("API server listening on {addr}");
    if let Err(e) = axum::serve(listener, app).await {
        error!("API server error: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::RelayParts;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::sync::Mutex;
    use tower::ServiceExt;
    use zaprelay_channels::gateway::parse_gateway_webhook;
    use zaprelay_core::{
        config::{FlowConfig, QueueConfig},
        message::{InboundEvent, MediaRef, OutgoingMessage, SendReceipt},
        model::{Instance, InstanceConfig, InstanceStatus, Integration, QueueStatus},
        traits::{CrmApi, CrmChatRef, CrmInbound, CrmReceipt, MediaStorage, MessagingProvider},
    };
    use zaprelay_store::Store;

    // -----------------------------------------------------------------------
    // Mocks
    // -----------------------------------------------------------------------

    #[derive(Default)]
    struct MockGateway {
        sent: Mutex<Vec<OutgoingMessage>>,
    }

    #[async_trait]
    impl MessagingProvider for MockGateway {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Gateway
        }

        fn parse_webhook(&self, body: &Value) -> Vec<InboundEvent> {
            parse_gateway_webhook(body)
        }

        async fn send(
            &self,
            _instance: &Instance,
            message: &OutgoingMessage,
        ) -> Result<SendReceipt, RelayError> {
            let mut sent = self.sent.lock().unwrap();
            sent.push(message.clone());
            Ok(SendReceipt {
                provider_message_id: Some(format!("WA{}", sent.len())),
            })
        }

        async fn fetch_media(
            &self,
            _instance: &Instance,
            _media: &MediaRef,
        ) -> Result<Vec<u8>, RelayError> {
            Err(RelayError::Channel("no media in tests".into()))
        }
    }

    struct OfflineCrm;

    #[async_trait]
    impl CrmApi for OfflineCrm {
        async fn forward_inbound(
            &self,
            _integration: &Integration,
            _message: &CrmInbound,
        ) -> Result<CrmChatRef, RelayError> {
            Err(RelayError::Crm("offline".into()))
        }

        async fn send_receipt(
            &self,
            _integration: &Integration,
            _receipt: &CrmReceipt,
        ) -> Result<(), RelayError> {
            Err(RelayError::Crm("offline".into()))
        }

        async fn register_connector(&self, _integration: &Integration) -> Result<(), RelayError> {
            Err(RelayError::Crm("offline".into()))
        }

        async fn set_line_active(
            &self,
            _integration: &Integration,
            _line_id: i64,
            _active: bool,
        ) -> Result<(), RelayError> {
            Err(RelayError::Crm("offline".into()))
        }

        async fn rebind_events(&self, _integration: &Integration) -> Result<usize, RelayError> {
            Err(RelayError::Crm("offline".into()))
        }
    }

    struct NoMedia;

    #[async_trait]
    impl MediaStorage for NoMedia {
        async fn store(&self, _bytes: &[u8], _mime_type: &str) -> Result<String, RelayError> {
            Err(RelayError::Io(std::io::Error::other("read-only")))
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    struct TestApi {
        router: Router,
        relay: Arc<Relay>,
        gateway: Arc<MockGateway>,
        instance: Instance,
        _media: tempfile::TempDir,
    }

    async fn test_api(api_key: Option<&str>) -> TestApi {
        let store = Store::in_memory().await.unwrap();
        let instance = store
            .create_instance("t1", "loja", ProviderKind::Gateway, &InstanceConfig::default())
            .await
            .unwrap();
        let gateway = Arc::new(MockGateway::default());
        let relay = Arc::new(Relay::new(RelayParts {
            store,
            providers: vec![gateway.clone() as Arc<dyn MessagingProvider>],
            responder: None,
            classifier: None,
            transcriber: None,
            media: Arc::new(NoMedia),
            crm: Arc::new(OfflineCrm),
            flows: FlowConfig::default(),
            queue: QueueConfig {
                process_on_enqueue: false,
                ..Default::default()
            },
            system_prompt: String::new(),
        }));
        let media = tempfile::tempdir().unwrap();
        let state = ApiState {
            relay: relay.clone(),
            api_key: api_key.map(String::from),
            media_dir: media.path().to_path_buf(),
        };
        TestApi {
            router: build_router(state),
            relay,
            gateway,
            instance,
            _media: media,
        }
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    // -----------------------------------------------------------------------
    // Form decoding
    // -----------------------------------------------------------------------

    #[test]
    fn test_parse_form_nested_arrays() {
        let body = "event=ONIMCONNECTORMESSAGEADD\
            &data%5BCONNECTOR%5D=zaprelay\
            &data%5BLINE%5D=7\
            &data%5BMESSAGES%5D%5B0%5D%5Bmessage%5D%5Btext%5D=ol%C3%A1+mundo\
            &data%5BMESSAGES%5D%5B0%5D%5Bchat%5D%5Bid%5D=5511999887766";
        let value = parse_form(body);
        assert_eq!(value["event"], "ONIMCONNECTORMESSAGEADD");
        assert_eq!(value["data"]["LINE"], "7");
        let messages = value["data"]["MESSAGES"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["message"]["text"], "olá mundo");
        assert_eq!(messages[0]["chat"]["id"], "5511999887766");
    }

    #[test]
    fn test_parse_form_sparse_numeric_keys_stay_object() {
        let value = parse_form("a[1]=x&a[2]=y");
        assert!(value["a"].is_object());
        assert_eq!(value["a"]["2"], "y");
    }

    #[test]
    fn test_key_path() {
        assert_eq!(key_path("plain"), vec!["plain"]);
        assert_eq!(key_path("a[b][0]"), vec!["a", "b", "0"]);
        assert_eq!(key_path("a[b"), vec!["a"]);
    }

    #[test]
    fn test_crm_event_type() {
        assert_eq!(crm_event_type(&json!({"event": "ONIMCONNECTORMESSAGEADD"})), "ONIMCONNECTORMESSAGEADD");
        assert_eq!(
            crm_event_type(&json!({"PLACEMENT": "SETTING_CONNECTOR", "PLACEMENT_OPTIONS": "{}"})),
            "SETTING_CONNECTOR"
        );
        assert_eq!(crm_event_type(&json!({"PLACEMENT": "DEFAULT"})), "PLACEMENT");
        assert_eq!(crm_event_type(&json!({})), "UNKNOWN");
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("secret", "secret"));
        assert!(!constant_time_eq("secret", "secreT"));
        assert!(!constant_time_eq("short", "longer"));
    }

    // -----------------------------------------------------------------------
    // Routes
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_health_requires_token() {
        let api = test_api(Some("tok")).await;

        let req = Request::get("/api/health").body(Body::empty()).unwrap();
        let resp = api.router.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let req = Request::get("/api/health")
            .header("authorization", "Bearer tok")
            .body(Body::empty())
            .unwrap();
        let resp = api.router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["queue"]["pending"], 0);
        assert_eq!(json["instances"]["qr_pending"], 1);
    }

    #[tokio::test]
    async fn test_webhooks_are_not_gated() {
        let api = test_api(Some("tok")).await;
        let uri = format!("/webhooks/gateway/{}", api.instance.id);
        let body = json!({
            "event": "messages.upsert",
            "data": {
                "key": {"remoteJid": "5511999887766@s.whatsapp.net", "fromMe": false, "id": "M1"},
                "pushName": "Ana",
                "message": {"conversation": "oi"}
            }
        });

        let resp = api.router.clone().oneshot(post_json(&uri, body.clone())).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["messages"], 1);

        // Redelivery is acknowledged but not stored twice.
        let resp = api.router.oneshot(post_json(&uri, body)).await.unwrap();
        let json = body_json(resp).await;
        assert_eq!(json["messages"], 0);
        assert_eq!(json["duplicates"], 1);
    }

    #[tokio::test]
    async fn test_webhook_wrong_provider_is_conflict() {
        let api = test_api(None).await;
        let uri = format!("/webhooks/aggregator/{}", api.instance.id);
        let resp = api.router.oneshot(post_json(&uri, json!({}))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_webhook_unknown_instance_is_not_found() {
        let api = test_api(None).await;
        let resp = api
            .router
            .oneshot(post_json("/webhooks/gateway/nope", json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_crm_webhook_form_body_is_queued() {
        let api = test_api(None).await;
        let req = Request::builder()
            .method("POST")
            .uri("/webhooks/crm/t1")
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from(
                "event=ONIMCONNECTORLINEDELETE&data%5Bline%5D=5&auth%5Bdomain%5D=acme.example",
            ))
            .unwrap();
        let resp = api.router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        let event_id = json["event_id"].as_str().unwrap();

        let entry = api.relay.store().get_event(event_id).await.unwrap();
        assert_eq!(entry.tenant_id, "t1");
        assert_eq!(entry.event_type, "ONIMCONNECTORLINEDELETE");
        assert_eq!(entry.status, QueueStatus::Pending);
        assert_eq!(entry.payload["data"]["line"], "5");
    }

    #[tokio::test]
    async fn test_queue_process_runs_worker() {
        let api = test_api(None).await;
        let id = api
            .relay
            .store()
            .enqueue_event("t1", "ONIMCONNECTORSTATUSDELETE", &json!({"data": {}}), 3)
            .await
            .unwrap();

        let resp = api
            .router
            .oneshot(post_json("/api/queue/process", json!({"event_id": id})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["processed"], 1);
        let entry = api.relay.store().get_event(&id).await.unwrap();
        assert_eq!(entry.status, QueueStatus::Done);
    }

    #[tokio::test]
    async fn test_send_message_then_takeover_and_release() {
        let api = test_api(None).await;
        let resp = api
            .router
            .clone()
            .oneshot(post_json(
                "/api/messages/send",
                json!({
                    "instance_id": api.instance.id,
                    "phone_number": "+55 (11) 99988-7766",
                    "message": "Seu pedido saiu para entrega",
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["provider_message_id"], "WA1");
        assert_eq!(api.gateway.sent.lock().unwrap().len(), 1);
        let conversation_id = json["conversation_id"].as_str().unwrap().to_string();

        let uri = format!("/api/conversations/{conversation_id}/takeover");
        let resp = api
            .router
            .clone()
            .oneshot(post_json(&uri, json!({"operator": "maria"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["conversation"]["status"], "in_progress");

        let uri = format!("/api/conversations/{conversation_id}/release");
        let req = Request::post(&uri).body(Body::empty()).unwrap();
        let resp = api.router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let conversation = api
            .relay
            .store()
            .get_conversation(&conversation_id)
            .await
            .unwrap();
        assert!(conversation.attendance.is_automated());
    }

    #[tokio::test]
    async fn test_send_message_requires_content() {
        let api = test_api(None).await;
        let resp = api
            .router
            .oneshot(post_json(
                "/api/messages/send",
                json!({"instance_id": api.instance.id, "phone_number": "5511999887766"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_takeover_unknown_conversation() {
        let api = test_api(None).await;
        let req = Request::post("/api/conversations/missing/takeover")
            .body(Body::empty())
            .unwrap();
        let resp = api.router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_mapping_created_despite_crm_outage() {
        let api = test_api(None).await;
        api.relay
            .store()
            .create_integration(
                "t1",
                zaprelay_crm::PLATFORM,
                &Default::default(),
            )
            .await
            .unwrap();

        let body = json!({"tenant_id": "t1", "instance_id": api.instance.id, "line_id": 9});
        let resp = api
            .router
            .clone()
            .oneshot(post_json("/api/channel-mappings", body.clone()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(api.relay.failures().count().await.unwrap(), 1);

        let resp = api
            .router
            .oneshot(post_json("/api/channel-mappings", body))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_register_connector_crm_error_is_bad_gateway() {
        let api = test_api(None).await;
        let integration = api
            .relay
            .store()
            .create_integration("t1", zaprelay_crm::PLATFORM, &Default::default())
            .await
            .unwrap();
        let uri = format!("/api/integrations/{}/register-connector", integration.id);
        let req = Request::post(&uri).body(Body::empty()).unwrap();
        let resp = api.router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_instance_qr() {
        let api = test_api(None).await;
        api.relay
            .store()
            .set_instance_status(
                &api.instance.id,
                InstanceStatus::QrPending,
                Some("2@abc,def,ghi"),
                None,
            )
            .await
            .unwrap();
        let uri = format!("/api/instances/{}/qr", api.instance.id);
        let req = Request::get(&uri).body(Body::empty()).unwrap();
        let resp = api.router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "qr_pending");
        assert!(json["qr"]
            .as_str()
            .unwrap()
            .starts_with("data:image/png;base64,"));
    }

    #[tokio::test]
    async fn test_media_route() {
        let api = test_api(None).await;
        std::fs::write(api._media.path().join("abc.ogg"), b"OggS").unwrap();

        let req = Request::get("/media/abc.ogg").body(Body::empty()).unwrap();
        let resp = api.router.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["content-type"], "audio/ogg");

        let req = Request::get("/media/..secret").body(Body::empty()).unwrap();
        let resp = api.router.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let req = Request::get("/media/missing.png").body(Body::empty()).unwrap();
        let resp = api.router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
