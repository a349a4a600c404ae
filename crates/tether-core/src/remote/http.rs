//! REST implementation of [`RemoteApi`].

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value};

use super::RemoteApi;
use crate::config::RemoteConfig;
use crate::models::{EntityType, RemoteRecord};
use crate::util::{compact_text, is_http_url, normalize_text_option};
use crate::{Error, Result};

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Talks to `{base_url}/api/{table}` with a bearer token.
#[derive(Clone)]
pub struct HttpRemoteApi {
    base_url: String,
    auth_token: Option<String>,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpRemoteApi {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpRemoteApi")
            .field("base_url", &self.base_url)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "[REDACTED]"))
            .finish_non_exhaustive()
    }
}

impl HttpRemoteApi {
    pub fn new(base_url: impl Into<String>, auth_token: Option<String>) -> Result<Self> {
        Ok(Self {
            base_url: normalize_base_url(base_url.into())?,
            auth_token: normalize_text_option(auth_token),
            client: reqwest::Client::builder()
                .build()
                .map_err(|error| Error::Remote(error.to_string()))?,
        })
    }

    pub fn from_config(config: &RemoteConfig) -> Result<Self> {
        Self::new(config.base_url.clone(), config.auth_token.clone())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn collection_url(&self, entity_type: EntityType) -> String {
        format!("{}/api/{}", self.base_url, entity_type.table())
    }

    fn entity_url(&self, entity_type: EntityType, id: &str) -> String {
        format!(
            "{}/{}",
            self.collection_url(entity_type),
            urlencoding::encode(id)
        )
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.header(reqwest::header::ACCEPT, "application/json");
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, &body))
    }

    /// A 2xx response means the mutation was applied; the body is optional
    /// and only used when it parses into a full record.
    async fn read_applied(entity_type: EntityType, response: Response) -> Option<RemoteRecord> {
        let body = match response.text().await {
            Ok(body) => body,
            Err(error) => {
                tracing::debug!("Ignoring unreadable {entity_type} response body: {error}");
                return None;
            }
        };
        applied_record(entity_type, &body)
    }
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
    async fn create_entity(
        &self,
        entity_type: EntityType,
        id: &str,
        data: &Map<String, Value>,
        idempotency_key: &str,
    ) -> Result<Option<RemoteRecord>> {
        let mut body = data.clone();
        body.insert("id".to_string(), Value::String(id.to_string()));

        let response = self
            .send(
                self.client
                    .post(self.collection_url(entity_type))
                    .header(IDEMPOTENCY_HEADER, idempotency_key)
                    .json(&body),
            )
            .await?;
        Ok(Self::read_applied(entity_type, response).await)
    }

    async fn update_entity(
        &self,
        entity_type: EntityType,
        id: &str,
        patch: &Map<String, Value>,
        idempotency_key: &str,
    ) -> Result<Option<RemoteRecord>> {
        let response = self
            .send(
                self.client
                    .patch(self.entity_url(entity_type, id))
                    .header(IDEMPOTENCY_HEADER, idempotency_key)
                    .json(patch),
            )
            .await?;
        Ok(Self::read_applied(entity_type, response).await)
    }

    async fn delete_entity(
        &self,
        entity_type: EntityType,
        id: &str,
        idempotency_key: &str,
    ) -> Result<()> {
        let request = self
            .client
            .delete(self.entity_url(entity_type, id))
            .header(IDEMPOTENCY_HEADER, idempotency_key);

        match self.send(request).await {
            Ok(_) => Ok(()),
            // already gone
            Err(Error::NotFound(_)) => Ok(()),
            Err(error) => Err(error),
        }
    }

    async fn list_changed_since(
        &self,
        entity_type: EntityType,
        since: i64,
    ) -> Result<Vec<RemoteRecord>> {
        let response = self
            .send(
                self.client
                    .get(self.collection_url(entity_type))
                    .query(&[("changed_since", since)]),
            )
            .await?;

        let payload = response
            .json::<ChangedRecordsResponse>()
            .await
            .map_err(transport_error)?;
        payload
            .into_records()
            .iter()
            .map(|snapshot| RemoteRecord::from_snapshot(entity_type, snapshot))
            .collect()
    }
}

fn applied_record(entity_type: EntityType, body: &str) -> Option<RemoteRecord> {
    if body.trim().is_empty() {
        return None;
    }
    let payload = serde_json::from_str::<Value>(body).ok()?;
    RemoteRecord::from_snapshot(entity_type, &payload).ok()
}

/// Servers may return a bare array or wrap it in `{ "records": [...] }`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ChangedRecordsResponse {
    Wrapped { records: Vec<Value> },
    Bare(Vec<Value>),
}

impl ChangedRecordsResponse {
    fn into_records(self) -> Vec<Value> {
        match self {
            Self::Wrapped { records } | Self::Bare(records) => records,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return format!("{} ({})", compact_text(&message), status.as_u16());
        }
    }

    let trimmed = compact_text(body);
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", trimmed, status.as_u16())
    }
}

/// Map a non-success status onto the engine's retry taxonomy.
fn status_error(status: StatusCode, body: &str) -> Error {
    let message = parse_api_error(status, body);
    match status {
        StatusCode::NOT_FOUND => Error::NotFound(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            Error::TransientNetwork(message)
        }
        StatusCode::BAD_REQUEST
        | StatusCode::CONFLICT
        | StatusCode::GONE
        | StatusCode::PAYLOAD_TOO_LARGE
        | StatusCode::UNPROCESSABLE_ENTITY => Error::ConstraintViolation(message),
        status if status.is_server_error() => Error::TransientNetwork(message),
        _ => Error::Remote(message),
    }
}

fn transport_error(error: reqwest::Error) -> Error {
    if error.is_timeout() || error.is_connect() || error.is_request() {
        Error::TransientNetwork(error.to_string())
    } else {
        Error::Remote(error.to_string())
    }
}

fn normalize_base_url(raw: String) -> Result<String> {
    let base_url = normalize_text_option(Some(raw))
        .ok_or_else(|| Error::InvalidInput("remote base_url must not be empty".to_string()))?;
    if is_http_url(&base_url) {
        Ok(base_url.trim_end_matches('/').to_string())
    } else {
        Err(Error::InvalidInput(
            "remote base_url must include http:// or https://".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn normalize_base_url_rejects_invalid_values() {
        assert!(normalize_base_url(String::new()).is_err());
        assert!(normalize_base_url("api.example.com".to_string()).is_err());
        assert_eq!(
            normalize_base_url(" https://api.example.com/ ".to_string()).unwrap(),
            "https://api.example.com"
        );
    }

    #[test]
    fn entity_urls_use_table_names_and_encode_ids() {
        let api = HttpRemoteApi::new("https://api.example.com", None).unwrap();
        assert_eq!(
            api.collection_url(EntityType::Task),
            "https://api.example.com/api/tasks"
        );
        assert_eq!(
            api.entity_url(EntityType::Project, "a b"),
            "https://api.example.com/api/projects/a%20b"
        );
    }

    #[test]
    fn debug_redacts_token() {
        let api = HttpRemoteApi::new("https://api.example.com", Some("secret".to_string())).unwrap();
        let debug = format!("{api:?}");
        assert!(!debug.contains("secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn status_errors_follow_retry_taxonomy() {
        assert!(status_error(StatusCode::SERVICE_UNAVAILABLE, "").is_retryable());
        assert!(status_error(StatusCode::TOO_MANY_REQUESTS, "").is_retryable());
        assert!(!status_error(StatusCode::CONFLICT, "").is_retryable());
        assert!(!status_error(StatusCode::UNPROCESSABLE_ENTITY, "").is_retryable());
        assert!(matches!(
            status_error(StatusCode::NOT_FOUND, ""),
            Error::NotFound(_)
        ));
    }

    #[test]
    fn parse_api_error_prefers_message_field() {
        assert_eq!(
            parse_api_error(
                StatusCode::CONFLICT,
                r#"{"error":"conflict","message":"parent project was deleted"}"#
            ),
            "parent project was deleted (409)"
        );
        assert_eq!(parse_api_error(StatusCode::BAD_GATEWAY, "  "), "HTTP 502");
    }

    #[test]
    fn changed_records_accepts_both_shapes() {
        let wrapped: ChangedRecordsResponse =
            serde_json::from_str(r#"{"records":[{"id":"1","updated_at":5}]}"#).unwrap();
        let bare: ChangedRecordsResponse =
            serde_json::from_str(r#"[{"id":"1","updated_at":5}]"#).unwrap();
        assert_eq!(wrapped.into_records().len(), 1);
        assert_eq!(bare.into_records().len(), 1);
    }

    #[test]
    fn applied_record_tolerates_partial_bodies() {
        assert_eq!(applied_record(EntityType::Task, ""), None);
        assert_eq!(applied_record(EntityType::Task, r#"{"status":"created"}"#), None);
        assert_eq!(applied_record(EntityType::Task, "<html>ok</html>"), None);

        let record =
            applied_record(EntityType::Task, r#"{"id":"t-1","updated_at":9,"title":"A"}"#).unwrap();
        assert_eq!(record.updated_at, 9);
        assert_eq!(record.data["title"], "A");
    }

    mod stub {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::{TcpListener, TcpStream};

        /// HTTP/1.1 server answering mutations with `mutation_reply` and
        /// listings with an empty array. Counts the mutations it received.
        pub async fn serve(mutation_reply: String) -> (String, Arc<AtomicUsize>) {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let base_url = format!("http://{}", listener.local_addr().unwrap());
            let mutations = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&mutations);

            tokio::spawn(async move {
                while let Ok((mut socket, _)) = listener.accept().await {
                    let request = read_request(&mut socket).await;
                    let reply = if request.starts_with("GET ") {
                        json_reply("200 OK", "[]")
                    } else {
                        counter.fetch_add(1, Ordering::SeqCst);
                        mutation_reply.clone()
                    };
                    socket.write_all(reply.as_bytes()).await.unwrap();
                    socket.shutdown().await.ok();
                }
            });
            (base_url, mutations)
        }

        pub fn json_reply(status: &str, body: &str) -> String {
            format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            )
        }

        async fn read_request(socket: &mut TcpStream) -> String {
            let mut buffer = Vec::new();
            let mut chunk = [0_u8; 1024];
            loop {
                let read = socket.read(&mut chunk).await.unwrap();
                if read == 0 {
                    break;
                }
                buffer.extend_from_slice(&chunk[..read]);

                let text = String::from_utf8_lossy(&buffer);
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let body_len = text[..head_end]
                        .lines()
                        .find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            if name.eq_ignore_ascii_case("content-length") {
                                value.trim().parse::<usize>().ok()
                            } else {
                                None
                            }
                        })
                        .unwrap_or(0);
                    if buffer.len() >= head_end + 4 + body_len {
                        break;
                    }
                }
            }
            String::from_utf8_lossy(&buffer).into_owned()
        }
    }

    fn stub_api(base_url: String) -> HttpRemoteApi {
        HttpRemoteApi {
            base_url,
            auth_token: None,
            client: reqwest::Client::builder().no_proxy().build().unwrap(),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn create_succeeds_without_a_record_body() {
        let data = Map::new();

        let (base_url, _) = stub::serve(stub::json_reply("201 Created", r#"{"status":"created"}"#)).await;
        let created = stub_api(base_url)
            .create_entity(EntityType::Task, "t-1", &data, "key-1")
            .await
            .unwrap();
        assert_eq!(created, None);

        let (base_url, _) =
            stub::serve("HTTP/1.1 204 No Content\r\nconnection: close\r\n\r\n".to_string()).await;
        let updated = stub_api(base_url)
            .update_entity(EntityType::Task, "t-1", &data, "key-2")
            .await
            .unwrap();
        assert_eq!(updated, None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn acknowledged_upload_is_not_dead_lettered() {
        use crate::config::EngineConfig;
        use crate::store::LocalStore;
        use crate::sync::SyncOrchestrator;
        use std::sync::atomic::Ordering;
        use std::sync::Arc;

        let (base_url, mutations) =
            stub::serve(stub::json_reply("201 Created", r#"{"status":"created"}"#)).await;
        let store = LocalStore::open_in_memory().await.unwrap();
        let orchestrator =
            SyncOrchestrator::new(store, Arc::new(stub_api(base_url)), EngineConfig::default()).unwrap();
        let mut data = Map::new();
        data.insert("title".to_string(), Value::from("Ship"));
        let task = orchestrator.create(EntityType::Task, data).await.unwrap();

        let result = orchestrator.sync().await.unwrap();
        assert!(result.success, "{:?}", result.errors);
        assert_eq!(result.synced_items, 1);
        assert_eq!(result.dead_lettered, 0);
        assert_eq!(mutations.load(Ordering::SeqCst), 1);

        let local = orchestrator.find(EntityType::Task, &task.id).await.unwrap().unwrap();
        assert!(local.is_synced);
        assert!(orchestrator.dead_letters(10).await.unwrap().is_empty());
    }
}
