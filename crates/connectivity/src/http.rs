//! Backend speaking the PostgREST / edge-function conventions over HTTP.

use anyhow::Context;
use async_trait::async_trait;
use fastnow_core::Action;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde_json::{Map, Value, json};

use crate::backend::{Backend, BackendError, ReplayOutcome, ReplayRequest};
use crate::config::{DEFAULT_PROBE_TABLE, SyncConfig};

/// HTTP client for the hosted backend.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    api_url: String,
    api_key: Option<String>,
    token: Option<String>,
    probe_table: String,
}

impl HttpBackend {
    pub fn new(api_url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            token: None,
            probe_table: DEFAULT_PROBE_TABLE.to_string(),
        })
    }

    pub fn from_config(config: &SyncConfig) -> anyhow::Result<Self> {
        let mut backend = Self::new(config.api_url.clone())?.with_probe_table(&config.probe_table);
        backend.api_key = config.api_key.clone();
        backend.token = config.auth_token.clone();
        Ok(backend)
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_probe_table(mut self, table: impl Into<String>) -> Self {
        self.probe_table = table.into();
        self
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.api_url, path);
        let mut req = self.client.request(method, url);

        if let Some(key) = &self.api_key {
            req = req.header("apikey", key);
        }
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        req
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response, BackendError> {
        let resp = req.send().await.map_err(transport_error)?;
        check_status(resp).await
    }

    async fn insert_row(&self, request: &ReplayRequest) -> Result<ReplayOutcome, BackendError> {
        let body = row_body(request)?;
        let req = self
            .request(Method::POST, &format!("/rest/v1/{}", request.entity.table()))
            .header("Prefer", "return=representation")
            .json(&body);

        let resp = self.send(req).await?;
        let rows: Value = resp
            .json()
            .await
            .map_err(|e| BackendError::Protocol(format!("failed to parse inserted row: {e}")))?;

        let server_id = returned_id(&rows);
        if server_id.is_none() {
            tracing::warn!(
                operation_id = %request.operation_id,
                entity = %request.entity,
                "insert succeeded but no id came back"
            );
        }
        Ok(ReplayOutcome { server_id })
    }

    async fn patch_row(&self, request: &ReplayRequest) -> Result<ReplayOutcome, BackendError> {
        let target = require_target(request)?;
        let body = row_body(request)?;
        let req = self
            .request(Method::PATCH, &format!("/rest/v1/{}", request.entity.table()))
            .query(&[("id", format!("eq.{target}"))])
            .json(&body);

        self.send(req).await?;
        Ok(ReplayOutcome::default())
    }

    async fn delete_row(&self, request: &ReplayRequest) -> Result<ReplayOutcome, BackendError> {
        let target = require_target(request)?;
        let req = self
            .request(Method::DELETE, &format!("/rest/v1/{}", request.entity.table()))
            .query(&[("id", format!("eq.{target}"))]);

        self.send(req).await?;
        Ok(ReplayOutcome::default())
    }

    async fn invoke_function(
        &self,
        name: &str,
        request: &ReplayRequest,
    ) -> Result<ReplayOutcome, BackendError> {
        let body = json!({
            "entity": request.entity,
            "target": request.target,
            "user_id": request.user_id,
            "payload": request.payload,
        });
        let req = self
            .request(Method::POST, &format!("/functions/v1/{name}"))
            .json(&body);

        let resp = self.send(req).await?;
        // Functions may answer with an empty body.
        let server_id = resp.json::<Value>().await.ok().as_ref().and_then(returned_id);
        Ok(ReplayOutcome { server_id })
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn probe(&self) -> Result<(), BackendError> {
        let req = self
            .request(Method::GET, &format!("/rest/v1/{}", self.probe_table))
            .query(&[("select", "id"), ("limit", "1")]);

        self.send(req).await?;
        Ok(())
    }

    async fn replay(&self, request: &ReplayRequest) -> Result<ReplayOutcome, BackendError> {
        tracing::debug!(
            operation_id = %request.operation_id,
            entity = %request.entity,
            action = %request.action,
            "replaying operation"
        );

        match &request.action {
            Action::Create | Action::Start => self.insert_row(request).await,
            Action::Update | Action::Pause | Action::Resume | Action::End | Action::Cancel => {
                self.patch_row(request).await
            }
            Action::Delete => self.delete_row(request).await,
            Action::Custom(name) => self.invoke_function(name, request).await,
        }
    }
}

fn transport_error(err: reqwest::Error) -> BackendError {
    if err.is_timeout() {
        BackendError::Timeout
    } else {
        BackendError::Transport(err.to_string())
    }
}

async fn check_status(resp: Response) -> Result<Response, BackendError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let message = resp.text().await.unwrap_or_default();
    let code = status.as_u16();

    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        Err(BackendError::Unavailable {
            status: code,
            message,
        })
    } else {
        Err(BackendError::Rejected {
            status: code,
            message,
        })
    }
}

fn require_target(request: &ReplayRequest) -> Result<&str, BackendError> {
    request.target.as_deref().ok_or_else(|| {
        BackendError::Protocol(format!(
            "{} {} needs a target row",
            request.entity, request.action
        ))
    })
}

/// Row body: the payload object plus the owner, and for lifecycle actions a
/// `status` named after the action unless the payload sets one.
fn row_body(request: &ReplayRequest) -> Result<Value, BackendError> {
    let mut row = match &request.payload {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            return Err(BackendError::Protocol(format!(
                "row payload must be a JSON object, got {other}"
            )));
        }
    };

    row.entry("user_id")
        .or_insert_with(|| Value::String(request.user_id.to_string()));

    if request.action.is_lifecycle() {
        row.entry("status")
            .or_insert_with(|| Value::String(lifecycle_status(&request.action).to_string()));
    }

    Ok(Value::Object(row))
}

fn lifecycle_status(action: &Action) -> &'static str {
    match action {
        Action::Pause => "paused",
        Action::Resume => "active",
        Action::End => "completed",
        Action::Cancel => "cancelled",
        _ => "active",
    }
}

/// `id` of the first returned row (arrays) or of the object itself.
fn returned_id(body: &Value) -> Option<String> {
    let row = match body {
        Value::Array(rows) => rows.first()?,
        other => other,
    };

    match row.get("id")? {
        Value::String(id) => Some(id.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fastnow_core::{Entity, OperationId, UserId};

    fn request(action: Action, payload: Value) -> ReplayRequest {
        ReplayRequest {
            operation_id: OperationId::new(),
            entity: Entity::WalkingSession,
            action,
            user_id: UserId::new(),
            target: Some("srv-1".into()),
            payload,
        }
    }

    #[test]
    fn lifecycle_body_gets_status_and_owner() {
        let req = request(Action::Pause, json!({ "paused_at": "2026-10-18T08:00:00Z" }));
        let body = row_body(&req).unwrap();
        assert_eq!(body["status"], "paused");
        assert_eq!(body["user_id"], req.user_id.to_string());
        assert_eq!(body["paused_at"], "2026-10-18T08:00:00Z");
    }

    #[test]
    fn explicit_status_wins() {
        let req = request(Action::End, json!({ "status": "abandoned" }));
        assert_eq!(row_body(&req).unwrap()["status"], "abandoned");
    }

    #[test]
    fn update_body_has_no_status() {
        let req = request(Action::Update, Value::Null);
        let body = row_body(&req).unwrap();
        assert!(body.get("status").is_none());
    }

    #[test]
    fn non_object_payload_is_a_protocol_error() {
        let req = request(Action::Create, json!([1, 2, 3]));
        assert!(matches!(row_body(&req), Err(BackendError::Protocol(_))));
    }

    #[test]
    fn returned_id_handles_rows_and_numbers() {
        assert_eq!(returned_id(&json!([{ "id": "abc" }])), Some("abc".into()));
        assert_eq!(returned_id(&json!([{ "id": 42 }])), Some("42".into()));
        assert_eq!(returned_id(&json!({ "id": "fn-1" })), Some("fn-1".into()));
        assert_eq!(returned_id(&json!([])), None);
        assert_eq!(returned_id(&json!({ "ok": true })), None);
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let backend = HttpBackend::new("http://localhost:54321/").unwrap();
        assert_eq!(backend.api_url(), "http://localhost:54321");
    }
}
