use crate::api::models::{
    AttachmentUpload, EntitlementFact, Message, MessageId, Reaction, ReactionRequest,
    RecentConversationSummary, SendRequest, UploadedAttachment, UserId,
};
use crate::error::ApiError;
use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// REST surface of the messaging backend.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn fetch_history(&self, peer: &UserId, me: &UserId) -> Result<Vec<Message>, ApiError>;
    async fn send_message(&self, request: &SendRequest) -> Result<Message, ApiError>;
    async fn delete_message(&self, id: &MessageId) -> Result<(), ApiError>;
    async fn fetch_reactions(&self, me: &UserId, peer: &UserId) -> Result<Vec<Reaction>, ApiError>;
    async fn add_reaction(&self, request: &ReactionRequest) -> Result<Reaction, ApiError>;
    async fn fetch_recent_conversations(
        &self,
        me: &UserId,
    ) -> Result<Vec<RecentConversationSummary>, ApiError>;
    async fn fetch_entitlement(&self, me: &UserId) -> Result<EntitlementFact, ApiError>;
    async fn upload_attachment(&self, file: AttachmentUpload) -> Result<UploadedAttachment, ApiError>;
}

pub struct ApiClient {
    pub http: HttpClient,
    base: Url,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, ApiError> {
        let http = HttpClient::builder().timeout(REQUEST_TIMEOUT).build()?;
        let base = Url::parse(&Self::base_api(&crate::utils::normalize_url(base_url)))?;
        Ok(Self { http, base, token })
    }

    fn base_api(base_url: &str) -> String {
        let trimmed = base_url.trim_end_matches('/');
        if trimmed.ends_with("/api") { format!("{}/", trimmed) } else { format!("{}/api/", trimmed) }
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        Ok(self.base.join(path)?)
    }

    fn with_auth(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(t) = &self.token {
            req = req.header("Authorization", format!("Bearer {}", t));
        }
        req
    }

    async fn checked(resp: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(ApiError::Status { status: status.as_u16(), body })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let req = self.with_auth(self.http.get(self.endpoint(path)?));
        let resp = Self::checked(req.send().await?).await?;
        Ok(resp.json::<T>().await?)
    }

    /// Lists come back either bare or wrapped in `data`.
    async fn get_list<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>, ApiError> {
        let json: Value = self.get_json(path).await?;
        Ok(serde_json::from_value(unwrap_list(json))?)
    }

    /// Reach the server's health endpoint. Returns the HTTP status code.
    pub async fn ping(&self) -> Result<u16, ApiError> {
        let req = self.with_auth(self.http.get(self.endpoint("ping")?));
        let resp = req.send().await?;
        Ok(resp.status().as_u16())
    }
}

fn unwrap_list(json: Value) -> Value {
    match json {
        Value::Object(mut map) if map.get("data").is_some_and(Value::is_array) => {
            map.remove("data").unwrap_or(Value::Array(Vec::new()))
        }
        Value::Array(_) => json,
        _ => Value::Array(Vec::new()),
    }
}

#[async_trait]
impl ChatApi for ApiClient {
    async fn fetch_history(&self, peer: &UserId, me: &UserId) -> Result<Vec<Message>, ApiError> {
        self.get_list(&format!("messages/{}/{}", me, peer)).await
    }

    async fn send_message(&self, request: &SendRequest) -> Result<Message, ApiError> {
        let req = self.with_auth(self.http.post(self.endpoint("messages")?)).json(request);
        let resp = Self::checked(req.send().await?).await?;
        Ok(resp.json::<Message>().await?)
    }

    async fn delete_message(&self, id: &MessageId) -> Result<(), ApiError> {
        let req = self.with_auth(self.http.delete(self.endpoint(&format!("messages/{}", id))?));
        Self::checked(req.send().await?).await?;
        Ok(())
    }

    async fn fetch_reactions(&self, me: &UserId, peer: &UserId) -> Result<Vec<Reaction>, ApiError> {
        self.get_list(&format!("reactions/{}/{}", me, peer)).await
    }

    async fn add_reaction(&self, request: &ReactionRequest) -> Result<Reaction, ApiError> {
        let req = self.with_auth(self.http.post(self.endpoint("reactions")?)).json(request);
        let resp = Self::checked(req.send().await?).await?;
        Ok(resp.json::<Reaction>().await?)
    }

    async fn fetch_recent_conversations(
        &self,
        me: &UserId,
    ) -> Result<Vec<RecentConversationSummary>, ApiError> {
        self.get_list(&format!("conversations/recent/{}", me)).await
    }

    async fn fetch_entitlement(&self, me: &UserId) -> Result<EntitlementFact, ApiError> {
        self.get_json(&format!("subscription/{}", me)).await
    }

    async fn upload_attachment(&self, file: AttachmentUpload) -> Result<UploadedAttachment, ApiError> {
        let part = reqwest::multipart::Part::bytes(file.bytes)
            .file_name(file.file_name)
            .mime_str(&file.mime_type)?;
        let form = reqwest::multipart::Form::new().part("file", part);
        let req = self.with_auth(self.http.post(self.endpoint("attachments")?)).multipart(form);
        let resp = Self::checked(req.send().await?).await?;
        Ok(resp.json::<UploadedAttachment>().await?)
    }
}
