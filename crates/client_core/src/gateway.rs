use std::sync::Arc;

use reqwest::{Client, Method, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use shared::{
    domain::{ConversationId, UserId},
    protocol::{
        ConversationSummary, CreateConversationRequest, LoginRequest, LoginResponse,
        MessagePayload, RefreshRequest, RegisterRequest, SendMessageRequest, TokenPairResponse,
        UserProfile,
    },
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    error::GatewayError,
    session::{SessionStore, TokenPair},
};

/// Authenticated request gateway. Attaches the current bearer credential to
/// every outbound call and runs exactly one refresh-and-retry cycle when the
/// backend rejects it as expired.
pub struct ApiGateway {
    http: Client,
    base_url: Url,
    session: Arc<SessionStore>,
    refresh_gate: Mutex<()>,
}

impl ApiGateway {
    pub fn new(base_url: Url, session: Arc<SessionStore>) -> Self {
        Self {
            http: Client::new(),
            base_url,
            session,
            refresh_gate: Mutex::new(()),
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn session(&self) -> &Arc<SessionStore> {
        &self.session
    }

    /// `POST /api/auth/login`. Persists the issued pair. The backend answers
    /// 200 with a plain `msg` body for unknown credentials; that maps to
    /// `SessionInvalid` without touching the store.
    pub async fn login(&self, email: &str, password: &str) -> Result<TokenPair, GatewayError> {
        let request = LoginRequest {
            email: email.to_string(),
            password: password.to_string(),
        };
        let response = self
            .issue(Method::POST, "/api/auth/login", Some(&request), None)
            .await?;
        self.accept_issued_pair(response).await
    }

    /// `POST /api/auth/register`. Persists the issued pair.
    pub async fn register(&self, request: &RegisterRequest) -> Result<TokenPair, GatewayError> {
        let response = self
            .issue(Method::POST, "/api/auth/register", Some(request), None)
            .await?;
        self.accept_issued_pair(response).await
    }

    /// `GET /api/auth/me`.
    pub async fn current_user(&self) -> Result<UserProfile, GatewayError> {
        self.get_json("/api/auth/me").await
    }

    /// `GET /api/chat/`.
    pub async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, GatewayError> {
        self.get_json("/api/chat/").await
    }

    /// `POST /api/chat/create` — create-or-fetch a conversation with the
    /// given recipient.
    pub async fn open_conversation(
        &self,
        recipient_id: UserId,
    ) -> Result<ConversationSummary, GatewayError> {
        self.post_json("/api/chat/create", &CreateConversationRequest { recipient_id })
            .await
    }

    /// `GET /api/chat/{id}/messages`.
    pub async fn conversation_messages(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<MessagePayload>, GatewayError> {
        self.get_json(&format!("/api/chat/{conversation_id}/messages"))
            .await
    }

    /// `POST /api/chat/{id}/messages`.
    pub async fn post_message(
        &self,
        conversation_id: ConversationId,
        content: &str,
    ) -> Result<MessagePayload, GatewayError> {
        self.post_json(
            &format!("/api/chat/{conversation_id}/messages"),
            &SendMessageRequest {
                content: content.to_string(),
            },
        )
        .await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, GatewayError> {
        self.execute(Method::GET, path, None::<&()>).await
    }

    pub async fn post_json<T, B>(&self, path: &str, body: &B) -> Result<T, GatewayError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.execute(Method::POST, path, Some(body)).await
    }

    async fn execute<T, B>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T, GatewayError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let access = self.session.access_token().await;
        let mut response = self
            .issue(method.clone(), path, body, access.as_deref())
            .await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            let rotated = self.refresh_access_token(access.as_deref()).await?;
            response = self.issue(method, path, body, Some(&rotated)).await?;
        }

        let status = response.status();
        if !status.is_success() {
            let body = parse_error_body(response).await;
            return Err(GatewayError::RequestFailed { status, body });
        }
        Ok(response.json::<T>().await?)
    }

    async fn issue<B>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        access: Option<&str>,
    ) -> Result<Response, GatewayError>
    where
        B: Serialize + ?Sized,
    {
        let mut request = self.http.request(method, self.endpoint(path));
        if let Some(token) = access {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        Ok(request.send().await?)
    }

    /// One-shot credential recovery. Overlapping expiries coalesce on the
    /// gate: late waiters observe the already-rotated access token and skip
    /// their own refresh round trip.
    async fn refresh_access_token(
        &self,
        stale_access: Option<&str>,
    ) -> Result<String, GatewayError> {
        let _gate = self.refresh_gate.lock().await;

        let current = self.session.get().await;
        if let Some(pair) = &current {
            if Some(pair.access.as_str()) != stale_access {
                return Ok(pair.access.clone());
            }
        }
        let Some(pair) = current else {
            info!("session: no refresh token held; re-authentication required");
            return Err(GatewayError::SessionInvalid);
        };

        debug!("session: access token rejected; refreshing credential pair");
        let request = RefreshRequest {
            refresh_token: pair.refresh,
        };
        let response = self
            .issue(Method::POST, "/api/auth/refresh", Some(&request), None)
            .await;
        let issued: TokenPairResponse = match response {
            Ok(response) if response.status().is_success() => Ok(response.json().await?),
            Ok(response) => {
                warn!(status = %response.status(), "session: refresh rejected; clearing credentials");
                self.session.clear().await;
                Err(GatewayError::SessionInvalid)
            }
            Err(err) => {
                warn!("session: refresh round trip failed: {err}");
                self.session.clear().await;
                Err(GatewayError::SessionInvalid)
            }
        }?;

        let rotated = TokenPair::new(issued.access_token, issued.refresh_token);
        self.session.set(rotated.clone()).await;
        info!("session: credential pair refreshed");
        Ok(rotated.access)
    }

    async fn accept_issued_pair(&self, response: Response) -> Result<TokenPair, GatewayError> {
        let status = response.status();
        if !status.is_success() {
            let body = parse_error_body(response).await;
            return Err(GatewayError::RequestFailed { status, body });
        }
        match response.json::<LoginResponse>().await? {
            LoginResponse::Issued(issued) => {
                let pair = TokenPair::new(issued.access_token, issued.refresh_token);
                self.session.set(pair.clone()).await;
                info!("session: credential pair issued");
                Ok(pair)
            }
            LoginResponse::Rejected { msg } => {
                warn!("session: login rejected: {msg}");
                Err(GatewayError::SessionInvalid)
            }
        }
    }

    fn endpoint(&self, path: &str) -> Url {
        let mut url = self.base_url.clone();
        url.set_path(path);
        url
    }
}

async fn parse_error_body(response: Response) -> Value {
    let text = response.text().await.unwrap_or_default();
    serde_json::from_str(&text).unwrap_or(Value::String(text))
}

#[cfg(test)]
#[path = "tests/gateway_tests.rs"]
mod tests;
