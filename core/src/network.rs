//! HTTP client for the Aether REST API

use parking_lot::Mutex;
use reqwest::{Client, Method, RequestBuilder, Url};
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};
use crate::models::*;
use crate::ClientConfig;

pub struct ApiClient {
    client: Client,
    base_url: Url,
    token: Mutex<Option<String>>,
    refresh_token: Mutex<Option<String>>,
}

impl ApiClient {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        Self::with_base_url(&config.api_url())
    }

    /// `base_url` is the API root, e.g. `http://localhost:3001/api/v1`
    pub fn with_base_url(base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url).map_err(|e| Error::InvalidUrl(e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(Error::InvalidUrl(base_url.to_string()));
        }

        Ok(Self {
            client: Client::new(),
            base_url,
            token: Mutex::new(None),
            refresh_token: Mutex::new(None),
        })
    }

    pub fn token(&self) -> Option<String> {
        self.token.lock().clone()
    }

    pub fn set_token(&self, token: Option<String>) {
        *self.token.lock() = token;
    }

    // ========================================================================
    // Auth
    // ========================================================================

    pub async fn register(&self, req: &RegisterRequest) -> Result<AuthTokens> {
        let tokens: AuthTokens = self
            .send(self.request(Method::POST, &["auth", "register"])?.json(req))
            .await?;
        self.store_tokens(&tokens);
        Ok(tokens)
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<AuthTokens> {
        let req = LoginRequest {
            email: email.to_string(),
            password: password.to_string(),
        };
        let tokens: AuthTokens = self
            .send(self.request(Method::POST, &["auth", "login"])?.json(&req))
            .await?;
        self.store_tokens(&tokens);
        Ok(tokens)
    }

    pub async fn refresh(&self) -> Result<AuthTokens> {
        let refresh_token = self.refresh_token.lock().clone().ok_or(Error::NotLoggedIn)?;
        let req = RefreshTokenRequest { refresh_token };
        let tokens: AuthTokens = self
            .send(self.request(Method::POST, &["auth", "refresh-token"])?.json(&req))
            .await?;
        self.store_tokens(&tokens);
        Ok(tokens)
    }

    pub async fn logout(&self) -> Result<()> {
        self.send_empty(self.request(Method::POST, &["auth", "logout"])?)
            .await?;
        self.set_token(None);
        *self.refresh_token.lock() = None;
        Ok(())
    }

    pub async fn profile(&self) -> Result<UserProfile> {
        self.send(self.request(Method::GET, &["auth", "profile"])?)
            .await
    }

    // ========================================================================
    // Users
    // ========================================================================

    pub async fn list_users(&self, search: Option<&str>) -> Result<Vec<UserProfile>> {
        let mut req = self.request(Method::GET, &["users"])?;
        if let Some(search) = search {
            req = req.query(&[("search", search)]);
        }
        self.send(req).await
    }

    pub async fn get_user(&self, user_id: &str) -> Result<UserProfile> {
        self.send(self.request(Method::GET, &["users", user_id])?)
            .await
    }

    pub async fn update_profile(&self, req: &UpdateProfileRequest) -> Result<UserProfile> {
        self.send(self.request(Method::PATCH, &["users", "me"])?.json(req))
            .await
    }

    /// Deletes the signed-in account; the client is signed out afterwards
    pub async fn delete_account(&self) -> Result<()> {
        self.send_empty(self.request(Method::DELETE, &["users", "me"])?)
            .await?;
        self.set_token(None);
        *self.refresh_token.lock() = None;
        Ok(())
    }

    // ========================================================================
    // Conversations
    // ========================================================================

    pub async fn create_conversation(&self, participant_id: &str) -> Result<Conversation> {
        let req = CreateConversationRequest {
            participant_id: participant_id.to_string(),
        };
        self.send(self.request(Method::POST, &["conversations"])?.json(&req))
            .await
    }

    pub async fn create_group(&self, name: &str, member_ids: &[String]) -> Result<Conversation> {
        let req = CreateGroupRequest {
            name: name.to_string(),
            member_ids: member_ids.to_vec(),
        };
        self.send(self.request(Method::POST, &["groups"])?.json(&req))
            .await
    }

    // ========================================================================
    // Messages
    // ========================================================================

    pub async fn send_message(&self, req: &SendMessageRequest) -> Result<Message> {
        self.send(self.request(Method::POST, &["messages"])?.json(req))
            .await
    }

    pub async fn get_messages(&self, query: &MessageQuery) -> Result<(Vec<Message>, Pagination)> {
        let resp: ApiResponse<Vec<Message>> = self
            .send_envelope(self.request(Method::GET, &["messages"])?.query(query))
            .await?;
        let pagination = resp
            .pagination
            .ok_or_else(|| Error::Http("missing pagination block".to_string()))?;
        Ok((resp.data.unwrap_or_default(), pagination))
    }

    pub async fn edit_message(&self, message_id: &str, content: &str) -> Result<Message> {
        let req = EditMessageRequest {
            content: content.to_string(),
        };
        self.send(self.request(Method::PATCH, &["messages", message_id])?.json(&req))
            .await
    }

    pub async fn delete_message(&self, message_id: &str) -> Result<()> {
        self.send_empty(self.request(Method::DELETE, &["messages", message_id])?)
            .await
    }

    pub async fn add_reaction(&self, message_id: &str, emoji: &str) -> Result<ReactionSummary> {
        let req = ReactionRequest {
            emoji: emoji.to_string(),
        };
        self.send(
            self.request(Method::POST, &["messages", message_id, "reactions"])?
                .json(&req),
        )
        .await
    }

    pub async fn remove_reaction(&self, message_id: &str, emoji: &str) -> Result<()> {
        self.send_empty(self.request(
            Method::DELETE,
            &["messages", message_id, "reactions", emoji],
        )?)
        .await
    }

    pub async fn mark_as_read(&self, message_id: &str) -> Result<()> {
        self.send_empty(self.request(Method::POST, &["messages", message_id, "read"])?)
            .await
    }

    pub async fn pin_message(&self, message_id: &str) -> Result<Message> {
        self.send(self.request(Method::POST, &["messages", message_id, "pin"])?)
            .await
    }

    pub async fn unpin_message(&self, message_id: &str) -> Result<Message> {
        self.send(self.request(Method::DELETE, &["messages", message_id, "pin"])?)
            .await
    }

    pub async fn unread_count(&self, query: &MessageQuery) -> Result<u64> {
        let count: UnreadCount = self
            .send(self.request(Method::GET, &["messages", "unread"])?.query(query))
            .await?;
        Ok(count.unread_count)
    }

    pub async fn check_health(&self) -> Result<bool> {
        let resp = self.request(Method::GET, &["health"])?.send().await;

        match resp {
            Ok(r) => Ok(r.status().is_success()),
            Err(_) => Ok(false),
        }
    }

    // ========================================================================
    // Plumbing
    // ========================================================================

    fn store_tokens(&self, tokens: &AuthTokens) {
        self.set_token(Some(tokens.token.clone()));
        *self.refresh_token.lock() = Some(tokens.refresh_token.clone());
    }

    /// Builds a request; path segments are percent-encoded individually
    fn request(&self, method: Method, segments: &[&str]) -> Result<RequestBuilder> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);

        let mut req = self.client.request(method, url);
        if let Some(token) = self.token() {
            req = req.bearer_auth(token);
        }
        Ok(req)
    }

    async fn send_envelope<T: DeserializeOwned>(
        &self,
        req: RequestBuilder,
    ) -> Result<ApiResponse<T>> {
        let resp = req.send().await?;
        let status = resp.status();
        let envelope: ApiResponse<T> = resp.json().await?;

        if !status.is_success() || !envelope.success {
            return Err(Error::Api {
                status: status.as_u16(),
                message: envelope.error.unwrap_or_else(|| status.to_string()),
            });
        }

        Ok(envelope)
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T> {
        self.send_envelope(req)
            .await?
            .data
            .ok_or_else(|| Error::Http("response carried no data".to_string()))
    }

    async fn send_empty(&self, req: RequestBuilder) -> Result<()> {
        self.send_envelope::<serde_json::Value>(req).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_invalid_base_url() {
        assert!(matches!(
            ApiClient::with_base_url("not a url"),
            Err(Error::InvalidUrl(_))
        ));
        assert!(ApiClient::with_base_url("mailto:someone@example.com").is_err());
    }

    #[test]
    fn test_path_segments_are_encoded() {
        let api = ApiClient::with_base_url("http://localhost:3001/api/v1/").unwrap();
        let req = api
            .request(Method::DELETE, &["messages", "m1", "reactions", "👍"])
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(
            req.url().as_str(),
            "http://localhost:3001/api/v1/messages/m1/reactions/%F0%9F%91%8D"
        );
    }

    #[test]
    fn test_bearer_token_is_attached() {
        let api = ApiClient::with_base_url("http://localhost:3001/api/v1").unwrap();
        api.set_token(Some("abc".to_string()));
        let req = api.request(Method::GET, &["auth", "profile"]).unwrap().build().unwrap();
        assert_eq!(
            req.headers().get(reqwest::header::AUTHORIZATION).unwrap(),
            "Bearer abc"
        );
    }

    #[test]
    fn test_message_query_string() {
        let api = ApiClient::with_base_url("http://localhost:3001/api/v1").unwrap();
        let query = MessageQuery::conversation("c1").page(2, 10);
        let req = api
            .request(Method::GET, &["messages"])
            .unwrap()
            .query(&query)
            .build()
            .unwrap();
        assert_eq!(req.url().query(), Some("conversationId=c1&page=2&limit=10"));
    }
}
