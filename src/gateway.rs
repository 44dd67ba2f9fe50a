//! Outbound calls to the chat platform.

use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Client, Method};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{card::Card, error::GatewayError};

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);
pub const CASE_LINK_TAB: &str = "CASELINK";

/// Contacts resolved by [`NotificationGateway::lookup_users`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserLookup {
    /// user id -> the email or phone it was resolved from
    pub valid: BTreeMap<String, String>,
    pub invalid: Vec<String>,
}

#[async_trait]
pub trait NotificationGateway: Send + Sync {
    async fn send_text(&self, target: &str, text: &str) -> GatewayResult<()>;

    /// Returns the platform message id of the sent card.
    async fn send_card(&self, card: &Card, target: &str) -> GatewayResult<String>;

    async fn create_channel(&self, user_ids: &[String], name: &str) -> GatewayResult<String>;

    async fn lookup_users(&self, emails: &[String], phones: &[String])
        -> GatewayResult<UserLookup>;

    async fn create_tab(&self, channel_id: &str, url: &str) -> GatewayResult<()>;
}

/// Receive-id type for a platform identifier, by its prefix.
pub fn receive_id_type(id: &str) -> &'static str {
    if id.starts_with("oc_") {
        "chat_id"
    } else if id.starts_with("ou_") {
        "open_id"
    } else {
        "user_id"
    }
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    tenant_access_token: String,
    #[serde(default)]
    expire: u64,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: String,
}

#[derive(Debug, Deserialize)]
struct CreatedChat {
    chat_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct BatchUserIds {
    #[serde(default)]
    user_list: Vec<UserIdEntry>,
}

#[derive(Debug, Deserialize)]
struct UserIdEntry {
    user_id: Option<String>,
    email: Option<String>,
    mobile: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateMessageBody<'a> {
    receive_id: &'a str,
    msg_type: &'a str,
    content: String,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Lark / Feishu open-platform client.
#[derive(Debug)]
pub struct LarkGateway {
    client: Client,
    base_url: String,
    app_id: String,
    app_secret: String,
    token: Mutex<Option<CachedToken>>,
}

impl LarkGateway {
    pub fn new(
        base_url: impl Into<String>,
        app_id: impl Into<String>,
        app_secret: impl Into<String>,
    ) -> GatewayResult<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            app_id: app_id.into(),
            app_secret: app_secret.into(),
            token: Mutex::new(None),
        })
    }

    /// Drop the cached tenant token when the platform rejected it, so the
    /// next call fetches a fresh one.
    fn rejected(&self, path: &str, err: GatewayError) -> GatewayError {
        if err.is_auth_rejection() && self.token.lock().take().is_some() {
            tracing::info!(
                target = "case_bridge::gateway",
                path = %path,
                "tenant token rejected, cache cleared"
            );
        }
        err
    }

    async fn tenant_token(&self) -> GatewayResult<String> {
        let cached = self.token.lock().clone();
        if let Some(cached) = cached {
            if cached.expires_at > Instant::now() {
                return Ok(cached.value);
            }
        }

        let url = format!(
            "{}/open-apis/auth/v3/tenant_access_token/internal",
            self.base_url
        );
        let response = self
            .client
            .post(&url)
            .json(&json!({ "app_id": self.app_id, "app_secret": self.app_secret }))
            .send()
            .await?;
        let status = response.status().as_u16();
        let body: TokenResponse = response.json().await?;
        if body.code != 0 || body.tenant_access_token.is_empty() {
            return Err(GatewayError::api(body.code, body.msg, status));
        }

        let lifetime = Duration::from_secs(body.expire).saturating_sub(TOKEN_REFRESH_MARGIN);
        tracing::debug!(
            target = "case_bridge::gateway",
            expires_in_secs = lifetime.as_secs(),
            "refreshed tenant access token"
        );
        *self.token.lock() = Some(CachedToken {
            value: body.tenant_access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(body.tenant_access_token)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Value,
    ) -> GatewayResult<T> {
        let token = self.tenant_token().await?;
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .request(method, &url)
            .bearer_auth(token)
            .query(query)
            .json(&body)
            .send()
            .await?;
        let status = response.status().as_u16();
        let raw = response.text().await?;

        let envelope: ApiEnvelope<T> = match serde_json::from_str(&raw) {
            Ok(envelope) => envelope,
            Err(_) if !(200..300).contains(&status) => {
                return Err(self.rejected(path, GatewayError::api(-1, raw, status)));
            }
            Err(err) => return Err(err.into()),
        };
        if envelope.code != 0 {
            tracing::warn!(
                target = "case_bridge::gateway",
                path = %path,
                code = envelope.code,
                msg = %envelope.msg,
                "platform call rejected"
            );
            return Err(self.rejected(path, GatewayError::api(envelope.code, envelope.msg, status)));
        }
        envelope
            .data
            .ok_or_else(|| GatewayError::InvalidResponse(format!("{path}: missing data field")))
    }

    async fn send_message(
        &self,
        target: &str,
        msg_type: &str,
        content: String,
    ) -> GatewayResult<String> {
        let body = CreateMessageBody {
            receive_id: target,
            msg_type,
            content,
        };
        let sent: SentMessage = self
            .call(
                Method::POST,
                "/open-apis/im/v1/messages",
                &[("receive_id_type", receive_id_type(target))],
                serde_json::to_value(body)?,
            )
            .await?;
        tracing::info!(
            target = "case_bridge::gateway",
            receive_id = %target,
            msg_type = %msg_type,
            message_id = %sent.message_id,
            "message sent"
        );
        Ok(sent.message_id)
    }
}

#[async_trait]
impl NotificationGateway for LarkGateway {
    async fn send_text(&self, target: &str, text: &str) -> GatewayResult<()> {
        let content = serde_json::to_string(&json!({ "text": text }))?;
        self.send_message(target, "text", content).await.map(|_| ())
    }

    async fn send_card(&self, card: &Card, target: &str) -> GatewayResult<String> {
        let content = serde_json::to_string(card)?;
        self.send_message(target, "interactive", content).await
    }

    async fn create_channel(&self, user_ids: &[String], name: &str) -> GatewayResult<String> {
        let chat: CreatedChat = self
            .call(
                Method::POST,
                "/open-apis/im/v1/chats",
                &[("user_id_type", "user_id")],
                json!({ "name": name, "user_id_list": user_ids }),
            )
            .await?;
        tracing::info!(
            target = "case_bridge::gateway",
            chat_id = %chat.chat_id,
            members = user_ids.len(),
            "channel created"
        );
        Ok(chat.chat_id)
    }

    async fn lookup_users(
        &self,
        emails: &[String],
        phones: &[String],
    ) -> GatewayResult<UserLookup> {
        let ids: BatchUserIds = self
            .call(
                Method::POST,
                "/open-apis/contact/v3/users/batch_get_id",
                &[("user_id_type", "user_id")],
                json!({ "emails": emails, "mobiles": phones }),
            )
            .await?;

        let mut lookup = UserLookup::default();
        for entry in ids.user_list {
            let contact = entry.mobile.or(entry.email).unwrap_or_default();
            match entry.user_id.filter(|id| !id.is_empty()) {
                Some(user_id) => {
                    lookup.valid.insert(user_id, contact);
                }
                None => lookup.invalid.push(contact),
            }
        }
        Ok(lookup)
    }

    async fn create_tab(&self, channel_id: &str, url: &str) -> GatewayResult<()> {
        let path = format!("/open-apis/im/v1/chats/{channel_id}/chat_tabs");
        let _: Value = self
            .call(
                Method::POST,
                &path,
                &[],
                json!({
                    "chat_tabs": [{
                        "tab_name": CASE_LINK_TAB,
                        "tab_type": "url",
                        "tab_content": { "url": url }
                    }]
                }),
            )
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundCall {
    Text { target: String, text: String },
    Card { target: String, card: Card },
    Channel { user_ids: Vec<String>, name: String },
    Tab { channel_id: String, url: String },
}

/// Logs and records outbound calls instead of reaching the platform.
/// Contacts resolve to user ids derived from the contact itself.
#[derive(Debug, Default)]
pub struct DryRunGateway {
    calls: Mutex<Vec<OutboundCall>>,
}

impl DryRunGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<OutboundCall> {
        self.calls.lock().clone()
    }

    pub fn channels_created(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| matches!(call, OutboundCall::Channel { .. }))
            .count()
    }

    pub fn texts_to(&self, target: &str) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                OutboundCall::Text { target: t, text } if t == target => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn cards_to(&self, target: &str) -> Vec<Card> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                OutboundCall::Card { target: t, card } if t == target => Some(card.clone()),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: OutboundCall) -> usize {
        let mut calls = self.calls.lock();
        calls.push(call);
        calls.len()
    }
}

#[async_trait]
impl NotificationGateway for DryRunGateway {
    async fn send_text(&self, target: &str, text: &str) -> GatewayResult<()> {
        tracing::info!(target = "case_bridge::gateway", receive_id = %target, text = %text, "dry-run text");
        self.record(OutboundCall::Text {
            target: target.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn send_card(&self, card: &Card, target: &str) -> GatewayResult<String> {
        tracing::info!(target = "case_bridge::gateway", receive_id = %target, elements = card.elements.len(), "dry-run card");
        let seq = self.record(OutboundCall::Card {
            target: target.to_string(),
            card: card.clone(),
        });
        Ok(format!("om_dryrun_{seq}"))
    }

    async fn create_channel(&self, user_ids: &[String], name: &str) -> GatewayResult<String> {
        tracing::info!(target = "case_bridge::gateway", name = %name, "dry-run channel");
        let seq = self.record(OutboundCall::Channel {
            user_ids: user_ids.to_vec(),
            name: name.to_string(),
        });
        Ok(format!("oc_dryrun_{seq}"))
    }

    async fn lookup_users(
        &self,
        emails: &[String],
        phones: &[String],
    ) -> GatewayResult<UserLookup> {
        let mut lookup = UserLookup::default();
        for email in emails {
            match email.split_once('@') {
                Some((local, domain)) if !local.is_empty() && domain.contains('.') => {
                    lookup.valid.insert(local.to_string(), email.clone());
                }
                _ => lookup.invalid.push(email.clone()),
            }
        }
        for phone in phones {
            let digits: String = phone.chars().filter(char::is_ascii_digit).collect();
            if digits.len() >= 7 {
                lookup.valid.insert(format!("u_{digits}"), phone.clone());
            } else {
                lookup.invalid.push(phone.clone());
            }
        }
        Ok(lookup)
    }

    async fn create_tab(&self, channel_id: &str, url: &str) -> GatewayResult<()> {
        self.record(OutboundCall::Tab {
            channel_id: channel_id.to_string(),
            url: url.to_string(),
        });
        Ok(())
    }
}
