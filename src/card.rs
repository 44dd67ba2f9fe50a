//! Interactive card model.
//!
//! Cards are stored as templates in the settings snapshot and rendered per
//! case. Elements are addressed by the stable key carried in
//! `extra.value.key`, never by position, so templates can be reordered
//! without touching the renderer.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const TITLE_KEY: &str = "title";
pub const CONTENT_KEY: &str = "content";
pub const SEVERITY_KEY: &str = "severity";
pub const SERVICE_KEY: &str = "service";
pub const ACCOUNT_KEY: &str = "account";
pub const STATUS_KEY: &str = "status";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardConfig {
    #[serde(default)]
    pub wide_screen_mode: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Text {
    pub tag: String,
    pub content: String,
}

impl Text {
    pub fn markdown(content: impl Into<String>) -> Self {
        Self {
            tag: "lark_md".to_string(),
            content: content.into(),
        }
    }

    pub fn plain(content: impl Into<String>) -> Self {
        Self {
            tag: "plain_text".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementValue {
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectOption {
    pub text: Text,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extra {
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<Text>,
    #[serde(default)]
    pub value: ElementValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_option: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<SelectOption>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardHeader {
    #[serde(default)]
    pub template: String,
    pub title: Text,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardElement {
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<Text>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Extra>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,
    /// Form inputs and buttons are passed through untouched.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<Value>,
}

impl CardElement {
    pub fn key(&self) -> Option<&str> {
        self.extra
            .as_ref()
            .map(|extra| extra.value.key.as_str())
            .filter(|key| !key.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    #[serde(default)]
    pub config: CardConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<CardHeader>,
    #[serde(default)]
    pub elements: Vec<CardElement>,
}

impl Card {
    pub fn element_mut(&mut self, key: &str) -> Option<&mut CardElement> {
        self.elements
            .iter_mut()
            .find(|element| element.key() == Some(key))
    }

    /// Append `value` to the content of the element keyed `key`.
    /// Returns false when the template has no such element.
    pub fn append_content(&mut self, key: &str, value: &str) -> bool {
        let Some(element) = self.element_mut(key) else {
            tracing::debug!(target = "case_bridge::card", key = %key, "no card element for key");
            return false;
        };
        match element.text.as_mut() {
            Some(text) if element.content.is_empty() => text.content.push_str(value),
            _ => element.content.push_str(value),
        }
        true
    }

    /// Pre-select `option` on the select element keyed `key`.
    pub fn select_option(&mut self, key: &str, option: &str) -> bool {
        let Some(extra) = self
            .element_mut(key)
            .and_then(|element| element.extra.as_mut())
        else {
            return false;
        };
        if option.is_empty() {
            extra.initial_option = None;
        } else {
            extra.initial_option = Some(option.to_string());
        }
        true
    }
}

/// A card bound to its delivery coordinates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardMsg {
    #[serde(default)]
    pub chat_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub card: Card,
}
