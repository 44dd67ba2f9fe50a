use std::{
    collections::HashMap,
    fmt,
    sync::LazyLock,
};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::card::CardElement;

pub const MENU_EVENT_TYPE: &str = "application.bot.menu_v6";
pub const CREATE_CASE_MENU_KEY: &str = "create_case";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHeader {
    #[serde(default)]
    pub event_id: String,
    #[serde(default)]
    pub event_type: String,
    #[serde(default)]
    pub create_time: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub tenant_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderId {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub open_id: String,
    #[serde(default)]
    pub union_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    #[serde(default)]
    pub sender_id: SenderId,
    #[serde(default)]
    pub sender_type: String,
    #[serde(default)]
    pub tenant_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, alias = "message_id")]
    pub msg_id: String,
    #[serde(default)]
    pub root_id: String,
    #[serde(default)]
    pub parent_id: String,
    #[serde(default)]
    pub create_time: String,
    #[serde(default)]
    pub chat_id: String,
    #[serde(default)]
    pub chat_type: String,
    #[serde(default, alias = "message_type")]
    pub msg_type: String,
    /// Raw JSON-encoded content string as delivered by the platform.
    #[serde(default)]
    pub content: String,
}

/// Bot menu clicks name the user as an operator rather than a sender.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operator {
    #[serde(default)]
    pub operator_id: SenderId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventBody {
    #[serde(default)]
    pub event_key: String,
    #[serde(default)]
    pub sender: Sender,
    #[serde(default)]
    pub operator: Operator,
    #[serde(default)]
    pub message: Message,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionValue {
    #[serde(default)]
    pub key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CardAction {
    #[serde(default)]
    pub value: ActionValue,
    #[serde(default)]
    pub option: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub form_value: HashMap<String, Value>,
}

impl CardAction {
    pub fn form_str(&self, field: &str) -> Option<&str> {
        self.form_value
            .get(field)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

/// One platform callback. Message events populate `event.message`; card
/// callbacks populate `action` plus the top-level `open_*` coordinates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    #[serde(default)]
    pub schema: String,
    #[serde(default)]
    pub header: EventHeader,
    #[serde(default)]
    pub event: EventBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<CardAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenge: Option<String>,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub open_chat_id: String,
    #[serde(default)]
    pub open_message_id: String,
    /// Per-click token on card callbacks. Unlike `header.token` it differs
    /// for every delivery.
    #[serde(default)]
    pub token: String,
}

impl InboundEvent {
    pub fn sender_user_id(&self) -> &str {
        if !self.user_id.is_empty() {
            return &self.user_id;
        }
        if !self.event.sender.sender_id.user_id.is_empty() {
            return &self.event.sender.sender_id.user_id;
        }
        &self.event.operator.operator_id.user_id
    }

    pub fn chat_id(&self) -> &str {
        if !self.event.message.chat_id.is_empty() {
            return &self.event.message.chat_id;
        }
        &self.open_chat_id
    }

    /// Identifiers under which this event's conversation may be stored, most
    /// specific first. The sender's id doubles as the conversation only where
    /// the bot talks to them one-to-one: menu triggers (no chat at all), p2p
    /// chats, and card callbacks, which carry no chat type.
    pub fn conversation_keys(&self) -> Vec<&str> {
        let mut keys = Vec::with_capacity(2);
        let chat = self.chat_id();
        if !chat.is_empty() {
            keys.push(chat);
        }
        let sender = self.sender_user_id();
        if (chat.is_empty() || self.is_direct_chat()) && !sender.is_empty() && sender != chat {
            keys.push(sender);
        }
        keys
    }

    fn is_direct_chat(&self) -> bool {
        match self.event.message.chat_type.as_str() {
            "p2p" => true,
            "" => self.action.is_some(),
            _ => false,
        }
    }

    pub fn message_id(&self) -> &str {
        if !self.event.message.msg_id.is_empty() {
            return &self.event.message.msg_id;
        }
        &self.open_message_id
    }

    pub fn is_case_menu_trigger(&self) -> bool {
        self.header.event_type == MENU_EVENT_TYPE && self.event.event_key == CREATE_CASE_MENU_KEY
    }

    /// Identifier used for at-most-once handling: the header event id, or
    /// the click token of a card callback. `None` when the delivery carries
    /// neither; such events are never treated as duplicates.
    pub fn dedup_id(&self) -> Option<String> {
        if !self.header.event_id.is_empty() {
            return Some(self.header.event_id.clone());
        }
        if !self.token.is_empty() {
            return Some(format!("card-{}", self.token));
        }
        None
    }

    /// Plain text of a `text` message, with `@_user_N` mentions removed.
    pub fn text_content(&self) -> Option<String> {
        let parsed: Value = serde_json::from_str(&self.event.message.content).ok()?;
        let text = parsed.get("text")?.as_str()?;
        let cleaned = strip_mentions(text);
        Some(cleaned)
    }

    pub fn content_field(&self, field: &str) -> Option<String> {
        let parsed: Value = serde_json::from_str(&self.event.message.content).ok()?;
        parsed
            .get(field)
            .and_then(Value::as_str)
            .map(ToOwned::to_owned)
    }
}

static MENTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@_user_\d+\s*").expect("valid regex"));

fn strip_mentions(text: &str) -> String {
    MENTION.replace_all(text, "").trim().to_string()
}

/// Canonical inbound message kinds. Anything else is a routing error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MsgType {
    Text,
    Image,
    File,
    Card,
    TriggerCardV2,
    FreshComment,
}

impl MsgType {
    pub const ALL: [MsgType; 6] = [
        MsgType::Text,
        MsgType::Image,
        MsgType::File,
        MsgType::Card,
        MsgType::TriggerCardV2,
        MsgType::FreshComment,
    ];

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "text" => Some(MsgType::Text),
            "image" => Some(MsgType::Image),
            "file" => Some(MsgType::File),
            "card" | "interactive" => Some(MsgType::Card),
            "trigger_card_v2" => Some(MsgType::TriggerCardV2),
            "fresh_comment" => Some(MsgType::FreshComment),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MsgType::Text => "text",
            MsgType::Image => "image",
            MsgType::File => "file",
            MsgType::Card => "card",
            MsgType::TriggerCardV2 => "trigger_card_v2",
            MsgType::FreshComment => "fresh_comment",
        }
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical handler tags. Localized command words and button keys are
/// translated once, at ingestion, by [`ActionKey::from_raw`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKey {
    OpenCase,
    TriggerCardV2,
    CardV2Confirm,
    EditTitle,
    EditContent,
    EditAccount,
    EditSeverity,
    EditService,
    Help,
    SearchHistory,
    WhitelistAdd,
    WhitelistRemove,
    WhitelistList,
    AdminSet,
    ForwardToQueue,
    Comment,
}

impl ActionKey {
    pub const ALL: [ActionKey; 16] = [
        ActionKey::OpenCase,
        ActionKey::TriggerCardV2,
        ActionKey::CardV2Confirm,
        ActionKey::EditTitle,
        ActionKey::EditContent,
        ActionKey::EditAccount,
        ActionKey::EditSeverity,
        ActionKey::EditService,
        ActionKey::Help,
        ActionKey::SearchHistory,
        ActionKey::WhitelistAdd,
        ActionKey::WhitelistRemove,
        ActionKey::WhitelistList,
        ActionKey::AdminSet,
        ActionKey::ForwardToQueue,
        ActionKey::Comment,
    ];

    pub fn from_raw(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let exact = match raw {
            "开工单" => Some(ActionKey::OpenCase),
            "trigger_card_v2" => Some(ActionKey::TriggerCardV2),
            "card_v2_confirm" => Some(ActionKey::CardV2Confirm),
            "问题" => Some(ActionKey::EditTitle),
            "内容" => Some(ActionKey::EditContent),
            "账户" => Some(ActionKey::EditAccount),
            "响应速度" => Some(ActionKey::EditSeverity),
            "服务" => Some(ActionKey::EditService),
            "帮助" => Some(ActionKey::Help),
            "历史" => Some(ActionKey::SearchHistory),
            "添加白名单" => Some(ActionKey::WhitelistAdd),
            "删除白名单" => Some(ActionKey::WhitelistRemove),
            "查看白名单" => Some(ActionKey::WhitelistList),
            "设置管理员" => Some(ActionKey::AdminSet),
            // Single letter; matched case-sensitively so a leading "q" in chat stays a comment.
            "Q" => Some(ActionKey::ForwardToQueue),
            "default" => Some(ActionKey::Comment),
            _ => None,
        };
        if exact.is_some() {
            return exact;
        }

        match raw.to_ascii_uppercase().as_str() {
            "SUBJECT" | "OPEN_CASE" => Some(ActionKey::OpenCase),
            "TITLE" => Some(ActionKey::EditTitle),
            "DESCRIPTION" | "CONTENT" => Some(ActionKey::EditContent),
            "ACCOUNT" => Some(ActionKey::EditAccount),
            "SEVERITY" => Some(ActionKey::EditSeverity),
            "SERVICE" => Some(ActionKey::EditService),
            "HELP" => Some(ActionKey::Help),
            "HISTORY" => Some(ActionKey::SearchHistory),
            "WHITELIST_ADD" => Some(ActionKey::WhitelistAdd),
            "WHITELIST_DEL" | "WHITELIST_REMOVE" => Some(ActionKey::WhitelistRemove),
            "WHITELIST" | "WHITELIST_LIST" => Some(ActionKey::WhitelistList),
            "SET_ADMIN" | "ADMIN" => Some(ActionKey::AdminSet),
            _ => None,
        }
    }
}

impl fmt::Display for ActionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            ActionKey::OpenCase => "open_case",
            ActionKey::TriggerCardV2 => "trigger_card_v2",
            ActionKey::CardV2Confirm => "card_v2_confirm",
            ActionKey::EditTitle => "edit_title",
            ActionKey::EditContent => "edit_content",
            ActionKey::EditAccount => "edit_account",
            ActionKey::EditSeverity => "edit_severity",
            ActionKey::EditService => "edit_service",
            ActionKey::Help => "help",
            ActionKey::SearchHistory => "search_history",
            ActionKey::WhitelistAdd => "whitelist_add",
            ActionKey::WhitelistRemove => "whitelist_remove",
            ActionKey::WhitelistList => "whitelist_list",
            ActionKey::AdminSet => "admin_set",
            ActionKey::ForwardToQueue => "forward_to_queue",
            ActionKey::Comment => "comment",
        };
        f.write_str(tag)
    }
}

/// Split a text command into its handler tag and argument. Text that does not
/// start with a known command word goes to the comment handler verbatim.
pub fn parse_command(text: &str) -> (ActionKey, String) {
    let trimmed = text.trim();
    let (head, rest) = match trimmed.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (trimmed, ""),
    };
    match ActionKey::from_raw(head) {
        Some(ActionKey::Comment) | None => (ActionKey::Comment, trimmed.to_string()),
        Some(key) => (key, rest.to_string()),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MsgResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenge: Option<String>,
    #[serde(default)]
    pub elements: Vec<CardElement>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{parse_command, ActionKey, InboundEvent, MsgType};

    fn message_event() -> InboundEvent {
        serde_json::from_value(json!({
            "schema": "2.0",
            "header": {
                "event_id": "ev_1",
                "event_type": "im.message.receive_v1",
                "create_time": "1700000000000",
                "token": "t",
                "app_id": "cli_x",
                "tenant_key": "tk"
            },
            "event": {
                "sender": {
                    "sender_id": { "user_id": "u_1", "open_id": "ou_1" },
                    "sender_type": "user",
                    "tenant_key": "tk"
                },
                "message": {
                    "message_id": "om_1",
                    "chat_id": "oc_1",
                    "chat_type": "group",
                    "message_type": "text",
                    "content": "{\"text\":\"@_user_1 问题 VPN down\"}"
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn parses_wire_shape_with_platform_aliases() {
        let event = message_event();
        assert_eq!(event.header.event_id, "ev_1");
        assert_eq!(event.event.message.msg_id, "om_1");
        assert_eq!(event.event.message.msg_type, "text");
        assert_eq!(event.sender_user_id(), "u_1");
        assert_eq!(event.conversation_keys(), vec!["oc_1"]);
        assert_eq!(event.dedup_id().as_deref(), Some("ev_1"));
    }

    #[test]
    fn menu_operator_counts_as_sender() {
        let event: InboundEvent = serde_json::from_value(json!({
            "header": { "event_id": "ev_m", "event_type": "application.bot.menu_v6" },
            "event": {
                "event_key": "create_case",
                "operator": { "operator_id": { "user_id": "u_7" } }
            }
        }))
        .unwrap();
        assert!(event.is_case_menu_trigger());
        assert_eq!(event.sender_user_id(), "u_7");
        assert_eq!(event.conversation_keys(), vec!["u_7"]);
    }

    #[test]
    fn text_content_strips_mentions() {
        let event = message_event();
        assert_eq!(event.text_content().as_deref(), Some("问题 VPN down"));
    }

    #[test]
    fn card_callback_uses_open_coordinates() {
        let event: InboundEvent = serde_json::from_value(json!({
            "user_id": "u_9",
            "open_chat_id": "oc_9",
            "open_message_id": "om_9",
            "action": { "value": { "key": "响应速度" }, "option": "P1" }
        }))
        .unwrap();
        assert_eq!(event.chat_id(), "oc_9");
        assert_eq!(event.message_id(), "om_9");
        assert_eq!(event.sender_user_id(), "u_9");
        assert_eq!(event.conversation_keys(), vec!["oc_9", "u_9"]);
        assert_eq!(event.dedup_id(), None);
    }

    #[test]
    fn card_click_token_identifies_the_delivery() {
        let event: InboundEvent = serde_json::from_value(json!({
            "open_message_id": "om_9",
            "token": "c-7f3a",
            "action": { "value": { "key": "SEVERITY" }, "option": "P1" }
        }))
        .unwrap();
        assert_eq!(event.dedup_id().as_deref(), Some("card-c-7f3a"));
    }

    #[test]
    fn p2p_chat_falls_back_to_sender() {
        let mut event = message_event();
        event.event.message.chat_type = "p2p".to_string();
        assert_eq!(event.conversation_keys(), vec!["oc_1", "u_1"]);
    }

    #[test]
    fn bilingual_synonyms_share_a_tag() {
        assert_eq!(ActionKey::from_raw("开工单"), Some(ActionKey::OpenCase));
        assert_eq!(ActionKey::from_raw("SUBJECT"), Some(ActionKey::OpenCase));
        assert_eq!(ActionKey::from_raw("内容"), Some(ActionKey::EditContent));
        assert_eq!(ActionKey::from_raw("description"), Some(ActionKey::EditContent));
        assert_eq!(ActionKey::from_raw("帮助"), ActionKey::from_raw("HELP"));
        assert_eq!(ActionKey::from_raw("Q"), Some(ActionKey::ForwardToQueue));
        assert_eq!(ActionKey::from_raw("q"), None);
        assert_eq!(ActionKey::from_raw("unknown"), None);
    }

    #[test]
    fn command_parsing_splits_tag_and_argument() {
        assert_eq!(
            parse_command("问题  VPN is down "),
            (ActionKey::EditTitle, "VPN is down".to_string())
        );
        assert_eq!(parse_command("HELP"), (ActionKey::Help, String::new()));
        assert_eq!(
            parse_command("the VPN is still down"),
            (ActionKey::Comment, "the VPN is still down".to_string())
        );
    }

    #[test]
    fn msg_type_parse_round_trips_known_tags() {
        for msg_type in MsgType::ALL {
            assert_eq!(MsgType::parse(msg_type.as_str()), Some(msg_type));
        }
        assert_eq!(MsgType::parse("sticker"), None);
    }
}
