use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    card::{
        Card, CardMsg, ACCOUNT_KEY, CONTENT_KEY, SERVICE_KEY, SEVERITY_KEY, STATUS_KEY, TITLE_KEY,
    },
    config::Settings,
};

/// Lifecycle states, ordered. Transitions only move forward except for the
/// explicit reset of a root conversation's case back to a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CaseStatus {
    PreNew,
    New,
    Open,
}

impl CaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CaseStatus::PreNew => "PRE_NEW",
            CaseStatus::New => "NEW",
            CaseStatus::Open => "OPEN",
        }
    }
}

impl fmt::Display for CaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseType {
    #[default]
    Case,
    /// A root conversation's record, kept around so the next ticket started
    /// there can reuse it.
    OpenCaseTemplate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseComment {
    pub author_id: String,
    pub message_id: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Case {
    pub case_id: String,
    pub status: CaseStatus,
    #[serde(default)]
    pub case_type: CaseType,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub sev_code: String,
    #[serde(default)]
    pub service_code: String,
    #[serde(default)]
    pub account_key: String,
    /// The conversation the ticket was requested from.
    pub from_channel_id: String,
    /// The conversation the case currently lives in.
    pub channel_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub card_msg: CardMsg,
    #[serde(default)]
    pub comments: Vec<CaseComment>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Case {
    pub fn new(channel_id: &str, user_id: &str, status: CaseStatus) -> Self {
        let now = Utc::now();
        Self {
            case_id: format!("case-{}", uuid::Uuid::new_v4().simple()),
            status,
            case_type: CaseType::Case,
            title: String::new(),
            content: String::new(),
            sev_code: String::new(),
            service_code: String::new(),
            account_key: String::new(),
            from_channel_id: channel_id.to_string(),
            channel_id: channel_id.to_string(),
            user_id: user_id.to_string(),
            card_msg: CardMsg {
                chat_id: channel_id.to_string(),
                user_id: user_id.to_string(),
                ..CardMsg::default()
            },
            comments: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Move forward to `next`. Backward moves are ignored and reported as false.
    pub fn advance(&mut self, next: CaseStatus) -> bool {
        if next < self.status {
            tracing::warn!(
                target = "case_bridge::case",
                case_id = %self.case_id,
                from = %self.status,
                to = %next,
                "refusing backward status transition"
            );
            return false;
        }
        self.status = next;
        true
    }

    /// Clear the ticket fields so the root conversation can start a new one.
    pub fn reset_to_template(&mut self) {
        self.channel_id = self.from_channel_id.clone();
        self.user_id.clear();
        self.title.clear();
        self.content.clear();
        self.sev_code.clear();
        self.service_code.clear();
        self.comments.clear();
        self.case_type = CaseType::OpenCaseTemplate;
        self.status = CaseStatus::PreNew;
        self.card_msg.chat_id = self.channel_id.clone();
        self.card_msg.user_id = self.user_id.clone();
    }

    /// Re-render the stored card from `template` using current field values.
    pub fn render_card(&self, template: &Card) -> Card {
        let mut card = template.clone();
        card.append_content(TITLE_KEY, &self.title);
        card.append_content(CONTENT_KEY, &self.content);
        card.append_content(ACCOUNT_KEY, &self.account_key);
        card.append_content(STATUS_KEY, self.status.as_str());
        card.select_option(SEVERITY_KEY, &self.sev_code);
        card.select_option(SERVICE_KEY, &self.service_code);
        card
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn validate(&self, settings: &Settings) -> Validation {
        let mut problems = Vec::new();
        if self.title.trim().is_empty() {
            problems.push("title is empty".to_string());
        }
        if self.content.trim().is_empty() {
            problems.push("content is empty".to_string());
        }
        let sev = self.sev_code.trim();
        if sev.is_empty() {
            problems.push("severity is not selected".to_string());
        } else if !settings.severities.contains_key(sev) {
            problems.push(format!("severity '{sev}' is not a known severity"));
        }
        let service = self.service_code.trim();
        if service.is_empty() {
            problems.push("service is not selected".to_string());
        } else if !settings.services.contains_key(service) {
            problems.push(format!("service '{service}' is not a known service"));
        }
        if !settings.accounts.contains_key(self.account_key.trim()) {
            if self.account_key.trim().is_empty() {
                problems.push("account is not selected".to_string());
            } else {
                problems.push(format!(
                    "account '{}' is not a configured account",
                    self.account_key.trim()
                ));
            }
        }
        if self.status != CaseStatus::New {
            problems.push(format!("case is {} rather than NEW", self.status));
        }
        Validation { problems }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    pub problems: Vec<String>,
}

impl Validation {
    pub fn is_valid(&self) -> bool {
        self.problems.is_empty()
    }

    pub fn message(&self, case: &Case) -> String {
        format!(
            "Case {} cannot be opened yet: {}. Current values: title=\"{}\" severity=\"{}\" service=\"{}\" account=\"{}\"",
            case.case_id,
            self.problems.join("; "),
            case.title,
            case.sev_code,
            case.service_code,
            case.account_key,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{Case, CaseStatus, CaseType};
    use crate::config::Settings;

    fn complete_case() -> Case {
        let mut case = Case::new("oc_root", "u_1", CaseStatus::New);
        case.title = "VPN down".into();
        case.content = "Tunnel flaps every 5 minutes".into();
        case.sev_code = "P1".into();
        case.service_code = "network".into();
        case.account_key = "prod".into();
        case
    }

    #[test]
    fn complete_case_validates() {
        let settings = Settings::default();
        assert!(complete_case().validate(&settings).is_valid());
    }

    #[test]
    fn each_missing_field_is_reported() {
        let settings = Settings::default();
        let mut case = complete_case();
        case.title = "  ".into();
        case.sev_code = "P9".into();
        case.account_key.clear();

        let validation = case.validate(&settings);
        assert!(!validation.is_valid());
        assert_eq!(validation.problems.len(), 3);
        let message = validation.message(&case);
        assert!(message.contains("title is empty"));
        assert!(message.contains("severity 'P9' is not a known severity"));
        assert!(message.contains("account is not selected"));
    }

    #[test]
    fn non_new_status_fails_validation() {
        let settings = Settings::default();
        let mut case = complete_case();
        case.status = CaseStatus::PreNew;
        assert!(!case.validate(&settings).is_valid());
    }

    #[test]
    fn status_only_moves_forward() {
        let mut case = complete_case();
        assert!(case.advance(CaseStatus::Open));
        assert!(!case.advance(CaseStatus::New));
        assert_eq!(case.status, CaseStatus::Open);
    }

    #[test]
    fn reset_restores_template_defaults() {
        let mut case = complete_case();
        case.channel_id = "oc_case".into();
        case.status = CaseStatus::Open;

        case.reset_to_template();

        assert_eq!(case.channel_id, "oc_root");
        assert!(case.title.is_empty() && case.content.is_empty());
        assert!(case.sev_code.is_empty() && case.service_code.is_empty());
        assert!(case.user_id.is_empty());
        assert_eq!(case.case_type, CaseType::OpenCaseTemplate);
        assert_eq!(case.status, CaseStatus::PreNew);
        assert_eq!(case.card_msg.chat_id, "oc_root");
    }

    #[test]
    fn status_serializes_screaming_snake() {
        let json = serde_json::to_string(&CaseStatus::PreNew).unwrap();
        assert_eq!(json, "\"PRE_NEW\"");
    }
}
