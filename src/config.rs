use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::card::{
    Card, CardConfig, CardElement, CardHeader, ElementValue, Extra, SelectOption, Text,
    ACCOUNT_KEY, CONTENT_KEY, SERVICE_KEY, SEVERITY_KEY, STATUS_KEY, TITLE_KEY,
};

#[derive(Debug, Parser, Clone)]
#[command(name = "case-bridge")]
#[command(about = "Routes chat-platform events into a support case lifecycle")]
pub struct Config {
    #[command(subcommand)]
    pub command: Command,

    /// JSON settings file (code maps, whitelists, card templates).
    #[arg(long, global = true, env = "CASE_BRIDGE_SETTINGS")]
    pub settings: Option<PathBuf>,

    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[arg(long, global = true, default_value_t = false)]
    pub json_logs: bool,

    /// Emit one JSON line per case lifecycle transition on stderr.
    #[arg(long, global = true, default_value_t = false)]
    pub emit_events: bool,

    #[arg(long, global = true, value_enum, default_value = "dry-run")]
    pub gateway: GatewayKind,

    #[arg(long, global = true, value_enum, env = "BOT_ENDPOINT", default_value = "lark")]
    pub bot_endpoint: BotEndpoint,

    #[arg(long, global = true, env = "APP_ID")]
    pub app_id: Option<String>,

    #[arg(long, global = true, env = "APP_SECRET", hide_env_values = true)]
    pub app_secret: Option<String>,

    /// Downstream work queue endpoint. Without one, Q forwards are refused.
    #[arg(long, global = true, env = "QUEUE_URL")]
    pub queue_url: Option<String>,

    /// Shared secret required on `POST /event` via `X-API-Key` or a bearer token.
    #[arg(long, global = true, env = "CASE_BRIDGE_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    #[arg(long, global = true, default_value_t = 86_400)]
    pub dedup_ttl_secs: u64,

    #[arg(long, global = true, default_value_t = 100_000)]
    pub dedup_max_entries: usize,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Accept platform callbacks over HTTP.
    Serve {
        #[arg(long, default_value = "127.0.0.1:8787")]
        bind: String,
    },
    /// Process a single event and print the response.
    Handle {
        /// Event JSON file; stdin when omitted.
        path: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum GatewayKind {
    Lark,
    DryRun,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BotEndpoint {
    Lark,
    Feishu,
}

impl BotEndpoint {
    pub fn base_url(self) -> &'static str {
        match self {
            BotEndpoint::Lark => "https://open.larksuite.com",
            BotEndpoint::Feishu => "https://open.feishu.cn",
        }
    }
}

impl Config {
    pub fn api_key(&self) -> Option<String> {
        non_empty(self.api_key.as_deref())
    }

    /// App credentials for the live gateway; missing values fail startup.
    pub fn app_credentials(&self) -> Result<(String, String)> {
        let app_id = non_empty(self.app_id.as_deref());
        let app_secret = non_empty(self.app_secret.as_deref());
        match (app_id, app_secret) {
            (Some(id), Some(secret)) => Ok((id, secret)),
            (None, _) => bail!("--app-id (or APP_ID) is required for the lark gateway"),
            (_, None) => bail!("--app-secret (or APP_SECRET) is required for the lark gateway"),
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountProfile {
    #[serde(default)]
    pub account_id: String,
    #[serde(default)]
    pub display_name: String,
}

/// Domain settings. Loaded once; treated as an immutable snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub severities: BTreeMap<String, String>,
    pub services: BTreeMap<String, String>,
    pub accounts: BTreeMap<String, AccountProfile>,
    pub user_whitelist: BTreeSet<String>,
    pub admins: BTreeSet<String>,
    pub enable_user_whitelist: bool,
    pub no_permission_msg: String,
    pub help_msg: String,
    pub case_card_template: Card,
    pub trigger_card_template: Card,
    /// `{case_id}` is replaced with the opened case id.
    pub case_link_url: Option<String>,
    pub channel_name_prefix: String,
}

impl Default for Settings {
    fn default() -> Self {
        let severities: BTreeMap<String, String> = [
            ("P1", "Critical - business down"),
            ("P2", "Urgent - production impaired"),
            ("P3", "High - production degraded"),
            ("P4", "Normal - general guidance"),
            ("P5", "Low - question"),
        ]
        .into_iter()
        .map(|(code, label)| (code.to_string(), label.to_string()))
        .collect();
        let services: BTreeMap<String, String> = [
            ("network", "Networking"),
            ("compute", "Compute"),
            ("storage", "Storage"),
            ("database", "Database"),
            ("billing", "Billing"),
        ]
        .into_iter()
        .map(|(code, label)| (code.to_string(), label.to_string()))
        .collect();
        let accounts = BTreeMap::from([(
            "prod".to_string(),
            AccountProfile {
                account_id: "000000000000".to_string(),
                display_name: "Production".to_string(),
            },
        )]);

        let case_card_template = default_case_card(&severities, &services);
        Self {
            severities,
            services,
            accounts,
            user_whitelist: BTreeSet::new(),
            admins: BTreeSet::new(),
            enable_user_whitelist: false,
            no_permission_msg: "You are not allowed to open support cases. Ask an administrator to add you to the whitelist.".to_string(),
            help_msg: "Commands: 开工单/SUBJECT <title>, 问题/TITLE <title>, 内容/DESCRIPTION <text>, 账户/ACCOUNT <key>, 响应速度/SEVERITY <code>, 服务/SERVICE <code>, 历史/HISTORY, 帮助/HELP".to_string(),
            case_card_template,
            trigger_card_template: default_trigger_card(),
            case_link_url: None,
            channel_name_prefix: "case".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from `path`, or built-in defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read settings {}", path.display()))?;
                serde_json::from_str::<Settings>(&raw)
                    .with_context(|| format!("failed to parse settings {}", path.display()))?
            }
            None => Settings::default(),
        };
        settings.apply_env_overrides(|name| std::env::var(name).ok());
        Ok(settings)
    }

    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(flag) = lookup("ENABLE_USER_WHITELIST") {
            self.enable_user_whitelist = flag.trim().eq_ignore_ascii_case("true");
        }
    }

    pub fn is_whitelisted(&self, user_id: &str) -> bool {
        !self.enable_user_whitelist
            || self.user_whitelist.contains(user_id)
            || self.admins.contains(user_id)
    }

    pub fn is_admin(&self, user_id: &str) -> bool {
        self.admins.contains(user_id)
    }

    pub fn case_link(&self, case_id: &str) -> Option<String> {
        self.case_link_url
            .as_deref()
            .filter(|pattern| !pattern.is_empty())
            .map(|pattern| pattern.replace("{case_id}", case_id))
    }
}

fn keyed_div(key: &str, label: &str) -> CardElement {
    CardElement {
        tag: "div".to_string(),
        content: label.to_string(),
        extra: Some(Extra {
            tag: "overflow".to_string(),
            value: ElementValue {
                key: key.to_string(),
            },
            ..Extra::default()
        }),
        ..CardElement::default()
    }
}

fn keyed_select(key: &str, label: &str, options: &BTreeMap<String, String>) -> CardElement {
    CardElement {
        tag: "div".to_string(),
        text: Some(Text::markdown(label)),
        extra: Some(Extra {
            tag: "select_static".to_string(),
            placeholder: Some(Text::plain(label)),
            value: ElementValue {
                key: key.to_string(),
            },
            initial_option: None,
            options: options
                .iter()
                .map(|(code, text)| SelectOption {
                    text: Text::plain(format!("{code} {text}")),
                    value: code.clone(),
                })
                .collect(),
        }),
        ..CardElement::default()
    }
}

fn default_case_card(
    severities: &BTreeMap<String, String>,
    services: &BTreeMap<String, String>,
) -> Card {
    Card {
        config: CardConfig {
            wide_screen_mode: true,
        },
        header: Some(CardHeader {
            template: "blue".to_string(),
            title: Text::plain("Support case"),
        }),
        elements: vec![
            keyed_div(TITLE_KEY, "**Title:** "),
            keyed_div(CONTENT_KEY, "**Description:** "),
            keyed_select(SEVERITY_KEY, "**Severity**", severities),
            keyed_select(SERVICE_KEY, "**Service**", services),
            keyed_div(ACCOUNT_KEY, "**Account:** "),
            keyed_div(STATUS_KEY, "**Status:** "),
        ],
    }
}

fn default_trigger_card() -> Card {
    Card {
        config: CardConfig {
            wide_screen_mode: true,
        },
        header: Some(CardHeader {
            template: "orange".to_string(),
            title: Text::plain("Open a support case"),
        }),
        elements: vec![
            keyed_div(TITLE_KEY, "**Title:** "),
            CardElement {
                tag: "action".to_string(),
                actions: vec![json!({
                    "tag": "button",
                    "type": "primary",
                    "text": { "tag": "plain_text", "content": "Confirm" },
                    "value": { "key": "card_v2_confirm" }
                })],
                ..CardElement::default()
            },
        ],
    }
}

/// Shared, swappable settings snapshot. Readers clone the `Arc`; writers build
/// a new snapshot and replace it, so a request never sees a half-applied edit.
#[derive(Debug, Clone)]
pub struct SettingsHandle {
    inner: Arc<RwLock<Arc<Settings>>>,
}

impl SettingsHandle {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(settings))),
        }
    }

    pub fn snapshot(&self) -> Arc<Settings> {
        self.inner.read().clone()
    }

    pub fn update<F>(&self, edit: F) -> Arc<Settings>
    where
        F: FnOnce(&mut Settings),
    {
        let mut guard = self.inner.write();
        let mut next = Settings::clone(&guard);
        edit(&mut next);
        let next = Arc::new(next);
        *guard = next.clone();
        next
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use clap::Parser;

    use super::{BotEndpoint, Command, Config, GatewayKind, Settings, SettingsHandle};
    use crate::card::TITLE_KEY;

    #[test]
    fn cli_defaults() {
        let cfg = Config::parse_from(["case-bridge", "serve"]);
        assert!(matches!(cfg.command, Command::Serve { ref bind } if bind == "127.0.0.1:8787"));
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.gateway, GatewayKind::DryRun);
        assert_eq!(cfg.dedup_ttl_secs, 86_400);
        assert_eq!(cfg.dedup_max_entries, 100_000);
        assert!(!cfg.emit_events);
    }

    #[test]
    fn lark_credentials_are_required() {
        let cfg = Config::parse_from([
            "case-bridge",
            "--gateway",
            "lark",
            "--app-id",
            "cli_1",
            "--app-secret",
            " ",
            "handle",
        ]);
        let err = cfg.app_credentials().unwrap_err();
        assert!(err.to_string().contains("--app-secret"));
    }

    #[test]
    fn endpoints_resolve_base_urls() {
        assert_eq!(BotEndpoint::Feishu.base_url(), "https://open.feishu.cn");
        assert_eq!(BotEndpoint::Lark.base_url(), "https://open.larksuite.com");
    }

    #[test]
    fn settings_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"severities": {{"sev-a": "A"}}, "user_whitelist": ["u_1"], "enable_user_whitelist": true}}"#
        )
        .unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.severities.len(), 1);
        assert!(settings.is_whitelisted("u_1"));
        assert!(!settings.is_whitelisted("u_2"));
        assert!(settings.services.contains_key("network"));
    }

    #[test]
    fn malformed_settings_fail_with_context() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        let err = Settings::load(Some(file.path())).unwrap_err();
        assert!(err.to_string().contains("failed to parse settings"));
    }

    #[test]
    fn env_flag_enables_whitelist() {
        let mut settings = Settings::default();
        settings.apply_env_overrides(|name| {
            (name == "ENABLE_USER_WHITELIST").then(|| "TRUE".to_string())
        });
        assert!(settings.enable_user_whitelist);
        assert!(!settings.is_whitelisted("u_1"));
    }

    #[test]
    fn default_templates_are_keyed() {
        let settings = Settings::default();
        assert!(settings
            .trigger_card_template
            .elements
            .iter()
            .any(|e| e.key() == Some(TITLE_KEY)));
        assert_eq!(settings.case_link("c-1"), None);
    }

    #[test]
    fn handle_update_publishes_new_snapshot() {
        let handle = SettingsHandle::new(Settings::default());
        let before = handle.snapshot();
        handle.update(|s| {
            s.admins.insert("u_admin".to_string());
        });
        let after = handle.snapshot();

        assert!(!before.is_admin("u_admin"));
        assert!(after.is_admin("u_admin"));
    }
}
