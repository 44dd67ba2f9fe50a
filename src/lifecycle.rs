//! Case state machine: PRE_NEW -> NEW -> OPEN, plus the reset of a root
//! conversation's case back to a reusable template once its ticket is open.

use std::sync::Arc;

use serde_json::json;

use crate::{
    case::{Case, CaseStatus, CaseType},
    config::{Settings, SettingsHandle},
    error::{BridgeError, Result},
    events::EventEmitter,
    gateway::NotificationGateway,
    store::CaseStore,
    types::InboundEvent,
};

const MAX_CHANNEL_NAME_CHARS: usize = 60;

#[derive(Clone)]
pub struct CaseLifecycle {
    store: Arc<dyn CaseStore>,
    gateway: Arc<dyn NotificationGateway>,
    settings: SettingsHandle,
    emitter: EventEmitter,
}

impl CaseLifecycle {
    pub fn new(
        store: Arc<dyn CaseStore>,
        gateway: Arc<dyn NotificationGateway>,
        settings: SettingsHandle,
        emitter: EventEmitter,
    ) -> Self {
        Self {
            store,
            gateway,
            settings,
            emitter,
        }
    }

    pub fn store(&self) -> &Arc<dyn CaseStore> {
        &self.store
    }

    pub fn gateway(&self) -> &Arc<dyn NotificationGateway> {
        &self.gateway
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.settings.snapshot()
    }

    pub fn settings_handle(&self) -> &SettingsHandle {
        &self.settings
    }

    pub fn emitter(&self) -> &EventEmitter {
        &self.emitter
    }

    pub async fn find_case(&self, event: &InboundEvent) -> Result<Option<Case>> {
        self.store
            .get_by_conversation(&event.conversation_keys())
            .await
    }

    /// The conversation's case, or a fresh one in `status` when there is none.
    /// A reset template is handed back to the requesting user.
    pub async fn case_for_edit(&self, event: &InboundEvent, status: CaseStatus) -> Result<Case> {
        let sender = event.sender_user_id();
        match self.find_case(event).await? {
            Some(mut case) => {
                if case.case_type == CaseType::OpenCaseTemplate {
                    case.case_type = CaseType::Case;
                    case.user_id = sender.to_string();
                    case.card_msg.user_id = sender.to_string();
                    case.advance(status);
                }
                Ok(case)
            }
            None => {
                let conversation = event
                    .conversation_keys()
                    .first()
                    .map(|key| key.to_string())
                    .ok_or_else(|| {
                        BridgeError::Validation("event has no conversation or sender".to_string())
                    })?;
                tracing::info!(
                    target = "case_bridge::lifecycle",
                    conversation = %conversation,
                    status = %status,
                    "creating case for conversation"
                );
                Ok(Case::new(&conversation, sender, status))
            }
        }
    }

    /// Start (or restart) a ticket in the conversation: set the title, render
    /// the card and deliver it. Status only moves forward, and an empty title
    /// never overwrites one already entered. A ticket already past PRE_NEW
    /// gets its current case card back instead of the trigger card.
    pub async fn start_ticket(
        &self,
        event: &InboundEvent,
        title: &str,
        status: CaseStatus,
        template_v2: bool,
    ) -> Result<Case> {
        let settings = self.settings();
        let mut case = self.case_for_edit(event, status).await?;
        if case.status == CaseStatus::Open {
            return Err(BridgeError::Validation(format!(
                "case {} is already open in this conversation",
                case.case_id
            )));
        }
        if case.status <= CaseStatus::PreNew {
            case.advance(status);
        }
        let title = title.trim();
        if !title.is_empty() {
            case.title = title.to_string();
        }

        let template = if template_v2 && case.status == CaseStatus::PreNew {
            &settings.trigger_card_template
        } else {
            &settings.case_card_template
        };
        let card = case.render_card(template);
        let target = case.channel_id.clone();
        let message_id = self.gateway.send_card(&card, &target).await?;

        case.card_msg.chat_id = target;
        case.card_msg.user_id = case.user_id.clone();
        case.card_msg.message_id = message_id;
        case.card_msg.card = card;
        let case = self.store.upsert(case).await?;

        self.emitter.emit(
            "case_pre_new",
            json!({ "case_id": case.case_id, "status": case.status, "channel_id": case.channel_id }),
        );
        Ok(case)
    }

    /// PRE_NEW -> NEW. The conversation must already have a case.
    pub async fn confirm(&self, event: &InboundEvent) -> Result<Case> {
        let mut case = self.find_case(event).await?.ok_or_else(|| {
            BridgeError::CaseNotFound(event.conversation_keys().join(","))
        })?;

        if let Some(action) = &event.action {
            if let Some(title) = action.form_str("title") {
                case.title = title.to_string();
            }
            if let Some(content) = action.form_str("content") {
                case.content = content.to_string();
            }
            if let Some(sev) = action.form_str("severity") {
                case.sev_code = sev.to_string();
            }
            if let Some(service) = action.form_str("service") {
                case.service_code = service.to_string();
            }
            if let Some(account) = action.form_str("account") {
                case.account_key = account.to_string();
            }
        }
        if case.user_id.is_empty() {
            case.user_id = event.sender_user_id().to_string();
        }
        case.case_type = CaseType::Case;
        case.advance(CaseStatus::New);
        self.refresh_card(&mut case);

        let case = self.store.upsert(case).await?;
        self.emitter.emit(
            "case_confirmed",
            json!({ "case_id": case.case_id, "status": case.status }),
        );
        Ok(case)
    }

    /// Re-render the stored card against the current case card template.
    pub fn refresh_card(&self, case: &mut Case) {
        let settings = self.settings();
        case.card_msg.card = case.render_card(&settings.case_card_template);
    }

    /// NEW -> OPEN: validate, create the case channel and persist the opened
    /// case, then reset the root conversation's record to a template.
    pub async fn promote(&self, case: &Case) -> Result<Case> {
        let settings = self.settings();
        let validation = case.validate(&settings);
        if !validation.is_valid() {
            let message = validation.message(case);
            tracing::warn!(
                target = "case_bridge::lifecycle",
                case_id = %case.case_id,
                problems = ?validation.problems,
                "case not ready to open"
            );
            self.emitter.emit(
                "case_validation_failed",
                json!({ "case_id": case.case_id, "problems": validation.problems }),
            );
            return Err(BridgeError::Validation(message));
        }

        let mut opened = case.clone();
        opened.case_id = format!("case-{}", uuid::Uuid::new_v4().simple());
        opened.case_type = CaseType::Case;
        opened.advance(CaseStatus::Open);

        let name = channel_name(&settings.channel_name_prefix, &opened.title);
        let members = vec![opened.user_id.clone()];
        let channel_id = self.gateway.create_channel(&members, &name).await?;
        opened.channel_id = channel_id.clone();
        opened.card_msg.chat_id = channel_id.clone();
        opened.card_msg.card = opened.render_card(&settings.case_card_template);
        let mut opened = self.store.create_with_channel(opened).await?;

        tracing::info!(
            target = "case_bridge::lifecycle",
            case_id = %opened.case_id,
            root_case_id = %case.case_id,
            channel_id = %channel_id,
            "case opened"
        );
        self.emitter.emit(
            "case_opened",
            json!({ "case_id": opened.case_id, "channel_id": channel_id, "root_case_id": case.case_id }),
        );

        if let Some(url) = settings.case_link(&opened.case_id) {
            if let Err(error) = self.gateway.create_tab(&channel_id, &url).await {
                tracing::warn!(target = "case_bridge::lifecycle", channel_id = %channel_id, error = %error, "failed to add case link tab");
            }
        }
        match self
            .gateway
            .send_card(&opened.card_msg.card, &channel_id)
            .await
        {
            Ok(message_id) => {
                opened.card_msg.message_id = message_id;
                opened = self.store.upsert(opened).await?;
            }
            Err(error) => {
                tracing::warn!(target = "case_bridge::lifecycle", channel_id = %channel_id, error = %error, "failed to post case card");
            }
        }

        self.reset_root(case, &opened).await?;
        Ok(opened)
    }

    async fn reset_root(&self, root: &Case, opened: &Case) -> Result<()> {
        let mut root = match self.store.get(&root.case_id).await? {
            Some(stored) => stored,
            None => root.clone(),
        };
        if root.case_id == opened.case_id {
            return Ok(());
        }

        root.reset_to_template();
        self.refresh_card(&mut root);
        let root = self.store.upsert(root).await?;
        tracing::debug!(
            target = "case_bridge::lifecycle",
            root_case_id = %root.case_id,
            channel_id = %root.channel_id,
            "root case reset to template"
        );
        self.emitter.emit(
            "root_case_reset",
            json!({ "case_id": root.case_id, "channel_id": root.channel_id }),
        );

        let notice = format!(
            "Case {} \"{}\" is open in a new group chat.",
            opened.case_id, opened.title
        );
        if let Err(error) = self.gateway.send_text(&root.channel_id, &notice).await {
            tracing::warn!(target = "case_bridge::lifecycle", error = %error, "failed to notify root conversation");
        }
        Ok(())
    }
}

fn channel_name(prefix: &str, title: &str) -> String {
    let title: String = title.trim().chars().take(MAX_CHANNEL_NAME_CHARS).collect();
    if prefix.is_empty() {
        title
    } else {
        format!("{prefix}-{title}")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{channel_name, CaseLifecycle};
    use crate::{
        case::{Case, CaseStatus, CaseType},
        config::{Settings, SettingsHandle},
        error::BridgeError,
        events::EventEmitter,
        gateway::DryRunGateway,
        store::{CaseStore, MemoryCaseStore},
    };

    fn lifecycle() -> (CaseLifecycle, Arc<MemoryCaseStore>, Arc<DryRunGateway>) {
        let store = Arc::new(MemoryCaseStore::new());
        let gateway = Arc::new(DryRunGateway::new());
        let lifecycle = CaseLifecycle::new(
            store.clone(),
            gateway.clone(),
            SettingsHandle::new(Settings::default()),
            EventEmitter::disabled(),
        );
        (lifecycle, store, gateway)
    }

    fn ready_case() -> Case {
        let mut case = Case::new("oc_root", "u_1", CaseStatus::New);
        case.title = "VPN down".into();
        case.content = "Tunnel flaps".into();
        case.sev_code = "P1".into();
        case.service_code = "network".into();
        case.account_key = "prod".into();
        case
    }

    #[tokio::test]
    async fn promote_opens_case_and_resets_root() {
        let (lifecycle, store, gateway) = lifecycle();
        let root = store.upsert(ready_case()).await.unwrap();

        let opened = lifecycle.promote(&root).await.unwrap();

        assert_eq!(opened.status, CaseStatus::Open);
        assert!(opened.channel_id.starts_with("oc_dryrun_"));
        assert_ne!(opened.case_id, root.case_id);
        assert_eq!(gateway.channels_created(), 1);

        let reset = store.get(&root.case_id).await.unwrap().unwrap();
        assert_eq!(reset.case_type, CaseType::OpenCaseTemplate);
        assert!(reset.title.is_empty() && reset.content.is_empty());
        assert!(reset.sev_code.is_empty() && reset.service_code.is_empty());
        assert_eq!(reset.channel_id, "oc_root");
        assert_eq!(gateway.texts_to("oc_root").len(), 1);

        let in_channel = store.get_by_channel(&opened.channel_id).await.unwrap();
        assert_eq!(in_channel.map(|c| c.case_id), Some(opened.case_id));
    }

    #[tokio::test]
    async fn invalid_case_is_not_promoted() {
        let (lifecycle, store, gateway) = lifecycle();
        let mut case = ready_case();
        case.service_code = "mainframe".into();
        let case = store.upsert(case).await.unwrap();

        let err = lifecycle.promote(&case).await.unwrap_err();
        match err {
            BridgeError::Validation(message) => assert!(message.contains("mainframe")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(gateway.channels_created(), 0);
        assert_eq!(store.len(), 1);
        let stored = store.get(&case.case_id).await.unwrap().unwrap();
        assert_eq!(stored.status, CaseStatus::New);
    }

    #[test]
    fn channel_names_are_prefixed_and_bounded() {
        assert_eq!(channel_name("case", " VPN down "), "case-VPN down");
        let long = "x".repeat(200);
        assert_eq!(channel_name("", &long).chars().count(), 60);
    }
}
