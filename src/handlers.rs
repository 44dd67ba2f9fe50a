//! Second-stage dispatch: handlers keyed by canonical action tag.
//!
//! A handler owns the case fields named by its tag. It persists its own
//! mutation and hands the resulting case back to the caller.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use crate::{
    case::{Case, CaseComment, CaseStatus, CaseType},
    error::{BridgeError, Result},
    lifecycle::CaseLifecycle,
    queue::WorkQueue,
    types::{ActionKey, InboundEvent},
};

const HISTORY_LIMIT: usize = 10;

#[async_trait]
pub trait Handler: Send + Sync {
    /// Permission check for the sender. Refused events get the no-permission
    /// notice and are skipped.
    fn should_handle(&self, _event: &InboundEvent) -> bool {
        true
    }

    async fn handle(&self, event: &InboundEvent, argument: &str) -> Result<Option<Case>>;
}

/// Collaborators shared by every handler and processor.
#[derive(Clone)]
pub struct BridgeContext {
    pub lifecycle: CaseLifecycle,
    pub queue: Arc<dyn WorkQueue>,
}

impl BridgeContext {
    pub fn new(lifecycle: CaseLifecycle, queue: Arc<dyn WorkQueue>) -> Self {
        Self { lifecycle, queue }
    }

    /// Replies go to the conversation, or to the sender when there is none.
    pub fn reply_target(event: &InboundEvent) -> &str {
        event.conversation_keys().first().copied().unwrap_or_default()
    }

    pub async fn reply(&self, event: &InboundEvent, text: &str) -> Result<()> {
        let target = Self::reply_target(event);
        if target.is_empty() {
            tracing::warn!(target = "case_bridge::handlers", "no reply target for event");
            return Ok(());
        }
        self.lifecycle.gateway().send_text(target, text).await?;
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<ActionKey, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every canonical tag wired to its production handler.
    pub fn standard(ctx: &BridgeContext) -> Self {
        let mut registry = Self::new();
        registry.register(ActionKey::OpenCase, Arc::new(OpenCaseHandler::new(ctx.clone())));
        registry.register(
            ActionKey::TriggerCardV2,
            Arc::new(TriggerCardV2Handler::new(ctx.clone())),
        );
        registry.register(
            ActionKey::CardV2Confirm,
            Arc::new(ConfirmHandler::new(ctx.clone())),
        );
        for (key, field) in [
            (ActionKey::EditTitle, CaseField::Title),
            (ActionKey::EditContent, CaseField::Content),
            (ActionKey::EditAccount, CaseField::Account),
            (ActionKey::EditSeverity, CaseField::Severity),
            (ActionKey::EditService, CaseField::Service),
        ] {
            registry.register(key, Arc::new(EditFieldHandler::new(ctx.clone(), field)));
        }
        registry.register(ActionKey::Help, Arc::new(HelpHandler::new(ctx.clone())));
        registry.register(
            ActionKey::SearchHistory,
            Arc::new(SearchHistoryHandler::new(ctx.clone())),
        );
        for (key, op) in [
            (ActionKey::WhitelistAdd, AccessOp::WhitelistAdd),
            (ActionKey::WhitelistRemove, AccessOp::WhitelistRemove),
            (ActionKey::WhitelistList, AccessOp::WhitelistList),
            (ActionKey::AdminSet, AccessOp::AdminSet),
        ] {
            registry.register(key, Arc::new(AccessHandler::new(ctx.clone(), op)));
        }
        registry.register(
            ActionKey::ForwardToQueue,
            Arc::new(ForwardToQueueHandler::new(ctx.clone())),
        );
        registry.register(ActionKey::Comment, Arc::new(CommentHandler::new(ctx.clone())));
        registry
    }

    pub fn register(
        &mut self,
        key: ActionKey,
        handler: Arc<dyn Handler>,
    ) -> Option<Arc<dyn Handler>> {
        self.handlers.insert(key, handler)
    }

    pub fn get(&self, key: ActionKey) -> Option<Arc<dyn Handler>> {
        self.handlers.get(&key).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// `开工单 <title>`: start a ticket in NEW with the given title.
pub struct OpenCaseHandler {
    ctx: BridgeContext,
}

impl OpenCaseHandler {
    pub fn new(ctx: BridgeContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Handler for OpenCaseHandler {
    async fn handle(&self, event: &InboundEvent, argument: &str) -> Result<Option<Case>> {
        let title = argument.trim();
        if title.is_empty() {
            return Err(BridgeError::Validation(
                "a case title is required to open a case".to_string(),
            ));
        }
        let case = self
            .ctx
            .lifecycle
            .start_ticket(event, title, CaseStatus::New, false)
            .await?;
        Ok(Some(case))
    }
}

/// Menu trigger: a PRE_NEW case plus the confirm card sent to the requester.
pub struct TriggerCardV2Handler {
    ctx: BridgeContext,
}

impl TriggerCardV2Handler {
    pub fn new(ctx: BridgeContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Handler for TriggerCardV2Handler {
    async fn handle(&self, event: &InboundEvent, argument: &str) -> Result<Option<Case>> {
        let case = self
            .ctx
            .lifecycle
            .start_ticket(event, argument.trim(), CaseStatus::PreNew, true)
            .await?;
        Ok(Some(case))
    }
}

pub struct ConfirmHandler {
    ctx: BridgeContext,
}

impl ConfirmHandler {
    pub fn new(ctx: BridgeContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Handler for ConfirmHandler {
    async fn handle(&self, event: &InboundEvent, _argument: &str) -> Result<Option<Case>> {
        let lifecycle = &self.ctx.lifecycle;
        let mut case = lifecycle.confirm(event).await?;

        let message_id = lifecycle
            .gateway()
            .send_card(&case.card_msg.card, &case.channel_id)
            .await?;
        case.card_msg.chat_id = case.channel_id.clone();
        case.card_msg.message_id = message_id;
        let case = lifecycle.store().upsert(case).await?;
        Ok(Some(case))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseField {
    Title,
    Content,
    Account,
    Severity,
    Service,
}

impl CaseField {
    fn label(self) -> &'static str {
        match self {
            CaseField::Title => "title",
            CaseField::Content => "content",
            CaseField::Account => "account",
            CaseField::Severity => "severity",
            CaseField::Service => "service",
        }
    }

    fn apply(self, case: &mut Case, value: &str) {
        let slot = match self {
            CaseField::Title => &mut case.title,
            CaseField::Content => &mut case.content,
            CaseField::Account => &mut case.account_key,
            CaseField::Severity => &mut case.sev_code,
            CaseField::Service => &mut case.service_code,
        };
        *slot = value.to_string();
    }
}

/// Sets one ticket field, creating a NEW case when the conversation has none.
pub struct EditFieldHandler {
    ctx: BridgeContext,
    field: CaseField,
}

impl EditFieldHandler {
    pub fn new(ctx: BridgeContext, field: CaseField) -> Self {
        Self { ctx, field }
    }
}

#[async_trait]
impl Handler for EditFieldHandler {
    async fn handle(&self, event: &InboundEvent, argument: &str) -> Result<Option<Case>> {
        let value = argument.trim();
        if value.is_empty() {
            return Err(BridgeError::Validation(format!(
                "no value given for {}",
                self.field.label()
            )));
        }

        let lifecycle = &self.ctx.lifecycle;
        let mut case = lifecycle.case_for_edit(event, CaseStatus::New).await?;
        self.field.apply(&mut case, value);
        lifecycle.refresh_card(&mut case);
        let case = lifecycle.store().upsert(case).await?;

        tracing::debug!(
            target = "case_bridge::handlers",
            case_id = %case.case_id,
            field = self.field.label(),
            "case field updated"
        );
        Ok(Some(case))
    }
}

pub struct HelpHandler {
    ctx: BridgeContext,
}

impl HelpHandler {
    pub fn new(ctx: BridgeContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Handler for HelpHandler {
    async fn handle(&self, event: &InboundEvent, _argument: &str) -> Result<Option<Case>> {
        let settings = self.ctx.lifecycle.settings();
        self.ctx.reply(event, &settings.help_msg).await?;
        Ok(None)
    }
}

/// Lists the sender's most recent cases.
pub struct SearchHistoryHandler {
    ctx: BridgeContext,
}

impl SearchHistoryHandler {
    pub fn new(ctx: BridgeContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Handler for SearchHistoryHandler {
    async fn handle(&self, event: &InboundEvent, _argument: &str) -> Result<Option<Case>> {
        let sender = event.sender_user_id();
        let cases = self.ctx.lifecycle.store().list_by_user(sender).await?;
        let lines: Vec<String> = cases
            .iter()
            .filter(|case| case.case_type == CaseType::Case)
            .take(HISTORY_LIMIT)
            .map(|case| {
                format!(
                    "- {} [{}] {} ({})",
                    case.case_id,
                    case.status,
                    case.title,
                    case.created_at.format("%Y-%m-%d")
                )
            })
            .collect();

        let text = if lines.is_empty() {
            "No cases found.".to_string()
        } else {
            format!("Your recent cases:\n{}", lines.join("\n"))
        };
        self.ctx.reply(event, &text).await?;
        Ok(None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessOp {
    WhitelistAdd,
    WhitelistRemove,
    WhitelistList,
    AdminSet,
}

/// Whitelist and admin maintenance. Admin-only; contacts are emails or phone
/// numbers resolved through the gateway.
pub struct AccessHandler {
    ctx: BridgeContext,
    op: AccessOp,
}

impl AccessHandler {
    pub fn new(ctx: BridgeContext, op: AccessOp) -> Self {
        Self { ctx, op }
    }
}

fn split_contacts(argument: &str) -> (Vec<String>, Vec<String>) {
    let mut emails = Vec::new();
    let mut phones = Vec::new();
    for token in argument
        .split(|c: char| c.is_whitespace() || c == ',' || c == '，' || c == ';')
        .map(str::trim)
        .filter(|token| !token.is_empty())
    {
        if token.contains('@') {
            emails.push(token.to_string());
        } else {
            phones.push(token.to_string());
        }
    }
    (emails, phones)
}

#[async_trait]
impl Handler for AccessHandler {
    fn should_handle(&self, event: &InboundEvent) -> bool {
        self.ctx
            .lifecycle
            .settings()
            .is_admin(event.sender_user_id())
    }

    async fn handle(&self, event: &InboundEvent, argument: &str) -> Result<Option<Case>> {
        let lifecycle = &self.ctx.lifecycle;
        if self.op == AccessOp::WhitelistList {
            let settings = lifecycle.settings();
            let listed = |set: &std::collections::BTreeSet<String>| {
                if set.is_empty() {
                    "(none)".to_string()
                } else {
                    set.iter().cloned().collect::<Vec<_>>().join(", ")
                }
            };
            let text = format!(
                "Whitelist: {}\nAdmins: {}",
                listed(&settings.user_whitelist),
                listed(&settings.admins)
            );
            self.ctx.reply(event, &text).await?;
            return Ok(None);
        }

        let (emails, phones) = split_contacts(argument);
        if emails.is_empty() && phones.is_empty() {
            return Err(BridgeError::Validation(
                "no email or phone number given".to_string(),
            ));
        }
        let lookup = lifecycle.gateway().lookup_users(&emails, &phones).await?;
        let ids: Vec<String> = lookup.valid.keys().cloned().collect();

        let op = self.op;
        lifecycle.settings_handle().update(|settings| match op {
            AccessOp::WhitelistAdd => settings.user_whitelist.extend(ids.iter().cloned()),
            AccessOp::WhitelistRemove => {
                for id in &ids {
                    settings.user_whitelist.remove(id);
                }
            }
            AccessOp::AdminSet => settings.admins.extend(ids.iter().cloned()),
            AccessOp::WhitelistList => {}
        });

        tracing::info!(
            target = "case_bridge::handlers",
            op = ?op,
            by = %event.sender_user_id(),
            resolved = ids.len(),
            unresolved = lookup.invalid.len(),
            "access list updated"
        );
        lifecycle.emitter().emit(
            "access_updated",
            json!({ "op": format!("{op:?}"), "user_ids": ids, "invalid": lookup.invalid }),
        );

        let mut text = if ids.is_empty() {
            "No users were updated.".to_string()
        } else {
            let contacts: Vec<&str> = lookup.valid.values().map(String::as_str).collect();
            format!("Updated: {}", contacts.join(", "))
        };
        if !lookup.invalid.is_empty() {
            text.push_str(&format!("\nNot found: {}", lookup.invalid.join(", ")));
        }
        self.ctx.reply(event, &text).await?;
        Ok(None)
    }
}

/// `Q <text>`: hands the text to the downstream queue. Never touches the case.
pub struct ForwardToQueueHandler {
    ctx: BridgeContext,
}

impl ForwardToQueueHandler {
    pub fn new(ctx: BridgeContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Handler for ForwardToQueueHandler {
    async fn handle(&self, event: &InboundEvent, argument: &str) -> Result<Option<Case>> {
        let content = argument.trim();
        if content.is_empty() {
            return Err(BridgeError::Validation("nothing to forward".to_string()));
        }
        let ordering_key = match event.message_id() {
            "" => event
                .dedup_id()
                .unwrap_or_else(|| event.sender_user_id().to_string()),
            id => id.to_string(),
        };
        self.ctx.queue.enqueue(content, &ordering_key).await?;
        Ok(None)
    }
}

/// Free text in an open case's channel is recorded as a case comment.
pub struct CommentHandler {
    ctx: BridgeContext,
}

impl CommentHandler {
    pub fn new(ctx: BridgeContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Handler for CommentHandler {
    async fn handle(&self, event: &InboundEvent, argument: &str) -> Result<Option<Case>> {
        let body = argument.trim();
        if body.is_empty() {
            return Ok(None);
        }
        let lifecycle = &self.ctx.lifecycle;
        let Some(mut case) = lifecycle.find_case(event).await? else {
            tracing::debug!(target = "case_bridge::handlers", "comment outside any case ignored");
            return Ok(None);
        };
        if case.status != CaseStatus::Open {
            tracing::debug!(
                target = "case_bridge::handlers",
                case_id = %case.case_id,
                status = %case.status,
                "comment on a case that is not open ignored"
            );
            return Ok(None);
        }

        case.comments.push(CaseComment {
            author_id: event.sender_user_id().to_string(),
            message_id: event.message_id().to_string(),
            body: body.to_string(),
            created_at: Utc::now(),
        });
        let case = lifecycle.store().upsert(case).await?;
        Ok(Some(case))
    }
}
