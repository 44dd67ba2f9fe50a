//! First-stage dispatch: processors keyed by inbound message type.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;

use crate::{
    error::{BridgeError, Result},
    handlers::{BridgeContext, HandlerRegistry},
    types::{parse_command, ActionKey, InboundEvent, MsgType},
};

#[async_trait]
pub trait Processor: Send + Sync {
    /// Eligibility gate. A refused sender has already been sent a notice;
    /// the caller just stops.
    async fn should_process(&self, event: &InboundEvent) -> bool;

    /// Type-specific side effects. Invokes at most one handler and returns
    /// its error unchanged.
    async fn process(&self, event: &InboundEvent) -> Result<()>;
}

async fn send_no_permission(ctx: &BridgeContext, event: &InboundEvent) {
    let settings = ctx.lifecycle.settings();
    if let Err(error) = ctx.reply(event, &settings.no_permission_msg).await {
        tracing::warn!(target = "case_bridge::processors", error = %error, "failed to send rejection notice");
    }
}

async fn whitelist_gate(ctx: &BridgeContext, event: &InboundEvent) -> bool {
    let sender = event.sender_user_id();
    if ctx.lifecycle.settings().is_whitelisted(sender) {
        return true;
    }
    tracing::info!(
        target = "case_bridge::processors",
        user_id = %sender,
        "sender is not whitelisted, skipping"
    );
    send_no_permission(ctx, event).await;
    false
}

/// Look up `key` and run its handler, honoring the handler's own gate.
async fn run_handler(
    ctx: &BridgeContext,
    handlers: &HandlerRegistry,
    key: ActionKey,
    event: &InboundEvent,
    argument: &str,
) -> Result<()> {
    let handler = handlers
        .get(key)
        .ok_or_else(|| BridgeError::unmatched_action(&key.to_string()))?;
    if !handler.should_handle(event) {
        tracing::info!(
            target = "case_bridge::processors",
            action = %key,
            user_id = %event.sender_user_id(),
            "handler refused sender"
        );
        send_no_permission(ctx, event).await;
        return Ok(());
    }
    tracing::debug!(target = "case_bridge::processors", action = %key, "invoking handler");
    handler.handle(event, argument).await?;
    Ok(())
}

pub struct TextProcessor {
    ctx: BridgeContext,
    handlers: Arc<HandlerRegistry>,
}

#[async_trait]
impl Processor for TextProcessor {
    async fn should_process(&self, event: &InboundEvent) -> bool {
        whitelist_gate(&self.ctx, event).await
    }

    async fn process(&self, event: &InboundEvent) -> Result<()> {
        let text = event.text_content().unwrap_or_default();
        if text.is_empty() {
            tracing::debug!(target = "case_bridge::processors", "empty text message ignored");
            return Ok(());
        }
        let (key, argument) = parse_command(&text);
        run_handler(&self.ctx, &self.handlers, key, event, &argument).await
    }
}

/// Images and files in a case channel become comments referencing the upload.
pub struct AttachmentProcessor {
    ctx: BridgeContext,
    handlers: Arc<HandlerRegistry>,
    kind: MsgType,
}

#[async_trait]
impl Processor for AttachmentProcessor {
    async fn should_process(&self, event: &InboundEvent) -> bool {
        whitelist_gate(&self.ctx, event).await
    }

    async fn process(&self, event: &InboundEvent) -> Result<()> {
        let reference = match self.kind {
            MsgType::Image => event.content_field("image_key"),
            _ => event
                .content_field("file_name")
                .or_else(|| event.content_field("file_key")),
        }
        .unwrap_or_default();
        let argument = format!("[{}] {}", self.kind, reference);
        run_handler(&self.ctx, &self.handlers, ActionKey::Comment, event, &argument).await
    }
}

/// Interactive card callbacks: the action's key picks the handler and the
/// selected option is its argument.
pub struct CardProcessor {
    ctx: BridgeContext,
    handlers: Arc<HandlerRegistry>,
}

#[async_trait]
impl Processor for CardProcessor {
    async fn should_process(&self, event: &InboundEvent) -> bool {
        whitelist_gate(&self.ctx, event).await
    }

    async fn process(&self, event: &InboundEvent) -> Result<()> {
        let action = event
            .action
            .as_ref()
            .ok_or_else(|| BridgeError::unmatched_action(""))?;
        let key = ActionKey::from_raw(&action.value.key)
            .ok_or_else(|| BridgeError::unmatched_action(&action.value.key))?;
        run_handler(&self.ctx, &self.handlers, key, event, &action.option).await
    }
}

pub struct TriggerCardV2Processor {
    ctx: BridgeContext,
    handlers: Arc<HandlerRegistry>,
}

#[async_trait]
impl Processor for TriggerCardV2Processor {
    async fn should_process(&self, event: &InboundEvent) -> bool {
        whitelist_gate(&self.ctx, event).await
    }

    async fn process(&self, event: &InboundEvent) -> Result<()> {
        let title = event.text_content().unwrap_or_default();
        run_handler(
            &self.ctx,
            &self.handlers,
            ActionKey::TriggerCardV2,
            event,
            &title,
        )
        .await
    }
}

/// Re-posts the conversation's current case card.
pub struct FreshCommentProcessor {
    ctx: BridgeContext,
}

#[async_trait]
impl Processor for FreshCommentProcessor {
    async fn should_process(&self, _event: &InboundEvent) -> bool {
        true
    }

    async fn process(&self, event: &InboundEvent) -> Result<()> {
        let lifecycle = &self.ctx.lifecycle;
        let Some(mut case) = lifecycle.find_case(event).await? else {
            return Ok(());
        };
        lifecycle.refresh_card(&mut case);
        let message_id = lifecycle
            .gateway()
            .send_card(&case.card_msg.card, &case.channel_id)
            .await?;
        case.card_msg.chat_id = case.channel_id.clone();
        case.card_msg.message_id = message_id;
        lifecycle.store().upsert(case).await?;
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    processors: HashMap<MsgType, Arc<dyn Processor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn standard(ctx: &BridgeContext, handlers: Arc<HandlerRegistry>) -> Self {
        let mut registry = Self::new();
        registry.register(
            MsgType::Text,
            Arc::new(TextProcessor {
                ctx: ctx.clone(),
                handlers: handlers.clone(),
            }),
        );
        for kind in [MsgType::Image, MsgType::File] {
            registry.register(
                kind,
                Arc::new(AttachmentProcessor {
                    ctx: ctx.clone(),
                    handlers: handlers.clone(),
                    kind,
                }),
            );
        }
        registry.register(
            MsgType::Card,
            Arc::new(CardProcessor {
                ctx: ctx.clone(),
                handlers: handlers.clone(),
            }),
        );
        registry.register(
            MsgType::TriggerCardV2,
            Arc::new(TriggerCardV2Processor {
                ctx: ctx.clone(),
                handlers,
            }),
        );
        registry.register(
            MsgType::FreshComment,
            Arc::new(FreshCommentProcessor { ctx: ctx.clone() }),
        );
        registry
    }

    pub fn register(
        &mut self,
        msg_type: MsgType,
        processor: Arc<dyn Processor>,
    ) -> Option<Arc<dyn Processor>> {
        self.processors.insert(msg_type, processor)
    }

    pub fn get(&self, msg_type: MsgType) -> Option<Arc<dyn Processor>> {
        self.processors.get(&msg_type).cloned()
    }

    /// Resolve a raw message type tag. Unknown or unregistered tags are
    /// routing errors.
    pub fn resolve(&self, raw: &str) -> Result<Arc<dyn Processor>> {
        MsgType::parse(raw)
            .and_then(|msg_type| self.get(msg_type))
            .ok_or_else(|| BridgeError::unknown_message_type(raw))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::ProcessorRegistry;
    use crate::{
        case::CaseStatus,
        config::{Settings, SettingsHandle},
        error::BridgeError,
        events::EventEmitter,
        gateway::DryRunGateway,
        handlers::{BridgeContext, HandlerRegistry},
        lifecycle::CaseLifecycle,
        queue::MemoryWorkQueue,
        store::{CaseStore, MemoryCaseStore},
        types::{InboundEvent, MsgType},
    };

    struct Fixture {
        registry: ProcessorRegistry,
        store: Arc<MemoryCaseStore>,
        gateway: Arc<DryRunGateway>,
    }

    fn fixture(settings: Settings) -> Fixture {
        let store = Arc::new(MemoryCaseStore::new());
        let gateway = Arc::new(DryRunGateway::new());
        let lifecycle = CaseLifecycle::new(
            store.clone(),
            gateway.clone(),
            SettingsHandle::new(settings),
            EventEmitter::disabled(),
        );
        let ctx = BridgeContext::new(lifecycle, Arc::new(MemoryWorkQueue::new()));
        let handlers = Arc::new(HandlerRegistry::standard(&ctx));
        Fixture {
            registry: ProcessorRegistry::standard(&ctx, handlers),
            store,
            gateway,
        }
    }

    fn text(user: &str, body: &str) -> InboundEvent {
        serde_json::from_value(json!({
            "header": { "event_id": "ev_1" },
            "event": {
                "sender": { "sender_id": { "user_id": user } },
                "message": {
                    "message_id": "om_1",
                    "chat_id": "oc_1",
                    "message_type": "text",
                    "content": json!({ "text": body }).to_string()
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn every_message_type_is_registered() {
        let fx = fixture(Settings::default());
        for msg_type in MsgType::ALL {
            assert!(fx.registry.get(msg_type).is_some(), "missing {msg_type}");
        }
    }

    #[test]
    fn unknown_type_is_a_routing_error() {
        let fx = fixture(Settings::default());
        let err = fx.registry.resolve("sticker").err().unwrap();
        assert!(matches!(err, BridgeError::Routing(ref m) if m == "unknown message type: sticker"));
    }

    #[tokio::test]
    async fn whitelist_gate_sends_notice_and_refuses() {
        let mut settings = Settings::default();
        settings.enable_user_whitelist = true;
        let notice = settings.no_permission_msg.clone();
        let fx = fixture(settings);

        let processor = fx.registry.resolve("text").unwrap();
        assert!(!processor.should_process(&text("u_stranger", "问题 hi")).await);
        assert_eq!(fx.gateway.texts_to("oc_1"), vec![notice]);
    }

    #[tokio::test]
    async fn text_command_reaches_its_handler() {
        let fx = fixture(Settings::default());
        let processor = fx.registry.resolve("text").unwrap();
        let event = text("u_1", "@_user_1 内容 tunnel flaps");
        assert!(processor.should_process(&event).await);
        processor.process(&event).await.unwrap();

        let case = fx.store.get_by_channel("oc_1").await.unwrap().unwrap();
        assert_eq!(case.content, "tunnel flaps");
        assert_eq!(case.status, CaseStatus::New);
    }

    #[tokio::test]
    async fn card_action_with_unknown_key_is_a_routing_error() {
        let fx = fixture(Settings::default());
        let event: InboundEvent = serde_json::from_value(json!({
            "user_id": "u_1",
            "open_chat_id": "oc_1",
            "action": { "value": { "key": "not_a_button" }, "option": "x" }
        }))
        .unwrap();

        let processor = fx.registry.resolve("card").unwrap();
        let err = processor.process(&event).await.unwrap_err();
        assert!(
            matches!(err, BridgeError::Routing(ref m) if m == "failed to match action handler: not_a_button")
        );
        assert!(fx.store.is_empty());
    }

    #[tokio::test]
    async fn card_option_is_the_handler_argument() {
        let fx = fixture(Settings::default());
        let event: InboundEvent = serde_json::from_value(json!({
            "user_id": "u_1",
            "open_chat_id": "oc_1",
            "open_message_id": "om_card",
            "action": { "value": { "key": "响应速度" }, "option": "P2" }
        }))
        .unwrap();

        let processor = fx.registry.resolve("card").unwrap();
        processor.process(&event).await.unwrap();
        let case = fx.store.get_by_channel("oc_1").await.unwrap().unwrap();
        assert_eq!(case.sev_code, "P2");
    }
}
