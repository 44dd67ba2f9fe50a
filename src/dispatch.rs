//! Top-level entry point for one inbound event.

use std::{sync::Arc, time::Instant};

use tracing::Instrument;

use crate::{
    case::CaseStatus,
    dedup::DedupTracker,
    error::{BridgeError, Result},
    handlers::{BridgeContext, HandlerRegistry},
    lifecycle::CaseLifecycle,
    processors::ProcessorRegistry,
    types::{InboundEvent, MsgResponse, MsgType},
};

/// Owns the registries for the life of the process. Cloning is cheap; every
/// clone shares the same registries, dedup tracker and collaborators.
#[derive(Clone)]
pub struct Dispatcher {
    processors: Arc<ProcessorRegistry>,
    dedup: Arc<dyn DedupTracker>,
    lifecycle: CaseLifecycle,
}

impl Dispatcher {
    pub fn new(
        processors: Arc<ProcessorRegistry>,
        dedup: Arc<dyn DedupTracker>,
        lifecycle: CaseLifecycle,
    ) -> Self {
        Self {
            processors,
            dedup,
            lifecycle,
        }
    }

    /// Wire the standard handler and processor registries over `ctx`.
    pub fn standard(ctx: BridgeContext, dedup: Arc<dyn DedupTracker>) -> Self {
        let handlers = Arc::new(HandlerRegistry::standard(&ctx));
        let processors = Arc::new(ProcessorRegistry::standard(&ctx, handlers));
        Self::new(processors, dedup, ctx.lifecycle)
    }

    pub fn lifecycle(&self) -> &CaseLifecycle {
        &self.lifecycle
    }

    /// Rewrite the message type the event will be routed by. A card action
    /// always routes as `card`, whatever type the envelope claims; the case
    /// menu trigger routes as `trigger_card_v2`.
    pub fn normalize(event: &mut InboundEvent) {
        if event.action.is_some() {
            event.event.message.msg_type = MsgType::Card.as_str().to_string();
        }
        if event.is_case_menu_trigger() {
            event.event.message.msg_type = MsgType::TriggerCardV2.as_str().to_string();
        }
    }

    pub async fn serve(&self, mut event: InboundEvent) -> Result<MsgResponse> {
        let started = Instant::now();
        Self::normalize(&mut event);
        let span = tracing::info_span!(
            "serve",
            request_id = %event.message_id(),
            event_id = %event.dedup_id().unwrap_or_default(),
            msg_type = %event.event.message.msg_type,
        );

        let result = self.serve_event(event).instrument(span.clone()).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        span.in_scope(|| match &result {
            Ok(_) => tracing::info!(target = "case_bridge::dispatch", elapsed_ms, "Request completed"),
            Err(error) => tracing::warn!(
                target = "case_bridge::dispatch",
                elapsed_ms,
                kind = error.kind().as_str(),
                error = %error,
                "Request failed"
            ),
        });
        result
    }

    async fn serve_event(&self, event: InboundEvent) -> Result<MsgResponse> {
        let msg_type = event.event.message.msg_type.clone();
        let event_id = event.dedup_id();

        let mut response = MsgResponse {
            challenge: event.challenge.clone(),
            elements: Vec::new(),
        };

        if !msg_type.is_empty() {
            let duplicate = match &event_id {
                Some(event_id) => !self.dedup.claim(event_id).await?,
                None => {
                    tracing::debug!(
                        target = "case_bridge::dispatch",
                        msg_type = %msg_type,
                        "delivery carries no event id, dedup skipped"
                    );
                    false
                }
            };
            if duplicate {
                tracing::info!(
                    target = "case_bridge::dispatch",
                    event_id = event_id.as_deref().unwrap_or_default(),
                    msg_type = %msg_type,
                    "duplicate event, skipping processing"
                );
                self.lifecycle
                    .emitter()
                    .emit("duplicate_event", serde_json::json!({ "event_id": event_id }));
                if let Some(case) = self.lifecycle.find_case(&event).await? {
                    response.elements = case.card_msg.card.elements;
                }
                return Ok(response);
            }

            let processor = self.processors.resolve(&msg_type)?;
            if !processor.should_process(&event).await {
                return Ok(response);
            }
            processor.process(&event).await?;
        }

        let Some(case) = self.lifecycle.find_case(&event).await? else {
            return Ok(response);
        };

        let mut elements = case.card_msg.card.elements.clone();
        if case.status == CaseStatus::New {
            match self.lifecycle.promote(&case).await {
                Ok(opened) => elements = opened.card_msg.card.elements,
                Err(BridgeError::Validation(message)) => {
                    tracing::info!(
                        target = "case_bridge::dispatch",
                        case_id = %case.case_id,
                        "case not promoted: {message}"
                    );
                    if let Err(error) = self
                        .lifecycle
                        .gateway()
                        .send_text(&case.channel_id, &message)
                        .await
                    {
                        tracing::warn!(target = "case_bridge::dispatch", error = %error, "failed to send validation notice");
                    }
                }
                Err(error) => {
                    tracing::error!(
                        target = "case_bridge::dispatch",
                        case_id = %case.case_id,
                        kind = error.kind().as_str(),
                        error = %error,
                        "case promotion failed"
                    );
                }
            }
        }
        response.elements = elements;
        tracing::debug!(
            target = "case_bridge::dispatch",
            case_id = %case.case_id,
            status = %case.status,
            "response assembled from case card"
        );
        Ok(response)
    }

    /// Run [`serve`](Self::serve) on its own task so a panicking handler
    /// surfaces as an internal error instead of tearing down the caller.
    pub async fn serve_guarded(&self, event: InboundEvent) -> Result<MsgResponse> {
        let dispatcher = self.clone();
        match tokio::spawn(async move { dispatcher.serve(event).await }).await {
            Ok(result) => result,
            Err(join_error) => {
                let reason = if join_error.is_panic() {
                    "handler panicked"
                } else {
                    "handler task was cancelled"
                };
                tracing::error!(target = "case_bridge::dispatch", error = %join_error, "{reason}");
                Err(BridgeError::Internal(reason.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use async_trait::async_trait;
    use serde_json::json;

    use super::Dispatcher;
    use crate::{
        case::{Case, CaseStatus},
        config::{Settings, SettingsHandle},
        dedup::MemoryDedupTracker,
        error::{BridgeError, Result},
        events::EventEmitter,
        gateway::DryRunGateway,
        handlers::BridgeContext,
        lifecycle::CaseLifecycle,
        processors::{Processor, ProcessorRegistry},
        queue::MemoryWorkQueue,
        store::{CaseStore, MemoryCaseStore},
        types::{InboundEvent, MsgType},
    };

    fn lifecycle(store: Arc<MemoryCaseStore>, gateway: Arc<DryRunGateway>) -> CaseLifecycle {
        CaseLifecycle::new(
            store,
            gateway,
            SettingsHandle::new(Settings::default()),
            EventEmitter::disabled(),
        )
    }

    fn dedup() -> Arc<MemoryDedupTracker> {
        Arc::new(MemoryDedupTracker::new(Duration::from_secs(60), 1000))
    }

    fn standard() -> (Dispatcher, Arc<MemoryCaseStore>, Arc<DryRunGateway>) {
        let store = Arc::new(MemoryCaseStore::new());
        let gateway = Arc::new(DryRunGateway::new());
        let ctx = BridgeContext::new(
            lifecycle(store.clone(), gateway.clone()),
            Arc::new(MemoryWorkQueue::new()),
        );
        (Dispatcher::standard(ctx, dedup()), store, gateway)
    }

    #[test]
    fn action_overrides_explicit_message_type() {
        let mut event: InboundEvent = serde_json::from_value(json!({
            "event": { "message": { "message_type": "text" } },
            "action": { "value": { "key": "SEVERITY" }, "option": "P1" }
        }))
        .unwrap();
        Dispatcher::normalize(&mut event);
        assert_eq!(event.event.message.msg_type, "card");
    }

    #[test]
    fn menu_trigger_routes_to_trigger_card() {
        let mut event: InboundEvent = serde_json::from_value(json!({
            "header": { "event_id": "ev_m", "event_type": "application.bot.menu_v6" },
            "event": { "event_key": "create_case", "operator": {} }
        }))
        .unwrap();
        Dispatcher::normalize(&mut event);
        assert_eq!(event.event.message.msg_type, "trigger_card_v2");
    }

    #[tokio::test]
    async fn handshake_echoes_challenge() {
        let (dispatcher, store, _) = standard();
        let event: InboundEvent =
            serde_json::from_value(json!({ "challenge": "abc", "type": "url_verification" }))
                .unwrap();
        let response = dispatcher.serve(event).await.unwrap();
        assert_eq!(response.challenge.as_deref(), Some("abc"));
        assert!(response.elements.is_empty());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn unknown_type_leaves_case_untouched() {
        let (dispatcher, store, _) = standard();
        let existing = store
            .upsert(Case::new("oc_1", "u_1", CaseStatus::PreNew))
            .await
            .unwrap();
        let event: InboundEvent = serde_json::from_value(json!({
            "header": { "event_id": "ev_1" },
            "event": { "message": { "chat_id": "oc_1", "message_type": "sticker" } }
        }))
        .unwrap();

        let err = dispatcher.serve(event).await.unwrap_err();
        assert!(matches!(err, BridgeError::Routing(_)));
        assert_eq!(store.get(&existing.case_id).await.unwrap(), Some(existing));
    }

    struct Panicking;

    #[async_trait]
    impl Processor for Panicking {
        async fn should_process(&self, _event: &InboundEvent) -> bool {
            true
        }

        async fn process(&self, _event: &InboundEvent) -> Result<()> {
            panic!("boom");
        }
    }

    #[tokio::test]
    async fn panics_become_internal_errors() {
        let store = Arc::new(MemoryCaseStore::new());
        let gateway = Arc::new(DryRunGateway::new());
        let mut processors = ProcessorRegistry::new();
        processors.register(MsgType::Text, Arc::new(Panicking));
        let dispatcher = Dispatcher::new(
            Arc::new(processors),
            dedup(),
            lifecycle(store, gateway),
        );

        let event: InboundEvent = serde_json::from_value(json!({
            "header": { "event_id": "ev_p" },
            "event": { "message": { "chat_id": "oc_1", "message_type": "text" } }
        }))
        .unwrap();
        let err = dispatcher.serve_guarded(event).await.unwrap_err();
        assert!(matches!(err, BridgeError::Internal(ref m) if m == "handler panicked"));
    }
}
