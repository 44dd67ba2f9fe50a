use std::{io::Read, path::Path, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;

use case_bridge::{
    config::{Command, Config, GatewayKind, Settings, SettingsHandle},
    dedup::MemoryDedupTracker,
    dispatch::Dispatcher,
    events::{init_logging, EventEmitter},
    gateway::{DryRunGateway, LarkGateway, NotificationGateway},
    handlers::BridgeContext,
    lifecycle::CaseLifecycle,
    listen_api::ingress_router,
    queue::{DisabledWorkQueue, HttpWorkQueue, WorkQueue},
    store::MemoryCaseStore,
    types::InboundEvent,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::parse();
    init_logging(&cfg)?;

    let dispatcher = build_dispatcher(&cfg)?;
    match &cfg.command {
        Command::Serve { bind } => run_serve(dispatcher, bind, cfg.api_key()).await,
        Command::Handle { path } => run_handle(dispatcher, path.as_deref()).await,
    }
}

fn build_dispatcher(cfg: &Config) -> Result<Dispatcher> {
    let settings = Settings::load(cfg.settings.as_deref())?;
    tracing::info!(
        target = "case_bridge::startup",
        severities = settings.severities.len(),
        services = settings.services.len(),
        accounts = settings.accounts.len(),
        whitelist_enforced = settings.enable_user_whitelist,
        "settings loaded"
    );

    let gateway: Arc<dyn NotificationGateway> = match cfg.gateway {
        GatewayKind::Lark => {
            let (app_id, app_secret) = cfg.app_credentials()?;
            let base_url = cfg.bot_endpoint.base_url();
            tracing::info!(target = "case_bridge::startup", base_url = %base_url, "using lark gateway");
            Arc::new(
                LarkGateway::new(base_url, app_id, app_secret)
                    .context("failed to build lark gateway client")?,
            )
        }
        GatewayKind::DryRun => {
            tracing::info!(target = "case_bridge::startup", "using dry-run gateway");
            Arc::new(DryRunGateway::new())
        }
    };

    let queue: Arc<dyn WorkQueue> = match cfg.queue_url.as_deref() {
        Some(url) if !url.trim().is_empty() => Arc::new(
            HttpWorkQueue::new(url.trim()).context("failed to build work queue client")?,
        ),
        _ => {
            tracing::warn!(
                target = "case_bridge::startup",
                "no --queue-url configured, Q forwards will be refused"
            );
            Arc::new(DisabledWorkQueue)
        }
    };

    let lifecycle = CaseLifecycle::new(
        Arc::new(MemoryCaseStore::new()),
        gateway,
        SettingsHandle::new(settings),
        EventEmitter::new(cfg.emit_events),
    );
    let dedup = Arc::new(MemoryDedupTracker::new(
        Duration::from_secs(cfg.dedup_ttl_secs),
        cfg.dedup_max_entries,
    ));
    Ok(Dispatcher::standard(
        BridgeContext::new(lifecycle, queue),
        dedup,
    ))
}

async fn run_serve(dispatcher: Dispatcher, bind: &str, api_key: Option<String>) -> Result<()> {
    let router = ingress_router(dispatcher, api_key);
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    eprintln!("[case-bridge] listening on http://{bind}");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!(target = "case_bridge::startup", "shutting down");
        })
        .await
        .context("HTTP server error")?;
    Ok(())
}

async fn run_handle(dispatcher: Dispatcher, path: Option<&Path>) -> Result<()> {
    let raw = match path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read event {}", path.display()))?,
        None => {
            let mut raw = String::new();
            std::io::stdin()
                .read_to_string(&mut raw)
                .context("failed to read event from stdin")?;
            raw
        }
    };
    let event: InboundEvent = serde_json::from_str(&raw).context("failed to parse event")?;

    let response = dispatcher.serve_guarded(event).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}
