use std::io::{self, Write};

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::Config;

pub fn init_logging(cfg: &Config) -> Result<()> {
    let filter =
        EnvFilter::try_new(cfg.log_level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));

    if cfg.json_logs {
        let subscriber = fmt::Subscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = fmt::Subscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .with_ansi(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(())
}

/// Writes case lifecycle transitions as JSON lines on stderr.
#[derive(Clone, Debug)]
pub struct EventEmitter {
    enabled: bool,
}

impl EventEmitter {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn disabled() -> Self {
        Self::new(false)
    }

    pub fn emit<T: Serialize>(&self, event_type: &str, payload: T) {
        if !self.enabled {
            return;
        }

        let line = json!({
            "ts": Utc::now().to_rfc3339(),
            "type": event_type,
            "payload": payload,
        });

        let mut stderr = io::stderr().lock();
        let _ = writeln!(stderr, "{}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::EventEmitter;
    use serde_json::json;

    #[test]
    fn emit_disabled_is_noop() {
        let emitter = EventEmitter::disabled();
        emitter.emit("case_opened", json!({"case_id": "c-1"}));
    }

    #[test]
    fn emit_enabled_no_panic() {
        let emitter = EventEmitter::new(true);
        emitter.emit("case_opened", json!({"case_id": "c-1", "channel_id": "oc_2"}));
        emitter.emit("duplicate_event", "ev_1");
    }
}
