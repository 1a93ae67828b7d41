// Fire-and-forget webhook notifications for run lifecycle events

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::utils::ts_utc;

/// Webhook configuration. `events` empty means all events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub url: String,
    pub timeout_sec: u64,
    pub max_retry: u32,
    pub events: Vec<String>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            timeout_sec: 5,
            max_retry: 3,
            events: Vec::new(),
        }
    }
}

/// Sink for delivery-failure warnings (they end up in `warnings.txt`).
pub type WarnSink = std::sync::Arc<dyn Fn(String) + Send + Sync>;

/// Posts run events to a configured webhook. Delivery is best-effort and
/// detached: a slow or dead endpoint must never stall the pipeline.
pub struct WebhookNotifier {
    config: WebhookConfig,
    client: reqwest::Client,
    warn_sink: Option<WarnSink>,
}

impl WebhookNotifier {
    pub fn new(config: WebhookConfig) -> Option<Self> {
        if !config.enabled || config.url.is_empty() {
            return None;
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_sec.max(1)))
            .build()
            .ok()?;
        Some(Self {
            config,
            client,
            warn_sink: None,
        })
    }

    pub fn with_warn_sink(mut self, sink: WarnSink) -> Self {
        self.warn_sink = Some(sink);
        self
    }

    /// Spawn a detached delivery task for one event.
    pub fn fire(&self, event: &str, payload: serde_json::Value) {
        if !self.config.events.is_empty()
            && !self.config.events.iter().any(|e| e == event)
        {
            return;
        }
        let client = self.client.clone();
        let url = self.config.url.clone();
        let max_retry = self.config.max_retry.max(1);
        let body = json!({
            "event": event,
            "ts": ts_utc(),
            "payload": payload,
        });
        let event = event.to_string();
        let warn_sink = self.warn_sink.clone();
        tokio::spawn(async move {
            for attempt in 1..=max_retry {
                match client.post(&url).json(&body).send().await {
                    Ok(resp) if resp.status().is_success() => return,
                    Ok(resp) => {
                        tracing::debug!(
                            target: "harvester::webhook",
                            %event,
                            status = %resp.status(),
                            attempt,
                            "webhook delivery rejected"
                        );
                    }
                    Err(e) => {
                        tracing::debug!(
                            target: "harvester::webhook",
                            %event,
                            error = %e,
                            attempt,
                            "webhook delivery failed"
                        );
                    }
                }
                tokio::time::sleep(Duration::from_millis(500 * attempt as u64)).await;
            }
            tracing::warn!(target: "harvester::webhook", %event, "webhook delivery gave up");
            if let Some(sink) = warn_sink {
                sink(format!("webhook_fail\t{event}"));
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_config_yields_no_notifier() {
        assert!(WebhookNotifier::new(WebhookConfig::default()).is_none());
        let cfg = WebhookConfig {
            enabled: true,
            url: String::new(),
            ..Default::default()
        };
        assert!(WebhookNotifier::new(cfg).is_none());
    }

    #[test]
    fn test_enabled_config_builds() {
        let cfg = WebhookConfig {
            enabled: true,
            url: "http://127.0.0.1:9/hook".to_string(),
            ..Default::default()
        };
        assert!(WebhookNotifier::new(cfg).is_some());
    }
}
