use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::SlackConfig;
use crate::error::AppError;

/// Maximum sample messages included in a detection alert.
pub const MAX_SAMPLES: usize = 3;
const SAMPLE_CHARS: usize = 100;
const DETAIL_CHARS: usize = 150;

/// Structured pipeline events rendered for humans.
#[derive(Debug, Clone, PartialEq)]
pub enum NotificationEvent {
    Detected {
        category: String,
        count: usize,
        samples: Vec<String>,
    },
    Resolved {
        category: String,
        solution_type: String,
        summary: String,
        reused: bool,
    },
    Failed {
        category: String,
        solution_type: String,
        reason: String,
        details: Vec<String>,
    },
}

impl NotificationEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            NotificationEvent::Detected { .. } => "detected",
            NotificationEvent::Resolved { .. } => "resolved",
            NotificationEvent::Failed { .. } => "failed",
        }
    }
}

/// Fire-and-forget delivery. Implementations log their own failures and never
/// propagate them into the pipeline.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: NotificationEvent);
}

// ---------------------------------------------------------------------------
// Public notification helpers
// ---------------------------------------------------------------------------

pub async fn notify_detected(notifier: &dyn Notifier, category: &str, count: usize, samples: &[String]) {
    notifier
        .notify(NotificationEvent::Detected {
            category: category.to_string(),
            count,
            samples: samples.iter().take(MAX_SAMPLES).cloned().collect(),
        })
        .await;
}

pub async fn notify_resolved(
    notifier: &dyn Notifier,
    category: &str,
    solution_type: &str,
    summary: &str,
    reused: bool,
) {
    notifier
        .notify(NotificationEvent::Resolved {
            category: category.to_string(),
            solution_type: solution_type.to_string(),
            summary: summary.to_string(),
            reused,
        })
        .await;
}

pub async fn notify_failed(
    notifier: &dyn Notifier,
    category: &str,
    solution_type: &str,
    reason: &str,
    details: Vec<String>,
) {
    notifier
        .notify(NotificationEvent::Failed {
            category: category.to_string(),
            solution_type: solution_type.to_string(),
            reason: reason.to_string(),
            details: details.into_iter().take(MAX_SAMPLES).collect(),
        })
        .await;
}

// ---------------------------------------------------------------------------
// Slack incoming webhook
// ---------------------------------------------------------------------------

pub struct SlackNotifier {
    http: reqwest::Client,
    webhook_url: Option<String>,
    channel: Option<String>,
    username: String,
}

impl SlackNotifier {
    pub fn new(config: &SlackConfig) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| AppError::Internal(format!("failed to build HTTP client: {e}")))?;
        let webhook_url = config
            .webhook_url
            .clone()
            .filter(|u| config.enabled && !u.trim().is_empty() && !u.contains("${"));
        if config.enabled && webhook_url.is_none() {
            tracing::warn!("Slack notifications enabled but no usable webhook_url; notifications disabled");
        }
        Ok(Self {
            http,
            webhook_url,
            channel: config.channel.clone(),
            username: config.username.clone(),
        })
    }

    fn render(&self, event: &NotificationEvent) -> Value {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let attachment = match event {
            NotificationEvent::Detected { category, count, samples } => {
                let text = samples
                    .iter()
                    .enumerate()
                    .map(|(i, s)| format!("{}. {}", i + 1, truncate(s, SAMPLE_CHARS)))
                    .collect::<Vec<_>>()
                    .join("\n");
                json!({
                    "color": "danger",
                    "title": "Error detected",
                    "fields": [
                        { "title": "Category", "value": category, "short": true },
                        { "title": "Count", "value": count.to_string(), "short": true },
                        { "title": "Detected at", "value": timestamp, "short": true },
                    ],
                    "text": format!("*Samples:*\n```{text}```"),
                })
            }
            NotificationEvent::Resolved { category, solution_type, summary, reused } => json!({
                "color": "good",
                "title": "Error resolved",
                "fields": [
                    { "title": "Category", "value": category, "short": true },
                    { "title": "Solution", "value": solution_type, "short": true },
                    { "title": "Source", "value": if *reused { "stored plan" } else { "new plan" }, "short": true },
                    { "title": "Resolved at", "value": timestamp, "short": true },
                ],
                "text": format!("*Summary:*\n{summary}"),
            }),
            NotificationEvent::Failed { category, solution_type, reason, details } => {
                let text = details
                    .iter()
                    .enumerate()
                    .map(|(i, d)| format!("{}. {}", i + 1, truncate(d, DETAIL_CHARS)))
                    .collect::<Vec<_>>()
                    .join("\n");
                json!({
                    "color": "warning",
                    "title": "Resolution failed",
                    "fields": [
                        { "title": "Category", "value": category, "short": true },
                        { "title": "Solution", "value": solution_type, "short": true },
                        { "title": "Failed at", "value": timestamp, "short": true },
                        { "title": "Follow-up", "value": "manual check required", "short": true },
                    ],
                    "text": format!("*Reason:*\n```{reason}```\n\n*Details:*\n```{text}```"),
                })
            }
        };

        let mut payload = json!({
            "username": self.username,
            "attachments": [attachment],
        });
        if let Some(channel) = &self.channel {
            payload["channel"] = Value::String(channel.clone());
        }
        payload
    }

    async fn send(&self, url: &str, payload: &Value) -> Result<(), AppError> {
        self.http
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|e| AppError::Internal(format!("Slack request failed: {}", e)))?
            .error_for_status()
            .map_err(|e| AppError::Internal(format!("Slack webhook rejected message: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn notify(&self, event: NotificationEvent) {
        let Some(url) = self.webhook_url.as_deref() else {
            tracing::debug!(kind = event.kind(), "Slack disabled, notification skipped");
            return;
        };
        let payload = self.render(&event);
        match self.send(url, &payload).await {
            Ok(()) => tracing::debug!(kind = event.kind(), "Notification delivered"),
            Err(e) => tracing::warn!(kind = event.kind(), "Failed to deliver notification: {}", e),
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max).collect();
        out.push_str("...");
        out
    }
}
