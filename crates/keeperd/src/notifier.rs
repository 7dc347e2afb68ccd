//! Notification system - pushes lifecycle notices to external channels
//!
//! Supports:
//! - Log sink (always on, via tracing)
//! - Webhook sink (JSON POST, e.g. to a chat bot relay)
//! - Fan-out to several sinks
//!
//! Delivery is best effort. A failed notice is logged and dropped; it never
//! rolls back recorded state and is never retried.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keeper_common::{EventKind, Status};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    /// Start command issued on request
    StartRequested,
    /// Start observed that nobody here asked for
    Starting,
    /// First healthy reading of a session
    Started,
    StartFailed,
    /// Unhealthy past the grace window
    HealthLost,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub kind: NoticeKind,
    pub at: DateTime<Utc>,
    /// Event this notice reports, if one was recorded
    pub event: Option<EventKind>,
    pub observed: Status,
    pub message: String,
}

impl Notice {
    pub fn new(
        kind: NoticeKind,
        at: DateTime<Utc>,
        event: Option<EventKind>,
        observed: Status,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            at,
            event,
            observed,
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notice: &Notice) -> Result<()>;
}

/// Writes every notice to the daemon log.
#[derive(Debug, Default, Clone)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn notify(&self, notice: &Notice) -> Result<()> {
        info!("[NOTIFY] {}", notice.message);
        Ok(())
    }
}

/// POSTs each notice as JSON.
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    /// The client always carries `timeout`; notices are delivered from the
    /// monitor task, which must not wait on a hung endpoint.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build webhook HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn notify(&self, notice: &Notice) -> Result<()> {
        self.client
            .post(&self.url)
            .json(notice)
            .send()
            .await
            .with_context(|| format!("Failed to reach webhook {}", self.url))?
            .error_for_status()
            .context("Webhook rejected notice")?;
        debug!("Webhook delivered {:?}", notice.kind);
        Ok(())
    }
}

/// Delivers to every inner sink; one failure does not stop the others.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl NotificationSink for FanoutSink {
    async fn notify(&self, notice: &Notice) -> Result<()> {
        let mut failed = 0;
        for sink in &self.sinks {
            if let Err(e) = sink.notify(notice).await {
                warn!("Notification delivery failed: {:#}", e);
                failed += 1;
            }
        }
        if failed > 0 {
            anyhow::bail!("{} of {} sinks failed", failed, self.sinks.len());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<NoticeKind>>,
    }

    #[async_trait]
    impl NotificationSink for Recording {
        async fn notify(&self, notice: &Notice) -> Result<()> {
            self.seen.lock().unwrap().push(notice.kind);
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl NotificationSink for Broken {
        async fn notify(&self, _notice: &Notice) -> Result<()> {
            anyhow::bail!("channel closed")
        }
    }

    fn notice() -> Notice {
        Notice::new(
            NoticeKind::Started,
            Utc::now(),
            Some(EventKind::HealthOk),
            Status::RunningHealthy,
            "Server started successfully!",
        )
    }

    #[tokio::test]
    async fn test_fanout_reaches_all_sinks_despite_failure() {
        let a = Arc::new(Recording::default());
        let b = Arc::new(Recording::default());
        let fanout = FanoutSink::new()
            .with(a.clone())
            .with(Arc::new(Broken))
            .with(b.clone());

        let result = fanout.notify(&notice()).await;
        assert!(result.is_err());
        assert_eq!(*a.seen.lock().unwrap(), vec![NoticeKind::Started]);
        assert_eq!(*b.seen.lock().unwrap(), vec![NoticeKind::Started]);
    }

    #[tokio::test]
    async fn test_log_sink_never_fails() {
        assert!(LogSink.notify(&notice()).await.is_ok());
    }

    #[tokio::test]
    async fn test_webhook_gives_up_on_silent_endpoint() {
        // accepts the connection, never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let sink = WebhookSink::new(format!("http://{}/notify", addr), Duration::from_millis(200))
            .unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), sink.notify(&notice()))
            .await
            .expect("webhook delivery must be bounded by its timeout");
        assert!(result.is_err());
    }

    #[test]
    fn test_notice_json_shape() {
        let json = serde_json::to_value(notice()).unwrap();
        assert_eq!(json["kind"], "started");
        assert_eq!(json["event"], "health_ok");
        assert_eq!(json["observed"], "running_healthy");
    }
}
