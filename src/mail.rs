//! Outbound mail: a bounded queue in front of one delivery worker.
//!
//! Enqueueing never blocks. A full queue rejects the message and the caller
//! decides whether that matters (booking confirmations only log it).

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::observability;

/// Placeholder replaced by the message content in a template.
pub const BODY_MARKER: &str = "[%body%]";

pub const BASIC_TEMPLATE_NAME: &str = "basic.html";

const BASIC_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="UTF-8"><title>Reservation</title></head>
<body>
<p>[%body%]</p>
</body>
</html>
"#;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailMessage {
    pub to: String,
    pub from: String,
    pub subject: String,
    pub content: String,
    /// Template name; empty sends `content` as is.
    #[serde(default)]
    pub template: String,
}

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("mail queue full")]
    QueueFull,
    #[error("mail worker stopped")]
    Closed,
    #[error("delivery failed: {0}")]
    Transport(String),
}

/// Named HTML templates containing [`BODY_MARKER`].
#[derive(Debug, Clone)]
pub struct Templates {
    by_name: HashMap<String, String>,
}

impl Default for Templates {
    fn default() -> Self {
        let mut by_name = HashMap::new();
        by_name.insert(BASIC_TEMPLATE_NAME.to_string(), BASIC_TEMPLATE.to_string());
        Self { by_name }
    }
}

impl Templates {
    /// Final message body. Unknown templates fall back to the raw content.
    pub fn render(&self, msg: &MailMessage) -> String {
        if msg.template.is_empty() {
            return msg.content.clone();
        }
        match self.by_name.get(&msg.template) {
            Some(html) => html.replace(BODY_MARKER, &msg.content),
            None => {
                tracing::warn!(template = %msg.template, "unknown mail template, sending raw content");
                msg.content.clone()
            }
        }
    }
}

/// Where rendered mail goes.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn deliver(&self, msg: &MailMessage, body: &str) -> Result<(), MailError>;
}

/// Writes each message to the log instead of sending it.
pub struct LogTransport;

#[async_trait]
impl MailTransport for LogTransport {
    async fn deliver(&self, msg: &MailMessage, body: &str) -> Result<(), MailError> {
        tracing::info!(
            to = %msg.to,
            from = %msg.from,
            subject = %msg.subject,
            bytes = body.len(),
            "mail delivered"
        );
        tracing::debug!("mail body:\n{body}");
        Ok(())
    }
}

/// Cheap-to-clone handle used to enqueue mail.
#[derive(Clone)]
pub struct Mailer {
    tx: mpsc::Sender<MailMessage>,
}

impl Mailer {
    /// Handle for a queue of `capacity`, plus the receiver the worker drains.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<MailMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub fn enqueue(&self, msg: MailMessage) -> Result<(), MailError> {
        match self.tx.try_send(msg) {
            Ok(()) => {
                metrics::counter!(observability::MAIL_ENQUEUED_TOTAL).increment(1);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(msg)) => {
                metrics::counter!(observability::MAIL_REJECTED_TOTAL).increment(1);
                tracing::warn!(to = %msg.to, "mail queue full, message rejected");
                Err(MailError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                metrics::counter!(observability::MAIL_REJECTED_TOTAL).increment(1);
                Err(MailError::Closed)
            }
        }
    }
}

pub struct MailWorker<T: MailTransport> {
    transport: T,
    templates: Templates,
}

impl<T: MailTransport> MailWorker<T> {
    pub fn new(transport: T, templates: Templates) -> Self {
        Self {
            transport,
            templates,
        }
    }

    /// Deliver until every sender is gone.
    pub async fn run(self, mut rx: mpsc::Receiver<MailMessage>) {
        tracing::info!("mail worker started");
        while let Some(msg) = rx.recv().await {
            let body = self.templates.render(&msg);
            if let Err(e) = self.transport.deliver(&msg, &body).await {
                tracing::error!(to = %msg.to, "mail delivery failed: {e}");
            }
        }
        tracing::info!("mail channel closed, worker stopping");
    }
}
