use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use formsync_core::contracts::{ApprovalChannel, ChannelError, ChannelMessage, MessageHandle};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Serialize)]
struct OutboxLine<'a> {
    handle: &'a str,
    sent_at: &'a str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct InboxLine {
    sent_at: DateTime<Utc>,
    text: String,
    #[serde(default)]
    sender_is_self: bool,
}

/// Approval channel over two JSON-lines files. Requests and notifications are appended to the
/// outbox; operator replies are appended to the inbox as `{"sent_at": ..., "text": ...}`. A
/// message handle is the RFC 3339 timestamp it was sent at.
pub struct FileApprovalChannel {
    outbox: PathBuf,
    inbox: PathBuf,
    last_handle: Mutex<Option<DateTime<Utc>>>,
}

impl FileApprovalChannel {
    pub fn new(outbox: impl Into<PathBuf>, inbox: impl Into<PathBuf>) -> Self {
        Self {
            outbox: outbox.into(),
            inbox: inbox.into(),
            last_handle: Mutex::new(None),
        }
    }

    /// Strictly increasing, so two sends within one clock tick still order correctly.
    async fn next_timestamp(&self) -> DateTime<Utc> {
        let mut last = self.last_handle.lock().await;
        let mut now = Utc::now();
        if let Some(previous) = *last {
            if now <= previous {
                now = previous + chrono::Duration::microseconds(1);
            }
        }
        *last = Some(now);
        now
    }
}

fn parse_handle(handle: &MessageHandle) -> Result<DateTime<Utc>, ChannelError> {
    DateTime::parse_from_rfc3339(&handle.0)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|err| ChannelError::Poll(format!("bad handle {}: {err}", handle.0)))
}

#[async_trait]
impl ApprovalChannel for FileApprovalChannel {
    async fn send(&self, text: &str) -> Result<MessageHandle, ChannelError> {
        let sent_at = self
            .next_timestamp()
            .await
            .to_rfc3339_opts(SecondsFormat::Micros, true);
        let mut line = serde_json::to_string(&OutboxLine {
            handle: &sent_at,
            sent_at: &sent_at,
            text,
        })
        .map_err(|err| ChannelError::Send(err.to_string()))?;
        line.push('\n');

        if let Some(parent) = self.outbox.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| ChannelError::Send(err.to_string()))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.outbox)
            .await
            .map_err(|err| ChannelError::Send(err.to_string()))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|err| ChannelError::Send(err.to_string()))?;
        file.flush()
            .await
            .map_err(|err| ChannelError::Send(err.to_string()))?;
        Ok(MessageHandle(sent_at))
    }

    async fn poll_since(&self, since: &MessageHandle) -> Result<Vec<ChannelMessage>, ChannelError> {
        let since = parse_handle(since)?;
        let contents = match tokio::fs::read_to_string(&self.inbox).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(ChannelError::Poll(err.to_string())),
        };

        let mut messages = Vec::new();
        for (index, raw) in contents.lines().enumerate() {
            if raw.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<InboxLine>(raw) {
                Ok(line) if line.sent_at > since => messages.push(ChannelMessage {
                    handle: MessageHandle(line.sent_at.to_rfc3339_opts(SecondsFormat::Micros, true)),
                    text: line.text,
                    sender_is_self: line.sender_is_self,
                }),
                Ok(_) => {}
                Err(err) => debug!(event = "inbox_line_invalid", line = index + 1, error = %err),
            }
        }
        Ok(messages)
    }
}
