//! Client-side view of one conversation: optimistic sends plus a
//! self-healing realtime feed.

use chrono::Utc;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::timeline::{PendingSend, Timeline, TimelineEntry};
use super::transport::{ChatTransport, LocalTransport};
use crate::config::MAX_PAGE_LIMIT;
use crate::error::{AppError, AppResult};
use crate::realtime::backoff::{Backoff, BackoffConfig};
use crate::realtime::RealtimeEvent;
use crate::services::ChatService;

pub struct ConversationView {
    conversation_id: Uuid,
    transport: Arc<dyn ChatTransport>,
    timeline: Arc<Mutex<Timeline>>,
    send_timeout: Duration,
    backoff: BackoffConfig,
    sync_task: Option<JoinHandle<()>>,
}

impl ConversationView {
    pub fn new(
        conversation_id: Uuid,
        transport: Arc<dyn ChatTransport>,
        send_timeout: Duration,
    ) -> Self {
        Self {
            conversation_id,
            transport,
            timeline: Arc::new(Mutex::new(Timeline::new())),
            send_timeout,
            backoff: BackoffConfig::default(),
            sync_task: None,
        }
    }

    /// In-process view over the engine, bounded by its configured send timeout
    pub fn local(chat: ChatService, viewer: Uuid, conversation_id: Uuid) -> Self {
        let send_timeout = chat.limits().send_timeout;
        let transport = Arc::new(LocalTransport::new(chat, viewer));
        Self::new(conversation_id, transport, send_timeout)
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    pub async fn entries(&self) -> Vec<TimelineEntry> {
        self.timeline.lock().await.entries().to_vec()
    }

    pub async fn entry(&self, correlation_token: &str) -> Option<TimelineEntry> {
        self.timeline.lock().await.get(correlation_token).cloned()
    }

    /// Show the message immediately and deliver it in the background.
    /// Returns the correlation token identifying the entry.
    pub async fn send(&self, content: &str) -> AppResult<String> {
        if content.trim().is_empty() {
            return Err(AppError::BadRequest("message content is empty".into()));
        }
        let pending = self
            .timeline
            .lock()
            .await
            .begin_send(self.transport.viewer(), content, Utc::now());
        let token = pending.correlation_token.clone();
        self.spawn_delivery(pending);
        Ok(token)
    }

    /// Re-send a failed entry under its original token
    pub async fn retry(&self, correlation_token: &str) -> AppResult<()> {
        let pending = self
            .timeline
            .lock()
            .await
            .retry(correlation_token)
            .ok_or(AppError::NotFound("failed message"))?;
        self.spawn_delivery(pending);
        Ok(())
    }

    pub async fn mark_read(&self) -> AppResult<u64> {
        self.transport.mark_read(self.conversation_id).await
    }

    // The request runs in its own task; neither closing the view nor the
    // timeout cancels it, only the wait is bounded.
    fn spawn_delivery(&self, pending: PendingSend) {
        let transport = self.transport.clone();
        let timeline = self.timeline.clone();
        let conversation_id = self.conversation_id;
        let timeout = self.send_timeout;

        tokio::spawn(async move {
            let token = pending.correlation_token.clone();
            let mut request = tokio::spawn(async move {
                transport
                    .send(conversation_id, &pending.content, &pending.correlation_token)
                    .await
            });

            let result = match tokio::time::timeout(timeout, &mut request).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(%conversation_id, ?timeout, "message send timed out");
                    timeline.lock().await.fail(&token);
                    // A late confirmation still replaces the failed entry
                    request.await
                }
            };

            let mut timeline = timeline.lock().await;
            match result {
                Ok(Ok(message)) => {
                    timeline.ingest(message);
                }
                Ok(Err(e)) => {
                    warn!(%conversation_id, error = %e, "message send failed");
                    timeline.fail(&token);
                }
                Err(e) => {
                    warn!(%conversation_id, error = %e, "message send task aborted");
                    timeline.fail(&token);
                }
            }
        });
    }

    /// Start (or restart) the subscribe, backfill, ingest loop
    pub fn open_sync(&mut self) {
        self.close();
        let transport = self.transport.clone();
        let timeline = self.timeline.clone();
        let conversation_id = self.conversation_id;
        let backoff = Backoff::new(self.backoff.clone());
        self.sync_task = Some(tokio::spawn(sync_loop(
            conversation_id,
            transport,
            timeline,
            backoff,
        )));
    }

    pub fn is_syncing(&self) -> bool {
        self.sync_task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop the realtime feed; pending sends keep going
    pub fn close(&mut self) {
        if let Some(task) = self.sync_task.take() {
            task.abort();
        }
    }
}

impl Drop for ConversationView {
    fn drop(&mut self) {
        self.close();
    }
}

async fn sync_loop(
    conversation_id: Uuid,
    transport: Arc<dyn ChatTransport>,
    timeline: Arc<Mutex<Timeline>>,
    mut backoff: Backoff,
) {
    loop {
        match transport.subscribe(conversation_id).await {
            Ok(mut events) => {
                // Subscribe first so nothing published during the backfill is lost
                match backfill(conversation_id, transport.as_ref(), &timeline).await {
                    Ok(count) => {
                        debug!(%conversation_id, count, "backfill complete");
                        backoff.reset();
                        while let Some(event) = events.next().await {
                            apply_event(&timeline, event).await;
                        }
                        info!(%conversation_id, "realtime feed ended, reconnecting");
                    }
                    Err(e) if !e.is_retryable() => {
                        warn!(%conversation_id, error = %e, "backfill rejected, stopping sync");
                        return;
                    }
                    Err(e) => warn!(%conversation_id, error = %e, "backfill failed"),
                }
            }
            Err(e) if !e.is_retryable() => {
                warn!(%conversation_id, error = %e, "subscription rejected, stopping sync");
                return;
            }
            Err(e) => warn!(%conversation_id, error = %e, "subscription failed"),
        }

        let delay = backoff.next_delay();
        debug!(%conversation_id, ?delay, attempt = backoff.attempts(), "resubscribing after delay");
        tokio::time::sleep(delay).await;
    }
}

/// Page through everything after the gap-free run the timeline already holds
async fn backfill(
    conversation_id: Uuid,
    transport: &dyn ChatTransport,
    timeline: &Mutex<Timeline>,
) -> AppResult<usize> {
    let mut total = 0;
    let mut after = timeline.lock().await.sync_cursor();
    loop {
        let page = transport
            .fetch_after(conversation_id, after, MAX_PAGE_LIMIT)
            .await?;
        let full = page.len() as i64 >= MAX_PAGE_LIMIT;
        total += page.len();
        after = page.last().map(|m| m.cursor()).or(after);

        let mut timeline = timeline.lock().await;
        for message in page {
            timeline.ingest(message);
        }
        if !full {
            return Ok(total);
        }
    }
}

async fn apply_event(timeline: &Mutex<Timeline>, event: RealtimeEvent) {
    let mut timeline = timeline.lock().await;
    match event {
        RealtimeEvent::MessageAppended { message } => {
            timeline.ingest(message);
        }
        RealtimeEvent::MessagesRead {
            message_ids,
            read_at,
            ..
        } => timeline.apply_read(&message_ids, read_at),
    }
}
