//! Outbound staging: delivery modes, chunk sequencing, per-target
//! serialization.
//!
//! Chunks of one job go out strictly in order, each awaiting the previous
//! acknowledgment. A mid-sequence failure stops the job and the report says
//! exactly which chunks landed; nothing is retried here — resubmission is
//! the caller's call. Different targets proceed independently.

use crate::chunker::chunk_text;
use crate::config::{ChunkMode, DeliveryMode, LinqChannelConfig};
use crate::error::Result;
use crate::provider::{ProviderClient, SendReceipt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Tunables the host resolves from config (debounce window and flush
/// trigger are deliberately parameters, not constants).
#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    pub mode: DeliveryMode,
    pub debounce: Duration,
    pub chunk_limit: usize,
    pub chunk_mode: ChunkMode,
}

impl From<&LinqChannelConfig> for DispatcherOptions {
    fn from(cfg: &LinqChannelConfig) -> Self {
        Self {
            mode: cfg.delivery_mode,
            debounce: Duration::from_millis(cfg.coalesce_debounce_ms),
            chunk_limit: cfg.text_chunk_limit,
            chunk_mode: cfg.chunk_mode,
        }
    }
}

/// Terminal state of one chunk within a job.
#[derive(Debug, Clone)]
pub enum ChunkDisposition {
    Sent(SendReceipt),
    Failed(String),
    NotAttempted,
}

#[derive(Debug, Clone)]
pub struct ChunkReport {
    pub index: usize,
    pub disposition: ChunkDisposition,
}

/// Per-job result: success/failure split across the ordered chunks.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub job_id: Uuid,
    pub target: String,
    pub chunks: Vec<ChunkReport>,
}

impl JobReport {
    pub fn succeeded(&self) -> bool {
        self.chunks
            .iter()
            .all(|c| matches!(c.disposition, ChunkDisposition::Sent(_)))
    }

    /// Provider message ids of the chunks that landed.
    pub fn sent_message_ids(&self) -> Vec<String> {
        self.chunks
            .iter()
            .filter_map(|c| match &c.disposition {
                ChunkDisposition::Sent(receipt) => receipt.message_id.clone(),
                _ => None,
            })
            .collect()
    }
}

/// What happened to a send call under the active delivery mode.
#[derive(Debug)]
pub enum DispatchResult {
    /// Direct mode: the job ran to completion.
    Dispatched(JobReport),
    /// Buffered mode: accumulated; flushes with the logical turn.
    Buffered,
    /// Coalesced mode: merged into the target's debounce window.
    Coalescing,
}

struct CoalesceState {
    parts: Vec<String>,
    reply_to: Option<String>,
    generation: u64,
}

struct TurnBuffer {
    parts: Vec<String>,
    /// Correlation id of the first buffered send; applied to the flush.
    reply_to: Option<String>,
}

pub struct OutboundDispatcher {
    provider: Arc<dyn ProviderClient>,
    opts: DispatcherOptions,
    /// One async mutex per target serializes jobs to that target.
    target_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    buffers: Mutex<HashMap<String, TurnBuffer>>,
    coalescing: Mutex<HashMap<String, CoalesceState>>,
    reports_tx: tokio::sync::mpsc::UnboundedSender<JobReport>,
    reports_rx: Mutex<Option<tokio::sync::mpsc::UnboundedReceiver<JobReport>>>,
}

impl OutboundDispatcher {
    pub fn new(provider: Arc<dyn ProviderClient>, opts: DispatcherOptions) -> Arc<Self> {
        let (reports_tx, reports_rx) = tokio::sync::mpsc::unbounded_channel();
        Arc::new(Self {
            provider,
            opts,
            target_locks: Mutex::new(HashMap::new()),
            buffers: Mutex::new(HashMap::new()),
            coalescing: Mutex::new(HashMap::new()),
            reports_tx,
            reports_rx: Mutex::new(Some(reports_rx)),
        })
    }

    /// Stream of completed job reports, including asynchronously flushed
    /// coalesced jobs. Can be taken once.
    pub fn take_reports(&self) -> Option<tokio::sync::mpsc::UnboundedReceiver<JobReport>> {
        self.reports_rx.lock().take()
    }

    fn target_lock(&self, target: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.target_locks
            .lock()
            .entry(target.to_string())
            .or_default()
            .clone()
    }

    /// Stage a text send under the configured delivery mode.
    pub async fn send_text(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        target: &str,
        text: &str,
        reply_to: Option<&str>,
    ) -> Result<DispatchResult> {
        match self.opts.mode {
            DeliveryMode::Direct => {
                let report = self.dispatch_now(cancel, target, text, reply_to).await;
                Ok(DispatchResult::Dispatched(report))
            }
            DeliveryMode::Buffered => {
                let mut buffers = self.buffers.lock();
                let buffer = buffers.entry(target.to_string()).or_insert_with(|| TurnBuffer {
                    parts: Vec::new(),
                    reply_to: reply_to.map(ToString::to_string),
                });
                buffer.parts.push(text.to_string());
                Ok(DispatchResult::Buffered)
            }
            DeliveryMode::Coalesced => {
                let generation = {
                    let mut map = self.coalescing.lock();
                    let state = map.entry(target.to_string()).or_insert(CoalesceState {
                        parts: Vec::new(),
                        reply_to: reply_to.map(ToString::to_string),
                        generation: 0,
                    });
                    state.parts.push(text.to_string());
                    state.generation += 1;
                    state.generation
                };

                let this = Arc::clone(self);
                let cancel = cancel.clone();
                let target = target.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(this.opts.debounce).await;
                    let flush = {
                        let mut map = this.coalescing.lock();
                        match map.get(&target) {
                            // Only the task for the last send flushes; any
                            // newer send superseded us.
                            Some(state) if state.generation == generation => map.remove(&target),
                            _ => None,
                        }
                    };
                    if let Some(state) = flush {
                        let merged = state.parts.join("\n");
                        let report = this
                            .dispatch_now(&cancel, &target, &merged, state.reply_to.as_deref())
                            .await;
                        let _ = this.reports_tx.send(report);
                    }
                });
                Ok(DispatchResult::Coalescing)
            }
        }
    }

    /// Flush the buffered turn for `target` as one outbound unit.
    ///
    /// Returns `None` when nothing was buffered. The host calls this at its
    /// logical turn boundary.
    pub async fn flush_turn(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        target: &str,
    ) -> Option<JobReport> {
        let buffer = self.buffers.lock().remove(target)?;
        if buffer.parts.is_empty() {
            return None;
        }
        let merged = buffer.parts.join("\n");
        Some(
            self.dispatch_now(cancel, target, &merged, buffer.reply_to.as_deref())
                .await,
        )
    }

    /// Media is never held back: any buffered text flushes first to keep
    /// read order, then the attachment goes out as its own unit.
    pub async fn send_media(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        target: &str,
        caption: &str,
        media_url: &str,
    ) -> JobReport {
        if self.opts.mode == DeliveryMode::Buffered {
            if let Some(report) = self.flush_turn(cancel, target).await {
                let _ = self.reports_tx.send(report);
            }
        }

        let lock = self.target_lock(target);
        let _guard = lock.lock().await;

        let job_id = Uuid::new_v4();
        let disposition = if cancel.is_cancelled() {
            ChunkDisposition::NotAttempted
        } else {
            match self.provider.send_media(target, caption, media_url).await {
                Ok(receipt) => ChunkDisposition::Sent(receipt),
                Err(e) => {
                    tracing::error!("linq: media send to {target} failed: {e}");
                    ChunkDisposition::Failed(e.to_string())
                }
            }
        };

        let report = JobReport {
            job_id,
            target: target.to_string(),
            chunks: vec![ChunkReport {
                index: 0,
                disposition,
            }],
        };
        let _ = self.reports_tx.send(report.clone());
        report
    }

    /// Run one job: chunk, then send strictly in order, awaiting each ack.
    async fn dispatch_now(
        &self,
        cancel: &CancellationToken,
        target: &str,
        text: &str,
        reply_to: Option<&str>,
    ) -> JobReport {
        let lock = self.target_lock(target);
        let _guard = lock.lock().await;

        let chunks = chunk_text(text, self.opts.chunk_limit, self.opts.chunk_mode);
        let job_id = Uuid::new_v4();
        let mut reports = Vec::with_capacity(chunks.len());
        let mut halted = false;

        self.provider.start_typing(target).await;

        for (index, chunk) in chunks.iter().enumerate() {
            // Cancellation is checked before every chunk send.
            if halted || cancel.is_cancelled() {
                reports.push(ChunkReport {
                    index,
                    disposition: ChunkDisposition::NotAttempted,
                });
                continue;
            }

            // Reply correlation applies to the first chunk only.
            let correlate = if index == 0 { reply_to } else { None };
            match self.provider.send_text(target, chunk, correlate).await {
                Ok(receipt) => reports.push(ChunkReport {
                    index,
                    disposition: ChunkDisposition::Sent(receipt),
                }),
                Err(e) => {
                    tracing::error!(
                        "linq: chunk {}/{} to {target} failed: {e}",
                        index + 1,
                        chunks.len()
                    );
                    halted = true;
                    reports.push(ChunkReport {
                        index,
                        disposition: ChunkDisposition::Failed(e.to_string()),
                    });
                }
            }
        }

        self.provider.stop_typing(target).await;

        let report = JobReport {
            job_id,
            target: target.to_string(),
            chunks: reports,
        };
        let _ = self.reports_tx.send(report.clone());
        report
    }
}
