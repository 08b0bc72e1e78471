//! Message deduplication store.
//!
//! Tracks two independent record kinds with bounded, time-based retention:
//! message-id records (long window, transport replays) and content
//! fingerprints (short window, same content racing in through a second
//! connection with a fresh id). The store is owned by a single actor task
//! reached over a command channel, so check-and-record is atomic per call
//! without any shared lock. Eviction runs on a periodic sweep, never on
//! the lookup path; an expired record that the sweep has not yet removed
//! can over-reject a message, which is safe, but never under-reject.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::DedupConfig;
use crate::error::GatewayError;

/// Result of a dedup check for one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupOutcome {
    /// First sighting; both records were written.
    Accept,
    /// Same `(session_id, message_id)` seen inside the long window.
    /// Transport replay: acknowledge silently, never re-answer.
    DuplicateId,
    /// Same content fingerprint seen inside the short window.
    /// Respond with a still-processing notice, not a fresh answer.
    DuplicateContent,
}

/// Fingerprint over `(session_id, user_id, normalized content)`.
///
/// Normalization is lowercase plus whitespace collapse so trivial edits
/// like a trailing space still count as the same utterance.
pub fn content_fingerprint(session_id: &str, user_id: Option<&str>, content: &str) -> String {
    let normalized = content
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    let mut hasher = Sha256::new();
    hasher.update(session_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(user_id.unwrap_or("").as_bytes());
    hasher.update([0u8]);
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DedupStats {
    pub message_id_records: usize,
    pub fingerprint_records: usize,
}

/// The store itself: pure data structure, no I/O, single-threaded by
/// construction (owned by the actor task).
struct DedupStore {
    message_id_window: Duration,
    content_window: Duration,
    message_ids: HashMap<(String, String), Instant>,
    fingerprints: HashMap<String, Instant>,
}

impl DedupStore {
    fn new(config: &DedupConfig) -> Self {
        Self {
            message_id_window: config.message_id_window(),
            content_window: config.content_window(),
            message_ids: HashMap::new(),
            fingerprints: HashMap::new(),
        }
    }

    /// Checks in order of cost: message-id first, then content fingerprint,
    /// then record both and accept. A `DuplicateContent` hit does not
    /// refresh the fingerprint timestamp: the block is a fixed window from
    /// the first occurrence.
    fn check_and_record(
        &mut self,
        session_id: &str,
        message_id: &str,
        fingerprint: &str,
        now: Instant,
    ) -> DedupOutcome {
        let id_key = (session_id.to_string(), message_id.to_string());
        if self.message_ids.contains_key(&id_key) {
            return DedupOutcome::DuplicateId;
        }

        if let Some(first_seen) = self.fingerprints.get(fingerprint) {
            if now.duration_since(*first_seen) <= self.content_window {
                return DedupOutcome::DuplicateContent;
            }
            // Expired but not yet swept: fall through and overwrite below.
        }

        self.message_ids.insert(id_key, now);
        self.fingerprints.insert(fingerprint.to_string(), now);
        DedupOutcome::Accept
    }

    /// Evict records older than each kind's retention window. Returns the
    /// number of evicted (message-id, fingerprint) records.
    fn sweep(&mut self, now: Instant) -> (usize, usize) {
        let before_ids = self.message_ids.len();
        let id_window = self.message_id_window;
        self.message_ids
            .retain(|_, first_seen| now.duration_since(*first_seen) <= id_window);

        let before_fps = self.fingerprints.len();
        let fp_window = self.content_window;
        self.fingerprints
            .retain(|_, first_seen| now.duration_since(*first_seen) <= fp_window);

        (
            before_ids - self.message_ids.len(),
            before_fps - self.fingerprints.len(),
        )
    }

    fn stats(&self) -> DedupStats {
        DedupStats {
            message_id_records: self.message_ids.len(),
            fingerprint_records: self.fingerprints.len(),
        }
    }
}

enum Command {
    CheckAndRecord {
        session_id: String,
        message_id: String,
        fingerprint: String,
        reply: oneshot::Sender<DedupOutcome>,
    },
    Stats {
        reply: oneshot::Sender<DedupStats>,
    },
}

/// Cheaply cloneable handle to the dedup actor.
#[derive(Clone)]
pub struct DedupHandle {
    tx: mpsc::Sender<Command>,
}

impl DedupHandle {
    /// Spawn the owning actor task together with its eviction sweep.
    /// Both stop when `cancel` fires or every handle is dropped.
    pub fn spawn(config: DedupConfig, cancel: CancellationToken) -> Self {
        let (tx, mut rx) = mpsc::channel::<Command>(256);

        tokio::spawn(async move {
            let mut store = DedupStore::new(&config);
            let mut sweep = tokio::time::interval(config.sweep_interval());
            sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // Skip the immediate first tick
            sweep.tick().await;

            loop {
                tokio::select! {
                    cmd = rx.recv() => {
                        match cmd {
                            Some(Command::CheckAndRecord { session_id, message_id, fingerprint, reply }) => {
                                let outcome = store.check_and_record(
                                    &session_id,
                                    &message_id,
                                    &fingerprint,
                                    Instant::now(),
                                );
                                let _ = reply.send(outcome);
                            }
                            Some(Command::Stats { reply }) => {
                                let _ = reply.send(store.stats());
                            }
                            None => break,
                        }
                    }
                    _ = sweep.tick() => {
                        let (ids, fps) = store.sweep(Instant::now());
                        if ids > 0 || fps > 0 {
                            debug!(
                                evicted_message_ids = ids,
                                evicted_fingerprints = fps,
                                "dedup sweep evicted expired records"
                            );
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
            info!("Dedup store stopped");
        });

        Self { tx }
    }

    pub async fn check_and_record(
        &self,
        session_id: &str,
        message_id: &str,
        fingerprint: &str,
    ) -> Result<DedupOutcome, GatewayError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::CheckAndRecord {
                session_id: session_id.to_string(),
                message_id: message_id.to_string(),
                fingerprint: fingerprint.to_string(),
                reply,
            })
            .await
            .map_err(|_| GatewayError::Internal("dedup store unavailable".to_string()))?;
        rx.await
            .map_err(|_| GatewayError::Internal("dedup store dropped reply".to_string()))
    }

    pub async fn stats(&self) -> Result<DedupStats, GatewayError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Stats { reply })
            .await
            .map_err(|_| GatewayError::Internal("dedup store unavailable".to_string()))?;
        rx.await
            .map_err(|_| GatewayError::Internal("dedup store dropped reply".to_string()))
    }
}
