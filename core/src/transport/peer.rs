//! An active peer and its sender loop.
//!
//! One task per peer, single-threaded within: all peer state besides
//! the stats counters is touched only on this task. The loop:
//!
//! 1. Drain reliable messages — a *full scan* on first pass and every
//!    resend interval (all unacked rows in sequence order), otherwise
//!    only rows above the last drain high-water mark. Rows that can
//!    never be built get an error ack so they never rescan; built
//!    pages go through the short-retry sender, and a page failure
//!    aborts the whole drain so the outer unbounded retry backs off.
//! 2. Wait on whichever comes first: a new-persistent-message signal,
//!    the fire-and-forget queue, cancellation, or the resend timer.
//! 3. When both queues are drained and nothing has been received for
//!    the inactivity timeout, quiesce: deactivate (under the peers
//!    write lock) and linger briefly — any late signal transparently
//!    re-opens the peer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex as SyncMutex;
use parking_lot::RwLock as SyncRwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::storage::Table;
use crate::types::now_millis;

use super::manager::{reliable_key, PeerStatus, TransportManager};
use super::{BuildOutcome, ReliableMessage, Transport, TransportError, WireMessage};

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Counters updated under a dedicated lock (the one piece of peer
/// state shared off the sender task).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerStats {
    pub last_send: Option<i64>,
    pub last_receive: Option<i64>,
    pub sent_msgs: u64,
    pub sent_bytes: u64,
    pub received_msgs: u64,
    pub received_bytes: u64,
    pub reliable_highest_sent: u64,
}

// ---------------------------------------------------------------------------
// Peer
// ---------------------------------------------------------------------------

pub struct Peer {
    name: String,
    activated_at: i64,
    transport: SyncRwLock<Option<Arc<dyn Transport>>>,
    peer_info: SyncMutex<Option<String>>,
    outbound_error: SyncMutex<Option<String>>,
    queue_tx: mpsc::Sender<WireMessage>,
    queue_rx: SyncMutex<Option<mpsc::Receiver<WireMessage>>>,
    persisted: Notify,
    stats: SyncMutex<PeerStats>,
    sender_started: AtomicBool,
    cancel_tx: watch::Sender<bool>,
    done: SyncMutex<Option<JoinHandle<()>>>,
}

impl Peer {
    pub(crate) fn new(name: &str, queue_len: usize) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(queue_len.max(1));
        let (cancel_tx, _) = watch::channel(false);
        Arc::new(Self {
            name: name.to_string(),
            activated_at: now_millis(),
            transport: SyncRwLock::new(None),
            peer_info: SyncMutex::new(None),
            outbound_error: SyncMutex::new(None),
            queue_tx,
            queue_rx: SyncMutex::new(Some(queue_rx)),
            persisted: Notify::new(),
            stats: SyncMutex::new(PeerStats::default()),
            sender_started: AtomicBool::new(false),
            cancel_tx,
            done: SyncMutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn sender_started(&self) -> bool {
        self.sender_started.load(Ordering::SeqCst)
    }

    pub(crate) fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.read().clone()
    }

    pub(crate) fn activated(&self, transport: Arc<dyn Transport>, peer_info: String) {
        *self.transport.write() = Some(transport);
        *self.peer_info.lock() = Some(peer_info);
    }

    pub(crate) fn set_outbound_error(&self, error: Option<String>) {
        *self.outbound_error.lock() = error;
    }

    pub fn status(&self) -> PeerStatus {
        PeerStatus {
            name: self.name.clone(),
            activated: self.activated_at,
            sender_active: self.sender_started(),
            peer_info: self.peer_info.lock().clone(),
            outbound_error: self.outbound_error.lock().clone(),
            stats: self.stats.lock().clone(),
        }
    }

    /// Queue a fire-and-forget message (blocks when the buffer is full).
    pub(crate) async fn enqueue(&self, message: WireMessage) -> Result<(), TransportError> {
        self.queue_tx
            .send(message)
            .await
            .map_err(|_| TransportError::Stopped)
    }

    /// Signal that new reliable rows are durable for this peer.
    pub(crate) fn notify_persisted(&self) {
        self.persisted.notify_one();
    }

    pub(crate) fn update_received(&self, message: &WireMessage) {
        let mut stats = self.stats.lock();
        stats.last_receive = Some(now_millis());
        stats.received_msgs += 1;
        stats.received_bytes += message.payload.len() as u64;
    }

    fn record_sent(&self, message: &WireMessage, reliable_seq: Option<u64>) {
        let mut stats = self.stats.lock();
        stats.last_send = Some(now_millis());
        stats.sent_msgs += 1;
        stats.sent_bytes += message.payload.len() as u64;
        if let Some(seq) = reliable_seq {
            if seq > stats.reliable_highest_sent {
                stats.reliable_highest_sent = seq;
            }
        }
    }

    fn receive_idle_for(&self, timeout: Duration) -> bool {
        match self.stats.lock().last_receive {
            None => true,
            Some(at) => now_millis().saturating_sub(at) as u128 > timeout.as_millis(),
        }
    }

    pub(crate) fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    pub(crate) async fn wait_sender_done(&self) {
        let handle = self.done.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub(crate) fn spawn_sender(self: &Arc<Self>, tm: Arc<TransportManager>) {
        self.sender_started.store(true, Ordering::SeqCst);
        let peer = Arc::clone(self);
        let handle = tokio::spawn(async move {
            sender_loop(peer, tm).await;
        });
        *self.done.lock() = Some(handle);
    }

    /// One send through the short-retry wrapper, stats on success.
    async fn send_with_retry(
        &self,
        tm: &TransportManager,
        message: &WireMessage,
        reliable_seq: Option<u64>,
    ) -> Result<(), TransportError> {
        let transport = self
            .transport()
            .ok_or_else(|| TransportError::SendFailed("peer has no transport".to_string()))?;
        tm.config()
            .short_retry
            .run("peer_send", || {
                let transport = Arc::clone(&transport);
                let message = message.clone();
                async move { transport.send(&self.name, message).await }
            })
            .await?;
        self.record_sent(message, reliable_seq);
        Ok(())
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("name", &self.name)
            .field("sender_started", &self.sender_started())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Sender loop
// ---------------------------------------------------------------------------

/// Loop-local drain state; only ever touched on the sender task.
struct DrainState {
    last_full_scan: Option<Instant>,
    last_drain_hwm: Option<u64>,
    persistent_drained: bool,
}

async fn sender_loop(peer: Arc<Peer>, tm: Arc<TransportManager>) {
    info!(peer = peer.name(), "peer sender active");

    let mut queue_rx = peer
        .queue_rx
        .lock()
        .take()
        .expect("sender started exactly once per peer");
    let mut cancel = peer.cancel_tx.subscribe();

    let resend_interval = Duration::from_millis(tm.config().reliable_resend_interval_ms);
    let inactivity_timeout = Duration::from_millis(tm.config().peer_inactivity_timeout_ms);

    let mut drain = DrainState {
        last_full_scan: None,
        last_drain_hwm: None,
        persistent_drained: false,
    };
    let mut check_new = false;
    let mut hit_resend_timer = false;
    let mut quiescing = false;

    'outer: loop {
        // 1. Drain (re)sendable reliable messages, with unbounded
        //    backoff — only cancellation gets us out of a dead store.
        let mut attempt = 0u32;
        loop {
            let outcome = tokio::select! {
                biased;
                _ = cancel.changed() => break 'outer,
                result = reliable_scan(&peer, &tm, &mut drain, check_new) => result,
            };
            match outcome {
                Ok(()) => break,
                Err(e) => {
                    attempt += 1;
                    let delay = tm.config().scan_retry.delay_for(attempt);
                    warn!(
                        peer = peer.name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "reliable scan failed, backing off: {}", e
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.changed() => break 'outer,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        // 2. Quiesce check: nothing durable pending, nothing received
        //    lately, and we got here off the resend timer.
        if hit_resend_timer
            && drain.persistent_drained
            && peer.receive_idle_for(inactivity_timeout)
        {
            quiescing = true;
            break 'outer;
        }
        hit_resend_timer = false;
        check_new = false;

        // 3. Wait for work.
        let resend_timer = tokio::time::sleep(resend_interval);
        tokio::pin!(resend_timer);
        loop {
            tokio::select! {
                _ = &mut resend_timer => {
                    hit_resend_timer = true;
                    break;
                }
                _ = peer.persisted.notified() => {
                    check_new = true;
                    break;
                }
                _ = cancel.changed() => break 'outer,
                maybe = queue_rx.recv() => {
                    match maybe {
                        None => break 'outer,
                        Some(message) => {
                            // Fire-and-forget: short retry, then drop.
                            if let Err(e) = peer.send_with_retry(&tm, &message, None).await {
                                error!(
                                    peer = peer.name(),
                                    message = %message.message_id,
                                    "failed to send after short retry (discarding): {}", e
                                );
                            }
                        }
                    }
                }
            }
        }
    }

    // Always deactivate on the way out, under the peers write lock.
    tm.deactivate_peer(&peer).await;

    // A message delivered in the tiny window between being taken out of
    // the map and deactivating must re-open the peer.
    if quiescing {
        let window = Duration::from_millis(tm.config().quiesce_timeout_ms);
        let deadline = tokio::time::sleep(window);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                _ = peer.persisted.notified() => {
                    info!(peer = peer.name(), "reliable message during quiesce window, re-connecting");
                    let _ = tm.get_peer(peer.name(), true).await;
                    break;
                }
                maybe = queue_rx.recv() => {
                    if let Some(message) = maybe {
                        info!(peer = peer.name(), "message during quiesce window, re-connecting");
                        let tm = Arc::clone(&tm);
                        let node = peer.name().to_string();
                        tokio::spawn(async move {
                            if let Err(e) = tm.send_fire_and_forget(&node, message).await {
                                warn!(peer = %node, "re-queue after quiesce failed: {}", e);
                            }
                        });
                        break;
                    }
                }
            }
        }
    }

    debug!(peer = peer.name(), "peer sender stopped");
}

/// One drain pass over this peer's unacked reliable messages.
async fn reliable_scan(
    peer: &Arc<Peer>,
    tm: &Arc<TransportManager>,
    drain: &mut DrainState,
    check_new: bool,
) -> Result<(), TransportError> {
    let resend_interval = Duration::from_millis(tm.config().reliable_resend_interval_ms);
    let full_scan = drain.last_drain_hwm.is_none()
        || drain
            .last_full_scan
            .is_none_or(|at| at.elapsed() >= resend_interval);
    if !full_scan && !check_new {
        return Ok(());
    }

    let db = tm.db();
    let page_size = tm.config().reliable_page_size.max(1);
    let from_seq = if full_scan {
        0
    } else {
        drain.last_drain_hwm.map(|h| h + 1).unwrap_or(0)
    };

    let rows: Vec<(Vec<u8>, ReliableMessage)> = db.scan_range(
        Table::ReliableMessages,
        &reliable_key(peer.name(), from_seq),
        &reliable_key(peer.name(), u64::MAX),
    )?;

    let mut total = 0usize;
    let mut last_seq: Option<u64> = None;
    for page in rows.chunks(page_size) {
        // Build the page first; data errors become error acks so the
        // row never rescans.
        let mut to_send: Vec<(u64, WireMessage)> = Vec::with_capacity(page.len());
        for (_, row) in page {
            if db.contains(Table::ReliableMessageAcks, row.id.as_bytes())? {
                continue;
            }
            let builder = tm
                .reliable_builder()
                .ok_or_else(|| TransportError::SendFailed("no reliable builder wired".into()))?;
            match builder.build(row)? {
                BuildOutcome::Message(message) => {
                    to_send.push((row.sequence, message.with_id(row.id)));
                }
                BuildOutcome::Permanent(reason) => {
                    error!(
                        peer = peer.name(),
                        message = %row.id,
                        "unable to build reliable message, writing persistent error ack: {}",
                        reason
                    );
                    tm.write_ack(row.id, Some(reason))?;
                }
            }
            total += 1;
            last_seq = Some(row.sequence);
        }

        // Send the page; any failure aborts the whole drain so the
        // outer retry backs off rather than thrashing.
        for (seq, message) in to_send {
            peer.send_with_retry(tm, &message, Some(seq)).await?;
        }
    }

    debug!(
        peer = peer.name(),
        full_scan,
        total,
        last_seq = ?last_seq,
        "reliable message scan complete"
    );

    if last_seq.is_some() || full_scan {
        drain.last_drain_hwm = last_seq.or(drain.last_drain_hwm);
    }
    if total > 0 {
        drain.persistent_drained = false;
    }
    if full_scan {
        drain.persistent_drained = total == 0;
        drain.last_full_scan = Some(Instant::now());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_counters() {
        let peer = Peer::new("node2", 4);
        let message = WireMessage::json(
            super::super::Component::TransactionEngine,
            "test",
            &serde_json::json!({"k": "v"}),
        )
        .unwrap();

        peer.update_received(&message);
        peer.record_sent(&message, Some(5));
        peer.record_sent(&message, Some(3)); // lower seq does not regress

        let status = peer.status();
        assert_eq!(status.stats.received_msgs, 1);
        assert_eq!(status.stats.sent_msgs, 2);
        assert_eq!(status.stats.reliable_highest_sent, 5);
        assert!(status.stats.last_send.is_some());
    }

    #[test]
    fn receive_idle_tracking() {
        let peer = Peer::new("node2", 4);
        // Never received: idle.
        assert!(peer.receive_idle_for(Duration::from_millis(10)));

        let message = WireMessage::json(
            super::super::Component::TransactionEngine,
            "test",
            &serde_json::json!({}),
        )
        .unwrap();
        peer.update_received(&message);
        assert!(!peer.receive_idle_for(Duration::from_secs(60)));
    }
}
