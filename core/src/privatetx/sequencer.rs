//! Per-contract sequencers.
//!
//! Exactly one assembly runs at a time for any (domain, contract) — a
//! dedicated task per slot drains a queue of transaction ids in
//! submission order. Different contracts proceed in parallel; a deploy
//! of a domain gets its own `domain:deploy` slot so instance deploys
//! never block transactions against existing contracts.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use super::flow;
use super::manager::Coordinator;

pub(crate) struct SequencerSet {
    slots: Mutex<HashMap<String, mpsc::UnboundedSender<Uuid>>>,
    handles: SyncMutex<Vec<JoinHandle<()>>>,
}

impl SequencerSet {
    pub(crate) fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            handles: SyncMutex::new(Vec::new()),
        }
    }

    /// Hand a transaction to its slot's task, creating the task on
    /// first use.
    pub(crate) async fn dispatch(&self, coordinator: &Arc<Coordinator>, slot: &str, id: Uuid) {
        let mut slots = self.slots.lock().await;
        let sender = match slots.get(slot) {
            Some(sender) if !sender.is_closed() => sender.clone(),
            _ => {
                let (sender, mut receiver) = mpsc::unbounded_channel::<Uuid>();
                let coordinator = Arc::clone(coordinator);
                let slot_name = slot.to_string();
                let mut cancel = coordinator.cancelled();
                let handle = tokio::spawn(async move {
                    info!(slot = %slot_name, "sequencer started");
                    loop {
                        tokio::select! {
                            _ = cancel.changed() => break,
                            next = receiver.recv() => match next {
                                None => break,
                                Some(id) => {
                                    debug!(slot = %slot_name, transaction = %id, "sequencer slot processing");
                                    flow::process(&coordinator, id).await;
                                }
                            },
                        }
                    }
                    info!(slot = %slot_name, "sequencer stopped");
                });
                self.handles.lock().push(handle);
                slots.insert(slot.to_string(), sender.clone());
                sender
            }
        };
        let _ = sender.send(id);
    }

    pub(crate) async fn stop(&self) {
        self.slots.lock().await.clear();
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}
