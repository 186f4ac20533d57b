//! Engine wiring: one [`Node`] value owning every component.
//!
//! Construction is where the seams close: the coordinator becomes the
//! transport's reliable-message builder and its engine/reliable inbound
//! handler, the identity resolver gets its outbound sender and becomes
//! the identity inbound handler, and the base-ledger event poller
//! starts feeding registration events to the domain manager. After
//! `Node::start` returns, the node is live: register domains and
//! transports, upsert registry records, submit transactions.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::abi::AbiResolver;
use crate::config::CoreConfig;
use crate::domains::{Domain, DomainError, DomainManager};
use crate::keys::identity::{FireAndForgetSender, IdentityResolver};
use crate::keys::signer::SigningModule;
use crate::keys::KeyError;
use crate::privatetx::{Coordinator, TransactionInput, TransactionReceipt, TransactionUpdate, TxError};
use crate::publictx::{BaseLedger, PublicTxManager};
use crate::registry::{RegistryEntry, RegistryError, RegistryManager, RegistryProperty};
use crate::states::{StateError, StateStore};
use crate::storage::{CoreDb, DbError, Table};
use crate::transport::{Component, Transport, TransportManager, WireMessage};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    PublicTx(#[from] crate::publictx::PublicTxError),

    #[error(transparent)]
    Tx(#[from] TxError),
}

// ---------------------------------------------------------------------------
// Transport adapter for the identity resolver
// ---------------------------------------------------------------------------

struct TransportSender(Arc<TransportManager>);

#[async_trait]
impl FireAndForgetSender for TransportSender {
    async fn send_fire_and_forget(
        &self,
        node: &str,
        message: WireMessage,
    ) -> Result<(), crate::transport::TransportError> {
        self.0.send_fire_and_forget(node, message).await
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// Meta-table cursor for the base-ledger event poller.
const LEDGER_EVENT_CURSOR: &[u8] = b"ledger_event_cursor";

pub struct Node {
    config: CoreConfig,
    db: Arc<CoreDb>,
    signer: Arc<SigningModule>,
    store: Arc<StateStore>,
    abi: Arc<AbiResolver>,
    registry: Arc<RegistryManager>,
    domains: Arc<DomainManager>,
    transport: Arc<TransportManager>,
    identity: Arc<IdentityResolver>,
    publictx: Arc<PublicTxManager>,
    coordinator: Arc<Coordinator>,
    ledger: Arc<dyn BaseLedger>,
    poller: parking_lot::Mutex<Option<JoinHandle<()>>>,
    cancel_tx: watch::Sender<bool>,
}

impl Node {
    /// Build and start a node against a base-ledger client.
    pub async fn start(
        config: CoreConfig,
        ledger: Arc<dyn BaseLedger>,
    ) -> Result<Arc<Self>, EngineError> {
        let db = match &config.data_dir {
            Some(dir) => Arc::new(CoreDb::open(dir)?),
            None => Arc::new(CoreDb::open_temporary()?),
        };

        let signer = Arc::new(SigningModule::new(&config.signer)?);
        let store = StateStore::new(Arc::clone(&db), config.state_store.clone());
        let abi = AbiResolver::new(Arc::clone(&db), config.abi_cache);
        let registry = Arc::new(RegistryManager::new(config.registry.clone())?);
        let domains = DomainManager::new(
            Arc::clone(&db),
            Arc::clone(&store),
            config.domain_manager.clone(),
        );
        let transport = TransportManager::new(
            &config.node_name,
            Arc::clone(&db),
            Arc::clone(&registry),
            config.transport.clone(),
        );
        let identity = IdentityResolver::new(
            &config.node_name,
            Arc::clone(&signer),
            config.identity.clone(),
        );
        let publictx = PublicTxManager::new(
            Arc::clone(&db),
            Arc::clone(&ledger),
            Arc::clone(&signer),
            config.public_tx.clone(),
        );
        let coordinator = Coordinator::new(
            &config.node_name,
            config.coordinator.clone(),
            Arc::clone(&db),
            Arc::clone(&abi),
            Arc::clone(&store),
            Arc::clone(&domains),
            Arc::clone(&transport),
            Arc::clone(&identity),
            Arc::clone(&signer),
            Arc::clone(&publictx),
        );

        // Close the seams.
        identity.set_sender(Arc::new(TransportSender(Arc::clone(&transport))));
        transport.set_reliable_builder(Arc::clone(&coordinator) as _);
        transport.set_handler(Component::TransactionEngine, Arc::clone(&coordinator) as _);
        transport.set_handler(
            Component::ReliableMessageHandler,
            Arc::clone(&coordinator) as _,
        );
        transport.set_handler(Component::IdentityResolver, Arc::clone(&identity) as _);
        {
            let coordinator = Arc::clone(&coordinator);
            transport.set_ack_listener(Arc::new(move |message_id, _error| {
                coordinator.record_distribution_ack(message_id);
            }));
        }

        publictx.recover().await?;
        coordinator.start().await;

        let (cancel_tx, _) = watch::channel(false);
        let node = Arc::new(Self {
            config,
            db,
            signer,
            store,
            abi,
            registry,
            domains,
            transport,
            identity,
            publictx,
            coordinator,
            ledger,
            poller: parking_lot::Mutex::new(None),
            cancel_tx,
        });
        node.spawn_event_poller();
        info!(node = %node.config.node_name, "node started");
        Ok(node)
    }

    /// The base-ledger event poller: feeds registration events to the
    /// domain manager, cursor persisted across restarts.
    fn spawn_event_poller(self: &Arc<Self>) {
        let node = Arc::clone(self);
        let mut cancel = self.cancel_tx.subscribe();
        let interval = std::time::Duration::from_millis(self.config.ledger_poll_interval_ms);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.changed() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let cursor: u64 = match node.db.get(Table::Meta, LEDGER_EVENT_CURSOR) {
                    Ok(cursor) => cursor.unwrap_or(0),
                    Err(e) => {
                        warn!("event cursor read failed: {}", e);
                        continue;
                    }
                };
                match node.ledger.events_since(cursor).await {
                    Ok((new_cursor, events)) => {
                        if !events.is_empty() {
                            if let Err(e) = node.domains.handle_ledger_events(&events).await {
                                warn!("ledger event handling failed: {}", e);
                                continue; // keep the cursor, re-deliver
                            }
                        }
                        if new_cursor != cursor {
                            let result: Result<(), DbError> = node.db.transaction(|txn| {
                                txn.put(Table::Meta, LEDGER_EVENT_CURSOR, &new_cursor)
                            });
                            if let Err(e) = result {
                                warn!("event cursor write failed: {}", e);
                            }
                        }
                    }
                    Err(e) => warn!("ledger event poll failed: {}", e),
                }
            }
        });
        *self.poller.lock() = Some(handle);
    }

    // -- Registration -------------------------------------------------------

    pub async fn register_domain(
        &self,
        domain: Arc<dyn Domain>,
        config: &Value,
    ) -> Result<(), EngineError> {
        Ok(self.domains.register_domain(domain, config).await?)
    }

    pub fn register_transport(&self, transport: Arc<dyn Transport>) {
        self.transport.register_transport(transport);
    }

    pub fn upsert_registry_records(
        &self,
        entries: Vec<RegistryEntry>,
        properties: Vec<RegistryProperty>,
    ) -> Result<(), EngineError> {
        Ok(self.registry.upsert_registry_records(entries, properties)?)
    }

    // -- Submission façade --------------------------------------------------

    pub async fn submit_transaction(&self, input: TransactionInput) -> Result<Uuid, TxError> {
        self.coordinator.submit_transaction(input).await
    }

    pub async fn update_transaction(
        &self,
        id: Uuid,
        update: TransactionUpdate,
    ) -> Result<(), TxError> {
        self.coordinator.update_transaction(id, update).await
    }

    pub fn get_receipt(&self, id: Uuid) -> Result<Option<TransactionReceipt>, TxError> {
        self.coordinator.get_receipt(id)
    }

    // -- Component access ---------------------------------------------------

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn db(&self) -> &Arc<CoreDb> {
        &self.db
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn abi(&self) -> &Arc<AbiResolver> {
        &self.abi
    }

    pub fn signer(&self) -> &Arc<SigningModule> {
        &self.signer
    }

    pub fn identity(&self) -> &Arc<IdentityResolver> {
        &self.identity
    }

    pub fn domains(&self) -> &Arc<DomainManager> {
        &self.domains
    }

    pub fn transport(&self) -> &Arc<TransportManager> {
        &self.transport
    }

    pub fn registry(&self) -> &Arc<RegistryManager> {
        &self.registry
    }

    pub fn publictx(&self) -> &Arc<PublicTxManager> {
        &self.publictx
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    // -- Shutdown -----------------------------------------------------------

    pub async fn stop(&self) {
        let _ = self.cancel_tx.send(true);
        if let Some(handle) = self.poller.lock().take() {
            let _ = handle.await;
        }
        self.coordinator.stop().await;
        self.publictx.stop().await;
        self.transport.stop().await;
        if let Err(e) = self.db.flush() {
            warn!("final store flush failed: {}", e);
        }
        info!(node = %self.config.node_name, "node stopped");
    }
}
