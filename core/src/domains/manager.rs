//! The domain manager: loaded domains and the smart-contract registry.
//!
//! Contracts are discovered from base-ledger registration events. On
//! first sight of an address the owning domain parses the instance
//! config and the record is inserted — durably, with the by-address
//! cache filled post-commit. Deploy submitters park on a single-flight
//! waiter keyed by their transaction id (`exec_deploy_and_wait`), woken
//! when the registration event lands, so the cache is populated exactly
//! once no matter how many lookups race.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{Cache, CacheConfig};
use crate::states::{DomainContext, Schema, StateStore};
use crate::storage::{CoreDb, Table};
use crate::types::{LedgerAddress, LedgerEvent};

use super::{
    AssembleResult, ContractRegistration, Domain, DomainError, EndorseOutcome, EndorseRequest,
    PrepareInput, PrepareResult, PrivateTxSpec, ResolvedVerifier, VerifierRequest,
};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainManagerConfig {
    #[serde(default)]
    pub contract_cache: CacheConfig,
    /// How long a deploy submitter waits for its registration event.
    pub deploy_wait_timeout_ms: u64,
}

impl Default for DomainManagerConfig {
    fn default() -> Self {
        Self {
            contract_cache: CacheConfig::default(),
            deploy_wait_timeout_ms: 30_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Smart contracts
// ---------------------------------------------------------------------------

/// A registered private smart contract instance.
#[derive(Debug, Clone, PartialEq)]
pub struct SmartContract {
    pub address: LedgerAddress,
    pub domain: String,
    /// Per-instance config as parsed by the domain.
    pub config: Value,
}

/// Durable row form (`config` as JSON text for the bincode store).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredSmartContract {
    address: LedgerAddress,
    domain: String,
    config: String,
}

impl StoredSmartContract {
    fn to_record(&self) -> Result<SmartContract, DomainError> {
        Ok(SmartContract {
            address: self.address,
            domain: self.domain.clone(),
            config: serde_json::from_str(&self.config)
                .map_err(|e| DomainError::ConfigInvalid(e.to_string()))?,
        })
    }
}

// ---------------------------------------------------------------------------
// DomainManager
// ---------------------------------------------------------------------------

pub struct DomainManager {
    db: Arc<CoreDb>,
    store: Arc<StateStore>,
    config: DomainManagerConfig,
    domains: RwLock<HashMap<String, Arc<dyn Domain>>>,
    contracts: Cache<LedgerAddress, Arc<SmartContract>>,
    deploy_waiters: Mutex<HashMap<Uuid, Vec<oneshot::Sender<Arc<SmartContract>>>>>,
}

impl DomainManager {
    pub fn new(db: Arc<CoreDb>, store: Arc<StateStore>, config: DomainManagerConfig) -> Arc<Self> {
        let contracts = Cache::new(config.contract_cache);
        Arc::new(Self {
            db,
            store,
            config,
            domains: RwLock::new(HashMap::new()),
            contracts,
            deploy_waiters: Mutex::new(HashMap::new()),
        })
    }

    // -- Domain loading -----------------------------------------------------

    /// Load a domain: run Configure, register its schemas, add it to
    /// the by-name table.
    pub async fn register_domain(
        &self,
        domain: Arc<dyn Domain>,
        config: &Value,
    ) -> Result<(), DomainError> {
        let name = domain.name().to_string();
        let capabilities = domain.configure(config).await?;

        let schemas: Vec<Schema> = capabilities
            .schemas
            .into_iter()
            .map(|declaration| Schema::new(&name, declaration))
            .collect();
        self.store.ensure_schemas(&schemas)?;

        info!(domain = %name, schemas = schemas.len(), "domain registered");
        self.domains.write().insert(name, domain);
        Ok(())
    }

    pub fn get_domain(&self, name: &str) -> Result<Arc<dyn Domain>, DomainError> {
        self.domains
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| DomainError::NotLoaded(name.to_string()))
    }

    pub fn domain_names(&self) -> Vec<String> {
        self.domains.read().keys().cloned().collect()
    }

    // -- Contract registry --------------------------------------------------

    /// Insert a contract record from a registration event. Idempotent
    /// on the address; cache fill and deploy-waiter wakeup happen only
    /// after the commit.
    pub async fn register_contract(
        self: &Arc<Self>,
        domain_name: &str,
        registration: &ContractRegistration,
    ) -> Result<Arc<SmartContract>, DomainError> {
        let domain = self.get_domain(domain_name)?;
        let parsed = domain
            .init_contract(registration.address, &registration.config)
            .await?;

        let record = Arc::new(SmartContract {
            address: registration.address,
            domain: domain_name.to_string(),
            config: parsed,
        });
        let stored = StoredSmartContract {
            address: record.address,
            domain: record.domain.clone(),
            config: record.config.to_string(),
        };

        let this = Arc::clone(self);
        let cached = Arc::clone(&record);
        let deploy_tx = registration.deploy_transaction;
        self.db.transaction(move |txn| {
            txn.put_if_absent(Table::SmartContracts, stored.address.as_bytes(), &stored)?;
            txn.on_commit(move || {
                this.contracts.set(cached.address, Arc::clone(&cached));
                if let Some(tx) = deploy_tx {
                    let waiters = this.deploy_waiters.lock().remove(&tx).unwrap_or_default();
                    for waiter in waiters {
                        let _ = waiter.send(Arc::clone(&cached));
                    }
                }
            });
            Ok::<(), DomainError>(())
        })?;

        debug!(address = %record.address, domain = domain_name, "smart contract registered");
        Ok(record)
    }

    fn lookup_contract(&self, address: &LedgerAddress) -> Result<Arc<SmartContract>, DomainError> {
        if let Some(record) = self.contracts.get(address) {
            return Ok(record);
        }
        let stored: StoredSmartContract = self
            .db
            .get(Table::SmartContracts, address.as_bytes())?
            .ok_or(DomainError::ContractNotFound(*address))?;
        let record = Arc::new(stored.to_record()?);
        self.contracts.set(*address, Arc::clone(&record));
        Ok(record)
    }

    /// The handle through which the coordinator drives the four phases
    /// against one contract.
    pub fn smart_contract(
        &self,
        address: &LedgerAddress,
    ) -> Result<DomainSmartContract, DomainError> {
        let contract = self.lookup_contract(address)?;
        let domain = self.get_domain(&contract.domain)?;
        Ok(DomainSmartContract { domain, contract })
    }

    // -- Deploy single-flight -----------------------------------------------

    /// Run `submit` (which must durably enqueue the deploy transaction
    /// `tx_id`), then wait for the matching registration event.
    ///
    /// Concurrent callers for the same transaction all park here and
    /// are woken by the same post-commit notification.
    pub async fn exec_deploy_and_wait<F, Fut>(
        self: &Arc<Self>,
        tx_id: Uuid,
        submit: F,
    ) -> Result<DomainSmartContract, DomainError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), DomainError>>,
    {
        let (sender, receiver) = oneshot::channel();
        self.deploy_waiters.lock().entry(tx_id).or_default().push(sender);

        if let Err(e) = submit().await {
            // Submission never happened; drop our waiter registration.
            drop(receiver);
            if let Some(waiters) = self.deploy_waiters.lock().get_mut(&tx_id) {
                waiters.retain(|w| !w.is_closed());
            }
            return Err(e);
        }

        let timeout = std::time::Duration::from_millis(self.config.deploy_wait_timeout_ms);
        let record = match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(record)) => record,
            Ok(Err(_)) | Err(_) => {
                self.deploy_waiters.lock().remove(&tx_id);
                return Err(DomainError::DeployTimeout(tx_id));
            }
        };
        let domain = self.get_domain(&record.domain)?;
        Ok(DomainSmartContract {
            domain,
            contract: record,
        })
    }

    // -- Ledger events ------------------------------------------------------

    /// Route a batch of base-ledger events through every loaded domain
    /// and apply the registrations they extract.
    pub async fn handle_ledger_events(
        self: &Arc<Self>,
        events: &[LedgerEvent],
    ) -> Result<(), DomainError> {
        if events.is_empty() {
            return Ok(());
        }
        let domains: Vec<(String, Arc<dyn Domain>)> = self
            .domains
            .read()
            .iter()
            .map(|(n, d)| (n.clone(), Arc::clone(d)))
            .collect();

        for (name, domain) in domains {
            let handling = domain.handle_event_batch(events).await?;
            for registration in &handling.registrations {
                if let Err(e) = self.register_contract(&name, registration).await {
                    warn!(domain = %name, address = %registration.address, "registration failed: {}", e);
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// DomainSmartContract
// ---------------------------------------------------------------------------

/// A bound (domain, contract) pair: the four-phase contract plus the
/// read-only call pathway, as invoked by the private tx coordinator.
#[derive(Clone)]
pub struct DomainSmartContract {
    domain: Arc<dyn Domain>,
    contract: Arc<SmartContract>,
}

impl std::fmt::Debug for DomainSmartContract {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainSmartContract")
            .field("domain", &self.domain.name())
            .field("contract", &self.contract)
            .finish()
    }
}

impl DomainSmartContract {
    pub fn domain(&self) -> &Arc<dyn Domain> {
        &self.domain
    }

    pub fn domain_name(&self) -> &str {
        self.domain.name()
    }

    pub fn address(&self) -> LedgerAddress {
        self.contract.address
    }

    pub fn config(&self) -> &Value {
        &self.contract.config
    }

    pub async fn init_transaction(
        &self,
        tx: &PrivateTxSpec,
    ) -> Result<Vec<VerifierRequest>, DomainError> {
        self.domain.init_transaction(tx).await
    }

    pub async fn assemble_transaction(
        &self,
        ctx: &DomainContext,
        tx: &PrivateTxSpec,
        verifiers: &[ResolvedVerifier],
    ) -> Result<AssembleResult, DomainError> {
        self.domain.assemble_transaction(ctx, tx, verifiers).await
    }

    pub async fn endorse_transaction(
        &self,
        ctx: &DomainContext,
        req: &EndorseRequest,
    ) -> Result<EndorseOutcome, DomainError> {
        self.domain.endorse_transaction(ctx, req).await
    }

    pub async fn prepare_transaction(
        &self,
        tx: &PrivateTxSpec,
        input: &PrepareInput,
    ) -> Result<PrepareResult, DomainError> {
        self.domain.prepare_transaction(tx, input).await
    }

    pub async fn init_call(&self, tx: &PrivateTxSpec) -> Result<Vec<VerifierRequest>, DomainError> {
        self.domain.init_call(tx).await
    }

    pub async fn exec_call(
        &self,
        ctx: &DomainContext,
        tx: &PrivateTxSpec,
        verifiers: &[ResolvedVerifier],
    ) -> Result<Value, DomainError> {
        self.domain.exec_call(ctx, tx, verifiers).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::super::notes::{NotesConfig, NotesDomain};
    use super::*;
    use crate::states::StateStoreConfig;
    use serde_json::json;

    async fn manager_with_notes() -> Arc<DomainManager> {
        let db = Arc::new(CoreDb::open_temporary().unwrap());
        let store = StateStore::new(Arc::clone(&db), StateStoreConfig::default());
        let manager = DomainManager::new(db, store, DomainManagerConfig::default());
        let domain = Arc::new(NotesDomain::new("noto", NotesConfig::default()));
        manager
            .register_domain(domain, &json!({}))
            .await
            .unwrap();
        manager
    }

    fn registration(address: LedgerAddress, deploy_tx: Option<Uuid>) -> ContractRegistration {
        ContractRegistration {
            address,
            config: json!({"notary": "alice@node1"}),
            deploy_transaction: deploy_tx,
        }
    }

    #[tokio::test]
    async fn register_domain_exposes_it_by_name() {
        let manager = manager_with_notes().await;
        assert!(manager.get_domain("noto").is_ok());
        assert!(matches!(
            manager.get_domain("zkcoin"),
            Err(DomainError::NotLoaded(_))
        ));
        assert_eq!(manager.domain_names(), vec!["noto".to_string()]);
    }

    #[tokio::test]
    async fn contract_registration_and_lookup() {
        let manager = manager_with_notes().await;
        let address = LedgerAddress([3u8; 20]);

        assert!(matches!(
            manager.smart_contract(&address),
            Err(DomainError::ContractNotFound(_))
        ));

        manager
            .register_contract("noto", &registration(address, None))
            .await
            .unwrap();

        let handle = manager.smart_contract(&address).unwrap();
        assert_eq!(handle.address(), address);
        assert_eq!(handle.domain_name(), "noto");

        // Idempotent re-registration.
        manager
            .register_contract("noto", &registration(address, None))
            .await
            .unwrap();
        assert_eq!(manager.db.count(Table::SmartContracts), 1);
    }

    #[tokio::test]
    async fn exec_deploy_and_wait_wakes_on_registration() {
        let manager = manager_with_notes().await;
        let address = LedgerAddress([4u8; 20]);
        let tx_id = Uuid::new_v4();

        // Simulate the registration event landing after submission.
        let registrar = Arc::clone(&manager);
        let waiter = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .exec_deploy_and_wait(tx_id, || async { Ok(()) })
                    .await
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        registrar
            .register_contract("noto", &registration(address, Some(tx_id)))
            .await
            .unwrap();

        let handle = waiter.await.unwrap().unwrap();
        assert_eq!(handle.address(), address);
    }

    #[tokio::test]
    async fn exec_deploy_and_wait_times_out() {
        let db = Arc::new(CoreDb::open_temporary().unwrap());
        let store = StateStore::new(Arc::clone(&db), StateStoreConfig::default());
        let manager = DomainManager::new(
            db,
            store,
            DomainManagerConfig {
                deploy_wait_timeout_ms: 20,
                ..Default::default()
            },
        );
        let err = manager
            .exec_deploy_and_wait(Uuid::new_v4(), || async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::DeployTimeout(_)));
    }

    #[tokio::test]
    async fn failed_submission_surfaces_before_waiting() {
        let manager = manager_with_notes().await;
        let err = manager
            .exec_deploy_and_wait(Uuid::new_v4(), || async {
                Err(DomainError::Transient("db down".to_string()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Transient(_)));
    }
}
