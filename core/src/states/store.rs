//! The durable side of the state store.
//!
//! Schemas, state rows, label rows, nullifiers, confirmation/spend
//! markers and privacy groups — always scoped by (domain,
//! contract-address, schema). A state is durably *available* iff a
//! confirmation marker exists for it and no spend marker does.
//!
//! Labels are persisted as rows at flush time (string-ish kinds in
//! `state_labels`, integer kinds in `state_int64_labels`), but queries
//! re-derive them from the state data on read — the same trade the
//! original storage layer makes to keep the write path lean.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::cache::{Cache, CacheConfig};
use crate::filters::{sort_by_fields, LabelValue, Query};
use crate::storage::{CoreDb, DbTxn, Table};
use crate::types::{LedgerAddress, SchemaId, StateId};

use super::context::{ContextInfo, DomainContext};
use super::schema::Schema;
use super::writer::{DbFlushWriter, FlushWriter};
use super::{MaterializedState, Nullifier, StateError};

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------
//
// Variable-width name fields are 0x00-terminated; the state id always
// sits either last in the key or behind an explicit length so the
// per-state label/marker rows share an unambiguous prefix (the cascade
// semantic: drop the state, drop its rows).

pub(crate) fn contract_prefix(domain: &str, contract: &LedgerAddress) -> Vec<u8> {
    let mut k = Vec::with_capacity(domain.len() + 1 + 20);
    k.extend_from_slice(domain.as_bytes());
    k.push(0);
    k.extend_from_slice(contract.as_bytes());
    k
}

pub(crate) fn state_key(domain: &str, contract: &LedgerAddress, id: &StateId) -> Vec<u8> {
    let mut k = contract_prefix(domain, contract);
    k.extend_from_slice(id.as_bytes());
    k
}

pub(crate) fn label_key(
    domain: &str,
    contract: &LedgerAddress,
    id: &StateId,
    field: &str,
) -> Vec<u8> {
    let mut k = contract_prefix(domain, contract);
    let id_bytes = id.as_bytes();
    k.extend_from_slice(&(id_bytes.len() as u16).to_be_bytes());
    k.extend_from_slice(id_bytes);
    k.extend_from_slice(field.as_bytes());
    k
}

pub(crate) fn label_table(value: &LabelValue) -> Table {
    match value {
        LabelValue::Int64(_) | LabelValue::Bool(_) | LabelValue::Timestamp(_) => {
            Table::StateInt64Labels
        }
        _ => Table::StateLabels,
    }
}

pub(crate) fn nullifier_key(domain: &str, state: &StateId) -> Vec<u8> {
    let mut k = Vec::with_capacity(domain.len() + 1 + state.as_bytes().len());
    k.extend_from_slice(domain.as_bytes());
    k.push(0);
    k.extend_from_slice(state.as_bytes());
    k
}

fn schema_key(domain: &str, id: &SchemaId) -> Vec<u8> {
    let mut k = Vec::with_capacity(domain.len() + 1 + 32);
    k.extend_from_slice(domain.as_bytes());
    k.push(0);
    k.extend_from_slice(id.as_bytes());
    k
}

fn group_key(domain: &str, id: &StateId) -> Vec<u8> {
    nullifier_key(domain, id)
}

// ---------------------------------------------------------------------------
// Stored rows
// ---------------------------------------------------------------------------

/// The durable form of a state. `data` is canonical JSON text (the
/// store's values are bincode, which cannot embed a raw JSON tree).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredState {
    pub id: StateId,
    pub schema: SchemaId,
    pub domain: String,
    pub contract: LedgerAddress,
    pub data: String,
    pub created_at: i64,
}

/// Finalisation marker: the transaction that confirmed / spent a state.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FinalityMarker {
    transaction: Uuid,
    at: i64,
}

/// A privacy group: the member list side-table for a genesis state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivacyGroup {
    pub domain: String,
    /// The id of the group's genesis state.
    pub id: StateId,
    pub members: Vec<String>,
}

/// A state arriving from a peer over state distribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceivedState {
    /// `None` when the sending domain defers id computation to the
    /// receiver (custom-hash domains fill these through the domain).
    pub id: Option<StateId>,
    pub schema: SchemaId,
    pub data: Value,
}

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

/// Configuration for the state store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateStoreConfig {
    #[serde(default)]
    pub schema_cache: CacheConfig,
}

/// The durable state store plus the registry of live domain contexts.
pub struct StateStore {
    db: Arc<CoreDb>,
    schema_cache: Cache<(String, SchemaId), Arc<Schema>>,
    writer: Arc<dyn FlushWriter>,
    contexts: Mutex<HashMap<Uuid, Weak<DomainContext>>>,
}

impl StateStore {
    pub fn new(db: Arc<CoreDb>, config: StateStoreConfig) -> Arc<Self> {
        let writer: Arc<dyn FlushWriter> = Arc::new(DbFlushWriter::new(Arc::clone(&db)));
        Self::with_writer(db, config, writer)
    }

    /// Construct with a custom flush writer (tests inject failures here).
    pub fn with_writer(
        db: Arc<CoreDb>,
        config: StateStoreConfig,
        writer: Arc<dyn FlushWriter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            schema_cache: Cache::new(config.schema_cache),
            writer,
            contexts: Mutex::new(HashMap::new()),
        })
    }

    pub fn db(&self) -> &Arc<CoreDb> {
        &self.db
    }

    pub(crate) fn writer(&self) -> Arc<dyn FlushWriter> {
        Arc::clone(&self.writer)
    }

    // -- Schemas ------------------------------------------------------------

    /// Stage schema inserts into a caller's transaction. Schemas are
    /// immutable: an existing row is left untouched. The cache is filled
    /// from the post-commit hook only.
    pub fn insert_schemas(
        &self,
        txn: &mut DbTxn<'_>,
        schemas: &[Schema],
    ) -> Result<(), StateError> {
        for schema in schemas {
            txn.put_if_absent(Table::Schemas, &schema_key(&schema.domain, &schema.id), schema)?;
        }
        Ok(())
    }

    /// Insert schemas in their own transaction.
    pub fn ensure_schemas(self: &Arc<Self>, schemas: &[Schema]) -> Result<(), StateError> {
        let this = Arc::clone(self);
        let to_cache: Vec<Schema> = schemas.to_vec();
        self.db.transaction(move |txn| {
            this.insert_schemas(txn, &to_cache)?;
            let this2 = Arc::clone(&this);
            let cached = to_cache.clone();
            txn.on_commit(move || {
                for schema in cached {
                    this2
                        .schema_cache
                        .set((schema.domain.clone(), schema.id), Arc::new(schema));
                }
            });
            Ok(())
        })
    }

    pub fn get_schema(&self, domain: &str, id: &SchemaId) -> Result<Arc<Schema>, StateError> {
        if let Some(schema) = self.schema_cache.get(&(domain.to_string(), *id)) {
            return Ok(schema);
        }
        let schema: Schema = self
            .db
            .get(Table::Schemas, &schema_key(domain, id))?
            .ok_or(StateError::SchemaNotFound(*id))?;
        let schema = Arc::new(schema);
        self.schema_cache
            .set((domain.to_string(), *id), Arc::clone(&schema));
        Ok(schema)
    }

    // -- Materialisation ----------------------------------------------------

    /// Validate raw data against a schema and produce a materialised
    /// entry. When `id` is `None` the default hash rule applies.
    pub fn process_state(
        &self,
        schema: &Schema,
        data: Value,
        id: Option<StateId>,
        created_at: i64,
    ) -> Result<MaterializedState, StateError> {
        let labels = schema.project_labels(&data)?;
        let id = id.unwrap_or_else(|| schema.default_state_id(&data));
        Ok(MaterializedState {
            id,
            schema: schema.id,
            domain: schema.domain.clone(),
            data,
            created_at,
            labels,
            nullifier: None,
        })
    }

    // -- Durable reads ------------------------------------------------------

    /// Load one state (any finality status), labels re-derived.
    pub fn get_state(
        &self,
        domain: &str,
        contract: &LedgerAddress,
        id: &StateId,
    ) -> Result<Option<MaterializedState>, StateError> {
        let Some(row) = self
            .db
            .get::<StoredState>(Table::States, &state_key(domain, contract, id))?
        else {
            return Ok(None);
        };
        Ok(Some(self.materialise_row(row)?))
    }

    fn materialise_row(&self, row: StoredState) -> Result<MaterializedState, StateError> {
        let schema = self.get_schema(&row.domain, &row.schema)?;
        let data: Value = serde_json::from_str(&row.data)
            .map_err(|e| StateError::InvalidState(format!("stored data unparseable: {}", e)))?;
        let labels = schema.project_labels(&data)?;
        let nullifier = self
            .db
            .get::<Nullifier>(Table::StateNullifiers, &nullifier_key(&row.domain, &row.id))?;
        Ok(MaterializedState {
            id: row.id,
            schema: row.schema,
            domain: row.domain,
            data,
            created_at: row.created_at,
            labels,
            nullifier,
        })
    }

    /// Durable "available" query: confirmed, not spent, not excluded,
    /// matching the query — sorted and truncated under the query's own
    /// sort/limit. The caller (a domain context) merges its overlay on
    /// top and re-sorts.
    pub fn find_available_states(
        &self,
        domain: &str,
        contract: &LedgerAddress,
        schema_id: &SchemaId,
        query: &Query,
        exclude: &HashSet<StateId>,
        require_nullifier: bool,
    ) -> Result<Vec<MaterializedState>, StateError> {
        let schema = self.get_schema(domain, schema_id)?;
        let kind_of = |field: &str| schema.label_kind(field);

        let prefix = contract_prefix(domain, contract);
        let mut matches: Vec<MaterializedState> = Vec::new();
        for (key, row) in self.db.scan_prefix::<StoredState>(Table::States, &prefix)? {
            if row.schema != *schema_id || exclude.contains(&row.id) {
                continue;
            }
            if !self.db.contains(Table::StateConfirms, &key)? {
                continue;
            }
            if self.db.contains(Table::StateSpends, &key)? {
                continue;
            }
            let state = self.materialise_row(row)?;
            if require_nullifier && state.nullifier.is_none() {
                continue;
            }
            if query.matches(&kind_of, &state.labels)? {
                matches.push(state);
            }
        }

        let sort = query.sort_fields();
        sort_by_fields(&mut matches, &sort, |s, field| s.labels.get(field).cloned());
        if let Some(limit) = query.limit {
            matches.truncate(limit);
        }
        Ok(matches)
    }

    // -- Peer receive path --------------------------------------------------

    /// Persist states received from a peer, bypassing any context.
    ///
    /// Ids arrive already resolved: through [`Self::resolve_default_ids`]
    /// for the default hash rule, or through the domain's
    /// `validate_state_hashes` when it declares a custom one.
    /// Re-receiving a known id is an idempotent no-op, which is what
    /// makes resent distributions safe.
    pub fn write_received_states(
        &self,
        domain: &str,
        contract: &LedgerAddress,
        states: Vec<(StateId, SchemaId, Value)>,
        created_at: i64,
    ) -> Result<Vec<StateId>, StateError> {
        let mut materialised = Vec::with_capacity(states.len());
        for (id, schema_id, data) in states {
            let schema = self.get_schema(domain, &schema_id)?;
            let state = self.process_state(&schema, data, Some(id), created_at)?;
            materialised.push(state);
        }

        let contract = *contract;
        self.db.transaction(|txn| {
            let mut written = Vec::with_capacity(materialised.len());
            for state in &materialised {
                let key = state_key(&state.domain, &contract, &state.id);
                if !txn.exists(Table::States, &key)? {
                    DbFlushWriter::stage_state(txn, contract, state)?;
                }
                written.push(state.id.clone());
            }
            Ok(written)
        })
    }

    /// Apply the default hash rule to received states: fill missing ids,
    /// verify provided ones.
    pub fn resolve_default_ids(
        &self,
        domain: &str,
        states: &[ReceivedState],
    ) -> Result<Vec<StateId>, StateError> {
        let mut ids = Vec::with_capacity(states.len());
        for received in states {
            let schema = self.get_schema(domain, &received.schema)?;
            let expected = schema.default_state_id(&received.data);
            match &received.id {
                Some(id) if *id != expected => {
                    return Err(StateError::HashMismatch {
                        expected,
                        got: id.clone(),
                    });
                }
                _ => ids.push(expected),
            }
        }
        Ok(ids)
    }

    // -- Finalisation markers -----------------------------------------------

    /// Stage confirmation markers for created states and spend markers
    /// for consumed ones, in the caller's (finalisation) transaction.
    pub fn stage_finality(
        &self,
        txn: &mut DbTxn<'_>,
        domain: &str,
        contract: &LedgerAddress,
        transaction: Uuid,
        confirmed: &[StateId],
        spent: &[StateId],
    ) -> Result<(), StateError> {
        let marker = FinalityMarker {
            transaction,
            at: crate::types::now_millis(),
        };
        for id in confirmed {
            txn.put_if_absent(Table::StateConfirms, &state_key(domain, contract, id), &marker)?;
        }
        for id in spent {
            txn.put_if_absent(Table::StateSpends, &state_key(domain, contract, id), &marker)?;
        }
        debug!(
            domain,
            %transaction,
            confirmed = confirmed.len(),
            spent = spent.len(),
            "staged state finality markers"
        );
        Ok(())
    }

    // -- Privacy groups -----------------------------------------------------

    pub fn stage_privacy_group(
        &self,
        txn: &mut DbTxn<'_>,
        group: &PrivacyGroup,
    ) -> Result<(), StateError> {
        txn.put(Table::PrivacyGroups, &group_key(&group.domain, &group.id), group)?;
        for (i, member) in group.members.iter().enumerate() {
            let mut key = group_key(&group.domain, &group.id);
            key.extend_from_slice(&(i as u32).to_be_bytes());
            txn.put(Table::PrivacyGroupMembers, &key, member)?;
        }
        Ok(())
    }

    pub fn get_privacy_group(
        &self,
        domain: &str,
        id: &StateId,
    ) -> Result<Option<PrivacyGroup>, StateError> {
        Ok(self.db.get(Table::PrivacyGroups, &group_key(domain, id))?)
    }

    // -- Contexts -----------------------------------------------------------

    /// Open a fresh domain context for one (domain, contract).
    ///
    /// Callers own the returned handle and must `close()` it; the store
    /// only keeps a weak registration for lookup and status listing.
    pub fn new_context(
        self: &Arc<Self>,
        domain: &str,
        contract: LedgerAddress,
    ) -> Arc<DomainContext> {
        let ctx = DomainContext::new(Arc::clone(self), domain, contract);
        self.contexts.lock().insert(ctx.id(), Arc::downgrade(&ctx));
        debug!(id = %ctx.id(), domain, contract = %contract, "domain context opened");
        ctx
    }

    /// Look up a live context by id.
    pub fn get_context(&self, id: Uuid) -> Option<Arc<DomainContext>> {
        self.contexts.lock().get(&id).and_then(Weak::upgrade)
    }

    /// Info rows for every live context.
    pub fn list_contexts(&self) -> Vec<ContextInfo> {
        self.contexts
            .lock()
            .values()
            .filter_map(|w| w.upgrade())
            .map(|c| c.info())
            .collect()
    }

    pub(crate) fn remove_context(&self, id: Uuid) {
        self.contexts.lock().remove(&id);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::LabelKind;
    use crate::states::schema::{FieldDef, SchemaDeclaration};
    use crate::storage::DbError;
    use serde_json::json;

    fn coin_schema() -> Schema {
        Schema::new(
            "notes",
            SchemaDeclaration {
                name: "coin".to_string(),
                fields: vec![
                    FieldDef::indexed("owner", LabelKind::String),
                    FieldDef::indexed("amount", LabelKind::Uint256),
                ],
            },
        )
    }

    fn store() -> (Arc<StateStore>, Schema, LedgerAddress) {
        let db = Arc::new(CoreDb::open_temporary().unwrap());
        let store = StateStore::new(db, StateStoreConfig::default());
        let schema = coin_schema();
        store.ensure_schemas(&[schema.clone()]).unwrap();
        (store, schema, LedgerAddress([7u8; 20]))
    }

    fn persist_confirmed(
        store: &Arc<StateStore>,
        schema: &Schema,
        contract: &LedgerAddress,
        owner: &str,
        amount: u64,
    ) -> StateId {
        let data = json!({"owner": owner, "amount": amount.to_string()});
        let state = store.process_state(schema, data, None, 1).unwrap();
        let id = state.id.clone();
        let contract = *contract;
        store
            .db()
            .transaction::<_, StateError, _>(|txn| {
                DbFlushWriter::stage_state(txn, contract, &state)?;
                Ok(())
            })
            .unwrap();
        store
            .db()
            .transaction::<_, StateError, _>(|txn| {
                store.stage_finality(txn, "notes", &contract, Uuid::new_v4(), &[id.clone()], &[])
            })
            .unwrap();
        id
    }

    #[test]
    fn schema_roundtrip_and_cache() {
        let (store, schema, _) = store();
        let loaded = store.get_schema("notes", &schema.id).unwrap();
        assert_eq!(loaded.declaration, schema.declaration);

        let missing = SchemaId([0xee; 32]);
        assert!(matches!(
            store.get_schema("notes", &missing),
            Err(StateError::SchemaNotFound(_))
        ));
    }

    #[test]
    fn unconfirmed_states_are_not_available() {
        let (store, schema, contract) = store();

        // Written but never confirmed.
        let data = json!({"owner": "alice", "amount": "5"});
        let state = store.process_state(&schema, data, None, 1).unwrap();
        store
            .db()
            .transaction::<_, StateError, _>(|txn| {
                DbFlushWriter::stage_state(txn, contract, &state)?;
                Ok(())
            })
            .unwrap();

        let found = store
            .find_available_states(
                "notes",
                &contract,
                &schema.id,
                &Query::build().sort("amount").query(),
                &HashSet::new(),
                false,
            )
            .unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn available_query_filters_sorts_limits() {
        let (store, schema, contract) = store();
        persist_confirmed(&store, &schema, &contract, "alice", 30);
        persist_confirmed(&store, &schema, &contract, "alice", 10);
        persist_confirmed(&store, &schema, &contract, "bob", 20);

        let query = Query::build()
            .eq("owner", json!("alice"))
            .sort("amount")
            .limit(1)
            .query();
        let found = store
            .find_available_states("notes", &contract, &schema.id, &query, &HashSet::new(), false)
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].labels.get("owner").unwrap().to_string(), "alice");
        // Lowest amount first under ascending sort.
        assert_eq!(
            found[0].data.get("amount").unwrap().as_str().unwrap(),
            "10"
        );
    }

    #[test]
    fn spent_and_excluded_states_disappear() {
        let (store, schema, contract) = store();
        let a = persist_confirmed(&store, &schema, &contract, "alice", 1);
        let b = persist_confirmed(&store, &schema, &contract, "alice", 2);

        // Spend a durably.
        store
            .db()
            .transaction::<_, StateError, _>(|txn| {
                store.stage_finality(txn, "notes", &contract, Uuid::new_v4(), &[], &[a.clone()])
            })
            .unwrap();

        let query = Query::build().sort("amount").query();
        let found = store
            .find_available_states("notes", &contract, &schema.id, &query, &HashSet::new(), false)
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, b);

        // Exclusion set (context spend-locks) hides the rest.
        let excluded: HashSet<StateId> = [b].into_iter().collect();
        let found = store
            .find_available_states("notes", &contract, &schema.id, &query, &excluded, false)
            .unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn received_states_fill_and_verify_default_ids() {
        let (store, schema, contract) = store();
        let data = json!({"owner": "carol", "amount": "9"});
        let expected = schema.default_state_id(&data);

        // Nil id gets filled.
        let ids = store
            .resolve_default_ids(
                "notes",
                &[ReceivedState {
                    id: None,
                    schema: schema.id,
                    data: data.clone(),
                }],
            )
            .unwrap();
        assert_eq!(ids, vec![expected.clone()]);

        // Mismatched id is rejected.
        let err = store
            .resolve_default_ids(
                "notes",
                &[ReceivedState {
                    id: Some(StateId::new(vec![1, 2, 3])),
                    schema: schema.id,
                    data: data.clone(),
                }],
            )
            .unwrap_err();
        assert!(matches!(err, StateError::HashMismatch { .. }));

        // Writing twice dedupes on id.
        for _ in 0..2 {
            store
                .write_received_states(
                    "notes",
                    &contract,
                    vec![(expected.clone(), schema.id, data.clone())],
                    5,
                )
                .unwrap();
        }
        assert_eq!(store.db().count(Table::States), 1);
    }

    #[test]
    fn privacy_group_roundtrip() {
        let (store, _, _) = store();
        let group = PrivacyGroup {
            domain: "notes".to_string(),
            id: StateId::new(vec![0xaa; 32]),
            members: vec!["alice@node1".to_string(), "bob@node2".to_string()],
        };
        store
            .db()
            .transaction::<_, StateError, _>(|txn| store.stage_privacy_group(txn, &group))
            .unwrap();
        let loaded = store.get_privacy_group("notes", &group.id).unwrap().unwrap();
        assert_eq!(loaded, group);
        assert!(store
            .get_privacy_group("notes", &StateId::new(vec![0xbb; 32]))
            .unwrap()
            .is_none());
    }

    #[test]
    fn transaction_error_type_conversion() {
        // StateError must be usable as the error of a gateway transaction.
        let (store, _, _) = store();
        let result: Result<(), StateError> = store.db().transaction(|_txn| {
            Err(StateError::Db(DbError::Conflict("x".into())))
        });
        assert!(result.is_err());
    }
}
