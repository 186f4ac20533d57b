//! Function ABIs and submission-time resolution.
//!
//! A transaction input carries either inline function definitions or a
//! reference to a previously stored ABI. Resolution picks the one
//! function being invoked (by name, by full signature, or the
//! constructor for deploys), normalizes the JSON inputs against its
//! declared parameters, and hands back a `ResolvedFunction` whose
//! `abi_reference` is the content hash under which the ABI is stored.
//!
//! ABIs are immutable rows keyed by that hash; the by-hash cache is
//! filled from post-commit hooks only.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::cache::{Cache, CacheConfig};
use crate::error::{Classified, ErrorKind};
use crate::storage::{CoreDb, DbError, DbTxn, Table};
use crate::types::LedgerAddress;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum AbiError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error("supply either inline abi or an abiReference, not both")]
    AbiAndReference,

    #[error("no abi or abiReference supplied for an invoke of {0}")]
    NoAbiOrReference(LedgerAddress),

    #[error("a function can only be specified together with a 'to' address")]
    FunctionWithoutTo,

    #[error("abi {0} not found")]
    AbiNotFound(AbiHash),

    #[error("function selector matched more than one entry: {0} and {1}")]
    MultiMatch(String, String),

    #[error("no function matched {0:?}")]
    NoMatch(String),

    #[error("invalid input data: {0}")]
    BadInput(String),
}

impl Classified for AbiError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Db(DbError::NotFound(_)) | Self::AbiNotFound(_) => ErrorKind::NotFound,
            Self::Db(_) => ErrorKind::Transient,
            _ => ErrorKind::InputValidation,
        }
    }
}

// ---------------------------------------------------------------------------
// AbiHash
// ---------------------------------------------------------------------------

/// Content hash of a stored ABI: SHA-256 of its canonical JSON.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct AbiHash(pub [u8; 32]);

impl AbiHash {
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl fmt::Display for AbiHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for AbiHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AbiHash({})", self.to_hex())
    }
}

impl FromStr for AbiHash {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let stripped = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(stripped).map_err(|e| e.to_string())?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| format!("abi hash must be 32 bytes, got {}", v.len()))?;
        Ok(Self(arr))
    }
}

impl Serialize for AbiHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for AbiHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Function shape
// ---------------------------------------------------------------------------

/// Parameter types the engine understands for input normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AbiType {
    String,
    Uint256,
    Address,
    Bytes,
    Bool,
}

impl AbiType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Uint256 => "uint256",
            Self::Address => "address",
            Self::Bytes => "bytes",
            Self::Bool => "bool",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbiParam {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: AbiType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AbiEntryType {
    Function,
    Constructor,
}

/// One callable entry of an ABI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbiFunction {
    #[serde(rename = "type")]
    pub entry_type: AbiEntryType,
    /// Empty for constructors.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub inputs: Vec<AbiParam>,
}

impl AbiFunction {
    pub fn function(name: &str, inputs: Vec<AbiParam>) -> Self {
        Self {
            entry_type: AbiEntryType::Function,
            name: name.to_string(),
            inputs,
        }
    }

    pub fn constructor(inputs: Vec<AbiParam>) -> Self {
        Self {
            entry_type: AbiEntryType::Constructor,
            name: String::new(),
            inputs,
        }
    }

    /// Full signature, e.g. `transfer(string,uint256)`.
    pub fn signature(&self) -> String {
        let name = match self.entry_type {
            AbiEntryType::Constructor => "constructor",
            AbiEntryType::Function => &self.name,
        };
        let types: Vec<&str> = self.inputs.iter().map(|p| p.kind.name()).collect();
        format!("{}({})", name, types.join(","))
    }
}

/// The default no-argument constructor used when a deploy is submitted
/// without any ABI at all.
pub fn default_constructor() -> AbiFunction {
    AbiFunction::constructor(vec![])
}

/// A durably stored ABI: the hash is the row key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredAbi {
    pub hash: AbiHash,
    pub functions: Vec<AbiFunction>,
}

/// The outcome of submission-time resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedFunction {
    pub abi_reference: AbiHash,
    pub function: AbiFunction,
}

impl ResolvedFunction {
    pub fn signature(&self) -> String {
        self.function.signature()
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

pub struct AbiResolver {
    db: Arc<CoreDb>,
    cache: Cache<AbiHash, Arc<StoredAbi>>,
}

impl AbiResolver {
    pub fn new(db: Arc<CoreDb>, cache: CacheConfig) -> Arc<Self> {
        Arc::new(Self {
            db,
            cache: Cache::new(cache),
        })
    }

    fn hash_functions(functions: &[AbiFunction]) -> AbiHash {
        let canonical = serde_json::to_value(functions)
            .expect("abi serializes")
            .to_string();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        AbiHash(hasher.finalize().into())
    }

    /// Stage an ABI insert (idempotent on the content hash) into the
    /// caller's transaction, filling the cache post-commit.
    pub fn upsert_abi(
        self: &Arc<Self>,
        txn: &mut DbTxn<'_>,
        functions: &[AbiFunction],
    ) -> Result<AbiHash, AbiError> {
        let hash = Self::hash_functions(functions);
        let stored = StoredAbi {
            hash,
            functions: functions.to_vec(),
        };
        txn.put_if_absent(Table::Abis, &hash.0, &stored)?;

        let this = Arc::clone(self);
        let cached = Arc::new(stored);
        txn.on_commit(move || this.cache.set(hash, cached));
        Ok(hash)
    }

    pub fn get_abi(&self, hash: &AbiHash) -> Result<Arc<StoredAbi>, AbiError> {
        if let Some(abi) = self.cache.get(hash) {
            return Ok(abi);
        }
        let stored: StoredAbi = self
            .db
            .get(Table::Abis, &hash.0)?
            .ok_or(AbiError::AbiNotFound(*hash))?;
        let stored = Arc::new(stored);
        self.cache.set(*hash, Arc::clone(&stored));
        Ok(stored)
    }

    /// Resolve the function a submission is invoking.
    ///
    /// - With `abi_reference`: look up the stored ABI (inline ABI then
    ///   forbidden).
    /// - With inline `abi`: upsert it first so the reference exists.
    /// - With neither: only a plain deploy is possible, using the
    ///   default no-argument constructor.
    ///
    /// `to == None` means deploy (constructor); otherwise a function
    /// entry must match `function` by bare name or full signature, and
    /// the match must be unique.
    pub fn resolve_function(
        self: &Arc<Self>,
        txn: &mut DbTxn<'_>,
        abi: Option<&[AbiFunction]>,
        abi_reference: Option<AbiHash>,
        function: Option<&str>,
        to: Option<&LedgerAddress>,
    ) -> Result<ResolvedFunction, AbiError> {
        if function.is_some_and(|f| !f.is_empty()) && to.is_none() {
            return Err(AbiError::FunctionWithoutTo);
        }

        let stored = match (abi_reference, abi) {
            (Some(_), Some(_)) => return Err(AbiError::AbiAndReference),
            (Some(reference), None) => self.get_abi(&reference)?,
            (None, Some(functions)) if !functions.is_empty() => {
                let hash = self.upsert_abi(txn, functions)?;
                Arc::new(StoredAbi {
                    hash,
                    functions: functions.to_vec(),
                })
            }
            (None, _) => match to {
                Some(addr) => return Err(AbiError::NoAbiOrReference(*addr)),
                None => {
                    // A deploy with no constructor arguments: hash the
                    // default constructor so a reference always exists.
                    let functions = vec![default_constructor()];
                    let hash = self.upsert_abi(txn, &functions)?;
                    Arc::new(StoredAbi { hash, functions })
                }
            },
        };

        let wanted = function.unwrap_or("");
        let mut selected: Option<&AbiFunction> = None;
        for entry in &stored.functions {
            let is_match = match (entry.entry_type, to) {
                (AbiEntryType::Constructor, None) => true,
                (AbiEntryType::Function, Some(_)) => {
                    if wanted.is_empty() {
                        true
                    } else if wanted.contains('(') {
                        entry.signature() == wanted
                    } else {
                        entry.name == wanted
                    }
                }
                _ => false,
            };
            if is_match {
                if let Some(previous) = selected {
                    return Err(AbiError::MultiMatch(
                        previous.signature(),
                        entry.signature(),
                    ));
                }
                selected = Some(entry);
            }
        }

        let function = match selected {
            Some(f) => f.clone(),
            // Non-empty ABI with no constructor entry: the common case
            // for a deploy, fall back to the default constructor.
            None if to.is_none() => default_constructor(),
            None => return Err(AbiError::NoMatch(wanted.to_string())),
        };

        Ok(ResolvedFunction {
            abi_reference: stored.hash,
            function,
        })
    }

    /// Validate input data against the function's parameters and return
    /// the normalized JSON object that gets persisted: every declared
    /// parameter present, values in canonical form (uint256 as decimal
    /// strings, addresses and bytes as lowercase 0x-hex), nothing extra.
    pub fn normalize_inputs(function: &AbiFunction, data: &Value) -> Result<Value, AbiError> {
        let empty = serde_json::Map::new();
        let obj = match data {
            Value::Null => &empty,
            Value::Object(o) => o,
            other => {
                return Err(AbiError::BadInput(format!(
                    "inputs must be a JSON object, got {}",
                    json_type_name(other)
                )))
            }
        };

        for key in obj.keys() {
            if !function.inputs.iter().any(|p| p.name == *key) {
                return Err(AbiError::BadInput(format!(
                    "unknown input field {:?} for {}",
                    key,
                    function.signature()
                )));
            }
        }

        let mut normalized = serde_json::Map::new();
        for param in &function.inputs {
            let raw = obj.get(&param.name).ok_or_else(|| {
                AbiError::BadInput(format!(
                    "missing required input {:?} for {}",
                    param.name,
                    function.signature()
                ))
            })?;
            normalized.insert(param.name.clone(), normalize_value(param, raw)?);
        }
        Ok(Value::Object(normalized))
    }
}

fn normalize_value(param: &AbiParam, raw: &Value) -> Result<Value, AbiError> {
    let bad = |reason: String| AbiError::BadInput(format!("input {:?}: {}", param.name, reason));
    match param.kind {
        AbiType::String => match raw {
            Value::String(s) => Ok(Value::String(s.clone())),
            other => Err(bad(format!("expected string, got {}", json_type_name(other)))),
        },
        AbiType::Bool => match raw {
            Value::Bool(b) => Ok(Value::Bool(*b)),
            other => Err(bad(format!("expected bool, got {}", json_type_name(other)))),
        },
        AbiType::Address => match raw {
            Value::String(s) => {
                let addr: LedgerAddress = s.parse().map_err(bad)?;
                Ok(Value::String(addr.to_hex()))
            }
            other => Err(bad(format!("expected address, got {}", json_type_name(other)))),
        },
        AbiType::Bytes => match raw {
            Value::String(s) => {
                let stripped = s.strip_prefix("0x").unwrap_or(s);
                let bytes = hex::decode(stripped).map_err(|e| bad(e.to_string()))?;
                Ok(Value::String(format!("0x{}", hex::encode(bytes))))
            }
            other => Err(bad(format!("expected hex bytes, got {}", json_type_name(other)))),
        },
        AbiType::Uint256 => {
            // Accept a JSON number, decimal string or 0x-hex; normalize
            // to a decimal string so arithmetic-sized values survive.
            let decimal = match raw {
                Value::Number(n) => {
                    let v = n
                        .as_u64()
                        .ok_or_else(|| bad("expected unsigned integer".to_string()))?;
                    v.to_string()
                }
                Value::String(s) if s.starts_with("0x") => {
                    let bytes = hex::decode(&s[2..]).map_err(|e| bad(e.to_string()))?;
                    if bytes.len() > 32 {
                        return Err(bad("value exceeds uint256".to_string()));
                    }
                    hex_to_decimal(&bytes)
                }
                Value::String(s) => {
                    if s.is_empty() || !s.chars().all(|c| c.is_ascii_digit()) {
                        return Err(bad(format!("invalid decimal {:?}", s)));
                    }
                    s.trim_start_matches('0').to_string().into_nonempty()
                }
                other => return Err(bad(format!("expected uint256, got {}", json_type_name(other)))),
            };
            Ok(Value::String(decimal))
        }
    }
}

/// Big-endian bytes to decimal string, without a bignum dependency.
fn hex_to_decimal(bytes: &[u8]) -> String {
    let mut digits: Vec<u8> = vec![0]; // little-endian decimal digits
    for &byte in bytes {
        // digits = digits * 256 + byte
        let mut carry = byte as u32;
        for d in digits.iter_mut() {
            let v = (*d as u32) * 256 + carry;
            *d = (v % 10) as u8;
            carry = v / 10;
        }
        while carry > 0 {
            digits.push((carry % 10) as u8);
            carry /= 10;
        }
    }
    digits
        .iter()
        .rev()
        .map(|d| char::from(b'0' + d))
        .collect()
}

fn json_type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

trait NonEmpty {
    fn into_nonempty(self) -> String;
}

impl NonEmpty for String {
    /// `"000"` normalizes to `"0"`, not `""`.
    fn into_nonempty(self) -> String {
        if self.is_empty() {
            "0".to_string()
        } else {
            self
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn transfer_abi() -> Vec<AbiFunction> {
        vec![
            AbiFunction::function(
                "transfer",
                vec![
                    AbiParam {
                        name: "to".to_string(),
                        kind: AbiType::String,
                    },
                    AbiParam {
                        name: "amount".to_string(),
                        kind: AbiType::Uint256,
                    },
                ],
            ),
            AbiFunction::function(
                "mint",
                vec![AbiParam {
                    name: "amount".to_string(),
                    kind: AbiType::Uint256,
                }],
            ),
        ]
    }

    fn resolver() -> (Arc<CoreDb>, Arc<AbiResolver>) {
        let db = Arc::new(CoreDb::open_temporary().unwrap());
        let resolver = AbiResolver::new(Arc::clone(&db), CacheConfig::default());
        (db, resolver)
    }

    #[test]
    fn signature_format() {
        let abi = transfer_abi();
        assert_eq!(abi[0].signature(), "transfer(string,uint256)");
        assert_eq!(default_constructor().signature(), "constructor()");
    }

    #[test]
    fn upsert_is_idempotent_by_content() {
        let (db, resolver) = resolver();
        let abi = transfer_abi();
        let h1 = db
            .transaction::<_, AbiError, _>(|txn| resolver.upsert_abi(txn, &abi))
            .unwrap();
        let h2 = db
            .transaction::<_, AbiError, _>(|txn| resolver.upsert_abi(txn, &abi))
            .unwrap();
        assert_eq!(h1, h2);
        assert_eq!(db.count(Table::Abis), 1);

        let loaded = resolver.get_abi(&h1).unwrap();
        assert_eq!(loaded.functions, abi);
    }

    #[test]
    fn resolve_by_name_and_signature() {
        let (db, resolver) = resolver();
        let abi = transfer_abi();
        let to: LedgerAddress = format!("0x{}", "11".repeat(20)).parse().unwrap();

        let by_name = db
            .transaction::<_, AbiError, _>(|txn| {
                resolver.resolve_function(txn, Some(&abi), None, Some("transfer"), Some(&to))
            })
            .unwrap();
        assert_eq!(by_name.function.name, "transfer");

        let by_sig = db
            .transaction::<_, AbiError, _>(|txn| {
                resolver.resolve_function(
                    txn,
                    Some(&abi),
                    None,
                    Some("transfer(string,uint256)"),
                    Some(&to),
                )
            })
            .unwrap();
        assert_eq!(by_sig.function, by_name.function);
    }

    #[test]
    fn empty_selector_with_multiple_functions_is_ambiguous() {
        let (db, resolver) = resolver();
        let abi = transfer_abi();
        let to: LedgerAddress = format!("0x{}", "11".repeat(20)).parse().unwrap();
        let err = db
            .transaction::<ResolvedFunction, AbiError, _>(|txn| {
                resolver.resolve_function(txn, Some(&abi), None, None, Some(&to))
            })
            .unwrap_err();
        assert!(matches!(err, AbiError::MultiMatch(_, _)));
    }

    #[test]
    fn deploy_resolves_constructor() {
        let (db, resolver) = resolver();

        // No ABI at all: default constructor.
        let resolved = db
            .transaction::<_, AbiError, _>(|txn| {
                resolver.resolve_function(txn, None, None, None, None)
            })
            .unwrap();
        assert_eq!(resolved.function.entry_type, AbiEntryType::Constructor);

        // ABI without a constructor entry still deploys.
        let resolved = db
            .transaction::<_, AbiError, _>(|txn| {
                resolver.resolve_function(txn, Some(&transfer_abi()), None, None, None)
            })
            .unwrap();
        assert_eq!(resolved.function, default_constructor());
    }

    #[test]
    fn function_without_to_is_rejected() {
        let (db, resolver) = resolver();
        let err = db
            .transaction::<ResolvedFunction, AbiError, _>(|txn| {
                resolver.resolve_function(txn, Some(&transfer_abi()), None, Some("transfer"), None)
            })
            .unwrap_err();
        assert!(matches!(err, AbiError::FunctionWithoutTo));
    }

    #[test]
    fn normalize_inputs_canonicalises() {
        let function = transfer_abi().remove(0);
        let normalized = AbiResolver::normalize_inputs(
            &function,
            &json!({"to": "bob@node2", "amount": "0xff"}),
        )
        .unwrap();
        assert_eq!(normalized, json!({"to": "bob@node2", "amount": "255"}));

        // Numbers normalize the same way.
        let n2 =
            AbiResolver::normalize_inputs(&function, &json!({"to": "bob@node2", "amount": 255}))
                .unwrap();
        assert_eq!(n2, normalized);
    }

    #[test]
    fn normalize_rejects_missing_and_unknown_fields() {
        let function = transfer_abi().remove(0);
        assert!(matches!(
            AbiResolver::normalize_inputs(&function, &json!({"to": "bob"})),
            Err(AbiError::BadInput(_))
        ));
        assert!(matches!(
            AbiResolver::normalize_inputs(
                &function,
                &json!({"to": "bob", "amount": "1", "extra": 1})
            ),
            Err(AbiError::BadInput(_))
        ));
    }

    #[test]
    fn hex_to_decimal_conversion() {
        assert_eq!(hex_to_decimal(&[0xff]), "255");
        assert_eq!(hex_to_decimal(&[0x01, 0x00]), "256");
        assert_eq!(hex_to_decimal(&[0]), "0");
        // 2^64
        assert_eq!(
            hex_to_decimal(&[1, 0, 0, 0, 0, 0, 0, 0, 0]),
            "18446744073709551616"
        );
    }
}
