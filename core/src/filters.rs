//! Typed label values and the state query model.
//!
//! Schemas mark fields for indexing with a declared kind; this module owns
//! the coercion of raw JSON field values into those kinds, the JSON query
//! shape used by `FindAvailableStates`, and the in-memory evaluation and
//! sorting that lets a domain context merge overlay states into a durable
//! result page under one ordering.
//!
//! Coercion is deliberately forgiving on input (a bool label accepts
//! `true` and `"true"`, an int64 accepts `42` and `"42"`) and strict on
//! comparison: values only ever compare within their declared kind.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("unknown query field {0:?}")]
    UnknownField(String),

    #[error("field {field:?} expects {expected} value, got {got}")]
    TypeMismatch {
        field: String,
        expected: &'static str,
        got: String,
    },

    #[error("bad value for field {field:?}: {reason}")]
    BadValue { field: String, reason: String },
}

// ---------------------------------------------------------------------------
// Label kinds and values
// ---------------------------------------------------------------------------

/// Declared kind of an indexed schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelKind {
    String,
    Int64,
    Bool,
    HexBytes,
    Timestamp,
    Uint256,
}

impl LabelKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Int64 => "int64",
            Self::Bool => "bool",
            Self::HexBytes => "hex-bytes",
            Self::Timestamp => "timestamp",
            Self::Uint256 => "uint256",
        }
    }
}

/// A materialised label value, coerced to its declared kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LabelValue {
    Str(String),
    Int64(i64),
    Bool(bool),
    /// Raw bytes; compares lexicographically.
    Hex(Vec<u8>),
    /// Milliseconds since the UNIX epoch.
    Timestamp(i64),
    /// Big-endian 32-byte unsigned integer; compares bytewise.
    Uint256([u8; 32]),
}

impl LabelValue {
    pub fn kind(&self) -> LabelKind {
        match self {
            Self::Str(_) => LabelKind::String,
            Self::Int64(_) => LabelKind::Int64,
            Self::Bool(_) => LabelKind::Bool,
            Self::Hex(_) => LabelKind::HexBytes,
            Self::Timestamp(_) => LabelKind::Timestamp,
            Self::Uint256(_) => LabelKind::Uint256,
        }
    }

    /// Compare against another value of the same kind.
    /// Returns `None` when the kinds differ.
    pub fn cmp_same_kind(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Str(a), Self::Str(b)) => Some(a.cmp(b)),
            (Self::Int64(a), Self::Int64(b)) => Some(a.cmp(b)),
            (Self::Bool(a), Self::Bool(b)) => Some(a.cmp(b)),
            (Self::Hex(a), Self::Hex(b)) => Some(a.cmp(b)),
            (Self::Timestamp(a), Self::Timestamp(b)) => Some(a.cmp(b)),
            (Self::Uint256(a), Self::Uint256(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Coerce a raw JSON field value into a label of the given kind.
    pub fn coerce(kind: LabelKind, field: &str, raw: &Value) -> Result<Self, FilterError> {
        let mismatch = |expected: &'static str| FilterError::TypeMismatch {
            field: field.to_string(),
            expected,
            got: short_json(raw),
        };
        match kind {
            LabelKind::String => match raw {
                Value::String(s) => Ok(Self::Str(s.clone())),
                Value::Number(n) => Ok(Self::Str(n.to_string())),
                _ => Err(mismatch("string")),
            },
            LabelKind::Int64 => match raw {
                Value::Number(n) => n.as_i64().map(Self::Int64).ok_or_else(|| mismatch("int64")),
                Value::String(s) => s
                    .parse::<i64>()
                    .map(Self::Int64)
                    .map_err(|_| mismatch("int64")),
                _ => Err(mismatch("int64")),
            },
            LabelKind::Bool => match raw {
                Value::Bool(b) => Ok(Self::Bool(*b)),
                Value::String(s) => Ok(Self::Bool(s.eq_ignore_ascii_case("true"))),
                _ => Err(mismatch("bool")),
            },
            LabelKind::HexBytes => match raw {
                Value::String(s) => {
                    let stripped = s.strip_prefix("0x").unwrap_or(s);
                    hex::decode(stripped)
                        .map(Self::Hex)
                        .map_err(|e| FilterError::BadValue {
                            field: field.to_string(),
                            reason: e.to_string(),
                        })
                }
                _ => Err(mismatch("hex-bytes")),
            },
            LabelKind::Timestamp => match raw {
                Value::Number(n) => n
                    .as_i64()
                    .map(Self::Timestamp)
                    .ok_or_else(|| mismatch("timestamp")),
                Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
                    .map(|dt| Self::Timestamp(dt.timestamp_millis()))
                    .map_err(|e| FilterError::BadValue {
                        field: field.to_string(),
                        reason: e.to_string(),
                    }),
                _ => Err(mismatch("timestamp")),
            },
            LabelKind::Uint256 => match raw {
                Value::Number(n) => {
                    let v = n.as_u64().ok_or_else(|| mismatch("uint256"))?;
                    let mut out = [0u8; 32];
                    out[24..].copy_from_slice(&v.to_be_bytes());
                    Ok(Self::Uint256(out))
                }
                Value::String(s) => parse_uint256(field, s).map(Self::Uint256),
                _ => Err(mismatch("uint256")),
            },
        }
    }
}

impl fmt::Display for LabelValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => write!(f, "{}", s),
            Self::Int64(v) => write!(f, "{}", v),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Hex(b) => write!(f, "0x{}", hex::encode(b)),
            Self::Timestamp(t) => write!(f, "{}", t),
            Self::Uint256(b) => write!(f, "0x{}", hex::encode(b)),
        }
    }
}

/// Parse a uint256 from `0x`-hex or a decimal string.
fn parse_uint256(field: &str, s: &str) -> Result<[u8; 32], FilterError> {
    let bad = |reason: String| FilterError::BadValue {
        field: field.to_string(),
        reason,
    };
    if let Some(hex_str) = s.strip_prefix("0x") {
        let bytes = hex::decode(hex_str).map_err(|e| bad(e.to_string()))?;
        if bytes.len() > 32 {
            return Err(bad(format!("{} bytes exceeds uint256", bytes.len())));
        }
        let mut out = [0u8; 32];
        out[32 - bytes.len()..].copy_from_slice(&bytes);
        return Ok(out);
    }
    // Decimal: accumulate digit by digit into a 32-byte big-endian value.
    let mut out = [0u8; 32];
    for c in s.chars() {
        let d = c
            .to_digit(10)
            .ok_or_else(|| bad(format!("invalid decimal digit {:?}", c)))? as u16;
        let mut carry = d;
        for byte in out.iter_mut().rev() {
            let v = (*byte as u16) * 10 + carry;
            *byte = (v & 0xff) as u8;
            carry = v >> 8;
        }
        if carry != 0 {
            return Err(bad("value exceeds uint256".to_string()));
        }
    }
    if s.is_empty() {
        return Err(bad("empty decimal string".to_string()));
    }
    Ok(out)
}

fn short_json(v: &Value) -> String {
    let s = v.to_string();
    if s.chars().count() > 40 {
        let prefix: String = s.chars().take(40).collect();
        format!("{}...", prefix)
    } else {
        s
    }
}

// ---------------------------------------------------------------------------
// Query shape
// ---------------------------------------------------------------------------

/// One `field op value` condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldValue {
    pub field: String,
    pub value: Value,
}

/// One `field in values` condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldValues {
    pub field: String,
    pub values: Vec<Value>,
}

/// JSON query against a schema's labelled fields.
///
/// All condition groups are ANDed. `sort` entries are field names with an
/// optional `-` prefix for descending order; every query that feeds a
/// merged overlay/durable result must carry at least one sort field so
/// the combined ordering is deterministic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Query {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub eq: Vec<FieldValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub neq: Vec<FieldValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lt: Vec<FieldValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lte: Vec<FieldValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gt: Vec<FieldValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gte: Vec<FieldValue>,
    #[serde(default, rename = "in", skip_serializing_if = "Vec::is_empty")]
    pub any_of: Vec<FieldValues>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sort: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Query {
    pub fn build() -> QueryBuilder {
        QueryBuilder {
            query: Query::default(),
        }
    }

    /// Evaluate this query against one state's materialised labels.
    ///
    /// `kind_of` resolves a field name to its declared kind (from the
    /// schema); unknown fields are an error, missing label values fail
    /// every condition except `neq`.
    pub fn matches(
        &self,
        kind_of: &impl Fn(&str) -> Option<LabelKind>,
        labels: &BTreeMap<String, LabelValue>,
    ) -> Result<bool, FilterError> {
        let compare = |fv: &FieldValue| -> Result<Option<Ordering>, FilterError> {
            let kind = kind_of(&fv.field)
                .ok_or_else(|| FilterError::UnknownField(fv.field.clone()))?;
            let target = LabelValue::coerce(kind, &fv.field, &fv.value)?;
            Ok(labels
                .get(&fv.field)
                .and_then(|actual| actual.cmp_same_kind(&target)))
        };

        for fv in &self.eq {
            if compare(fv)? != Some(Ordering::Equal) {
                return Ok(false);
            }
        }
        for fv in &self.neq {
            if compare(fv)? == Some(Ordering::Equal) {
                return Ok(false);
            }
        }
        for fv in &self.lt {
            if compare(fv)? != Some(Ordering::Less) {
                return Ok(false);
            }
        }
        for fv in &self.lte {
            match compare(fv)? {
                Some(Ordering::Less) | Some(Ordering::Equal) => {}
                _ => return Ok(false),
            }
        }
        for fv in &self.gt {
            if compare(fv)? != Some(Ordering::Greater) {
                return Ok(false);
            }
        }
        for fv in &self.gte {
            match compare(fv)? {
                Some(Ordering::Greater) | Some(Ordering::Equal) => {}
                _ => return Ok(false),
            }
        }
        for fvs in &self.any_of {
            let kind = kind_of(&fvs.field)
                .ok_or_else(|| FilterError::UnknownField(fvs.field.clone()))?;
            let actual = labels.get(&fvs.field);
            let mut hit = false;
            for v in &fvs.values {
                let target = LabelValue::coerce(kind, &fvs.field, v)?;
                if actual.and_then(|a| a.cmp_same_kind(&target)) == Some(Ordering::Equal) {
                    hit = true;
                    break;
                }
            }
            if !hit {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Parsed sort instructions.
    pub fn sort_fields(&self) -> Vec<SortField> {
        self.sort
            .iter()
            .map(|s| match s.strip_prefix('-') {
                Some(f) => SortField {
                    field: f.to_string(),
                    descending: true,
                },
                None => SortField {
                    field: s.clone(),
                    descending: false,
                },
            })
            .collect()
    }
}

/// Fluent construction of a [`Query`].
#[derive(Debug)]
pub struct QueryBuilder {
    query: Query,
}

impl QueryBuilder {
    pub fn eq(mut self, field: &str, value: Value) -> Self {
        self.query.eq.push(FieldValue {
            field: field.to_string(),
            value,
        });
        self
    }

    pub fn neq(mut self, field: &str, value: Value) -> Self {
        self.query.neq.push(FieldValue {
            field: field.to_string(),
            value,
        });
        self
    }

    pub fn lt(mut self, field: &str, value: Value) -> Self {
        self.query.lt.push(FieldValue {
            field: field.to_string(),
            value,
        });
        self
    }

    pub fn gt(mut self, field: &str, value: Value) -> Self {
        self.query.gt.push(FieldValue {
            field: field.to_string(),
            value,
        });
        self
    }

    pub fn any_of(mut self, field: &str, values: Vec<Value>) -> Self {
        self.query.any_of.push(FieldValues {
            field: field.to_string(),
            values,
        });
        self
    }

    /// Sort ascending; prefix the field with `-` for descending.
    pub fn sort(mut self, field: &str) -> Self {
        self.query.sort.push(field.to_string());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.query.limit = Some(limit);
        self
    }

    pub fn query(self) -> Query {
        self.query
    }
}

// ---------------------------------------------------------------------------
// Sorting
// ---------------------------------------------------------------------------

/// One parsed sort instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortField {
    pub field: String,
    pub descending: bool,
}

/// Sort `items` in place under the given sort instructions.
///
/// `label_of` extracts the label value for a field from an item; items
/// missing a sort field order after items that have it. Ties fall through
/// to the next instruction; fully tied items keep their relative order
/// (stable sort), which the callers rely on for durable-before-overlay
/// determinism.
pub fn sort_by_fields<T>(
    items: &mut [T],
    sort: &[SortField],
    label_of: impl Fn(&T, &str) -> Option<LabelValue>,
) {
    items.sort_by(|a, b| {
        for sf in sort {
            let va = label_of(a, &sf.field);
            let vb = label_of(b, &sf.field);
            let ord = match (va, vb) {
                (Some(x), Some(y)) => x.cmp_same_kind(&y).unwrap_or(Ordering::Equal),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            let ord = if sf.descending { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
