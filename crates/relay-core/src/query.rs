//! Collection query model and primary keys.
//!
//! Queries travel over the wire inside `ITEMS`, `GET` and `SUBSCRIBE` frames
//! and are stored verbatim on subscriptions. Fields the gateway does not
//! interpret (`deep`, `aggregate`, ...) are kept in [`Query::extra`] and handed
//! to the Collection Service untouched.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Primary key of a record. Collections key by integer or string ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrimaryKey {
    Int(i64),
    Str(String),
}

impl PrimaryKey {
    /// Key as a JSON value (number or string).
    pub fn to_json(&self) -> JsonValue {
        match self {
            PrimaryKey::Int(i) => JsonValue::from(*i),
            PrimaryKey::Str(s) => JsonValue::from(s.as_str()),
        }
    }

    /// Parse a key out of a JSON scalar.
    pub fn from_json(value: &JsonValue) -> Option<Self> {
        match value {
            JsonValue::Number(n) => n.as_i64().map(PrimaryKey::Int),
            JsonValue::String(s) => Some(PrimaryKey::Str(s.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimaryKey::Int(i) => write!(f, "{}", i),
            PrimaryKey::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for PrimaryKey {
    fn from(v: i64) -> Self {
        PrimaryKey::Int(v)
    }
}

impl From<&str> for PrimaryKey {
    fn from(v: &str) -> Self {
        PrimaryKey::Str(v.to_string())
    }
}

impl From<String> for PrimaryKey {
    fn from(v: String) -> Self {
        PrimaryKey::Str(v)
    }
}

/// Filter, field selection and paging for a collection read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Field selection. Accepts `["a","b"]` or `"a,b"` on the wire.
    #[serde(
        default,
        deserialize_with = "string_or_list",
        skip_serializing_if = "Option::is_none"
    )]
    pub fields: Option<Vec<String>>,
    /// Filter tree, e.g. `{"status":{"_eq":"published"}}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<JsonValue>,
    #[serde(
        default,
        deserialize_with = "string_or_list",
        skip_serializing_if = "Option::is_none"
    )]
    pub sort: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    /// Everything else, passed through to the Collection Service.
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl Query {
    /// Copy of this query with a hard limit.
    pub fn with_limit(&self, limit: i64) -> Self {
        let mut query = self.clone();
        query.limit = Some(limit);
        query
    }

    /// Query with only a filter set.
    pub fn filtered(filter: JsonValue) -> Self {
        Self {
            filter: Some(filter),
            ..Default::default()
        }
    }
}

fn string_or_list<'de, D>(deserializer: D) -> std::result::Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrList {
        One(String),
        Many(Vec<String>),
    }

    Ok(
        Option::<StringOrList>::deserialize(deserializer)?.map(|v| match v {
            StringOrList::One(s) => s
                .split(',')
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(String::from)
                .collect(),
            StringOrList::Many(list) => list,
        }),
    )
}
