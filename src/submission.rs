// GateCrash Forms - Submission Model
// Copyright 2026 Joseph Stone - All Rights Reserved
//
// RawSubmission: transient field name -> value(s) map parsed from a request body.
// StoredResponse: what gets persisted once a submission is accepted.
// Internal keys (_gotcha, _csrf) never leave RawSubmission.

use chrono::{DateTime, SecondsFormat, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

/// Honeypot field real users never fill
pub const HONEYPOT_KEY: &str = "_gotcha";
/// CSRF token field
pub const CSRF_KEY: &str = "_csrf";

const INTERNAL_KEYS: &[&str] = &[HONEYPOT_KEY, CSRF_KEY];

/// One submitted value: single string or multi-select list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Single(String),
    Multi(Vec<String>),
}

impl FieldValue {
    /// Empty string or empty list
    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::Single(s) => s.is_empty(),
            FieldValue::Multi(v) => v.is_empty(),
        }
    }

    /// Every individual value, in order
    pub fn values(&self) -> Vec<&str> {
        match self {
            FieldValue::Single(s) => vec![s.as_str()],
            FieldValue::Multi(v) => v.iter().map(String::as_str).collect(),
        }
    }

    /// Flatten to one string, joining multi values with `sep`
    pub fn join(&self, sep: &str) -> String {
        match self {
            FieldValue::Single(s) => s.clone(),
            FieldValue::Multi(v) => v.join(sep),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Single(s.to_string())
    }
}

impl From<Vec<&str>> for FieldValue {
    fn from(v: Vec<&str>) -> Self {
        FieldValue::Multi(v.into_iter().map(String::from).collect())
    }
}

/// Body could not be read as a flat field map
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed submission body: {0}")]
pub struct BodyError(pub String);

/// Field values as submitted, in submission order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawSubmission(IndexMap<String, FieldValue>);

impl RawSubmission {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a request body: a JSON object, or `application/x-www-form-urlencoded`.
    ///
    /// JSON scalars (numbers, booleans) are kept as their text, null as empty.
    /// Urlencoded keys ending in `[]` (checkbox groups) collect into a list.
    pub fn parse(body: &str) -> Result<Self, BodyError> {
        let trimmed = body.trim();
        if trimmed.starts_with('{') {
            Self::from_json(trimmed)
        } else {
            Ok(Self::from_urlencoded(trimmed))
        }
    }

    fn from_json(body: &str) -> Result<Self, BodyError> {
        let doc: IndexMap<String, Value> =
            serde_json::from_str(body).map_err(|e| BodyError(e.to_string()))?;

        let mut fields = IndexMap::new();
        for (key, value) in doc {
            let value = match value {
                Value::Array(items) => FieldValue::Multi(
                    items
                        .into_iter()
                        .map(|item| scalar_text(&key, item))
                        .collect::<Result<_, _>>()?,
                ),
                other => FieldValue::Single(scalar_text(&key, other)?),
            };
            fields.insert(key, value);
        }
        Ok(Self(fields))
    }

    fn from_urlencoded(body: &str) -> Self {
        let mut fields: IndexMap<String, FieldValue> = IndexMap::new();
        for (key, value) in url::form_urlencoded::parse(body.as_bytes()) {
            let value = value.into_owned();
            match key.strip_suffix("[]") {
                Some(base) => {
                    let entry = fields
                        .entry(base.to_string())
                        .or_insert_with(|| FieldValue::Multi(Vec::new()));
                    if let FieldValue::Single(first) = entry {
                        let first = std::mem::take(first);
                        *entry = FieldValue::Multi(vec![first]);
                    }
                    if let FieldValue::Multi(items) = entry {
                        items.push(value);
                    }
                }
                None => {
                    fields.insert(key.into_owned(), FieldValue::Single(value));
                }
            }
        }
        Self(fields)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<FieldValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Honeypot value, if any was submitted
    pub fn honeypot(&self) -> Option<&FieldValue> {
        self.0.get(HONEYPOT_KEY)
    }

    /// CSRF token as a single string
    pub fn csrf_token(&self) -> Option<String> {
        self.0.get(CSRF_KEY).map(|v| v.join(""))
    }

    /// Data with internal keys removed, order preserved
    pub fn into_data(self) -> IndexMap<String, FieldValue> {
        self.0
            .into_iter()
            .filter(|(k, _)| !INTERNAL_KEYS.contains(&k.as_str()))
            .collect()
    }
}

impl<K: Into<String>, V: Into<FieldValue>> FromIterator<(K, V)> for RawSubmission {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

fn scalar_text(key: &str, value: Value) -> Result<String, BodyError> {
    match value {
        Value::String(s) => Ok(s),
        Value::Null => Ok(String::new()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Array(_) | Value::Object(_) => {
            Err(BodyError(format!("field {} has a nested value", key)))
        }
    }
}

/// Request context recorded with every response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

/// An accepted submission as persisted. Appended, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredResponse {
    #[serde(serialize_with = "iso_millis")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub form_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub form_title: Option<String>,
    pub data: IndexMap<String, FieldValue>,
    #[serde(default)]
    pub metadata: ResponseMetadata,
}

impl StoredResponse {
    pub fn new(
        form_id: &str,
        form_title: Option<&str>,
        submission: RawSubmission,
        metadata: ResponseMetadata,
        accepted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            timestamp: accepted_at,
            form_id: form_id.to_string(),
            form_title: form_title.map(String::from),
            data: submission.into_data(),
            metadata,
        }
    }

    /// ISO-8601 timestamp as written to storage
    pub fn timestamp_string(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

fn iso_millis<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true))
}

// ============================================================================
// TESTS
// ============================================================================
