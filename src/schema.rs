// GateCrash Forms - Form Schema
// Copyright 2026 Joseph Stone - All Rights Reserved
//
// Declarative JSON description of a form: fields + submit handling.
// Checked once at load time (unique names, choice options, storage format),
// then cached and shared read-only for the process lifetime.

use crate::config::SmtpSettings;
use crate::store::{sanitize_filename, StorageFormat};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Schema load/check failures. All of these are configuration errors,
/// caught before any submission is processed.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to read schema {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid schema JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("form not found: {0}")]
    NotFound(String),

    #[error("duplicate field name: {0}")]
    DuplicateField(String),

    #[error("field {0} requires a non-empty options list")]
    MissingOptions(String),

    #[error("unsupported storage format for {0}. Use .json or .csv")]
    UnsupportedStorageFormat(String),
}

// ============================================================================
// FIELD TYPES
// ============================================================================

/// Closed set of field types. Unknown type strings are kept as `Other` and
/// treated as free text everywhere.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FieldType {
    #[default]
    Text,
    Email,
    Phone,
    Url,
    Textarea,
    Select,
    Radio,
    Checkbox,
    Scale,
    Date,
    Number,
    Other(String),
}

impl FieldType {
    pub fn as_str(&self) -> &str {
        match self {
            FieldType::Text => "text",
            FieldType::Email => "email",
            FieldType::Phone => "phone",
            FieldType::Url => "url",
            FieldType::Textarea => "textarea",
            FieldType::Select => "select",
            FieldType::Radio => "radio",
            FieldType::Checkbox => "checkbox",
            FieldType::Scale => "scale",
            FieldType::Date => "date",
            FieldType::Number => "number",
            FieldType::Other(name) => name,
        }
    }

    /// Choice fields must declare their options
    pub fn is_choice(&self) -> bool {
        matches!(self, FieldType::Select | FieldType::Radio | FieldType::Checkbox)
    }
}

impl From<String> for FieldType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "text" => FieldType::Text,
            "email" => FieldType::Email,
            "phone" => FieldType::Phone,
            "url" => FieldType::Url,
            "textarea" => FieldType::Textarea,
            "select" | "dropdown" => FieldType::Select,
            "radio" => FieldType::Radio,
            "checkbox" => FieldType::Checkbox,
            "scale" | "rating" => FieldType::Scale,
            "date" => FieldType::Date,
            "number" => FieldType::Number,
            _ => FieldType::Other(s),
        }
    }
}

impl From<FieldType> for String {
    fn from(t: FieldType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// SCHEMA TYPES
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSpec {
    /// Filled with `field_<index>` at check time when absent
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub field_type: FieldType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
}

impl FieldSpec {
    /// Label shown to humans in errors and notifications
    pub fn display_name(&self) -> &str {
        match self.label.as_deref() {
            Some(label) if !label.is_empty() => label,
            _ => &self.name,
        }
    }
}

/// Notification target: a bare address or `{to, smtp?}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EmailTarget {
    Address(String),
    Detailed {
        to: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        smtp: Option<SmtpSettings>,
    },
}

impl EmailTarget {
    pub fn to(&self) -> &str {
        match self {
            EmailTarget::Address(to) => to,
            EmailTarget::Detailed { to, .. } => to,
        }
    }

    /// Per-form SMTP override, if any
    pub fn smtp(&self) -> Option<&SmtpSettings> {
        match self {
            EmailTarget::Address(_) => None,
            EmailTarget::Detailed { smtp, .. } => smtp.as_ref(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<EmailTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormSchema {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
    #[serde(default)]
    pub submit: SubmitConfig,
}

impl FormSchema {
    /// Parse and check a schema document
    pub fn from_json(json: &str) -> Result<Self, SchemaError> {
        let mut schema: FormSchema = serde_json::from_str(json)?;
        schema.check()?;
        Ok(schema)
    }

    /// Read, parse and check a schema file
    pub fn load(path: &Path) -> Result<Self, SchemaError> {
        let content = std::fs::read_to_string(path).map_err(|source| SchemaError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content)
    }

    /// Normalize unnamed fields and enforce load-time invariants
    pub fn check(&mut self) -> Result<(), SchemaError> {
        let mut seen = HashSet::new();
        for (idx, field) in self.fields.iter_mut().enumerate() {
            if field.name.is_empty() {
                field.name = format!("field_{}", idx);
            }
            if !seen.insert(field.name.clone()) {
                return Err(SchemaError::DuplicateField(field.name.clone()));
            }
            if field.field_type.is_choice() && field.options.is_empty() {
                return Err(SchemaError::MissingOptions(field.name.clone()));
            }
        }

        if let Some(storage) = &self.submit.storage {
            StorageFormat::from_path(storage)
                .ok_or_else(|| SchemaError::UnsupportedStorageFormat(storage.clone()))?;
        }

        Ok(())
    }

    /// Identifier recorded on stored responses: explicit id, else title
    pub fn form_id(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.title)
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Storage format declared by `submit.storage`
    pub fn storage_format(&self) -> Option<StorageFormat> {
        self.submit.storage.as_deref().and_then(StorageFormat::from_path)
    }

    /// Sanitized store key derived from the storage path's file stem.
    /// Directory components are discarded; the store owns placement.
    pub fn storage_key(&self) -> Option<String> {
        let storage = self.submit.storage.as_deref()?;
        let stem = Path::new(storage).file_stem()?.to_string_lossy();
        let key = sanitize_filename(&stem);
        if key.is_empty() {
            None
        } else {
            Some(key)
        }
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

/// Loads schemas from `<forms_dir>/<form_id>.json` and caches them
pub struct FormRegistry {
    dir: PathBuf,
    cache: RwLock<HashMap<String, Arc<FormSchema>>>,
}

impl FormRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load (or return cached) schema for a form id.
    ///
    /// Only canonical ids (already filename-safe) resolve; any other
    /// spelling is `NotFound`, so the cache holds one entry per form file.
    pub fn load(&self, form_id: &str) -> Result<Arc<FormSchema>, SchemaError> {
        if form_id.is_empty() || sanitize_filename(form_id) != form_id {
            return Err(SchemaError::NotFound(form_id.to_string()));
        }
        if let Some(schema) = self.cache.read().get(form_id) {
            return Ok(Arc::clone(schema));
        }

        let path = self.dir.join(format!("{}.json", form_id));
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SchemaError::NotFound(form_id.to_string()));
            }
            Err(source) => return Err(SchemaError::Io { path, source }),
        };

        let mut schema: FormSchema = serde_json::from_str(&content)?;
        schema.id = Some(form_id.to_string());
        schema.check()?;

        let schema = Arc::new(schema);
        log::info!("Loaded form '{}' from {:?} ({} fields)", form_id, path, schema.fields.len());
        self.cache
            .write()
            .entry(form_id.to_string())
            .or_insert_with(|| Arc::clone(&schema));
        Ok(schema)
    }

    /// Form ids available in the forms directory, sorted
    pub fn list(&self) -> Result<Vec<String>, SchemaError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|source| SchemaError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let mut forms: Vec<String> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|ext| ext == "json").unwrap_or(false))
            .filter_map(|p| p.file_stem().map(|s| s.to_string_lossy().to_string()))
            .collect();
        forms.sort();
        Ok(forms)
    }
}

// ============================================================================
// TESTS
// ============================================================================
