// GateCrash Forms - Configuration
// Copyright 2026 Joseph Stone - All Rights Reserved
//
// Global BYOK configuration: SMTP account, storage directories,
// rate-limit and CSRF policy. Stored as JSON in the config home.

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Master configuration loaded from <config home>/config.json
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Default SMTP account; a form's `submit.email.smtp` takes precedence
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smtp: Option<SmtpSettings>,
    pub forms_dir: PathBuf,
    pub responses_dir: PathBuf,
    pub outbox_dir: PathBuf,
    pub rate_limit: RateLimitConfig,
    pub security: SecurityConfig,
}

/// User-supplied SMTP account (nodemailer-style shape)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmtpSettings {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub secure: bool,
    pub auth: SmtpAuth,
    /// Sender override; defaults to `auth.user`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Upper bound on one send, enforced by the transport
    #[serde(default = "default_smtp_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmtpAuth {
    pub user: String,
    #[serde(default)]
    pub pass: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_requests: usize,
    pub window_ms: u64,
    /// Cap on tracked identifiers; least recently active are evicted
    pub max_identifiers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub require_csrf: bool,
    pub csrf_ttl_secs: u64,
    /// Issued token digests, one file each, shared by every process
    pub csrf_dir: PathBuf,
}

fn default_smtp_port() -> u16 {
    465
}

fn default_true() -> bool {
    true
}

fn default_smtp_timeout() -> u64 {
    30
}

impl SmtpSettings {
    /// Envelope sender: explicit `from`, else the account user
    pub fn sender(&self) -> &str {
        self.from.as_deref().unwrap_or(&self.auth.user)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 10,
            window_ms: 60_000,
            max_identifiers: 10_000,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            require_csrf: false,
            csrf_ttl_secs: 3600,
            csrf_dir: PathBuf::from("csrf"),
        }
    }
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            smtp: None,
            forms_dir: PathBuf::from("forms"),
            responses_dir: PathBuf::from("responses"),
            outbox_dir: PathBuf::from("outbox"),
            rate_limit: RateLimitConfig::default(),
            security: SecurityConfig::default(),
        }
    }
}

impl GlobalConfig {
    /// Load config from JSON file, falling back to defaults
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {:?}", path))?;
            let config: Self = serde_json::from_str(&content)
                .with_context(|| format!("Invalid config JSON in {:?}", path))?;
            Ok(config)
        } else {
            log::warn!("Config not found at {:?}, using defaults", path);
            Ok(Self::default())
        }
    }

    /// Save config to JSON file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Set a dotted key (e.g. `smtp.auth.user`) in the config file.
    ///
    /// Works on the raw JSON document so partially-filled sections (an SMTP
    /// host without credentials yet) can be written one key at a time.
    /// Returns the resulting config if the document still parses.
    pub fn set_key(path: &Path, key: &str, value: &str) -> anyhow::Result<Option<Self>> {
        let mut doc: Value = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {:?}", path))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Invalid config JSON in {:?}", path))?
        } else {
            Value::Object(serde_json::Map::new())
        };

        set_dotted(&mut doc, key, coerce_scalar(value))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(&doc)?)?;

        Ok(serde_json::from_value(doc).ok())
    }
}

/// "true"/"false"/integers become JSON booleans/numbers, everything else a string
fn coerce_scalar(value: &str) -> Value {
    match value {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => match value.parse::<i64>() {
            Ok(n) => Value::from(n),
            Err(_) => Value::String(value.to_string()),
        },
    }
}

fn set_dotted(doc: &mut Value, key: &str, value: Value) -> anyhow::Result<()> {
    let parts: Vec<&str> = key.split('.').collect();
    if parts.iter().any(|p| p.is_empty()) {
        return Err(anyhow!("Invalid config key: {:?}", key));
    }

    let mut current = doc;
    for part in &parts[..parts.len() - 1] {
        if !current.get(*part).map(Value::is_object).unwrap_or(false) {
            let obj = current
                .as_object_mut()
                .ok_or_else(|| anyhow!("Config key {:?} crosses a non-object value", key))?;
            obj.insert(part.to_string(), Value::Object(serde_json::Map::new()));
        }
        current = current
            .get_mut(*part)
            .ok_or_else(|| anyhow!("Config key {:?} could not be created", key))?;
    }

    let obj = current
        .as_object_mut()
        .ok_or_else(|| anyhow!("Config key {:?} crosses a non-object value", key))?;
    obj.insert(parts[parts.len() - 1].to_string(), value);
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_documented_limits() {
        let config = GlobalConfig::default();
        assert_eq!(config.rate_limit.max_requests, 10);
        assert_eq!(config.rate_limit.window_ms, 60_000);
        assert!(config.smtp.is_none());
        assert!(!config.security.require_csrf);
        assert_eq!(config.security.csrf_dir, PathBuf::from("csrf"));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let config = GlobalConfig::load(&dir.path().join("nope.json"))?;
        assert_eq!(config.forms_dir, PathBuf::from("forms"));
        Ok(())
    }

    #[test]
    fn set_key_builds_nested_smtp() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("config.json");

        // Host alone does not yet form a complete SMTP section
        GlobalConfig::set_key(&path, "smtp.host", "smtp.zoho.in")?;
        GlobalConfig::set_key(&path, "smtp.port", "587")?;
        GlobalConfig::set_key(&path, "smtp.secure", "false")?;
        let config = GlobalConfig::set_key(&path, "smtp.auth.user", "me@example.com")?
            .expect("complete config");

        let smtp = config.smtp.expect("smtp section");
        assert_eq!(smtp.host, "smtp.zoho.in");
        assert_eq!(smtp.port, 587);
        assert!(!smtp.secure);
        assert_eq!(smtp.sender(), "me@example.com");
        assert_eq!(smtp.timeout_secs, 30);

        let reloaded = GlobalConfig::load(&path)?;
        assert_eq!(reloaded.smtp.map(|s| s.auth.user), Some("me@example.com".to_string()));
        Ok(())
    }

    #[test]
    fn set_key_rejects_empty_segments() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        assert!(GlobalConfig::set_key(&path, "smtp..host", "x").is_err());
    }

    #[test]
    fn save_and_load_round_trip() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("nested/config.json");
        let mut config = GlobalConfig::default();
        config.rate_limit.max_requests = 3;
        config.save(&path)?;
        assert_eq!(GlobalConfig::load(&path)?.rate_limit.max_requests, 3);
        Ok(())
    }
}
