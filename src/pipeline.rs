// GateCrash Forms - Submission Pipeline (Primary Entry Point)
// Copyright 2026 Joseph Stone - All Rights Reserved
//
// Every submission passes through here, in a fixed order:
//   Received -> Honeypot -> CSRF -> RateCheck -> Validate -> Persist -> Notify -> Accepted
// Early exits at Honeypot/CSRF/RateCheck/Validate leave storage untouched.
// Persist happens before Notify; a failed notification never retracts a
// stored response, it only adds a warning.

use crate::config::GlobalConfig;
use crate::error::SubmitError;
use crate::guard::{AntiAbuseGuard, Rejection};
use crate::notify::{Mailer, NotifyOutcome, Notifier};
use crate::paths;
use crate::schema::{FormRegistry, FormSchema};
use crate::store::{ResponseStore, StoreError, StoreOutcome};
use crate::submission::{RawSubmission, ResponseMetadata, StoredResponse};
use crate::validate;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

const UNKNOWN_IDENTIFIER: &str = "unknown";

/// Request context supplied by the caller (HTTP handler, CLI)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmissionMeta {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

/// Caller-facing result of one submission
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitOutcome {
    pub accepted: bool,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Everything that happened to an accepted submission
#[derive(Debug, Clone)]
pub struct Accepted {
    pub response: StoredResponse,
    pub stored: Option<StoreOutcome>,
    pub notification: Option<NotifyOutcome>,
    pub warnings: Vec<String>,
}

impl From<Result<Accepted, SubmitError>> for SubmitOutcome {
    fn from(result: Result<Accepted, SubmitError>) -> Self {
        match result {
            Ok(accepted) => SubmitOutcome {
                accepted: true,
                status: 200,
                kind: None,
                response_id: Some(accepted.response.timestamp_string()),
                errors: Vec::new(),
                warnings: accepted.warnings,
            },
            Err(err) => SubmitOutcome {
                accepted: false,
                status: err.status_code(),
                kind: Some(err.kind().to_string()),
                response_id: None,
                errors: err.messages(),
                warnings: Vec::new(),
            },
        }
    }
}

pub struct Pipeline {
    registry: FormRegistry,
    guard: AntiAbuseGuard,
    store: ResponseStore,
    notifier: Notifier,
}

impl Pipeline {
    pub fn new(
        registry: FormRegistry,
        guard: AntiAbuseGuard,
        store: ResponseStore,
        notifier: Notifier,
    ) -> Self {
        Self { registry, guard, store, notifier }
    }

    /// Wire every stage from the global config. Relative directories resolve
    /// against `base_dir`.
    pub fn from_config(config: &GlobalConfig, base_dir: &Path, mailer: Arc<dyn Mailer>) -> Self {
        Self::new(
            FormRegistry::new(paths::resolve(base_dir, &config.forms_dir)),
            AntiAbuseGuard::from_config(&config.rate_limit, &config.security, base_dir),
            ResponseStore::new(paths::resolve(base_dir, &config.responses_dir)),
            Notifier::new(mailer, config.smtp.clone()),
        )
    }

    pub fn registry(&self) -> &FormRegistry {
        &self.registry
    }

    pub fn guard(&self) -> &AntiAbuseGuard {
        &self.guard
    }

    pub fn store(&self) -> &ResponseStore {
        &self.store
    }

    /// Submit a raw request body to a form. Never fails: every exit is an
    /// outcome carrying its status class.
    pub fn submit(&self, form_id: &str, raw_body: &str, meta: &SubmissionMeta) -> SubmitOutcome {
        self.try_submit(form_id, raw_body, meta, Utc::now()).into()
    }

    pub fn try_submit(
        &self,
        form_id: &str,
        raw_body: &str,
        meta: &SubmissionMeta,
        now: DateTime<Utc>,
    ) -> Result<Accepted, SubmitError> {
        let schema = self.registry.load(form_id)?;
        let submission = RawSubmission::parse(raw_body)?;
        self.process(&schema, submission, meta, now)
    }

    /// Run one parsed submission through every stage
    pub fn process(
        &self,
        schema: &FormSchema,
        submission: RawSubmission,
        meta: &SubmissionMeta,
        now: DateTime<Utc>,
    ) -> Result<Accepted, SubmitError> {
        let identifier = meta.ip.as_deref().filter(|ip| !ip.is_empty()).unwrap_or(UNKNOWN_IDENTIFIER);

        let result = self.run_stages(schema, submission, meta, identifier, now);
        if let Err(err) = &result {
            if err.is_client_error() {
                log::info!("Rejected submission to '{}' from {}: {}", schema.form_id(), identifier, err.kind());
            } else {
                log::error!("Submission to '{}' failed: {}", schema.form_id(), err);
            }
        }
        result
    }

    fn run_stages(
        &self,
        schema: &FormSchema,
        submission: RawSubmission,
        meta: &SubmissionMeta,
        identifier: &str,
        now: DateTime<Utc>,
    ) -> Result<Accepted, SubmitError> {
        // Stage 1-3: honeypot, CSRF, rate limit
        self.guard
            .check(&submission, identifier, now)
            .map_err(|rejection| match rejection {
                Rejection::Spam => SubmitError::SpamRejected,
                Rejection::Csrf => SubmitError::CsrfRejected,
                Rejection::RateLimited => SubmitError::RateLimited,
            })?;

        // Stage 4: validate
        let errors = validate::validate(&submission, schema);
        if !errors.is_empty() {
            return Err(SubmitError::ValidationFailed(errors));
        }

        let response = StoredResponse::new(
            schema.form_id(),
            (!schema.title.is_empty()).then_some(schema.title.as_str()),
            submission,
            ResponseMetadata {
                ip: meta.ip.clone(),
                user_agent: meta.user_agent.clone(),
            },
            now,
        );
        let mut warnings = Vec::new();

        // Stage 5: persist
        let stored = match &schema.submit.storage {
            Some(storage) => {
                let format = schema
                    .storage_format()
                    .ok_or_else(|| SubmitError::UnsupportedStorageFormat(storage.clone()))?;
                let key = schema
                    .storage_key()
                    .ok_or_else(|| SubmitError::StorageUnavailable(StoreError::InvalidKey(storage.clone())))?;
                let outcome = self
                    .store
                    .append(&key, format, &response)
                    .map_err(SubmitError::StorageUnavailable)?;
                if !outcome.dropped_columns.is_empty() {
                    warnings.push(format!(
                        "CSV storage has no column for: {}",
                        outcome.dropped_columns.join(", ")
                    ));
                }
                Some(outcome)
            }
            None => None,
        };

        // Stage 6: notify. Failure downgrades to a warning.
        let notification = if schema.submit.email.is_some() {
            match self.notifier.notify(schema, &response) {
                Ok(NotifyOutcome::Skipped { reason }) => {
                    warnings.push(reason.clone());
                    Some(NotifyOutcome::Skipped { reason })
                }
                Ok(sent) => Some(sent),
                Err(e) => {
                    log::error!("Failed to send email for '{}': {}", schema.form_id(), e);
                    warnings.push(format!("Email notification failed: {}", e));
                    None
                }
            }
        } else {
            None
        };

        log::info!(
            "Accepted submission to '{}' from {} ({} warnings)",
            schema.form_id(),
            identifier,
            warnings.len()
        );

        Ok(Accepted {
            response,
            stored,
            notification,
            warnings,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SmtpAuth, SmtpSettings};
    use crate::guard::{CsrfTokens, RateLimiter};
    use crate::notify::{MemoryFailure, MemoryMailer};
    use crate::store::StorageFormat;
    use chrono::TimeZone;
    use tempfile::{tempdir, TempDir};

    const EMAIL_FORM: &str = r#"{
        "title": "Signup",
        "fields": [{"name": "email", "type": "email", "required": true}],
        "submit": {"storage": "r.json"}
    }"#;

    struct Harness {
        dir: TempDir,
        mailer: Arc<MemoryMailer>,
        pipeline: Pipeline,
    }

    fn harness(forms: &[(&str, &str)], max_requests: usize, csrf: bool, smtp: bool) -> Harness {
        let dir = tempdir().unwrap();
        let forms_dir = dir.path().join("forms");
        std::fs::create_dir_all(&forms_dir).unwrap();
        for (id, json) in forms {
            std::fs::write(forms_dir.join(format!("{}.json", id)), json).unwrap();
        }

        let mailer = Arc::new(MemoryMailer::new());
        let default_smtp = smtp.then(|| SmtpSettings {
            host: "smtp.example.com".into(),
            port: 465,
            secure: true,
            auth: SmtpAuth { user: "forms@example.com".into(), pass: "pw".into() },
            from: None,
            timeout_secs: 5,
        });
        let pipeline = Pipeline::new(
            FormRegistry::new(forms_dir),
            AntiAbuseGuard::new(RateLimiter::new(max_requests, 60_000, 100), csrf.then(|| CsrfTokens::new(60))),
            ResponseStore::new(dir.path()),
            Notifier::new(mailer.clone(), default_smtp),
        );
        Harness { dir, mailer, pipeline }
    }

    fn meta() -> SubmissionMeta {
        SubmissionMeta {
            ip: Some("203.0.113.7".into()),
            user_agent: Some("test-agent".into()),
        }
    }

    fn at(second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, second).unwrap()
    }

    #[test]
    fn invalid_submission_leaves_storage_untouched() {
        let h = harness(&[("signup", EMAIL_FORM)], 10, false, false);
        let outcome = h.pipeline.submit("signup", r#"{"email": "not-an-email"}"#, &meta());

        assert!(!outcome.accepted);
        assert_eq!(outcome.errors, vec!["email must be a valid email"]);
        assert_eq!(outcome.status, 422);
        assert!(!h.dir.path().join("r.json").exists());
    }

    #[test]
    fn valid_submission_creates_json_store() {
        let h = harness(&[("signup", EMAIL_FORM)], 10, false, false);
        let outcome = h.pipeline.submit("signup", r#"{"email": "a@b.com"}"#, &meta());
        assert!(outcome.accepted, "{:?}", outcome);
        assert!(outcome.errors.is_empty());

        let text = std::fs::read_to_string(h.dir.path().join("r.json")).unwrap();
        let stored: serde_json::Value = serde_json::from_str(&text).unwrap();
        let entries = stored.as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["data"]["email"], "a@b.com");
        assert_eq!(entries[0]["formId"], "signup");
        assert_eq!(entries[0]["metadata"]["userAgent"], "test-agent");
    }

    #[test]
    fn honeypot_beats_validation_and_spares_quota() {
        let h = harness(&[("signup", EMAIL_FORM)], 1, false, false);
        let spam = r#"{"email": "junk", "_gotcha": "gotcha"}"#;

        for i in 0..3 {
            let err = h.pipeline.try_submit("signup", spam, &meta(), at(i)).unwrap_err();
            assert!(matches!(err, SubmitError::SpamRejected));
        }

        let ok = h.pipeline.try_submit("signup", r#"{"email": "a@b.com", "_gotcha": ""}"#, &meta(), at(5));
        assert!(ok.is_ok());
        let stored = h.pipeline.store().list("r", StorageFormat::Json).unwrap();
        assert!(!stored[0].data.contains_key("_gotcha"));
    }

    #[test]
    fn rate_limit_applies_per_ip() {
        let h = harness(&[("signup", EMAIL_FORM)], 2, false, false);
        let body = r#"{"email": "a@b.com"}"#;
        assert!(h.pipeline.try_submit("signup", body, &meta(), at(0)).is_ok());
        assert!(h.pipeline.try_submit("signup", body, &meta(), at(1)).is_ok());

        let err = h.pipeline.try_submit("signup", body, &meta(), at(2)).unwrap_err();
        assert!(matches!(err, SubmitError::RateLimited));
        assert_eq!(err.status_code(), 429);

        let other = SubmissionMeta { ip: Some("198.51.100.1".into()), user_agent: None };
        assert!(h.pipeline.try_submit("signup", body, &other, at(2)).is_ok());
        assert_eq!(h.pipeline.store().count("r", StorageFormat::Json).unwrap(), 3);
    }

    #[test]
    fn notification_failure_keeps_the_response() {
        let form = r#"{
            "title": "Contact",
            "fields": [{"name": "message", "label": "Message", "required": true}],
            "submit": {"storage": "contact.json", "email": "owner@example.com"}
        }"#;
        let h = harness(&[("contact", form)], 10, false, true);
        h.mailer.fail_with(Some(MemoryFailure::Timeout));

        let outcome = h.pipeline.submit("contact", r#"{"message": "hello"}"#, &meta());
        assert!(outcome.accepted);
        assert_eq!(outcome.status, 200);
        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.warnings[0].starts_with("Email notification failed"));
        assert_eq!(h.pipeline.store().count("contact", StorageFormat::Json).unwrap(), 1);

        h.mailer.fail_with(None);
        let accepted = h
            .pipeline
            .try_submit("contact", r#"{"message": "again"}"#, &meta(), at(0))
            .unwrap();
        assert!(accepted.warnings.is_empty());
        assert_eq!(
            accepted.notification,
            Some(NotifyOutcome::Sent { to: "owner@example.com".into() })
        );
        assert_eq!(h.mailer.sent()[0].subject, "New submission: Contact");
    }

    #[test]
    fn missing_smtp_is_an_observable_skip() {
        let form = r#"{"title": "C", "fields": [], "submit": {"email": "owner@example.com"}}"#;
        let h = harness(&[("c", form)], 10, false, false);
        let outcome = h.pipeline.submit("c", "{}", &meta());
        assert!(outcome.accepted);
        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.warnings[0].contains("skipped"));
    }

    #[test]
    fn storage_fault_is_a_server_error() {
        let h = harness(&[("signup", EMAIL_FORM)], 10, false, false);
        let blocked = Pipeline::new(
            FormRegistry::new(h.dir.path().join("forms")),
            AntiAbuseGuard::new(RateLimiter::new(10, 60_000, 10), None),
            // A regular file where the store directory should be
            ResponseStore::new(h.dir.path().join("forms").join("signup.json")),
            Notifier::new(h.mailer.clone(), None),
        );

        let outcome = blocked.submit("signup", r#"{"email": "a@b.com"}"#, &meta());
        assert!(!outcome.accepted);
        assert_eq!(outcome.status, 500);
        assert_eq!(outcome.kind.as_deref(), Some("storage_unavailable"));
    }

    #[test]
    fn csrf_enforced_when_enabled() {
        let h = harness(&[("signup", EMAIL_FORM)], 10, true, false);

        let err = h
            .pipeline
            .try_submit("signup", r#"{"email": "a@b.com", "_csrf": "made-up"}"#, &meta(), at(0))
            .unwrap_err();
        assert!(matches!(err, SubmitError::CsrfRejected));

        let token = h.pipeline.guard().csrf().unwrap().issue(at(0)).unwrap();
        let body = format!(r#"{{"email": "a@b.com", "_csrf": "{}"}}"#, token);
        let accepted = h.pipeline.try_submit("signup", &body, &meta(), at(1)).unwrap();
        assert!(!accepted.response.data.contains_key("_csrf"));

        // Replay of the same token is refused
        assert!(matches!(
            h.pipeline.try_submit("signup", &body, &meta(), at(2)),
            Err(SubmitError::CsrfRejected)
        ));
    }

    #[test]
    fn urlencoded_checkbox_body_goes_to_csv() {
        let form = r#"{
            "title": "Survey",
            "fields": [
                {"name": "name", "required": true},
                {"name": "langs", "type": "checkbox", "options": ["rust", "go", "c"]}
            ],
            "submit": {"storage": "out/survey.csv"}
        }"#;
        let h = harness(&[("survey", form)], 10, false, false);
        let accepted = h
            .pipeline
            .try_submit("survey", "name=Ada&langs[]=rust&langs[]=c&_gotcha=", &meta(), at(0))
            .unwrap();
        let stored = accepted.stored.unwrap();
        assert_eq!(stored.path, h.dir.path().join("survey.csv"));

        let text = std::fs::read_to_string(&stored.path).unwrap();
        assert_eq!(text, "timestamp,name,langs\n2026-06-01T09:00:00.000Z,Ada,rust; c\n");
        assert_eq!(StorageFormat::from_path("out/survey.csv"), Some(StorageFormat::Csv));
    }

    #[test]
    fn unknown_form_and_bad_body() {
        let h = harness(&[("signup", EMAIL_FORM)], 10, false, false);
        let outcome = h.pipeline.submit("nope", "{}", &meta());
        assert_eq!(outcome.status, 404);
        assert_eq!(outcome.kind.as_deref(), Some("form_not_found"));

        let outcome = h.pipeline.submit("signup", r#"{"email": {"nested": true}}"#, &meta());
        assert_eq!(outcome.status, 400);
    }

    #[test]
    fn outcome_serializes_compactly() {
        let h = harness(&[("signup", EMAIL_FORM)], 10, false, false);
        let outcome = h.pipeline.submit("signup", r#"{"email": "bad"}"#, &meta());
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["accepted"], false);
        assert_eq!(json["errors"][0], "email must be a valid email");
        assert!(json.get("warnings").is_none());
    }

    #[test]
    fn csrf_token_outlives_the_issuing_pipeline() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("forms")).unwrap();
        std::fs::write(dir.path().join("forms").join("signup.json"), EMAIL_FORM).unwrap();

        let mut config = GlobalConfig::default();
        config.security.require_csrf = true;
        let mailer: Arc<dyn Mailer> = Arc::new(MemoryMailer::new());

        // One run issues, a later run with fresh state submits
        let issuing = Pipeline::from_config(&config, dir.path(), mailer.clone());
        let token = issuing.guard().csrf().unwrap().issue(Utc::now()).unwrap();
        drop(issuing);

        let submitting = Pipeline::from_config(&config, dir.path(), mailer);
        let body = format!(r#"{{"email": "a@b.com", "_csrf": "{}"}}"#, token);
        let outcome = submitting.submit("signup", &body, &meta());
        assert!(outcome.accepted, "{:?}", outcome);
        assert_eq!(submitting.store().count("r", StorageFormat::Json).unwrap(), 1);

        let replay = submitting.submit("signup", &body, &meta());
        assert_eq!(replay.status, 403);
        assert_eq!(replay.kind.as_deref(), Some("csrf_rejected"));
    }
}
