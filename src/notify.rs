// GateCrash Forms - Email Notifier
// Copyright 2026 Joseph Stone - All Rights Reserved
//
// Formats an accepted response into a plain-text + HTML envelope and hands
// it to an injected Mailer. BYOK: the SMTP account is the form owner's,
// resolved per form (submit.email.smtp) before the global default.
// Every interpolated label/value in HTML passes through escape_html.

use crate::config::SmtpSettings;
use crate::schema::{EmailTarget, FormSchema};
use crate::submission::StoredResponse;
use crate::validate::is_valid_email;
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};
use thiserror::Error;

const LOCK_RETRY: StdDuration = StdDuration::from_millis(25);
const MAX_LOCK_WAIT_SECS: u64 = 3600;

const OUTBOX_FILE: &str = "outbox.jsonl";

#[derive(Debug, Error)]
pub enum MailError {
    #[error("mail transport failed: {0}")]
    Transport(String),

    #[error("mail send timed out after {0}s")]
    Timeout(u64),

    #[error("invalid recipient email: {0}")]
    InvalidRecipient(String),
}

/// Message handed to the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub text: String,
    pub html: String,
}

/// Outbound mail capability. Implementations bound each send by
/// `smtp.timeout_secs` and report overruns as `MailError::Timeout`.
pub trait Mailer: Send + Sync {
    fn send(&self, smtp: &SmtpSettings, envelope: &Envelope) -> Result<(), MailError>;
}

/// What happened to a notification that did not error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyOutcome {
    Sent { to: String },
    /// No SMTP account resolvable for this form
    Skipped { reason: String },
}

// ============================================================================
// FORMATTING
// ============================================================================

/// Entity-escape `& < > " ' /`
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            '/' => out.push_str("&#x2F;"),
            _ => out.push(c),
        }
    }
    out
}

/// `first_name` -> `First Name`
pub fn humanize(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut at_word_start = true;
    for c in key.chars() {
        let c = if c == '_' { ' ' } else { c };
        if c.is_alphanumeric() {
            if at_word_start {
                out.extend(c.to_uppercase());
            } else {
                out.push(c);
            }
            at_word_start = false;
        } else {
            out.push(c);
            at_word_start = true;
        }
    }
    out
}

fn field_label(schema: &FormSchema, key: &str) -> String {
    match schema.field(key).and_then(|f| f.label.as_deref()) {
        Some(label) if !label.is_empty() => label.to_string(),
        _ => humanize(key),
    }
}

/// Headers must stay on one line
fn single_line(s: &str) -> String {
    s.chars().map(|c| if c == '\r' || c == '\n' { ' ' } else { c }).collect()
}

pub fn subject_for(schema: &FormSchema) -> String {
    format!("New submission: {}", single_line(&schema.title))
}

pub fn text_body(schema: &FormSchema, response: &StoredResponse) -> String {
    let mut text = format!("New form submission: {}\n", schema.title);
    text.push_str(&format!("Submitted: {}\n\n", response.timestamp_string()));

    for (key, value) in &response.data {
        text.push_str(&format!("{}: {}\n", field_label(schema, key), value.join(", ")));
    }
    text
}

pub fn html_body(schema: &FormSchema, response: &StoredResponse) -> String {
    let mut html = format!("<h2>New form submission: {}</h2>", escape_html(&schema.title));
    html.push_str(&format!(
        "<p><strong>Submitted:</strong> {}</p>",
        escape_html(&response.timestamp_string())
    ));
    html.push_str("<table style=\"border-collapse: collapse; width: 100%;\">");

    for (key, value) in &response.data {
        html.push_str(&format!(
            "<tr><td style=\"padding: 8px; border: 1px solid #ddd; font-weight: bold;\">{}</td>\
             <td style=\"padding: 8px; border: 1px solid #ddd;\">{}</td></tr>",
            escape_html(&field_label(schema, key)),
            escape_html(&value.join(", ")),
        ));
    }

    html.push_str("</table>");
    html
}

// ============================================================================
// NOTIFIER
// ============================================================================

pub struct Notifier {
    mailer: Arc<dyn Mailer>,
    default_smtp: Option<SmtpSettings>,
}

impl Notifier {
    pub fn new(mailer: Arc<dyn Mailer>, default_smtp: Option<SmtpSettings>) -> Self {
        Self { mailer, default_smtp }
    }

    /// Per-form override first, then the global account
    fn resolve_smtp<'a>(&'a self, target: &'a EmailTarget) -> Option<&'a SmtpSettings> {
        target.smtp().or(self.default_smtp.as_ref())
    }

    pub fn build_envelope(
        &self,
        smtp: &SmtpSettings,
        to: &str,
        schema: &FormSchema,
        response: &StoredResponse,
    ) -> Envelope {
        Envelope {
            from: smtp.sender().to_string(),
            to: to.to_string(),
            subject: subject_for(schema),
            text: text_body(schema, response),
            html: html_body(schema, response),
        }
    }

    /// Send the notification for one accepted response.
    ///
    /// A form without an email target is not the notifier's concern; callers
    /// only invoke this when `submit.email` is set.
    pub fn notify(&self, schema: &FormSchema, response: &StoredResponse) -> Result<NotifyOutcome, MailError> {
        let Some(target) = schema.submit.email.as_ref() else {
            return Ok(NotifyOutcome::Skipped {
                reason: "form has no email target".to_string(),
            });
        };

        let Some(smtp) = self.resolve_smtp(target) else {
            log::warn!(
                "No SMTP config found for form '{}'. Email notification skipped.",
                schema.form_id()
            );
            return Ok(NotifyOutcome::Skipped {
                reason: "no SMTP config found; email notification skipped".to_string(),
            });
        };

        let to = target.to().trim();
        if !is_valid_email(to) {
            return Err(MailError::InvalidRecipient(to.to_string()));
        }

        let envelope = self.build_envelope(smtp, to, schema, response);
        self.mailer.send(smtp, &envelope)?;

        log::info!("Email notification sent to {} for form '{}'", to, schema.form_id());
        Ok(NotifyOutcome::Sent { to: to.to_string() })
    }
}

// ============================================================================
// MAILERS
// ============================================================================

#[derive(Serialize)]
struct SpoolRecord<'a> {
    host: &'a str,
    port: u16,
    secure: bool,
    user: &'a str,
    #[serde(flatten)]
    envelope: &'a Envelope,
}

/// Appends each envelope as one JSON line to `<dir>/outbox.jsonl` for an
/// external relay to deliver. Passwords are never written.
pub struct SpoolMailer {
    dir: PathBuf,
}

impl SpoolMailer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn outbox_path(&self) -> PathBuf {
        self.dir.join(OUTBOX_FILE)
    }
}

impl Mailer for SpoolMailer {
    fn send(&self, smtp: &SmtpSettings, envelope: &Envelope) -> Result<(), MailError> {
        let record = SpoolRecord {
            host: &smtp.host,
            port: smtp.port,
            secure: smtp.secure,
            user: &smtp.auth.user,
            envelope,
        };
        let mut line = serde_json::to_string(&record).map_err(|e| MailError::Transport(e.to_string()))?;
        line.push('\n');

        let io = |e: std::io::Error| MailError::Transport(format!("outbox {:?}: {}", self.outbox_path(), e));
        std::fs::create_dir_all(&self.dir).map_err(io)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.outbox_path())
            .map_err(io)?;
        lock_within(&file, smtp.timeout_secs).map_err(|e| match e {
            LockWait::TimedOut => MailError::Timeout(smtp.timeout_secs),
            LockWait::Io(e) => io(e),
        })?;
        let written = file.write_all(line.as_bytes()).map_err(io);
        let _ = FileExt::unlock(&file);
        written
    }
}

enum LockWait {
    TimedOut,
    Io(std::io::Error),
}

/// Take the outbox lock, giving up after `timeout_secs`
fn lock_within(file: &std::fs::File, timeout_secs: u64) -> Result<(), LockWait> {
    let deadline = Instant::now() + StdDuration::from_secs(timeout_secs.min(MAX_LOCK_WAIT_SECS));
    loop {
        match file.try_lock_exclusive() {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                if Instant::now() >= deadline {
                    return Err(LockWait::TimedOut);
                }
                std::thread::sleep(LOCK_RETRY);
            }
            Err(e) => return Err(LockWait::Io(e)),
        }
    }
}

/// Records envelopes in memory. Can be primed to fail or time out.
#[derive(Default)]
pub struct MemoryMailer {
    sent: Mutex<Vec<Envelope>>,
    failure: Mutex<Option<MemoryFailure>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryFailure {
    Transport,
    Timeout,
}

impl MemoryMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_with(&self, failure: Option<MemoryFailure>) {
        *self.failure.lock() = failure;
    }

    pub fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().clone()
    }
}

impl Mailer for MemoryMailer {
    fn send(&self, smtp: &SmtpSettings, envelope: &Envelope) -> Result<(), MailError> {
        match *self.failure.lock() {
            Some(MemoryFailure::Transport) => {
                Err(MailError::Transport(format!("connection refused by {}", smtp.host)))
            }
            Some(MemoryFailure::Timeout) => Err(MailError::Timeout(smtp.timeout_secs)),
            None => {
                self.sent.lock().push(envelope.clone());
                Ok(())
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
