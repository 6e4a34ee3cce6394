// GateCrash Forms - Library Root
// Copyright 2026 Joseph Stone - All Rights Reserved
//
// All modules exported here for use by the binary and tests.

pub mod paths;
pub mod config;
pub mod csv;
pub mod error;
pub mod submission;
pub mod validate;

// ============================================================================
// PIPELINE STAGES
// ============================================================================

/// Form schemas and the on-disk form registry
pub mod schema;

/// Honeypot, CSRF tokens, per-identifier rate limiting
pub mod guard;

/// Append-only JSON/CSV response storage
pub mod store;

/// Notification envelopes and send capabilities
pub mod notify;

/// Ordered submission pipeline
pub mod pipeline;

pub use error::SubmitError;
pub use pipeline::{Pipeline, SubmissionMeta, SubmitOutcome};
