// GateCrash Forms - Submission Errors
// Copyright 2026 Joseph Stone - All Rights Reserved
//
// Every way a submission can end without being accepted.
// Notification failure is NOT here: once stored, a response is accepted,
// and delivery problems travel as warnings on the outcome.

use crate::schema::SchemaError;
use crate::store::StoreError;
use crate::submission::BodyError;
use crate::validate::ValidationError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("Form not found: {0}")]
    FormNotFound(String),

    #[error("{0}")]
    MalformedBody(#[from] BodyError),

    #[error("Spam detected")]
    SpamRejected,

    #[error("Invalid or expired form token. Please reload the form.")]
    CsrfRejected,

    #[error("Rate limit exceeded. Please try again later.")]
    RateLimited,

    #[error("Validation failed: {}", join_messages(.0))]
    ValidationFailed(Vec<ValidationError>),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(#[source] StoreError),

    #[error("Unsupported storage format: {0}. Use .json or .csv")]
    UnsupportedStorageFormat(String),

    #[error("Invalid form schema: {0}")]
    InvalidSchema(#[source] SchemaError),
}

fn join_messages(errors: &[ValidationError]) -> String {
    errors.iter().map(|e| e.message.as_str()).collect::<Vec<_>>().join(", ")
}

impl From<SchemaError> for SubmitError {
    fn from(err: SchemaError) -> Self {
        match err {
            SchemaError::NotFound(id) => SubmitError::FormNotFound(id),
            SchemaError::UnsupportedStorageFormat(path) => SubmitError::UnsupportedStorageFormat(path),
            other => SubmitError::InvalidSchema(other),
        }
    }
}

impl SubmitError {
    /// HTTP-style status: client errors 4xx, server/config errors 5xx
    pub fn status_code(&self) -> u16 {
        match self {
            SubmitError::FormNotFound(_) => 404,
            SubmitError::MalformedBody(_) => 400,
            SubmitError::SpamRejected => 400,
            SubmitError::CsrfRejected => 403,
            SubmitError::RateLimited => 429,
            SubmitError::ValidationFailed(_) => 422,
            SubmitError::StorageUnavailable(_) => 500,
            SubmitError::UnsupportedStorageFormat(_) => 500,
            SubmitError::InvalidSchema(_) => 500,
        }
    }

    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }

    /// Short machine-readable kind
    pub fn kind(&self) -> &'static str {
        match self {
            SubmitError::FormNotFound(_) => "form_not_found",
            SubmitError::MalformedBody(_) => "malformed_body",
            SubmitError::SpamRejected => "spam_rejected",
            SubmitError::CsrfRejected => "csrf_rejected",
            SubmitError::RateLimited => "rate_limited",
            SubmitError::ValidationFailed(_) => "validation_failed",
            SubmitError::StorageUnavailable(_) => "storage_unavailable",
            SubmitError::UnsupportedStorageFormat(_) => "unsupported_storage_format",
            SubmitError::InvalidSchema(_) => "invalid_schema",
        }
    }

    /// Messages for the caller: one per field problem, or the error itself
    pub fn messages(&self) -> Vec<String> {
        match self {
            SubmitError::ValidationFailed(errors) => errors.iter().map(|e| e.message.clone()).collect(),
            other => vec![other.to_string()],
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
