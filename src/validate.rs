// GateCrash Forms - Field Validator
// Copyright 2026 Joseph Stone - All Rights Reserved
//
// Checks one submission against the form's field declarations:
// - Required fields present and non-empty
// - One type rule per FieldType variant (email, url, number, phone, ...)
// - Numeric bounds, scale range, choice membership, max length
// Collects every error in schema order. Never fails, never panics.

use crate::schema::{FieldSpec, FieldType, FormSchema};
use crate::submission::{FieldValue, RawSubmission};
use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

static EMAIL_RE: OnceLock<Regex> = OnceLock::new();

const SCALE_DEFAULT_MIN: f64 = 1.0;
const SCALE_DEFAULT_MAX: f64 = 5.0;
const PHONE_MIN_DIGITS: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationErrorKind {
    Required,
    InvalidEmail,
    InvalidUrl,
    NotANumber,
    BelowMin,
    AboveMax,
    TooLong,
    InvalidPhone,
    InvalidDate,
    OutOfRange,
    InvalidOption,
}

/// One field problem. Data, not a fault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    pub kind: ValidationErrorKind,
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// Simple `local@domain.tld` shape
pub fn is_valid_email(value: &str) -> bool {
    EMAIL_RE
        .get_or_init(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("static email regex"))
        .is_match(value)
}

/// Absolute URL with a scheme
pub fn is_valid_url(value: &str) -> bool {
    url::Url::parse(value).is_ok()
}

fn parse_number(value: &str) -> Option<f64> {
    value.trim().parse::<f64>().ok().filter(|n| n.is_finite())
}

fn is_valid_phone(value: &str) -> bool {
    let allowed = value
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '(' | ')' | '.' | ' '));
    let digits = value.chars().filter(char::is_ascii_digit).count();
    allowed && digits >= PHONE_MIN_DIGITS
}

fn is_valid_date(value: &str) -> bool {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").is_ok()
}

/// Render a bound the way a form author wrote it (5, not 5.0)
fn fmt_bound(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

struct Collector<'a> {
    field: &'a FieldSpec,
    errors: &'a mut Vec<ValidationError>,
}

impl Collector<'_> {
    fn push(&mut self, kind: ValidationErrorKind, detail: String) {
        self.errors.push(ValidationError {
            kind,
            field: self.field.name.clone(),
            message: format!("{} {}", self.field.display_name(), detail),
        });
    }
}

/// Validate a submission against its schema. Empty result = valid.
pub fn validate(data: &RawSubmission, schema: &FormSchema) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    for field in &schema.fields {
        let mut out = Collector { field, errors: &mut errors };

        let value = match data.get(&field.name) {
            Some(v) if !v.is_empty() => v,
            _ => {
                if field.required {
                    out.push(ValidationErrorKind::Required, "is required".to_string());
                }
                continue;
            }
        };

        check_type(field, value, &mut out);

        if let Some(max_len) = field.max_length {
            if value.values().iter().any(|v| v.chars().count() > max_len) {
                out.push(
                    ValidationErrorKind::TooLong,
                    format!("exceeds maximum length of {}", max_len),
                );
            }
        }
    }

    errors
}

/// The single rule for each field type
fn check_type(field: &FieldSpec, value: &FieldValue, out: &mut Collector<'_>) {
    let values = value.values();

    match &field.field_type {
        FieldType::Email => {
            if !values.iter().all(|v| is_valid_email(v)) {
                out.push(ValidationErrorKind::InvalidEmail, "must be a valid email".to_string());
            }
        }
        FieldType::Url => {
            if !values.iter().all(|v| is_valid_url(v)) {
                out.push(ValidationErrorKind::InvalidUrl, "must be a valid URL".to_string());
            }
        }
        FieldType::Number => {
            let numbers: Option<Vec<f64>> = values.iter().map(|v| parse_number(v)).collect();
            let Some(numbers) = numbers else {
                out.push(ValidationErrorKind::NotANumber, "must be a number".to_string());
                return;
            };
            if let Some(min) = field.min {
                if numbers.iter().any(|n| *n < min) {
                    out.push(ValidationErrorKind::BelowMin, format!("must be at least {}", fmt_bound(min)));
                }
            }
            if let Some(max) = field.max {
                if numbers.iter().any(|n| *n > max) {
                    out.push(ValidationErrorKind::AboveMax, format!("must be at most {}", fmt_bound(max)));
                }
            }
        }
        FieldType::Phone => {
            if !values.iter().all(|v| is_valid_phone(v)) {
                out.push(ValidationErrorKind::InvalidPhone, "must be a valid phone number".to_string());
            }
        }
        FieldType::Date => {
            if !values.iter().all(|v| is_valid_date(v)) {
                out.push(ValidationErrorKind::InvalidDate, "must be a valid date (YYYY-MM-DD)".to_string());
            }
        }
        FieldType::Scale => {
            let min = field.min.unwrap_or(SCALE_DEFAULT_MIN);
            let max = field.max.unwrap_or(SCALE_DEFAULT_MAX);
            let in_range = values.iter().all(|v| {
                parse_number(v)
                    .map(|n| n.fract() == 0.0 && n >= min && n <= max)
                    .unwrap_or(false)
            });
            if !in_range {
                out.push(
                    ValidationErrorKind::OutOfRange,
                    format!("must be between {} and {}", fmt_bound(min), fmt_bound(max)),
                );
            }
        }
        FieldType::Select | FieldType::Radio | FieldType::Checkbox => {
            if !values.iter().all(|v| field.options.iter().any(|o| o == v)) {
                out.push(ValidationErrorKind::InvalidOption, "has an invalid option".to_string());
            }
        }
        FieldType::Text | FieldType::Textarea | FieldType::Other(_) => {}
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(json: &str) -> FormSchema {
        FormSchema::from_json(json).unwrap()
    }

    fn messages(errors: &[ValidationError]) -> Vec<&str> {
        errors.iter().map(|e| e.message.as_str()).collect()
    }

    fn raw(pairs: &[(&str, &str)]) -> RawSubmission {
        pairs.iter().map(|(k, v)| (*k, *v)).collect()
    }

    #[test]
    fn required_uses_label_then_name() {
        let s = schema(
            r#"{"title": "t", "fields": [
                {"name": "name", "label": "Your Name", "required": true},
                {"name": "email", "type": "email", "required": true}
            ]}"#,
        );
        let errors = validate(&RawSubmission::new(), &s);
        assert_eq!(messages(&errors), vec!["Your Name is required", "email is required"]);
        assert!(errors.iter().all(|e| e.kind == ValidationErrorKind::Required));
    }

    #[test]
    fn required_skips_further_checks() {
        let s = schema(r#"{"title": "t", "fields": [{"name": "n", "type": "number", "required": true, "min": 3}]}"#);
        let errors = validate(&raw(&[("n", "")]), &s);
        assert_eq!(messages(&errors), vec!["n is required"]);
    }

    #[test]
    fn optional_empty_fields_pass() {
        let s = schema(r#"{"title": "t", "fields": [{"name": "e", "type": "email"}]}"#);
        assert!(validate(&raw(&[("e", "")]), &s).is_empty());
        assert!(validate(&RawSubmission::new(), &s).is_empty());
    }

    #[test]
    fn email_and_url_shapes() {
        let s = schema(
            r#"{"title": "t", "fields": [
                {"name": "email", "type": "email"},
                {"name": "site", "label": "Website", "type": "url"}
            ]}"#,
        );
        let errors = validate(&raw(&[("email", "not-an-email"), ("site", "example.com")]), &s);
        assert_eq!(messages(&errors), vec!["email must be a valid email", "Website must be a valid URL"]);

        assert!(validate(&raw(&[("email", "a@b.com"), ("site", "https://example.com/x")]), &s).is_empty());
    }

    #[test]
    fn number_bounds_each_emit() {
        let s = schema(r#"{"title": "t", "fields": [{"name": "age", "type": "number", "min": 18, "max": 99}]}"#);
        assert_eq!(messages(&validate(&raw(&[("age", "12")]), &s)), vec!["age must be at least 18"]);
        assert_eq!(messages(&validate(&raw(&[("age", "120")]), &s)), vec!["age must be at most 99"]);
        assert_eq!(messages(&validate(&raw(&[("age", "abc")]), &s)), vec!["age must be a number"]);
        assert!(validate(&raw(&[("age", "18")]), &s).is_empty());
        assert!(validate(&raw(&[("age", "99")]), &s).is_empty());
    }

    #[test]
    fn max_length_counts_chars() {
        let s = schema(r#"{"title": "t", "fields": [{"name": "m", "label": "Message", "maxLength": 3}]}"#);
        assert!(validate(&raw(&[("m", "äöü")]), &s).is_empty());
        assert_eq!(
            messages(&validate(&raw(&[("m", "abcd")]), &s)),
            vec!["Message exceeds maximum length of 3"]
        );
    }

    #[test]
    fn choice_scale_phone_date_rules() {
        let s = schema(
            r#"{"title": "t", "fields": [
                {"name": "plan", "type": "select", "options": ["free", "pro"]},
                {"name": "langs", "type": "checkbox", "options": ["rust", "go"]},
                {"name": "mood", "type": "scale", "max": 10},
                {"name": "tel", "type": "phone"},
                {"name": "day", "type": "date"}
            ]}"#,
        );

        let mut ok = raw(&[("plan", "pro"), ("mood", "10"), ("tel", "+1 (555) 010-9999"), ("day", "2026-02-28")]);
        ok.insert("langs", vec!["rust", "go"]);
        assert!(validate(&ok, &s).is_empty());

        let mut bad = raw(&[("plan", "enterprise"), ("mood", "11"), ("tel", "call me"), ("day", "2026-02-30")]);
        bad.insert("langs", vec!["rust", "cobol"]);
        assert_eq!(
            messages(&validate(&bad, &s)),
            vec![
                "plan has an invalid option",
                "langs has an invalid option",
                "mood must be between 1 and 10",
                "tel must be a valid phone number",
                "day must be a valid date (YYYY-MM-DD)",
            ]
        );
    }

    #[test]
    fn unknown_types_are_free_text() {
        let s = schema(r#"{"title": "t", "fields": [{"name": "sig", "type": "signature", "required": true}]}"#);
        assert!(validate(&raw(&[("sig", "<anything @ all>")]), &s).is_empty());
    }

    #[test]
    fn empty_checkbox_list_counts_as_missing() {
        let s = schema(r#"{"title": "t", "fields": [{"name": "c", "type": "checkbox", "options": ["a"], "required": true}]}"#);
        let mut data = RawSubmission::new();
        data.insert("c", Vec::<&str>::new());
        assert_eq!(messages(&validate(&data, &s)), vec!["c is required"]);
    }

    #[test]
    fn repeated_calls_are_identical() {
        let s = schema(
            r#"{"title": "t", "fields": [
                {"name": "a", "required": true},
                {"name": "b", "type": "email"},
                {"name": "c", "type": "number", "min": 1, "max": 0}
            ]}"#,
        );
        let data = raw(&[("b", "x"), ("c", "0.5")]);
        let first = validate(&data, &s);
        let second = validate(&data, &s);
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
        assert_eq!(first.len(), 4);
    }
}
