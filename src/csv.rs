// GateCrash Forms - CSV Encoding
// Copyright 2026 Joseph Stone - All Rights Reserved
//
// RFC4180-style quoting for the response store:
// fields containing a comma, double-quote or newline are wrapped in quotes,
// internal quotes doubled. Parsing is the exact inverse.

use std::borrow::Cow;

/// Quote a field only when it needs quoting
pub fn escape_field(value: &str) -> Cow<'_, str> {
    if value.contains(',') || value.contains('"') || value.contains('\n') || value.contains('\r') {
        Cow::Owned(format!("\"{}\"", value.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(value)
    }
}

/// Comma-joined record line (no trailing newline)
pub fn join_record<S: AsRef<str>>(fields: &[S]) -> String {
    fields
        .iter()
        .map(|f| escape_field(f.as_ref()))
        .collect::<Vec<_>>()
        .join(",")
}

/// Inverse of `escape_field` for a single field
pub fn unescape_field(field: &str) -> String {
    match field.strip_prefix('"').and_then(|f| f.strip_suffix('"')) {
        Some(inner) if field.len() >= 2 => inner.replace("\"\"", "\""),
        _ => field.to_string(),
    }
}

/// Split CSV text into records. Quoted fields may span lines.
/// A trailing newline does not produce an empty record.
pub fn parse_records(text: &str) -> Vec<Vec<String>> {
    let mut records = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    field.push('"');
                    chars.next();
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
            continue;
        }

        match c {
            '"' => in_quotes = true,
            ',' => record.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                record.push(std::mem::take(&mut field));
                records.push(std::mem::take(&mut record));
            }
            _ => field.push(c),
        }
    }

    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }

    records
}

/// First record of `text`, or empty when there is none
pub fn parse_record(text: &str) -> Vec<String> {
    parse_records(text).into_iter().next().unwrap_or_default()
}

// ============================================================================
// TESTS
// ============================================================================
