//! SQL literal rendering for dump files.
//!
//! Dumps are written with `standard_conforming_strings = on`, so inside a quoted literal only
//! the single quote needs escaping. Values that cannot travel inside a quoted literal (anything
//! with a zero byte, and binary columns) are written as hex-encoded `bytea` literals.

use crate::source::FieldValue;

pub fn encode(value: &FieldValue) -> String {
    match value {
        FieldValue::Null => "NULL".to_string(),
        FieldValue::Text(text) if text.as_bytes().contains(&0) => hex_literal(text.as_bytes()),
        FieldValue::Text(text) => quoted_literal(text),
        FieldValue::Binary(bytes) => hex_literal(bytes),
    }
}

fn quoted_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

fn hex_literal(bytes: &[u8]) -> String {
    format!("'\\x{}'::bytea", hex::encode(bytes))
}
