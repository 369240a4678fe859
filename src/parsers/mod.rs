// SPDX-License-Identifier: Apache-2.0

//! Per-source line parsers.
//!
//! A handler reference names the parser applied to every line of a source.
//! References are resolved once at startup through [`resolve`]; an unknown
//! reference is a fatal configuration error. Parse failures at runtime are
//! per-line and non-fatal: the tailer keeps the record, marks it errored,
//! and moves on.
//!
//! # Available handlers
//!
//! - `raw` - no extraction, the record carries only the raw line
//! - `json` - the line is a JSON object, its keys become record fields
//! - `regex:<pattern>` - named capture groups become record fields

mod json;
mod regex;

pub use json::JsonParser;
pub use regex::RegexParser;

use serde_json::{Map, Value};
use std::sync::Arc;

use crate::error::{Error, Result};

/// Extracts structured fields from one raw log line.
pub trait LineParser: Send + Sync {
    /// Parse the line (no trailing newline) into a field map. An error marks
    /// the record as failed to parse; it never drops the record.
    fn parse(&self, line: &str) -> Result<Map<String, Value>>;
}

/// A parser that extracts nothing; records carry only the raw line.
#[derive(Debug, Clone, Default)]
pub struct RawParser;

impl LineParser for RawParser {
    fn parse(&self, _line: &str) -> Result<Map<String, Value>> {
        Ok(Map::new())
    }
}

/// Resolve a handler reference into a parser. Called once per source at
/// startup; failure here aborts the process before any task starts.
pub fn resolve(reference: &str) -> Result<Arc<dyn LineParser>> {
    match reference {
        "raw" => Ok(Arc::new(RawParser)),
        "json" => Ok(Arc::new(JsonParser::new())),
        other => match other.split_once(':') {
            Some(("regex", pattern)) => Ok(Arc::new(RegexParser::new(pattern)?)),
            _ => Err(Error::UnknownHandler(reference.to_string())),
        },
    }
}
