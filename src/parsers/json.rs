// SPDX-License-Identifier: Apache-2.0

use serde_json::{Map, Value};

use super::LineParser;
use crate::error::{Error, Result};

/// Parses each line as a JSON object; the object's keys become record fields.
#[derive(Debug, Clone, Default)]
pub struct JsonParser;

impl JsonParser {
    pub fn new() -> Self {
        Self
    }
}

impl LineParser for JsonParser {
    fn parse(&self, line: &str) -> Result<Map<String, Value>> {
        let parsed: Value = serde_json::from_str(line)?;

        match parsed {
            Value::Object(map) => Ok(map),
            _ => Err(Error::Parse(
                "JSON log line must be an object at the top level".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_object_keys_into_fields() {
        let fields = JsonParser::new()
            .parse(r#"{"level":"info","code":200,"ok":true}"#)
            .unwrap();

        assert_eq!(fields["level"], "info");
        assert_eq!(fields["code"], 200);
        assert_eq!(fields["ok"], true);
    }

    #[test]
    fn nested_values_are_preserved() {
        let fields = JsonParser::new()
            .parse(r#"{"http":{"method":"GET","path":"/x"}}"#)
            .unwrap();

        assert_eq!(fields["http"]["method"], "GET");
    }

    #[test]
    fn invalid_json_is_an_error() {
        assert!(JsonParser::new().parse("plain text line").is_err());
    }

    #[test]
    fn non_object_json_is_an_error() {
        assert!(JsonParser::new().parse("[1, 2, 3]").is_err());
        assert!(JsonParser::new().parse("42").is_err());
    }
}
