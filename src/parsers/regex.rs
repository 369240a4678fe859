// SPDX-License-Identifier: Apache-2.0

use regex::Regex;
use serde_json::{Map, Value};

use super::LineParser;
use crate::error::{Error, Result};

/// Extracts fields from a line using a regular expression with named capture
/// groups, e.g. `(?P<level>\w+) (?P<msg>.*)`.
pub struct RegexParser {
    regex: Regex,
    group_names: Vec<String>,
}

impl RegexParser {
    /// The pattern must contain at least one named capture group using the
    /// `(?P<name>...)` syntax.
    pub fn new(pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern)
            .map_err(|e| Error::Config(format!("invalid regex pattern: {}", e)))?;

        let group_names: Vec<String> = regex
            .capture_names()
            .skip(1) // index 0 is the full match
            .filter_map(|name| name.map(|s| s.to_string()))
            .collect();

        if group_names.is_empty() {
            return Err(Error::Config(
                "regex pattern must contain at least one named capture group".to_string(),
            ));
        }

        Ok(Self { regex, group_names })
    }
}

impl LineParser for RegexParser {
    fn parse(&self, line: &str) -> Result<Map<String, Value>> {
        let captures = self
            .regex
            .captures(line)
            .ok_or_else(|| Error::Parse(format!("line did not match pattern: {}", self.regex)))?;

        let mut fields = Map::with_capacity(self.group_names.len());
        for name in &self.group_names {
            if let Some(m) = captures.name(name) {
                fields.insert(name.clone(), Value::String(m.as_str().to_string()));
            }
        }
        Ok(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_named_groups() {
        let parser = RegexParser::new(r"(?P<level>\w+)\s+(?P<msg>.*)").unwrap();
        let fields = parser.parse("ERROR disk is full").unwrap();

        assert_eq!(fields["level"], "ERROR");
        assert_eq!(fields["msg"], "disk is full");
    }

    #[test]
    fn optional_groups_may_be_absent() {
        let parser = RegexParser::new(r"(?P<a>\d+)(?:-(?P<b>\d+))?").unwrap();
        let fields = parser.parse("17").unwrap();

        assert_eq!(fields["a"], "17");
        assert!(!fields.contains_key("b"));
    }

    #[test]
    fn non_matching_line_is_an_error() {
        let parser = RegexParser::new(r"(?P<num>\d+)").unwrap();
        assert!(parser.parse("no digits here").is_err());
    }

    #[test]
    fn requires_a_named_group() {
        assert!(RegexParser::new(r"\d+").is_err());
        assert!(RegexParser::new(r"(\d+)").is_err());
    }
}
