//! Pattern compilation and named-capture extraction.

use std::collections::HashMap;

use regex::Regex;

use crate::error::LogtricsError;

/// The only pattern kind currently understood by [`Parser::new`].
pub const PARSER_KIND_RE2: &str = "re2";

/// A compiled log line pattern.
///
/// The compiled expression is immutable and safe for concurrent matching.
#[derive(Debug, Clone)]
pub struct Parser {
    expression: String,
    regex: Regex,
}

impl Parser {
    /// Compiles a pattern of the given kind.
    pub fn new(kind: &str, expression: &str) -> Result<Self, LogtricsError> {
        if kind != PARSER_KIND_RE2 {
            return Err(LogtricsError::parser_kind_unknown(kind));
        }
        let regex = Regex::new(expression).map_err(|source| LogtricsError::ParserCompile {
            expression: expression.to_string(),
            source,
        })?;
        Ok(Self {
            expression: expression.to_string(),
            regex,
        })
    }

    /// Extracts the named capture groups from the line.
    ///
    /// Returns `None` when the expression does not match. Unnamed groups
    /// are omitted from the mapping.
    pub fn captures(&self, line: &str) -> Option<HashMap<String, String>> {
        let caps = self.regex.captures(line)?;
        let mut subs = HashMap::new();
        for name in self.regex.capture_names().flatten() {
            if let Some(m) = caps.name(name) {
                subs.insert(name.to_string(), m.as_str().to_string());
            }
        }
        Some(subs)
    }

    /// The expression this parser was compiled from.
    pub fn expression(&self) -> &str {
        &self.expression
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_captures() {
        let parser = Parser::new("re2", r"^hello (?P<who>\w+)$").unwrap();
        let subs = parser.captures("hello world").unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs["who"], "world");
    }

    #[test]
    fn test_no_match_returns_none() {
        let parser = Parser::new("re2", r"^hello (?P<who>\w+)$").unwrap();
        assert!(parser.captures("goodbye world").is_none());
    }

    #[test]
    fn test_unnamed_groups_are_omitted() {
        let parser = Parser::new("re2", r"^(\w+) (?P<verb>\w+) (\w+)$").unwrap();
        let subs = parser.captures("alice likes bob").unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs["verb"], "likes");
    }

    #[test]
    fn test_optional_group_absent_from_mapping() {
        let parser = Parser::new("re2", r"^get (?P<path>\S+)(?P<query>\?\S+)?$").unwrap();
        let subs = parser.captures("get /index.html").unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs["path"], "/index.html");
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let err = Parser::new("glob", "*").unwrap_err();
        assert!(matches!(err, LogtricsError::ParserKindUnknown { .. }));
    }

    #[test]
    fn test_invalid_expression_rejected() {
        let err = Parser::new("re2", "(unclosed").unwrap_err();
        assert!(matches!(err, LogtricsError::ParserCompile { .. }));
    }
}
