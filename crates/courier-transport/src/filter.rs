use std::fmt;

use courier_core::Attributes;

use crate::adapter::TransportError;

const ATTRIBUTE_PREFIX: &str = "attributes.";
const CONJUNCTION: &str = " AND ";

/// Conjunction of attribute equality clauses, in the server-side filter
/// syntax: `attributes.shard_index = "2" AND attributes.session_id = "7"`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeFilter {
    clauses: Vec<(String, String)>,
}

impl AttributeFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an `attributes.{key} = "{value}"` clause.
    pub fn eq(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.clauses.push((key.into(), value.into()));
        self
    }

    pub fn clauses(&self) -> &[(String, String)] {
        &self.clauses
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// True when every clause matches. An empty filter matches everything.
    pub fn matches(&self, attributes: &Attributes) -> bool {
        self.clauses
            .iter()
            .all(|(key, value)| attributes.get(key) == Some(value))
    }

    pub fn parse(expression: &str) -> Result<Self, TransportError> {
        let expression = expression.trim();
        if expression.is_empty() {
            return Ok(Self::default());
        }
        let mut filter = Self::default();
        for clause in expression.split(CONJUNCTION) {
            let (key, value) = parse_clause(clause)
                .ok_or_else(|| TransportError::InvalidFilter(clause.trim().to_string()))?;
            filter.clauses.push((key, value));
        }
        Ok(filter)
    }
}

fn parse_clause(clause: &str) -> Option<(String, String)> {
    let (lhs, rhs) = clause.split_once('=')?;
    let key = lhs.trim().strip_prefix(ATTRIBUTE_PREFIX)?;
    if key.is_empty() || key.contains(char::is_whitespace) {
        return None;
    }
    let value = rhs.trim().strip_prefix('"')?.strip_suffix('"')?;
    if value.contains('"') {
        return None;
    }
    Some((key.to_string(), value.to_string()))
}

impl fmt::Display for AttributeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.clauses.iter().enumerate() {
            if i > 0 {
                f.write_str(CONJUNCTION)?;
            }
            write!(f, "{ATTRIBUTE_PREFIX}{key} = \"{value}\"")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::AttributeFilter;
    use crate::adapter::TransportError;
    use courier_core::Attributes;

    fn attrs(pairs: &[(&str, &str)]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn display_uses_server_side_syntax() {
        let filter = AttributeFilter::new()
            .eq("shard_index", "2")
            .eq("session_id", "7");
        assert_eq!(
            filter.to_string(),
            "attributes.shard_index = \"2\" AND attributes.session_id = \"7\""
        );
    }

    #[test]
    fn parse_accepts_rendered_expression() {
        let filter = AttributeFilter::new()
            .eq("shard_index", "2")
            .eq("session_id", "7");
        let parsed = AttributeFilter::parse(&filter.to_string()).expect("parse");
        assert_eq!(parsed, filter);
    }

    #[test]
    fn parse_tolerates_whitespace_and_empty_expression() {
        let parsed =
            AttributeFilter::parse("  attributes.kernel_id=\"echo\"  ").expect("parse");
        assert_eq!(parsed.clauses(), &[("kernel_id".into(), "echo".into())]);
        assert!(AttributeFilter::parse("").expect("parse").is_empty());
    }

    #[test]
    fn parse_rejects_unsupported_clauses() {
        for bad in [
            "shard_index = \"2\"",
            "attributes.shard_index = 2",
            "attributes.shard_index != \"2\"",
            "attributes. = \"2\"",
            "attributes.a = \"1\" OR attributes.b = \"2\"",
        ] {
            assert!(
                matches!(
                    AttributeFilter::parse(bad),
                    Err(TransportError::InvalidFilter(_))
                ),
                "expected rejection for {bad}"
            );
        }
    }

    #[test]
    fn matches_requires_every_clause() {
        let filter = AttributeFilter::new()
            .eq("shard_index", "2")
            .eq("session_id", "7");
        assert!(filter.matches(&attrs(&[
            ("shard_index", "2"),
            ("session_id", "7"),
            ("request_id", "r")
        ])));
        assert!(!filter.matches(&attrs(&[("shard_index", "2"), ("session_id", "8")])));
        assert!(!filter.matches(&attrs(&[("shard_index", "2")])));
        assert!(AttributeFilter::new().matches(&attrs(&[])));
    }
}
