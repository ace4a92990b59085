//! Scholarly object identifiers (DOIs, arXiv ids, URLs, ...).

use std::fmt;

use serde::{Deserialize, Serialize};

/// A `(scheme, value)` pair naming a scholarly object.
///
/// Schemes are stored lower-cased and both parts are trimmed, so `DOI` and
/// `doi` name the same identifier. Identifiers are immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "IDScheme")]
    pub scheme: String,
    #[serde(rename = "ID")]
    pub value: String,
}

impl Identifier {
    /// Create a normalized identifier.
    ///
    /// # Example
    ///
    /// ```
    /// use broker_shared::Identifier;
    ///
    /// let id = Identifier::new("DOI", " 10.1234/abc ");
    /// assert_eq!(id.scheme, "doi");
    /// assert_eq!(id.value, "10.1234/abc");
    /// ```
    pub fn new(scheme: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into().trim().to_lowercase(),
            value: value.into().trim().to_string(),
        }
    }

    /// Shorthand for a DOI identifier.
    pub fn doi(value: impl Into<String>) -> Self {
        Self::new("doi", value)
    }

    /// Re-apply normalization, e.g. after deserializing untrusted input.
    pub fn normalized(self) -> Self {
        Self::new(self.scheme, self.value)
    }

    /// An identifier with an empty scheme or value cannot be recorded.
    pub fn is_blank(&self) -> bool {
        self.scheme.is_empty() || self.value.is_empty()
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scheme, self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheme_is_case_insensitive() {
        assert_eq!(Identifier::new("DOI", "10.1/a"), Identifier::doi("10.1/a"));
    }

    #[test]
    fn test_blank_identifiers() {
        assert!(Identifier::new("doi", "  ").is_blank());
        assert!(Identifier::new("", "10.1/a").is_blank());
        assert!(!Identifier::doi("10.1/a").is_blank());
    }

    #[test]
    fn test_wire_shape() {
        let id: Identifier =
            serde_json::from_str(r#"{"ID": "10.1/a", "IDScheme": "DOI"}"#).unwrap();
        assert_eq!(id.normalized(), Identifier::doi("10.1/a"));
    }

    #[test]
    fn test_display() {
        assert_eq!(Identifier::new("arXiv", "1234.5678").to_string(), "arxiv:1234.5678");
    }
}
