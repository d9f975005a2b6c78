//! Index schema for indexed record stores.
//!
//! Maps an index name to the record field it covers. `upd`, `uid` and `gid`
//! are always indexed.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{CoreError, CoreResult};

/// Indexes every indexed store carries regardless of configuration.
pub const MANDATORY_INDEXES: [&str; 3] = ["upd", "uid", "gid"];

/// Checks that `name` is safe to splice into SQL as an identifier.
pub fn validate_identifier(name: &str) -> CoreResult<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidIdentifier(name.to_string()))
    }
}

/// Index name to record field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IndexSchema(BTreeMap<String, String>);

impl IndexSchema {
    /// Empty schema (mandatory indexes are still applied by [`IndexSchema::resolved`]).
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an index named `name` over `field`.
    pub fn with_index(mut self, name: impl Into<String>, field: impl Into<String>) -> Self {
        self.0.insert(name.into(), field.into());
        self
    }

    /// Adds an index whose name equals the field it covers.
    pub fn with_field(self, field: &str) -> Self {
        self.with_index(field, field)
    }

    /// Returns the configured indexes merged with [`MANDATORY_INDEXES`],
    /// after validating every identifier.
    pub fn resolved(&self) -> CoreResult<Vec<(String, String)>> {
        let mut all = self.0.clone();
        for field in MANDATORY_INDEXES {
            all.entry(field.to_string())
                .or_insert_with(|| field.to_string());
        }
        for (name, field) in &all {
            validate_identifier(name)?;
            validate_identifier(field)?;
        }
        Ok(all.into_iter().collect())
    }

    /// Field covered by index `name`, including mandatory ones.
    pub fn field_for(&self, name: &str) -> Option<&str> {
        self.0
            .get(name)
            .map(String::as_str)
            .or_else(|| MANDATORY_INDEXES.iter().copied().find(|m| *m == name))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for IndexSchema {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        IndexSchema(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("tasks_2024").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("tasks; DROP TABLE x").is_err());
        assert!(validate_identifier("a-b").is_err());
    }

    #[test]
    fn test_resolved_includes_mandatory() {
        let schema = IndexSchema::new().with_field("title");
        let names: Vec<_> = schema
            .resolved()
            .unwrap()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, vec!["gid", "title", "uid", "upd"]);
    }

    #[test]
    fn test_resolved_rejects_bad_field() {
        let schema = IndexSchema::new().with_index("by_title", "title'--");
        assert!(matches!(
            schema.resolved(),
            Err(CoreError::InvalidIdentifier(_))
        ));
    }

    #[test]
    fn test_field_for() {
        let schema: IndexSchema = [("by_owner", "owner")].into_iter().collect();
        assert_eq!(schema.field_for("by_owner"), Some("owner"));
        assert_eq!(schema.field_for("upd"), Some("upd"));
        assert_eq!(schema.field_for("missing"), None);
    }
}
