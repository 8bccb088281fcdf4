use std::collections::BTreeMap;

use tracing::debug;

use crate::error::ErrorKind;
use crate::game_constants::{ROSTER_FIELDS_14_2, RosterFields};
use crate::types::Version;

/// What a supported game version needs beyond its schema files.
#[derive(Debug, Clone, Copy)]
pub struct VersionSupport {
    /// Directory under the scripts root holding this version's schema.
    pub key: &'static str,
    pub roster: &'static RosterFields,
}

/// Maps schema keys (`13_0_0` or `13_0_0_7851390`) to the support data of
/// that version. Lookups happen before any packet is read.
#[derive(Debug, Default)]
pub struct VersionRegistry {
    versions: BTreeMap<&'static str, VersionSupport>,
}

impl VersionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Versions this crate ships handler and roster tables for.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        for key in ["13_0_0", "14_2_0"] {
            registry.register(VersionSupport {
                key,
                roster: &ROSTER_FIELDS_14_2,
            });
        }
        registry
    }

    pub fn register(&mut self, support: VersionSupport) {
        self.versions.insert(support.key, support);
    }

    pub fn keys(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.versions.keys().copied()
    }

    /// Exact build first, then the patch line.
    pub fn lookup(&self, version: &Version) -> Result<&VersionSupport, ErrorKind> {
        let full = version.to_schema_key();
        let short = version.to_short_schema_key();
        let support = self
            .versions
            .get(full.as_str())
            .or_else(|| self.versions.get(short.as_str()))
            .ok_or_else(|| ErrorKind::UnsupportedVersion(version.to_string()))?;
        debug!("version {} uses schema {}", version, support.key);
        Ok(support)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;

    #[test]
    fn build_specific_key_wins() {
        let mut registry = VersionRegistry::standard();
        registry.register(VersionSupport {
            key: "13_0_0_7851390",
            roster: &ROSTER_FIELDS_14_2,
        });

        let exact = registry.lookup(&Version::new(13, 0, 0, 7851390)).unwrap();
        assert_eq!(exact.key, "13_0_0_7851390");
        let other_build = registry.lookup(&Version::new(13, 0, 0, 1)).unwrap();
        assert_eq!(other_build.key, "13_0_0");
    }

    #[test]
    fn unknown_version_fails_before_decoding() {
        let err = VersionRegistry::standard()
            .lookup(&Version::new(0, 9, 1, 0))
            .unwrap_err();
        assert!(matches!(err, ErrorKind::UnsupportedVersion(_)));
        assert_eq!(err.category(), ErrorCategory::Schema);
        assert!(err.is_fatal(false));
    }

    #[test]
    fn standard_keys() {
        let keys: Vec<_> = VersionRegistry::standard().keys().collect();
        assert_eq!(keys, ["13_0_0", "14_2_0"]);
    }
}
