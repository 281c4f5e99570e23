//! Typed construction of engine list filters.

use std::collections::HashMap;

/// Filter map for container and image listings, `{"status": ["running"]}`.
///
/// Entries can be added inactive, in which case they are skipped; this keeps
/// call sites that toggle a filter on a flag free of branching.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filters {
    entries: Vec<(String, String, bool)>,
}

impl Filters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single active `name=value` filter.
    pub fn single(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new().with(name, value)
    }

    pub fn with(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.with_active(name, value, true)
    }

    pub fn with_active(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
        active: bool,
    ) -> Self {
        self.entries.push((name.into(), value.into(), active));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|(_, _, active)| !active)
    }

    /// The map bollard's list options expect.
    pub fn to_map(&self) -> HashMap<String, Vec<String>> {
        let mut map: HashMap<String, Vec<String>> = HashMap::new();
        for (name, value, _) in self.entries.iter().filter(|(_, _, active)| *active) {
            let values = map.entry(name.clone()).or_default();
            if !values.contains(value) {
                values.push(value.clone());
            }
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_values_and_skips_inactive() {
        let filters = Filters::single("status", "running")
            .with("status", "paused")
            .with("status", "running")
            .with("ancestor", "app:1")
            .with_active("label", "tier=web", false);

        let map = filters.to_map();
        assert_eq!(map.len(), 2);
        assert_eq!(map["status"], ["running", "paused"]);
        assert_eq!(map["ancestor"], ["app:1"]);
        assert!(!filters.is_empty());
    }

    #[test]
    fn only_inactive_entries_is_empty() {
        let filters = Filters::new().with_active("dangling", "true", false);
        assert!(filters.is_empty());
        assert!(filters.to_map().is_empty());
    }
}
