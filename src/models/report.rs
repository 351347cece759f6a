//! Operator-facing run outcomes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One package whose harvest could not complete.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackageFailure {
    pub package_name: String,
    pub reason: String,
}

impl fmt::Display for PackageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.package_name, self.reason)
    }
}

/// Counts every completed run reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunCounts {
    pub packages_succeeded: usize,
    pub packages_failed: usize,
    /// Known only once the run's findings went through aggregation
    pub findings_quarantined: Option<usize>,
}

impl RunCounts {
    pub fn with_quarantined(self, quarantined: usize) -> Self {
        Self {
            findings_quarantined: Some(quarantined),
            ..self
        }
    }

    /// Key/value pairs for a log summary.
    pub fn summary_items(&self) -> Vec<(&'static str, String)> {
        let mut items = vec![
            ("Packages succeeded", self.packages_succeeded.to_string()),
            ("Packages failed", self.packages_failed.to_string()),
        ];
        if let Some(quarantined) = self.findings_quarantined {
            items.push(("Findings quarantined", quarantined.to_string()));
        }
        items
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_items_skip_unknown_quarantine() {
        let counts = RunCounts {
            packages_succeeded: 3,
            packages_failed: 1,
            findings_quarantined: None,
        };
        let keys: Vec<_> = counts.summary_items().iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, ["Packages succeeded", "Packages failed"]);

        let items = counts.with_quarantined(2).summary_items();
        assert_eq!(items[2], ("Findings quarantined", "2".to_string()));
    }
}
