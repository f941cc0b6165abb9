use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vigil_core::UnitMetadata;

/// Optional candidate filters, combined with AND.
///
/// Unset fields (and empty lists) do not filter.
///
/// # Examples
///
/// ```
/// use vigil_batch::filter::UnitFilter;
/// use vigil_core::UnitMetadata;
///
/// let filter = UnitFilter {
///     author: Some("ali".into()),
///     labels: vec!["security".into()],
///     ..UnitFilter::default()
/// };
/// let unit = UnitMetadata {
///     author: "Alice".into(),
///     labels: vec!["security".into(), "backend".into()],
///     ..UnitMetadata::default()
/// };
/// assert!(filter.matches(&unit));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitFilter {
    /// Case-insensitive substring of the author's username.
    #[serde(default)]
    pub author: Option<String>,
    /// Keep units carrying at least one of these labels.
    #[serde(default)]
    pub labels: Vec<String>,
    /// Keep units whose title or description contains any keyword (case-insensitive).
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Keep units created at or after this instant.
    #[serde(default)]
    pub created_after: Option<DateTime<Utc>>,
}

impl UnitFilter {
    /// Returns `true` if no criterion is set.
    pub fn is_empty(&self) -> bool {
        self.author.is_none()
            && self.labels.is_empty()
            && self.keywords.is_empty()
            && self.created_after.is_none()
    }

    /// Returns `true` if `unit` satisfies every set criterion.
    pub fn matches(&self, unit: &UnitMetadata) -> bool {
        if let Some(author) = &self.author {
            if !unit.author.to_lowercase().contains(&author.to_lowercase()) {
                return false;
            }
        }
        if !self.labels.is_empty() && !unit.has_any_label(&self.labels) {
            return false;
        }
        if !self.keywords.is_empty() {
            let title = unit.title.to_lowercase();
            let description = unit.description.to_lowercase();
            let hit = self.keywords.iter().any(|kw| {
                let kw = kw.to_lowercase();
                title.contains(&kw) || description.contains(&kw)
            });
            if !hit {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if unit.created_at < after {
                return false;
            }
        }
        true
    }

    /// Keep the units that match, preserving order.
    pub fn apply(&self, units: Vec<UnitMetadata>) -> Vec<UnitMetadata> {
        if self.is_empty() {
            return units;
        }
        units.into_iter().filter(|u| self.matches(u)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn unit(id: u64, author: &str, labels: &[&str]) -> UnitMetadata {
        UnitMetadata {
            id,
            author: author.into(),
            labels: labels.iter().map(|l| l.to_string()).collect(),
            ..UnitMetadata::default()
        }
    }

    #[test]
    fn criteria_are_conjunctive() {
        let units = vec![
            unit(1, "alice", &["security"]),
            unit(2, "alice", &["docs"]),
            unit(3, "bob", &["security"]),
        ];
        let filter = UnitFilter {
            author: Some("alice".into()),
            labels: vec!["security".into()],
            ..UnitFilter::default()
        };
        let kept: Vec<u64> = filter.apply(units).iter().map(|u| u.id).collect();
        assert_eq!(kept, vec![1]);
    }

    #[test]
    fn empty_filter_keeps_everything() {
        let units = vec![unit(1, "a", &[]), unit(2, "b", &["x"])];
        assert!(UnitFilter::default().is_empty());
        assert_eq!(UnitFilter::default().apply(units.clone()), units);
    }

    #[test]
    fn keywords_search_title_and_description() {
        let filter = UnitFilter {
            keywords: vec!["Auth".into(), "cache".into()],
            ..UnitFilter::default()
        };
        let by_title = UnitMetadata {
            title: "Fix auth redirect".into(),
            ..UnitMetadata::default()
        };
        let by_description = UnitMetadata {
            title: "Speedup".into(),
            description: "Adds a CACHE layer".into(),
            ..UnitMetadata::default()
        };
        let neither = UnitMetadata {
            title: "Docs".into(),
            ..UnitMetadata::default()
        };
        assert!(filter.matches(&by_title));
        assert!(filter.matches(&by_description));
        assert!(!filter.matches(&neither));
    }

    #[test]
    fn created_after_is_inclusive() {
        let cutoff = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let filter = UnitFilter {
            created_after: Some(cutoff),
            ..UnitFilter::default()
        };
        let at = UnitMetadata {
            created_at: cutoff,
            ..UnitMetadata::default()
        };
        let before = UnitMetadata {
            created_at: Utc.with_ymd_and_hms(2024, 2, 28, 23, 59, 59).unwrap(),
            ..UnitMetadata::default()
        };
        assert!(filter.matches(&at));
        assert!(!filter.matches(&before));
    }

    #[test]
    fn author_match_is_case_insensitive_substring() {
        let filter = UnitFilter {
            author: Some("BO".into()),
            ..UnitFilter::default()
        };
        assert!(filter.matches(&unit(1, "robot", &[])));
        assert!(!filter.matches(&unit(2, "alice", &[])));
    }
}
