//! Transfer rules: model, validation, and the pure predicates the rule
//! engine applies to each candidate file.
//!
//! Rules are loaded once at startup, validated, and then treated as
//! immutable for the lifetime of the process.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::CoreError;
use crate::types::Timestamp;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Shortest accepted scan interval.
pub const MIN_SCAN_INTERVAL_SECS: u64 = 1;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// What to do when a same-named file already exists at the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    /// Leave both files alone until one of them changes.
    #[default]
    Skip,
    /// Remove the destination file just before the move.
    Overwrite,
}

/// Which file timestamp a [`DateFilter`] inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateField {
    Accessed,
    Modified,
    Created,
}

/// How a [`DateFilter`] compares a file's age with its threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateComparator {
    /// Matches when the file is at least `minutes` old.
    OlderThan,
    /// Matches when the file is at most `minutes` old.
    WithinLast,
}

// ---------------------------------------------------------------------------
// DateFilter
// ---------------------------------------------------------------------------

/// Predicate on one of a file's timestamps relative to "now".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateFilter {
    pub field: DateField,
    pub comparator: DateComparator,
    pub minutes: u64,
}

impl DateFilter {
    /// Evaluate the filter for a file timestamp.
    ///
    /// A timestamp in the future counts as age zero.
    pub fn matches(&self, file_time: Timestamp, now: Timestamp) -> bool {
        let age_secs = (now - file_time).num_seconds().max(0) as u64;
        let threshold_secs = self.minutes.saturating_mul(60);
        match self.comparator {
            DateComparator::OlderThan => age_secs >= threshold_secs,
            DateComparator::WithinLast => age_secs <= threshold_secs,
        }
    }
}

// ---------------------------------------------------------------------------
// Rule
// ---------------------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_scan_interval() -> u64 {
    60
}

/// One file-movement task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct Rule {
    /// Unique rule name, also stored on every ledger row.
    #[validate(length(min = 1, max = 128))]
    pub name: String,
    pub source: PathBuf,
    pub destination: PathBuf,
    /// Lowercase extensions without the leading dot.
    #[serde(default)]
    pub extensions: Vec<String>,
    /// Match every file regardless of extension. Requires a date filter.
    #[serde(default)]
    pub match_all: bool,
    #[serde(default = "default_scan_interval")]
    #[validate(range(min = 1))]
    pub scan_interval_secs: u64,
    #[serde(default)]
    pub collision_policy: CollisionPolicy,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub date_filter: Option<DateFilter>,
    /// Ask the peer for permission before every move of this rule.
    #[serde(default)]
    pub require_approval: bool,
}

impl Rule {
    /// The rule's cadence.
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs.max(MIN_SCAN_INTERVAL_SECS))
    }

    /// Whether a file name is a candidate for this rule.
    ///
    /// Extension comparison is case-insensitive. Files without an
    /// extension only match match-all rules.
    pub fn matches_name(&self, file_name: &str) -> bool {
        if self.match_all {
            return true;
        }
        match file_extension(file_name) {
            Some(ext) => self.extensions.iter().any(|e| e.eq_ignore_ascii_case(&ext)),
            None => false,
        }
    }
}

/// Lowercased extension of a file name, without the dot.
pub fn file_extension(file_name: &str) -> Option<String> {
    let (stem, ext) = file_name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Normalise a configured extension list: trim, drop the leading dot,
/// lowercase, de-duplicate preserving order.
pub fn normalize_extensions(extensions: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    extensions
        .iter()
        .map(|e| e.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|e| !e.is_empty())
        .filter(|e| seen.insert(e.clone()))
        .collect()
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a single rule and normalise its extension list in place.
///
/// Rules:
/// - Field constraints from the `Validate` derive (name length, interval).
/// - Source and destination must be non-empty and differ.
/// - A match-all rule must carry a date filter.
/// - A rule that is not match-all must list at least one extension.
pub fn validate_rule(rule: &mut Rule) -> Result<(), CoreError> {
    rule.validate()
        .map_err(|e| CoreError::Validation(format!("Rule '{}': {e}", rule.name)))?;

    if rule.source.as_os_str().is_empty() || rule.destination.as_os_str().is_empty() {
        return Err(CoreError::Validation(format!(
            "Rule '{}': source and destination must not be empty",
            rule.name
        )));
    }
    if rule.source == rule.destination {
        return Err(CoreError::Validation(format!(
            "Rule '{}': source and destination must differ",
            rule.name
        )));
    }
    if rule.match_all && rule.date_filter.is_none() {
        return Err(CoreError::Validation(format!(
            "Rule '{}': match-all rules require a date filter",
            rule.name
        )));
    }

    rule.extensions = normalize_extensions(&rule.extensions);
    if !rule.match_all && rule.extensions.is_empty() {
        return Err(CoreError::Validation(format!(
            "Rule '{}': at least one extension is required unless match_all is set",
            rule.name
        )));
    }
    Ok(())
}

/// Validate a full rule set, including name uniqueness.
pub fn validate_rules(rules: &mut [Rule]) -> Result<(), CoreError> {
    let mut names = HashSet::new();
    for rule in rules.iter_mut() {
        validate_rule(rule)?;
        if !names.insert(rule.name.to_lowercase()) {
            return Err(CoreError::Conflict(format!(
                "Duplicate rule name '{}'",
                rule.name
            )));
        }
    }
    Ok(())
}

/// Parse and validate a JSON rule list.
pub fn parse_rules(json: &str) -> Result<Vec<Rule>, CoreError> {
    let mut rules: Vec<Rule> = serde_json::from_str(json)
        .map_err(|e| CoreError::Validation(format!("Malformed rules: {e}")))?;
    validate_rules(&mut rules)?;
    Ok(rules)
}

/// Active rules in activation order: specific-extension rules first, then
/// match-all rules, otherwise preserving configuration order.
pub fn activation_order(rules: &[Rule]) -> Vec<Rule> {
    let mut active: Vec<Rule> = rules.iter().filter(|r| r.active).cloned().collect();
    active.sort_by_key(|r| r.match_all);
    active
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chrono::{Duration as ChronoDuration, Utc};

    use super::*;

    fn rule(name: &str) -> Rule {
        Rule {
            name: name.to_string(),
            source: PathBuf::from("/in"),
            destination: PathBuf::from("/out"),
            extensions: vec!["txt".to_string()],
            match_all: false,
            scan_interval_secs: 30,
            collision_policy: CollisionPolicy::Skip,
            active: true,
            date_filter: None,
            require_approval: false,
        }
    }

    fn older_than(minutes: u64) -> DateFilter {
        DateFilter {
            field: DateField::Modified,
            comparator: DateComparator::OlderThan,
            minutes,
        }
    }

    #[test]
    fn extension_match_is_case_insensitive() {
        let r = rule("docs");
        assert!(r.matches_name("a.txt"));
        assert!(r.matches_name("REPORT.TXT"));
        assert!(!r.matches_name("a.pdf"));
        assert!(!r.matches_name("txt"));
        assert!(!r.matches_name(".txt"));
    }

    #[test]
    fn match_all_matches_everything() {
        let mut r = rule("all");
        r.match_all = true;
        assert!(r.matches_name("noext"));
        assert!(r.matches_name("x.bin"));
    }

    #[test]
    fn normalize_strips_dots_and_duplicates() {
        let input = vec![".TXT".into(), "txt".into(), " pdf ".into(), "".into()];
        assert_eq!(normalize_extensions(&input), vec!["txt", "pdf"]);
    }

    #[test]
    fn match_all_without_date_filter_is_rejected() {
        let mut r = rule("all");
        r.match_all = true;
        r.extensions.clear();
        assert_matches!(validate_rule(&mut r), Err(CoreError::Validation(_)));

        r.date_filter = Some(older_than(10));
        assert!(validate_rule(&mut r).is_ok());
    }

    #[test]
    fn empty_name_is_rejected() {
        let mut r = rule("");
        assert_matches!(validate_rule(&mut r), Err(CoreError::Validation(_)));
    }

    #[test]
    fn same_source_and_destination_is_rejected() {
        let mut r = rule("loop");
        r.destination = r.source.clone();
        assert_matches!(validate_rule(&mut r), Err(CoreError::Validation(_)));
    }

    #[test]
    fn duplicate_names_conflict() {
        let mut rules = vec![rule("Docs"), rule("docs")];
        assert_matches!(validate_rules(&mut rules), Err(CoreError::Conflict(_)));
    }

    #[test]
    fn parse_rules_applies_defaults() {
        let json = r#"[{"name":"Docs","source":"/s","destination":"/d","extensions":[".TXT"]}]"#;
        let rules = parse_rules(json).unwrap();
        assert_eq!(rules[0].extensions, vec!["txt"]);
        assert_eq!(rules[0].scan_interval_secs, 60);
        assert_eq!(rules[0].collision_policy, CollisionPolicy::Skip);
        assert!(rules[0].active);
    }

    #[test]
    fn activation_puts_match_all_last_and_drops_inactive() {
        let mut catch_all = rule("catch");
        catch_all.match_all = true;
        catch_all.date_filter = Some(older_than(5));
        let mut inactive = rule("off");
        inactive.active = false;

        let ordered = activation_order(&[catch_all, rule("a"), inactive, rule("b")]);
        let names: Vec<_> = ordered.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "catch"]);
    }

    #[test]
    fn older_than_matches_only_after_threshold() {
        let filter = older_than(60);
        let now = Utc::now();
        assert!(!filter.matches(now - ChronoDuration::minutes(30), now));
        assert!(filter.matches(now - ChronoDuration::minutes(60), now));
        assert!(filter.matches(now - ChronoDuration::minutes(90), now));
    }

    #[test]
    fn within_last_matches_recent_files() {
        let filter = DateFilter {
            field: DateField::Created,
            comparator: DateComparator::WithinLast,
            minutes: 15,
        };
        let now = Utc::now();
        assert!(filter.matches(now - ChronoDuration::minutes(5), now));
        assert!(!filter.matches(now - ChronoDuration::minutes(16), now));
        // Future timestamps count as brand new.
        assert!(filter.matches(now + ChronoDuration::minutes(5), now));
    }
}
