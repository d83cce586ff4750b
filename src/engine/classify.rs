//! Error classification: stored regex rules, then a fixed keyword table.
//!
//! Pure functions over the message text, no DB or async dependencies.

use regex::{Regex, RegexBuilder};

use crate::db::models::ClassificationRule;

/// Category assigned when nothing else matches.
pub const DEFAULT_CATEGORY: &str = "application";
/// Category for messages that read as informational output.
pub const INFO_CATEGORY: &str = "info";

/// Fallback keyword table. Iterated in this order; the first category with a
/// keyword contained in the lowercased message wins.
pub const KEYWORD_TABLE: &[(&str, &[&str])] = &[
    (
        "memory",
        &["memory", "oom", "out of memory", "oomkilled", "killed", "segmentation fault", "segfault"],
    ),
    (
        "network",
        &["connection", "network", "timeout", "refused", "unreachable", "dns", "resolve", "connect"],
    ),
    (
        "storage",
        &["disk", "storage", "space", "filesystem", "no space left", "quota", "volume"],
    ),
    (
        "kubernetes",
        &["kubernetes", "pod", "container", "deployment", "service", "namespace", "kubectl"],
    ),
    (
        "database",
        &["database", "sql", "query", "mysql", "postgres", "elasticsearch", "connection pool"],
    ),
    ("system", &["kernel", "system", "driver", "hardware", "cpu", "thermal"]),
    (
        "security",
        &["permission", "access", "denied", "unauthorized", "forbidden", "authentication"],
    ),
    (
        "configuration",
        &["config", "configuration", "invalid", "missing", "not found", "syntax error"],
    ),
];

const INFO_MARKERS: &[&str] = &["info", "debug", "trace"];

#[derive(Debug)]
struct CompiledRule {
    regex: Regex,
    category: String,
}

/// Classifier built once per detector lifecycle from the stored rules.
#[derive(Debug, Default)]
pub struct Classifier {
    rules: Vec<CompiledRule>,
}

impl Classifier {
    /// Compile `rules` in the order given. Rules with an invalid pattern are
    /// skipped with a warning.
    pub fn new(rules: &[ClassificationRule]) -> Self {
        let compiled = rules
            .iter()
            .filter(|r| r.enabled)
            .filter_map(|r| {
                match RegexBuilder::new(&r.pattern).case_insensitive(true).build() {
                    Ok(regex) => Some(CompiledRule {
                        regex,
                        category: r.category.clone(),
                    }),
                    Err(e) => {
                        tracing::warn!(rule_id = %r.id, pattern = %r.pattern, "Skipping invalid rule: {}", e);
                        None
                    }
                }
            })
            .collect();
        Self { rules: compiled }
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Assign exactly one category to `message`.
    pub fn classify(&self, message: &str) -> String {
        if let Some(rule) = self.rules.iter().find(|r| r.regex.is_match(message)) {
            return rule.category.clone();
        }
        classify_by_keywords(message).to_string()
    }
}

/// Keyword-table classification, with the informational and default fallbacks.
pub fn classify_by_keywords(message: &str) -> &'static str {
    let lower = message.to_lowercase();

    for (category, keywords) in KEYWORD_TABLE {
        if keywords.iter().any(|k| lower.contains(k)) {
            return category;
        }
    }

    if INFO_MARKERS.iter().any(|m| lower.contains(m)) {
        return INFO_CATEGORY;
    }

    DEFAULT_CATEGORY
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(pattern: &str, category: &str, priority: i64) -> ClassificationRule {
        ClassificationRule {
            id: format!("r-{priority}"),
            pattern: pattern.into(),
            category: category.into(),
            priority,
            description: None,
            enabled: true,
            created_at: String::new(),
        }
    }

    // --- keyword table ---

    #[test]
    fn test_oomkilled_is_memory() {
        assert_eq!(classify_by_keywords("OOMKilled: memory limit exceeded"), "memory");
    }

    #[test]
    fn test_connection_refused_is_network() {
        assert_eq!(classify_by_keywords("dial tcp 10.0.0.4:5432: connection refused"), "network");
    }

    #[test]
    fn test_table_order_breaks_ties() {
        // "disk" (storage) and "timeout" (network) both present; network comes first.
        assert_eq!(classify_by_keywords("disk probe timeout"), "network");
    }

    #[test]
    fn test_no_space_left_is_storage() {
        assert_eq!(classify_by_keywords("write failed: No space left on device"), "storage");
    }

    #[test]
    fn test_forbidden_is_security() {
        assert_eq!(classify_by_keywords("HTTP 403 Forbidden"), "security");
    }

    #[test]
    fn test_info_marker() {
        assert_eq!(classify_by_keywords("[INFO] flushed 12 segments"), INFO_CATEGORY);
    }

    #[test]
    fn test_default_application() {
        assert_eq!(classify_by_keywords("unexpected panic in handler"), DEFAULT_CATEGORY);
        assert_eq!(classify_by_keywords(""), DEFAULT_CATEGORY);
    }

    // --- stored rules ---

    #[test]
    fn test_rule_precedes_keywords_case_insensitive() {
        let c = Classifier::new(&[rule(r"crashloopbackoff", "kubernetes", 1)]);
        assert_eq!(c.classify("Pod api-7f9 in CrashLoopBackOff (out of memory)"), "kubernetes");
    }

    #[test]
    fn test_first_rule_in_order_wins() {
        let c = Classifier::new(&[
            rule(r"timeout", "upstream", 1),
            rule(r"gateway timeout", "gateway", 2),
        ]);
        assert_eq!(c.classify("504 Gateway Timeout"), "upstream");
    }

    #[test]
    fn test_invalid_rule_skipped() {
        let c = Classifier::new(&[rule(r"(unclosed", "broken", 1), rule(r"disk", "storage", 2)]);
        assert_eq!(c.rule_count(), 1);
        assert_eq!(c.classify("disk full"), "storage");
    }

    #[test]
    fn test_disabled_rule_ignored() {
        let mut r = rule(r"oom", "custom", 1);
        r.enabled = false;
        let c = Classifier::new(&[r]);
        assert_eq!(c.classify("oom killer invoked"), "memory");
    }
}
