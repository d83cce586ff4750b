//! Command safety policy.
//!
//! Applied to every action independently of its declared `safe` flag: the
//! denylist is evaluated first and always wins, then the read-only/idempotent
//! allowlist, then the declared flag.

use std::sync::LazyLock;

use regex::{Regex, RegexSet, RegexSetBuilder};

use crate::db::models::ActionSpec;

/// Destructive command patterns. Matched case-insensitively anywhere in the
/// command text.
const DENYLIST: &[&str] = &[
    // recursive delete: -r/-R anywhere in a short-flag cluster, or --recursive, in any position
    r"\brm\b[^;&|\n]*\s(-[a-z]*r[a-z]*|--recursive)\b",
    // rm against an absolute path
    r"\brm\s+(-[a-z-]+\s+)*/",
    // raw disk writes and partitioning
    r"\bdd\s+.*\bif=",
    r"\bmkfs(\.[a-z0-9]+)?\b",
    r"\bfdisk\b",
    r"(^|[;&|]\s*)format\b",
    // power state
    r"\b(shutdown|reboot|halt|poweroff)\b",
    // permission widening
    r"\bchmod\s+(-[a-z]+\s+)*0?777\b",
    r"\bchown\s+-r\b",
    // firewall flush
    r"\biptables\s+(-[a-z]+\s+)*-f\b",
    r"\bufw\s+--force\b",
    // destructive SQL
    r"\bdrop\s+(database|table)\b",
    r"\btruncate\s+table\b",
    r"\bdelete\s+from\b",
];

/// Prefixes of read-only or bounded idempotent commands.
const ALLOWLIST: &[&str] = &[
    "kubectl get",
    "kubectl describe",
    "kubectl logs",
    "kubectl rollout restart",
    "kubectl rollout status",
    "kubectl scale",
    "curl -s",
    "systemctl restart",
    "systemctl status",
    "docker restart",
    "helm upgrade",
];

/// Shell sequencing and substitution. An allowlisted prefix followed by one of
/// these could run anything, so such commands fall back to the declared flag.
const CHAINING: &[&str] = &[";", "&&", "||", "|", "`", "$(", "\n"];

#[allow(clippy::expect_used)]
static DENY_SET: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSetBuilder::new(DENYLIST)
        .case_insensitive(true)
        .build()
        .expect("valid denylist")
});

#[allow(clippy::expect_used)]
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyVerdict {
    /// Matched a destructive pattern. Never executed.
    Denied,
    /// Matched the allowlist.
    Allowed,
    /// Neither list matched; the action's own `safe` flag decided.
    Declared(bool),
}

impl SafetyVerdict {
    pub fn is_admitted(&self) -> bool {
        matches!(self, SafetyVerdict::Allowed | SafetyVerdict::Declared(true))
    }
}

pub fn evaluate(command: &str, declared_safe: bool) -> SafetyVerdict {
    if DENY_SET.is_match(command) {
        return SafetyVerdict::Denied;
    }

    let chained = CHAINING.iter().any(|c| command.contains(c));
    let normalized = WHITESPACE.replace_all(command.trim(), " ").to_lowercase();
    if !chained && ALLOWLIST.iter().any(|p| normalized.starts_with(p)) {
        return SafetyVerdict::Allowed;
    }

    SafetyVerdict::Declared(declared_safe)
}

/// Whether a single action may run under the safety policy.
pub fn is_admitted(action: &ActionSpec) -> bool {
    evaluate(&action.command, action.safe).is_admitted()
}

/// Split `actions` into the admitted ones (order preserved) and the commands
/// that were dropped.
pub fn partition(actions: &[ActionSpec]) -> (Vec<ActionSpec>, Vec<String>) {
    let mut admitted = Vec::with_capacity(actions.len());
    let mut rejected = Vec::new();
    for action in actions {
        let verdict = evaluate(&action.command, action.safe);
        if verdict.is_admitted() {
            admitted.push(action.clone());
        } else {
            tracing::warn!(command = %action.command, ?verdict, "Unsafe action dropped");
            rejected.push(action.command.clone());
        }
    }
    (admitted, rejected)
}
