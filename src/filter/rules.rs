//! Host-installed wildcard rules that override the published blocklist.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use wildmatch::WildMatch;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuleAction {
    Block,
    Allow,
}

#[derive(Clone, Debug)]
pub struct HostRule {
    pub id: u64,
    pub pattern: String,
    matcher: WildMatch,
    pub action: RuleAction,
}

pub struct RuleSet {
    rules: RwLock<Vec<HostRule>>,
    next_id: AtomicU64,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleSet {
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Installs `pattern` (`*` and `?` wildcards) and returns its id.
    pub fn install_rule(&self, pattern: &str, action: RuleAction) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let normalized = pattern.trim().trim_end_matches('.').to_ascii_lowercase();
        let rule = HostRule {
            id,
            matcher: WildMatch::new(&normalized),
            pattern: normalized,
            action,
        };
        self.rules.write().push(rule);
        id
    }

    pub fn remove_rule(&self, id: u64) -> bool {
        let mut guard = self.rules.write();
        let before = guard.len();
        guard.retain(|rule| rule.id != id);
        before != guard.len()
    }

    /// Newest matching rule wins. `host` must already be lowercase.
    pub fn match_host(&self, host: &str) -> Option<RuleAction> {
        let guard = self.rules.read();
        guard
            .iter()
            .rev()
            .find(|rule| rule.matcher.matches(host))
            .map(|rule| rule.action)
    }

    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.read().is_empty()
    }

    pub fn clear(&self) {
        self.rules.write().clear();
    }
}
