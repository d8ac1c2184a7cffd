//! Block/allow decisions for queried domains.
//!
//! The blocklist itself is owned by the host: it publishes whole
//! [`FilterSnapshot`]s and the engine only ever reads a complete one.

pub mod rules;

use arc_swap::ArcSwap;
use rustc_hash::FxHashSet;
use std::sync::Arc;

use crate::logger::{self, BreadcrumbFlags};
pub use rules::{RuleAction, RuleSet};

/// Lowercase blocked domains.
pub type BlockSet = FxHashSet<String>;

pub const DEFAULT_MAX_ANCESTOR_DEPTH: usize = 5;

/// Substrings that mark a domain as adult content.
pub const DEFAULT_KEYWORDS: &[&str] = &[
    "porn", "xxx", "sex", "nude", "naked", "hentai", "nsfw", "escort", "erotic", "fetish",
    "camgirl", "adult",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    Exact,
    Ancestor,
    Keyword,
    Rule,
}

impl BlockReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Ancestor => "ancestor",
            Self::Keyword => "keyword",
            Self::Rule => "rule",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Block(BlockReason),
}

impl Decision {
    pub fn is_blocked(self) -> bool {
        matches!(self, Self::Block(_))
    }
}

/// Normalizes a blocklist line: trims, drops a trailing dot, lowercases.
/// Blank lines and `#` comments yield `None`.
pub fn normalize_domain(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    let trimmed = trimmed.trim_end_matches('.');
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.to_ascii_lowercase())
}

/// One immutable generation of filter inputs.
#[derive(Debug, Clone)]
pub struct FilterSnapshot {
    pub domains: Arc<BlockSet>,
    /// Intended to gate keyword matching; keyword matching currently runs
    /// regardless of this flag.
    pub strict: bool,
    pub keywords: Arc<[String]>,
}

impl Default for FilterSnapshot {
    fn default() -> Self {
        Self {
            domains: Arc::new(BlockSet::default()),
            strict: false,
            keywords: DEFAULT_KEYWORDS.iter().map(|kw| kw.to_string()).collect(),
        }
    }
}

impl FilterSnapshot {
    pub fn new<I, S>(domains: I, strict: bool, keywords: &[String]) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let domains = domains
            .into_iter()
            .filter_map(|raw| normalize_domain(raw.as_ref()))
            .collect();
        let keywords = keywords
            .iter()
            .map(|kw| kw.trim().to_ascii_lowercase())
            .filter(|kw| !kw.is_empty())
            .collect();
        Self {
            domains: Arc::new(domains),
            strict,
            keywords,
        }
    }

    pub fn classify(&self, domain: &str, max_depth: usize) -> Option<BlockReason> {
        classify(domain, &self.domains, self.strict, &self.keywords, max_depth)
    }
}

/// Structural then keyword match.
///
/// Ancestors are found by stripping the leftmost label at most `max_depth`
/// times, so `a.b.example.com` reaches `example.com` after two strips.
pub fn classify(
    domain: &str,
    block_set: &BlockSet,
    _strict_mode: bool,
    keywords: &[String],
    max_depth: usize,
) -> Option<BlockReason> {
    if block_set.contains(domain) {
        return Some(BlockReason::Exact);
    }
    let mut current = domain;
    for _ in 0..max_depth {
        let Some(dot) = current.find('.') else {
            break;
        };
        current = &current[dot + 1..];
        if current.is_empty() {
            break;
        }
        if block_set.contains(current) {
            return Some(BlockReason::Ancestor);
        }
    }
    if keywords
        .iter()
        .any(|kw| !kw.is_empty() && domain.contains(kw.as_str()))
    {
        return Some(BlockReason::Keyword);
    }
    None
}

/// `true` iff `domain`, one of its first five ancestors, or a keyword matches.
pub fn should_block(
    domain: &str,
    block_set: &BlockSet,
    strict_mode: bool,
    keywords: &[String],
) -> bool {
    classify(
        domain,
        block_set,
        strict_mode,
        keywords,
        DEFAULT_MAX_ANCESTOR_DEPTH,
    )
    .is_some()
}

/// What the host must provide to the filter.
pub trait BlocklistProvider: Send + Sync {
    /// Current complete snapshot.
    fn snapshot(&self) -> Arc<FilterSnapshot>;

    /// Ask the host to refetch its lists. Fire-and-forget.
    fn request_refresh(&self) {}
}

type RefreshHook = Box<dyn Fn() + Send + Sync>;

/// Host-fed provider: the host publishes, the read loop loads.
pub struct SharedBlocklist {
    current: ArcSwap<FilterSnapshot>,
    refresh: Option<RefreshHook>,
}

impl Default for SharedBlocklist {
    fn default() -> Self {
        Self::new(FilterSnapshot::default())
    }
}

impl SharedBlocklist {
    pub fn new(initial: FilterSnapshot) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
            refresh: None,
        }
    }

    pub fn with_refresh_hook(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.refresh = Some(Box::new(hook));
        self
    }

    /// Replaces the whole snapshot.
    pub fn publish(&self, snapshot: FilterSnapshot) {
        log_published(&snapshot);
        self.current.store(Arc::new(snapshot));
    }

    /// Publishes a new domain set, keeping the current keywords.
    pub fn publish_domains<I, S>(&self, domains: I, strict: bool)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let fresh = FilterSnapshot::new(domains, strict, &[]);
        // rcu may retry the closure, so the set is built once above.
        let previous = self.current.rcu(|current| FilterSnapshot {
            domains: Arc::clone(&fresh.domains),
            strict,
            keywords: Arc::clone(&current.keywords),
        });
        log_published(&FilterSnapshot {
            keywords: Arc::clone(&previous.keywords),
            ..fresh
        });
    }

    /// Publishes new keywords, keeping the current domains and mode.
    pub fn publish_keywords(&self, keywords: &[String]) {
        let fresh = FilterSnapshot::new(Vec::<String>::new(), false, keywords);
        let previous = self.current.rcu(|current| FilterSnapshot {
            domains: Arc::clone(&current.domains),
            strict: current.strict,
            keywords: Arc::clone(&fresh.keywords),
        });
        log_published(&FilterSnapshot {
            domains: Arc::clone(&previous.domains),
            strict: previous.strict,
            ..fresh
        });
    }
}

fn log_published(snapshot: &FilterSnapshot) {
    logger::breadcrumb(
        BreadcrumbFlags::FILTER,
        format!(
            "blocklist published ({} domains, {} keywords, strict={})",
            snapshot.domains.len(),
            snapshot.keywords.len(),
            snapshot.strict
        ),
    );
}

impl BlocklistProvider for SharedBlocklist {
    fn snapshot(&self) -> Arc<FilterSnapshot> {
        self.current.load_full()
    }

    fn request_refresh(&self) {
        if let Some(hook) = &self.refresh {
            hook();
        }
    }
}

/// Per-session decision maker: host rules first, then the snapshot.
pub struct FilterEngine {
    provider: Arc<dyn BlocklistProvider>,
    rules: Arc<RuleSet>,
    max_depth: usize,
}

impl FilterEngine {
    pub fn new(provider: Arc<dyn BlocklistProvider>, rules: Arc<RuleSet>, max_depth: usize) -> Self {
        Self {
            provider,
            rules,
            max_depth,
        }
    }

    pub fn decide(&self, domain: &str) -> Decision {
        match self.rules.match_host(domain) {
            Some(RuleAction::Block) => return Decision::Block(BlockReason::Rule),
            Some(RuleAction::Allow) => return Decision::Allow,
            None => {}
        }
        let snapshot = self.provider.snapshot();
        match snapshot.classify(domain, self.max_depth) {
            Some(reason) => Decision::Block(reason),
            None => Decision::Allow,
        }
    }

    pub fn provider(&self) -> &Arc<dyn BlocklistProvider> {
        &self.provider
    }
}
