//! Domain and keyword rules.
//!
//! # Responsibilities
//! - Match hosts against blocked domains and their subdomains
//! - Scan path and query for blocked keywords
//! - Produce a decision with a human-readable reason

use std::collections::HashSet;

/// Why a request was blocked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    /// The host is, or is a subdomain of, this blocked domain.
    Domain(String),
    /// The path or query contains this blocked keyword.
    Keyword(String),
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockReason::Domain(domain) => write!(f, "domain {domain} is blacklisted"),
            BlockReason::Keyword(keyword) => write!(f, "keyword \"{keyword}\" is not allowed"),
        }
    }
}

/// Outcome of evaluating a request against the rule set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterDecision {
    Allow,
    Block(BlockReason),
}

impl FilterDecision {
    pub fn is_blocked(&self) -> bool {
        matches!(self, FilterDecision::Block(_))
    }

    pub fn reason(&self) -> Option<&BlockReason> {
        match self {
            FilterDecision::Allow => None,
            FilterDecision::Block(reason) => Some(reason),
        }
    }
}

/// Immutable blacklist of domains and keywords.
///
/// Built once at startup and shared read-only across connections.
#[derive(Debug, Clone, Default)]
pub struct FilterEngine {
    /// Lowercase domains without leading or trailing dots.
    domains: HashSet<String>,
    /// Lowercase, non-empty keywords.
    keywords: Vec<String>,
}

impl FilterEngine {
    /// Build a rule set, normalizing every entry.
    ///
    /// Blank entries are dropped. Domains may be written as `example.com`,
    /// `.example.com` or `*.example.com`; all three block the domain and its
    /// subdomains.
    pub fn new<D, K>(domains: D, keywords: K) -> Self
    where
        D: IntoIterator,
        D::Item: AsRef<str>,
        K: IntoIterator,
        K::Item: AsRef<str>,
    {
        let domains: HashSet<String> = domains
            .into_iter()
            .filter_map(|d| normalize_domain(d.as_ref()))
            .collect();

        let mut keywords: Vec<String> = keywords
            .into_iter()
            .map(|k| k.as_ref().trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        keywords.sort();
        keywords.dedup();

        tracing::debug!(
            domains = domains.len(),
            keywords = keywords.len(),
            "Filter rules compiled"
        );

        Self { domains, keywords }
    }

    pub fn domain_count(&self) -> usize {
        self.domains.len()
    }

    pub fn keyword_count(&self) -> usize {
        self.keywords.len()
    }

    /// Decide whether a request to `host` for `path_and_query` may pass.
    ///
    /// Pure: the same inputs always give the same decision.
    pub fn evaluate(&self, host: &str, path_and_query: &str) -> FilterDecision {
        if let Some(domain) = self.blocked_domain(host) {
            return FilterDecision::Block(BlockReason::Domain(domain.to_string()));
        }
        if let Some(keyword) = self.blocked_keyword(path_and_query) {
            return FilterDecision::Block(BlockReason::Keyword(keyword.to_string()));
        }
        FilterDecision::Allow
    }

    /// The blacklist entry matching `host` or one of its parent domains.
    fn blocked_domain(&self, host: &str) -> Option<&str> {
        if self.domains.is_empty() {
            return None;
        }
        let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
        if host.is_empty() {
            return None;
        }

        // sub.ads.example.com → ads.example.com → example.com → com
        let mut candidate = host.as_str();
        loop {
            if let Some(entry) = self.domains.get(candidate) {
                return Some(entry.as_str());
            }
            match candidate.split_once('.') {
                Some((_, parent)) if !parent.is_empty() => candidate = parent,
                _ => return None,
            }
        }
    }

    fn blocked_keyword(&self, path_and_query: &str) -> Option<&str> {
        if self.keywords.is_empty() {
            return None;
        }
        let haystack = path_and_query.to_lowercase();
        self.keywords
            .iter()
            .find(|keyword| haystack.contains(keyword.as_str()))
            .map(String::as_str)
    }
}

/// Lowercase a blacklist entry and strip wildcard and dot decorations.
pub(crate) fn normalize_domain(raw: &str) -> Option<String> {
    let domain = raw.trim();
    let domain = domain.strip_prefix("*.").unwrap_or(domain);
    let domain = domain.trim_start_matches('.').trim_end_matches('.');
    if domain.is_empty() {
        return None;
    }
    Some(domain.to_ascii_lowercase())
}
