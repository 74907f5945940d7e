//! Security watchdog - URL access policy.
//!
//! Policy semantics:
//! - an explicit allow-list takes absolute precedence: when non-empty,
//!   only URLs matching it pass and the deny-list is not consulted;
//! - otherwise the deny-list blocks matches and everything else passes;
//! - internal placeholder pages are always permitted;
//! - with IP blocking on, any host that parses as an IPv4/IPv6 literal is
//!   blocked outright; a host that merely resembles an IP is an ordinary
//!   domain name.
//!
//! Matching is always against the parsed hostname, never the raw URL
//! text, which is what stops `user:pass@host` from smuggling a
//! disallowed host past a substring check.
//!
//! Lists with >= 100 entries are compacted into hash sets at
//! configuration time; compaction disables pattern semantics - a list
//! that size is a membership table, not a glob collection.

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use crate::cdp::client::Transport;
use crate::events::{BrowserEvent, Event, EventBus, EventType};
use crate::registry::SessionRegistry;
use crate::watchdog::{Watchdog, WatchdogError};

/// List size at which exact-set compaction kicks in.
pub const COMPACTION_THRESHOLD: usize = 100;

const INTERNAL_URLS: &[&str] = &[
    "about:blank",
    "chrome://new-tab-page/",
    "chrome://new-tab-page",
    "chrome://newtab/",
];

#[derive(Debug, Clone)]
enum DomainFilter {
    Empty,
    /// Small list: per-pattern matching with glob support.
    Patterns(Vec<String>),
    /// Compacted large list: exact host membership only.
    Exact(HashSet<String>),
}

impl DomainFilter {
    fn from_list(list: Vec<String>) -> Self {
        if list.is_empty() {
            DomainFilter::Empty
        } else if list.len() >= COMPACTION_THRESHOLD {
            DomainFilter::Exact(list.into_iter().map(|d| d.to_lowercase()).collect())
        } else {
            DomainFilter::Patterns(list)
        }
    }

    fn is_empty(&self) -> bool {
        matches!(self, DomainFilter::Empty)
    }
}

/// Immutable URL access policy, built once at configuration time.
#[derive(Debug, Clone)]
pub struct SecurityPolicy {
    allowed: DomainFilter,
    prohibited: DomainFilter,
    block_ip_addresses: bool,
}

impl SecurityPolicy {
    pub fn new(
        allowed_domains: Vec<String>,
        prohibited_domains: Vec<String>,
        block_ip_addresses: bool,
    ) -> Self {
        Self {
            allowed: DomainFilter::from_list(allowed_domains),
            prohibited: DomainFilter::from_list(prohibited_domains),
            block_ip_addresses,
        }
    }

    /// No restrictions.
    pub fn allow_all() -> Self {
        Self::new(Vec::new(), Vec::new(), false)
    }

    /// Deterministic verdict for one URL.
    pub fn is_url_allowed(&self, url: &str) -> bool {
        // (1) Internal placeholder pages bypass all policy.
        if INTERNAL_URLS.contains(&url) {
            return true;
        }

        let Some(parsed) = ParsedUrl::parse(url) else {
            return false;
        };

        // Data and blob payloads have no hostname to police.
        if matches!(parsed.scheme.as_str(), "data" | "blob") {
            return true;
        }

        if parsed.host.is_empty() {
            return false;
        }

        // (2) IP-literal blocking, independent of the domain lists.
        if self.block_ip_addresses && is_ip_literal(&parsed.host) {
            return false;
        }

        match (&self.allowed, &self.prohibited) {
            (DomainFilter::Empty, DomainFilter::Empty) => true,
            // Allow-list precedence: the deny-list is not consulted.
            (allowed, _) if !allowed.is_empty() => Self::filter_matches(allowed, &parsed),
            (_, prohibited) => !Self::filter_matches(prohibited, &parsed),
        }
    }

    fn filter_matches(filter: &DomainFilter, parsed: &ParsedUrl) -> bool {
        match filter {
            DomainFilter::Empty => false,
            DomainFilter::Exact(set) => {
                // Exact membership plus the www variant; no patterns.
                let (host, alt) = domain_variants(&parsed.host);
                set.contains(host) || set.contains(&alt)
            }
            DomainFilter::Patterns(patterns) => patterns
                .iter()
                .any(|pattern| url_matches_pattern(parsed, pattern)),
        }
    }
}

/// The pieces of a URL that policy evaluation needs. Host and scheme are
/// lowercased; credentials and port are stripped.
#[derive(Debug, Clone)]
struct ParsedUrl {
    scheme: String,
    host: String,
    path: String,
}

impl ParsedUrl {
    fn parse(url: &str) -> Option<Self> {
        if let Ok(parsed) = url::Url::parse(url) {
            let path = match parsed.query() {
                Some(q) => format!("{}?{}", parsed.path(), q),
                None => parsed.path().to_string(),
            };
            return Some(Self {
                scheme: parsed.scheme().to_string(),
                host: parsed.host_str().unwrap_or("").to_lowercase(),
                path,
            });
        }
        Self::parse_fallback(url)
    }

    /// Manual splitter for URLs the WHATWG parser rejects - notably
    /// hosts that resemble but fail to parse as IPv4 literals, which the
    /// policy must treat as ordinary domain names.
    fn parse_fallback(url: &str) -> Option<Self> {
        let (scheme, rest) = url.split_once("://")?;
        let (authority, path) = match rest.find(['/', '?', '#']) {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, ""),
        };
        // Strip credentials.
        let authority = authority.rsplit_once('@').map(|(_, h)| h).unwrap_or(authority);
        // Strip the port, minding bracketed IPv6.
        let host = if let Some(stripped) = authority.strip_prefix('[') {
            match stripped.find(']') {
                Some(i) => &authority[..i + 2],
                None => authority,
            }
        } else {
            match authority.rsplit_once(':') {
                Some((h, port)) if port.chars().all(|c| c.is_ascii_digit()) => h,
                _ => authority,
            }
        };
        if host.is_empty() {
            return None;
        }
        Some(Self {
            scheme: scheme.to_lowercase(),
            host: host.to_lowercase(),
            path: path.to_string(),
        })
    }

    /// Canonical `scheme://host` reconstruction, credentials gone.
    fn scheme_host(&self) -> String {
        format!("{}://{}", self.scheme, self.host)
    }
}

/// Both variants of a host: as given and with the `www.` prefix toggled.
fn domain_variants(host: &str) -> (&str, String) {
    match host.strip_prefix("www.") {
        Some(bare) => (host, bare.to_string()),
        None => (host, format!("www.{host}")),
    }
}

/// A plain root domain: exactly one dot, no scheme, no wildcard. Only
/// these get the implicit `www.` expansion - multi-label TLDs and
/// existing subdomains must be configured explicitly.
fn is_root_domain(pattern: &str) -> bool {
    if pattern.contains('*') || pattern.contains("://") {
        return false;
    }
    pattern.matches('.').count() == 1
}

/// Host parses as an IPv4/IPv6 literal (bracketed form for v6).
fn is_ip_literal(host: &str) -> bool {
    let bare = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    bare.parse::<IpAddr>().is_ok()
}

/// General glob match, `*` spanning any sequence.
fn wildcard_match(text: &str, pattern: &str) -> bool {
    let mut segments = pattern.split('*');
    let first = segments.next().unwrap_or("");
    if !text.starts_with(first) {
        return false;
    }
    let mut pos = first.len();

    let mut middle: Vec<&str> = segments.collect();
    let last = if pattern.ends_with('*') {
        None
    } else {
        middle.pop()
    };

    for segment in middle {
        if segment.is_empty() {
            continue;
        }
        match text[pos..].find(segment) {
            Some(i) => pos += i + segment.len(),
            None => return false,
        }
    }

    match last {
        Some(segment) => text.len() >= pos && text[pos..].ends_with(segment),
        None => true,
    }
}

/// Match one candidate URL against one pattern, in the documented rule
/// order.
fn url_matches_pattern(parsed: &ParsedUrl, pattern: &str) -> bool {
    let host = parsed.host.as_str();

    if pattern.contains('*') {
        if let Some(domain_part) = pattern.strip_prefix("*.") {
            // `*.example.com` covers the labelled domain and all its
            // subdomains, for web schemes only.
            let domain_part = domain_part.to_lowercase();
            return (host == domain_part || host.ends_with(&format!(".{domain_part}")))
                && matches!(parsed.scheme.as_str(), "http" | "https");
        }

        if pattern.ends_with("/*") {
            // `scheme://*` style: literal prefix on the canonical URL.
            let prefix = &pattern[..pattern.len() - 1];
            let canonical = format!("{}{}", parsed.scheme_host(), parsed.path);
            return canonical.starts_with(prefix);
        }

        // Other globs match the bare host, or scheme+host when the
        // pattern itself carries a scheme.
        let pattern = pattern.to_lowercase();
        return if pattern.contains("://") {
            wildcard_match(&parsed.scheme_host(), &pattern)
        } else {
            wildcard_match(host, &pattern)
        };
    }

    if let Some(scheme_split) = pattern.find("://") {
        // Scheme-qualified pattern: the candidate must start with this
        // exact scheme+host prefix, compared against the parsed
        // reconstruction so credentials in the raw text cannot smuggle a
        // different host through.
        let after = scheme_split + 3;
        let (pattern_authority, pattern_path) = match pattern[after..].find('/') {
            Some(i) => (&pattern[..after + i], &pattern[after + i..]),
            None => (pattern, ""),
        };
        if parsed.scheme_host() != pattern_authority.to_lowercase() {
            return false;
        }
        if pattern_path.is_empty() || pattern_path == "/" {
            return true;
        }
        return parsed.path.starts_with(pattern_path);
    }

    // Domain-only pattern, case-insensitive.
    let pattern = pattern.to_lowercase();
    if host == pattern {
        return true;
    }
    // Implicit www for plain root domains only.
    is_root_domain(&pattern) && host == format!("www.{pattern}")
}

/// Stateless policy enforcement point on the event bus.
pub struct SecurityWatchdog {
    policy: Arc<SecurityPolicy>,
    transport: Arc<dyn Transport>,
    registry: Arc<SessionRegistry>,
    bus: EventBus,
}

impl SecurityWatchdog {
    pub fn new(
        policy: Arc<SecurityPolicy>,
        transport: Arc<dyn Transport>,
        registry: Arc<SessionRegistry>,
        bus: EventBus,
    ) -> Self {
        Self {
            policy,
            transport,
            registry,
            bus,
        }
    }

    pub fn policy(&self) -> &SecurityPolicy {
        &self.policy
    }
}

#[async_trait]
impl Watchdog for SecurityWatchdog {
    fn name(&self) -> &'static str {
        "SecurityWatchdog"
    }

    fn interests(&self) -> &'static [EventType] {
        &[
            EventType::NavigationStarted,
            EventType::NavigationComplete,
            EventType::TabCreated,
        ]
    }

    async fn on_event(&self, event: &Event) -> Result<(), WatchdogError> {
        match &event.kind {
            BrowserEvent::NavigationStarted { url, target_id } => {
                // Backstop for navigations initiated outside the gated
                // entry point (link clicks, window.open).
                if !self.policy.is_url_allowed(url) {
                    tracing::warn!(
                        "[SecurityWatchdog] Navigation to disallowed URL started: {}",
                        url
                    );
                    self.bus.dispatch(BrowserEvent::BrowserError {
                        error_type: "NavigationBlocked".to_string(),
                        message: format!("Navigation blocked to disallowed URL: {url}"),
                        details: json!({ "url": url, "targetId": target_id }),
                    });
                }
            }
            BrowserEvent::NavigationComplete { url, target_id } => {
                // Catches redirects into blocked territory. The target is
                // pulled back to the internal blank page so the session
                // survives for the agent.
                if !self.policy.is_url_allowed(url) {
                    tracing::warn!(
                        "[SecurityWatchdog] Navigation to disallowed URL detected: {}",
                        url
                    );
                    self.bus.dispatch(BrowserEvent::BrowserError {
                        error_type: "NavigationBlocked".to_string(),
                        message: format!(
                            "Navigation blocked to disallowed URL: {url} - redirecting to about:blank"
                        ),
                        details: json!({ "url": url, "targetId": target_id }),
                    });

                    match self.registry.get_session_for_target(target_id) {
                        Some(session) => {
                            if let Err(e) = session.navigate("about:blank").await {
                                tracing::error!(
                                    "[SecurityWatchdog] Failed to redirect blocked target {}: {}",
                                    target_id,
                                    e
                                );
                            }
                        }
                        None => tracing::debug!(
                            "[SecurityWatchdog] Blocked target {} already gone",
                            target_id
                        ),
                    }
                }
            }
            BrowserEvent::TabCreated { url, target_id } => {
                if !self.policy.is_url_allowed(url) {
                    tracing::warn!(
                        "[SecurityWatchdog] New tab with disallowed URL: {}",
                        url
                    );
                    self.bus.dispatch(BrowserEvent::BrowserError {
                        error_type: "TabCreationBlocked".to_string(),
                        message: format!("Tab created with disallowed URL: {url}"),
                        details: json!({ "url": url, "targetId": target_id }),
                    });

                    if let Err(e) = self
                        .transport
                        .send(
                            "Target.closeTarget",
                            Some(json!({ "targetId": target_id })),
                            None,
                        )
                        .await
                    {
                        tracing::error!(
                            "[SecurityWatchdog] Failed to close disallowed tab {}: {}",
                            target_id,
                            e
                        );
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}
