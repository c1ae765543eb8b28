//! URL pattern matching and the per-script pattern index.
//!
//! Two grammars are supported, both behind the [`UrlPattern`] trait:
//!
//! - [`MatchPattern`]: `scheme://host/path` with restricted wildcards
//!   (`*://*.example.com/*`, `https://example.*/docs/*`, `<all_urls>`).
//! - [`GlobPattern`]: whole-URL globs where `*` matches anything
//!   (`http*://example.com/*`), or `/regex/` when delimited by slashes.
//!
//! [`PatternIndex`] keeps three independent sets per script (match, include,
//! exclude). Patterns with a literal host are bucketed under that host so a
//! query only evaluates scripts that could possibly select the URL.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use regex::{Regex, RegexBuilder};
use thiserror::Error;
use tracing::debug;
use url::Url;

use super::script::Script;
use super::ScriptId;

/// A pattern that could not be parsed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("'{pattern}': {reason}")]
pub struct PatternError {
    pub pattern: String,
    pub reason: String,
}

impl PatternError {
    fn new(pattern: &str, reason: impl Into<String>) -> Self {
        Self {
            pattern: pattern.to_string(),
            reason: reason.into(),
        }
    }
}

pub type PatternResult<T> = Result<T, PatternError>;

/// Capability shared by every pattern grammar.
pub trait UrlPattern: fmt::Debug + Send + Sync {
    /// The pattern as written by the script author.
    fn as_str(&self) -> &str;

    /// Whether the pattern selects `url`.
    fn selects(&self, url: &Url) -> bool;

    /// Lowercased host every selected URL is guaranteed to have (or be a
    /// subdomain of). `None` means the pattern can select any host.
    fn host_key(&self) -> Option<&str>;
}

/// Schemes a match pattern may name explicitly.
const MATCH_SCHEMES: &[&str] = &["http", "https", "file", "ftp", "ws", "wss"];

#[derive(Debug, Clone, PartialEq, Eq)]
enum SchemeMatch {
    /// `*` selects http and https.
    Web,
    /// `<all_urls>` selects every supported scheme.
    All,
    Exact(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum HostMatch {
    Any,
    Exact(String),
    /// `*.example.com`: the domain itself or any subdomain.
    Subdomain(String),
    /// `example.*`: the name followed by any suffix.
    AnySuffix(String),
    /// `*.example.*`: both of the above.
    SubdomainAnySuffix(String),
}

impl HostMatch {
    fn parse(pattern: &str, host: &str) -> PatternResult<Self> {
        if host == "*" {
            return Ok(HostMatch::Any);
        }

        let (leading, rest) = match host.strip_prefix("*.") {
            Some(rest) => (true, rest),
            None => (false, host),
        };
        let (trailing, name) = match rest.strip_suffix(".*") {
            Some(name) => (true, name),
            None => (false, rest),
        };

        if name.is_empty() || name.contains('*') {
            return Err(PatternError::new(
                pattern,
                "wildcards are only allowed at the start or end of the host",
            ));
        }

        let name = name.to_lowercase();
        Ok(match (leading, trailing) {
            (false, false) => HostMatch::Exact(name),
            (true, false) => HostMatch::Subdomain(name),
            (false, true) => HostMatch::AnySuffix(name),
            (true, true) => HostMatch::SubdomainAnySuffix(name),
        })
    }

    fn matches(&self, host: &str) -> bool {
        match self {
            HostMatch::Any => true,
            HostMatch::Exact(name) => host == name,
            HostMatch::Subdomain(name) => {
                host == name
                    || (host.len() > name.len()
                        && host.ends_with(name.as_str())
                        && host.as_bytes()[host.len() - name.len() - 1] == b'.')
            }
            HostMatch::AnySuffix(name) => has_suffix_after(host, name),
            HostMatch::SubdomainAnySuffix(name) => host_suffixes(host)
                .any(|suffix| has_suffix_after(suffix, name)),
        }
    }

    fn key(&self) -> Option<&str> {
        match self {
            HostMatch::Exact(name) | HostMatch::Subdomain(name) => Some(name),
            _ => None,
        }
    }
}

/// `host` is `name.` followed by at least one more character.
fn has_suffix_after(host: &str, name: &str) -> bool {
    host.len() > name.len() + 1
        && host.starts_with(name)
        && host.as_bytes()[name.len()] == b'.'
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PortMatch {
    Any,
    Exact(u16),
}

/// A `scheme://host/path` match pattern.
#[derive(Debug, Clone)]
pub struct MatchPattern {
    raw: String,
    scheme: SchemeMatch,
    host: HostMatch,
    port: PortMatch,
    path: Regex,
}

impl MatchPattern {
    pub fn parse(pattern: &str) -> PatternResult<Self> {
        let trimmed = pattern.trim();

        if trimmed == "<all_urls>" {
            return Ok(MatchPattern {
                raw: trimmed.to_string(),
                scheme: SchemeMatch::All,
                host: HostMatch::Any,
                port: PortMatch::Any,
                path: wildcard_regex(pattern, "*", false)?,
            });
        }

        let (scheme_str, rest) = trimmed
            .split_once("://")
            .ok_or_else(|| PatternError::new(pattern, "missing '://' separator"))?;

        let scheme = match scheme_str.to_lowercase().as_str() {
            "*" => SchemeMatch::Web,
            s if MATCH_SCHEMES.contains(&s) => SchemeMatch::Exact(s.to_string()),
            other => {
                return Err(PatternError::new(
                    pattern,
                    format!("unsupported scheme '{}'", other),
                ))
            }
        };

        let slash = rest
            .find('/')
            .ok_or_else(|| PatternError::new(pattern, "missing path"))?;
        let (authority, path) = rest.split_at(slash);

        let port_split = if authority.ends_with(']') {
            None
        } else {
            authority.rsplit_once(':')
        };
        let (host_str, port) = match port_split {
            Some((host, "*")) => (host, PortMatch::Any),
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| PatternError::new(pattern, format!("invalid port '{}'", port)))?;
                (host, PortMatch::Exact(port))
            }
            None => (authority, PortMatch::Any),
        };

        let host = if host_str.is_empty() {
            if scheme != SchemeMatch::Exact("file".to_string()) {
                return Err(PatternError::new(pattern, "empty host"));
            }
            HostMatch::Any
        } else {
            HostMatch::parse(pattern, host_str)?
        };

        Ok(MatchPattern {
            raw: trimmed.to_string(),
            scheme,
            host,
            port,
            path: wildcard_regex(pattern, path, false)?,
        })
    }

    fn scheme_selects(&self, scheme: &str) -> bool {
        match &self.scheme {
            SchemeMatch::Web => scheme == "http" || scheme == "https",
            SchemeMatch::All => MATCH_SCHEMES.contains(&scheme),
            SchemeMatch::Exact(s) => s == scheme,
        }
    }
}

impl UrlPattern for MatchPattern {
    fn as_str(&self) -> &str {
        &self.raw
    }

    fn selects(&self, url: &Url) -> bool {
        if !self.scheme_selects(url.scheme()) {
            return false;
        }

        match url.host_str() {
            Some(host) => {
                if !self.host.matches(host) {
                    return false;
                }
            }
            // Only file URLs may lack a host.
            None => {
                if self.host != HostMatch::Any {
                    return false;
                }
            }
        }

        if let PortMatch::Exact(port) = self.port {
            if url.port_or_known_default() != Some(port) {
                return false;
            }
        }

        match url.query() {
            Some(query) => self.path.is_match(&format!("{}?{}", url.path(), query)),
            None => self.path.is_match(url.path()),
        }
    }

    fn host_key(&self) -> Option<&str> {
        self.host.key()
    }
}

/// A whole-URL glob (or `/regex/`) include pattern.
#[derive(Debug, Clone)]
pub struct GlobPattern {
    raw: String,
    regex: Regex,
    host_key: Option<String>,
}

impl GlobPattern {
    pub fn parse(pattern: &str) -> PatternResult<Self> {
        let trimmed = pattern.trim();
        if trimmed.is_empty() {
            return Err(PatternError::new(pattern, "empty pattern"));
        }

        if let Some(regex) = parse_regex_literal(pattern, trimmed)? {
            return Ok(GlobPattern {
                raw: trimmed.to_string(),
                regex,
                host_key: None,
            });
        }

        Ok(GlobPattern {
            raw: trimmed.to_string(),
            regex: wildcard_regex(pattern, trimmed, true)?,
            host_key: glob_host_key(trimmed),
        })
    }
}

impl UrlPattern for GlobPattern {
    fn as_str(&self) -> &str {
        &self.raw
    }

    fn selects(&self, url: &Url) -> bool {
        self.regex.is_match(url.as_str())
    }

    fn host_key(&self) -> Option<&str> {
        self.host_key.as_deref()
    }
}

/// `/body/` or `/body/i` as a regular expression.
fn parse_regex_literal(pattern: &str, trimmed: &str) -> PatternResult<Option<Regex>> {
    let Some(body) = trimmed.strip_prefix('/') else {
        return Ok(None);
    };
    let (body, case_insensitive) = if let Some(body) = body.strip_suffix("/i") {
        (body, true)
    } else if let Some(body) = body.strip_suffix('/') {
        (body, false)
    } else {
        return Ok(None);
    };
    if body.is_empty() {
        return Err(PatternError::new(pattern, "empty regular expression"));
    }

    RegexBuilder::new(body)
        .case_insensitive(case_insensitive)
        .build()
        .map(Some)
        .map_err(|e| PatternError::new(pattern, e.to_string()))
}

/// Host a glob is pinned to: only when scheme and host are both literal, so
/// the literal prefix fixes the host of every URL the glob can select.
///
/// Anything but a plain DNS name or IPv4 address (IPv6 literals, userinfo,
/// escapes) stays unpinned, since `Url` may spell that host differently.
fn glob_host_key(glob: &str) -> Option<String> {
    let (scheme, rest) = glob.split_once("://")?;
    if scheme.is_empty() || scheme.contains('*') {
        return None;
    }
    let authority = rest.split(['/', '?', '#']).next().unwrap_or(rest);
    let host = match authority.split_once(':') {
        Some((host, port)) if port.bytes().all(|b| b.is_ascii_digit()) => host,
        Some(_) => return None,
        None => authority,
    };
    let plain = host
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'-');
    if host.is_empty() || !plain {
        return None;
    }
    Some(host.to_ascii_lowercase())
}

/// Anchored regex where `*` matches any run of characters.
fn wildcard_regex(pattern: &str, glob: &str, case_insensitive: bool) -> PatternResult<Regex> {
    let body = glob
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    RegexBuilder::new(&format!("^{}$", body))
        .case_insensitive(case_insensitive)
        .build()
        .map_err(|e| PatternError::new(pattern, e.to_string()))
}

/// Parse an exclude pattern: match grammar first, glob otherwise.
pub fn parse_either(pattern: &str) -> PatternResult<Arc<dyn UrlPattern>> {
    match MatchPattern::parse(pattern) {
        Ok(p) => Ok(Arc::new(p)),
        Err(_) => GlobPattern::parse(pattern).map(|p| Arc::new(p) as Arc<dyn UrlPattern>),
    }
}

/// Every suffix of `host` on a label boundary, longest first.
fn host_suffixes(host: &str) -> impl Iterator<Item = &str> {
    std::iter::once(host).chain(
        host.match_indices('.')
            .map(move |(at, _)| &host[at + 1..])
            .filter(|s| !s.is_empty()),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PatternSet {
    Match,
    Include,
    Exclude,
}

/// Patterns registered for one script.
struct Entry<T> {
    item: Arc<T>,
    matches: Vec<Arc<dyn UrlPattern>>,
    includes: Vec<Arc<dyn UrlPattern>>,
    excludes: Vec<Arc<dyn UrlPattern>>,
}

impl<T> Entry<T> {
    fn set_mut(&mut self, set: PatternSet) -> &mut Vec<Arc<dyn UrlPattern>> {
        match set {
            PatternSet::Match => &mut self.matches,
            PatternSet::Include => &mut self.includes,
            PatternSet::Exclude => &mut self.excludes,
        }
    }

    fn is_empty(&self) -> bool {
        self.matches.is_empty() && self.includes.is_empty() && self.excludes.is_empty()
    }
}

/// Index of match/include/exclude patterns keyed by script.
///
/// `T` is whatever the caller wants back from a query (a [`Script`] or a
/// compiled run resource); the index only needs its script identity.
pub struct PatternIndex<T> {
    entries: HashMap<ScriptId, Entry<T>>,

    /// Registration slot per script. Survives `del*` so a reload keeps the
    /// script's position, dropped by `remove`.
    order: HashMap<ScriptId, u64>,
    next_slot: u64,

    /// Host key -> script -> number of selecting patterns under that key.
    by_host: HashMap<String, HashMap<ScriptId, usize>>,

    /// Scripts with selecting patterns that can match any host.
    any_host: HashMap<ScriptId, usize>,
}

impl<T> Default for PatternIndex<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            order: HashMap::new(),
            next_slot: 0,
            by_host: HashMap::new(),
            any_host: HashMap::new(),
        }
    }
}

impl<T> fmt::Debug for PatternIndex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatternIndex")
            .field("scripts", &self.entries.len())
            .field("host_buckets", &self.by_host.len())
            .field("any_host", &self.any_host.len())
            .finish()
    }
}

impl<T: AsRef<Script>> PatternIndex<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a match pattern for the script.
    pub fn add(&mut self, pattern: &str, item: &Arc<T>) -> PatternResult<()> {
        let parsed = MatchPattern::parse(pattern)?;
        self.insert(PatternSet::Match, Arc::new(parsed), item);
        Ok(())
    }

    /// Add a glob include pattern for the script.
    pub fn add_include(&mut self, pattern: &str, item: &Arc<T>) -> PatternResult<()> {
        let parsed = GlobPattern::parse(pattern)?;
        self.insert(PatternSet::Include, Arc::new(parsed), item);
        Ok(())
    }

    /// Add an exclude pattern in either grammar.
    pub fn exclude(&mut self, pattern: &str, item: &Arc<T>) -> PatternResult<()> {
        let parsed = parse_either(pattern)?;
        self.insert(PatternSet::Exclude, parsed, item);
        Ok(())
    }

    /// Drop the script's match patterns.
    pub fn del(&mut self, id: ScriptId) {
        self.clear_set(id, PatternSet::Match);
    }

    /// Drop the script's include patterns.
    pub fn del_include(&mut self, id: ScriptId) {
        self.clear_set(id, PatternSet::Include);
    }

    /// Drop the script's exclude patterns.
    pub fn del_exclude(&mut self, id: ScriptId) {
        self.clear_set(id, PatternSet::Exclude);
    }

    /// Drop every pattern of the script and forget its registration slot.
    pub fn remove(&mut self, id: ScriptId) {
        self.del(id);
        self.del_include(id);
        self.del_exclude(id);
        self.order.remove(&id);
    }

    /// Scripts selected by `url`, in registration order.
    pub fn query(&self, url: &str) -> Vec<Arc<T>> {
        let url = match Url::parse(url) {
            Ok(url) => url,
            Err(e) => {
                debug!(url, error = %e, "Ignoring unparseable URL");
                return Vec::new();
            }
        };
        self.query_url(&url)
    }

    /// Same as [`query`](Self::query) for an already parsed URL.
    pub fn query_url(&self, url: &Url) -> Vec<Arc<T>> {
        let mut candidates: HashSet<ScriptId> = self.any_host.keys().copied().collect();
        if let Some(host) = url.host_str() {
            for suffix in host_suffixes(host) {
                if let Some(bucket) = self.by_host.get(suffix) {
                    candidates.extend(bucket.keys().copied());
                }
            }
        }

        let mut selected: Vec<(u64, &Arc<T>)> = candidates
            .into_iter()
            .filter_map(|id| {
                let entry = self.entries.get(&id)?;
                let chosen = entry
                    .matches
                    .iter()
                    .chain(entry.includes.iter())
                    .any(|p| p.selects(url));
                if !chosen || entry.excludes.iter().any(|p| p.selects(url)) {
                    return None;
                }
                Some((self.order.get(&id).copied().unwrap_or(u64::MAX), &entry.item))
            })
            .collect();

        selected.sort_by_key(|(slot, _)| *slot);
        selected.into_iter().map(|(_, item)| Arc::clone(item)).collect()
    }

    /// Whether the script currently has any pattern registered.
    pub fn contains(&self, id: ScriptId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Number of scripts with at least one pattern.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The item last registered for the script.
    pub fn get(&self, id: ScriptId) -> Option<&Arc<T>> {
        self.entries.get(&id).map(|e| &e.item)
    }

    fn insert(&mut self, set: PatternSet, pattern: Arc<dyn UrlPattern>, item: &Arc<T>) {
        let id = (**item).as_ref().id;

        if !self.order.contains_key(&id) {
            self.order.insert(id, self.next_slot);
            self.next_slot += 1;
        }

        if set != PatternSet::Exclude {
            self.bucket_mut(pattern.host_key())
                .entry(id)
                .and_modify(|n| *n += 1)
                .or_insert(1);
        }

        let entry = self.entries.entry(id).or_insert_with(|| Entry {
            item: Arc::clone(item),
            matches: Vec::new(),
            includes: Vec::new(),
            excludes: Vec::new(),
        });
        entry.item = Arc::clone(item);
        entry.set_mut(set).push(pattern);
    }

    fn clear_set(&mut self, id: ScriptId, set: PatternSet) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        let removed = std::mem::take(entry.set_mut(set));
        if entry.is_empty() {
            self.entries.remove(&id);
        }

        if set == PatternSet::Exclude {
            return;
        }
        for pattern in removed {
            let key = pattern.host_key().map(str::to_string);
            let bucket = self.bucket_mut(key.as_deref());
            if let Some(count) = bucket.get_mut(&id) {
                *count -= 1;
                if *count == 0 {
                    bucket.remove(&id);
                }
            }
            if let Some(key) = key {
                if self.by_host.get(&key).is_some_and(HashMap::is_empty) {
                    self.by_host.remove(&key);
                }
            }
        }
    }

    fn bucket_mut(&mut self, key: Option<&str>) -> &mut HashMap<ScriptId, usize> {
        match key {
            Some(key) => self.by_host.entry(key.to_string()).or_default(),
            None => &mut self.any_host,
        }
    }
}
