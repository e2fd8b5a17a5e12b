//! Inbound-origin policy for exposed objects.
//!
//! Window-style channels stamp each delivered event with the sender's
//! origin. The exposer gates inbound messages through an allow-list of
//! matchers; events from origin-less channels (plain ports) always pass.

use std::rc::Rc;

/// A single allow-list entry.
#[derive(Clone)]
pub enum OriginMatcher {
    /// Matches one origin exactly.
    Exact(String),
    /// Matches every origin.
    Wildcard,
    /// Matches origins accepted by the predicate.
    Predicate(Rc<dyn Fn(&str) -> bool>),
}

impl OriginMatcher {
    fn matches(&self, origin: &str) -> bool {
        match self {
            OriginMatcher::Exact(expected) => expected == origin,
            OriginMatcher::Wildcard => true,
            OriginMatcher::Predicate(predicate) => predicate(origin),
        }
    }
}

impl std::fmt::Debug for OriginMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OriginMatcher::Exact(expected) => f.debug_tuple("Exact").field(expected).finish(),
            OriginMatcher::Wildcard => f.write_str("Wildcard"),
            OriginMatcher::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// Ordered allow-list of origin matchers. The default permits all origins.
#[derive(Debug, Clone)]
pub struct AllowedOrigins {
    matchers: Vec<OriginMatcher>,
}

impl Default for AllowedOrigins {
    fn default() -> Self {
        Self {
            matchers: vec![OriginMatcher::Wildcard],
        }
    }
}

impl AllowedOrigins {
    /// An empty allow-list that rejects every stamped origin.
    pub fn none() -> Self {
        Self {
            matchers: Vec::new(),
        }
    }

    /// Allow-list from explicit matchers.
    pub fn from_matchers(matchers: Vec<OriginMatcher>) -> Self {
        Self { matchers }
    }

    /// Allow-list of exact origins.
    pub fn exact<I, S>(origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            matchers: origins
                .into_iter()
                .map(|origin| OriginMatcher::Exact(origin.into()))
                .collect(),
        }
    }

    /// Append a matcher.
    pub fn push(&mut self, matcher: OriginMatcher) {
        self.matchers.push(matcher);
    }

    /// Whether an event with this origin may be processed. Events without an
    /// origin come from origin-less channels and always pass.
    pub fn allows(&self, origin: Option<&str>) -> bool {
        match origin {
            None => true,
            Some(origin) => self.matchers.iter().any(|matcher| matcher.matches(origin)),
        }
    }
}
