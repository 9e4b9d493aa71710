//! Static rate-limit rules and route matching.
//!
//! # Rule Syntax
//!
//! Rules are loaded from `RATE_LIMIT_RULES` as a comma-separated list:
//!
//! ```text
//! PATTERN=CAPACITY:FILL_RATE[:QUANTUM[:SCOPE]]
//!
//! /auth=10:1:1:client,/api=100:100
//! ```
//!
//! - `CAPACITY` - maximum tokens (burst size)
//! - `FILL_RATE` - tokens added per second (fractions allowed)
//! - `QUANTUM` - tokens one request consumes (default 1)
//! - `SCOPE` - `route` (default, one bucket for everyone hitting the prefix)
//!   or `client` (one bucket per prefix and client IP)
//!
//! # Matching
//!
//! Rules are evaluated in order and the first match wins. A pattern matches
//! a path when the path equals the pattern or continues it at a `/`
//! boundary, so `/api` covers `/api/v1/items` but not `/apix`. Requests that
//! match no rule are never limited.

use std::fmt;
use std::str::FromStr;

use super::BucketError;
use super::bucket::validate;

/// Whether a rule's bucket is shared by all callers or split per client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuleScope {
    #[default]
    Route,
    Client,
}

impl fmt::Display for RuleScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleScope::Route => write!(f, "route"),
            RuleScope::Client => write!(f, "client"),
        }
    }
}

/// One validated rate-limit rule.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketRule {
    key_pattern: String,
    capacity: u64,
    fill_rate: f64,
    quantum: u64,
    scope: RuleScope,
}

impl BucketRule {
    /// Build a route-scoped rule.
    ///
    /// # Errors
    ///
    /// Rejects empty or relative patterns, zero capacity, non-positive fill
    /// rates, a zero quantum, and a quantum larger than the capacity (such a
    /// rule could never admit a request).
    pub fn new(
        key_pattern: impl Into<String>,
        capacity: u64,
        fill_rate: f64,
        quantum: u64,
    ) -> Result<Self, BucketError> {
        let key_pattern = key_pattern.into();
        if !key_pattern.starts_with('/') {
            return Err(BucketError::InvalidPattern(key_pattern));
        }
        validate(capacity, fill_rate)?;
        if quantum == 0 || quantum > capacity {
            return Err(BucketError::InvalidQuantum { quantum, capacity });
        }
        Ok(Self {
            key_pattern,
            capacity,
            fill_rate,
            quantum,
            scope: RuleScope::Route,
        })
    }

    /// Switch the rule's scope.
    pub fn with_scope(mut self, scope: RuleScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn key_pattern(&self) -> &str {
        &self.key_pattern
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn fill_rate(&self) -> f64 {
        self.fill_rate
    }

    pub fn quantum(&self) -> u64 {
        self.quantum
    }

    pub fn scope(&self) -> RuleScope {
        self.scope
    }

    /// Check whether `path` falls under this rule's prefix.
    pub fn matches(&self, path: &str) -> bool {
        let pattern = self.key_pattern.as_str();
        match path.strip_prefix(pattern) {
            Some("") => true,
            Some(rest) => pattern.ends_with('/') || rest.starts_with('/'),
            None => false,
        }
    }

    /// Registry key for a request matched by this rule.
    pub fn resolve_key(&self, client_ip: &str) -> String {
        match self.scope {
            RuleScope::Route => self.key_pattern.clone(),
            RuleScope::Client => format!("{}#{}", self.key_pattern, client_ip),
        }
    }
}

impl FromStr for BucketRule {
    type Err = BucketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || BucketError::InvalidSyntax(s.to_string());

        let (pattern, quota) = s.trim().split_once('=').ok_or_else(invalid)?;
        let mut fields = quota.split(':').map(str::trim);

        let capacity: u64 = fields
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or_else(invalid)?;
        let fill_rate: f64 = fields
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or_else(invalid)?;
        let quantum: u64 = match fields.next() {
            Some(v) => v.parse().map_err(|_| invalid())?,
            None => 1,
        };
        let scope = match fields.next() {
            None | Some("route") => RuleScope::Route,
            Some("client") => RuleScope::Client,
            Some(_) => return Err(invalid()),
        };
        if fields.next().is_some() {
            return Err(invalid());
        }

        Ok(BucketRule::new(pattern.trim(), capacity, fill_rate, quantum)?.with_scope(scope))
    }
}

/// Parse a comma-separated rule list, preserving order.
pub fn parse_rules(raw: &str) -> Result<Vec<BucketRule>, BucketError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse)
        .collect()
}

/// First rule matching `path`, if any.
pub fn match_rule<'a>(rules: &'a [BucketRule], path: &str) -> Option<&'a BucketRule> {
    rules.iter().find(|rule| rule.matches(path))
}
