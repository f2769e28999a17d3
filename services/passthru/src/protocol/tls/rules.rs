//! TLS routing rules.
//!
//! Grammar, tokens separated by a single space:
//! - `SNI <hostname>`
//! - `ALPN <protocol-id>`
//! - `CATCHALL`

use std::fmt;

use passthru_config::CATCHALL;

use super::client_hello::{normalize_host, ClientHelloInfo};
use crate::protocol::ProtocolError;

/// What a rule compares against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleKind {
    /// Exact match on the normalized server name.
    Sni(String),
    /// Exact match on the first offered ALPN identifier.
    Alpn(String),
    /// Always matches.
    CatchAll,
}

/// A parsed rule together with the name it was configured under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    name: String,
    kind: RuleKind,
}

impl Rule {
    pub fn parse(rule: &str) -> Result<Self, ProtocolError> {
        let invalid = || ProtocolError::InvalidRule(rule.to_string());

        let parts: Vec<&str> = rule.split(' ').collect();
        let kind = match parts.as_slice() {
            ["SNI", host] if !host.is_empty() => RuleKind::Sni(normalize_host(host)),
            ["ALPN", proto] if !proto.is_empty() => RuleKind::Alpn((*proto).to_string()),
            [keyword] if *keyword == CATCHALL => RuleKind::CatchAll,
            _ => return Err(invalid()),
        };

        Ok(Self {
            name: rule.to_string(),
            kind,
        })
    }

    /// The rule string exactly as configured.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &RuleKind {
        &self.kind
    }

    pub fn matches(&self, hello: &ClientHelloInfo) -> bool {
        match &self.kind {
            RuleKind::Sni(host) => hello.server_name.as_deref() == Some(host.as_str()),
            RuleKind::Alpn(proto) => hello.alpn.as_deref() == Some(proto.as_str()),
            RuleKind::CatchAll => true,
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Parse rules in order, moving the catch-all rule to the end.
pub fn parse_rules(rules: &[String]) -> Result<Vec<Rule>, ProtocolError> {
    let mut parsed = Vec::with_capacity(rules.len());
    let mut catch_all = None;

    for rule in rules {
        let rule = Rule::parse(rule)?;
        match rule.kind {
            RuleKind::CatchAll => catch_all = Some(rule),
            _ => parsed.push(rule),
        }
    }

    parsed.extend(catch_all);
    Ok(parsed)
}
