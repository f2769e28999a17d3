//! Routing of a connection to an action.
//!
//! A [`ProtocolManager`] holds one rule-configured instance of every
//! registered protocol for a single listen address. [`find_action`] races
//! them all against the connection buffer and maps the winning
//! `(protocol, rule)` pair through the imported protocol group.
//!
//! [`find_action`]: ProtocolManager::find_action

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use passthru_config::{Action, ProtocolGroup, CATCHALL};
use thiserror::Error;
use tracing::{debug, info};

use super::race::{first_success, RaceOutcome};
use super::{ConnBuf, Protocol, ProtocolError};
use crate::context::{Context, Interrupt};

/// Errors from [`ProtocolManager::import_protocol_group`].
#[derive(Debug, Error)]
pub enum ImportError {
    /// The group names a protocol that was never registered.
    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),

    /// The reserved CATCHALL entry is not exactly `{"CATCHALL": action}`.
    #[error("malformed CATCHALL entry: {0}")]
    MalformedCatchAll(String),

    /// A protocol rejected its rule list.
    #[error("invalid rules for protocol {protocol}")]
    InvalidRules {
        protocol: String,
        #[source]
        source: ProtocolError,
    },
}

/// A protocol identified a rule that is missing from the routing table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("protocol {protocol} matched rule {rule:?} which has no action")]
pub struct UnknownRule {
    pub protocol: String,
    pub rule: String,
}

/// Why a connection fell through to the catch-all action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatchAllReason {
    /// The sniffing context was cancelled or timed out first.
    Interrupted(Interrupt),
    /// Every protocol gave up on the connection.
    Unidentified,
    /// The named protocol recognized the connection but has no rules of its
    /// own, so only the implicit catch-all applied.
    ImplicitRule(String),
}

impl fmt::Display for CatchAllReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CatchAllReason::Interrupted(interrupt) => interrupt.fmt(f),
            CatchAllReason::Unidentified => f.write_str("no protocol identified the connection"),
            CatchAllReason::ImplicitRule(protocol) => {
                write!(f, "{} has no rules, implicit catch-all applied", protocol)
            }
        }
    }
}

/// Result of routing one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// A protocol matched a configured rule.
    Identified {
        protocol: String,
        rule: String,
        action: Action,
    },
    /// Nothing matched; the catch-all action applies.
    CatchAll {
        action: Action,
        reason: CatchAllReason,
    },
}

impl Verdict {
    pub fn action(&self) -> &Action {
        match self {
            Verdict::Identified { action, .. } | Verdict::CatchAll { action, .. } => action,
        }
    }

    pub fn is_catch_all(&self) -> bool {
        matches!(self, Verdict::CatchAll { .. })
    }
}

/// Registered protocols plus the routing table of one listen address.
///
/// Read-only once imported; share it behind an `Arc`.
pub struct ProtocolManager {
    protocols: HashMap<String, Arc<dyn Protocol>>,
    group: ProtocolGroup,
    catch_all: Action,
}

impl ProtocolManager {
    pub fn new() -> Self {
        Self {
            protocols: HashMap::new(),
            group: ProtocolGroup::new(),
            catch_all: Action::Reject,
        }
    }

    /// Register a rule-free copy of `protocol` under its name.
    ///
    /// Must happen before [`import_protocol_group`](Self::import_protocol_group).
    pub fn register_protocol(&mut self, protocol: &dyn Protocol) {
        debug!(protocol = protocol.name(), "Registering protocol");
        self.protocols
            .insert(protocol.name().to_string(), Arc::from(protocol.clone_with_no_rules()));
    }

    /// Configure every registered protocol from `group`.
    ///
    /// On error the manager is left unchanged.
    pub fn import_protocol_group(&mut self, group: &ProtocolGroup) -> Result<(), ImportError> {
        let mut configured: Vec<(String, Box<dyn Protocol>)> = Vec::new();
        let mut catch_all = Action::Reject;

        for (name, filter) in group {
            if name == CATCHALL {
                catch_all = match filter.iter().next() {
                    Some((rule, action)) if filter.len() == 1 && rule == CATCHALL => {
                        action.clone()
                    }
                    _ => {
                        let rules: Vec<&str> = filter.keys().map(String::as_str).collect();
                        return Err(ImportError::MalformedCatchAll(format!(
                            "expected the single rule CATCHALL, found {:?}",
                            rules
                        )));
                    }
                };
                continue;
            }

            let template = self
                .protocols
                .get(name)
                .ok_or_else(|| ImportError::UnknownProtocol(name.clone()))?;

            let rules: Vec<String> = filter.keys().cloned().collect();
            let mut instance = template.clone_with_no_rules();
            instance
                .apply_rules(&rules)
                .map_err(|source| ImportError::InvalidRules {
                    protocol: name.clone(),
                    source,
                })?;

            debug!(protocol = %name, rule_count = rules.len(), "Imported rules");
            configured.push((name.clone(), instance));
        }

        for (name, instance) in configured {
            self.protocols.insert(name, Arc::from(instance));
        }
        self.group = group.clone();
        self.catch_all = catch_all;

        info!(
            protocol_count = self.protocols.len(),
            catch_all = %self.catch_all,
            "Protocol group imported"
        );
        Ok(())
    }

    /// The configured instance of a registered protocol.
    pub fn protocol(&self, name: &str) -> Option<&dyn Protocol> {
        self.protocols.get(name).map(|p| p.as_ref())
    }

    pub fn catch_all(&self) -> &Action {
        &self.catch_all
    }

    /// Race every registered protocol against `buf` and route the winner.
    ///
    /// Losing attempts are cancelled before this returns. When `ctx` is done
    /// first, or every protocol gives up, the catch-all action is returned
    /// as a [`Verdict::CatchAll`], as it is when the winner answered with an
    /// implicit `CATCHALL` that has no table entry. Any other winner with no
    /// table entry is an error.
    pub async fn find_action(
        &self,
        ctx: &Context,
        buf: Arc<ConnBuf>,
    ) -> Result<Verdict, UnknownRule> {
        let entrants = self.protocols.iter().map(|(name, protocol)| {
            let protocol = Arc::clone(protocol);
            let buf = Arc::clone(&buf);
            let start = move |ctx: Context| async move { protocol.identify(&ctx, &buf).await };
            (name.clone(), start)
        });

        let (protocol, rule) = match first_success(ctx, entrants).await {
            RaceOutcome::Won { entrant, value } => (entrant, value),
            RaceOutcome::Exhausted => return Ok(self.fall_through(CatchAllReason::Unidentified)),
            RaceOutcome::Interrupted(interrupt) => {
                return Ok(self.fall_through(CatchAllReason::Interrupted(interrupt)))
            }
        };

        let action = match self.group.get(&protocol).and_then(|filter| filter.get(&rule)) {
            Some(action) => action.clone(),
            // A protocol without rules only answers with its implicit catch-all.
            None if rule == CATCHALL => {
                return Ok(self.fall_through(CatchAllReason::ImplicitRule(protocol)))
            }
            None => return Err(UnknownRule { protocol, rule }),
        };

        debug!(protocol = %protocol, rule = %rule, action = %action, "Found action");
        Ok(Verdict::Identified {
            protocol,
            rule,
            action,
        })
    }

    fn fall_through(&self, reason: CatchAllReason) -> Verdict {
        debug!(reason = %reason, action = %self.catch_all, "Using catch-all action");
        Verdict::CatchAll {
            action: self.catch_all.clone(),
            reason,
        }
    }
}

impl Default for ProtocolManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ProtocolManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.protocols.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("ProtocolManager")
            .field("protocols", &names)
            .field("group", &self.group)
            .field("catch_all", &self.catch_all)
            .finish()
    }
}
