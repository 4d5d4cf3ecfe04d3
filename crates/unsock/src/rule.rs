//! Rule model and first-match rule lookup.
//!
//! Rules arrive already parsed and validated from the loader side; the core
//! decodes them from the environment channel, re-validates the structural
//! constraint (every rule must carry an action), and compiles the address
//! patterns into glob matchers once.

use crate::addr::SockAddr;
use crate::error::RuleError;
use globset::{Glob, GlobMatcher};
use libc::c_int;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Direction of the operation that first binds a real address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleDir {
    Incoming,
    Outgoing,
}

/// Socket type as derived from the `SOCK_*` argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketType {
    Tcp,
    Udp,
    Invalid,
}

impl SocketType {
    /// Derive from the raw `socket(2)` type argument; flag bits such as
    /// `SOCK_NONBLOCK` and `SOCK_CLOEXEC` are tolerated.
    #[must_use]
    pub fn from_raw(typearg: c_int) -> Self {
        match typearg & (libc::SOCK_STREAM | libc::SOCK_DGRAM) {
            libc::SOCK_STREAM => SocketType::Tcp,
            libc::SOCK_DGRAM => SocketType::Udp,
            _ => SocketType::Invalid,
        }
    }
}

impl fmt::Display for SocketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SocketType::Tcp => "tcp",
            SocketType::Udp => "udp",
            SocketType::Invalid => "unknown",
        })
    }
}

/// One redirection rule.
///
/// A rule matches when every field it specifies matches the candidate
/// operation; unspecified fields match anything. A valid rule carries at
/// least one action: a socket path, a reject, a blackhole, or socket
/// activation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Rule {
    pub direction: Option<RuleDir>,
    #[serde(rename = "type")]
    pub socket_type: Option<SocketType>,
    /// Address pattern, matched as a glob against the textual host form.
    pub address: Option<String>,
    pub port: Option<u16>,
    /// Inclusive upper end of a port range; requires `port`.
    pub port_end: Option<u16>,
    pub socket_activation: bool,
    pub fd_name: Option<String>,
    /// Path template with `%%`, `%a`, `%p`, `%t` placeholders.
    pub socket_path: Option<String>,
    pub reject: bool,
    pub reject_errno: Option<c_int>,
    pub blackhole: bool,
}

impl Rule {
    fn validate(&self, index: usize) -> Result<(), RuleError> {
        if self.socket_path.is_none() && !self.reject && !self.blackhole && !self.socket_activation
        {
            return Err(RuleError::Invalid {
                index,
                reason: "no action: needs one of socket_path, reject, blackhole or \
                         socket_activation"
                    .into(),
            });
        }
        if let (Some(port), Some(end)) = (self.port, self.port_end) {
            if end < port {
                return Err(RuleError::Invalid {
                    index,
                    reason: format!("empty port range {}..{}", port, end),
                });
            }
        }
        if self.port_end.is_some() && self.port.is_none() {
            return Err(RuleError::Invalid {
                index,
                reason: "port_end without port".into(),
            });
        }
        if self.socket_type == Some(SocketType::Invalid) {
            return Err(RuleError::Invalid {
                index,
                reason: "rule type must be tcp or udp".into(),
            });
        }
        Ok(())
    }
}

/// A candidate operation presented to the matcher.
#[derive(Debug, Clone, Copy)]
pub struct RuleQuery<'a> {
    pub direction: RuleDir,
    pub socket_type: SocketType,
    /// The local (incoming) or remote (outgoing) address of the operation.
    pub addr: &'a SockAddr,
    pub fd_name: Option<&'a str>,
}

#[derive(Debug)]
struct CompiledRule {
    rule: Rule,
    addr_glob: Option<GlobMatcher>,
}

impl CompiledRule {
    fn matches(&self, q: &RuleQuery<'_>) -> bool {
        if let Some(dir) = self.rule.direction {
            if dir != q.direction {
                return false;
            }
        }
        if let Some(ty) = self.rule.socket_type {
            if ty != q.socket_type {
                return false;
            }
        }
        if let Some(glob) = &self.addr_glob {
            match q.addr.host_str() {
                Some(host) => {
                    if !glob.is_match(&host) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        if let Some(port) = self.rule.port {
            let end = self.rule.port_end.unwrap_or(port);
            match q.addr.port() {
                Some(p) if (port..=end).contains(&p) => {}
                _ => return false,
            }
        }
        if let Some(name) = &self.rule.fd_name {
            if q.fd_name != Some(name.as_str()) {
                return false;
            }
        }
        true
    }
}

/// An ordered rule list with precompiled address globs.
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    /// A set matching nothing.
    #[must_use]
    pub fn empty() -> Self {
        RuleSet::default()
    }

    /// Validate and compile an already-decoded rule list.
    pub fn compile(rules: Vec<Rule>) -> Result<Self, RuleError> {
        let mut compiled = Vec::with_capacity(rules.len());
        for (index, rule) in rules.into_iter().enumerate() {
            rule.validate(index)?;
            let addr_glob = match &rule.address {
                Some(pattern) => Some(
                    Glob::new(pattern)
                        .map_err(|source| RuleError::Pattern { index, source })?
                        .compile_matcher(),
                ),
                None => None,
            };
            compiled.push(CompiledRule { rule, addr_glob });
        }
        Ok(RuleSet { rules: compiled })
    }

    /// Decode a JSON rule list and compile it.
    pub fn decode(json: &str) -> Result<Self, RuleError> {
        let rules: Vec<Rule> = serde_json::from_str(json)?;
        RuleSet::compile(rules)
    }

    /// First rule in list order matching the candidate, if any.
    #[must_use]
    pub fn first_match(&self, q: &RuleQuery<'_>) -> Option<&Rule> {
        for (index, compiled) in self.rules.iter().enumerate() {
            if compiled.matches(q) {
                debug!(
                    index,
                    direction = ?q.direction,
                    socket_type = %q.socket_type,
                    "rule matched"
                );
                return Some(&compiled.rule);
            }
        }
        None
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
