//! Forwarding authorization: decides which forwards and direct connections a
//! principal may set up.
//!
//! The policy layer is split into:
//!
//! - [`ForwardAuthorizer`]: the hook the coordinator consults. Both checks
//!   permit by default, so [`AllowAll`] is an empty impl.
//! - [`ForwardPolicy`]: a plain configuration struct (cloneable) holding the
//!   rules loaded from the config file.
//! - [`ForwardPolicyEnforcer`]: the runtime counterpart that pre-computes
//!   the allowlists and implements [`ForwardAuthorizer`].

use std::collections::HashSet;
use tunnel_core::Endpoint;

/// Authorization hook for forwarding requests.
///
/// Return `Err(reason)` to refuse; the reason is logged, never sent to the peer.
pub trait ForwardAuthorizer: Send + Sync {
    /// May `principal` listen on `address:port`?
    fn check_forward(&self, _principal: &str, _address: &str, _port: u16) -> Result<(), String> {
        Ok(())
    }

    /// May `principal` open a connection to `destination`?
    fn check_direct(
        &self,
        _principal: &str,
        _origin: &Endpoint,
        _destination: &Endpoint,
    ) -> Result<(), String> {
        Ok(())
    }
}

/// Permits everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl ForwardAuthorizer for AllowAll {}

/// Static forwarding access-control configuration.
///
/// # Pattern Matching
///
/// `allowed_bind_addresses` and `allowed_destinations` accept:
///
/// | Pattern            | Matches                                  |
/// |--------------------|------------------------------------------|
/// | `"*"`              | Any host and port (wildcard).            |
/// | `"example.com"`    | The exact host on **any** port.          |
/// | `"example.com:443"`| The exact host **and** port pair.        |
///
/// An empty list means **nothing** is allowed.
#[derive(Debug, Clone)]
pub struct ForwardPolicy {
    /// Whether `tcpip-forward` requests are honoured at all.
    pub enable_remote_forwards: bool,
    /// Whether `direct-tcpip` requests are honoured at all.
    pub enable_direct: bool,
    /// Addresses a remote forward may bind.
    pub allowed_bind_addresses: Vec<String>,
    /// Destinations a direct connection may reach.
    pub allowed_destinations: Vec<String>,
}

/// Default policy: everything enabled, every address and destination allowed.
impl Default for ForwardPolicy {
    fn default() -> Self {
        Self {
            enable_remote_forwards: true,
            enable_direct: true,
            allowed_bind_addresses: vec!["*".to_string()],
            allowed_destinations: vec!["*".to_string()],
        }
    }
}

/// Pre-computed allowlist.
#[derive(Debug)]
struct PatternSet {
    allow_all: bool,
    set: HashSet<String>,
}

impl PatternSet {
    fn new(patterns: &[String]) -> Self {
        Self {
            allow_all: patterns.iter().any(|p| p == "*"),
            set: patterns.iter().cloned().collect(),
        }
    }

    fn allows(&self, host: &str, port: u16) -> bool {
        self.allow_all || self.set.contains(host) || self.set.contains(&format!("{host}:{port}"))
    }
}

/// Runtime policy enforcer.
#[derive(Debug)]
pub struct ForwardPolicyEnforcer {
    policy: ForwardPolicy,
    binds: PatternSet,
    destinations: PatternSet,
}

impl ForwardPolicyEnforcer {
    /// Pre-compute the allowlists of `policy`.
    pub fn new(policy: ForwardPolicy) -> Self {
        let binds = PatternSet::new(&policy.allowed_bind_addresses);
        let destinations = PatternSet::new(&policy.allowed_destinations);
        Self {
            policy,
            binds,
            destinations,
        }
    }

    /// The policy this enforcer was built from.
    pub fn policy(&self) -> &ForwardPolicy {
        &self.policy
    }
}

impl ForwardAuthorizer for ForwardPolicyEnforcer {
    fn check_forward(&self, _principal: &str, address: &str, port: u16) -> Result<(), String> {
        if !self.policy.enable_remote_forwards {
            return Err("remote forwarding is disabled".to_string());
        }
        if !self.binds.allows(address, port) {
            return Err(format!("bind address not allowed: {address}:{port}"));
        }
        Ok(())
    }

    fn check_direct(
        &self,
        _principal: &str,
        _origin: &Endpoint,
        destination: &Endpoint,
    ) -> Result<(), String> {
        if !self.policy.enable_direct {
            return Err("direct connections are disabled".to_string());
        }
        if !self.destinations.allows(&destination.host, destination.port) {
            return Err(format!("destination not allowed: {destination}"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> Endpoint {
        Endpoint::new("10.0.0.2", 40000)
    }

    #[test]
    fn test_allow_all_default() {
        let enforcer = ForwardPolicyEnforcer::new(ForwardPolicy::default());
        assert!(enforcer.check_forward("alice", "0.0.0.0", 0).is_ok());
        assert!(enforcer
            .check_direct("alice", &origin(), &Endpoint::new("example.com", 80))
            .is_ok());
        assert!(AllowAll.check_forward("alice", "", 22).is_ok());
    }

    #[test]
    fn test_allow_specific_destination() {
        let policy = ForwardPolicy {
            allowed_destinations: vec!["example.com".to_string(), "db.internal:5432".to_string()],
            ..ForwardPolicy::default()
        };
        let enforcer = ForwardPolicyEnforcer::new(policy);
        assert!(enforcer
            .check_direct("alice", &origin(), &Endpoint::new("example.com", 8443))
            .is_ok());
        assert!(enforcer
            .check_direct("alice", &origin(), &Endpoint::new("db.internal", 5432))
            .is_ok());
        assert!(enforcer
            .check_direct("alice", &origin(), &Endpoint::new("db.internal", 22))
            .is_err());
        assert!(enforcer
            .check_direct("alice", &origin(), &Endpoint::new("evil.com", 80))
            .is_err());
    }

    #[test]
    fn test_bind_allowlist() {
        let policy = ForwardPolicy {
            allowed_bind_addresses: vec!["127.0.0.1".to_string()],
            ..ForwardPolicy::default()
        };
        let enforcer = ForwardPolicyEnforcer::new(policy);
        assert!(enforcer.check_forward("alice", "127.0.0.1", 8080).is_ok());
        assert!(enforcer.check_forward("alice", "0.0.0.0", 8080).is_err());
    }

    #[test]
    fn test_empty_list_allows_nothing() {
        let policy = ForwardPolicy {
            allowed_destinations: Vec::new(),
            ..ForwardPolicy::default()
        };
        let enforcer = ForwardPolicyEnforcer::new(policy);
        assert!(enforcer
            .check_direct("alice", &origin(), &Endpoint::new("localhost", 80))
            .is_err());
    }

    #[test]
    fn test_features_disabled() {
        let policy = ForwardPolicy {
            enable_remote_forwards: false,
            enable_direct: false,
            ..ForwardPolicy::default()
        };
        let enforcer = ForwardPolicyEnforcer::new(policy);
        assert!(enforcer.check_forward("alice", "0.0.0.0", 0).is_err());
        assert!(enforcer
            .check_direct("alice", &origin(), &Endpoint::new("localhost", 80))
            .is_err());
    }
}
