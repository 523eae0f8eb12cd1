//! Outbound network policy.
//!
//! An ordered rule set decides whether a guest may open a connection to a
//! destination. Global rules are consulted before project rules, both in
//! ascending priority; the first matching rule wins; no match means deny.
//! Private, loopback and link-local ranges are denied even under a general
//! allow unless a rule names them explicitly.

use std::net::IpAddr;
use std::str::FromStr;

use funclite_shared::{FuncliteError, FuncliteResult};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Allow,
    Deny,
}

/// What a rule matches against.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "targetType", content = "targetValue")]
pub enum RuleTarget {
    /// Exact host name, or a suffix written as `.example.com`.
    Host(String),
    /// CIDR block, matched against resolved addresses.
    Cidr(String),
    /// Single port (`"443"`) or inclusive range (`"8000-8999"`).
    Port(String),
    /// Matches every destination.
    Any,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkRule {
    pub action: RuleAction,
    #[serde(flatten)]
    pub target: RuleTarget,
    pub priority: i32,
}

impl NetworkRule {
    pub fn allow(target: RuleTarget, priority: i32) -> Self {
        Self { action: RuleAction::Allow, target, priority }
    }

    pub fn deny(target: RuleTarget, priority: i32) -> Self {
        Self { action: RuleAction::Deny, target, priority }
    }

    fn matches(&self, host: &str, port: u16, resolved: &[IpAddr]) -> bool {
        match &self.target {
            RuleTarget::Any => true,
            RuleTarget::Host(pattern) => host_matches(pattern, host, resolved),
            RuleTarget::Port(spec) => port_matches(spec, port),
            RuleTarget::Cidr(spec) => match IpNet::from_str(spec) {
                Ok(net) => resolved.iter().any(|ip| net.contains(ip)),
                Err(_) => false,
            },
        }
    }
}

/// Rule sets for one project, global rules first.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NetworkPolicy {
    pub global_rules: Vec<NetworkRule>,
    pub project_rules: Vec<NetworkRule>,
}

/// Outcome of a policy evaluation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Deny,
}

impl NetworkPolicy {
    pub fn new(global_rules: Vec<NetworkRule>, project_rules: Vec<NetworkRule>) -> Self {
        let mut policy = Self { global_rules, project_rules };
        policy.global_rules.sort_by_key(|r| r.priority);
        policy.project_rules.sort_by_key(|r| r.priority);
        policy
    }

    /// Evaluate a destination. `resolved` carries the addresses known for
    /// `host` at this point: the literal itself for IP destinations, the
    /// DNS answers for the post-resolution check, empty before lookup.
    pub fn evaluate(&self, host: &str, port: u16, resolved: &[IpAddr]) -> PolicyDecision {
        let literal: Vec<IpAddr> = IpAddr::from_str(host).into_iter().collect();
        let addrs: &[IpAddr] = if literal.is_empty() { resolved } else { &literal };

        for rule in self.global_rules.iter().chain(self.project_rules.iter()) {
            if rule.matches(host, port, addrs) {
                return match rule.action {
                    // An allow still cannot reach guarded ranges unless the
                    // rule names them.
                    RuleAction::Allow => {
                        if addrs.iter().any(|ip| is_guarded_range(ip))
                            && !rule_names_guarded(&rule.target)
                        {
                            PolicyDecision::Deny
                        } else {
                            PolicyDecision::Allow
                        }
                    }
                    RuleAction::Deny => PolicyDecision::Deny,
                };
            }
        }
        PolicyDecision::Deny
    }

    /// Pre-lookup check: host name and port only.
    pub fn check_host_port(&self, host: &str, port: u16) -> FuncliteResult<()> {
        match self.evaluate(host, port, &[]) {
            PolicyDecision::Allow => Ok(()),
            PolicyDecision::Deny => Err(denied(host, port)),
        }
    }

    /// Post-resolution check: every candidate address must pass.
    pub fn check_resolved(&self, host: &str, port: u16, addrs: &[IpAddr]) -> FuncliteResult<()> {
        if addrs.is_empty() {
            return Err(denied(host, port));
        }
        for addr in addrs {
            if self.evaluate(host, port, std::slice::from_ref(addr)) == PolicyDecision::Deny {
                return Err(denied(host, port));
            }
        }
        Ok(())
    }
}

fn denied(host: &str, port: u16) -> FuncliteError {
    FuncliteError::PermissionDenied(format!(
        "network access to {}:{} is not allowed",
        host, port
    ))
}

fn host_matches(pattern: &str, host: &str, resolved: &[IpAddr]) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    let host = host.to_ascii_lowercase();
    if let Some(suffix) = pattern.strip_prefix('.') {
        return host.ends_with(suffix)
            && (host.len() == suffix.len()
                || host.as_bytes()[host.len() - suffix.len() - 1] == b'.');
    }
    if pattern == host {
        return true;
    }
    // A host rule naming an IP literal also covers resolved addresses.
    if let Ok(ip) = IpAddr::from_str(&pattern) {
        return resolved.contains(&ip);
    }
    false
}

fn port_matches(spec: &str, port: u16) -> bool {
    if let Some((lo, hi)) = spec.split_once('-') {
        if let (Ok(lo), Ok(hi)) = (lo.trim().parse::<u16>(), hi.trim().parse::<u16>()) {
            return (lo..=hi).contains(&port);
        }
        return false;
    }
    spec.trim().parse::<u16>().map(|p| p == port).unwrap_or(false)
}

/// Ranges that stay unreachable without an explicit rule naming them:
/// RFC1918, loopback, link-local, CGNAT-free ULA and their v6 mapped forms.
pub fn is_guarded_range(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            v4.is_loopback()
                || v4.is_link_local()
                || v4.is_private()
                || o[0] == 169 && o[1] == 254
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_guarded_range(&IpAddr::V4(mapped));
            }
            let seg = v6.segments();
            v6.is_loopback()
                // fc00::/7 unique local
                || (seg[0] & 0xfe00) == 0xfc00
                // fe80::/10 link local
                || (seg[0] & 0xffc0) == 0xfe80
        }
    }
}

fn rule_names_guarded(target: &RuleTarget) -> bool {
    match target {
        RuleTarget::Any | RuleTarget::Port(_) => false,
        RuleTarget::Host(pattern) => IpAddr::from_str(pattern)
            .map(|ip| is_guarded_range(&ip))
            .unwrap_or_else(|_| {
                matches!(pattern.as_str(), "localhost" | ".localhost")
            }),
        RuleTarget::Cidr(spec) => IpNet::from_str(spec)
            .map(|net| is_guarded_range(&net.addr()))
            .unwrap_or(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        IpAddr::from_str(s).unwrap()
    }

    #[test]
    fn empty_policy_denies_everything() {
        let policy = NetworkPolicy::default();
        assert_eq!(
            policy.evaluate("example.com", 443, &[ip("93.184.216.34")]),
            PolicyDecision::Deny
        );
        assert!(policy.check_host_port("example.com", 80).is_err());
    }

    #[test]
    fn first_match_wins_by_priority() {
        let policy = NetworkPolicy::new(
            vec![
                NetworkRule::allow(RuleTarget::Host("example.com".into()), 20),
                NetworkRule::deny(RuleTarget::Host("example.com".into()), 10),
            ],
            vec![],
        );
        assert_eq!(policy.evaluate("example.com", 443, &[]), PolicyDecision::Deny);
    }

    #[test]
    fn global_rules_run_before_project_rules() {
        let policy = NetworkPolicy::new(
            vec![NetworkRule::deny(RuleTarget::Host("evil.test".into()), 100)],
            vec![NetworkRule::allow(RuleTarget::Any, 0)],
        );
        assert_eq!(policy.evaluate("evil.test", 443, &[]), PolicyDecision::Deny);
        assert_eq!(policy.evaluate("good.test", 443, &[ip("1.2.3.4")]), PolicyDecision::Allow);
    }

    #[test]
    fn host_suffix_patterns() {
        let policy = NetworkPolicy::new(
            vec![NetworkRule::allow(RuleTarget::Host(".example.com".into()), 0)],
            vec![],
        );
        assert_eq!(policy.evaluate("api.example.com", 443, &[]), PolicyDecision::Allow);
        assert_eq!(policy.evaluate("example.com", 443, &[]), PolicyDecision::Allow);
        assert_eq!(policy.evaluate("notexample.com", 443, &[]), PolicyDecision::Deny);
    }

    #[test]
    fn cidr_membership() {
        let policy = NetworkPolicy::new(
            vec![NetworkRule::allow(RuleTarget::Cidr("93.184.0.0/16".into()), 0)],
            vec![],
        );
        assert_eq!(
            policy.evaluate("example.com", 443, &[ip("93.184.216.34")]),
            PolicyDecision::Allow
        );
        assert_eq!(
            policy.evaluate("example.com", 443, &[ip("8.8.8.8")]),
            PolicyDecision::Deny
        );
    }

    #[test]
    fn port_rules_and_ranges() {
        let policy = NetworkPolicy::new(
            vec![NetworkRule::allow(RuleTarget::Port("8000-8999".into()), 0)],
            vec![],
        );
        assert_eq!(policy.evaluate("h.test", 8080, &[ip("1.1.1.1")]), PolicyDecision::Allow);
        assert_eq!(policy.evaluate("h.test", 443, &[ip("1.1.1.1")]), PolicyDecision::Deny);
    }

    #[test]
    fn allow_any_does_not_cover_guarded_ranges() {
        let policy = NetworkPolicy::new(
            vec![NetworkRule::allow(RuleTarget::Any, 0)],
            vec![],
        );
        for addr in ["127.0.0.1", "10.0.0.8", "172.16.4.4", "192.168.1.1", "169.254.169.254", "::1", "fe80::1", "fc00::2"] {
            assert_eq!(
                policy.evaluate("meta.test", 80, &[ip(addr)]),
                PolicyDecision::Deny,
                "address {addr}"
            );
        }
        assert_eq!(policy.evaluate("ok.test", 80, &[ip("93.184.216.34")]), PolicyDecision::Allow);
    }

    #[test]
    fn explicit_rule_reaches_guarded_range() {
        let policy = NetworkPolicy::new(
            vec![],
            vec![NetworkRule::allow(RuleTarget::Cidr("127.0.0.0/8".into()), 0)],
        );
        assert_eq!(
            policy.evaluate("localhost", 8080, &[ip("127.0.0.1")]),
            PolicyDecision::Allow
        );
    }

    #[test]
    fn ip_literal_destination_uses_the_literal() {
        let policy = NetworkPolicy::new(
            vec![NetworkRule::allow(RuleTarget::Cidr("93.184.0.0/16".into()), 0)],
            vec![],
        );
        assert_eq!(policy.evaluate("93.184.216.34", 80, &[]), PolicyDecision::Allow);
        assert_eq!(policy.evaluate("8.8.8.8", 80, &[]), PolicyDecision::Deny);
    }

    #[test]
    fn check_resolved_requires_every_address_to_pass() {
        let policy = NetworkPolicy::new(
            vec![NetworkRule::allow(RuleTarget::Host("multi.test".into()), 0)],
            vec![],
        );
        assert!(policy
            .check_resolved("multi.test", 443, &[ip("93.184.216.34")])
            .is_ok());
        // One guarded address poisons the whole answer set.
        assert!(policy
            .check_resolved("multi.test", 443, &[ip("93.184.216.34"), ip("10.0.0.5")])
            .is_err());
    }

    #[test]
    fn mapped_v6_counts_as_guarded() {
        assert!(is_guarded_range(&ip("::ffff:192.168.0.1")));
        assert!(!is_guarded_range(&ip("2606:2800:220:1::1")));
    }
}
