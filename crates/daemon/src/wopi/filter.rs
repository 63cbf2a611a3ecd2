// Destination filter for outbound host calls.
//
// Every host-facing URL passes through here before any network I/O: the
// scheme must be TLS (plain http only for loopback or when explicitly
// allowed), the host must clear the deny list and — when an allow list is
// configured — match it, and IP-literal destinations must not point into
// private, loopback or link-local ranges unless the deployment opts in.
// A rejection is reported to the caller and never retried.

use std::net::{Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};
use url::{Host, Url};

/// Operator-configured destination rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DestinationRules {
    /// When non-empty, only hosts matching an entry are allowed. Entries
    /// are exact names or `*.suffix` wildcards, case-insensitive.
    pub allow_list: Vec<String>,
    /// Hosts matching an entry are always refused.
    pub deny_list: Vec<String>,
    /// Permit IP-literal destinations in private/loopback/link-local
    /// ranges (test and on-premise setups).
    pub allow_private_addresses: bool,
    /// Permit plain http to non-loopback hosts.
    pub allow_insecure_http: bool,
}

/// A refused destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationRefused {
    pub host: String,
    pub reason: &'static str,
}

impl std::fmt::Display for DestinationRefused {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "destination `{}` refused: {}", self.host, self.reason)
    }
}

impl std::error::Error for DestinationRefused {}

/// Checks outbound destinations against the configured rules.
#[derive(Debug, Clone, Default)]
pub struct HostFilter {
    rules: DestinationRules,
}

impl HostFilter {
    pub fn new(rules: DestinationRules) -> Self {
        Self { rules }
    }

    pub fn check(&self, url: &Url) -> Result<(), DestinationRefused> {
        let host = match url.host() {
            Some(host) => host,
            None => {
                return Err(DestinationRefused {
                    host: url.as_str().to_string(),
                    reason: "URL has no host",
                })
            }
        };
        let host_name = host.to_string();
        let refuse = |reason: &'static str| DestinationRefused { host: host_name.clone(), reason };

        match url.scheme() {
            "https" => {}
            "http" if self.rules.allow_insecure_http || is_loopback_host(&host) => {}
            "http" => return Err(refuse("plain http is not allowed")),
            _ => return Err(refuse("scheme is not http(s)")),
        }

        if self.rules.deny_list.iter().any(|pattern| matches_host(pattern, &host_name)) {
            return Err(refuse("host is deny-listed"));
        }

        if !self.rules.allow_list.is_empty()
            && !self.rules.allow_list.iter().any(|pattern| matches_host(pattern, &host_name))
        {
            return Err(refuse("host is not on the allow list"));
        }

        if !self.rules.allow_private_addresses {
            match host {
                Host::Ipv4(addr) if is_restricted_ipv4(addr) => {
                    return Err(refuse("IPv4 address is in a restricted range"));
                }
                Host::Ipv6(addr) if is_restricted_ipv6(addr) => {
                    return Err(refuse("IPv6 address is in a restricted range"));
                }
                _ => {}
            }
        }

        Ok(())
    }
}

fn matches_host(pattern: &str, host: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return host
            .to_ascii_lowercase()
            .strip_suffix(&suffix.to_ascii_lowercase())
            .is_some_and(|rest| rest.ends_with('.'));
    }
    pattern.eq_ignore_ascii_case(host)
}

fn is_loopback_host(host: &Host<&str>) -> bool {
    match host {
        Host::Domain(name) => name.eq_ignore_ascii_case("localhost"),
        Host::Ipv4(addr) => addr.is_loopback(),
        Host::Ipv6(addr) => addr.is_loopback(),
    }
}

fn is_restricted_ipv4(addr: Ipv4Addr) -> bool {
    addr.is_unspecified()
        || addr.is_loopback()
        || addr.is_private()
        || addr.is_link_local()
        || addr.is_broadcast()
}

fn is_restricted_ipv6(addr: Ipv6Addr) -> bool {
    if let Some(mapped) = addr.to_ipv4_mapped() {
        return is_restricted_ipv4(mapped);
    }
    let first = addr.segments()[0];
    addr.is_unspecified()
        || addr.is_loopback()
        // Unique local fc00::/7.
        || (first & 0xfe00) == 0xfc00
        // Link local fe80::/10.
        || (first & 0xffc0) == 0xfe80
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(filter: &HostFilter, url: &str) -> Result<(), DestinationRefused> {
        filter.check(&Url::parse(url).expect("test URL should parse"))
    }

    #[test]
    fn https_to_public_host_is_allowed_by_default() {
        let filter = HostFilter::default();
        assert!(check(&filter, "https://host.example.com/wopi/files/1").is_ok());
    }

    #[test]
    fn plain_http_is_refused_except_loopback() {
        let filter = HostFilter::default();
        assert!(check(&filter, "http://host.example.com/wopi").is_err());
        assert!(check(&filter, "http://localhost:8080/wopi").is_ok());
        assert!(check(&filter, "http://127.0.0.1:8080/wopi").is_err(), "loopback IP literal is still a restricted address");
    }

    #[test]
    fn insecure_http_opt_in() {
        let filter = HostFilter::new(DestinationRules {
            allow_insecure_http: true,
            ..Default::default()
        });
        assert!(check(&filter, "http://host.example.com/wopi").is_ok());
    }

    #[test]
    fn non_http_schemes_are_refused() {
        let filter = HostFilter::default();
        assert!(check(&filter, "ftp://host.example.com/file").is_err());
    }

    #[test]
    fn deny_list_wins() {
        let filter = HostFilter::new(DestinationRules {
            deny_list: vec!["evil.example.com".into()],
            ..Default::default()
        });
        assert!(check(&filter, "https://evil.example.com/wopi").is_err());
        assert!(check(&filter, "https://good.example.com/wopi").is_ok());
    }

    #[test]
    fn allow_list_restricts_when_present() {
        let filter = HostFilter::new(DestinationRules {
            allow_list: vec!["files.example.com".into(), "*.sharepoint.example".into()],
            ..Default::default()
        });
        assert!(check(&filter, "https://files.example.com/wopi").is_ok());
        assert!(check(&filter, "https://tenant.sharepoint.example/wopi").is_ok());
        assert!(check(&filter, "https://other.example.com/wopi").is_err());
    }

    #[test]
    fn wildcard_does_not_match_the_bare_suffix() {
        let filter = HostFilter::new(DestinationRules {
            allow_list: vec!["*.sharepoint.example".into()],
            ..Default::default()
        });
        assert!(check(&filter, "https://sharepoint.example/wopi").is_err());
        assert!(
            check(&filter, "https://badsharepoint.example/wopi").is_err(),
            "suffix match must respect the label boundary"
        );
    }

    #[test]
    fn host_matching_is_case_insensitive() {
        let filter = HostFilter::new(DestinationRules {
            allow_list: vec!["Files.Example.COM".into()],
            ..Default::default()
        });
        assert!(check(&filter, "https://files.example.com/wopi").is_ok());
    }

    #[test]
    fn private_and_loopback_ipv4_are_refused() {
        let filter = HostFilter::default();
        for url in [
            "https://10.0.0.5/wopi",
            "https://192.168.1.10/wopi",
            "https://172.16.3.4/wopi",
            "https://169.254.169.254/latest/meta-data",
            "https://127.0.0.1/wopi",
            "https://0.0.0.0/wopi",
        ] {
            assert!(check(&filter, url).is_err(), "{url} should be refused");
        }
        assert!(check(&filter, "https://203.0.113.9/wopi").is_ok());
    }

    #[test]
    fn restricted_ipv6_is_refused() {
        let filter = HostFilter::default();
        for url in [
            "https://[::1]/wopi",
            "https://[fc00::1]/wopi",
            "https://[fdab::1]/wopi",
            "https://[fe80::1]/wopi",
            "https://[::ffff:10.0.0.5]/wopi",
        ] {
            assert!(check(&filter, url).is_err(), "{url} should be refused");
        }
        assert!(check(&filter, "https://[2001:db8::1]/wopi").is_ok());
    }

    #[test]
    fn private_addresses_opt_in() {
        let filter = HostFilter::new(DestinationRules {
            allow_private_addresses: true,
            ..Default::default()
        });
        assert!(check(&filter, "https://10.0.0.5/wopi").is_ok());
        assert!(check(&filter, "https://[fc00::1]/wopi").is_ok());
    }

    #[test]
    fn refusal_names_the_host() {
        let filter = HostFilter::default();
        let error = check(&filter, "https://10.0.0.5/wopi").expect_err("should refuse");
        assert_eq!(error.host, "10.0.0.5");
        assert!(error.to_string().contains("10.0.0.5"));
    }
}
