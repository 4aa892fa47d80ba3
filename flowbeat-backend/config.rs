use std::net::IpAddr;
use std::path::PathBuf;

use crate::flows::sqlite_repository::DEFAULT_CLAIM_TTL_SECS;

pub const DEFAULT_HEARTBEAT_PATH: &str = "/data_flows/heartbeat";

/// 30 days.
pub const MAX_CLAIM_TTL_SECS: i64 = 30 * 24 * 60 * 60;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_path: PathBuf,
    pub sentry_dsn: Option<String>,
    pub environment: String,
    pub claim_ttl_secs: i64,
    pub max_concurrency: usize,
    pub heartbeat: HeartbeatConfig,
}

/// Settings for the heartbeat endpoint and its guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub path: String,
    /// Required `X-Heartbeat-Token` value. `None` disables authentication.
    pub token: Option<String>,
    /// Allowed peer addresses. Empty disables IP filtering.
    pub whitelist: Vec<IpRule>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            path: DEFAULT_HEARTBEAT_PATH.to_string(),
            token: None,
            whitelist: Vec::new(),
        }
    }
}

impl HeartbeatConfig {
    pub fn auth_enabled(&self) -> bool {
        self.token.is_some()
    }

    pub fn ip_whitelisting_enabled(&self) -> bool {
        !self.whitelist.is_empty()
    }

    pub fn allows(&self, ip: IpAddr) -> bool {
        self.whitelist.iter().any(|rule| rule.contains(ip))
    }
}

/// A single address or a CIDR block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpRule {
    Addr(IpAddr),
    Cidr { network: IpAddr, prefix: u8 },
}

impl IpRule {
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        match value.split_once('/') {
            None => value.parse().ok().map(IpRule::Addr),
            Some((addr, prefix)) => {
                let network: IpAddr = addr.parse().ok()?;
                let prefix: u8 = prefix.parse().ok()?;
                let max = if network.is_ipv4() { 32 } else { 128 };
                if prefix > max {
                    return None;
                }
                // An IPv4-mapped block covering only mapped addresses is an IPv4 block.
                match network {
                    IpAddr::V6(v6) if prefix >= 96 => match v6.to_ipv4_mapped() {
                        Some(v4) => Some(IpRule::Cidr {
                            network: IpAddr::V4(v4),
                            prefix: prefix - 96,
                        }),
                        None => Some(IpRule::Cidr { network, prefix }),
                    },
                    _ => Some(IpRule::Cidr { network, prefix }),
                }
            }
        }
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        let ip = canonical(ip);
        match *self {
            IpRule::Addr(addr) => canonical(addr) == ip,
            IpRule::Cidr { network, prefix } => match (network, ip) {
                (IpAddr::V4(net), IpAddr::V4(ip)) => {
                    let mask = u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0);
                    u32::from(net) & mask == u32::from(ip) & mask
                }
                (IpAddr::V6(net), IpAddr::V6(ip)) => {
                    let mask = u128::MAX.checked_shl(128 - u32::from(prefix)).unwrap_or(0);
                    u128::from(net) & mask == u128::from(ip) & mask
                }
                _ => false,
            },
        }
    }
}

/// IPv4-mapped IPv6 peers (dual-stack listeners) compare as IPv4.
fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a Config from raw string values (as they would come from env vars).
    /// Used directly in tests to avoid mutating process-global environment.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let port = get("PORT").and_then(|v| v.parse().ok()).unwrap_or(8081);

        let database_path = get("DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(default_database_path);

        let sentry_dsn = get("SENTRY_DSN");

        let environment = get("ENVIRONMENT").unwrap_or_else(|| "local".to_string());

        let claim_ttl_secs = get("CLAIM_TTL_SECS")
            .and_then(|v| v.parse().ok())
            .filter(|secs: &i64| (1..=MAX_CLAIM_TTL_SECS).contains(secs))
            .unwrap_or(DEFAULT_CLAIM_TTL_SECS);

        let max_concurrency = get("MAX_CONCURRENCY")
            .and_then(|v| v.parse().ok())
            .filter(|n: &usize| *n > 0)
            .unwrap_or(1);

        let path = get("HEARTBEAT_PATH")
            .map(|p| {
                if p.starts_with('/') {
                    p
                } else {
                    format!("/{p}")
                }
            })
            .unwrap_or_else(|| DEFAULT_HEARTBEAT_PATH.to_string());

        let whitelist = get("HEARTBEAT_WHITELIST")
            .map(|list| {
                list.split(',')
                    .filter(|entry| !entry.trim().is_empty())
                    .filter_map(|entry| {
                        let rule = IpRule::parse(entry);
                        if rule.is_none() {
                            tracing::warn!(entry = %entry.trim(), "Ignoring invalid whitelist entry");
                        }
                        rule
                    })
                    .collect()
            })
            .unwrap_or_default();

        Config {
            port,
            database_path,
            sentry_dsn,
            environment,
            claim_ttl_secs,
            max_concurrency,
            heartbeat: HeartbeatConfig {
                path,
                token: get("HEARTBEAT_TOKEN"),
                whitelist,
            },
        }
    }
}

fn default_database_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".flowbeat")
        .join("flowbeat.db")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]);
        assert_eq!(config.port, 8081);
        assert_eq!(config.environment, "local");
        assert!(config.sentry_dsn.is_none());
        assert_eq!(config.claim_ttl_secs, DEFAULT_CLAIM_TTL_SECS);
        assert_eq!(config.max_concurrency, 1);
        assert!(config.database_path.ends_with(".flowbeat/flowbeat.db"));
        assert_eq!(config.heartbeat, HeartbeatConfig::default());
        assert!(!config.heartbeat.auth_enabled());
        assert!(!config.heartbeat.ip_whitelisting_enabled());
    }

    #[test]
    fn test_invalid_numbers_use_defaults() {
        let config = config(&[
            ("PORT", "not-a-number"),
            ("CLAIM_TTL_SECS", "-5"),
            ("MAX_CONCURRENCY", "0"),
        ]);
        assert_eq!(config.port, 8081);
        assert_eq!(config.claim_ttl_secs, DEFAULT_CLAIM_TTL_SECS);
        assert_eq!(config.max_concurrency, 1);
    }

    #[test]
    fn test_claim_ttl_is_bounded() {
        assert_eq!(
            config(&[("CLAIM_TTL_SECS", "999999999999999")]).claim_ttl_secs,
            DEFAULT_CLAIM_TTL_SECS
        );
        assert_eq!(
            config(&[("CLAIM_TTL_SECS", MAX_CLAIM_TTL_SECS.to_string().as_str())]).claim_ttl_secs,
            MAX_CLAIM_TTL_SECS
        );
    }

    #[test]
    fn test_custom_values() {
        let config = config(&[
            ("PORT", "3000"),
            ("DATABASE_PATH", "/tmp/flows.db"),
            ("ENVIRONMENT", "production"),
            ("MAX_CONCURRENCY", "4"),
            ("HEARTBEAT_PATH", "hooks/beat"),
            ("HEARTBEAT_TOKEN", "s3cret"),
        ]);
        assert_eq!(config.port, 3000);
        assert_eq!(config.database_path, PathBuf::from("/tmp/flows.db"));
        assert_eq!(config.environment, "production");
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.heartbeat.path, "/hooks/beat");
        assert_eq!(config.heartbeat.token.as_deref(), Some("s3cret"));
        assert!(config.heartbeat.auth_enabled());
    }

    #[test]
    fn test_empty_token_disables_auth() {
        let config = config(&[("HEARTBEAT_TOKEN", "  ")]);
        assert!(config.heartbeat.token.is_none());
    }

    #[test]
    fn test_whitelist_parsing_skips_invalid_entries() {
        let config = config(&[(
            "HEARTBEAT_WHITELIST",
            "10.0.0.0/8, 192.168.1.100,bogus,,::1,10.0.0.0/40",
        )]);
        assert_eq!(config.heartbeat.whitelist.len(), 3);
        assert!(config.heartbeat.ip_whitelisting_enabled());
    }

    #[test]
    fn test_ip_rule_matching() {
        let cidr = IpRule::parse("172.16.0.0/12").unwrap();
        assert!(cidr.contains("172.20.1.1".parse().unwrap()));
        assert!(!cidr.contains("172.32.0.1".parse().unwrap()));

        let exact = IpRule::parse("192.168.1.100").unwrap();
        assert!(exact.contains("192.168.1.100".parse().unwrap()));
        assert!(!exact.contains("192.168.1.101".parse().unwrap()));

        let all = IpRule::parse("0.0.0.0/0").unwrap();
        assert!(all.contains("8.8.8.8".parse().unwrap()));

        let v6 = IpRule::parse("fd00::/8").unwrap();
        assert!(v6.contains("fd12::1".parse().unwrap()));
        assert!(!v6.contains("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_ipv4_mapped_cidr_matches_ipv4_peers() {
        let rule = IpRule::parse("::ffff:10.0.0.0/104").unwrap();
        assert_eq!(
            rule,
            IpRule::Cidr {
                network: "10.0.0.0".parse().unwrap(),
                prefix: 8
            }
        );
        assert!(rule.contains("10.20.30.40".parse().unwrap()));
        assert!(rule.contains("::ffff:10.1.1.1".parse().unwrap()));
        assert!(!rule.contains("11.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_ipv4_mapped_peer_matches_ipv4_rule() {
        let rule = IpRule::parse("127.0.0.1").unwrap();
        assert!(rule.contains("::ffff:127.0.0.1".parse().unwrap()));
    }
}
