//! SSH Config Parser
//!
//! Parses OpenSSH `ssh_config` files so proxy hops and forwards can be
//! named by alias.
//! Supports:
//! - Basic: Host, HostName, User, Port, IdentityFile, CertificateFile
//! - ProxyJump / ProxyCommand
//! - Port Forwarding: LocalForward, RemoteForward
//!
//! As in OpenSSH, the first value obtained for a directive wins, and
//! wildcard blocks (`Host *`, `Host *.internal`) fill in whatever the exact
//! block left unset.

use std::fmt;
use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::forwarding::{LocalForward, RemoteForward};

/// A `LocalForward` / `RemoteForward` line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForwardRule {
    /// Address the listening side binds (default: localhost)
    pub bind_address: String,
    /// Port the listening side binds
    pub listen_port: u16,
    /// Host the other side connects to
    pub target_host: String,
    pub target_port: u16,
}

impl PortForwardRule {
    /// Parse from SSH config format: "[bind_address:]port host:hostport"
    pub fn parse(value: &str) -> Option<Self> {
        let parts: Vec<&str> = value.split_whitespace().collect();
        if parts.len() != 2 {
            return None;
        }

        let (bind_address, listen_port) = match parts[0].rsplit_once(':') {
            Some((bind, port)) => (bind.to_string(), port.parse().ok()?),
            None => ("localhost".to_string(), parts[0].parse().ok()?),
        };

        let (target_host, target_port) = parts[1].rsplit_once(':')?;
        let target_host = target_host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(target_host);

        Some(PortForwardRule {
            bind_address,
            listen_port,
            target_host: target_host.to_string(),
            target_port: target_port.parse().ok()?,
        })
    }

    /// Listen locally, connect from the remote side.
    pub fn to_local_forward(&self) -> LocalForward {
        let bind = match self.bind_address.as_str() {
            "localhost" => "127.0.0.1",
            "*" => "0.0.0.0",
            other => other,
        };
        LocalForward::new(self.listen_port, self.target_host.clone(), self.target_port)
            .with_bind_host(bind)
    }

    /// Listen on the remote side, connect locally.
    pub fn to_remote_forward(&self) -> RemoteForward {
        RemoteForward::new(self.listen_port, self.target_host.clone(), self.target_port)
            .with_remote_bind(self.bind_address.clone())
    }
}

/// One `[user@]host[:port]` entry of a ProxyJump list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyJumpHost {
    /// Username (inherits from the dialing config if not specified)
    pub user: Option<String>,
    pub host: String,
    /// Only set when written out explicitly
    pub port: Option<u16>,
}

impl ProxyJumpHost {
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        let (user, host_port) = match value.split_once('@') {
            Some((user, rest)) if !user.is_empty() => (Some(user.to_string()), rest),
            Some(_) => return None,
            None => (None, value),
        };

        let (host, port) = if let Some(rest) = host_port.strip_prefix('[') {
            let (host, tail) = rest.split_once(']')?;
            match tail.strip_prefix(':') {
                Some(port) => (host, Some(port.parse().ok()?)),
                None if tail.is_empty() => (host, None),
                None => return None,
            }
        } else {
            match host_port.rsplit_once(':') {
                Some((host, port)) => (host, Some(port.parse().ok()?)),
                None => (host_port, None),
            }
        };
        if host.is_empty() {
            return None;
        }

        Some(ProxyJumpHost {
            user,
            host: host.to_string(),
            port,
        })
    }

    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(22)
    }
}

impl fmt::Display for ProxyJumpHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            write!(f, "{}", self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        Ok(())
    }
}

/// A parsed SSH config host block
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshConfigHost {
    /// Host pattern (one per alias on the `Host` line)
    pub alias: String,
    pub hostname: Option<String>,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub identity_file: Option<String>,
    pub certificate_file: Option<String>,

    #[serde(default)]
    pub proxy_jump: Vec<ProxyJumpHost>,

    /// Explicit `none` is recorded so wildcard blocks cannot add a jump
    #[serde(default)]
    pub proxy_jump_none: bool,

    pub proxy_command: Option<String>,

    #[serde(default)]
    pub local_forwards: Vec<PortForwardRule>,

    #[serde(default)]
    pub remote_forwards: Vec<PortForwardRule>,
}

impl SshConfigHost {
    fn new(alias: &str) -> Self {
        Self {
            alias: alias.to_string(),
            ..Default::default()
        }
    }

    /// Get the effective hostname (hostname or alias)
    pub fn effective_hostname(&self) -> &str {
        self.hostname.as_deref().unwrap_or(&self.alias)
    }

    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(22)
    }

    pub fn is_wildcard(&self) -> bool {
        self.alias.contains('*') || self.alias.contains('?')
    }

    pub fn has_proxy_jump(&self) -> bool {
        !self.proxy_jump.is_empty()
    }

    /// Whether this block applies to `alias`. A leading `!` negates.
    pub fn matches(&self, alias: &str) -> bool {
        match self.alias.strip_prefix('!') {
            Some(pattern) => !glob_match(pattern, alias),
            None => glob_match(&self.alias, alias),
        }
    }

    /// Fill unset fields from a later matching block.
    fn inherit(&mut self, other: &SshConfigHost) {
        if self.hostname.is_none() {
            self.hostname = other.hostname.clone();
        }
        if self.user.is_none() {
            self.user = other.user.clone();
        }
        if self.port.is_none() {
            self.port = other.port;
        }
        if self.identity_file.is_none() {
            self.identity_file = other.identity_file.clone();
        }
        if self.certificate_file.is_none() {
            self.certificate_file = other.certificate_file.clone();
        }
        if self.proxy_jump.is_empty() && !self.proxy_jump_none {
            self.proxy_jump = other.proxy_jump.clone();
            self.proxy_jump_none = other.proxy_jump_none;
        }
        if self.proxy_command.is_none() {
            self.proxy_command = other.proxy_command.clone();
        }
        self.local_forwards.extend(other.local_forwards.iter().cloned());
        self.remote_forwards.extend(other.remote_forwards.iter().cloned());
    }

    /// `ProxyJump` as the comma-separated string `SshClientConfig` carries
    pub fn proxy_jump_spec(&self) -> Option<String> {
        if self.proxy_jump.is_empty() {
            return None;
        }
        let hops: Vec<String> = self.proxy_jump.iter().map(ToString::to_string).collect();
        Some(hops.join(","))
    }
}

/// `*` and `?` wildcards, case-insensitive like OpenSSH host patterns.
fn glob_match(pattern: &str, text: &str) -> bool {
    let options = MatchOptions {
        case_sensitive: false,
        ..MatchOptions::new()
    };
    match Pattern::new(pattern) {
        Ok(pattern) => pattern.matches_with(text, options),
        Err(_) => pattern.eq_ignore_ascii_case(text),
    }
}

/// SSH config parser errors
#[derive(Debug, thiserror::Error)]
pub enum SshConfigError {
    #[error("Failed to determine home directory")]
    NoHomeDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Get default SSH config path
pub fn default_ssh_config_path() -> Result<PathBuf, SshConfigError> {
    dirs::home_dir()
        .map(|home| home.join(".ssh").join("config"))
        .ok_or(SshConfigError::NoHomeDir)
}

/// Parse an SSH config file. A missing file has no hosts.
pub async fn parse_ssh_config(path: Option<PathBuf>) -> Result<Vec<SshConfigHost>, SshConfigError> {
    let path = match path {
        Some(p) => p,
        None => default_ssh_config_path()?,
    };

    match fs::read_to_string(&path).await {
        Ok(content) => Ok(parse_ssh_config_content(&content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(SshConfigError::Io(e)),
    }
}

/// Blocking variant of [`parse_ssh_config`] for synchronous lookups.
pub fn parse_ssh_config_blocking(path: &Path) -> Result<Vec<SshConfigHost>, SshConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(parse_ssh_config_content(&content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(SshConfigError::Io(e)),
    }
}

fn expand_home(value: &str) -> String {
    match (value.strip_prefix("~/"), dirs::home_dir()) {
        (Some(stripped), Some(home)) => home.join(stripped).to_string_lossy().into_owned(),
        _ => value.to_string(),
    }
}

fn set_once<T>(slot: &mut Option<T>, value: Option<T>) {
    if slot.is_none() {
        *slot = value;
    }
}

/// Parse SSH config content. Unknown directives and malformed lines are
/// skipped; directives inside `Match` blocks are ignored.
pub fn parse_ssh_config_content(content: &str) -> Vec<SshConfigHost> {
    let mut hosts = Vec::new();
    // Indices into `hosts` the current block applies to
    let mut current: Vec<usize> = Vec::new();

    for line in content.lines() {
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        // "Key Value" or "Key=Value"
        let (key, value) = match line.split_once(|c: char| c == '=' || c.is_whitespace()) {
            Some((key, value)) => (key.trim(), value.trim().trim_start_matches('=').trim()),
            None => continue,
        };
        if value.is_empty() {
            continue;
        }

        let key_lower = key.to_lowercase();
        match key_lower.as_str() {
            "host" => {
                current.clear();
                for alias in value.split_whitespace() {
                    current.push(hosts.len());
                    hosts.push(SshConfigHost::new(alias));
                }
                continue;
            }
            "match" => {
                current.clear();
                continue;
            }
            _ => {}
        }

        for &index in &current {
            let host: &mut SshConfigHost = &mut hosts[index];
            match key_lower.as_str() {
                "hostname" => set_once(&mut host.hostname, Some(value.to_string())),
                "user" => set_once(&mut host.user, Some(value.to_string())),
                "port" => set_once(&mut host.port, value.parse().ok()),
                "identityfile" => set_once(&mut host.identity_file, Some(expand_home(value))),
                "certificatefile" => {
                    set_once(&mut host.certificate_file, Some(expand_home(value)))
                }
                // Comma-separated for multi-hop
                "proxyjump" => {
                    if host.proxy_jump.is_empty() && !host.proxy_jump_none {
                        if value.eq_ignore_ascii_case("none") {
                            host.proxy_jump_none = true;
                        } else {
                            host.proxy_jump =
                                value.split(',').filter_map(ProxyJumpHost::parse).collect();
                        }
                    }
                }
                "proxycommand" => {
                    if !value.eq_ignore_ascii_case("none") {
                        set_once(&mut host.proxy_command, Some(value.to_string()));
                    }
                }
                "localforward" => {
                    if let Some(rule) = PortForwardRule::parse(value) {
                        host.local_forwards.push(rule);
                    }
                }
                "remoteforward" => {
                    if let Some(rule) = PortForwardRule::parse(value) {
                        host.remote_forwards.push(rule);
                    }
                }
                _ => {}
            }
        }
    }

    hosts
}

/// Everything that applies to `alias`: blocks are merged in file order,
/// first value wins. `None` when no block names `alias` or matches it.
pub fn effective_host(hosts: &[SshConfigHost], alias: &str) -> Option<SshConfigHost> {
    let mut merged: Option<SshConfigHost> = None;
    for host in hosts.iter().filter(|h| h.matches(alias)) {
        match merged.as_mut() {
            Some(merged) => merged.inherit(host),
            None => {
                let mut first = host.clone();
                first.alias = alias.to_string();
                merged = Some(first);
            }
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic() {
        let content = r#"
# Comment
Host myserver
    HostName example.com
    User admin
    Port 2222
    IdentityFile ~/.ssh/id_rsa

Host otherserver
    HostName=other.com
    User root
"#;

        let hosts = parse_ssh_config_content(content);
        assert_eq!(hosts.len(), 2);

        assert_eq!(hosts[0].alias, "myserver");
        assert_eq!(hosts[0].hostname.as_deref(), Some("example.com"));
        assert_eq!(hosts[0].user.as_deref(), Some("admin"));
        assert_eq!(hosts[0].port, Some(2222));
        assert!(hosts[0].identity_file.as_deref().unwrap().ends_with(".ssh/id_rsa"));

        assert_eq!(hosts[1].hostname.as_deref(), Some("other.com"));
        assert_eq!(hosts[1].effective_port(), 22);
    }

    #[test]
    fn test_wildcards_fill_unset_fields() {
        let content = r#"
Host prod
    HostName prod.example.com

Host prod
    HostName ignored.example.com
    Port 2200

Host *
    User developer
    Port 22
"#;

        let hosts = parse_ssh_config_content(content);
        let prod = effective_host(&hosts, "prod").unwrap();
        assert_eq!(prod.hostname.as_deref(), Some("prod.example.com"));
        assert_eq!(prod.port, Some(2200));
        assert_eq!(prod.user.as_deref(), Some("developer"));

        let other = effective_host(&hosts, "unlisted").unwrap();
        assert_eq!(other.effective_hostname(), "unlisted");
        assert_eq!(other.user.as_deref(), Some("developer"));
    }

    #[test]
    fn test_no_match() {
        let hosts = parse_ssh_config_content("Host dev-*\n    User dev\n");
        assert!(effective_host(&hosts, "prod").is_none());
        assert!(effective_host(&hosts, "DEV-01").is_some());
    }

    #[test]
    fn test_glob() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("node??.internal", "node07.internal"));
        assert!(!glob_match("node??.internal", "node7.internal"));
        assert!(glob_match("*.hpc.*", "login.hpc.edu"));
        assert!(!glob_match("web", "web01"));
    }

    #[test]
    fn test_multiple_aliases_and_match_block() {
        let content = r#"
Host a b
    User shared
Match user root
    Port 99
"#;
        let hosts = parse_ssh_config_content(content);
        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts[1].alias, "b");
        assert_eq!(hosts[1].user.as_deref(), Some("shared"));
        assert_eq!(hosts[1].port, None);
    }

    #[test]
    fn test_parse_multi_hop_proxy() {
        let content = r#"
Host compute
    HostName node001.internal
    User admin
    ProxyJump bastion, admin@hpc:2222
"#;

        let hosts = parse_ssh_config_content(content);
        let jumps = &hosts[0].proxy_jump;
        assert_eq!(jumps.len(), 2);
        assert_eq!(jumps[0].host, "bastion");
        assert_eq!(jumps[0].port, None);
        assert_eq!(jumps[1].user.as_deref(), Some("admin"));
        assert_eq!(jumps[1].effective_port(), 2222);
        assert_eq!(
            hosts[0].proxy_jump_spec().as_deref(),
            Some("bastion,admin@hpc:2222")
        );
    }

    #[test]
    fn test_proxy_jump_none_blocks_wildcard() {
        let content = r#"
Host bastion
    ProxyJump none

Host *
    ProxyJump bastion
"#;
        let hosts = parse_ssh_config_content(content);
        assert!(!effective_host(&hosts, "bastion").unwrap().has_proxy_jump());
        assert!(effective_host(&hosts, "web").unwrap().has_proxy_jump());
    }

    #[test]
    fn test_parse_jump_host_forms() {
        let v6 = ProxyJumpHost::parse("ops@[fe80::1]:2200").unwrap();
        assert_eq!(v6.host, "fe80::1");
        assert_eq!(v6.port, Some(2200));
        assert_eq!(v6.to_string(), "ops@[fe80::1]:2200");

        assert!(ProxyJumpHost::parse("@host").is_none());
        assert!(ProxyJumpHost::parse("host:notaport").is_none());
    }

    #[test]
    fn test_parse_port_forwards() {
        let content = r#"
Host hpc
    HostName hpc.edu.cn
    LocalForward 8888 localhost:8888
    LocalForward 127.0.0.1:6006 localhost:6006
    RemoteForward 3000 localhost:3000
"#;

        let hosts = parse_ssh_config_content(content);
        let host = &hosts[0];

        assert_eq!(host.local_forwards.len(), 2);
        assert_eq!(host.local_forwards[0].listen_port, 8888);
        assert_eq!(host.local_forwards[1].bind_address, "127.0.0.1");

        let local = host.local_forwards[0].to_local_forward();
        assert_eq!(local.bind_addr(), "127.0.0.1:8888");
        assert_eq!(local.destination_port, 8888);

        let remote = host.remote_forwards[0].to_remote_forward();
        assert_eq!(remote.remote_bind, "localhost");
        assert_eq!(remote.remote_port, 3000);
        assert_eq!(remote.forward_host, "localhost");
    }

    #[tokio::test]
    async fn test_missing_file_has_no_hosts() {
        let dir = tempfile::tempdir().unwrap();
        let hosts = parse_ssh_config(Some(dir.path().join("config"))).await.unwrap();
        assert!(hosts.is_empty());
    }
}
