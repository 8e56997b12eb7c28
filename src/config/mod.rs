//! Configuration Module
//!
//! Alias resolution for proxy hops and forwards through OpenSSH
//! `ssh_config` files.

pub mod ssh_config;

use std::fmt;
use std::path::PathBuf;
use std::sync::OnceLock;

use tracing::{debug, warn};

pub use ssh_config::{
    default_ssh_config_path, effective_host, parse_ssh_config, parse_ssh_config_content,
    PortForwardRule, ProxyJumpHost, SshConfigError, SshConfigHost,
};

use crate::forwarding::{LocalForward, RemoteForward};
use crate::ssh::{AuthMethod, SshClientConfig};

/// Turns a host alias into the address to dial and the config to dial it
/// with. `None` leaves the alias to be dialed as a plain hostname.
pub trait HostResolver: Send + Sync {
    fn resolve(&self, alias: &str) -> Option<(String, SshClientConfig)>;
}

/// Resolves aliases from an `ssh_config` file.
///
/// The default resolver reads `~/.ssh/config` on first use. Aliases may
/// also be written `[user@]host[:port]`, as in a ProxyJump list.
pub struct SshConfigResolver {
    path: Option<PathBuf>,
    hosts: OnceLock<Vec<SshConfigHost>>,
}

impl Default for SshConfigResolver {
    fn default() -> Self {
        Self {
            path: None,
            hosts: OnceLock::new(),
        }
    }
}

impl SshConfigResolver {
    /// Read from `path` on first use.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            hosts: OnceLock::new(),
        }
    }

    pub fn from_content(content: &str) -> Self {
        Self::from_hosts(parse_ssh_config_content(content))
    }

    pub fn from_hosts(hosts: Vec<SshConfigHost>) -> Self {
        Self {
            path: None,
            hosts: OnceLock::from(hosts),
        }
    }

    /// Parse `path` (default: `~/.ssh/config`) now.
    pub async fn load(path: Option<PathBuf>) -> Result<Self, SshConfigError> {
        Ok(Self::from_hosts(parse_ssh_config(path).await?))
    }

    fn hosts(&self) -> &[SshConfigHost] {
        self.hosts.get_or_init(|| {
            let path = match self.path.clone().map_or_else(default_ssh_config_path, Ok) {
                Ok(path) => path,
                Err(e) => {
                    warn!("No ssh_config to resolve aliases from: {}", e);
                    return Vec::new();
                }
            };
            match ssh_config::parse_ssh_config_blocking(&path) {
                Ok(hosts) => {
                    debug!("Loaded {} host block(s) from {}", hosts.len(), path.display());
                    hosts
                }
                Err(e) => {
                    warn!("Failed to read {}: {}", path.display(), e);
                    Vec::new()
                }
            }
        })
    }

    /// The merged config block for `alias`, if any.
    pub fn host(&self, alias: &str) -> Option<SshConfigHost> {
        effective_host(self.hosts(), alias)
    }

    /// `LocalForward` lines that apply to `alias`
    pub fn local_forwards(&self, alias: &str) -> Vec<LocalForward> {
        self.host(alias)
            .map(|h| h.local_forwards.iter().map(PortForwardRule::to_local_forward).collect())
            .unwrap_or_default()
    }

    /// `RemoteForward` lines that apply to `alias`
    pub fn remote_forwards(&self, alias: &str) -> Vec<RemoteForward> {
        self.host(alias)
            .map(|h| h.remote_forwards.iter().map(PortForwardRule::to_remote_forward).collect())
            .unwrap_or_default()
    }
}

/// Auth methods implied by a config block: the certificate when both files
/// are named, otherwise the identity key.
fn auth_methods(host: &SshConfigHost) -> Vec<AuthMethod> {
    match (&host.identity_file, &host.certificate_file) {
        (Some(key), Some(cert)) => vec![
            AuthMethod::certificate(key.clone(), cert.clone(), None),
            AuthMethod::key(key.clone(), None),
        ],
        (Some(key), None) => vec![AuthMethod::key(key.clone(), None)],
        _ => Vec::new(),
    }
}

impl HostResolver for SshConfigResolver {
    fn resolve(&self, alias: &str) -> Option<(String, SshClientConfig)> {
        let jump = ProxyJumpHost::parse(alias)?;
        let block = self.host(&jump.host);
        if block.is_none() && jump.user.is_none() && jump.port.is_none() {
            return None;
        }
        let block = block.unwrap_or_else(|| SshConfigHost {
            alias: jump.host.clone(),
            ..Default::default()
        });

        let mut config = SshClientConfig::new(
            jump.user
                .clone()
                .or_else(|| block.user.clone())
                .unwrap_or_default(),
        )
        .port(jump.port.unwrap_or_else(|| block.effective_port()));
        config.auth_methods = auth_methods(&block);
        config.proxy_jump = block.proxy_jump_spec();
        config.proxy_command = block.proxy_command.clone();

        debug!(
            "Resolved {} to {}:{}",
            alias,
            block.effective_hostname(),
            config.port
        );
        Some((block.effective_hostname().to_string(), config))
    }
}

impl fmt::Debug for SshConfigResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshConfigResolver")
            .field("path", &self.path)
            .field("loaded", &self.hosts.get().map(Vec::len))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
Host bastion
    HostName jump.example.com
    User ops
    Port 2200
    IdentityFile /keys/ops
    CertificateFile /keys/ops-cert.pub

Host hpc
    HostName login.hpc.example.com
    ProxyJump bastion
    LocalForward 8888 localhost:8888
    RemoteForward 9000 localhost:3000
"#;

    #[test]
    fn test_resolve_alias() {
        let resolver = SshConfigResolver::from_content(CONFIG);
        let (host, config) = resolver.resolve("bastion").unwrap();
        assert_eq!(host, "jump.example.com");
        assert_eq!(config.user, "ops");
        assert_eq!(config.port, 2200);
        assert_eq!(
            config.auth_methods,
            vec![
                AuthMethod::certificate("/keys/ops", "/keys/ops-cert.pub", None),
                AuthMethod::key("/keys/ops", None),
            ]
        );
        assert!(config.proxy_jump.is_none());
    }

    #[test]
    fn test_resolve_carries_proxy_jump() {
        let resolver = SshConfigResolver::from_content(CONFIG);
        let (host, config) = resolver.resolve("hpc").unwrap();
        assert_eq!(host, "login.hpc.example.com");
        assert_eq!(config.proxy_jump.as_deref(), Some("bastion"));
        assert!(config.user.is_empty());
        assert!(config.auth_methods.is_empty());
    }

    #[test]
    fn test_jump_spec_overrides_block() {
        let resolver = SshConfigResolver::from_content(CONFIG);
        let (host, config) = resolver.resolve("root@bastion:22").unwrap();
        assert_eq!(host, "jump.example.com");
        assert_eq!(config.user, "root");
        assert_eq!(config.port, 22);

        let (host, config) = resolver.resolve("admin@10.0.0.5:2022").unwrap();
        assert_eq!(host, "10.0.0.5");
        assert_eq!(config.user, "admin");
        assert_eq!(config.port, 2022);
    }

    #[test]
    fn test_unknown_alias_is_unresolved() {
        let resolver = SshConfigResolver::from_content(CONFIG);
        assert!(resolver.resolve("elsewhere").is_none());
    }

    #[test]
    fn test_forwards_for_alias() {
        let resolver = SshConfigResolver::from_content(CONFIG);
        let local = resolver.local_forwards("hpc");
        assert_eq!(local.len(), 1);
        assert_eq!(local[0].local_port, 8888);
        let remote = resolver.remote_forwards("hpc");
        assert_eq!(remote[0].remote_port, 9000);
        assert_eq!(remote[0].forward_port, 3000);
        assert!(resolver.local_forwards("bastion").is_empty());
    }

    #[test]
    fn test_lazy_load_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, CONFIG).unwrap();

        let resolver = SshConfigResolver::with_path(&path);
        let (host, _) = resolver.resolve("bastion").unwrap();
        assert_eq!(host, "jump.example.com");

        let missing = SshConfigResolver::with_path(dir.path().join("nope"));
        assert!(missing.resolve("bastion").is_none());
    }
}
