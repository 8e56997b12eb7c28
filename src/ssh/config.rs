//! SSH client configuration

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agent::SshAgent;
use crate::config::HostResolver;

/// Configuration for one dial.
///
/// The agent and host resolver are runtime objects and are never serialized.
#[derive(Clone, Serialize, Deserialize)]
pub struct SshClientConfig {
    /// Username for authentication
    pub user: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Authentication methods, tried in order until one succeeds
    #[serde(default)]
    pub auth_methods: Vec<AuthMethod>,

    /// In-process agent used by `AuthMethod::Agent` and agent forwarding
    #[serde(skip)]
    pub agent: Option<SshAgent>,

    /// Comma-separated jump hosts (`ProxyJump`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_jump: Option<String>,

    /// Literal proxy command (`ssh (-J jump)? -W host:port alias`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_command: Option<String>,

    #[serde(default)]
    pub log_verbosity: LogVerbosity,

    /// Handshake and authentication timeout in seconds
    #[serde(default = "default_timeout")]
    pub connection_timeout_secs: u64,

    #[serde(default = "default_keepalive")]
    pub keepalive_interval_secs: u64,

    /// Strict host key checking
    /// - true: reject unknown hosts
    /// - false: accept and record unknown hosts, still reject changed keys
    #[serde(default)]
    pub strict_host_key_checking: bool,

    /// known_hosts file used for verification (default: ~/.ssh/known_hosts)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_hosts_path: Option<PathBuf>,

    /// Serve `auth-agent@openssh.com` channels from the configured agent
    #[serde(default)]
    pub forward_agent: bool,

    /// Resolves proxy hop aliases (default: ~/.ssh/config)
    #[serde(skip)]
    pub host_resolver: Option<Arc<dyn HostResolver>>,
}

/// Authentication methods supported
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMethod {
    /// Password authentication
    Password { password: String },

    /// SSH key authentication
    Key {
        /// Path to private key file
        key_path: String,
        /// Optional passphrase for encrypted keys
        passphrase: Option<String>,
    },

    /// SSH certificate authentication (OpenSSH certificates)
    Certificate {
        key_path: String,
        /// Path to certificate file (*-cert.pub)
        cert_path: String,
        passphrase: Option<String>,
    },

    /// Agent authentication: the configured in-process agent, or the system agent
    Agent,

    /// The `none` method
    None,
}

impl AuthMethod {
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password {
            password: password.into(),
        }
    }

    pub fn key(key_path: impl Into<String>, passphrase: Option<String>) -> Self {
        Self::Key {
            key_path: key_path.into(),
            passphrase,
        }
    }

    pub fn certificate(
        key_path: impl Into<String>,
        cert_path: impl Into<String>,
        passphrase: Option<String>,
    ) -> Self {
        Self::Certificate {
            key_path: key_path.into(),
            cert_path: cert_path.into(),
            passphrase,
        }
    }

    /// Name reported in `SshError::AuthFailed`
    pub fn name(&self) -> &'static str {
        match self {
            AuthMethod::Password { .. } => "password",
            AuthMethod::Key { .. } => "publickey",
            AuthMethod::Certificate { .. } => "certificate",
            AuthMethod::Agent => "agent",
            AuthMethod::None => "none",
        }
    }
}

/// Logging verbosity for a dial
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogVerbosity {
    Quiet,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogVerbosity {
    /// Default `EnvFilter` directive for this level
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogVerbosity::Quiet => "warn",
            LogVerbosity::Info => "info",
            LogVerbosity::Debug => "debug",
            LogVerbosity::Trace => "trace",
        }
    }
}

fn default_port() -> u16 {
    22
}

fn default_timeout() -> u64 {
    30
}

fn default_keepalive() -> u64 {
    30
}

impl Default for SshClientConfig {
    fn default() -> Self {
        Self {
            user: String::new(),
            port: default_port(),
            auth_methods: Vec::new(),
            agent: None,
            proxy_jump: None,
            proxy_command: None,
            log_verbosity: LogVerbosity::default(),
            connection_timeout_secs: default_timeout(),
            keepalive_interval_secs: default_keepalive(),
            strict_host_key_checking: false,
            known_hosts_path: None,
            forward_agent: false,
            host_resolver: None,
        }
    }
}

impl SshClientConfig {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            ..Default::default()
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn auth(mut self, method: AuthMethod) -> Self {
        self.auth_methods.push(method);
        self
    }

    pub fn agent(mut self, agent: SshAgent) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn proxy_jump(mut self, jump: impl Into<String>) -> Self {
        self.proxy_jump = Some(jump.into());
        self
    }

    pub fn proxy_command(mut self, command: impl Into<String>) -> Self {
        self.proxy_command = Some(command.into());
        self
    }

    pub fn host_resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
        self.host_resolver = Some(resolver);
        self
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn has_proxy(&self) -> bool {
        self.proxy_jump.is_some() || self.proxy_command.is_some()
    }

    /// Whether a pooled connection dialed with `other` can serve this config.
    pub fn same_connection(&self, other: &SshClientConfig) -> bool {
        let agents_match = match (&self.agent, &other.agent) {
            (Some(a), Some(b)) => a.same_agent(b),
            (None, None) => true,
            _ => false,
        };
        agents_match
            && self.user == other.user
            && self.port == other.port
            && self.auth_methods == other.auth_methods
            && self.proxy_jump == other.proxy_jump
            && self.proxy_command == other.proxy_command
            && self.forward_agent == other.forward_agent
    }
}

impl fmt::Debug for SshClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let methods: Vec<&str> = self.auth_methods.iter().map(AuthMethod::name).collect();
        f.debug_struct("SshClientConfig")
            .field("user", &self.user)
            .field("port", &self.port)
            .field("auth_methods", &methods)
            .field("has_agent", &self.agent.is_some())
            .field("proxy_jump", &self.proxy_jump)
            .field("proxy_command", &self.proxy_command)
            .field("log_verbosity", &self.log_verbosity)
            .field("forward_agent", &self.forward_agent)
            .finish()
    }
}
