//! SSH Error types

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SshError {
    /// DNS or socket failure while reaching a host
    #[error("Connection failed: {0}")]
    ConnectionError(String),

    /// Every configured authentication method was rejected
    #[error("Authentication failed (tried: {})", .0.join(", "))]
    AuthFailed(Vec<String>),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    /// An agent constraint refused a signing request
    #[error("Agent denied request: {0}")]
    AgentDenied(String),

    #[error("Port already in use: {0}")]
    PortInUse(String),

    #[error("Proxy error: {0}")]
    ProxyError(String),

    #[error("Key error: {0}")]
    KeyError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Disconnected")]
    Disconnected,

    #[error("SSH Agent error: {0}")]
    AgentError(String),

    #[error("known_hosts error: {0}")]
    KnownHosts(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl SshError {
    /// Wrap an inner-hop failure for the outermost dial of a proxy chain.
    ///
    /// Already-wrapped errors are passed through so nested hops do not stack prefixes.
    pub fn into_proxy_error(self, hop: &str) -> Self {
        match self {
            SshError::ProxyError(_) => self,
            other => SshError::ProxyError(format!("{}: {}", hop, other)),
        }
    }

    /// Whether this failure ends the transport rather than a single channel.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SshError::Disconnected | SshError::ConnectionError(_) | SshError::ProtocolError(_)
        )
    }
}

impl From<std::io::Error> for SshError {
    fn from(err: std::io::Error) -> Self {
        SshError::Io(err.to_string())
    }
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::Disconnect => SshError::Disconnected,
            other => SshError::ProtocolError(other.to_string()),
        }
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::KeyError(err.to_string())
    }
}

impl serde::Serialize for SshError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_failed_lists_methods() {
        let err = SshError::AuthFailed(vec!["password".into(), "publickey".into()]);
        assert_eq!(
            err.to_string(),
            "Authentication failed (tried: password, publickey)"
        );
    }

    #[test]
    fn test_proxy_wrapping_is_not_nested() {
        let inner = SshError::ChannelError("open failed".into()).into_proxy_error("jump2");
        assert_eq!(
            inner,
            SshError::ProxyError("jump2: Channel error: open failed".into())
        );
        let outer = inner.clone().into_proxy_error("jump1");
        assert_eq!(outer, inner);
    }

    #[test]
    fn test_serialize_as_string() {
        let json = serde_json::to_string(&SshError::PortInUse("127.0.0.1:22".into())).unwrap();
        assert_eq!(json, "\"Port already in use: 127.0.0.1:22\"");
    }
}
