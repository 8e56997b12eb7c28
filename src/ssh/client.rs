//! SSH dial using russh
//!
//! `dial` starts a session loop and runs the whole connection on it: TCP
//! connect (or a proxy tunnel), handshake, host key check, authentication
//! with each configured method in order, then the handle owner task.

use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, Handle, Msg};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::ssh_key::Algorithm;
use russh::keys::PublicKey;
use russh::Channel;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info, info_span, warn, Instrument};

use super::agent::AgentAuthenticator;
use super::config::{AuthMethod, SshClientConfig};
use super::error::SshError;
use super::event_loop::SessionLoop;
use super::handle_owner::spawn_handle_owner_task;
use super::known_hosts::{HostKeyVerification, KnownHostsStore};
use super::proxy::{establish_tunnel, ProxyCommand, SessionConnector};
use super::session::{SessionShared, SshSession};
use crate::agent::RequestOrigin;
use crate::forwarding::InboundForward;

/// Missed keepalives before russh drops the connection
const KEEPALIVE_MAX: usize = 3;

/// Expand ~ to the home directory (russh::keys doesn't handle tilde)
pub(crate) fn expand_tilde(path: &str) -> String {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped).to_string_lossy().into_owned();
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home.to_string_lossy().into_owned();
        }
    }
    path.to_string()
}

/// Client handler for russh callbacks
///
/// Verifies the host key against known_hosts, hands `forwarded-tcpip`
/// channels to the session's forward router and serves
/// `auth-agent@openssh.com` channels when agent forwarding is on.
pub struct ClientHandler {
    host: String,
    port: u16,
    /// - true: reject unknown and changed keys
    /// - false: record unknown keys, still reject changed ones
    strict: bool,
    known_hosts: Arc<KnownHostsStore>,
    shared: Arc<SessionShared>,
}

impl ClientHandler {
    pub(crate) fn new(
        host: &str,
        port: u16,
        strict: bool,
        known_hosts: Arc<KnownHostsStore>,
        shared: Arc<SessionShared>,
    ) -> Self {
        Self {
            host: host.to_string(),
            port,
            strict,
            known_hosts,
            shared,
        }
    }

    fn accept_host_key(&self, key: &PublicKey) -> Result<bool, SshError> {
        match self.known_hosts.verify(&self.host, self.port, key) {
            HostKeyVerification::Verified => {
                info!("Host key verified for {}:{}", self.host, self.port);
                Ok(true)
            }
            HostKeyVerification::Unknown { fingerprint } if self.strict => {
                warn!(
                    "Unknown host key for {}:{} (fingerprint: {}). Strict mode enabled, rejecting.",
                    self.host, self.port, fingerprint
                );
                Err(SshError::ConnectionError(format!(
                    "Host key verification failed: unknown host {}:{}. Fingerprint: {}. \
                     Add it to {} or disable strict mode.",
                    self.host,
                    self.port,
                    fingerprint,
                    self.known_hosts.path().display()
                )))
            }
            HostKeyVerification::Unknown { fingerprint } => {
                info!(
                    "New host {}:{}, adding to known_hosts (fingerprint: {})",
                    self.host, self.port, fingerprint
                );
                if let Err(e) = self.known_hosts.add_host(&self.host, self.port, key) {
                    warn!("Failed to save host key: {}", e);
                }
                Ok(true)
            }
            HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => {
                warn!(
                    "HOST KEY CHANGED for {}:{}! Expected {}, got {}. POSSIBLE MITM ATTACK!",
                    self.host, self.port, expected_fingerprint, actual_fingerprint
                );
                Err(SshError::ConnectionError(format!(
                    "HOST KEY VERIFICATION FAILED: Key for {}:{} has changed! \
                     Expected: {}, Actual: {}. \
                     If the change is legitimate, remove the old key from {}",
                    self.host,
                    self.port,
                    expected_fingerprint,
                    actual_fingerprint,
                    self.known_hosts.path().display()
                )))
            }
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        self.accept_host_key(server_public_key)
    }

    /// The server accepted a connection on a port bound with `tcpip-forward`.
    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        info!(
            "Server opened forwarded-tcpip channel: {}:{} from {}:{}",
            connected_address, connected_port, originator_address, originator_port
        );
        let stream = self.shared.adopt(
            channel,
            format!("forwarded {}:{}", connected_address, connected_port),
        );
        let inbound = InboundForward {
            stream,
            originator: originator_address.to_string(),
            originator_port,
        };
        if let Err(unclaimed) = self.shared.router().route(connected_port, inbound) {
            warn!(
                "No remote forward registered for port {}, closing channel",
                connected_port
            );
            unclaimed.stream.cancel();
        }
        Ok(())
    }

    async fn server_channel_open_agent_forward(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let Some(agent) = self.shared.forwarding_agent().cloned() else {
            warn!("Server {} opened an agent channel without agent forwarding", self.host);
            let _ = channel.close().await;
            return Ok(());
        };
        debug!("Serving forwarded agent channel for {}", self.host);
        let stream = self.shared.adopt(channel, "auth-agent");
        let origin = RequestOrigin::forwarded(self.shared.host());
        tokio::spawn(async move {
            match agent.serve_stream(stream, origin).await {
                Ok(served) => debug!("Forwarded agent channel closed after {} request(s)", served),
                Err(e) => warn!("Forwarded agent channel failed: {}", e),
            }
        });
        Ok(())
    }
}

/// Dial `host` on a fresh session loop.
///
/// The loop outlives this call only when the dial succeeds; it is stopped by
/// [`SshSession::cancel`].
pub async fn dial(host: &str, config: SshClientConfig) -> Result<SshSession, SshError> {
    let session_loop = SessionLoop::start(host).await?;
    let dial_loop = session_loop.clone();
    let host_owned = host.to_string();
    let result = session_loop
        .run(async move { dial_on(dial_loop, &host_owned, config).await })
        .await;
    if let Err(e) = &result {
        warn!("Dial to {} failed: {}", host, e);
        session_loop.shutdown();
    }
    result
}

/// Dial `host` on an existing loop. Must run on that loop.
pub(crate) async fn dial_on(
    session_loop: Arc<SessionLoop>,
    host: &str,
    config: SshClientConfig,
) -> Result<SshSession, SshError> {
    let span = info_span!("ssh", host = %host, port = config.port);
    async move {
        let shared = SessionShared::new(
            host,
            session_loop.handle().clone(),
            config.agent.clone(),
            config.forward_agent,
        );

        let (handle, tunnel) = match ProxyCommand::from_config(&config, host)? {
            Some(command) => {
                info!("Dialing {} through proxy: {}", host, command);
                let connector = SessionConnector::new(&config, session_loop.clone());
                let (tunnel, transport) = establish_tunnel(&connector, &command).await?;
                match establish(transport, host, &config, &shared).await {
                    Ok(handle) => (handle, Some(tunnel)),
                    Err(e) => {
                        tunnel.cancel();
                        return Err(e);
                    }
                }
            }
            None => {
                let socket = connect_tcp(host, &config).await?;
                (establish(socket, host, &config, &shared).await?, None)
            }
        };

        let controller = spawn_handle_owner_task(handle, host.to_string(), session_loop.handle());
        Ok(SshSession::new(shared, controller, session_loop, tunnel))
    }
    .instrument(span)
    .await
}

async fn connect_tcp(host: &str, config: &SshClientConfig) -> Result<TcpStream, SshError> {
    let addr = format!("{}:{}", host, config.port);
    info!("Connecting to SSH server at {}", addr);
    let socket = tokio::time::timeout(config.connection_timeout(), TcpStream::connect(&addr))
        .await
        .map_err(|_| SshError::ConnectionError(format!("Connection to {} timed out", addr)))?
        .map_err(|e| SshError::ConnectionError(format!("Failed to connect to {}: {}", addr, e)))?;
    if let Err(e) = socket.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }
    Ok(socket)
}

/// Handshake and authenticate over `transport`.
async fn establish<S>(
    transport: S,
    host: &str,
    config: &SshClientConfig,
    shared: &Arc<SessionShared>,
) -> Result<Handle<ClientHandler>, SshError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let ssh_config = client::Config {
        // App-level keepalive handles liveness
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(config.keepalive_interval_secs)),
        keepalive_max: KEEPALIVE_MAX,
        ..Default::default()
    };
    let known_hosts = Arc::new(KnownHostsStore::with_path(
        config
            .known_hosts_path
            .clone()
            .unwrap_or_else(KnownHostsStore::default_path),
    ));
    let handler = ClientHandler::new(
        host,
        config.port,
        config.strict_host_key_checking,
        known_hosts,
        shared.clone(),
    );

    let mut handle = tokio::time::timeout(
        config.connection_timeout(),
        client::connect_stream(Arc::new(ssh_config), transport, handler),
    )
    .await
    .map_err(|_| SshError::Timeout(format!("SSH handshake with {} timed out", host)))??;
    debug!("SSH handshake completed");

    authenticate(&mut handle, host, config).await?;
    Ok(handle)
}

/// Try each method in order; `AuthFailed` lists every method attempted.
async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    host: &str,
    config: &SshClientConfig,
) -> Result<(), SshError> {
    let methods = if config.auth_methods.is_empty() {
        vec![AuthMethod::None]
    } else {
        config.auth_methods.clone()
    };

    let mut attempted = Vec::with_capacity(methods.len());
    for method in &methods {
        attempted.push(method.name().to_string());
        debug!("Trying {} authentication as {}", method.name(), config.user);
        match try_method(handle, method, host, config).await {
            Ok(true) => {
                info!("SSH authentication successful ({})", method.name());
                return Ok(());
            }
            // russh reports a dropped connection as a plain rejection.
            Ok(false) if handle.is_closed() => {
                warn!("Connection to {} closed during {} authentication", host, method.name());
                return Err(SshError::Disconnected);
            }
            Ok(false) => debug!("{} authentication rejected", method.name()),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => warn!("{} authentication failed: {}", method.name(), e),
        }
    }
    Err(SshError::AuthFailed(attempted))
}

async fn try_method(
    handle: &mut Handle<ClientHandler>,
    method: &AuthMethod,
    host: &str,
    config: &SshClientConfig,
) -> Result<bool, SshError> {
    let user = config.user.as_str();
    match method {
        AuthMethod::Password { password } => Ok(handle
            .authenticate_password(user, password)
            .await?
            .success()),
        AuthMethod::Key {
            key_path,
            passphrase,
        } => {
            let key_path = expand_tilde(key_path);
            let key = russh::keys::load_secret_key(&key_path, passphrase.as_deref())
                .map_err(|e| SshError::KeyError(format!("{}: {}", key_path, e)))?;
            let hash_alg = if matches!(key.algorithm(), Algorithm::Rsa { .. }) {
                handle.best_supported_rsa_hash().await?.flatten()
            } else {
                None
            };
            Ok(handle
                .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg))
                .await?
                .success())
        }
        AuthMethod::Certificate {
            key_path,
            cert_path,
            passphrase,
        } => {
            let key_path = expand_tilde(key_path);
            let cert_path = expand_tilde(cert_path);
            let key = russh::keys::load_secret_key(&key_path, passphrase.as_deref())
                .map_err(|e| SshError::KeyError(format!("{}: {}", key_path, e)))?;
            let cert = russh::keys::load_openssh_certificate(&cert_path)
                .map_err(|e| SshError::KeyError(format!("{}: {}", cert_path, e)))?;
            Ok(handle
                .authenticate_openssh_cert(user, Arc::new(key), cert)
                .await?
                .success())
        }
        AuthMethod::Agent => {
            let mut agent = match &config.agent {
                Some(agent) => AgentAuthenticator::connect_emulator(
                    agent,
                    host,
                    &tokio::runtime::Handle::current(),
                ),
                None => AgentAuthenticator::connect_system().await?,
            };
            agent.authenticate(handle, user).await
        }
        AuthMethod::None => Ok(handle.authenticate_none(user).await?.success()),
    }
}

#[cfg(test)]
mod tests {
    use russh::server::{self, Auth};
    use tempfile::tempdir;
    use tokio::net::TcpListener;
    use tokio::runtime;

    use super::*;
    use crate::agent::keys::fixtures;

    fn fixture_host_key() -> PublicKey {
        russh::keys::decode_secret_key(fixtures::ED25519, None)
            .unwrap()
            .public_key()
            .clone()
    }

    fn handler(strict: bool, known_hosts: Arc<KnownHostsStore>) -> ClientHandler {
        let shared = SessionShared::new("web01", runtime::Handle::current(), None, false);
        ClientHandler::new("web01", 2222, strict, known_hosts, shared)
    }

    #[test]
    fn test_expand_tilde() {
        assert_eq!(expand_tilde("/etc/ssh/key"), "/etc/ssh/key");
        if let Some(home) = dirs::home_dir() {
            assert_eq!(
                expand_tilde("~/.ssh/id_ed25519"),
                home.join(".ssh/id_ed25519").to_string_lossy()
            );
        }
    }

    #[tokio::test]
    async fn test_host_key_policy() {
        let dir = tempdir().unwrap();
        let store = Arc::new(KnownHostsStore::with_path(dir.path().join("known_hosts")));
        let key = fixture_host_key();

        assert!(matches!(
            handler(true, store.clone()).accept_host_key(&key),
            Err(SshError::ConnectionError(_))
        ));
        assert!(handler(false, store.clone()).accept_host_key(&key).unwrap());
        assert_eq!(store.verify("web01", 2222, &key), HostKeyVerification::Verified);
        assert!(handler(true, store.clone()).accept_host_key(&key).unwrap());

        let reloaded = Arc::new(KnownHostsStore::with_path(dir.path().join("known_hosts")));
        assert!(handler(true, reloaded).accept_host_key(&key).unwrap());
    }

    #[tokio::test]
    async fn test_changed_host_key_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        std::fs::write(
            &path,
            "[web01]:2222 ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl\n",
        )
        .unwrap();
        let store = Arc::new(KnownHostsStore::with_path(path));
        assert!(matches!(
            handler(false, store).accept_host_key(&fixture_host_key()),
            Err(SshError::ConnectionError(msg)) if msg.contains("has changed")
        ));
    }

    #[tokio::test]
    async fn test_dial_refused_is_connection_error() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let config = SshClientConfig::new("root")
            .port(port)
            .auth(AuthMethod::password("secret"));
        assert!(matches!(
            dial("127.0.0.1", config).await,
            Err(SshError::ConnectionError(_))
        ));
    }

    #[tokio::test]
    async fn test_dial_rejects_malformed_proxy_command() {
        let config = SshClientConfig::new("root").proxy_command("nc %h %p");
        assert!(matches!(
            dial("db.internal", config).await,
            Err(SshError::ProxyError(_))
        ));
    }

    /// Accepts only the password "right"; "drop" kills the connection.
    struct PasswordServer;

    impl server::Handler for PasswordServer {
        type Error = russh::Error;

        async fn auth_password(&mut self, _user: &str, password: &str) -> Result<Auth, Self::Error> {
            match password {
                "right" => Ok(Auth::Accept),
                "drop" => Err(russh::Error::Disconnect),
                _ => Ok(Auth::reject()),
            }
        }
    }

    async fn password_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = Arc::new(server::Config {
            keys: vec![russh::keys::decode_secret_key(fixtures::ED25519, None).unwrap()],
            auth_rejection_time: Duration::from_millis(10),
            auth_rejection_time_initial: Some(Duration::ZERO),
            ..Default::default()
        });
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let config = config.clone();
                tokio::spawn(async move {
                    if let Ok(session) = server::run_stream(config, socket, PasswordServer).await {
                        let _ = session.await;
                    }
                });
            }
        });
        port
    }

    fn password_config(port: u16, dir: &tempfile::TempDir) -> SshClientConfig {
        let mut config = SshClientConfig::new("root").port(port);
        config.known_hosts_path = Some(dir.path().join("known_hosts"));
        config
    }

    async fn dial_with_timeout(config: SshClientConfig) -> Result<SshSession, SshError> {
        tokio::time::timeout(Duration::from_secs(10), dial("127.0.0.1", config))
            .await
            .expect("dial did not finish")
    }

    #[tokio::test]
    async fn test_wrong_password_is_auth_failed() {
        let port = password_server().await;
        let dir = tempdir().unwrap();
        let config = password_config(port, &dir).auth(AuthMethod::password("wrong"));

        let err = dial_with_timeout(config).await.unwrap_err();
        assert_eq!(err, SshError::AuthFailed(vec!["password".to_string()]));
    }

    #[tokio::test]
    async fn test_failed_methods_accumulate() {
        let port = password_server().await;
        let dir = tempdir().unwrap();
        let config = password_config(port, &dir)
            .auth(AuthMethod::key(dir.path().join("missing_key").to_string_lossy(), None))
            .auth(AuthMethod::password("wrong"))
            .auth(AuthMethod::None);

        let err = dial_with_timeout(config).await.unwrap_err();
        assert_eq!(
            err,
            SshError::AuthFailed(vec![
                "publickey".to_string(),
                "password".to_string(),
                "none".to_string(),
            ])
        );
    }

    #[tokio::test]
    async fn test_later_method_succeeds() {
        let port = password_server().await;
        let dir = tempdir().unwrap();
        let config = password_config(port, &dir)
            .auth(AuthMethod::password("wrong"))
            .auth(AuthMethod::password("right"));

        let session = dial_with_timeout(config).await.unwrap();
        assert!(session.is_connected());
        assert_eq!(session.host(), "127.0.0.1");
        session.cancel();
    }

    #[tokio::test]
    async fn test_fatal_error_stops_method_loop() {
        let port = password_server().await;
        let dir = tempdir().unwrap();
        let config = password_config(port, &dir)
            .auth(AuthMethod::password("drop"))
            .auth(AuthMethod::password("right"));

        let err = dial_with_timeout(config).await.unwrap_err();
        assert!(err.is_fatal(), "unexpected {:?}", err);
        assert!(!matches!(err, SshError::AuthFailed(_)));
    }
}
