//! ProxyJump / ProxyCommand Implementation
//!
//! Connects through jump hosts with SSH-over-SSH. A proxy command has the
//! fixed shape `ssh (-J <jump>)? -W <host:port> <alias>`:
//!
//! ```text
//! Client --SSH--> [alias] --direct-tcpip--> host:port
//!                    ^
//!                    +-- itself dialed through <jump>, recursively
//! ```
//!
//! Each hop is one session plus one direct-tcpip Stream. The Stream is
//! bridged to an in-memory duplex pipe whose far end is the transport for
//! the next dial (`russh::client::connect_stream`). Cancelling a tunnel
//! cancels its hop session, which cancels that session's own tunnel.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::DuplexStream;
use tracing::{debug, info, warn};

use super::client::dial_on;
use super::config::SshClientConfig;
use super::error::SshError;
use super::event_loop::SessionLoop;
use super::session::{ChannelOpener, SshSession};
use super::stream::Stream;
use crate::config::{HostResolver, SshConfigResolver};

/// Buffer between a forwarding Stream and the nested transport
const TUNNEL_BUFFER: usize = 64 * 1024;

/// Parsed `ssh (-J jump)? -W host:port alias`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyCommand {
    /// Jump hosts for dialing `alias` itself (comma-separated, may nest further)
    pub jump: Option<String>,
    /// Forwarding target requested on the `alias` connection
    pub bind_host: String,
    pub bind_port: u16,
    /// Host (or ssh_config alias) the tunnel runs through
    pub alias: String,
}

fn proxy_error(command: &str, what: &str) -> SshError {
    SshError::ProxyError(format!("Invalid proxy command '{}': {}", command, what))
}

fn parse_bind(command: &str, bind: &str) -> Result<(String, u16), SshError> {
    let (host, port) = bind
        .rsplit_once(':')
        .ok_or_else(|| proxy_error(command, "-W target must be host:port"))?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return Err(proxy_error(command, "empty -W host"));
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| proxy_error(command, "invalid -W port"))?;
    Ok((host.to_string(), port))
}

impl ProxyCommand {
    pub fn parse(command: &str) -> Result<Self, SshError> {
        let mut tokens = command.split_whitespace();
        if tokens.next() != Some("ssh") {
            return Err(proxy_error(command, "must start with 'ssh'"));
        }

        let mut flag = tokens.next();
        let mut jump = None;
        if flag == Some("-J") {
            let value = tokens
                .next()
                .ok_or_else(|| proxy_error(command, "-J needs a jump host"))?;
            jump = Some(value.to_string());
            flag = tokens.next();
        }
        if flag != Some("-W") {
            return Err(proxy_error(command, "missing -W host:port"));
        }
        let bind = tokens
            .next()
            .ok_or_else(|| proxy_error(command, "-W needs host:port"))?;
        let (bind_host, bind_port) = parse_bind(command, bind)?;
        let alias = tokens
            .next()
            .ok_or_else(|| proxy_error(command, "missing destination alias"))?;
        if tokens.next().is_some() {
            return Err(proxy_error(command, "unexpected trailing arguments"));
        }

        Ok(Self {
            jump,
            bind_host,
            bind_port,
            alias: alias.to_string(),
        })
    }

    /// `ProxyJump j1,..,jn` for `host:port` becomes
    /// `ssh -J j1,..,j(n-1) -W host:port jn`.
    pub fn from_jump_hosts<S: AsRef<str>>(jumps: &[S], host: &str, port: u16) -> Result<Self, SshError> {
        let hops: Vec<&str> = jumps
            .iter()
            .map(|j| j.as_ref().trim())
            .filter(|j| !j.is_empty())
            .collect();
        let (alias, rest) = hops
            .split_last()
            .ok_or_else(|| SshError::ProxyError("Empty ProxyJump list".into()))?;
        Ok(Self {
            jump: (!rest.is_empty()).then(|| rest.join(",")),
            bind_host: host.to_string(),
            bind_port: port,
            alias: alias.to_string(),
        })
    }

    /// Expand `%h`, `%p` and `%%` the way OpenSSH does for ProxyCommand.
    pub fn substitute(command: &str, host: &str, port: u16) -> String {
        let mut out = String::with_capacity(command.len());
        let mut chars = command.chars();
        while let Some(c) = chars.next() {
            if c != '%' {
                out.push(c);
                continue;
            }
            match chars.next() {
                Some('h') => out.push_str(host),
                Some('p') => out.push_str(&port.to_string()),
                Some('%') => out.push('%'),
                Some(other) => {
                    out.push('%');
                    out.push(other);
                }
                None => out.push('%'),
            }
        }
        out
    }

    /// Proxy route for dialing `host:port` with `config`, if any.
    /// A literal proxy command wins over `proxy_jump`.
    pub fn from_config(config: &SshClientConfig, host: &str) -> Result<Option<Self>, SshError> {
        if let Some(command) = &config.proxy_command {
            let expanded = Self::substitute(command, host, config.port);
            return Self::parse(&expanded).map(Some);
        }
        match &config.proxy_jump {
            Some(jumps) => {
                let jumps: Vec<&str> = jumps.split(',').collect();
                Self::from_jump_hosts(&jumps, host, config.port).map(Some)
            }
            None => Ok(None),
        }
    }
}

impl fmt::Display for ProxyCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ssh ")?;
        if let Some(jump) = &self.jump {
            write!(f, "-J {} ", jump)?;
        }
        if self.bind_host.contains(':') {
            write!(f, "-W [{}]:{} {}", self.bind_host, self.bind_port, self.alias)
        } else {
            write!(f, "-W {}:{} {}", self.bind_host, self.bind_port, self.alias)
        }
    }
}

/// A connection a tunnel can run through.
pub trait ProxyHop: ChannelOpener {
    /// Tear the hop down, including anything it was itself tunnelled through.
    fn cancel(&self);
    fn label(&self) -> String;
}

impl ProxyHop for SshSession {
    fn cancel(&self) {
        SshSession::cancel(self);
    }

    fn label(&self) -> String {
        self.host().to_string()
    }
}

/// Dials the hop a proxy command names.
#[async_trait]
pub trait HopConnector: Send + Sync {
    async fn dial_hop(&self, alias: &str, jump: Option<&str>) -> Result<Arc<dyn ProxyHop>, SshError>;
}

/// One established hop: its session and the forwarding Stream carrying the
/// next transport.
pub struct ProxyTunnel {
    hop: Arc<dyn ProxyHop>,
    stream: Stream,
}

impl ProxyTunnel {
    pub fn hop_label(&self) -> String {
        self.hop.label()
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    /// Cancel the forwarding Stream and the hop (recursively). Idempotent.
    pub fn cancel(&self) {
        debug!("Tearing down proxy hop {}", self.hop.label());
        self.stream.cancel();
        self.hop.cancel();
    }
}

impl fmt::Debug for ProxyTunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyTunnel")
            .field("hop", &self.hop.label())
            .field("stream", &self.stream)
            .finish()
    }
}

/// Dial `command.alias` (through its own jump, if any), open the forwarding
/// channel to the bind target and return the tunnel plus the transport end
/// for the next dial.
///
/// Failures come back as `ProxyError`; a hop whose forward fails is
/// cancelled before returning.
pub async fn establish_tunnel(
    connector: &dyn HopConnector,
    command: &ProxyCommand,
) -> Result<(ProxyTunnel, DuplexStream), SshError> {
    info!(
        "Establishing proxy hop {} -> {}:{}",
        command.alias, command.bind_host, command.bind_port
    );

    let hop = connector
        .dial_hop(&command.alias, command.jump.as_deref())
        .await
        .map_err(|e| e.into_proxy_error(&command.alias))?;

    let stream = match hop
        .open_forward(&command.bind_host, command.bind_port, "127.0.0.1", 0)
        .await
    {
        Ok(stream) => stream,
        Err(e) => {
            warn!(
                "Proxy hop {} could not forward to {}:{}: {}",
                command.alias, command.bind_host, command.bind_port, e
            );
            hop.cancel();
            return Err(e.into_proxy_error(&command.alias));
        }
    };

    let (near, far) = tokio::io::duplex(TUNNEL_BUFFER);
    let tunnel = ProxyTunnel { hop, stream };
    if let Err(e) = tunnel.stream.bridge(near) {
        tunnel.cancel();
        return Err(e.into_proxy_error(&command.alias));
    }
    debug!("Proxy hop {} ready", command.alias);
    Ok((tunnel, far))
}

/// Dials hops as real sessions on the outer dial's loop.
pub(crate) struct SessionConnector {
    base: SshClientConfig,
    session_loop: Arc<SessionLoop>,
}

impl SessionConnector {
    pub(crate) fn new(base: &SshClientConfig, session_loop: Arc<SessionLoop>) -> Self {
        Self {
            base: base.clone(),
            session_loop,
        }
    }

    /// Hop config: the resolved alias, falling back to the outer config.
    fn hop_config(&self, alias: &str, jump: Option<&str>) -> (String, SshClientConfig) {
        let resolver: Arc<dyn HostResolver> = match &self.base.host_resolver {
            Some(resolver) => resolver.clone(),
            None => Arc::new(SshConfigResolver::default()),
        };

        let (host, mut config) = match resolver.resolve(alias) {
            Some((host, mut resolved)) => {
                if resolved.auth_methods.is_empty() {
                    resolved.auth_methods = self.base.auth_methods.clone();
                }
                if resolved.user.is_empty() {
                    resolved.user = self.base.user.clone();
                }
                (host, resolved)
            }
            None => {
                let mut fallback = self.base.clone();
                fallback.port = 22;
                (alias.to_string(), fallback)
            }
        };

        config.proxy_jump = jump.map(str::to_string);
        config.proxy_command = None;
        config.agent = config.agent.or_else(|| self.base.agent.clone());
        config.known_hosts_path = config
            .known_hosts_path
            .or_else(|| self.base.known_hosts_path.clone());
        config.host_resolver = Some(resolver);
        config.log_verbosity = self.base.log_verbosity;
        config.forward_agent = false;
        (host, config)
    }
}

#[async_trait]
impl HopConnector for SessionConnector {
    async fn dial_hop(&self, alias: &str, jump: Option<&str>) -> Result<Arc<dyn ProxyHop>, SshError> {
        let (host, config) = self.hop_config(alias, jump);
        let hop_loop = SessionLoop::attach(&format!("hop-{}", host), self.session_loop.handle().clone());
        let session = dial_on(hop_loop, &host, config).await?;
        Ok(Arc::new(session))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use parking_lot::Mutex;
    use tokio::io::AsyncWriteExt;
    use tokio::runtime::Handle;

    use super::*;
    use crate::ssh::channel_io::mock::MockChannel;

    #[test]
    fn test_parse_proxy_command() {
        let cmd = ProxyCommand::parse("ssh -J jump1 -W db.internal:5432 jump2").unwrap();
        assert_eq!(cmd.jump.as_deref(), Some("jump1"));
        assert_eq!((cmd.bind_host.as_str(), cmd.bind_port), ("db.internal", 5432));
        assert_eq!(cmd.alias, "jump2");

        let cmd = ProxyCommand::parse("ssh  -W [::1]:22   bastion").unwrap();
        assert_eq!(cmd.jump, None);
        assert_eq!(cmd.bind_host, "::1");
        assert_eq!(cmd.to_string(), "ssh -W [::1]:22 bastion");
    }

    #[test]
    fn test_parse_rejects_other_shapes() {
        for bad in [
            "nc db 22",
            "ssh bastion",
            "ssh -J -W db:22",
            "ssh -W db bastion",
            "ssh -W db:99999 bastion",
            "ssh -W db:22",
            "ssh -W db:22 bastion extra",
        ] {
            assert!(
                matches!(ProxyCommand::parse(bad), Err(SshError::ProxyError(_))),
                "{} should not parse",
                bad
            );
        }
    }

    #[test]
    fn test_from_jump_hosts() {
        let cmd = ProxyCommand::from_jump_hosts(&["j1", "j2", "j3"], "target", 22).unwrap();
        assert_eq!(cmd.to_string(), "ssh -J j1,j2 -W target:22 j3");
        let cmd = ProxyCommand::from_jump_hosts(&["bastion"], "target", 2222).unwrap();
        assert_eq!(cmd.to_string(), "ssh -W target:2222 bastion");
        assert!(ProxyCommand::from_jump_hosts::<&str>(&[], "target", 22).is_err());
    }

    #[test]
    fn test_substitute_and_config_precedence() {
        assert_eq!(
            ProxyCommand::substitute("ssh -W %h:%p bastion %%", "db", 5432),
            "ssh -W db:5432 bastion %"
        );

        let config = SshClientConfig::new("root")
            .port(2200)
            .proxy_jump("j1,j2")
            .proxy_command("ssh -W %h:%p gateway");
        let cmd = ProxyCommand::from_config(&config, "db").unwrap().unwrap();
        assert_eq!(cmd.alias, "gateway");
        assert_eq!(cmd.bind_port, 2200);

        let config = SshClientConfig::new("root").proxy_jump("j1, j2");
        let cmd = ProxyCommand::from_config(&config, "db").unwrap().unwrap();
        assert_eq!(cmd.to_string(), "ssh -J j1 -W db:22 j2");
        assert!(ProxyCommand::from_config(&SshClientConfig::new("root"), "db")
            .unwrap()
            .is_none());
    }

    struct FakeHop {
        name: String,
        live: Arc<AtomicUsize>,
        cancelled: AtomicBool,
        fail_forward: bool,
        inner: Option<ProxyTunnel>,
        channels: Arc<Mutex<Vec<Arc<MockChannel>>>>,
    }

    #[async_trait]
    impl ChannelOpener for FakeHop {
        async fn open_forward(
            &self,
            to: &str,
            port: u16,
            _from: &str,
            _local_port: u16,
        ) -> Result<Stream, SshError> {
            if self.fail_forward {
                return Err(SshError::ChannelError(format!(
                    "{}: open to {}:{} refused",
                    self.name, to, port
                )));
            }
            let channel = MockChannel::new(1 << 16);
            self.channels.lock().push(channel.clone());
            Ok(Stream::new(channel.io(), format!("{} -> {}", self.name, to), Handle::current(), None))
        }
    }

    impl ProxyHop for FakeHop {
        fn cancel(&self) {
            if self.cancelled.swap(true, Ordering::SeqCst) {
                return;
            }
            self.live.fetch_sub(1, Ordering::SeqCst);
            if let Some(inner) = &self.inner {
                inner.cancel();
            }
        }

        fn label(&self) -> String {
            self.name.clone()
        }
    }

    /// Dials `jumpN` hops; the hop named in `failing` refuses to forward.
    struct FakeConnector {
        live: Arc<AtomicUsize>,
        failing: Option<&'static str>,
        channels: Arc<Mutex<Vec<Arc<MockChannel>>>>,
    }

    impl FakeConnector {
        fn new(failing: Option<&'static str>) -> Self {
            Self {
                live: Arc::new(AtomicUsize::new(0)),
                failing,
                channels: Arc::default(),
            }
        }
    }

    #[async_trait]
    impl HopConnector for FakeConnector {
        async fn dial_hop(&self, alias: &str, jump: Option<&str>) -> Result<Arc<dyn ProxyHop>, SshError> {
            let inner = match jump {
                Some(jump) => {
                    let jumps: Vec<&str> = jump.split(',').collect();
                    let command = ProxyCommand::from_jump_hosts(&jumps, alias, 22)?;
                    let (tunnel, _transport) = establish_tunnel(self, &command).await?;
                    Some(tunnel)
                }
                None => None,
            };
            self.live.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FakeHop {
                name: alias.to_string(),
                live: self.live.clone(),
                cancelled: AtomicBool::new(false),
                fail_forward: self.failing == Some(alias),
                inner,
                channels: self.channels.clone(),
            }))
        }
    }

    #[tokio::test]
    async fn test_depth_two_chain_tunnels_and_cascades() {
        let connector = FakeConnector::new(None);
        let command = ProxyCommand::from_jump_hosts(&["jump1", "jump2"], "destination", 22).unwrap();

        let (tunnel, mut transport) = establish_tunnel(&connector, &command).await.unwrap();
        assert_eq!(connector.live.load(Ordering::SeqCst), 2);
        assert_eq!(tunnel.hop_label(), "jump2");

        transport.write_all(b"SSH-2.0-test\r\n").await.unwrap();
        let outer = connector.channels.lock().last().cloned().unwrap();
        for _ in 0..100 {
            if outer.written() == b"SSH-2.0-test\r\n" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(outer.written(), b"SSH-2.0-test\r\n");

        tunnel.cancel();
        tunnel.cancel();
        assert_eq!(connector.live.load(Ordering::SeqCst), 0);
        for channel in connector.channels.lock().iter() {
            assert_eq!(channel.close_calls(), 1);
        }
    }

    #[tokio::test]
    async fn test_failed_inner_forward_leaks_no_hops() {
        let connector = FakeConnector::new(Some("jump2"));
        let command = ProxyCommand::from_jump_hosts(&["jump1", "jump2"], "destination", 22).unwrap();

        let err = establish_tunnel(&connector, &command).await.unwrap_err();
        assert!(matches!(&err, SshError::ProxyError(msg) if msg.contains("jump2")));
        assert_eq!(connector.live.load(Ordering::SeqCst), 0);
        assert!(connector
            .channels
            .lock()
            .iter()
            .all(|channel| channel.close_calls() == 1));
    }

    #[tokio::test]
    async fn test_failure_below_the_outer_hop_is_wrapped_once() {
        let connector = FakeConnector::new(Some("jump1"));
        let command = ProxyCommand::from_jump_hosts(&["jump1", "jump2"], "destination", 22).unwrap();

        let err = establish_tunnel(&connector, &command).await.unwrap_err();
        match err {
            SshError::ProxyError(msg) => {
                assert!(msg.starts_with("jump1"));
                assert!(!msg.contains("Proxy error"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(connector.live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_hop_config_resolves_aliases() {
        let resolver = Arc::new(SshConfigResolver::from_content(
            "Host bastion\n    HostName jump.example.com\n    User ops\n    Port 2200\n",
        ));
        let mut base = SshClientConfig::new("root")
            .auth(crate::ssh::AuthMethod::password("x"))
            .proxy_command("ssh -W db:22 bastion")
            .host_resolver(resolver);
        base.forward_agent = true;
        let connector = SessionConnector::new(&base, SessionLoop::attach("test", Handle::current()));

        let (host, config) = connector.hop_config("bastion", Some("edge"));
        assert_eq!(host, "jump.example.com");
        assert_eq!((config.user.as_str(), config.port), ("ops", 2200));
        assert_eq!(config.auth_methods, base.auth_methods);
        assert_eq!(config.proxy_jump.as_deref(), Some("edge"));
        assert!(config.proxy_command.is_none());
        assert!(!config.forward_agent);

        let (host, config) = connector.hop_config("gateway", None);
        assert_eq!(host, "gateway");
        assert_eq!((config.user.as_str(), config.port), ("root", 22));
        assert!(config.proxy_jump.is_none());
    }
}
