//! Agent authentication
//!
//! `AuthMethod::Agent` signs the server challenge through russh's
//! [`AgentClient`]. The client talks either to the system agent
//! (`SSH_AUTH_SOCK`, or the OpenSSH named pipe on Windows) or to the
//! in-process [`SshAgent`] through an in-memory duplex socket served on the
//! session loop.
//!
//! # The `AgentSigner` wrapper
//!
//! russh's own `impl Signer for AgentClient` returns an RPITIT future that
//! borrows the `PublicKey` from `Reply::SignRequest` across an `.await`; the
//! compiler cannot prove that future `Send`. `AgentSigner` clones the key
//! before the async block so the future only captures owned values.

use std::future::Future;

use russh::client::Handle;
use russh::keys::agent::client::{AgentClient, AgentStream};
use russh::keys::ssh_key;
use russh::{AgentAuthError, CryptoVec, Signer};
use tokio::runtime;
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;
use crate::agent::{RequestOrigin, SshAgent};

type DynAgentClient = AgentClient<Box<dyn AgentStream + Send + Unpin + 'static>>;

struct AgentSigner<'a> {
    agent: &'a mut DynAgentClient,
}

impl Signer for AgentSigner<'_> {
    type Error = AgentAuthError;

    fn auth_publickey_sign(
        &mut self,
        key: &ssh_key::PublicKey,
        hash_alg: Option<ssh_key::HashAlg>,
        to_sign: CryptoVec,
    ) -> impl Future<Output = Result<CryptoVec, Self::Error>> + Send {
        let key_owned = key.clone();
        async move {
            self.agent
                .sign_request(&key_owned, hash_alg, to_sign)
                .await
                .map_err(Into::into)
        }
    }
}

/// Agent connection used for one authentication attempt
pub struct AgentAuthenticator {
    agent: DynAgentClient,
    source: &'static str,
}

impl AgentAuthenticator {
    /// Connect to the system SSH agent.
    pub async fn connect_system() -> Result<Self, SshError> {
        info!("Connecting to system SSH Agent");

        #[cfg(unix)]
        {
            let agent = AgentClient::connect_env().await.map_err(|e| {
                SshError::AgentError(format!(
                    "Failed to connect to SSH Agent: {}. \
                     Make sure SSH_AUTH_SOCK is set and ssh-agent is running.",
                    e
                ))
            })?;
            Ok(Self {
                agent: agent.dynamic(),
                source: "system agent",
            })
        }

        #[cfg(windows)]
        {
            let agent = AgentClient::connect_named_pipe(r"\\.\pipe\openssh-ssh-agent")
                .await
                .map_err(|e| {
                    SshError::AgentError(format!(
                        "Failed to connect to SSH Agent via named pipe: {}",
                        e
                    ))
                })?;
            Ok(Self {
                agent: agent.dynamic(),
                source: "system agent",
            })
        }

        #[cfg(not(any(unix, windows)))]
        {
            Err(SshError::AgentError(
                "SSH Agent is not supported on this platform".to_string(),
            ))
        }
    }

    /// Talk to the in-process agent. Requests are answered on `spawner`.
    pub fn connect_emulator(agent: &SshAgent, host: &str, spawner: &runtime::Handle) -> Self {
        let socket = agent.local_socket(RequestOrigin::local(host), spawner);
        Self {
            agent: AgentClient::connect(socket).dynamic(),
            source: "in-process agent",
        }
    }

    pub async fn identities(&mut self) -> Result<Vec<ssh_key::PublicKey>, SshError> {
        self.agent
            .request_identities()
            .await
            .map_err(|e| SshError::AgentError(format!("Failed to list agent keys: {}", e)))
    }

    /// Offer every agent key in turn. `Ok(false)` when none was accepted.
    pub async fn authenticate(
        &mut self,
        handle: &mut Handle<ClientHandler>,
        user: &str,
    ) -> Result<bool, SshError> {
        let keys = self.identities().await?;
        if keys.is_empty() {
            warn!("The {} holds no keys", self.source);
            return Ok(false);
        }
        info!(
            "The {} reports {} key(s), attempting authentication",
            self.source,
            keys.len()
        );

        for key in keys {
            debug!("Trying agent key: {} ({})", key.algorithm(), key.comment());
            let comment = key.comment().to_string();
            match handle
                .authenticate_publickey_with(
                    user,
                    key,
                    None,
                    &mut AgentSigner {
                        agent: &mut self.agent,
                    },
                )
                .await
            {
                Ok(result) if result.success() => {
                    info!("Agent authentication succeeded with key: {}", comment);
                    return Ok(true);
                }
                Ok(_) => debug!("Key rejected by server: {}", comment),
                Err(e) => warn!("Agent signing error for key {}: {}", comment, e),
            }
        }
        Ok(false)
    }
}

/// Whether a system agent socket appears to be configured.
pub fn is_agent_available() -> bool {
    #[cfg(unix)]
    {
        std::env::var("SSH_AUTH_SOCK").is_ok()
    }

    #[cfg(windows)]
    {
        true
    }

    #[cfg(not(any(unix, windows)))]
    {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::keys::fixtures;
    use crate::agent::AgentKey;

    #[tokio::test]
    async fn test_emulator_identities_through_agent_client() {
        let agent = SshAgent::new();
        let mut auth = AgentAuthenticator::connect_emulator(&agent, "web01", &runtime::Handle::current());
        assert!(auth.identities().await.unwrap().is_empty());

        agent
            .load_key(AgentKey::decode(fixtures::ED25519, None).unwrap(), "laptop", vec![])
            .unwrap();
        let keys = auth.identities().await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].algorithm(), ssh_key::Algorithm::Ed25519);
    }

    #[tokio::test]
    async fn test_emulator_signs_for_agent_client() {
        let agent = SshAgent::new();
        agent
            .load_key(AgentKey::decode(fixtures::ED25519, None).unwrap(), "laptop", vec![])
            .unwrap();
        let mut auth = AgentAuthenticator::connect_emulator(&agent, "web01", &runtime::Handle::current());
        let key = auth.identities().await.unwrap().remove(0);

        let challenge = CryptoVec::from_slice(b"session-id and userauth request");
        let signed = AgentSigner {
            agent: &mut auth.agent,
        }
        .auth_publickey_sign(&key, None, challenge.clone())
        .await
        .unwrap();
        assert!(signed.len() > challenge.len());
    }
}
