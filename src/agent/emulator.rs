//! In-process SSH agent
//!
//! An ordered keyring answering `request identities` and `sign` requests.
//! The keyring has a single owner; the [`SshAgent`] handle is passed
//! explicitly to dial configs and forwarders and clones share one ring.
//!
//! A linked super-agent (the agent of the hop in front of us in a jump
//! chain) lists its identities first and is asked first when it holds the
//! requested key.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::constraints::{AgentConstraint, RequestOrigin};
use super::keys::AgentKey;
use super::protocol::{AgentRequest, AgentResponse, Identity};
use crate::ssh::SshError;

/// One keyring entry
#[derive(Clone)]
pub struct AgentKeyEntry {
    pub name: String,
    pub key: AgentKey,
    pub constraints: Vec<Arc<dyn AgentConstraint>>,
    blob: Bytes,
}

impl AgentKeyEntry {
    /// Public key blob as listed
    pub fn key_blob(&self) -> &Bytes {
        &self.blob
    }
}

impl std::fmt::Debug for AgentKeyEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let constraints: Vec<&str> = self.constraints.iter().map(|c| c.name()).collect();
        f.debug_struct("AgentKeyEntry")
            .field("name", &self.name)
            .field("key", &self.key)
            .field("constraints", &constraints)
            .finish()
    }
}

#[derive(Default)]
struct AgentState {
    ring: Mutex<Vec<AgentKeyEntry>>,
    super_agent: Mutex<Option<SshAgent>>,
}

/// Cheap-clone handle to one keyring.
#[derive(Clone, Default)]
pub struct SshAgent {
    inner: Arc<AgentState>,
}

impl SshAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether both handles share one keyring.
    pub fn same_agent(&self, other: &SshAgent) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Add `key` under `name`. An existing entry with the same name is
    /// replaced at its position.
    pub fn load_key(
        &self,
        key: AgentKey,
        name: impl Into<String>,
        constraints: Vec<Arc<dyn AgentConstraint>>,
    ) -> Result<(), SshError> {
        let entry = AgentKeyEntry {
            name: name.into(),
            blob: key.public_key_blob()?,
            key,
            constraints,
        };

        let mut ring = self.inner.ring.lock();
        match ring.iter_mut().find(|existing| existing.name == entry.name) {
            Some(existing) => {
                debug!("Replacing agent key {}", entry.name);
                *existing = entry;
            }
            None => {
                info!("Loaded agent key {} ({})", entry.name, entry.key.key_type());
                ring.push(entry);
            }
        }
        Ok(())
    }

    /// Remove the key named `name` and return it.
    pub fn remove_key(&self, name: &str) -> Option<AgentKey> {
        let mut ring = self.inner.ring.lock();
        let index = ring.iter().position(|entry| entry.name == name)?;
        debug!("Removed agent key {}", name);
        Some(ring.remove(index).key)
    }

    pub fn clear(&self) {
        self.inner.ring.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.ring.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.ring.lock().is_empty()
    }

    /// Key names in ring order
    pub fn names(&self) -> Vec<String> {
        self.inner
            .ring
            .lock()
            .iter()
            .map(|entry| entry.name.clone())
            .collect()
    }

    /// Defer to `super_agent` first for listing and signing.
    pub fn link_to(&self, super_agent: &SshAgent) -> Result<(), SshError> {
        let mut cursor = Some(super_agent.clone());
        while let Some(agent) = cursor {
            if agent.same_agent(self) {
                return Err(SshError::AgentError("agent link would form a cycle".into()));
            }
            cursor = agent.super_agent();
        }
        *self.inner.super_agent.lock() = Some(super_agent.clone());
        Ok(())
    }

    pub fn unlink(&self) {
        self.inner.super_agent.lock().take();
    }

    pub fn super_agent(&self) -> Option<SshAgent> {
        self.inner.super_agent.lock().clone()
    }

    /// Identities in listing order: super-agent first, then ring order.
    pub fn identities(&self) -> Vec<Identity> {
        let mut identities = self
            .super_agent()
            .map(|agent| agent.identities())
            .unwrap_or_default();
        identities.extend(self.inner.ring.lock().iter().map(|entry| Identity {
            key_blob: entry.blob.clone(),
            name: entry.name.clone(),
        }));
        identities
    }

    fn holds(&self, key_blob: &[u8]) -> bool {
        let in_ring = self
            .inner
            .ring
            .lock()
            .iter()
            .any(|entry| entry.blob.as_ref() == key_blob);
        in_ring || self.super_agent().is_some_and(|agent| agent.holds(key_blob))
    }

    fn find(&self, key_blob: &[u8]) -> Option<AgentKeyEntry> {
        self.inner
            .ring
            .lock()
            .iter()
            .find(|entry| entry.blob.as_ref() == key_blob)
            .cloned()
    }

    /// Sign `data` with the key whose public blob is exactly `key_blob`.
    pub fn sign(
        &self,
        key_blob: &[u8],
        data: &[u8],
        flags: u32,
        origin: &RequestOrigin,
    ) -> Result<Bytes, SshError> {
        if let Some(agent) = self.super_agent() {
            if agent.holds(key_blob) {
                debug!("Deferring sign request to super-agent");
                return agent.sign(key_blob, data, flags, origin);
            }
        }

        let entry = self
            .find(key_blob)
            .ok_or_else(|| SshError::AgentDenied("no matching identity".into()))?;

        // Constraints run outside the ring lock; prompts may block.
        for constraint in &entry.constraints {
            if !constraint.enforce(&entry.name, &entry.key, origin) {
                warn!(
                    "Constraint {} denied use of {} for {}",
                    constraint.name(),
                    entry.name,
                    origin.host
                );
                return Err(SshError::AgentDenied(format!(
                    "{} refused key {}",
                    constraint.name(),
                    entry.name
                )));
            }
        }

        debug!(
            "Signing {} bytes with {} (flags {:#x})",
            data.len(),
            entry.name,
            flags
        );
        entry.key.sign(data, flags)
    }

    /// Answer one request frame body. Any failure becomes `SSH_AGENT_FAILURE`.
    pub fn handle(&self, body: &[u8], origin: &RequestOrigin) -> Bytes {
        let response = match AgentRequest::decode(body) {
            Ok(AgentRequest::RequestIdentities) => AgentResponse::Identities(self.identities()),
            Ok(AgentRequest::SignRequest {
                key_blob,
                data,
                flags,
            }) => match self.sign(&key_blob, &data, flags, origin) {
                Ok(signature) => AgentResponse::Signature(signature),
                Err(e) => {
                    warn!("Agent sign request failed: {}", e);
                    AgentResponse::Failure
                }
            },
            Ok(AgentRequest::Unknown(kind)) => {
                debug!("Unsupported agent request type {}", kind);
                AgentResponse::Failure
            }
            Err(e) => {
                warn!("Malformed agent request: {}", e);
                AgentResponse::Failure
            }
        };
        response.encode()
    }
}

impl std::fmt::Debug for SshAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshAgent")
            .field("keys", &self.names())
            .field("linked", &self.super_agent().is_some())
            .finish()
    }
}
