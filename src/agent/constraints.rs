//! Per-key usage constraints
//!
//! Constraints are consulted on every signing request for the key they are
//! attached to, never when identities are listed.

use std::fmt;

use parking_lot::Mutex;

use super::keys::AgentKey;

/// Who is asking the agent for a signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOrigin {
    /// Host the request is tied to (the session the agent serves)
    pub host: String,
    /// Arrived over an `auth-agent@openssh.com` channel
    pub forwarded: bool,
}

impl RequestOrigin {
    /// Request made by this process while authenticating to `host`.
    pub fn local(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            forwarded: false,
        }
    }

    /// Request relayed by `host` through agent forwarding.
    pub fn forwarded(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            forwarded: true,
        }
    }
}

/// Policy attached to an agent key.
pub trait AgentConstraint: Send + Sync {
    fn name(&self) -> &str;

    /// `false` denies this signing request.
    fn enforce(&self, key_name: &str, key: &AgentKey, origin: &RequestOrigin) -> bool;
}

/// Deny every request that arrives through agent forwarding.
#[derive(Debug, Default, Clone, Copy)]
pub struct TrustedConnectionOnly;

impl AgentConstraint for TrustedConnectionOnly {
    fn name(&self) -> &str {
        "trusted-connection-only"
    }

    fn enforce(&self, _key_name: &str, _key: &AgentKey, origin: &RequestOrigin) -> bool {
        !origin.forwarded
    }
}

/// Answer from a [`ConfirmUse`] prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    AllowOnce,
    DenyOnce,
    /// Allow this and every later request
    AlwaysAllow,
    /// Deny this and every later request
    NeverAllow,
}

type Prompt = dyn Fn(&str, &RequestOrigin) -> Confirmation + Send + Sync;

/// Ask before each use of the key. A remembered answer short-circuits the prompt.
pub struct ConfirmUse {
    prompt: Box<Prompt>,
    remembered: Mutex<Option<bool>>,
}

impl ConfirmUse {
    pub fn new<F>(prompt: F) -> Self
    where
        F: Fn(&str, &RequestOrigin) -> Confirmation + Send + Sync + 'static,
    {
        Self {
            prompt: Box::new(prompt),
            remembered: Mutex::new(None),
        }
    }

    /// Drop any remembered answer.
    pub fn forget(&self) {
        *self.remembered.lock() = None;
    }
}

impl AgentConstraint for ConfirmUse {
    fn name(&self) -> &str {
        "confirm-use"
    }

    fn enforce(&self, key_name: &str, _key: &AgentKey, origin: &RequestOrigin) -> bool {
        if let Some(allowed) = *self.remembered.lock() {
            return allowed;
        }
        match (self.prompt)(key_name, origin) {
            Confirmation::AllowOnce => true,
            Confirmation::DenyOnce => false,
            Confirmation::AlwaysAllow => {
                *self.remembered.lock() = Some(true);
                true
            }
            Confirmation::NeverAllow => {
                *self.remembered.lock() = Some(false);
                false
            }
        }
    }
}

impl fmt::Debug for ConfirmUse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfirmUse")
            .field("remembered", &*self.remembered.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::keys::fixtures;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn key() -> AgentKey {
        AgentKey::decode(fixtures::ED25519, None).unwrap()
    }

    #[test]
    fn test_trusted_connection_only() {
        let constraint = TrustedConnectionOnly;
        assert!(constraint.enforce("id", &key(), &RequestOrigin::local("web")));
        assert!(!constraint.enforce("id", &key(), &RequestOrigin::forwarded("web")));
    }

    #[test]
    fn test_confirm_use_remembers_permanent_answers() {
        let prompts = Arc::new(AtomicUsize::new(0));
        let counter = prompts.clone();
        let constraint = ConfirmUse::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Confirmation::NeverAllow
        });
        let origin = RequestOrigin::local("db");

        assert!(!constraint.enforce("id", &key(), &origin));
        assert!(!constraint.enforce("id", &key(), &origin));
        assert_eq!(prompts.load(Ordering::SeqCst), 1);

        constraint.forget();
        assert!(!constraint.enforce("id", &key(), &origin));
        assert_eq!(prompts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_confirm_use_once_asks_again() {
        let prompts = Arc::new(AtomicUsize::new(0));
        let counter = prompts.clone();
        let constraint = ConfirmUse::new(move |name, origin| {
            assert_eq!(name, "deploy");
            assert_eq!(origin.host, "ci");
            counter.fetch_add(1, Ordering::SeqCst);
            Confirmation::AllowOnce
        });

        assert!(constraint.enforce("deploy", &key(), &RequestOrigin::local("ci")));
        assert!(constraint.enforce("deploy", &key(), &RequestOrigin::local("ci")));
        assert_eq!(prompts.load(Ordering::SeqCst), 2);
    }
}
