//! Agent key material
//!
//! A closed set of signer variants behind one signing interface. RSA keys
//! (plain or certificate-wrapped) pick their digest from the sign request
//! flags; every other key type has exactly one signature algorithm.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::ssh_key::{Algorithm, Certificate, HashAlg, PrivateKey, Signature};
use russh::keys::PublicKeyBase64;
use signature::Signer;

use super::protocol::{put_string, SSH_AGENT_RSA_SHA2_256, SSH_AGENT_RSA_SHA2_512};
use crate::ssh::SshError;

/// Hardware or OS keystore backed signer (Secure Enclave, TPM, smart card).
pub trait PlatformSigner: Send + Sync {
    /// Public key blob in wire format, without length prefix
    fn public_key_blob(&self) -> Bytes;

    /// Key type as it appears in `authorized_keys`
    fn key_type(&self) -> String;

    /// Produce an encoded signature blob (`string algorithm, string signature`).
    /// `algorithm` is `None` when the key type has a single algorithm.
    fn sign(&self, data: &[u8], algorithm: Option<&str>) -> Result<Bytes, SshError>;
}

#[derive(Clone)]
pub enum AgentKey {
    Rsa(Arc<PrivateKey>),
    Ecdsa(Arc<PrivateKey>),
    Ed25519(Arc<PrivateKey>),
    Certificate {
        key: Arc<PrivateKey>,
        cert: Arc<Certificate>,
    },
    Platform(Arc<dyn PlatformSigner>),
}

impl AgentKey {
    /// Classify a decoded private key.
    pub fn from_private_key(key: PrivateKey) -> Result<Self, SshError> {
        let key = Arc::new(key);
        match key.algorithm() {
            Algorithm::Rsa { .. } => Ok(AgentKey::Rsa(key)),
            Algorithm::Ecdsa { .. } => Ok(AgentKey::Ecdsa(key)),
            Algorithm::Ed25519 => Ok(AgentKey::Ed25519(key)),
            other => Err(SshError::KeyError(format!(
                "unsupported agent key type {}",
                other.as_str()
            ))),
        }
    }

    /// Load an OpenSSH private key file.
    pub fn load(path: impl AsRef<Path>, passphrase: Option<&str>) -> Result<Self, SshError> {
        let key = russh::keys::load_secret_key(path, passphrase)?;
        Self::from_private_key(key)
    }

    /// Decode an OpenSSH private key from memory.
    pub fn decode(secret: &str, passphrase: Option<&str>) -> Result<Self, SshError> {
        let key = russh::keys::decode_secret_key(secret, passphrase)?;
        Self::from_private_key(key)
    }

    /// Wrap a private key with its OpenSSH certificate (`*-cert.pub`).
    pub fn with_certificate(
        key: PrivateKey,
        cert_path: impl AsRef<Path>,
    ) -> Result<Self, SshError> {
        let cert = russh::keys::load_openssh_certificate(cert_path)
            .map_err(|e| SshError::KeyError(format!("failed to load certificate: {}", e)))?;
        Ok(AgentKey::Certificate {
            key: Arc::new(key),
            cert: Arc::new(cert),
        })
    }

    fn private_key(&self) -> Option<&Arc<PrivateKey>> {
        match self {
            AgentKey::Rsa(key) | AgentKey::Ecdsa(key) | AgentKey::Ed25519(key) => Some(key),
            AgentKey::Certificate { key, .. } => Some(key),
            AgentKey::Platform(_) => None,
        }
    }

    fn is_rsa(&self) -> bool {
        match self {
            AgentKey::Rsa(_) => true,
            AgentKey::Certificate { key, .. } => matches!(key.algorithm(), Algorithm::Rsa { .. }),
            AgentKey::Platform(signer) => signer.key_type() == "ssh-rsa",
            _ => false,
        }
    }

    /// Public key blob as listed by the agent (certificate blob for certificates).
    pub fn public_key_blob(&self) -> Result<Bytes, SshError> {
        match self {
            AgentKey::Rsa(key) | AgentKey::Ecdsa(key) | AgentKey::Ed25519(key) => {
                Ok(Bytes::from(key.public_key().public_key_bytes()))
            }
            AgentKey::Certificate { cert, .. } => cert
                .to_bytes()
                .map(Bytes::from)
                .map_err(|e| SshError::KeyError(format!("failed to encode certificate: {}", e))),
            AgentKey::Platform(signer) => Ok(signer.public_key_blob()),
        }
    }

    /// `authorized_keys` type name
    pub fn key_type(&self) -> String {
        match self {
            AgentKey::Certificate { key, .. } => cert_type_name(key.algorithm().as_str()),
            AgentKey::Platform(signer) => signer.key_type(),
            other => other
                .private_key()
                .map(|key| key.algorithm().as_str().to_string())
                .unwrap_or_default(),
        }
    }

    /// Signature algorithm selected by the request flags.
    /// `None` means the key type's only (or legacy `ssh-rsa`) algorithm.
    pub fn signature_algorithm(&self, flags: u32) -> Option<&'static str> {
        if !self.is_rsa() {
            return None;
        }
        let cert = matches!(self, AgentKey::Certificate { .. });
        if flags & SSH_AGENT_RSA_SHA2_256 != 0 {
            Some(if cert {
                "rsa-sha2-256-cert-v01@openssh.com"
            } else {
                "rsa-sha2-256"
            })
        } else if flags & SSH_AGENT_RSA_SHA2_512 != 0 {
            Some(if cert {
                "rsa-sha2-512-cert-v01@openssh.com"
            } else {
                "rsa-sha2-512"
            })
        } else {
            None
        }
    }

    /// Sign `data`, returning the encoded signature blob.
    pub fn sign(&self, data: &[u8], flags: u32) -> Result<Bytes, SshError> {
        let algorithm = self.signature_algorithm(flags);
        let key = match self {
            AgentKey::Platform(signer) => return signer.sign(data, algorithm),
            other => other
                .private_key()
                .ok_or_else(|| SshError::KeyError("key has no private half".into()))?,
        };

        let hash = match algorithm {
            Some(name) if name.starts_with("rsa-sha2-256") => Some(HashAlg::Sha256),
            Some(name) if name.starts_with("rsa-sha2-512") => Some(HashAlg::Sha512),
            _ => None,
        };
        let signer = PrivateKeyWithHashAlg::new(key.clone(), hash);
        let signature: Signature = signer
            .try_sign(data)
            .map_err(|e| SshError::KeyError(format!("signing failed: {}", e)))?;
        Ok(encode_signature(signature.algorithm().as_str(), signature.as_bytes()))
    }
}

impl fmt::Debug for AgentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AgentKey({})", self.key_type())
    }
}

fn cert_type_name(algorithm: &str) -> String {
    format!("{}-cert-v01@openssh.com", algorithm)
}

/// `string algorithm, string signature`
pub fn encode_signature(algorithm: &str, signature: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(algorithm.len() + signature.len() + 8);
    put_string(&mut buf, algorithm.as_bytes());
    put_string(&mut buf, signature);
    buf.freeze()
}

#[cfg(test)]
pub(crate) mod fixtures {
    pub(crate) const ED25519: &str = include_str!("testdata/id_ed25519");
    pub(crate) const RSA: &str = include_str!("testdata/id_rsa");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::protocol::get_string;

    fn algorithm_of(blob: &[u8]) -> String {
        let mut buf = blob;
        String::from_utf8(get_string(&mut buf).unwrap().to_vec()).unwrap()
    }

    #[test]
    fn test_ed25519_key_signs_with_single_algorithm() {
        let key = AgentKey::decode(fixtures::ED25519, None).unwrap();
        assert!(matches!(key, AgentKey::Ed25519(_)));
        assert_eq!(key.key_type(), "ssh-ed25519");
        assert_eq!(key.signature_algorithm(SSH_AGENT_RSA_SHA2_256), None);

        let blob = key.sign(b"challenge", SSH_AGENT_RSA_SHA2_256).unwrap();
        assert_eq!(algorithm_of(&blob), "ssh-ed25519");
    }

    #[test]
    fn test_rsa_digest_follows_flags() {
        let key = AgentKey::decode(fixtures::RSA, None).unwrap();
        assert!(matches!(key, AgentKey::Rsa(_)));
        assert_eq!(key.signature_algorithm(SSH_AGENT_RSA_SHA2_256), Some("rsa-sha2-256"));
        assert_eq!(key.signature_algorithm(SSH_AGENT_RSA_SHA2_512), Some("rsa-sha2-512"));
        assert_eq!(key.signature_algorithm(0), None);

        let blob = key.sign(b"challenge", SSH_AGENT_RSA_SHA2_512).unwrap();
        assert_eq!(algorithm_of(&blob), "rsa-sha2-512");
        let blob = key.sign(b"challenge", SSH_AGENT_RSA_SHA2_256).unwrap();
        assert_eq!(algorithm_of(&blob), "rsa-sha2-256");
    }

    #[test]
    fn test_public_blob_starts_with_type() {
        let key = AgentKey::decode(fixtures::ED25519, None).unwrap();
        let blob = key.public_key_blob().unwrap();
        assert_eq!(algorithm_of(&blob), "ssh-ed25519");
    }

    #[test]
    fn test_cert_type_name() {
        assert_eq!(cert_type_name("ssh-rsa"), "ssh-rsa-cert-v01@openssh.com");
    }
}
