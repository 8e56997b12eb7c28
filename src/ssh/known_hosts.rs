//! Known hosts management for SSH host key verification

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::RwLock;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::error::SshError;

/// File name inside the directory passed to [`delete_known_host`]
pub const KNOWN_HOSTS_FILE: &str = "known_hosts";

/// Result of host key verification
#[derive(Debug, Clone, PartialEq)]
pub enum HostKeyVerification {
    Verified,
    /// Host not in known_hosts (first connection)
    Unknown { fingerprint: String },
    /// Key changed from known_hosts entry (potential MITM)
    Changed {
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
}

#[derive(Clone, Debug)]
struct HostKeyEntry {
    key_type: String,
    key_data: String,
}

/// Remove every line of `<dir>/known_hosts` whose first whitespace-separated
/// token is exactly `host`. Empty lines are dropped as well.
pub fn delete_known_host(dir: impl AsRef<Path>, host: &str) -> Result<(), SshError> {
    let path = dir.as_ref().join(KNOWN_HOSTS_FILE);
    let removed = remove_host_lines(&path, host)?;
    info!("Removed {} known_hosts line(s) for {}", removed, host);
    Ok(())
}

fn remove_host_lines(path: &Path, host: &str) -> Result<usize, SshError> {
    let content = fs::read_to_string(path).map_err(|e| {
        SshError::KnownHosts(format!("failed reading {}: {}", path.display(), e))
    })?;

    let mut removed = 0;
    let kept: Vec<&str> = content
        .lines()
        .filter(|line| {
            let matches = line
                .strip_prefix(host)
                .is_some_and(|rest| rest.starts_with(char::is_whitespace));
            if matches {
                removed += 1;
            }
            !matches && !line.is_empty()
        })
        .collect();

    let mut joined = kept.join("\n");
    joined.push('\n');
    fs::write(path, joined).map_err(|e| {
        SshError::KnownHosts(format!("failed writing {}: {}", path.display(), e))
    })?;
    Ok(removed)
}

/// In-memory view of one known_hosts file
pub struct KnownHostsStore {
    /// host (or `[host]:port`) -> keys, one per key type
    hosts: RwLock<HashMap<String, Vec<HostKeyEntry>>>,
    path: PathBuf,
}

impl KnownHostsStore {
    /// `~/.ssh/known_hosts`
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .map(|h| h.join(".ssh").join(KNOWN_HOSTS_FILE))
            .unwrap_or_else(|| PathBuf::from(".ssh").join(KNOWN_HOSTS_FILE))
    }

    /// Load from `path`. A missing file is an empty store.
    pub fn with_path(path: PathBuf) -> Self {
        let store = Self {
            hosts: RwLock::new(HashMap::new()),
            path,
        };
        if let Err(e) = store.load() {
            warn!("Failed to load {}: {}", store.path.display(), e);
        }
        store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<(), SshError> {
        if !self.path.exists() {
            return Ok(());
        }
        let content = fs::read_to_string(&self.path)?;
        let mut hosts = self.hosts.write();
        let mut entry_count = 0;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            // hostname[,alias] keytype base64key [comment]
            let mut parts = line.split_whitespace();
            let (Some(hostnames), Some(key_type), Some(key_data)) =
                (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            let entry = HostKeyEntry {
                key_type: key_type.to_string(),
                key_data: key_data.to_string(),
            };

            for hostname in hostnames.split(',') {
                // Hashed entries are not matched.
                if hostname.starts_with('|') {
                    continue;
                }
                hosts
                    .entry(hostname.to_lowercase())
                    .or_default()
                    .push(entry.clone());
                entry_count += 1;
            }
        }

        debug!(
            "Loaded {} known host entries ({} unique hosts)",
            entry_count,
            hosts.len()
        );
        Ok(())
    }

    fn make_key(host: &str, port: u16) -> String {
        let host = host.to_lowercase();
        if port == 22 {
            host
        } else {
            format!("[{}]:{}", host, port)
        }
    }

    /// SHA256 fingerprint in OpenSSH notation
    pub fn fingerprint(key: &PublicKey) -> String {
        Self::fingerprint_bytes(&key.public_key_bytes())
    }

    fn fingerprint_bytes(bytes: &[u8]) -> String {
        let hash = Sha256::digest(bytes);
        format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
    }

    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyVerification {
        self.verify_raw(host, port, key.algorithm().as_str(), &key.public_key_bytes())
    }

    fn verify_raw(&self, host: &str, port: u16, key_type: &str, blob: &[u8]) -> HostKeyVerification {
        let lookup_key = Self::make_key(host, port);
        let actual_b64 = BASE64.encode(blob);
        let fingerprint = Self::fingerprint_bytes(blob);
        let hosts = self.hosts.read();

        let Some(entries) = hosts.get(&lookup_key) else {
            debug!("Unknown host: {}", lookup_key);
            return HostKeyVerification::Unknown { fingerprint };
        };

        match entries.iter().find(|entry| entry.key_type == key_type) {
            Some(entry) if entry.key_data == actual_b64 => {
                debug!("Host key verified for {} ({})", lookup_key, key_type);
                HostKeyVerification::Verified
            }
            Some(entry) => {
                let expected_fingerprint = BASE64
                    .decode(&entry.key_data)
                    .map(|bytes| Self::fingerprint_bytes(&bytes))
                    .unwrap_or_else(|_| "unknown".to_string());
                warn!(
                    "HOST KEY CHANGED for {} ({})! Expected {}, got {}",
                    lookup_key, key_type, expected_fingerprint, fingerprint
                );
                HostKeyVerification::Changed {
                    expected_fingerprint,
                    actual_fingerprint: fingerprint,
                }
            }
            None => {
                debug!("Host {} known but no {} key stored", lookup_key, key_type);
                HostKeyVerification::Unknown { fingerprint }
            }
        }
    }

    /// Record a host key in memory and append it to the file.
    pub fn add_host(&self, host: &str, port: u16, key: &PublicKey) -> Result<(), SshError> {
        self.add_raw(host, port, key.algorithm().as_str(), &key.public_key_bytes())
    }

    fn add_raw(&self, host: &str, port: u16, key_type: &str, blob: &[u8]) -> Result<(), SshError> {
        let lookup_key = Self::make_key(host, port);
        let key_data = BASE64.encode(blob);

        self.hosts
            .write()
            .entry(lookup_key.clone())
            .or_default()
            .push(HostKeyEntry {
                key_type: key_type.to_string(),
                key_data: key_data.clone(),
            });

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{} {} {}", lookup_key, key_type, key_data)?;

        info!("Added host key for {} ({}) to known_hosts", lookup_key, key_type);
        Ok(())
    }

    /// Forget `host:port` and rewrite the file without it.
    pub fn remove_host(&self, host: &str, port: u16) -> Result<(), SshError> {
        let lookup_key = Self::make_key(host, port);
        self.hosts.write().remove(&lookup_key);
        if self.path.exists() {
            let removed = remove_host_lines(&self.path, &lookup_key)?;
            info!("Removed {} host key(s) for {} from known_hosts", removed, lookup_key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_delete_known_host_matches_first_token_exactly() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(KNOWN_HOSTS_FILE),
            "host1 ssh-rsa AAA...\nhost1x ssh-rsa BBB...\n",
        )
        .unwrap();

        delete_known_host(dir.path(), "host1").unwrap();

        let content = fs::read_to_string(dir.path().join(KNOWN_HOSTS_FILE)).unwrap();
        assert_eq!(content, "host1x ssh-rsa BBB...\n");
    }

    #[test]
    fn test_delete_known_host_drops_empty_lines_and_keeps_others() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(KNOWN_HOSTS_FILE),
            "a ssh-ed25519 K1\n\nhost1 ssh-ed25519 K2\n# host1 comment\nb,host1 ssh-rsa K3",
        )
        .unwrap();

        delete_known_host(dir.path(), "host1").unwrap();

        let content = fs::read_to_string(dir.path().join(KNOWN_HOSTS_FILE)).unwrap();
        assert_eq!(
            content,
            "a ssh-ed25519 K1\n# host1 comment\nb,host1 ssh-rsa K3\n"
        );
    }

    #[test]
    fn test_delete_known_host_missing_file() {
        let dir = tempdir().unwrap();
        let err = delete_known_host(dir.path(), "host1").unwrap_err();
        assert!(matches!(err, SshError::KnownHosts(_)));
    }

    #[test]
    fn test_make_key() {
        assert_eq!(KnownHostsStore::make_key("GitHub.com", 22), "github.com");
        assert_eq!(
            KnownHostsStore::make_key("server.com", 2222),
            "[server.com]:2222"
        );
    }

    #[test]
    fn test_verify_add_and_change() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(KNOWN_HOSTS_FILE);
        let store = KnownHostsStore::with_path(path.clone());

        assert!(matches!(
            store.verify_raw("web", 2222, "ssh-ed25519", b"key-one"),
            HostKeyVerification::Unknown { .. }
        ));
        store.add_raw("web", 2222, "ssh-ed25519", b"key-one").unwrap();
        assert_eq!(
            store.verify_raw("web", 2222, "ssh-ed25519", b"key-one"),
            HostKeyVerification::Verified
        );
        assert!(matches!(
            store.verify_raw("web", 2222, "ssh-ed25519", b"key-two"),
            HostKeyVerification::Changed { .. }
        ));

        // Persisted entry is visible to a fresh store.
        let reloaded = KnownHostsStore::with_path(path);
        assert_eq!(
            reloaded.verify_raw("web", 2222, "ssh-ed25519", b"key-one"),
            HostKeyVerification::Verified
        );

        reloaded.remove_host("web", 2222).unwrap();
        assert!(matches!(
            reloaded.verify_raw("web", 2222, "ssh-ed25519", b"key-one"),
            HostKeyVerification::Unknown { .. }
        ));
        let content = fs::read_to_string(dir.path().join(KNOWN_HOSTS_FILE)).unwrap();
        assert!(!content.contains("[web]:2222"));
    }
}
