//! Trust-on-first-use host key policy backed by a known_hosts file
//!
//! The file is re-read on every check so several relay processes can share
//! it. Unknown hosts are accepted and pinned; a host that presents a
//! different key of an already pinned type is rejected.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::Mutex;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::error::SshError;

/// Result of host key verification
#[derive(Debug, Clone, PartialEq)]
pub enum HostKeyVerification {
    /// Key matches a known_hosts entry
    Verified,
    /// Host not pinned for this key type (first contact)
    Unknown { fingerprint: String },
    /// Key changed from the pinned entry
    Changed {
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
}

/// Entry in known_hosts: (key_type, base64_key)
#[derive(Clone, Debug)]
struct HostKeyEntry {
    key_type: String,
    key_data: String,
}

/// Known hosts file with trust-on-first-use semantics.
pub struct HostKeyPolicy {
    path: PathBuf,
    /// Serializes read-verify-append within this process.
    lock: Mutex<()>,
}

impl HostKeyPolicy {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// `~/.ssh/known_hosts`
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .map(|h| h.join(".ssh").join("known_hosts"))
            .unwrap_or_else(|| PathBuf::from(".ssh/known_hosts"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create lookup key for host:port
    fn make_key(host: &str, port: u16) -> String {
        let host = host.to_lowercase();
        if port == 22 {
            host
        } else {
            format!("[{}]:{}", host, port)
        }
    }

    /// Compute SHA256 fingerprint of public key
    pub fn fingerprint(key: &PublicKey) -> String {
        Self::fingerprint_bytes(&key.public_key_bytes())
    }

    fn fingerprint_bytes(bytes: &[u8]) -> String {
        let hash = Sha256::digest(bytes);
        format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
    }

    fn fingerprint_b64(stored_b64: &str) -> String {
        match BASE64.decode(stored_b64) {
            Ok(bytes) => Self::fingerprint_bytes(&bytes),
            Err(_) => "unknown".to_string(),
        }
    }

    /// Entries from the file whose host field names any of `names`.
    fn load_entries(&self, names: &[String]) -> Result<Vec<HostKeyEntry>, SshError> {
        let file = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SshError::IoError(e)),
        };

        let mut entries = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
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

            let matches = hostnames
                .split(',')
                // Hashed hostnames (|1|...) are not supported
                .filter(|h| !h.starts_with('|'))
                .any(|h| names.iter().any(|n| n.eq_ignore_ascii_case(h)));

            if matches {
                entries.push(HostKeyEntry {
                    key_type: key_type.to_string(),
                    key_data: key_data.to_string(),
                });
            }
        }
        Ok(entries)
    }

    fn lookup_names(host: &str, port: u16, remote_addr: Option<&str>) -> Vec<String> {
        let mut names = vec![Self::make_key(host, port)];
        if let Some(addr) = remote_addr {
            let addr_key = Self::make_key(addr, port);
            if addr_key != names[0] {
                names.push(addr_key);
            }
        }
        names
    }

    /// Verify an encoded key against the file without modifying it.
    pub fn verify_encoded(
        &self,
        host: &str,
        port: u16,
        remote_addr: Option<&str>,
        key_type: &str,
        key_b64: &str,
    ) -> Result<HostKeyVerification, SshError> {
        let names = Self::lookup_names(host, port, remote_addr);
        let entries = self.load_entries(&names)?;

        let mut mismatch = None;
        for entry in entries.iter().filter(|e| e.key_type == key_type) {
            if entry.key_data == key_b64 {
                debug!("Host key verified for {} (type: {})", names[0], key_type);
                return Ok(HostKeyVerification::Verified);
            }
            mismatch.get_or_insert(entry);
        }

        let fingerprint = Self::fingerprint_b64(key_b64);
        Ok(match mismatch {
            Some(entry) => HostKeyVerification::Changed {
                expected_fingerprint: Self::fingerprint_b64(&entry.key_data),
                actual_fingerprint: fingerprint,
            },
            None => HostKeyVerification::Unknown { fingerprint },
        })
    }

    /// Accept a known key, pin an unknown one, reject a changed one.
    pub fn check_and_pin(
        &self,
        host: &str,
        port: u16,
        remote_addr: Option<&str>,
        key: &PublicKey,
    ) -> Result<bool, SshError> {
        let key_b64 = BASE64.encode(key.public_key_bytes());
        self.check_and_pin_encoded(host, port, remote_addr, key.algorithm().as_str(), &key_b64)
    }

    pub fn check_and_pin_encoded(
        &self,
        host: &str,
        port: u16,
        remote_addr: Option<&str>,
        key_type: &str,
        key_b64: &str,
    ) -> Result<bool, SshError> {
        let _guard = self.lock.lock();

        match self.verify_encoded(host, port, remote_addr, key_type, key_b64)? {
            HostKeyVerification::Verified => Ok(true),
            HostKeyVerification::Unknown { fingerprint } => {
                let names = Self::lookup_names(host, port, remote_addr);
                self.append_to_file(&names.join(","), key_type, key_b64)?;
                info!(
                    "New host {}, pinned key {} ({})",
                    names[0], fingerprint, key_type
                );
                Ok(true)
            }
            HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => {
                warn!(
                    "HOST KEY CHANGED for {}:{}! Expected {}, got {}",
                    host, port, expected_fingerprint, actual_fingerprint
                );
                Err(SshError::HostKeyMismatch {
                    host: Self::make_key(host, port),
                    expected: expected_fingerprint,
                    actual: actual_fingerprint,
                })
            }
        }
    }

    /// Append entry to known_hosts file, creating it (and its directory) if needed
    fn append_to_file(&self, hosts: &str, key_type: &str, key_b64: &str) -> Result<(), SshError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                let mut builder = fs::DirBuilder::new();
                builder.recursive(true);
                #[cfg(unix)]
                {
                    use std::os::unix::fs::DirBuilderExt;
                    builder.mode(0o700);
                }
                builder.create(parent)?;
            }
        }

        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&self.path)?;

        writeln!(file, "{} {} {}", hosts, key_type, key_b64)?;
        Ok(())
    }
}
