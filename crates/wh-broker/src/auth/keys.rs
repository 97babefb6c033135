//! Authorized keys for inbound public key authentication

use std::collections::HashSet;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use russh_keys::key::PublicKey;

/// Public keys allowed to open client sessions, matched by fingerprint
#[derive(Debug, Default)]
pub struct AuthorizedKeys {
    fingerprints: HashSet<String>,
}

impl AuthorizedKeys {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every listed `authorized_keys` file
    ///
    /// A leading `~` is expanded to the home directory. Missing files are
    /// an error since they were configured explicitly.
    pub fn load_from_files(paths: &[impl AsRef<Path>]) -> Result<Self> {
        let mut store = Self::new();
        for path in paths {
            store.load_from_file(&expand_home(path.as_ref()))?;
        }
        Ok(store)
    }

    /// Load one `authorized_keys` file
    pub fn load_from_file(&mut self, path: &Path) -> Result<usize> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open authorized keys file {:?}", path))?;

        let mut count = 0;
        for (line_num, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| format!("Failed to read line {} of {:?}", line_num + 1, path))?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            match parse_key_line(line) {
                Some((key, comment)) => {
                    self.add_key(&key, comment);
                    count += 1;
                }
                None => tracing::warn!("Skipping unparseable key on line {} of {:?}", line_num + 1, path),
            }
        }

        tracing::info!("Loaded {} authorized keys from {:?}", count, path);
        Ok(count)
    }

    pub fn add_key(&mut self, key: &PublicKey, comment: Option<String>) {
        let fingerprint = key.fingerprint();
        tracing::debug!(
            "Authorized key {} ({})",
            fingerprint,
            comment.as_deref().unwrap_or("no comment")
        );
        self.fingerprints.insert(fingerprint);
    }

    pub fn is_authorized(&self, key: &PublicKey) -> bool {
        self.fingerprints.contains(&key.fingerprint())
    }

    pub fn len(&self) -> usize {
        self.fingerprints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

/// Parse `[options] type base64 [comment]`, or a bare base64 blob
fn parse_key_line(line: &str) -> Option<(PublicKey, Option<String>)> {
    if let Ok(key) = russh_keys::parse_public_key_base64(line) {
        return Some((key, None));
    }

    let parts: Vec<&str> = line.split_whitespace().collect();
    parts.windows(2).enumerate().find_map(|(i, pair)| {
        if !pair[0].starts_with("ssh-") && !pair[0].starts_with("ecdsa-") {
            return None;
        }
        let key = russh_keys::parse_public_key_base64(pair[1]).ok()?;
        let comment = parts.get(i + 2..).filter(|rest| !rest.is_empty()).map(|rest| rest.join(" "));
        Some((key, comment))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh_keys::key::KeyPair;
    use russh_keys::PublicKeyBase64;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn public_key() -> PublicKey {
        KeyPair::generate_ed25519().unwrap().clone_public_key().unwrap()
    }

    #[test]
    fn test_load_authorized_keys_file() {
        let allowed = public_key();
        let with_options = public_key();
        let stranger = public_key();

        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "# broker clients").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "ssh-ed25519 {} ops laptop", allowed.public_key_base64()).unwrap();
        writeln!(file, "no-pty ssh-ed25519 {}", with_options.public_key_base64()).unwrap();
        writeln!(file, "garbage line").unwrap();

        let store = AuthorizedKeys::load_from_files(&[file.path()]).unwrap();
        assert_eq!(store.len(), 2);
        assert!(store.is_authorized(&allowed));
        assert!(store.is_authorized(&with_options));
        assert!(!store.is_authorized(&stranger));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(AuthorizedKeys::load_from_files(&[dir.path().join("authorized_keys")]).is_err());
    }

    #[test]
    fn test_parse_key_line_comment() {
        let key = public_key();
        let line = format!("ssh-ed25519 {} ops laptop", key.public_key_base64());
        let (parsed, comment) = parse_key_line(&line).unwrap();
        assert_eq!(parsed.fingerprint(), key.fingerprint());
        assert_eq!(comment.as_deref(), Some("ops laptop"));

        assert!(parse_key_line(&key.public_key_base64()).is_some());
        assert!(parse_key_line("ssh-ed25519").is_none());
    }

    #[test]
    fn test_duplicate_keys_count_once() {
        let key = public_key();
        let mut store = AuthorizedKeys::new();
        store.add_key(&key, None);
        store.add_key(&key, Some("again".to_string()));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home(Path::new("/etc/keys")), PathBuf::from("/etc/keys"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home(Path::new("~/.ssh/authorized_keys")), home.join(".ssh/authorized_keys"));
        }
    }
}
