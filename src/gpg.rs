//! GPG credentials for backup signing and encryption.
//!
//! On first boot (gated by the "gpg" state marker) both keys are imported
//! into the root keyring from base64 environment material, given ultimate
//! trust, and their fingerprints persisted under the state directory. Backup
//! operations later select the keys by those fingerprints.
//!
//! An import that yields no fingerprint aborts startup - backups must never
//! run without both credentials.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::info;

use crate::config::Config;
use crate::paths::{Layout, COMPONENT_GPG};
use crate::process::Cmd;
use crate::state::StateStore;

/// Which persisted credential to look up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPurpose {
    Encryption,
    Signing,
}

pub struct BackupKeys<'a> {
    config: &'a Config,
    layout: &'a Layout,
    state: &'a dyn StateStore,
}

impl<'a> BackupKeys<'a> {
    pub fn new(config: &'a Config, layout: &'a Layout, state: &'a dyn StateStore) -> Self {
        Self { config, layout, state }
    }

    pub fn is_configured(&self) -> bool {
        self.state.is_configured(COMPONENT_GPG)
    }

    /// Import both keys on first boot. No-op once configured.
    pub fn init(&self) -> Result<()> {
        if self.is_configured() {
            return Ok(());
        }

        self.import_key(
            &self.config.sign_key_material,
            &self.config.sign_passphrase,
            &self.layout.signing_fingerprint_file(),
        )
        .context("importing signing key")?;
        self.import_key(
            &self.config.encryption_key_material,
            &self.config.encryption_passphrase,
            &self.layout.encryption_fingerprint_file(),
        )
        .context("importing encryption key")?;

        self.state.mark_configured(COMPONENT_GPG)?;
        Ok(())
    }

    /// Read back a persisted fingerprint.
    ///
    /// Returns `None` when the file is absent or empty - callers treat that
    /// as "credential not available", not as an error.
    pub fn fingerprint(&self, purpose: KeyPurpose) -> Option<String> {
        let path = match purpose {
            KeyPurpose::Encryption => self.layout.encryption_fingerprint_file(),
            KeyPurpose::Signing => self.layout.signing_fingerprint_file(),
        };
        read_fingerprint(&path)
    }

    /// Import one key into the keyring, trust it ultimately, and persist its
    /// fingerprint.
    fn import_key(&self, material: &str, passphrase: &str, fingerprint_file: &Path) -> Result<String> {
        let decoded = BASE64
            .decode(material.trim().as_bytes())
            .context("decoding key material as base64")?;

        let output = Cmd::new("gpg")
            .args(["--batch", "--yes", "--status-fd", "1"])
            .args(["--pinentry-mode", "loopback"])
            .args(["--passphrase", passphrase])
            .arg("--import")
            .stdin_bytes(decoded)
            .run()
            .context("running gpg --import")?;

        let Some(fingerprint) = parse_import_fingerprint(&output.stdout) else {
            bail!("gpg import returned no fingerprint: {}", output.stderr.trim());
        };

        let trust = Cmd::new("gpg")
            .arg("--import-ownertrust")
            .stdin_bytes(format!("{}:6:\n", fingerprint).into_bytes())
            .run()
            .context("running gpg --import-ownertrust")?;
        if !trust.success() {
            bail!("setting ultimate trust failed: {}", trust.stderr.trim());
        }

        fs::write(fingerprint_file, &fingerprint)
            .with_context(|| format!("writing {}", fingerprint_file.display()))?;
        // Fingerprints are public; readable by the git tooling running as
        // other users.
        fs::set_permissions(fingerprint_file, fs::Permissions::from_mode(0o644))
            .with_context(|| format!("setting permissions on {}", fingerprint_file.display()))?;

        info!("GPG key imported with fingerprint: {}", fingerprint);
        Ok(fingerprint)
    }
}

fn read_fingerprint(path: &Path) -> Option<String> {
    let text = fs::read_to_string(path).ok()?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.to_string())
}

/// Pull the fingerprint out of `--status-fd` import output.
///
/// The line of interest looks like `[GNUPG:] IMPORT_OK 1 <fingerprint>`.
fn parse_import_fingerprint(status: &str) -> Option<String> {
    status.lines().find_map(|line| {
        let rest = line.strip_prefix("[GNUPG:] IMPORT_OK ")?;
        rest.split_whitespace().nth(1).map(str::to_string)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryStateStore;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn test_config() -> Config {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("ENCRYPTION_KEY_MATERIAL", "bWF0ZXJpYWw="),
            ("ENCRYPTION_PASSPHRASE", "secret"),
        ]);
        Config::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap()
    }

    #[test]
    fn test_parse_import_fingerprint() {
        let status = "\
[GNUPG:] KEY_CONSIDERED 8C5A4F2B8D9E0A1B2C3D4E5F60718293A4B5C6D7 0
[GNUPG:] IMPORT_OK 1 8C5A4F2B8D9E0A1B2C3D4E5F60718293A4B5C6D7
[GNUPG:] IMPORT_RES 1 0 1 0 0 0 0 0 0 0 0 0 0 0 0
";
        assert_eq!(
            parse_import_fingerprint(status).as_deref(),
            Some("8C5A4F2B8D9E0A1B2C3D4E5F60718293A4B5C6D7")
        );
    }

    #[test]
    fn test_parse_import_fingerprint_absent_on_failure() {
        let status = "[GNUPG:] FAILURE import 11\n";
        assert_eq!(parse_import_fingerprint(status), None);
        assert_eq!(parse_import_fingerprint(""), None);
    }

    #[test]
    fn test_fingerprint_lookup() {
        let dir = tempdir().unwrap();
        let layout = Layout::for_testing(dir.path());
        fs::create_dir_all(&layout.state_dir).unwrap();
        let config = test_config();
        let state = MemoryStateStore::new();
        let keys = BackupKeys::new(&config, &layout, &state);

        // Absent file.
        assert_eq!(keys.fingerprint(KeyPurpose::Encryption), None);

        // Empty file.
        fs::write(layout.encryption_fingerprint_file(), "  \n").unwrap();
        assert_eq!(keys.fingerprint(KeyPurpose::Encryption), None);

        // Present, trimmed.
        fs::write(layout.encryption_fingerprint_file(), "ABCDEF0123\n").unwrap();
        assert_eq!(
            keys.fingerprint(KeyPurpose::Encryption).as_deref(),
            Some("ABCDEF0123")
        );

        // Purposes read distinct files.
        fs::write(layout.signing_fingerprint_file(), "FEDCBA9876\n").unwrap();
        assert_eq!(
            keys.fingerprint(KeyPurpose::Signing).as_deref(),
            Some("FEDCBA9876")
        );
    }

    #[test]
    fn test_init_skipped_when_configured() {
        let dir = tempdir().unwrap();
        let layout = Layout::for_testing(dir.path());
        let config = test_config();
        let state = MemoryStateStore::new();
        state.mark_configured(COMPONENT_GPG).unwrap();

        let keys = BackupKeys::new(&config, &layout, &state);
        keys.init().unwrap();
        assert!(keys.is_configured());
    }

    #[test]
    fn test_invalid_base64_material_fails_import() {
        let dir = tempdir().unwrap();
        let layout = Layout::for_testing(dir.path());
        fs::create_dir_all(&layout.state_dir).unwrap();

        let vars: HashMap<&str, &str> = HashMap::from([
            ("ENCRYPTION_KEY_MATERIAL", "!!! not base64 !!!"),
            ("ENCRYPTION_PASSPHRASE", "secret"),
        ]);
        let config = Config::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();
        let state = MemoryStateStore::new();

        let keys = BackupKeys::new(&config, &layout, &state);
        assert!(keys.init().is_err());
        // Failed import must not mark the component configured.
        assert!(!keys.is_configured());
    }
}
