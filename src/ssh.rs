//! SSH host identity and inbound user authorization.
//!
//! Host keys are generated once (gated by the "ssh" state marker) via
//! `ssh-keygen -A`; a failure here aborts startup, since the appliance cannot
//! serve git-over-SSH without a host identity.
//!
//! The authorized-keys file is regenerated on every boot from the public key
//! files in the keys directory, so keys removed from that directory stop
//! being accepted on the next restart.

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tracing::{debug, info};

use crate::paths::{Layout, COMPONENT_SSH};
use crate::process::Cmd;
use crate::state::StateStore;

/// Options attached to every authorized key: the git user binding plus
/// forwarding restrictions.
const KEY_OPTIONS: &str = "no-port-forwarding,no-X11-forwarding,no-agent-forwarding";

pub struct SshServer<'a> {
    layout: &'a Layout,
    state: &'a dyn StateStore,
}

impl<'a> SshServer<'a> {
    pub fn new(layout: &'a Layout, state: &'a dyn StateStore) -> Self {
        Self { layout, state }
    }

    pub fn is_configured(&self) -> bool {
        self.state.is_configured(COMPONENT_SSH)
    }

    /// Generate host keys on first boot. No-op once configured.
    pub fn init(&self) -> Result<()> {
        if self.is_configured() {
            return Ok(());
        }

        info!("generating SSH host keys");
        let output = Cmd::new("ssh-keygen")
            .arg("-A")
            .run()
            .context("running ssh-keygen")?;
        if !output.success() {
            bail!("ssh-keygen -A failed: {}", output.stderr.trim());
        }

        self.state.mark_configured(COMPONENT_SSH)?;
        Ok(())
    }

    /// Rewrite the authorized-keys file from the keys directory.
    ///
    /// Runs on every boot regardless of state. Each `*.pub` file produces one
    /// line binding `GIT_USER` to the filename stem; key content is written
    /// through verbatim - key validation is out of scope.
    pub fn install_authorized_keys(&self) -> Result<()> {
        let keys_dir = &self.layout.keys_dir;
        let authorized_keys = &self.layout.authorized_keys;
        info!(
            "installing SSH keys from {} to {}",
            keys_dir.display(),
            authorized_keys.display()
        );

        let mut key_files: Vec<PathBuf> = match fs::read_dir(keys_dir) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| path.extension().is_some_and(|ext| ext == "pub"))
                .collect(),
            Err(_) => {
                debug!("keys directory {} not readable", keys_dir.display());
                Vec::new()
            }
        };
        key_files.sort();

        let mut contents = String::new();
        for key_file in &key_files {
            let Some(username) = key_file.file_stem().map(|s| s.to_string_lossy()) else {
                continue;
            };
            info!("installing SSH key for user {}", username);
            let key = fs::read_to_string(key_file)
                .with_context(|| format!("reading key file {}", key_file.display()))?;
            contents.push_str(&format!(
                "environment=\"GIT_USER={}\",{} {}\n",
                username,
                KEY_OPTIONS,
                key.trim()
            ));
        }

        if let Some(parent) = authorized_keys.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        fs::write(authorized_keys, contents)
            .with_context(|| format!("writing {}", authorized_keys.display()))?;

        Ok(())
    }
}
