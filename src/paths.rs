//! Filesystem layout of the gitnest appliance.
//!
//! All on-disk locations the supervisor touches live here, collected into a
//! [`Layout`] so that tests can relocate the whole tree under a temporary
//! directory instead of writing to the real system paths.

use std::path::{Path, PathBuf};

use crate::config::BackupSchedule;

/// Component names used as state marker keys.
pub const COMPONENT_SSH: &str = "ssh";
pub const COMPONENT_GPG: &str = "gpg";
pub const COMPONENT_BACKUP: &str = "backup";

/// Script name placed in a periodic slot directory.
pub const PERIODIC_SCRIPT_NAME: &str = "backup";

/// Daemons launched by the entrypoint.
pub const SSHD_BIN: &str = "/usr/sbin/sshd";
pub const LIGHTTPD_BIN: &str = "/usr/sbin/lighttpd";
pub const LIGHTTPD_CONF: &str = "/etc/lighttpd/lighttpd.conf";
pub const CROND_BIN: &str = "crond";

/// On-disk layout of the appliance.
///
/// The defaults match the container image; [`Layout::for_testing`] relocates
/// everything under a caller-supplied root.
pub struct Layout {
    /// State markers and fingerprint files live here.
    pub state_dir: PathBuf,
    /// Public keys authorizing inbound git users (`*.pub`).
    pub keys_dir: PathBuf,
    /// The authorized-keys file rewritten on every boot.
    pub authorized_keys: PathBuf,
    /// Root of the periodic-jobs tree (one subdirectory per schedule slot).
    pub periodic_root: PathBuf,
    /// Canonical backup script the schedule symlink points at.
    pub backup_script: PathBuf,
    /// Data paths included in every backup and probed before restore.
    pub backup_paths: Vec<PathBuf>,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/etc/gitnest"),
            keys_dir: PathBuf::from("/keys"),
            authorized_keys: PathBuf::from("/home/git/.ssh/authorized_keys"),
            periodic_root: PathBuf::from("/etc/periodic"),
            backup_script: PathBuf::from("/usr/local/bin/backup"),
            backup_paths: vec![
                PathBuf::from("/private"),
                PathBuf::from("/public"),
                PathBuf::from("/etc/lighttpd-htdigest.user"),
            ],
        }
    }
}

impl Layout {
    /// Marker file recording the encryption key fingerprint.
    pub fn encryption_fingerprint_file(&self) -> PathBuf {
        self.state_dir.join("encryption_fingerprint")
    }

    /// Marker file recording the signing key fingerprint.
    pub fn signing_fingerprint_file(&self) -> PathBuf {
        self.state_dir.join("signing_fingerprint")
    }

    /// Periodic slot the backup script should be linked into for `schedule`.
    pub fn schedule_slot(&self, schedule: BackupSchedule) -> PathBuf {
        self.periodic_root
            .join(schedule.slot_name())
            .join(PERIODIC_SCRIPT_NAME)
    }

    /// Relocate the entire layout under `root`.
    ///
    /// Only used in tests - production code uses [`Layout::default`].
    pub fn for_testing(root: &Path) -> Self {
        Self {
            state_dir: root.join("state"),
            keys_dir: root.join("keys"),
            authorized_keys: root.join("home/git/.ssh/authorized_keys"),
            periodic_root: root.join("periodic"),
            backup_script: root.join("bin/backup"),
            backup_paths: vec![
                root.join("private"),
                root.join("public"),
                root.join("htdigest.user"),
            ],
        }
    }
}
