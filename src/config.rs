//! Appliance configuration.
//!
//! All settings come from the process environment, read once at startup into
//! an immutable [`Config`]. Components receive the snapshot by reference -
//! nothing reads ambient environment state after load.
//!
//! Values are whitespace-trimmed; a variable that is empty after trimming
//! counts as unset. A missing required variable or a failed parse aborts
//! startup.

use std::env;
use std::fmt;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// How often the periodic scheduler runs the backup script.
///
/// Maps onto the slot directories under the periodic-jobs root. Invalid
/// input falls back to [`BackupSchedule::Daily`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupSchedule {
    Min15,
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

impl BackupSchedule {
    /// Parse an environment value. Unknown values resolve to `Daily`.
    pub fn parse_or_default(value: Option<&str>) -> Self {
        match value {
            Some("15MIN") => Self::Min15,
            Some("HOURLY") => Self::Hourly,
            Some("DAILY") => Self::Daily,
            Some("WEEKLY") => Self::Weekly,
            Some("MONTHLY") => Self::Monthly,
            _ => Self::Daily,
        }
    }

    /// Slot directory name under the periodic-jobs root.
    pub fn slot_name(self) -> &'static str {
        match self {
            Self::Min15 => "15min",
            Self::Hourly => "hourly",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }
}

impl fmt::Display for BackupSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Min15 => "15MIN",
            Self::Hourly => "HOURLY",
            Self::Daily => "DAILY",
            Self::Weekly => "WEEKLY",
            Self::Monthly => "MONTHLY",
        };
        f.write_str(name)
    }
}

/// Immutable configuration snapshot.
#[derive(Debug, Clone)]
pub struct Config {
    /// External hostname used in generated clone URLs.
    pub external_hostname: String,
    /// External SSH port used in generated clone URLs.
    pub external_ssh_port: u16,
    /// External HTTP(S) port used in generated clone URLs.
    pub external_http_port: u16,
    /// Base64 key material for the backup encryption key.
    pub encryption_key_material: String,
    /// Passphrase protecting the encryption key.
    pub encryption_passphrase: String,
    /// Base64 key material for the backup signing key.
    pub sign_key_material: String,
    /// Passphrase protecting the signing key.
    pub sign_passphrase: String,
    /// Number of full backup chains duplicity keeps on cleanup.
    pub full_backups_to_keep: u32,
    /// Periodic slot the backup script runs in.
    pub backup_schedule: BackupSchedule,
    /// Duplicity target URL.
    pub backup_target: String,
    pub restore_timeout: Duration,
    pub backup_timeout: Duration,
    pub verify_timeout: Duration,
    /// Force flag consulted by the conditional restore on boot.
    pub force_restore: bool,
}

impl Config {
    /// Load the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load the configuration through an arbitrary lookup function.
    ///
    /// Tests supply a map-backed lookup instead of touching the real
    /// environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| -> Option<String> {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let require = |key: &str| -> Result<String> {
            get(key).with_context(|| format!("required environment variable {} is not set", key))
        };

        let encryption_key_material = require("ENCRYPTION_KEY_MATERIAL")?;
        let encryption_passphrase = require("ENCRYPTION_PASSPHRASE")?;
        let sign_key_material =
            get("SIGN_KEY_MATERIAL").unwrap_or_else(|| encryption_key_material.clone());
        let sign_passphrase =
            get("SIGN_PASSPHRASE").unwrap_or_else(|| encryption_passphrase.clone());

        Ok(Self {
            external_hostname: get("EXTERNAL_HOSTNAME").unwrap_or_else(|| "localhost".to_string()),
            external_ssh_port: parse(get("EXTERNAL_SSH_PORT"), "EXTERNAL_SSH_PORT", 2222)?,
            external_http_port: parse(get("EXTERNAL_HTTP_PORT"), "EXTERNAL_HTTP_PORT", 9980)?,
            encryption_key_material,
            encryption_passphrase,
            sign_key_material,
            sign_passphrase,
            full_backups_to_keep: parse(get("FULL_BACKUPS_TO_KEEP"), "FULL_BACKUPS_TO_KEEP", 4)?,
            backup_schedule: BackupSchedule::parse_or_default(get("BACKUP_SCHEDULE").as_deref()),
            backup_target: get("BACKUP_TARGET")
                .unwrap_or_else(|| "file:///usr/local/backup".to_string()),
            restore_timeout: Duration::from_secs(parse(
                get("RESTORE_TIMEOUT_SECONDS"),
                "RESTORE_TIMEOUT_SECONDS",
                3600,
            )?),
            backup_timeout: Duration::from_secs(parse(
                get("BACKUP_TIMEOUT_SECONDS"),
                "BACKUP_TIMEOUT_SECONDS",
                3600,
            )?),
            verify_timeout: Duration::from_secs(parse(
                get("VERIFY_TIMEOUT_SECONDS"),
                "VERIFY_TIMEOUT_SECONDS",
                1800,
            )?),
            force_restore: parse_bool(get("FORCE_RESTORE"), "FORCE_RESTORE")?,
        })
    }

    /// SSH clone URL prefix for this appliance.
    ///
    /// The port segment is omitted when it matches the protocol default.
    pub fn git_ssh_url(&self) -> String {
        if self.external_ssh_port == 22 {
            format!("ssh://git@{}", self.external_hostname)
        } else {
            format!(
                "ssh://git@{}:{}",
                self.external_hostname, self.external_ssh_port
            )
        }
    }

    /// HTTP(S) clone URL prefix for this appliance.
    pub fn git_http_url(&self) -> String {
        match self.external_http_port {
            443 => format!("https://{}", self.external_hostname),
            80 => format!("http://{}", self.external_hostname),
            port => format!("http://{}:{}", self.external_hostname, port),
        }
    }
}

fn parse<T>(value: Option<String>, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match value {
        Some(v) => v
            .parse()
            .with_context(|| format!("failed to parse {}='{}'", key, v)),
        None => Ok(default),
    }
}

fn parse_bool(value: Option<String>, key: &str) -> Result<bool> {
    match value.as_deref() {
        None => Ok(false),
        Some(v) => match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            _ => bail!("failed to parse {}='{}' as a boolean", key, v),
        },
    }
}
