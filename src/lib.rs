//! gitnest appliance supervisor library.
//!
//! Provisions a self-hosted git server container: SSH host and user keys,
//! GPG credentials for backup signing/encryption, and the duplicity backup
//! lifecycle, all gated by per-component configured flags so restarts are
//! idempotent.

pub mod backup;
pub mod config;
pub mod entrypoint;
pub mod gpg;
pub mod paths;
pub mod preflight;
pub mod process;
pub mod ssh;
pub mod state;
