//! Container entrypoint sequence.
//!
//! A strict linear boot: SSH host keys, authorized keys, GPG credentials,
//! backup startup, then the long-running daemons. The supervisor ends by
//! replacing its own process image with sshd, which becomes the container's
//! foreground process; everything before that must either succeed or abort.

use std::process::Command;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use crate::backup::BackupService;
use crate::config::Config;
use crate::gpg::BackupKeys;
use crate::paths::{Layout, CROND_BIN, LIGHTTPD_BIN, LIGHTTPD_CONF, SSHD_BIN};
use crate::preflight;
use crate::ssh::SshServer;
use crate::state::FileStateStore;

/// Run the boot sequence. Only returns on error: the happy path ends in
/// `exec` of the SSH daemon.
pub fn run(config: &Config, layout: &Layout) -> Result<()> {
    info!("starting gitnest");

    for check in preflight::check_host_tools() {
        if !check.passed {
            warn!("{}: {}", check.name, check.message);
        }
    }

    let state = FileStateStore::new(&layout.state_dir)?;

    info!("initializing SSH server and keys");
    let ssh = SshServer::new(layout, &state);
    ssh.init()?;
    ssh.install_authorized_keys()?;

    info!("initializing GPG backup keys");
    let keys = BackupKeys::new(config, layout, &state);
    keys.init()?;

    info!("initializing duplicity backup");
    let backup = BackupService::init(config, layout, &state);
    if backup.is_configured() {
        spawn_daemon(Command::new(CROND_BIN))?;
    }

    let mut lighttpd = Command::new(LIGHTTPD_BIN);
    lighttpd.args(["-D", "-f", LIGHTTPD_CONF]);
    spawn_daemon(lighttpd)?;

    if !ssh.is_configured() {
        // Without sshd there is no foreground process to hand off to; make
        // that an explicit failure instead of exiting silently.
        bail!("SSH is not configured, refusing to start without a foreground server");
    }
    exec_sshd()
}

fn spawn_daemon(mut command: Command) -> Result<()> {
    let program = command.get_program().to_string_lossy().into_owned();
    info!("launching {}", program);
    command
        .spawn()
        .with_context(|| format!("failed to launch {}", program))?;
    Ok(())
}

/// Replace the current process image with the SSH daemon in foreground mode.
fn exec_sshd() -> Result<()> {
    use std::os::unix::process::CommandExt;

    info!("handing off to {}", SSHD_BIN);
    let err = Command::new(SSHD_BIN).arg("-D").exec();
    // exec only returns on failure.
    Err(err).with_context(|| format!("replacing process with {}", SSHD_BIN))
}
