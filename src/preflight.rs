//! Preflight checks for the appliance's external tools.
//!
//! The supervisor is glue around ssh-keygen, gpg, duplicity and the server
//! daemons; a missing binary shows up here with an install hint instead of
//! as an opaque spawn failure halfway through boot.

use crate::paths::{LIGHTTPD_BIN, SSHD_BIN};
use crate::process::which;

/// Required host tools with their purpose and install suggestion.
const REQUIRED_TOOLS: &[(&str, &str, &str)] = &[
    ("ssh-keygen", "Generate SSH host keys", "apk add openssh"),
    (SSHD_BIN, "Serve git over SSH", "apk add openssh"),
    ("gpg", "Import backup signing/encryption keys", "apk add gnupg"),
    ("duplicity", "Run encrypted backups", "apk add duplicity"),
    ("crond", "Run scheduled backups", "apk add busybox-openrc"),
    (LIGHTTPD_BIN, "Serve git over HTTP", "apk add lighttpd"),
];

/// Result of a single preflight check.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub message: String,
    pub suggestion: Option<String>,
}

impl CheckResult {
    fn pass(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            message: message.into(),
            suggestion: None,
        }
    }

    fn fail(
        name: impl Into<String>,
        message: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            passed: false,
            message: message.into(),
            suggestion: Some(suggestion.into()),
        }
    }
}

/// Check that all required host tools are installed.
pub fn check_host_tools() -> Vec<CheckResult> {
    REQUIRED_TOOLS
        .iter()
        .map(|(tool, purpose, install)| check_tool(tool, purpose, install))
        .collect()
}

fn check_tool(tool: &str, purpose: &str, install_cmd: &str) -> CheckResult {
    match which(tool) {
        Some(path) => CheckResult::pass(
            format!("{} tool", tool),
            format!("Found at {} ({})", path.display(), purpose),
        ),
        None => CheckResult::fail(
            format!("{} tool", tool),
            format!("Not found (needed for: {})", purpose),
            install_cmd,
        ),
    }
}

/// Print check results in a human-readable form.
pub fn print_results(results: &[CheckResult]) {
    for check in results {
        let status = if check.passed { "[OK]" } else { "[FAIL]" };
        println!("{} {}: {}", status, check.name, check.message);
        if let Some(suggestion) = &check.suggestion {
            println!("     Suggestion: {}", suggestion);
        }
    }
}
