use crate::command::CommandBuilder;
use crate::prelude::*;
use std::process::{Command, Stdio};
use std::sync::OnceLock;

static SUDO_AVAILABLE: OnceLock<bool> = OnceLock::new();

fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Whether `sudo -n` can be used without prompting.
fn sudo_available() -> bool {
    *SUDO_AVAILABLE.get_or_init(|| {
        // `sudo -n true` will fail if sudo does not exist or would need a password
        let available = Command::new("sudo")
            .args(["-n", "true"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|status| status.success());
        debug!("Non-interactive sudo available: {available}");
        available
    })
}

/// Wrap a privileged command with `sudo -n` when we are not root and sudo is usable.
pub fn wrap_with_sudo(mut builder: CommandBuilder) -> CommandBuilder {
    if !is_root() && sudo_available() {
        builder.wrap("sudo", ["-n"]);
    }
    builder
}
