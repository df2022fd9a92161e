use std::time::Duration;
use tokio::process::Command;

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
use unix as imp;
#[cfg(windows)]
use windows as imp;

/// Host process and network control used for port reclamation.
///
/// Every call goes to the live OS; nothing is cached between calls.
pub trait ProcessControl: Send + Sync {
    /// PIDs owning a listening or established TCP socket on local `port`.
    fn list_connections(&self, port: u16) -> Vec<u32>;

    /// Name of a living process, or `None` if `pid` has exited or is defunct.
    fn process_name(&self, pid: u32) -> Option<String>;

    /// Ask `pid` to exit (`force = false`) or kill it outright.
    fn terminate(&self, pid: u32, force: bool) -> anyhow::Result<()>;

    /// Kill `pid` together with all of its descendants.
    fn terminate_tree(&self, pid: u32) -> anyhow::Result<()>;

    /// Remove and re-add an excluded port range covering `port`. Needs
    /// elevated privileges.
    fn cycle_port_exclusion(&self, port: u16) -> anyhow::Result<()>;

    /// Reset the host's TCP/IP and socket configuration. Needs elevated
    /// privileges and may require a reboot to take full effect.
    fn reset_network_stack(&self) -> anyhow::Result<()>;
}

/// [`ProcessControl`] backed by the running operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcesses;

impl ProcessControl for SystemProcesses {
    fn list_connections(&self, port: u16) -> Vec<u32> {
        imp::list_connections(port)
    }

    fn process_name(&self, pid: u32) -> Option<String> {
        imp::process_name(pid)
    }

    fn terminate(&self, pid: u32, force: bool) -> anyhow::Result<()> {
        imp::terminate(pid, force)
    }

    fn terminate_tree(&self, pid: u32) -> anyhow::Result<()> {
        imp::terminate_tree(pid)
    }

    fn cycle_port_exclusion(&self, port: u16) -> anyhow::Result<()> {
        imp::cycle_port_exclusion(port)
    }

    fn reset_network_stack(&self) -> anyhow::Result<()> {
        imp::reset_network_stack()
    }
}

/// Create a platform-appropriate shell command.
/// Unix: `$SHELL -l -c <command>`, Windows: `cmd.exe /C <command>`
pub fn shell_command(command: &str) -> Command {
    imp::shell_command(command)
}

/// Configure the command to run in a new process group.
/// Unix: `process_group(0)`, Windows: `CREATE_NEW_PROCESS_GROUP`
pub fn configure_process_group(cmd: &mut Command) {
    imp::configure_process_group(cmd)
}

/// Gracefully terminate a child process and its descendants, killing them
/// if they are still around after `grace`. Returns true once the child has
/// been reaped.
pub async fn terminate_child(
    child: &mut tokio::process::Child,
    child_pid: Option<u32>,
    grace: Duration,
) -> bool {
    imp::terminate_child(child, child_pid, grace).await
}

/// Shell name for log messages.
pub fn shell_name() -> String {
    imp::shell_name()
}

/// Expand leading `~` or `$HOME` in a path string to the actual home directory.
///
/// Returns the original string unchanged when no home directory is available
/// or the string doesn't start with `~` or `$HOME`.
pub fn expand_home(path: &str) -> String {
    if let Some(home) = std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE")) {
        let home = home.to_string_lossy();
        if path == "~" || path == "$HOME" {
            return home.to_string();
        }
        if let Some(rest) = path.strip_prefix('~').filter(|r| r.starts_with('/')) {
            return format!("{}{}", home, rest);
        }
        if let Some(rest) = path
            .strip_prefix("$HOME")
            .filter(|r| r.starts_with('/') || r.starts_with('\\'))
        {
            return format!("{}{}", home, rest);
        }
    }
    path.to_string()
}

/// Normalize a process name for comparison: lower-case, without a trailing
/// `.exe` and without any directory part.
pub fn normalize_process_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let lower = base.trim().to_ascii_lowercase();
    lower.strip_suffix(".exe").unwrap_or(&lower).to_string()
}
