use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;

/// Return the user's default shell from `$SHELL`, falling back to `sh`.
fn user_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "sh".to_string())
}

/// Human-readable description of the shell for log messages.
pub fn shell_name() -> String {
    let shell = user_shell();
    format!("{} -lc", shell)
}

pub fn shell_command(command: &str) -> Command {
    let shell = user_shell();
    let mut cmd = Command::new(&shell);
    // Login shell (-l) sources the user's profile/rc files so that
    // PATH and other environment customisations are available.
    cmd.arg("-l").arg("-c").arg(command);
    cmd
}

pub fn configure_process_group(cmd: &mut Command) {
    cmd.process_group(0);
}

pub async fn terminate_child(
    child: &mut tokio::process::Child,
    child_pid: Option<u32>,
    grace: Duration,
) -> bool {
    if let Some(pid) = child_pid {
        let pgid = Pid::from_raw(pid as i32);
        match killpg(pgid, Signal::SIGTERM) {
            Ok(()) => {
                debug!(pid, "sent SIGTERM to process group");
            }
            Err(nix::errno::Errno::ESRCH) => {
                debug!(pid, "process group already exited");
                return child.wait().await.is_ok();
            }
            Err(e) => {
                warn!(pid, error = %e, "killpg(SIGTERM) failed, falling back to kill");
                let _ = child.kill().await;
                return child.wait().await.is_ok();
            }
        }

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(_status)) => {
                debug!(pid, "child exited after SIGTERM");
                // Stragglers in the group that ignored SIGTERM.
                let _ = killpg(pgid, Signal::SIGKILL);
                true
            }
            _ => {
                warn!(pid, grace_ms = grace.as_millis() as u64, "child did not exit in time, sending SIGKILL");
                let _ = killpg(pgid, Signal::SIGKILL);
                let _ = child.kill().await;
                child.wait().await.is_ok()
            }
        }
    } else {
        let _ = child.kill().await;
        child.wait().await.is_ok()
    }
}

pub fn terminate(pid: u32, force: bool) -> anyhow::Result<()> {
    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    match kill(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(anyhow::anyhow!("kill({pid}, {signal:?}) failed: {e}")),
    }
}

pub fn terminate_tree(pid: u32) -> anyhow::Result<()> {
    let mut victims = Vec::new();
    collect_descendants(pid, &mut victims);
    // Deepest descendants first so nothing gets re-parented mid-sweep.
    for child in victims.iter().rev() {
        let _ = kill(Pid::from_raw(*child as i32), Signal::SIGKILL);
    }
    terminate(pid, true)
}

fn collect_descendants(pid: u32, out: &mut Vec<u32>) {
    for child in child_pids(pid) {
        if !out.contains(&child) {
            out.push(child);
            collect_descendants(child, out);
        }
    }
}

pub fn cycle_port_exclusion(port: u16) -> anyhow::Result<()> {
    anyhow::bail!("port exclusion ranges are not supported on this platform (port {port})")
}

pub fn reset_network_stack() -> anyhow::Result<()> {
    anyhow::bail!("network stack reset is not supported on this platform")
}

// ---------------------------------------------------------------------------
// Linux: /proc
// ---------------------------------------------------------------------------

/// TCP states from include/net/tcp_states.h
#[cfg(target_os = "linux")]
const TCP_ESTABLISHED: &str = "01";
#[cfg(target_os = "linux")]
const TCP_LISTEN: &str = "0A";

#[cfg(target_os = "linux")]
pub fn list_connections(port: u16) -> Vec<u32> {
    let port_hex = format!("{:04X}", port);
    let mut inodes: Vec<String> = Vec::new();

    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        let Ok(content) = std::fs::read_to_string(table) else {
            continue;
        };
        for line in content.lines().skip(1) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 {
                continue;
            }
            let local_port = fields[1].rsplit(':').next();
            let state = fields[3];
            let inode = fields[9];
            if local_port == Some(port_hex.as_str())
                && (state == TCP_LISTEN || state == TCP_ESTABLISHED)
                && inode != "0"
                && !inodes.iter().any(|i| i == inode)
            {
                inodes.push(inode.to_string());
            }
        }
    }

    if inodes.is_empty() {
        return Vec::new();
    }
    debug!(port, ?inodes, "socket inodes on port");

    let targets: Vec<String> = inodes.iter().map(|i| format!("socket:[{}]", i)).collect();
    let mut pids = Vec::new();
    let Ok(proc_dir) = std::fs::read_dir("/proc") else {
        return pids;
    };
    for entry in proc_dir.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let Ok(fds) = std::fs::read_dir(entry.path().join("fd")) else {
            continue;
        };
        let owns = fds.flatten().any(|fd| {
            std::fs::read_link(fd.path())
                .map(|link| targets.iter().any(|t| link.to_string_lossy() == *t))
                .unwrap_or(false)
        });
        if owns && !pids.contains(&pid) {
            pids.push(pid);
        }
    }
    pids
}

/// Parse `(comm) state ppid` out of `/proc/<pid>/stat`. The command name may
/// itself contain spaces and parentheses, so split at the last `)`.
#[cfg(target_os = "linux")]
fn read_stat(pid: u32) -> Option<(String, char, u32)> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    let open = stat.find('(')?;
    let close = stat.rfind(')')?;
    let comm = stat.get(open + 1..close)?.to_string();
    let mut rest = stat.get(close + 1..)?.split_whitespace();
    let state = rest.next()?.chars().next()?;
    let ppid = rest.next()?.parse().ok()?;
    Some((comm, state, ppid))
}

#[cfg(target_os = "linux")]
pub fn process_name(pid: u32) -> Option<String> {
    let (comm, state, _) = read_stat(pid)?;
    // Z = zombie, X = dead: the pid no longer maps to a running program.
    if state == 'Z' || state == 'X' || comm.is_empty() {
        return None;
    }
    Some(comm)
}

#[cfg(target_os = "linux")]
fn child_pids(pid: u32) -> Vec<u32> {
    let Ok(proc_dir) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    proc_dir
        .flatten()
        .filter_map(|e| e.file_name().to_str().and_then(|s| s.parse::<u32>().ok()))
        .filter(|candidate| read_stat(*candidate).is_some_and(|(_, _, ppid)| ppid == pid))
        .collect()
}

// ---------------------------------------------------------------------------
// Other Unix: lsof / ps / pgrep
// ---------------------------------------------------------------------------

#[cfg(not(target_os = "linux"))]
fn command_stdout(program: &str, args: &[&str]) -> Option<String> {
    let output = std::process::Command::new(program).args(args).output().ok()?;
    debug!(program, ?args, status = %output.status, "ran process query");
    Some(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(not(target_os = "linux"))]
fn parse_pid_lines(output: &str) -> Vec<u32> {
    let mut pids = Vec::new();
    for pid in output.lines().filter_map(|l| l.trim().parse::<u32>().ok()) {
        if !pids.contains(&pid) {
            pids.push(pid);
        }
    }
    pids
}

#[cfg(not(target_os = "linux"))]
pub fn list_connections(port: u16) -> Vec<u32> {
    let spec = format!("-iTCP:{}", port);
    let listening = command_stdout("lsof", &["-nP", &spec, "-sTCP:LISTEN", "-t"]).unwrap_or_default();
    let established =
        command_stdout("lsof", &["-nP", &spec, "-sTCP:ESTABLISHED", "-t"]).unwrap_or_default();
    let mut pids = parse_pid_lines(&listening);
    for pid in parse_pid_lines(&established) {
        if !pids.contains(&pid) {
            pids.push(pid);
        }
    }
    pids
}

#[cfg(not(target_os = "linux"))]
pub fn process_name(pid: u32) -> Option<String> {
    let out = command_stdout("ps", &["-p", &pid.to_string(), "-o", "stat=,comm="])?;
    let line = out.lines().next()?.trim();
    let (stat, comm) = line.split_once(char::is_whitespace)?;
    if stat.starts_with('Z') {
        return None;
    }
    let comm = comm.trim();
    if comm.is_empty() {
        None
    } else {
        Some(comm.to_string())
    }
}

#[cfg(not(target_os = "linux"))]
fn child_pids(pid: u32) -> Vec<u32> {
    command_stdout("pgrep", &["-P", &pid.to_string()])
        .map(|out| parse_pid_lines(&out))
        .unwrap_or_default()
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn stat_of_self_parses() {
        let (comm, state, ppid) = read_stat(std::process::id()).unwrap();
        assert!(!comm.is_empty());
        assert_ne!(state, 'Z');
        assert!(ppid > 0);
    }

    #[test]
    fn unknown_pid_has_no_name() {
        // pid_max on Linux never reaches u32::MAX - 1.
        assert_eq!(process_name(u32::MAX - 1), None);
    }

    #[tokio::test]
    async fn terminate_tree_kills_descendants() {
        let mut child = std::process::Command::new("sh")
            .arg("-c")
            .arg("sleep 60 & sleep 60; wait")
            .spawn()
            .unwrap();
        let pid = child.id();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let mut descendants = Vec::new();
        collect_descendants(pid, &mut descendants);
        assert!(!descendants.is_empty(), "sh should have sleep children");

        terminate_tree(pid).unwrap();
        let _ = child.wait();
        tokio::time::sleep(Duration::from_millis(200)).await;
        for d in descendants {
            assert!(process_name(d).is_none(), "descendant {d} survived");
        }
    }
}
