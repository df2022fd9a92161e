use std::os::windows::process::CommandExt as _;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use windows_sys::Win32::System::Console::{GenerateConsoleCtrlEvent, CTRL_BREAK_EVENT};
use windows_sys::Win32::System::Threading::{CREATE_NEW_PROCESS_GROUP, CREATE_NO_WINDOW};

pub fn shell_name() -> String {
    "cmd.exe /C".to_string()
}

pub fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd.exe");
    cmd.arg("/C").arg(command);
    cmd
}

pub fn configure_process_group(cmd: &mut Command) {
    cmd.creation_flags(CREATE_NEW_PROCESS_GROUP | CREATE_NO_WINDOW);
}

pub async fn terminate_child(
    child: &mut tokio::process::Child,
    child_pid: Option<u32>,
    grace: Duration,
) -> bool {
    if let Some(pid) = child_pid {
        // Try CTRL_BREAK_EVENT first for graceful shutdown.
        unsafe {
            if GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid) != 0 {
                debug!(pid, "sent CTRL_BREAK_EVENT");
            }
        }

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(_status)) => {
                debug!(pid, "child exited after CTRL_BREAK");
                return true;
            }
            _ => {
                warn!(pid, grace_ms = grace.as_millis() as u64, "child did not exit in time, terminating tree");
                if let Err(e) = terminate_tree(pid) {
                    debug!(pid, error = %e, "taskkill /T failed");
                }
            }
        }
    }

    let _ = child.kill().await;
    child.wait().await.is_ok()
}

/// Run a console utility without a window, returning stdout. A non-zero exit
/// is an error carrying stderr.
fn run_utility(program: &str, args: &[&str]) -> anyhow::Result<String> {
    let output = std::process::Command::new(program)
        .args(args)
        .creation_flags(CREATE_NO_WINDOW)
        .output()?;
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    debug!(
        program,
        ?args,
        status = %output.status,
        stdout = %stdout.trim(),
        stderr = %stderr.trim(),
        "ran system utility"
    );
    if !output.status.success() {
        anyhow::bail!("{} exited with {}: {}", program, output.status, stderr.trim());
    }
    Ok(stdout)
}

/// Parse `netstat -ano` rows: `TCP  127.0.0.1:8000  0.0.0.0:0  LISTENING  1234`.
fn parse_netstat(output: &str, port: u16) -> Vec<u32> {
    let suffix = format!(":{}", port);
    let mut pids = Vec::new();
    for line in output.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 5 || !parts[0].eq_ignore_ascii_case("TCP") {
            continue;
        }
        if !parts[1].ends_with(&suffix) {
            continue;
        }
        let state = parts[3].to_ascii_uppercase();
        if state != "LISTENING" && state != "ESTABLISHED" {
            continue;
        }
        if let Ok(pid) = parts[4].parse::<u32>() {
            if pid != 0 && !pids.contains(&pid) {
                pids.push(pid);
            }
        }
    }
    pids
}

pub fn list_connections(port: u16) -> Vec<u32> {
    match run_utility("netstat", &["-ano", "-p", "TCP"]) {
        Ok(out) => {
            let mut pids = parse_netstat(&out, port);
            if let Ok(out6) = run_utility("netstat", &["-ano", "-p", "TCPv6"]) {
                for pid in parse_netstat(&out6, port) {
                    if !pids.contains(&pid) {
                        pids.push(pid);
                    }
                }
            }
            pids
        }
        Err(e) => {
            warn!(port, error = %e, "netstat failed");
            Vec::new()
        }
    }
}

/// First CSV column of `tasklist /FO CSV /NH`; `INFO:` lines mean no such task.
fn parse_tasklist(output: &str) -> Option<String> {
    let line = output.lines().map(str::trim).find(|l| !l.is_empty())?;
    if line.starts_with("INFO:") {
        return None;
    }
    let first = line.split("\",\"").next()?.trim_matches('"');
    if first.is_empty() {
        None
    } else {
        Some(first.to_string())
    }
}

pub fn process_name(pid: u32) -> Option<String> {
    let filter = format!("PID eq {}", pid);
    let out = run_utility("tasklist", &["/FI", &filter, "/FO", "CSV", "/NH"]).ok()?;
    parse_tasklist(&out)
}

pub fn terminate(pid: u32, force: bool) -> anyhow::Result<()> {
    let pid = pid.to_string();
    if force {
        run_utility("taskkill", &["/F", "/PID", &pid])?;
    } else {
        run_utility("taskkill", &["/PID", &pid])?;
    }
    Ok(())
}

pub fn terminate_tree(pid: u32) -> anyhow::Result<()> {
    run_utility("taskkill", &["/F", "/T", "/PID", &pid.to_string()])?;
    Ok(())
}

pub fn cycle_port_exclusion(port: u16) -> anyhow::Result<()> {
    let start = format!("startport={}", port);
    let base = ["int", "ipv4"];
    let tail = ["excludedportrange", "protocol=tcp", start.as_str(), "numberofports=1"];

    let delete: Vec<&str> = base.iter().copied().chain(["delete"]).chain(tail).collect();
    if let Err(e) = run_utility("netsh", &delete) {
        // Not excluded in the first place is fine; re-adding still resets it.
        debug!(port, error = %e, "netsh delete excludedportrange failed");
    }
    let add: Vec<&str> = base.iter().copied().chain(["add"]).chain(tail).collect();
    run_utility("netsh", &add)?;
    Ok(())
}

pub fn reset_network_stack() -> anyhow::Result<()> {
    run_utility("netsh", &["winsock", "reset"])?;
    run_utility("netsh", &["int", "ip", "reset"])?;
    warn!("network stack reset; a reboot may be required for it to take full effect");
    Ok(())
}
