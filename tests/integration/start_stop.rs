use crate::common::*;
use std::time::Duration;
use tokio::process::Command;

#[tokio::test]
async fn up_then_interrupt_stops_everything() {
    let ports = free_ports(2);
    let project = TestProject::new(&http_server_stack(&[
        ("api", ports[0], &[]),
        ("ui", ports[1], &[]),
    ]));

    let mut child = Command::new(env!("CARGO_BIN_EXE_llmstack"))
        .args(["-f", project.config_path.to_str().unwrap(), "up"])
        .kill_on_drop(true)
        .spawn()
        .expect("failed to start llmstack");

    assert!(wait_for_port(ports[0], Duration::from_secs(20)).await, "api did not start");
    assert!(wait_for_port(ports[1], Duration::from_secs(20)).await, "ui did not start");
    // Give the last health check time to land and the run state to be written.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(project.state_file().exists(), "run state not recorded");
    assert_eq!(project.persisted_port("api"), Some(ports[0]));

    interrupt(&child);
    let status = tokio::time::timeout(Duration::from_secs(20), child.wait())
        .await
        .expect("llmstack did not exit")
        .unwrap();

    assert!(status.success(), "clean shutdown should exit 0, got {status}");
    for port in &ports {
        assert!(
            wait_for_port_release(*port, Duration::from_secs(5)).await,
            "port {port} still held after shutdown"
        );
    }
    assert!(!project.state_file().exists(), "run state left behind");
}
