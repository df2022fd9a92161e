use crate::common::*;
use std::net::TcpListener;
use std::time::Duration;
use tokio::process::Command;

#[tokio::test]
async fn busy_preferred_port_moves_to_fallback_and_is_persisted() {
    let ports = free_ports(2);
    // Held by this test process, which is not one of ours.
    let _squatter = TcpListener::bind(("127.0.0.1", ports[0])).unwrap();
    let project = TestProject::new(&http_server_stack(&[("api", ports[0], &[ports[1]])]));

    let mut child = Command::new(env!("CARGO_BIN_EXE_llmstack"))
        .args(["-f", project.config_path.to_str().unwrap(), "up"])
        .kill_on_drop(true)
        .spawn()
        .expect("failed to start llmstack");

    assert!(
        wait_for_port(ports[1], Duration::from_secs(20)).await,
        "service did not start on the fallback port"
    );
    assert_eq!(project.persisted_port("api"), Some(ports[1]));

    interrupt(&child);
    let _ = tokio::time::timeout(Duration::from_secs(20), child.wait()).await;
    // The squatter was left alone.
    assert!(TcpListener::bind(("127.0.0.1", ports[0])).is_err());
}
