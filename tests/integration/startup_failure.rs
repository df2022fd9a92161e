use crate::common::*;
use std::time::Duration;
use tokio::process::Command;

#[tokio::test]
async fn crashing_service_rolls_back_and_fails() {
    let ports = free_ports(2);
    let mut config = http_server_stack(&[("api", ports[0], &[])]);
    config.push_str(&format!(
        r#"
[[service]]
name = "ui"
command = "echo model file missing >&2; exit 3"
port = {}
health = "http://{{{{ host }}}}:{{{{ port }}}}/"
max_start_retries = 1
"#,
        ports[1]
    ));
    let project = TestProject::new(&config);

    let output = tokio::time::timeout(
        Duration::from_secs(60),
        Command::new(env!("CARGO_BIN_EXE_llmstack"))
            .args(["-f", project.config_path.to_str().unwrap(), "up"])
            .output(),
    )
    .await
    .expect("llmstack did not exit")
    .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("step `ui` failed"), "got: {stderr}");
    assert!(stderr.contains("exited with code 3"), "got: {stderr}");
    assert!(stderr.contains("model file missing"), "got: {stderr}");
    // api was started first and must have been rolled back.
    assert!(wait_for_port_release(ports[0], Duration::from_secs(5)).await);
}
