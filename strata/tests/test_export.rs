use std::process::Command;

use serde_json::Value as JsonValue;

fn strata() -> Command {
    Command::new(env!("CARGO_BIN_EXE_strata"))
}

fn read_lines(path: &std::path::Path) -> Vec<JsonValue> {
    let text = std::fs::read_to_string(path).expect("Failed to read export");
    text.lines()
        .map(|line| serde_json::from_str(line).expect("Each line should be a JSON object"))
        .collect()
}

#[test]
fn test_demo_exports_json_lines() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let export = dir.path().join("records.jsonl");

    let output = strata()
        .args(["--threads", "2", "--kernels", "4", "--record-kernel-names", "--quiet", "--export"])
        .arg(&export)
        .output()
        .expect("Failed to run strata");
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let lines = read_lines(&export);
    println!("exported {} records", lines.len());

    // per thread: 4 kernels + 1 copy, 4 snapshots each followed by one allocator record
    assert_eq!(lines.len(), 26);

    let activities: Vec<_> = lines.iter().filter(|l| l.get("gpu.activity").is_some()).collect();
    assert_eq!(activities.len(), 10);
    for activity in &activities {
        let region = activity["region"].as_str().expect("activity inherits the worker region");
        assert!(region.starts_with("worker-"));
        assert!(activity["gpu.activity.duration"].as_u64().is_some());
    }
    assert!(activities.iter().any(|a| a["gpu.kernel.name"] == "solver::matmul"));
    assert!(activities.iter().any(|a| a["gpu.activity.bytes"] == 1 << 20));

    let allocators = lines.iter().filter(|l| l.get("alloc.name").is_some()).count();
    assert_eq!(allocators, 8);
}

#[test]
fn test_demo_without_activity_tracing() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let export = dir.path().join("records.jsonl");

    let output = strata()
        .args(["-t", "1", "-k", "3", "--no-trace-activities", "--quiet", "--export"])
        .arg(&export)
        .output()
        .expect("Failed to run strata");
    assert!(output.status.success());

    let lines = read_lines(&export);
    assert!(lines.iter().all(|l| l.get("gpu.activity").is_none()));
    assert_eq!(lines.len(), 6);
}

#[test]
fn test_demo_prints_summary() {
    let output = strata().args(["-t", "2", "-k", "2"]).output().expect("Failed to run strata");
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("channel 'demo'"));
    assert!(stdout.contains("correlations:"));
    assert!(stdout.contains("values imported"));
}

#[test]
fn test_bad_config_is_a_usage_error() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let config = dir.path().join("broken.json");
    std::fs::write(&config, "{ not json").expect("Failed to write config");

    let output = strata().arg("--config").arg(&config).output().expect("Failed to run strata");
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("broken.json"));
}

#[test]
fn test_thread_count_is_validated() {
    let output = strata().args(["--threads", "0"]).output().expect("Failed to run strata");
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_bad_category_list_is_a_usage_error() {
    let output = strata().args(["--categories", "general", "-q"]).output().expect("Failed to run strata");
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Invalid category list"));
}
