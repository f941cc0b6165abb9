use std::process::Command;

fn vigil(dir: &std::path::Path, args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_vigil"))
        .args(args)
        .current_dir(dir)
        .env_remove("RUST_LOG")
        .output()
        .unwrap()
}

#[test]
fn invalid_overrides_are_rejected_before_any_request() {
    let dir = tempfile::tempdir().unwrap();

    let output = vigil(dir.path(), &["batch", "group/app", "--max-units", "0"]);

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("batch.max_units"), "stderr: {stderr}");
}

#[test]
fn config_file_values_are_validated() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join(".vigil.toml"),
        "[circuit_breaker]\nfailure_threshold = 0\n",
    )
    .unwrap();

    let output = vigil(dir.path(), &["batch", "group/app"]);

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("failure_threshold"), "stderr: {stderr}");
}

#[test]
fn malformed_config_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("custom.toml");
    std::fs::write(&path, "[batch\nmax_units = ").unwrap();

    let output = vigil(
        dir.path(),
        &["batch", "group/app", "--config", path.to_str().unwrap()],
    );

    assert!(!output.status.success());
}

#[test]
fn unknown_review_mode_is_a_usage_error() {
    let dir = tempfile::tempdir().unwrap();

    let output = vigil(dir.path(), &["batch", "group/app", "--mode", "style"]);

    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unknown review mode"), "stderr: {stderr}");
}

#[test]
fn completions_are_generated() {
    let dir = tempfile::tempdir().unwrap();

    let output = vigil(dir.path(), &["completions", "bash"]);

    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("vigil"));
}

#[test]
fn review_without_iid_needs_a_merge_request_url() {
    let dir = tempfile::tempdir().unwrap();

    let output = vigil(dir.path(), &["review", "acme/app"]);

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("cannot parse merge request URL"), "stderr: {stderr}");
}

#[test]
fn ci_outside_a_pipeline_fails() {
    let dir = tempfile::tempdir().unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_vigil"))
        .arg("ci")
        .current_dir(dir.path())
        .env_remove("RUST_LOG")
        .env_remove("GITLAB_CI")
        .output()
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("GITLAB_CI"), "stderr: {stderr}");
}
