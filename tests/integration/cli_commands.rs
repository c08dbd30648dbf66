#![allow(missing_docs)]

use std::fs;

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use tempfile::TempDir;

fn stdout_of(args: &[&str]) -> String {
    let output = cargo_bin_cmd!("penumbra")
        .args(args)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    String::from_utf8(output).expect("utf8 stdout")
}

fn stderr_of_failure(args: &[&str]) -> String {
    let output = cargo_bin_cmd!("penumbra")
        .args(args)
        .assert()
        .failure()
        .get_output()
        .stderr
        .clone();
    String::from_utf8(output).expect("utf8 stderr")
}

#[test]
fn check_config_prints_effective_settings() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("graph.toml");
    fs::write(&path, "[cluster]\nmax-partitions = 8\n\n[ids]\nplacement = \"bulk\"\n")
        .expect("write config");
    let path = path.to_str().expect("utf8 path");

    let text = stdout_of(&["check-config", path]);
    assert!(text.contains("is valid"), "{text}");
    assert!(text.contains("max-partitions = 8"), "{text}");
    assert!(text.contains("block-size"), "{text}");

    let json: Value =
        serde_json::from_str(&stdout_of(&["--format", "json", "check-config", path]))
            .expect("valid json");
    assert_eq!(json["cluster"]["max-partitions"], 8);
    assert_eq!(json["ids"]["placement"], "bulk");
}

#[test]
fn check_config_rejects_invalid_settings() {
    let dir = TempDir::new().expect("tempdir");
    let bad_partitions = dir.path().join("partitions.toml");
    fs::write(&bad_partitions, "[cluster]\nmax-partitions = 12\n").expect("write config");
    let err = stderr_of_failure(&["check-config", bad_partitions.to_str().expect("path")]);
    assert!(err.starts_with("error: configuration error:"), "{err}");
    assert!(err.contains("power of two"), "{err}");

    let bad_ids = dir.path().join("ids.toml");
    fs::write(&bad_ids, "[graph]\nallow-custom-vertex-id-types = true\n").expect("write config");
    let err = stderr_of_failure(&["check-config", bad_ids.to_str().expect("path")]);
    assert!(err.contains("allow-custom-vertex-ids is disabled"), "{err}");

    let err = stderr_of_failure(&["check-config", "/nonexistent/graph.toml"]);
    assert!(err.starts_with("error:"), "{err}");
}

#[test]
fn decode_id_splits_vertex_ids() {
    // count 7, partition 3 of 32, normal vertex suffix.
    let id = ((7u64 << 5) | 3) << 3;
    let text = stdout_of(&["decode-id", &id.to_string()]);
    assert_eq!(
        text.trim(),
        format!("id={id} kind=NormalVertex partition=3 count=7")
    );

    let json: Value = serde_json::from_str(&stdout_of(&[
        "--format",
        "json",
        "decode-id",
        &id.to_string(),
        "--max-partitions",
        "8",
    ]))
    .expect("valid json");
    assert_eq!(json["kind"], "NormalVertex");
    assert_eq!(json["partition"], (227u64 & 7));
    assert_eq!(json["count"], 227u64 >> 3);
}

#[test]
fn decode_id_reports_schema_ids_without_partition() {
    // Property key suffix 0b000101 with count 2.
    let id = (2u64 << 6) | 0b000101;
    let text = stdout_of(&["decode-id", &id.to_string()]);
    assert_eq!(text.trim(), format!("id={id} kind=PropertyKey partition=- count=2"));

    let err = stderr_of_failure(&["decode-id", "0"]);
    assert!(err.contains("invalid id"), "{err}");
}

#[test]
fn custom_vertex_ids_map_both_ways() {
    let text = stdout_of(&["to-vertex-id", "5", "--max-partitions", "32"]);
    assert_eq!(text.trim(), (5u64 << 8).to_string());
    let text = stdout_of(&["from-vertex-id", &(5u64 << 8).to_string()]);
    assert_eq!(text.trim(), "5");

    let json: Value = serde_json::from_str(&stdout_of(&[
        "--format",
        "json",
        "to-vertex-id",
        "5",
        "--max-partitions",
        "4",
    ]))
    .expect("valid json");
    assert_eq!(json["input"], 5);
    assert_eq!(json["output"], 5u64 << 5);

    let err = stderr_of_failure(&["to-vertex-id", "0"]);
    assert!(err.contains("Vertex id must be positive"), "{err}");
    let err = stderr_of_failure(&["from-vertex-id", &((5u64 << 8) | 0b010).to_string()]);
    assert!(err.contains("Not a valid vertex id"), "{err}");
    let err = stderr_of_failure(&["to-vertex-id", "5", "--max-partitions", "12"]);
    assert!(err.contains("power of two"), "{err}");
}
