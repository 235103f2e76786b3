use std::fmt::Write as _;
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn winetrack() -> Command {
    let mut cmd = Command::cargo_bin("winetrack").unwrap();
    cmd.env_remove("MLFLOW_TRACKING_URI")
        .env_remove("MLFLOW_TRACKING_TOKEN")
        .env("RUST_LOG", "warn");
    cmd
}

fn write_csv(path: &Path) {
    let mut csv = String::from("alcohol,sulphates,quality\n");
    for i in 0..120 {
        let alcohol = 9.0 + (i % 12) as f64 * 0.25;
        let sulphates = 0.5 + (i % 5) as f64 * 0.1;
        let quality = if i % 12 < 6 { 5 } else { 6 };
        writeln!(csv, "{alcohol},{sulphates:.1},{quality}").unwrap();
    }
    std::fs::write(path, csv).unwrap();
}

#[test]
fn missing_data_path_is_rejected() {
    winetrack()
        .args(["--modelPath", "out"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--dataPath"));
}

#[test]
fn missing_model_path_is_rejected() {
    winetrack()
        .args(["--dataPath", "wine.csv"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--modelPath"));
}

#[test]
fn unsupported_tracking_uri_fails() {
    let tmp = TempDir::new().unwrap();
    winetrack()
        .args(["--trackingUri", "s3://bucket/mlruns", "--dataPath", "wine.csv", "--modelPath"])
        .arg(tmp.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unsupported URI"));
}

#[test]
fn trains_and_records_to_local_store() {
    let tmp = TempDir::new().unwrap();
    let data = tmp.path().join("wine.csv");
    write_csv(&data);
    let store = tmp.path().join("mlruns");
    let models = tmp.path().join("models");

    winetrack()
        .arg("--trackingUri")
        .arg(&store)
        .arg("--dataPath")
        .arg(&data)
        .arg("--modelPath")
        .arg(&models)
        .args(["--maxDepth", "2", "--runOrigin", "cli-test", "--experimentName", "wine"])
        .assert()
        .success()
        .stdout(predicate::str::contains("rmse").and(predicate::str::contains("mae")));

    let experiment = std::fs::read_to_string(store.join("1/experiment.yaml")).unwrap();
    assert!(experiment.contains("name: wine"));
    assert!(models.join("spark-model/metadata/part-00000").is_file());
    assert!(models.join("mleap-model/bundle.json").is_file());
}
