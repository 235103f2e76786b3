//! Integration tests for winetrack-core.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use winetrack_core::export::load_native;
use winetrack_core::{dataset, train, FileTrackingStore, RunStatus, TrackingClient, TrainOptions};

/// Semicolon-separated wine-like data where quality depends on alcohol and sulphates.
fn write_wine_csv(dir: &Path) -> PathBuf {
    let mut csv = String::from("\"fixed acidity\";\"alcohol\";\"sulphates\";\"quality\"\n");
    for i in 0..300 {
        let acidity = 6.0 + (i % 13) as f64 * 0.2;
        let alcohol = 9.0 + (i % 30) as f64 * 0.1;
        let sulphates = 0.4 + (i % 9) as f64 * 0.05;
        let quality = match (i % 30 >= 15, i % 9 >= 4) {
            (false, false) => 5,
            (false, true) | (true, false) => 6,
            (true, true) => 7,
        };
        writeln!(csv, "{acidity:.1};{alcohol:.1};{sulphates:.2};{quality}").unwrap();
    }
    let path = dir.join("winequality-red.csv");
    std::fs::write(&path, csv).unwrap();
    path
}

#[tokio::test]
async fn test_training_run_is_fully_recorded() {
    let tmp = TempDir::new().unwrap();
    let data = write_wine_csv(tmp.path());
    let store = FileTrackingStore::new(tmp.path().join("mlruns")).unwrap();

    let experiment_id = store.create_or_get_experiment("scala_classic").await.unwrap();
    let opts = TrainOptions::new(&data, tmp.path().join("model"))
        .with_delimiter(b';')
        .with_max_depth(3)
        .with_run_origin("integration");
    let summary = train(&store, &experiment_id, &opts).await.unwrap();

    let run = store.get_run(&summary.run_id).await.unwrap();
    assert_eq!(run.info.status, RunStatus::Finished);
    assert!(run.info.end_time.is_some());

    let tag = |key: &str| {
        run.data
            .tags
            .iter()
            .find(|t| t.key == key)
            .map(|t| t.value.clone())
    };
    assert_eq!(tag("dataPath"), Some(data.display().to_string()));
    assert_eq!(tag("clientVersion"), Some(winetrack_core::VERSION.to_string()));
    assert_eq!(tag("mlflow.source.name"), Some("winetrack".to_string()));

    let params: Vec<(&str, &str)> = run
        .data
        .params
        .iter()
        .map(|p| (p.key.as_str(), p.value.as_str()))
        .collect();
    assert_eq!(
        params,
        vec![("maxBins", "32"), ("maxDepth", "3"), ("runOrigin", "integration")]
    );

    let metric_keys: Vec<&str> = run.data.metrics.iter().map(|m| m.key.as_str()).collect();
    assert_eq!(metric_keys, vec!["rmse", "r2", "mae"]);
    assert!(summary.metric("rmse").unwrap() < 0.1);
    assert!(summary.metric("r2").unwrap() > 0.9);

    let artifacts: Vec<String> = store
        .list_artifacts(&summary.run_id)
        .unwrap()
        .into_iter()
        .map(|a| a.path)
        .collect();
    assert!(artifacts.contains(&"details/treeModel.txt".to_string()));
    assert!(artifacts.contains(&"spark-model/metadata/part-00000".to_string()));
    assert!(artifacts.contains(&"mleap-model/mleap/model/bundle.json".to_string()));
    assert!(artifacts
        .iter()
        .any(|p| p.starts_with("spark-model/stages/1_dtr_") && p.ends_with("data/part-00000.parquet")));
}

#[tokio::test]
async fn test_exported_model_reproduces_predictions() {
    let tmp = TempDir::new().unwrap();
    let data = write_wine_csv(tmp.path());
    let store = FileTrackingStore::new(tmp.path().join("mlruns")).unwrap();
    let experiment_id = store.create_or_get_experiment("wine").await.unwrap();

    let opts = TrainOptions::new(&data, tmp.path().join("model")).with_delimiter(b';');
    let summary = train(&store, &experiment_id, &opts).await.unwrap();

    let model = load_native(&tmp.path().join("model/spark-model")).unwrap();
    assert_eq!(model.tree.depth(), summary.depth);
    assert_eq!(model.tree.num_nodes(), summary.num_nodes);

    let batch = dataset::load_csv(&data, b';').unwrap();
    let out = model.transform(&batch).unwrap();
    let labels = dataset::column_as_f64(&out, "quality").unwrap();
    let preds = dataset::column_as_f64(&out, "prediction").unwrap();
    let wrong = labels.iter().zip(&preds).filter(|(y, p)| (*y - *p).abs() > 0.5).count();
    assert!(wrong < 10, "{wrong} rows mispredicted");

    let details = std::fs::read_to_string(
        store
            .root()
            .join(&experiment_id)
            .join(&summary.run_id)
            .join("artifacts/details/treeModel.txt"),
    )
    .unwrap();
    assert!(details.starts_with(&format!("DecisionTreeRegressionModel: uid={}", model.tree.uid)));
}

#[tokio::test]
async fn test_missing_data_file_creates_no_run() {
    let tmp = TempDir::new().unwrap();
    let store = FileTrackingStore::new(tmp.path().join("mlruns")).unwrap();
    let experiment_id = store.create_or_get_experiment("wine").await.unwrap();

    let opts = TrainOptions::new(tmp.path().join("absent.csv"), tmp.path().join("model"));
    assert!(train(&store, &experiment_id, &opts).await.is_err());
    assert!(store.list_runs(&experiment_id).unwrap().is_empty());
}

#[tokio::test]
async fn test_same_seed_gives_same_split() {
    let tmp = TempDir::new().unwrap();
    let data = write_wine_csv(tmp.path());
    let store = FileTrackingStore::new(tmp.path().join("mlruns")).unwrap();
    let experiment_id = store.create_or_get_experiment("wine").await.unwrap();

    let opts = TrainOptions::new(&data, tmp.path().join("model")).with_delimiter(b';');
    let first = train(&store, &experiment_id, &opts).await.unwrap();
    let second = train(&store, &experiment_id, &opts).await.unwrap();

    assert_ne!(first.run_id, second.run_id);
    assert_eq!(first.train_rows, second.train_rows);
    assert_eq!(first.metrics, second.metrics);
    assert_eq!(store.list_runs(&experiment_id).unwrap().len(), 2);
}
