//! winetrack CLI: train a regression tree on a CSV and record the run.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use comfy_table::{presets::UTF8_FULL, Table};
use tracing::info;
use tracing_subscriber::EnvFilter;

use winetrack_core::{connect, train, TrainOptions};

#[derive(Parser, Debug)]
#[command(
    name = "winetrack",
    about = "🍷 winetrack: decision-tree training with run tracking",
    version,
    author
)]
struct Cli {
    /// Tracking server URL, `file:` URI or local directory [default: ./mlruns]
    #[arg(long = "trackingUri", env = "MLFLOW_TRACKING_URI")]
    tracking_uri: Option<String>,

    /// Bearer token for the tracking server
    #[arg(long, env = "MLFLOW_TRACKING_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Delimited data file with a header row
    #[arg(long = "dataPath")]
    data_path: PathBuf,

    /// Directory the exported models are written to
    #[arg(long = "modelPath")]
    model_path: PathBuf,

    #[arg(long = "maxDepth", default_value_t = 5)]
    max_depth: usize,

    #[arg(long = "maxBins", default_value_t = 32)]
    max_bins: usize,

    /// Free-text label recorded with the run
    #[arg(long = "runOrigin", default_value = "None")]
    run_origin: String,

    #[arg(long = "experimentName", default_value = "scala_classic")]
    experiment_name: String,

    /// Column to predict; every other column is a feature
    #[arg(long = "labelColumn", default_value = "quality")]
    label_column: String,

    /// Field separator of the data file (a single character, or `tab`)
    #[arg(long, default_value = ",", value_parser = parse_delimiter)]
    delimiter: u8,
}

fn parse_delimiter(s: &str) -> std::result::Result<u8, String> {
    match s {
        "tab" | "\\t" | "\t" => Ok(b'\t'),
        _ if s.len() == 1 && s.is_ascii() => Ok(s.as_bytes()[0]),
        _ => Err(format!("expected a single ASCII character, got '{s}'")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    info!(
        tracking_uri = cli.tracking_uri.as_deref().unwrap_or("./mlruns"),
        experiment = %cli.experiment_name,
        data = %cli.data_path.display(),
        model = %cli.model_path.display(),
        "Options"
    );

    let client = connect(cli.tracking_uri.as_deref(), cli.token.as_deref())
        .context("Failed to set up tracking backend")?;
    let experiment_id = client
        .create_or_get_experiment(&cli.experiment_name)
        .await
        .with_context(|| format!("Failed to resolve experiment '{}'", cli.experiment_name))?;
    info!(experiment_id = %experiment_id, "Using experiment");

    let opts = TrainOptions::new(&cli.data_path, &cli.model_path)
        .with_max_depth(cli.max_depth)
        .with_max_bins(cli.max_bins)
        .with_run_origin(&cli.run_origin)
        .with_label_col(&cli.label_column)
        .with_delimiter(cli.delimiter)
        .with_source_name(env!("CARGO_BIN_NAME"));
    let summary = train(client.as_ref(), &experiment_id, &opts)
        .await
        .context("Training run failed")?;

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(["Metric", "Value"]);
    for (name, value) in &summary.metrics {
        table.add_row([name.as_str(), &format!("{value:.6}")]);
    }
    table.add_row(["depth", &summary.depth.to_string()]);
    table.add_row(["numNodes", &summary.num_nodes.to_string()]);
    table.add_row(["train/test rows", &format!("{}/{}", summary.train_rows, summary.test_rows)]);

    println!("Run {} (experiment {experiment_id})", summary.run_id);
    println!("{table}");
    Ok(())
}
