//! Storage layer: YAML metadata, Parquet tables, artifact file copies.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{Array, Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::arrow_writer::ArrowWriter;
use parquet::file::properties::WriterProperties;

use crate::error::{Result, WinetrackError};
use crate::models::Metric;

// ─── Directory helpers ────────────────────────────────────────────────────────

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Names of the immediate subdirectories of `dir`, sorted.
pub fn list_subdirs(dir: &Path) -> Result<Vec<String>> {
    if !dir.exists() {
        return Ok(vec![]);
    }
    let mut names = vec![];
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

/// Remove `dir` if it exists and recreate it empty.
pub fn reset_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir)?;
    }
    fs::create_dir_all(dir)?;
    Ok(())
}

// ─── Artifact copies ─────────────────────────────────────────────────────────

/// Copy a single file into `dest_dir`, keeping its file name.
pub fn copy_file_into(src: &Path, dest_dir: &Path) -> Result<PathBuf> {
    let name = src
        .file_name()
        .ok_or_else(|| WinetrackError::Other(format!("Not a file path: {}", src.display())))?;
    ensure_dir(dest_dir)?;
    let dest = dest_dir.join(name);
    fs::copy(src, &dest)?;
    Ok(dest)
}

/// Recursively copy the contents of `src_dir` (not the directory itself) into `dest_dir`.
pub fn copy_dir_contents(src_dir: &Path, dest_dir: &Path) -> Result<usize> {
    if !src_dir.is_dir() {
        return Err(WinetrackError::Other(format!(
            "Not a directory: {}",
            src_dir.display()
        )));
    }
    ensure_dir(dest_dir)?;
    let mut copied = 0;
    for entry in fs::read_dir(src_dir)? {
        let entry = entry?;
        let path = entry.path();
        let dest = dest_dir.join(entry.file_name());
        if path.is_dir() {
            copied += copy_dir_contents(&path, &dest)?;
        } else {
            fs::copy(&path, &dest)?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ArtifactInfo {
    /// Path relative to the artifact root, always `/`-separated.
    pub path: String,
    pub size: u64,
}

/// All files under `root`, with `/`-separated relative paths, sorted.
pub fn list_files(root: &Path) -> Result<Vec<ArtifactInfo>> {
    let mut files = vec![];
    if root.exists() {
        collect_files(root, root, &mut files)?;
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<ArtifactInfo>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out)?;
        } else {
            let rel = path.strip_prefix(root).unwrap_or(&path);
            let rel = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            out.push(ArtifactInfo {
                path: rel,
                size: path.metadata()?.len(),
            });
        }
    }
    Ok(())
}

// ─── YAML / JSON I/O ─────────────────────────────────────────────────────────

pub fn save_yaml<T: serde::Serialize>(path: &Path, data: &T) -> Result<()> {
    let content = serde_yaml::to_string(data)?;
    fs::write(path, content)?;
    Ok(())
}

pub fn load_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T>
where
    T: Default,
{
    if !path.exists() {
        return Ok(T::default());
    }
    let content = fs::read_to_string(path)?;
    let val = serde_yaml::from_str(&content)?;
    Ok(val)
}

/// Like [`load_yaml`] but the file must exist.
pub fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&content)?)
}

pub fn save_json<T: serde::Serialize>(path: &Path, data: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    fs::write(path, serde_json::to_string(data)?)?;
    Ok(())
}

pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

// ─── Parquet I/O ─────────────────────────────────────────────────────────────

pub fn read_parquet(path: &Path) -> Result<Option<RecordBatch>> {
    let file = fs::File::open(path)?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
    let schema = builder.schema().clone();
    let reader = builder.build()?;
    let mut batches = vec![];
    for batch in reader {
        batches.push(batch?);
    }
    match batches.len() {
        0 => Ok(None),
        1 => Ok(batches.pop()),
        _ => Ok(Some(arrow::compute::concat_batches(&schema, &batches)?)),
    }
}

pub fn write_parquet(path: &Path, batch: &RecordBatch) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let file = fs::File::create(path)?;
    let props = WriterProperties::builder()
        .set_compression(parquet::basic::Compression::SNAPPY)
        .build();
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
    writer.write(batch)?;
    writer.close()?;
    Ok(())
}

/// Downcast a column by name, failing with a typed error instead of panicking.
pub(crate) fn typed_column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .ok_or_else(|| WinetrackError::ColumnNotFound(name.to_string()))?
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| WinetrackError::Other(format!("Unexpected type for column '{name}'")))
}

// ─── Metric history ──────────────────────────────────────────────────────────

fn metrics_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("key", DataType::Utf8, false),
        Field::new("value", DataType::Float64, false),
        Field::new("timestamp", DataType::Int64, false),
        Field::new("step", DataType::Int64, false),
    ]))
}

/// Append metric points to a Parquet file.
/// Strategy: read existing → concat → write back. Runs log a handful of
/// points, so rewriting the file is cheap.
pub fn append_metrics(path: &Path, metrics: &[Metric]) -> Result<()> {
    if metrics.is_empty() {
        return Ok(());
    }
    let schema = metrics_schema();
    let new_batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(StringArray::from_iter_values(metrics.iter().map(|m| m.key.as_str()))),
            Arc::new(Float64Array::from_iter_values(metrics.iter().map(|m| m.value))),
            Arc::new(Int64Array::from_iter_values(metrics.iter().map(|m| m.timestamp))),
            Arc::new(Int64Array::from_iter_values(metrics.iter().map(|m| m.step))),
        ],
    )?;

    let final_batch = match path.exists().then(|| read_parquet(path)).transpose()?.flatten() {
        Some(existing) => arrow::compute::concat_batches(&schema, &[existing, new_batch])?,
        None => new_batch,
    };
    write_parquet(path, &final_batch)
}

/// Read every logged metric point, in logging order.
pub fn read_metrics(path: &Path) -> Result<Vec<Metric>> {
    if !path.exists() {
        return Ok(vec![]);
    }
    let Some(batch) = read_parquet(path)? else {
        return Ok(vec![]);
    };
    let keys = typed_column::<StringArray>(&batch, "key")?;
    let values = typed_column::<Float64Array>(&batch, "value")?;
    let timestamps = typed_column::<Int64Array>(&batch, "timestamp")?;
    let steps = typed_column::<Int64Array>(&batch, "step")?;

    Ok((0..batch.num_rows())
        .filter(|&i| !keys.is_null(i))
        .map(|i| Metric {
            key: keys.value(i).to_string(),
            value: values.value(i),
            timestamp: timestamps.value(i),
            step: steps.value(i),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn metrics_append_preserves_order() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("metrics.parquet");
        let point = |key: &str, value: f64| Metric {
            key: key.to_string(),
            value,
            timestamp: 1,
            step: 0,
        };

        append_metrics(&path, &[point("rmse", 0.7)]).unwrap();
        append_metrics(&path, &[point("r2", 0.3), point("mae", 0.5)]).unwrap();

        let keys: Vec<String> = read_metrics(&path).unwrap().into_iter().map(|m| m.key).collect();
        assert_eq!(keys, vec!["rmse", "r2", "mae"]);
    }

    #[test]
    fn copy_dir_contents_is_recursive() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("stages/0")).unwrap();
        fs::write(src.join("top.json"), "{}").unwrap();
        fs::write(src.join("stages/0/part-00000"), "x").unwrap();

        let dest = tmp.path().join("dest/model");
        assert_eq!(copy_dir_contents(&src, &dest).unwrap(), 2);

        let paths: Vec<String> = list_files(&dest).unwrap().into_iter().map(|a| a.path).collect();
        assert_eq!(paths, vec!["stages/0/part-00000", "top.json"]);
    }
}
