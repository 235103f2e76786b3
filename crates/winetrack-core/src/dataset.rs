//! Delimited-file loading and seeded row splits over Arrow record batches.

use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, BooleanArray, Float64Array};
use arrow::compute::{cast, filter_record_batch};
use arrow::csv::reader::Format;
use arrow::csv::ReaderBuilder;
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use crate::error::{Result, WinetrackError};

/// Load a delimited file with a header row, inferring column types from every record.
pub fn load_csv(path: &Path, delimiter: u8) -> Result<RecordBatch> {
    let mut file = File::open(path)?;

    let format = Format::default()
        .with_header(true)
        .with_delimiter(delimiter);
    let (schema, n_records) = format.infer_schema(&mut file, None)?;
    file.seek(SeekFrom::Start(0))?;

    let schema = Arc::new(schema);
    let reader = ReaderBuilder::new(schema.clone())
        .with_header(true)
        .with_delimiter(delimiter)
        .build(file)?;

    let mut batches = vec![];
    for batch in reader {
        batches.push(batch?);
    }
    let batch = arrow::compute::concat_batches(&schema, &batches)?;

    debug!(
        path = %path.display(),
        rows = batch.num_rows(),
        columns = batch.num_columns(),
        inferred_from = n_records,
        "Loaded dataset"
    );
    Ok(batch)
}

pub fn require_column(batch: &RecordBatch, name: &str) -> Result<()> {
    if batch.schema().index_of(name).is_err() {
        return Err(WinetrackError::ColumnNotFound(name.to_string()));
    }
    Ok(())
}

/// Cast a numeric column to `f64`. Nulls and non-numeric types are errors.
pub fn column_as_f64(batch: &RecordBatch, name: &str) -> Result<Vec<f64>> {
    let column = batch
        .column_by_name(name)
        .ok_or_else(|| WinetrackError::ColumnNotFound(name.to_string()))?;

    if !column.data_type().is_numeric() {
        return Err(WinetrackError::NonNumericColumn {
            column: name.to_string(),
            data_type: column.data_type().to_string(),
        });
    }

    let casted: ArrayRef = cast(column, &DataType::Float64)?;
    let values = casted
        .as_any()
        .downcast_ref::<Float64Array>()
        .ok_or_else(|| WinetrackError::Other(format!("Failed to cast '{name}' to Float64")))?;

    if let Some(row) = (0..values.len()).find(|&i| values.is_null(i)) {
        return Err(WinetrackError::NullValue {
            column: name.to_string(),
            row,
        });
    }
    Ok(values.values().to_vec())
}

/// Like [`column_as_f64`], but NaN and infinite values are errors too.
pub fn finite_column(batch: &RecordBatch, name: &str) -> Result<Vec<f64>> {
    let values = column_as_f64(batch, name)?;
    if let Some((row, value)) = values.iter().enumerate().find(|(_, v)| !v.is_finite()) {
        return Err(WinetrackError::NonFiniteValue {
            column: name.to_string(),
            row,
            value: *value,
        });
    }
    Ok(values)
}

/// Randomly split rows into one batch per weight.
///
/// Weights are normalised. Each row draws one uniform value from a ChaCha8
/// stream seeded with `seed` and lands in the bucket whose cumulative range
/// contains it, so the same input and seed always give the same split.
pub fn random_split(batch: &RecordBatch, weights: &[f64], seed: u64) -> Result<Vec<RecordBatch>> {
    if weights.is_empty() || weights.iter().any(|w| *w < 0.0 || !w.is_finite()) {
        return Err(WinetrackError::InvalidParam(format!(
            "Split weights must be non-negative and finite, got {weights:?}"
        )));
    }
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return Err(WinetrackError::InvalidParam(
            "Split weights must sum to a positive value".to_string(),
        ));
    }

    let mut bounds = Vec::with_capacity(weights.len());
    let mut acc = 0.0;
    for w in weights {
        acc += w / total;
        bounds.push(acc);
    }
    // Guard against rounding leaving the last bound just under 1.0.
    if let Some(last) = bounds.last_mut() {
        *last = 1.0;
    }

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let assignment: Vec<usize> = (0..batch.num_rows())
        .map(|_| {
            let u: f64 = rng.gen();
            bounds.iter().position(|b| u < *b).unwrap_or(bounds.len() - 1)
        })
        .collect();

    let mut parts = Vec::with_capacity(weights.len());
    for bucket in 0..weights.len() {
        let mask: BooleanArray = assignment.iter().map(|a| Some(*a == bucket)).collect();
        parts.push(filter_record_batch(batch, &mask)?);
    }
    debug!(
        sizes = ?parts.iter().map(RecordBatch::num_rows).collect::<Vec<_>>(),
        seed,
        "Split dataset"
    );
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow::datatypes::{Field, Schema};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn numbered_batch(n: i64) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("id", DataType::Int64, false)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from_iter_values(0..n))]).unwrap()
    }

    fn ids(batch: &RecordBatch) -> Vec<f64> {
        column_as_f64(batch, "id").unwrap()
    }

    #[test]
    fn split_is_reproducible_with_same_seed() {
        let batch = numbered_batch(200);
        let a = random_split(&batch, &[0.7, 0.3], 2019).unwrap();
        let b = random_split(&batch, &[0.7, 0.3], 2019).unwrap();
        assert_eq!(ids(&a[0]), ids(&b[0]));
        assert_eq!(ids(&a[1]), ids(&b[1]));
    }

    #[test]
    fn split_partitions_every_row_once() {
        let batch = numbered_batch(500);
        let parts = random_split(&batch, &[0.7, 0.3], 2019).unwrap();
        assert_eq!(parts[0].num_rows() + parts[1].num_rows(), 500);

        let mut all: Vec<f64> = ids(&parts[0]);
        all.extend(ids(&parts[1]));
        all.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(all, (0..500).map(|i| i as f64).collect::<Vec<_>>());

        // Roughly 70/30.
        let train = parts[0].num_rows() as f64 / 500.0;
        assert!((0.6..0.8).contains(&train), "train fraction {train}");
    }

    #[test]
    fn different_seed_changes_split() {
        let batch = numbered_batch(200);
        let a = random_split(&batch, &[0.7, 0.3], 1).unwrap();
        let b = random_split(&batch, &[0.7, 0.3], 2).unwrap();
        assert_ne!(ids(&a[1]), ids(&b[1]));
    }

    #[test]
    fn split_rejects_bad_weights() {
        let batch = numbered_batch(10);
        assert!(random_split(&batch, &[0.0, 0.0], 1).is_err());
        assert!(random_split(&batch, &[-1.0, 2.0], 1).is_err());
    }

    #[test]
    fn load_csv_infers_numeric_columns() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "\"fixed acidity\",alcohol,quality").unwrap();
        writeln!(file, "7.4,9.4,5").unwrap();
        writeln!(file, "7.8,9.8,6").unwrap();

        let batch = load_csv(file.path(), b',').unwrap();
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(column_as_f64(&batch, "fixed acidity").unwrap(), vec![7.4, 7.8]);
        assert_eq!(column_as_f64(&batch, "quality").unwrap(), vec![5.0, 6.0]);
        assert!(require_column(&batch, "quality").is_ok());
        assert!(matches!(
            require_column(&batch, "label"),
            Err(WinetrackError::ColumnNotFound(_))
        ));
    }

    #[test]
    fn load_csv_missing_file_is_io_error() {
        let err = load_csv(Path::new("/definitely/not/here.csv"), b',').unwrap_err();
        assert!(matches!(err, WinetrackError::Io(_)));
    }

    #[test]
    fn text_column_is_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "color,quality").unwrap();
        writeln!(file, "red,5").unwrap();

        let batch = load_csv(file.path(), b',').unwrap();
        assert!(matches!(
            column_as_f64(&batch, "color"),
            Err(WinetrackError::NonNumericColumn { .. })
        ));
    }

    #[test]
    fn nan_cells_are_not_finite() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "alcohol,quality").unwrap();
        writeln!(file, "9.4,5").unwrap();
        writeln!(file, "NaN,6").unwrap();

        let batch = load_csv(file.path(), b',').unwrap();
        assert_eq!(finite_column(&batch, "quality").unwrap(), vec![5.0, 6.0]);
        assert!(finite_column(&batch, "alcohol").is_err());

        let schema = Arc::new(Schema::new(vec![Field::new("x", DataType::Float64, false)]));
        let inf = RecordBatch::try_new(
            schema,
            vec![Arc::new(Float64Array::from(vec![1.0, f64::NEG_INFINITY]))],
        )
        .unwrap();
        assert!(matches!(
            finite_column(&inf, "x"),
            Err(WinetrackError::NonFiniteValue { row: 1, .. })
        ));
    }
}
