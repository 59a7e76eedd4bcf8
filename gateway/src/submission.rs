//! Submission accumulation, sealing and persistence.

use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::io::Write;
use std::path::Path;

use serde_json::Value;

use evalgate_common::{Prediction, PredictionRecord, RowId};

use crate::error::{GatewayError, Result};

/// Column used for the raw prediction when no label columns are configured.
pub const PREDICTION_COLUMN: &str = "prediction";

/// Arrival-ordered prediction records of a run in progress.
///
/// Rejects a second record for the same row identifier. Sealing consumes the
/// accumulator, so nothing can be appended to a finalized submission.
#[derive(Debug, Default)]
pub struct Submission {
    records: Vec<PredictionRecord>,
    seen: HashSet<RowId>,
}

impl Submission {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Vec::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, row_id: RowId, prediction: Prediction) -> Result<()> {
        if !self.seen.insert(row_id.clone()) {
            return Err(GatewayError::SubmissionIntegrity(format!(
                "duplicate prediction for {}",
                row_id
            )));
        }
        self.records.push(PredictionRecord { row_id, prediction });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Finalize the submission if its row identifiers equal `expected` exactly.
    pub fn seal(self, expected: &BTreeSet<RowId>) -> Result<SealedSubmission> {
        let missing: Vec<&RowId> = expected.iter().filter(|id| !self.seen.contains(*id)).collect();
        let unexpected: Vec<&RowId> = self
            .records
            .iter()
            .map(|r| &r.row_id)
            .filter(|id| !expected.contains(*id))
            .collect();

        if !missing.is_empty() || !unexpected.is_empty() {
            return Err(GatewayError::SubmissionIntegrity(format!(
                "{} predictions for {} test cases: missing [{}], unexpected [{}]",
                self.records.len(),
                expected.len(),
                preview(&missing),
                preview(&unexpected)
            )));
        }

        Ok(SealedSubmission {
            records: self.records,
        })
    }
}

fn preview(ids: &[&RowId]) -> String {
    const SHOWN: usize = 5;
    let mut out: Vec<String> = ids.iter().take(SHOWN).map(|id| id.to_string()).collect();
    if ids.len() > SHOWN {
        out.push(format!("... {} more", ids.len() - SHOWN));
    }
    out.join(", ")
}

/// Read-only, finalized submission.
#[derive(Debug)]
pub struct SealedSubmission {
    records: Vec<PredictionRecord>,
}

impl SealedSubmission {
    pub fn records(&self) -> &[PredictionRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Write the submission as CSV.
    ///
    /// With label columns, each label is read from the prediction object.
    /// Without, the prediction is written as JSON in a single column.
    pub fn write_csv_to<W: Write>(
        &self,
        writer: W,
        row_id_column: &str,
        label_columns: &[String],
    ) -> Result<()> {
        let mut csv_writer = csv::Writer::from_writer(writer);

        let mut header = vec![row_id_column.to_string()];
        if label_columns.is_empty() {
            header.push(PREDICTION_COLUMN.to_string());
        } else {
            header.extend(label_columns.iter().cloned());
        }
        csv_writer
            .write_record(&header)
            .map_err(std::io::Error::from)?;

        for record in &self.records {
            let mut row = vec![record.row_id.to_string()];
            if label_columns.is_empty() {
                row.push(cell(&record.prediction));
            } else {
                row.extend(
                    label_columns
                        .iter()
                        .map(|label| record.prediction.get(label).map(cell).unwrap_or_default()),
                );
            }
            csv_writer
                .write_record(&row)
                .map_err(std::io::Error::from)?;
        }

        csv_writer.flush()?;
        Ok(())
    }

    /// Write the submission to `path`, replacing it atomically.
    pub fn write_csv(&self, path: &Path, row_id_column: &str, label_columns: &[String]) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("csv.partial");
        let written = fs::File::create(&tmp_path)
            .map_err(GatewayError::from)
            .and_then(|file| {
                self.write_csv_to(std::io::BufWriter::new(file), row_id_column, label_columns)
            })
            .and_then(|()| fs::rename(&tmp_path, path).map_err(GatewayError::from));

        if written.is_err() {
            if let Err(e) = fs::remove_file(&tmp_path) {
                tracing::debug!("Could not remove {}: {}", tmp_path.display(), e);
            }
        }
        written
    }
}

fn cell(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn expected(ids: &[&str]) -> BTreeSet<RowId> {
        ids.iter().map(|id| RowId::new(*id)).collect()
    }

    #[test]
    fn test_duplicate_row_id_rejected() {
        let mut submission = Submission::new();
        submission.push(RowId::new("a"), json!(1)).unwrap();
        let err = submission.push(RowId::new("a"), json!(2)).unwrap_err();
        assert!(matches!(err, GatewayError::SubmissionIntegrity(_)));
        assert_eq!(submission.len(), 1);
    }

    #[test]
    fn test_seal_requires_exact_row_set() {
        let mut submission = Submission::new();
        submission.push(RowId::new("a"), json!(1)).unwrap();
        submission.push(RowId::new("z"), json!(1)).unwrap();

        let err = submission.seal(&expected(&["a", "b"])).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("missing [b]"), "{}", msg);
        assert!(msg.contains("unexpected [z]"), "{}", msg);
    }

    #[test]
    fn test_seal_keeps_arrival_order() {
        let mut submission = Submission::new();
        for id in ["c", "a", "b"] {
            submission.push(RowId::new(id), json!(id)).unwrap();
        }
        let sealed = submission.seal(&expected(&["a", "b", "c"])).unwrap();
        let order: Vec<&str> = sealed.records().iter().map(|r| r.row_id.as_str()).collect();
        assert_eq!(order, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_empty_submission_seals_against_empty_index() {
        let sealed = Submission::new().seal(&BTreeSet::new()).unwrap();
        assert!(sealed.is_empty());
    }

    #[test]
    fn test_csv_with_label_columns() {
        let mut submission = Submission::new();
        submission
            .push(RowId::new("s1"), json!({"Basilar Tip": 0.25, "Aneurysm Present": 0.5}))
            .unwrap();
        let sealed = submission.seal(&expected(&["s1"])).unwrap();

        let mut out = Vec::new();
        let labels = vec!["Basilar Tip".to_string(), "Aneurysm Present".to_string()];
        sealed
            .write_csv_to(&mut out, "SeriesInstanceUID", &labels)
            .unwrap();

        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "SeriesInstanceUID,Basilar Tip,Aneurysm Present\ns1,0.25,0.5\n"
        );
    }

    #[test]
    fn test_csv_without_labels_writes_json() {
        let mut submission = Submission::new();
        submission.push(RowId::new("s1"), json!([1, 2])).unwrap();
        let sealed = submission.seal(&expected(&["s1"])).unwrap();

        let mut out = Vec::new();
        sealed.write_csv_to(&mut out, "id", &[]).unwrap();

        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "id,prediction\ns1,\"[1,2]\"\n");
    }

    #[test]
    fn test_write_csv_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/submission.csv");
        let sealed = Submission::new().seal(&BTreeSet::new()).unwrap();

        sealed.write_csv(&path, "id", &[]).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "id,prediction\n");
        assert!(!path.with_extension("csv.partial").exists());
    }

    #[test]
    fn test_failed_write_leaves_no_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        // A non-empty directory at the target path makes the final rename fail.
        let path = dir.path().join("submission.csv");
        fs::create_dir_all(path.join("occupied")).unwrap();
        let sealed = Submission::new().seal(&BTreeSet::new()).unwrap();

        let err = sealed.write_csv(&path, "id", &[]).unwrap_err();

        assert!(matches!(err, GatewayError::Io(_)), "{:?}", err);
        assert!(!path.with_extension("csv.partial").exists());
        assert!(path.is_dir());
    }
}
