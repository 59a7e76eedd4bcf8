//! Competition-specific hooks plugged into the gateway loop.
//!
//! A competition decides where its data lives, which files make up a case,
//! how a case is presented to the inference server, and what a structurally
//! valid prediction looks like. The loop itself never changes.

use std::path::{Path, PathBuf};

use serde_json::Value;

use evalgate_common::{BatchPayload, Prediction, RowId};

use crate::batch_source::Case;
use crate::config::DataConfig;
use crate::error::{GatewayError, Result};
use crate::file_share::{FileShare, SharedManifest};

/// Resolved locations of the test set.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPaths {
    pub test_csv: PathBuf,
    pub case_root: PathBuf,
}

/// Hooks a competition provides to the gateway.
pub trait Competition: Send + Sync {
    /// Test index column holding the row identifier.
    fn row_id_column(&self) -> &str;

    /// Prediction fields written to the submission, in order.
    fn label_columns(&self) -> &[String] {
        &[]
    }

    /// Resolve the test index and case root.
    fn resolve_data_paths(&self, data: &DataConfig) -> DataPaths {
        let base = Path::new(&data.base_dir);
        DataPaths {
            test_csv: data
                .test_csv_path
                .as_ref()
                .map(PathBuf::from)
                .unwrap_or_else(|| base.join("test.csv")),
            case_root: data
                .case_dir
                .as_ref()
                .map(PathBuf::from)
                .unwrap_or_else(|| base.join("series")),
        }
    }

    /// Source files referenced by a case.
    fn source_files(&self, case: &Case) -> Result<Vec<PathBuf>>;

    /// Payload sent to the server, referring only to shared locations.
    fn sandbox_payload(
        &self,
        case: &Case,
        share: &FileShare,
        manifest: &SharedManifest,
    ) -> Result<BatchPayload>;

    /// Structural checks on a prediction. `Err` carries the reason.
    fn validate(
        &self,
        prediction: &Prediction,
        row_id: &RowId,
        payload: &BatchPayload,
    ) -> std::result::Result<(), String>;
}

/// One directory of same-extension files per case, e.g. the DICOM
/// instances of a series: `<root>/<SeriesInstanceUID>/<SOPInstanceUID>.dcm`.
pub struct SeriesCompetition {
    data: DataConfig,
}

impl SeriesCompetition {
    pub fn new(data: DataConfig) -> Self {
        Self { data }
    }
}

impl Competition for SeriesCompetition {
    fn row_id_column(&self) -> &str {
        &self.data.row_id_column
    }

    fn label_columns(&self) -> &[String] {
        &self.data.label_columns
    }

    fn source_files(&self, case: &Case) -> Result<Vec<PathBuf>> {
        let entries = std::fs::read_dir(&case.source_dir)
            .map_err(|e| GatewayError::missing_file(&case.source_dir, e))?;

        let mut files = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|e| GatewayError::missing_file(&case.source_dir, e))?
                .path();
            let matches_ext = path
                .extension()
                .map_or(false, |ext| ext.eq_ignore_ascii_case(&self.data.file_extension));
            if matches_ext && path.is_file() {
                files.push(path);
            }
        }

        if files.is_empty() {
            return Err(GatewayError::missing_file(
                &case.source_dir,
                format!("no .{} files for {}", self.data.file_extension, case.row_id),
            ));
        }

        files.sort();
        Ok(files)
    }

    fn sandbox_payload(
        &self,
        case: &Case,
        share: &FileShare,
        _manifest: &SharedManifest,
    ) -> Result<BatchPayload> {
        let shared_dir = share.shared_path(&case.source_dir)?;
        Ok(BatchPayload::from_path(&shared_dir))
    }

    fn validate(
        &self,
        prediction: &Prediction,
        _row_id: &RowId,
        _payload: &BatchPayload,
    ) -> std::result::Result<(), String> {
        if prediction.is_null() {
            return Err("prediction is null".to_string());
        }
        if self.data.label_columns.is_empty() {
            return Ok(());
        }

        let object = prediction
            .as_object()
            .ok_or_else(|| format!("expected an object with {} labels", self.data.label_columns.len()))?;
        for label in &self.data.label_columns {
            match object.get(label).and_then(Value::as_f64) {
                Some(p) if p.is_finite() && (0.0..=1.0).contains(&p) => {}
                Some(p) => return Err(format!("'{}' = {} is not a probability", label, p)),
                None => return Err(format!("missing numeric '{}'", label)),
            }
        }
        Ok(())
    }
}
