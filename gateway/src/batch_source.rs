//! Test index loading and shuffled case generation.
//!
//! The test index is a CSV with one row per sub-unit (e.g. one image) and a
//! column naming the case's row identifier. Rows sharing an identifier are
//! grouped into a single case. Cases are emitted in a uniformly shuffled order
//! so competitors cannot exploit positional leakage or tune for a fixed order.

use std::collections::{BTreeSet, HashSet};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use evalgate_common::{BatchPayload, RowId};

use crate::error::{GatewayError, Result};

/// Unique row identifiers of the held-out test set.
#[derive(Debug, Clone, Default)]
pub struct TestIndex {
    /// Unique ids in first-seen order.
    row_ids: Vec<RowId>,
    /// Number of data rows read, including duplicates.
    rows: usize,
}

impl TestIndex {
    /// Read the index from a CSV file.
    pub fn load(path: &Path, row_id_column: &str) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| {
            GatewayError::TestIndex(format!("cannot open {}: {}", path.display(), e))
        })?;
        Self::from_reader(file, row_id_column)
    }

    /// Read the index from any CSV source with a header row.
    pub fn from_reader<R: Read>(reader: R, row_id_column: &str) -> Result<Self> {
        let mut csv_reader = csv::Reader::from_reader(reader);
        let column = csv_reader
            .headers()?
            .iter()
            .position(|h| h.trim() == row_id_column)
            .ok_or_else(|| {
                GatewayError::TestIndex(format!("column '{}' not found", row_id_column))
            })?;

        let mut seen = HashSet::new();
        let mut row_ids = Vec::new();
        let mut rows = 0;

        for (line, record) in csv_reader.records().enumerate() {
            let record = record?;
            rows += 1;
            let id = record.get(column).map(str::trim).unwrap_or_default();
            if id.is_empty() {
                // +2: header line and 1-based numbering
                return Err(GatewayError::TestIndex(format!(
                    "empty {} on line {}",
                    row_id_column,
                    line + 2
                )));
            }
            if seen.insert(id.to_string()) {
                row_ids.push(RowId::new(id));
            }
        }

        Ok(Self { row_ids, rows })
    }

    /// Build an index directly from identifiers (duplicates are grouped).
    pub fn from_row_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<RowId>,
    {
        let mut seen = HashSet::new();
        let mut row_ids = Vec::new();
        let mut rows = 0;
        for id in ids {
            let id = id.into();
            rows += 1;
            if seen.insert(id.clone()) {
                row_ids.push(id);
            }
        }
        Self { row_ids, rows }
    }

    pub fn row_ids(&self) -> &[RowId] {
        &self.row_ids
    }

    /// The set every finalized submission must match exactly.
    pub fn unique_row_ids(&self) -> BTreeSet<RowId> {
        self.row_ids.iter().cloned().collect()
    }

    /// Number of unique cases.
    pub fn len(&self) -> usize {
        self.row_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.row_ids.is_empty()
    }

    /// Number of index rows, before grouping.
    pub fn rows(&self) -> usize {
        self.rows
    }
}

/// One evaluation unit as produced by [`BatchSource`].
#[derive(Debug, Clone, PartialEq)]
pub struct Case {
    pub row_id: RowId,
    /// Payload referencing the original dataset location.
    pub payload: BatchPayload,
    /// Directory holding this case's files.
    pub source_dir: PathBuf,
}

/// Shuffled, single-pass sequence of cases.
#[derive(Debug)]
pub struct BatchSource {
    order: Vec<RowId>,
    case_root: PathBuf,
}

impl BatchSource {
    /// Shuffle the index's cases with the given randomness source.
    pub fn new<R: Rng + ?Sized>(index: &TestIndex, case_root: impl Into<PathBuf>, rng: &mut R) -> Self {
        let mut order = index.row_ids().to_vec();
        order.shuffle(rng);
        Self {
            order,
            case_root: case_root.into(),
        }
    }

    /// Shuffle with a `StdRng` seeded from `seed`.
    pub fn seeded(index: &TestIndex, case_root: impl Into<PathBuf>, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        Self::new(index, case_root, &mut rng)
    }

    /// Number of cases still to be produced.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Consume the source, yielding every case exactly once.
    pub fn produce(self) -> impl Iterator<Item = Case> {
        let case_root = self.case_root;
        self.order.into_iter().map(move |row_id| {
            let source_dir = case_root.join(row_id.as_str());
            Case {
                payload: BatchPayload::from_path(&source_dir),
                row_id,
                source_dir,
            }
        })
    }
}

/// Fresh per-run seed derived from the wall clock.
pub fn clock_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}
