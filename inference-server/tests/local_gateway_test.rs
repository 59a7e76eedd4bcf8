//! Full evaluation run through the local gateway mode.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use evalgate_common::{BatchPayload, Prediction};
use evalgate_gateway::GatewayError;
use evalgate_server::{run_local_gateway, Config, Error, Predictor};

/// Scores a case by how many files it could see in the shared directory.
struct FileCounter;

#[async_trait]
impl Predictor for FileCounter {
    fn name(&self) -> &str {
        "file-counter"
    }

    async fn predict(
        &self,
        args: &BatchPayload,
        _cancel: CancellationToken,
    ) -> evalgate_server::Result<Prediction> {
        let dir = args
            .args()
            .first()
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Predictor("no directory in payload".to_string()))?;
        let count = fs::read_dir(dir)?.count();
        Ok(json!({ "Aneurysm Present": 1.0 / (count as f64 + 1.0) }))
    }
}

fn write_dataset(root: &Path, series: &[(&str, usize)]) {
    let mut csv = String::from("SeriesInstanceUID,SOPInstanceUID\n");
    for (id, files) in series {
        let dir = root.join("series").join(id);
        fs::create_dir_all(&dir).unwrap();
        for i in 0..*files {
            fs::write(dir.join(format!("{}.dcm", i)), b"pixels").unwrap();
            csv.push_str(&format!("{},{}\n", id, i));
        }
    }
    fs::write(root.join("test.csv"), csv).unwrap();
}

fn gateway_config(root: &Path) -> evalgate_gateway::Config {
    let mut config = evalgate_gateway::Config::default();
    config.data.base_dir = root.to_string_lossy().into_owned();
    config.data.label_columns = vec!["Aneurysm Present".to_string()];
    config.share.root = root.join("shared").to_string_lossy().into_owned();
    config.run.submission_path = root.join("submission.csv").to_string_lossy().into_owned();
    config.run.seed = Some(42);
    config.server.connect_timeout_secs = 5;
    config
}

#[tokio::test]
async fn test_local_run_writes_submission() {
    let tmp = tempfile::tempdir().unwrap();
    write_dataset(tmp.path(), &[("1.2.1", 3), ("1.2.2", 1), ("1.2.3", 2)]);

    let report = run_local_gateway(Config::default(), gateway_config(tmp.path()), Arc::new(FileCounter))
        .await
        .unwrap();

    assert_eq!(report.cases, 3);
    assert_eq!(report.seed, 42);

    let mut reader = csv::Reader::from_path(tmp.path().join("submission.csv")).unwrap();
    let headers = reader.headers().unwrap().clone();
    assert_eq!(headers.iter().collect::<Vec<_>>(), vec!["SeriesInstanceUID", "Aneurysm Present"]);

    let mut rows: Vec<(String, f64)> = reader
        .records()
        .map(|r| {
            let r = r.unwrap();
            (r[0].to_string(), r[1].parse().unwrap())
        })
        .collect();
    rows.sort_by(|a, b| a.0.cmp(&b.0));
    // Each case saw exactly its own files.
    assert_eq!(
        rows,
        vec![
            ("1.2.1".to_string(), 0.25),
            ("1.2.2".to_string(), 0.5),
            ("1.2.3".to_string(), 1.0 / 3.0),
        ]
    );

    let shared = tmp.path().join("shared");
    assert!(!shared.exists() || fs::read_dir(&shared).unwrap().next().is_none());
}

#[tokio::test]
async fn test_local_run_surfaces_predictor_failure() {
    struct Broken;

    #[async_trait]
    impl Predictor for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn predict(
            &self,
            _args: &BatchPayload,
            _cancel: CancellationToken,
        ) -> evalgate_server::Result<Prediction> {
            Err(Error::Predictor("out of memory".to_string()))
        }
    }

    let tmp = tempfile::tempdir().unwrap();
    write_dataset(tmp.path(), &[("1.2.1", 1)]);

    let err = run_local_gateway(Config::default(), gateway_config(tmp.path()), Arc::new(Broken))
        .await
        .unwrap_err();

    match err {
        Error::Gateway(GatewayError::Application { row_id, message }) => {
            assert_eq!(row_id.as_str(), "1.2.1");
            assert!(message.contains("out of memory"), "{}", message);
        }
        other => panic!("expected application error, got {:?}", other),
    }
    assert!(!tmp.path().join("submission.csv").exists());
}
