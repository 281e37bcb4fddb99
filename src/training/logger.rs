//! Epoch-level statistics logging.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use crate::Result;

/// Named statistics of one stage or of the epoch meta.
pub type Stats = BTreeMap<String, serde_json::Value>;

/// Receives end-of-stage statistics.
pub trait TrainLogger: Send {
    fn log_stats(
        &mut self,
        meta: &Stats,
        train: Option<&Stats>,
        valid: Option<&Stats>,
        test: Option<&Stats>,
    ) -> Result<()>;
}

/// Appends one line per call to a text file and mirrors it to `tracing`.
///
/// ```text
/// epoch: 2, lr: 5.00e-4, optimizer: AdamW, steps: 1200 - train loss: 3.21e2 - valid acc: 4.12e-1, valid loss: 2.98e2
/// ```
#[derive(Debug, Clone)]
pub struct FileTrainLogger {
    path: PathBuf,
}

impl FileTrainLogger {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }

    pub fn format_line(
        meta: &Stats,
        train: Option<&Stats>,
        valid: Option<&Stats>,
        test: Option<&Stats>,
    ) -> String {
        let mut parts = vec![format_stats(meta, None)];
        for (prefix, stats) in [("train", train), ("valid", valid), ("test", test)] {
            if let Some(stats) = stats {
                parts.push(format_stats(stats, Some(prefix)));
            }
        }
        parts.join(" - ")
    }
}

fn format_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Number(n) if n.is_f64() => {
            let v = n.as_f64().unwrap_or(f64::NAN);
            if (1.0..100.0).contains(&v) {
                format!("{v:.2}")
            } else {
                format!("{v:.2e}")
            }
        }
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn format_stats(stats: &Stats, prefix: Option<&str>) -> String {
    stats
        .iter()
        .map(|(key, value)| match prefix {
            Some(prefix) => format!("{prefix} {key}: {}", format_value(value)),
            None => format!("{key}: {}", format_value(value)),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

impl TrainLogger for FileTrainLogger {
    fn log_stats(
        &mut self,
        meta: &Stats,
        train: Option<&Stats>,
        valid: Option<&Stats>,
        test: Option<&Stats>,
    ) -> Result<()> {
        let line = Self::format_line(meta, train, valid, test);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        tracing::info!("{line}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(entries: &[(&str, serde_json::Value)]) -> Stats {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn line_format() {
        let meta = stats(&[("epoch", 3.into()), ("lr", 5e-4.into())]);
        let valid = stats(&[("loss", 12.5.into()), ("acc", 0.41.into())]);
        let line = FileTrainLogger::format_line(&meta, None, Some(&valid), None);
        assert_eq!(line, "epoch: 3, lr: 5.00e-4 - valid acc: 4.10e-1, valid loss: 12.50");
    }

    #[test]
    fn appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/train_log.txt");
        let mut logger = FileTrainLogger::new(&path).unwrap();
        let meta = stats(&[("Evaluation stage", "TEST".into())]);
        let test = stats(&[("loss", 2.0.into())]);
        logger.log_stats(&meta, None, None, Some(&test)).unwrap();
        logger.log_stats(&meta, None, None, Some(&test)).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "Evaluation stage: TEST - test loss: 2.00");
    }
}
