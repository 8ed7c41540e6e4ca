//! Output collaborators. Every completed envelope is handed to each sink.

use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::core::error::{Result, ScoutError};
use crate::core::types::ResultEnvelope;

#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn accept(&self, envelope: &ResultEnvelope) -> Result<()>;
}

/// Keeps envelopes in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    envelopes: Mutex<Vec<ResultEnvelope>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn envelopes(&self) -> Vec<ResultEnvelope> {
        self.envelopes.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn accept(&self, envelope: &ResultEnvelope) -> Result<()> {
        self.envelopes
            .lock()
            .map_err(|_| ScoutError::Sink("memory sink poisoned".to_string()))?
            .push(envelope.clone());
        Ok(())
    }
}

/// One JSON document per line, appended to a file or written to stdout.
#[derive(Debug, Clone)]
pub enum JsonLinesSink {
    Stdout,
    File(PathBuf),
}

#[async_trait]
impl RecordSink for JsonLinesSink {
    async fn accept(&self, envelope: &ResultEnvelope) -> Result<()> {
        let mut line = serde_json::to_string(envelope).map_err(|e| ScoutError::Sink(e.to_string()))?;
        line.push('\n');
        match self {
            JsonLinesSink::Stdout => {
                let mut out = tokio::io::stdout();
                out.write_all(line.as_bytes())
                    .await
                    .map_err(|e| ScoutError::Sink(e.to_string()))?;
                out.flush().await.map_err(|e| ScoutError::Sink(e.to_string()))
            }
            JsonLinesSink::File(path) => {
                let mut file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await
                    .map_err(|e| ScoutError::Sink(format!("{}: {}", path.display(), e)))?;
                let fail = |e: std::io::Error| ScoutError::Sink(format!("{}: {}", path.display(), e));
                file.write_all(line.as_bytes()).await.map_err(fail)?;
                file.flush().await.map_err(fail)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{PersonKind, ResultScope};
    use chrono::Utc;
    use uuid::Uuid;

    fn envelope() -> ResultEnvelope {
        ResultEnvelope {
            run_id: Uuid::new_v4(),
            term: "12345678909".into(),
            mode: PersonKind::Cpf,
            search_url: "https://portal.test/pessoa-fisica/busca/lista?termo=12345678909".into(),
            scope: ResultScope::SearchOnly,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            items: Vec::new(),
            partial_failures: Vec::new(),
        }
    }

    #[tokio::test]
    async fn json_lines_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.jsonl");
        let sink = JsonLinesSink::File(path.clone());
        sink.accept(&envelope()).await.unwrap();
        sink.accept(&envelope()).await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["mode"], "cpf");
        assert_eq!(parsed["scope"], "search_only");
    }

    #[tokio::test]
    async fn memory_sink_keeps_envelopes() {
        let sink = MemorySink::new();
        sink.accept(&envelope()).await.unwrap();
        assert_eq!(sink.envelopes().len(), 1);
    }
}
