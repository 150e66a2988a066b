//! Scan result reporting
//!
//! Observers receive every lifecycle transition of a scan as a
//! `{type, data}` event. Finished scans are also handed to a record sink
//! that stands in for the audit storage collaborator.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, RwLock};

use crate::types::{AlertRequestId, ScanId, ScanResult, ScanState, VerificationResult};

/// Alert asking a human to decide on a blocked operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityAlert {
    pub request_id: AlertRequestId,
    pub scan_result: ScanResult,
}

/// Event pushed to observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReporterEvent {
    ScanResult(ScanResult),
    ShowSecurityAlert(SecurityAlert),
}

impl ReporterEvent {
    pub fn scan_id(&self) -> ScanId {
        match self {
            ReporterEvent::ScanResult(result) => result.id,
            ReporterEvent::ShowSecurityAlert(alert) => alert.scan_result.id,
        }
    }

    /// Alerts and terminal results; losing one stalls the observer.
    pub fn must_deliver(&self) -> bool {
        match self {
            ReporterEvent::ScanResult(result) => result.state.is_terminal(),
            ReporterEvent::ShowSecurityAlert(_) => true,
        }
    }
}

/// Receives scan events
#[async_trait]
pub trait ScanReporter: Send + Sync {
    async fn report(&self, event: ReporterEvent);
}

/// Discards every event
#[derive(Debug, Default, Clone)]
pub struct NullReporter;

#[async_trait]
impl ScanReporter for NullReporter {
    async fn report(&self, _event: ReporterEvent) {}
}

/// Forwards events into a bounded channel
///
/// In-progress updates are dropped when the channel is full. Alerts and
/// terminal results wait for capacity, since losing one leaves the observer
/// with a scan that never finishes.
#[derive(Debug, Clone)]
pub struct ChannelReporter {
    sender: mpsc::Sender<ReporterEvent>,
}

impl ChannelReporter {
    pub fn new(sender: mpsc::Sender<ReporterEvent>) -> Self {
        Self { sender }
    }

    /// Reporter plus the receiving end of a channel of `capacity` events.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ReporterEvent>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self::new(sender), receiver)
    }
}

#[async_trait]
impl ScanReporter for ChannelReporter {
    async fn report(&self, event: ReporterEvent) {
        let scan_id = event.scan_id();
        if event.must_deliver() {
            if let Err(e) = self.sender.send(event).await {
                tracing::error!(scan_id = %scan_id, "Observer channel closed, event lost: {}", e);
            }
            return;
        }
        if let Err(e) = self.sender.try_send(event) {
            tracing::warn!(scan_id = %scan_id, "Dropped scan event: {}", e);
        }
    }
}

/// Writes events as JSON lines to a file, or to tracing output only
///
/// The file is opened on first use and kept open; one event is one write
/// under the lock.
pub struct JsonLinesReporter {
    path: Option<PathBuf>,
    file: tokio::sync::Mutex<Option<File>>,
    count: RwLock<u64>,
}

impl JsonLinesReporter {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            file: tokio::sync::Mutex::new(None),
            count: RwLock::new(0),
        }
    }

    pub async fn event_count(&self) -> u64 {
        *self.count.read().await
    }
}

#[async_trait]
impl ScanReporter for JsonLinesReporter {
    async fn report(&self, event: ReporterEvent) {
        let json = serde_json::to_string(&event).unwrap_or_else(|e| {
            format!(
                r#"{{"error":"serialization failed: {}","ts":"{}"}}"#,
                e,
                Utc::now().to_rfc3339()
            )
        });

        tracing::debug!(target: "scan_events", "{}", json);

        if let Some(ref path) = self.path {
            let mut file = self.file.lock().await;
            if let Err(e) = append_line(&mut file, path, &json).await {
                tracing::warn!("Failed to write scan event: {}", e);
            }
        }

        *self.count.write().await += 1;
    }
}

/// Append one line; a failed handle is dropped and reopened next time.
async fn append_line(slot: &mut Option<File>, path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = match slot.take() {
        Some(file) => file,
        None => {
            tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?
        }
    };

    let mut record = String::with_capacity(line.len() + 1);
    record.push_str(line);
    record.push('\n');
    file.write_all(record.as_bytes()).await?;
    file.flush().await?;

    *slot = Some(file);
    Ok(())
}

/// Sends each event to every inner reporter in order
#[derive(Clone, Default)]
pub struct CompositeReporter {
    reporters: Vec<Arc<dyn ScanReporter>>,
}

impl CompositeReporter {
    pub fn new(reporters: Vec<Arc<dyn ScanReporter>>) -> Self {
        Self { reporters }
    }

    pub fn push(&mut self, reporter: Arc<dyn ScanReporter>) {
        self.reporters.push(reporter);
    }
}

#[async_trait]
impl ScanReporter for CompositeReporter {
    async fn report(&self, event: ReporterEvent) {
        for reporter in &self.reporters {
            reporter.report(event.clone()).await;
        }
    }
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct MemoryReporter {
    events: Mutex<Vec<ReporterEvent>>,
}

impl MemoryReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ReporterEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Reported states of one scan, in report order.
    pub fn states(&self, scan_id: ScanId) -> Vec<ScanState> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ReporterEvent::ScanResult(result) if result.id == scan_id => Some(result.state),
                _ => None,
            })
            .collect()
    }

    pub fn alerts(&self) -> Vec<SecurityAlert> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ReporterEvent::ShowSecurityAlert(alert) => Some(alert),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl ScanReporter for MemoryReporter {
    async fn report(&self, event: ReporterEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Accepts finished scan records
#[async_trait]
pub trait ScanRecordSink: Send + Sync {
    async fn store(&self, record: ScanResult) -> VerificationResult<()>;
}

/// Record sink kept in memory
#[derive(Debug, Default)]
pub struct InMemoryScanRecordSink {
    records: RwLock<Vec<ScanResult>>,
}

impl InMemoryScanRecordSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<ScanResult> {
        self.records.read().await.clone()
    }

    pub async fn get(&self, scan_id: ScanId) -> Option<ScanResult> {
        self.records
            .read()
            .await
            .iter()
            .find(|r| r.id == scan_id)
            .cloned()
    }
}

#[async_trait]
impl ScanRecordSink for InMemoryScanRecordSink {
    async fn store(&self, record: ScanResult) -> VerificationResult<()> {
        if !record.state.is_terminal() {
            tracing::warn!(scan_id = %record.id, "Ignoring unfinished scan record");
            return Ok(());
        }
        self.records.write().await.push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VerificationRequest;
    use serde_json::json;

    fn scan() -> ScanResult {
        ScanResult::begin(&VerificationRequest::tool_call("read", json!({"path": "/tmp"})))
    }

    #[test]
    fn events_serialize_as_type_and_data() {
        let result = scan();
        let value = serde_json::to_value(ReporterEvent::ScanResult(result.clone())).unwrap();
        assert_eq!(value["type"], "SCAN_RESULT");
        assert_eq!(value["data"]["toolName"], "read");
        assert_eq!(value["data"]["state"], "in_progress");

        let alert = ReporterEvent::ShowSecurityAlert(SecurityAlert {
            request_id: AlertRequestId::new(),
            scan_result: result,
        });
        let value = serde_json::to_value(&alert).unwrap();
        assert_eq!(value["type"], "SHOW_SECURITY_ALERT");
        assert!(value["data"]["requestId"].is_string());
        assert_eq!(value["data"]["scanResult"]["toolName"], "read");
    }

    #[tokio::test]
    async fn channel_reporter_drops_when_full() {
        let (reporter, mut rx) = ChannelReporter::channel(1);
        reporter.report(ReporterEvent::ScanResult(scan())).await;
        reporter.report(ReporterEvent::ScanResult(scan())).await;
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn json_lines_reporter_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let reporter = JsonLinesReporter::new(Some(path.clone()));
        reporter.report(ReporterEvent::ScanResult(scan())).await;
        reporter.report(ReporterEvent::ScanResult(scan())).await;

        assert_eq!(reporter.event_count().await, 2);
        let written = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = written.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: ReporterEvent = serde_json::from_str(lines[0]).unwrap();
        assert!(matches!(parsed, ReporterEvent::ScanResult(_)));
    }

    #[tokio::test]
    async fn channel_reporter_waits_for_terminal_results() {
        let (reporter, mut rx) = ChannelReporter::channel(1);
        reporter.report(ReporterEvent::ScanResult(scan())).await;

        let mut finished = scan();
        finished.finish(ScanState::Completed);
        let sender = tokio::spawn(async move {
            reporter.report(ReporterEvent::ScanResult(finished)).await;
        });

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, ReporterEvent::ScanResult(ref r) if r.state == ScanState::InProgress));
        sender.await.unwrap();
        let last = rx.recv().await.unwrap();
        assert!(matches!(last, ReporterEvent::ScanResult(ref r) if r.state == ScanState::Completed));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn json_lines_reporter_keeps_lines_whole_under_concurrency() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let reporter = Arc::new(JsonLinesReporter::new(Some(path.clone())));

        let writers: Vec<_> = (0..32)
            .map(|_| {
                let reporter = reporter.clone();
                tokio::spawn(async move {
                    for _ in 0..20 {
                        reporter.report(ReporterEvent::ScanResult(scan())).await;
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }

        let written = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = written.lines().collect();
        assert_eq!(lines.len(), 640);
        for line in lines {
            serde_json::from_str::<ReporterEvent>(line).unwrap();
        }
    }

    #[tokio::test]
    async fn composite_fans_out() {
        let a = Arc::new(MemoryReporter::new());
        let b = Arc::new(MemoryReporter::new());
        let composite = CompositeReporter::new(vec![a.clone(), b.clone()]);
        let result = scan();
        composite.report(ReporterEvent::ScanResult(result.clone())).await;
        assert_eq!(a.states(result.id), vec![ScanState::InProgress]);
        assert_eq!(b.events().len(), 1);
    }

    #[tokio::test]
    async fn sink_keeps_only_finished_records() {
        let sink = InMemoryScanRecordSink::new();
        let mut result = scan();
        sink.store(result.clone()).await.unwrap();
        assert!(sink.records().await.is_empty());

        result.finish(ScanState::Completed);
        sink.store(result.clone()).await.unwrap();
        assert_eq!(sink.get(result.id).await.unwrap().state, ScanState::Completed);
    }
}
