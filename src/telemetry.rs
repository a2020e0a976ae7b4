//! Per-window, per-device timing records and the sinks that collect them.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::device::DeviceTiming;

/// One (window, device) measurement. Never modified after it is emitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub device: String,
    /// Sequence number sent with the window.
    pub sequence: u32,
    /// Zero-based index of the window in the run.
    pub window_index: u64,
    /// Harness monotonic time the window was handed to this device.
    pub release_ns: u64,
    /// `release_ns` plus the hop period.
    pub deadline_ns: u64,
    pub start_ns: u64,
    /// Harness monotonic time the result (or failure) was observed.
    pub end_ns: u64,
    pub deadline_missed: bool,
    /// Adapter-side timestamps; all zero when the window failed.
    pub device_timing: DeviceTiming,
    pub failed: bool,
    /// [`CortexError::code`](crate::CortexError::code) of the failure, 0 on success.
    pub error_code: u32,
}

impl TelemetryRecord {
    /// Harness-observed latency.
    pub fn latency_ns(&self) -> u64 {
        self.end_ns.saturating_sub(self.start_ns)
    }
}

/// Destination for telemetry records.
pub trait TelemetrySink: Send {
    fn record(&mut self, record: TelemetryRecord);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn record(&mut self, _record: TelemetryRecord) {}
}

/// Collects records in memory. Clones share the same storage.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<TelemetryRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far.
    pub fn records(&self) -> Vec<TelemetryRecord> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TelemetrySink for MemorySink {
    fn record(&mut self, record: TelemetryRecord) {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).push(record);
    }
}

/// Forwards records to an async consumer as a [`Stream`](futures::Stream).
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<TelemetryRecord>,
}

impl ChannelSink {
    pub fn new() -> (Self, UnboundedReceiverStream<TelemetryRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, UnboundedReceiverStream::new(rx))
    }
}

impl TelemetrySink for ChannelSink {
    fn record(&mut self, record: TelemetryRecord) {
        // A dropped consumer only means nobody is listening any more.
        let _ = self.tx.send(record);
    }
}

impl<S: TelemetrySink + ?Sized> TelemetrySink for Box<S> {
    fn record(&mut self, record: TelemetryRecord) {
        (**self).record(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn record(sequence: u32) -> TelemetryRecord {
        TelemetryRecord {
            device: "dev".into(),
            sequence,
            window_index: sequence as u64,
            release_ns: 100,
            deadline_ns: 600,
            start_ns: 100,
            end_ns: 350,
            deadline_missed: false,
            device_timing: DeviceTiming::default(),
            failed: false,
            error_code: 0,
        }
    }

    #[test]
    fn memory_sink_clones_share_storage() {
        let sink = MemorySink::new();
        let mut writer = sink.clone();
        writer.record(record(0));
        writer.record(record(1));
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.records()[1].sequence, 1);
        assert_eq!(sink.records()[0].latency_ns(), 250);
    }

    #[tokio::test]
    async fn channel_sink_streams_records() {
        let (mut sink, stream) = ChannelSink::new();
        sink.record(record(4));
        sink.record(record(5));
        drop(sink);
        let sequences: Vec<u32> = stream.map(|r| r.sequence).collect().await;
        assert_eq!(sequences, [4, 5]);
    }

    #[test]
    fn records_serialize_to_yaml() {
        let yaml = serde_yaml_ng::to_string(&record(9)).unwrap();
        assert!(yaml.contains("sequence: 9"));
        let back: TelemetryRecord = serde_yaml_ng::from_str(&yaml).unwrap();
        assert_eq!(back, record(9));
    }
}
