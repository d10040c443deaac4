//! # Telemetry Sinks
//!
//! A run hands exactly one complete [`BenchmarkResult`] to a sink. Sinks
//! never see partial records: the orchestrator only calls
//! [`TelemetrySink::emit`] once every field has been captured.

use std::io::Write;

use tracing::info;

use crate::bench::BenchmarkResult;

/// Destination for benchmark records.
pub trait TelemetrySink: Send {
    /// Emit one record.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink cannot accept the record.
    fn emit(&mut self, record: &BenchmarkResult) -> Result<(), SinkError>;

    /// Flush any buffered data.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush operation fails.
    fn flush(&mut self) -> Result<(), SinkError>;
}

/// Errors that can occur in sinks.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// Failed to write to sink
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// Failed to flush sink
    #[error("Flush failed: {0}")]
    FlushFailed(String),

    /// Sink is closed
    #[error("Sink is closed")]
    Closed,
}

/// Emits each record as one `info` event on the `memprobe::telemetry`
/// target, with the record's fields as structured fields and its
/// single-line rendering as the message.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl TelemetrySink for LogSink {
    fn emit(&mut self, record: &BenchmarkResult) -> Result<(), SinkError> {
        let thread = &record.thread;
        info!(
            target: "memprobe::telemetry",
            strategy = %record.strategy,
            numa_id = thread.numa_id,
            core_id = thread.core_id,
            voluntary_switches = thread.voluntary_switches,
            involuntary_switches = thread.involuntary_switches,
            core_migrations = thread.core_migrations,
            checksum = ?record.checksum,
            numa_write_nodes = %record.numa_write_nodes,
            numa_read_nodes = %record.numa_read_nodes,
            write_time_us = record.write_time_us,
            read_time_us = record.read_time_us,
            payload_bytes = record.payload_bytes,
            "{record}"
        );
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Writes each record as one line of JSON.
#[derive(Debug)]
pub struct JsonLinesSink<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> JsonLinesSink<W> {
    /// Creates a sink writing to `writer`.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Consumes the sink, returning the writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> TelemetrySink for JsonLinesSink<W> {
    fn emit(&mut self, record: &BenchmarkResult) -> Result<(), SinkError> {
        serde_json::to_writer(&mut self.writer, record)
            .map_err(|e| SinkError::WriteFailed(e.to_string()))?;
        self.writer
            .write_all(b"\n")
            .map_err(|e| SinkError::WriteFailed(e.to_string()))
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.writer
            .flush()
            .map_err(|e| SinkError::FlushFailed(e.to_string()))
    }
}

/// A sink that keeps every record in memory.
#[derive(Debug, Default)]
pub struct BufferingSink {
    records: Vec<BenchmarkResult>,
    closed: bool,
}

impl BufferingSink {
    /// Creates a new buffering sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records received so far.
    #[must_use]
    pub fn records(&self) -> &[BenchmarkResult] {
        &self.records
    }

    /// Takes the buffered records.
    pub fn take_records(&mut self) -> Vec<BenchmarkResult> {
        std::mem::take(&mut self.records)
    }

    /// Refuses all further records.
    pub fn close(&mut self) {
        self.closed = true;
    }
}

impl TelemetrySink for BufferingSink {
    fn emit(&mut self, record: &BenchmarkResult) -> Result<(), SinkError> {
        if self.closed {
            return Err(SinkError::Closed);
        }
        self.records.push(record.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}
