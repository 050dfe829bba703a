//! Sample sinks: where the polling loop emits readings.

#[cfg(feature = "storage_csv")]
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
#[cfg(feature = "storage_csv")]
use std::path::PathBuf;

use async_trait::async_trait;
use sensorbus_core::Sample;
use tokio::sync::mpsc;
#[cfg(feature = "storage_csv")]
use tracing::{debug, info};

use crate::error::{AppError, AppResult};

/// Consumer of samples produced by the polling loop.
#[async_trait]
pub trait SampleSink: Send {
    /// Short name for logs.
    fn name(&self) -> &str;

    async fn write(&mut self, sample: &Sample) -> AppResult<()>;

    /// Called once when the loop stops.
    async fn flush(&mut self) -> AppResult<()> {
        Ok(())
    }
}

// =============================================================================
// Console
// =============================================================================

/// Writes one formatted line per sample.
pub struct ConsoleSink<W: Write + Send = io::Stdout> {
    out: W,
}

impl ConsoleSink<io::Stdout> {
    pub fn stdout() -> Self {
        Self { out: io::stdout() }
    }
}

impl<W: Write + Send> ConsoleSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

#[async_trait]
impl<W: Write + Send> SampleSink for ConsoleSink<W> {
    fn name(&self) -> &str {
        "console"
    }

    async fn write(&mut self, sample: &Sample) -> AppResult<()> {
        writeln!(self.out, "{}", sample)?;
        Ok(())
    }

    async fn flush(&mut self) -> AppResult<()> {
        self.out.flush()?;
        Ok(())
    }
}

// =============================================================================
// CSV
// =============================================================================

/// CSV column names.
pub const CSV_HEADER: [&str; 5] = ["timestamp", "sensor", "kind", "value", "unit"];

/// Appends samples to a CSV file.
///
/// The header is written only when the file is created (or empty), so
/// repeated runs extend one recording.
#[cfg(feature = "storage_csv")]
pub struct CsvRecorder {
    path: PathBuf,
    writer: csv::Writer<File>,
    rows: u64,
}

#[cfg(feature = "storage_csv")]
impl CsvRecorder {
    pub fn open(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        let is_new = std::fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true);

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);

        if is_new {
            writer
                .write_record(CSV_HEADER)
                .map_err(|e| AppError::Storage(e.to_string()))?;
        }
        info!(path = %path.display(), new_file = is_new, "CSV recorder opened");

        Ok(Self {
            path,
            writer,
            rows: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows written by this recorder.
    pub fn rows(&self) -> u64 {
        self.rows
    }
}

#[cfg(feature = "storage_csv")]
#[async_trait]
impl SampleSink for CsvRecorder {
    fn name(&self) -> &str {
        "csv"
    }

    async fn write(&mut self, sample: &Sample) -> AppResult<()> {
        self.writer
            .write_record([
                sample.timestamp.to_rfc3339(),
                sample.sensor.clone(),
                sample.reading.kind().to_string(),
                sample.reading.value_text(),
                sample.reading.unit().to_string(),
            ])
            .map_err(|e| AppError::Storage(e.to_string()))?;
        self.rows += 1;
        Ok(())
    }

    async fn flush(&mut self) -> AppResult<()> {
        self.writer.flush()?;
        debug!(path = %self.path.display(), rows = self.rows, "CSV recorder flushed");
        Ok(())
    }
}

/// Placeholder when CSV support is compiled out.
#[cfg(not(feature = "storage_csv"))]
pub struct CsvRecorder;

#[cfg(not(feature = "storage_csv"))]
impl CsvRecorder {
    pub fn open(_path: impl AsRef<Path>) -> AppResult<Self> {
        Err(AppError::FeatureNotEnabled("storage_csv".to_string()))
    }
}

// =============================================================================
// Channel
// =============================================================================

/// Forwards samples to an async receiver.
pub struct ChannelSink {
    tx: mpsc::Sender<Sample>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Sample>) -> Self {
        Self { tx }
    }

    /// Sink plus the receiving end of a bounded channel.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Sample>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl SampleSink for ChannelSink {
    fn name(&self) -> &str {
        "channel"
    }

    async fn write(&mut self, sample: &Sample) -> AppResult<()> {
        self.tx
            .send(sample.clone())
            .await
            .map_err(|_| AppError::Storage("sample receiver dropped".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sensorbus_core::Reading;

    #[tokio::test]
    async fn test_console_format() {
        let mut sink = ConsoleSink::new(Vec::new());
        sink.write(&Sample::now("pot", Reading::scalar(2.5, "V")))
            .await
            .unwrap();
        let text = String::from_utf8(sink.into_inner()).unwrap();
        assert!(text.ends_with("pot: 2.500 V\n"), "got {:?}", text);
    }

    #[cfg(feature = "storage_csv")]
    #[tokio::test]
    async fn test_csv_header_only_for_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("samples.csv");

        for value in [1.0, 2.0] {
            let mut recorder = CsvRecorder::open(&path).unwrap();
            recorder
                .write(&Sample::now("pot", Reading::scalar(value, "V")))
                .await
                .unwrap();
            recorder.flush().await.unwrap();
            assert_eq!(recorder.rows(), 1);
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "timestamp,sensor,kind,value,unit");
        assert!(lines[1].ends_with(",pot,scalar,1,V"));
        assert!(lines[2].ends_with(",pot,scalar,2,V"));
    }

    #[tokio::test]
    async fn test_channel_sink_closed_receiver() {
        let (mut sink, rx) = ChannelSink::channel(1);
        drop(rx);
        let err = sink
            .write(&Sample::now("btn", Reading::Digital { level: true }))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Storage(_)));
    }
}
