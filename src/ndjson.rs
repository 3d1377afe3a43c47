//! NDJSON (Newline Delimited JSON) writer for telemetry snapshots.
//!
//! Every ServerPostData frame becomes one appended line, so downstream
//! converters (CSV, Graphite, MQTT, InfluxDB) can follow the stream
//! without parsing everything that came before. Key order within a line is
//! deterministic; float fields the device did not report are omitted
//! entirely rather than serialized as NaN.

use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};

use crate::records::Snapshot;

pub struct SnapshotWriter {
    writer: BufWriter<Box<dyn AsyncWrite + Send + Unpin>>,
    out_seq: u64,
}

impl SnapshotWriter {
    pub fn new(writer: Box<dyn AsyncWrite + Send + Unpin>) -> Self {
        SnapshotWriter {
            writer: BufWriter::new(writer),
            out_seq: 0,
        }
    }

    pub fn stdout() -> Self {
        SnapshotWriter::new(Box::new(tokio::io::stdout()))
    }

    pub async fn file(path: &str) -> std::io::Result<Self> {
        let file = tokio::fs::File::create(path).await?;
        Ok(SnapshotWriter::new(Box::new(file)))
    }

    /// Write one snapshot as a line of NDJSON and flush it.
    pub async fn write(&mut self, snapshot: &Snapshot) -> Result<(), std::io::Error> {
        self.out_seq += 1;
        self.write_value(snapshot).await
    }

    /// Write any serializable value as a line of NDJSON (command-mode
    /// responses share the output stream with snapshots).
    pub async fn write_value<T: Serialize>(&mut self, value: &T) -> Result<(), std::io::Error> {
        let mut line = serde_json::to_string(value).expect("snapshot serialization is infallible");
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Number of snapshots written so far.
    pub fn out_seq(&self) -> u64 {
        self.out_seq
    }

    pub async fn close(mut self) -> Result<(), std::io::Error> {
        self.writer.flush().await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::records::parse_device_data;

    #[tokio::test]
    async fn test_one_line_per_snapshot() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mut writer = SnapshotWriter::new(Box::new(client));
        writer.write(&Snapshot::default()).await.unwrap();
        writer.write(&Snapshot::default()).await.unwrap();
        assert_eq!(writer.out_seq(), 2);
        drop(writer);

        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut server, &mut buf)
            .await
            .unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            assert!(value.get("inverters").is_some());
        }
    }

    #[tokio::test]
    async fn test_deterministic_key_order() {
        let mut body = vec![0u8; 13];
        body[..4].copy_from_slice(&1400000000u32.to_le_bytes());
        let mut data = Vec::new();
        data.extend([0x80, 0x00]); // packed optimizer
        data.extend(0x100f7220u32.to_le_bytes());
        data.extend(13u16.to_le_bytes());
        data.extend(&body);
        let snapshot = parse_device_data(&data).unwrap();

        let a = serde_json::to_string(&snapshot).unwrap();
        let b = serde_json::to_string(&snapshot).unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("{\"inverters\""));
    }
}
