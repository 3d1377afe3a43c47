//! Byte-stream sources and sinks for frames.
//!
//! A source is anything that yields the raw inverter byte stream: a
//! capture file (optionally followed as it grows), stdin, a serial port,
//! or the first TCP connection accepted on one of a set of listen ports.
//! End of stream and soft I/O errors are both reported as a short read;
//! the session layer decides whether that means terminate or reconnect.

use std::sync::Arc;
use std::time::Duration;

use futures::future::select_all;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tokio_serial::SerialPortBuilderExt;

use crate::frame::{CHECKSUM_LEN, HEADER_LEN, MAGIC, MAGIC_LEN};

/// How long to wait before polling a followed file for appended data.
pub const FOLLOW_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Sockets that stay silent this long are treated as dead.
pub const SOCKET_READ_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_BAUD_RATE: u32 = 115200;
pub const DEFAULT_LISTEN_PORT: u16 = 22222;

fn default_baud() -> u32 {
    DEFAULT_BAUD_RATE
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceConfig {
    Stdin,
    File {
        path: String,
        #[serde(default)]
        follow: bool,
    },
    Serial {
        path: String,
        #[serde(default = "default_baud")]
        baud: u32,
        /// RS485 shares the bus between master and slaves, so frames can
        /// start anywhere in the byte stream and reads must resync on the
        /// magic number.
        #[serde(default)]
        rs485: bool,
    },
    Network {
        ports: Vec<u16>,
    },
}

impl SourceConfig {
    pub fn is_network(&self) -> bool {
        matches!(self, SourceConfig::Network { .. })
    }

    pub fn is_rs485(&self) -> bool {
        matches!(self, SourceConfig::Serial { rs485: true, .. })
    }
}

/// Raw byte mirror of all traffic, shared between the reader and the
/// sink so a session can be replayed later.
pub type SharedRecordFile = Arc<Mutex<tokio::fs::File>>;

pub async fn open_record_file(path: &str, append: bool) -> std::io::Result<SharedRecordFile> {
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .append(append)
        .truncate(!append)
        .open(path)
        .await?;
    Ok(Arc::new(Mutex::new(file)))
}

pub struct ByteSource {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    pub name: String,
    pub following: bool,
    read_timeout: Option<Duration>,
}

impl ByteSource {
    pub fn from_reader(
        reader: Box<dyn AsyncRead + Send + Unpin>,
        name: impl Into<String>,
        following: bool,
    ) -> Self {
        ByteSource {
            reader,
            name: name.into(),
            following,
            read_timeout: None,
        }
    }

    /// Read exactly `n` bytes. A short return means end of stream; in
    /// follow mode end of file blocks and retries instead. Soft I/O
    /// errors and socket timeouts are logged and reported as end of
    /// stream.
    pub async fn read_bytes(&mut self, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        let mut filled = 0;
        while filled < n {
            let read = match self.read_timeout {
                Some(limit) => match timeout(limit, self.reader.read(&mut buf[filled..])).await {
                    Ok(result) => result,
                    Err(_) => {
                        info!("read timed out on {}", self.name);
                        buf.truncate(filled);
                        return buf;
                    }
                },
                None => self.reader.read(&mut buf[filled..]).await,
            };
            match read {
                Ok(0) => {
                    if self.following {
                        sleep(FOLLOW_POLL_INTERVAL).await;
                    } else {
                        buf.truncate(filled);
                        return buf;
                    }
                }
                Ok(count) => filled += count,
                Err(e) => {
                    info!("read error on {}: {e}", self.name);
                    buf.truncate(filled);
                    return buf;
                }
            }
        }
        buf
    }
}

/// Outbound side of a transport. Holds the only write handle, so the
/// session's tx-mutex (the `Mutex` this usually lives in) fully serializes
/// outbound frames.
pub struct FrameSink {
    writer: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    record: Option<SharedRecordFile>,
    out_seq: u64,
    pub name: String,
}

impl FrameSink {
    pub fn new(
        writer: Option<Box<dyn AsyncWrite + Send + Unpin>>,
        record: Option<SharedRecordFile>,
        name: impl Into<String>,
    ) -> Self {
        FrameSink {
            writer,
            record,
            out_seq: 0,
            name: name.into(),
        }
    }

    /// Write magic + frame to the sink and flush, mirroring to the record
    /// file if one is configured.
    pub async fn send_frame(&mut self, msg: &[u8]) -> std::io::Result<()> {
        self.out_seq += 1;
        debug!(
            "<-- message: {} length: {} to {}",
            self.out_seq,
            MAGIC_LEN + msg.len(),
            self.name
        );
        match &mut self.writer {
            Some(writer) => {
                writer.write_all(&MAGIC).await?;
                writer.write_all(msg).await?;
                writer.flush().await?;
            }
            None => warn!("dropping outbound frame: {} is read-only", self.name),
        }
        if let Some(record) = &self.record {
            let mut file = record.lock().await;
            file.write_all(&MAGIC).await?;
            file.write_all(msg).await?;
            file.flush().await?;
        }
        Ok(())
    }

    pub fn replace_writer(&mut self, writer: Option<Box<dyn AsyncWrite + Send + Unpin>>) {
        self.writer = writer;
    }
}

/// Open a source/sink pair for the configured endpoint. Network sources
/// block until an inverter connects.
pub async fn open(
    config: &SourceConfig,
    record: Option<SharedRecordFile>,
) -> std::io::Result<(ByteSource, FrameSink)> {
    match config {
        SourceConfig::Stdin => Ok((
            ByteSource::from_reader(Box::new(tokio::io::stdin()), "stdin", false),
            FrameSink::new(None, record, "stdin"),
        )),
        SourceConfig::File { path, follow } => {
            let file = tokio::fs::File::open(path).await?;
            Ok((
                ByteSource::from_reader(Box::new(file), path.clone(), *follow),
                FrameSink::new(None, record, path.clone()),
            ))
        }
        SourceConfig::Serial { path, baud, .. } => {
            let port = tokio_serial::new(path.as_str(), *baud).open_native_async()?;
            let (reader, writer) = tokio::io::split(port);
            Ok((
                ByteSource::from_reader(Box::new(reader), path.clone(), true),
                FrameSink::new(Some(Box::new(writer)), record, path.clone()),
            ))
        }
        SourceConfig::Network { ports } => {
            let stream = listen_first(ports).await?;
            let peer = stream
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "<socket>".to_string());
            let (reader, writer) = stream.into_split();
            let mut source = ByteSource::from_reader(Box::new(reader), peer.clone(), false);
            source.read_timeout = Some(SOCKET_READ_TIMEOUT);
            Ok((source, FrameSink::new(Some(Box::new(writer)), record, peer)))
        }
    }
}

/// Listen on every configured port and accept whichever connection
/// arrives first; the remaining listeners are closed.
async fn listen_first(ports: &[u16]) -> std::io::Result<TcpStream> {
    if ports.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "no listen ports configured",
        ));
    }
    let mut listeners = Vec::with_capacity(ports.len());
    for port in ports {
        info!("waiting for connection on port {port}");
        listeners.push(TcpListener::bind(("0.0.0.0", *port)).await?);
    }
    let accepts: Vec<_> = listeners.iter().map(|l| Box::pin(l.accept())).collect();
    let (result, index, _) = select_all(accepts).await;
    let (stream, addr) = result?;
    info!("connection from {addr} to port {}", ports[index]);
    Ok(stream)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReadMode {
    /// Read magic + header, then exactly the announced payload. Only
    /// valid when this end owns the conversation (RS232 or network).
    Active,
    /// Slide a window byte-by-byte until the next magic number. Tolerates
    /// noise, arbitrary alignment, and bus collisions; the bytes before
    /// the first magic are discarded.
    Passive,
}

/// One framed read: the frame bytes (without magic) and whether the
/// stream ended. At end of stream a final partial frame may still be
/// returned alongside the eof flag.
#[derive(Debug, PartialEq)]
pub struct FrameRead {
    pub msg: Vec<u8>,
    pub eof: bool,
}

pub struct FrameReader {
    source: ByteSource,
    mode: ReadMode,
    synced: bool,
    in_seq: u64,
    record: Option<SharedRecordFile>,
}

impl FrameReader {
    pub fn new(source: ByteSource, mode: ReadMode, record: Option<SharedRecordFile>) -> Self {
        FrameReader {
            source,
            mode,
            // active reads are aligned by construction
            synced: mode == ReadMode::Active,
            in_seq: 0,
            record,
        }
    }

    pub fn source_name(&self) -> &str {
        &self.source.name
    }

    pub async fn read_frame(&mut self) -> FrameRead {
        let read = match self.mode {
            ReadMode::Active => self.read_active().await,
            ReadMode::Passive => self.read_passive().await,
        };
        if !read.msg.is_empty() {
            self.in_seq += 1;
            debug!(
                "--> message: {} length: {} from {}",
                self.in_seq,
                MAGIC_LEN + read.msg.len(),
                self.source.name
            );
            if let Some(record) = &self.record {
                let mut file = record.lock().await;
                let _ = file.write_all(&MAGIC).await;
                let _ = file.write_all(&read.msg).await;
                let _ = file.flush().await;
            }
        }
        read
    }

    async fn read_active(&mut self) -> FrameRead {
        let head = self.source.read_bytes(MAGIC_LEN + HEADER_LEN).await;
        if head.len() < MAGIC_LEN + HEADER_LEN {
            return FrameRead {
                msg: Vec::new(),
                eof: true,
            };
        }
        let data_len = u16::from_le_bytes([head[MAGIC_LEN], head[MAGIC_LEN + 1]]) as usize;
        let rest = self.source.read_bytes(data_len + CHECKSUM_LEN).await;
        let eof = rest.len() < data_len + CHECKSUM_LEN;
        let mut msg = head[MAGIC_LEN..].to_vec();
        msg.extend(rest);
        FrameRead { msg, eof }
    }

    async fn read_passive(&mut self) -> FrameRead {
        loop {
            let mut msg: Vec<u8> = Vec::new();
            let mut eof = false;
            while !msg.ends_with(&MAGIC) {
                let byte = self.source.read_bytes(1).await;
                if byte.is_empty() {
                    // pretend there was a magic number to end the frame
                    eof = true;
                    msg.extend(MAGIC);
                } else {
                    msg.extend(byte);
                }
            }
            msg.truncate(msg.len() - MAGIC_LEN);
            if !self.synced {
                self.synced = true;
                if !msg.is_empty() {
                    debug!("discarding {} bytes before first magic number", msg.len());
                }
                if eof {
                    return FrameRead {
                        msg: Vec::new(),
                        eof: true,
                    };
                }
                continue;
            }
            return FrameRead { msg, eof };
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::frame::format_frame;
    use std::io::Cursor;

    fn source(bytes: Vec<u8>) -> ByteSource {
        ByteSource::from_reader(Box::new(Cursor::new(bytes)), "test", false)
    }

    #[tokio::test]
    async fn test_active_read() {
        let frame = format_frame(1, 2, 3, 0x0500, &[9, 9, 9]);
        let mut stream = MAGIC.to_vec();
        stream.extend(&frame);
        let mut reader = FrameReader::new(source(stream), ReadMode::Active, None);
        let read = reader.read_frame().await;
        assert_eq!(read.msg, frame);
        assert!(!read.eof);
        assert!(reader.read_frame().await.eof);
    }

    #[tokio::test]
    async fn test_passive_sync_after_noise() {
        let frame = format_frame(1, 2, 3, 0x0500, &[7; 5]);
        let mut stream = vec![0xaa; 37];
        stream.extend(MAGIC);
        stream.extend(&frame);
        stream.push(0xbb);
        let mut reader = FrameReader::new(source(stream), ReadMode::Passive, None);

        // the noise before the first magic is consumed silently; the
        // frame (plus the trailing junk byte) arrives with the eof flag
        let read = reader.read_frame().await;
        assert!(read.eof);
        let mut expected = frame.clone();
        expected.push(0xbb);
        assert_eq!(read.msg, expected);
        let frame = crate::frame::parse_frame(&read.msg).unwrap();
        assert_eq!(frame.data, vec![7; 5]);
    }

    #[tokio::test]
    async fn test_passive_back_to_back_frames() {
        let frame1 = format_frame(1, 2, 3, 0x0500, b"one");
        let frame2 = format_frame(2, 2, 3, 0x0500, b"two");
        let mut stream = Vec::new();
        for frame in [&frame1, &frame2] {
            stream.extend(MAGIC);
            stream.extend(frame.iter());
        }
        let mut reader = FrameReader::new(source(stream), ReadMode::Passive, None);
        let read = reader.read_frame().await;
        assert_eq!(read.msg, frame1);
        assert!(!read.eof);
        let read = reader.read_frame().await;
        assert_eq!(read.msg, frame2);
        assert!(read.eof);
    }

    #[tokio::test]
    async fn test_passive_empty_stream() {
        let mut reader = FrameReader::new(source(Vec::new()), ReadMode::Passive, None);
        let read = reader.read_frame().await;
        assert!(read.eof);
        assert!(read.msg.is_empty());
    }

    #[tokio::test]
    async fn test_read_bytes_short_at_eof() {
        let mut src = source(vec![1, 2, 3]);
        assert_eq!(src.read_bytes(2).await, vec![1, 2]);
        assert_eq!(src.read_bytes(5).await, vec![3]);
        assert!(src.read_bytes(1).await.is_empty());
    }

    #[tokio::test]
    async fn test_follow_mode_waits_for_data() {
        let (client, server) = tokio::io::duplex(64);
        let mut src = ByteSource::from_reader(Box::new(server), "duplex", true);
        let writer = tokio::spawn(async move {
            let mut client = client;
            sleep(Duration::from_millis(20)).await;
            client.write_all(b"abcd").await.unwrap();
            client
        });
        // blocks across the writer's delay instead of reporting eof
        assert_eq!(src.read_bytes(4).await, b"abcd".to_vec());
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_record_mirror() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.rec");
        let record = open_record_file(path.to_str().unwrap(), false)
            .await
            .unwrap();

        let frame = format_frame(5, 6, 7, 0x0080, &[]);
        let mut stream = MAGIC.to_vec();
        stream.extend(&frame);
        let mut reader =
            FrameReader::new(source(stream), ReadMode::Passive, Some(record.clone()));
        while !reader.read_frame().await.eof {}

        let mut sink = FrameSink::new(None, Some(record), "test");
        sink.send_frame(&frame).await.unwrap();

        let recorded = std::fs::read(&path).unwrap();
        let mut expected = MAGIC.to_vec();
        expected.extend(&frame);
        expected.extend(MAGIC);
        expected.extend(&frame);
        assert_eq!(recorded, expected);
    }
}
