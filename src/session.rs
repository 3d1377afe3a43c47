//! Session control: dispatching inbound messages, issuing replies, serving
//! time, reassembling firmware images, and driving the RS485 bus as the
//! polling master.
//!
//! The controller owns the cipher, the firmware buffer, and the telemetry
//! writer; they are only ever touched from the reader task. The outbound
//! side is shared with the master poll task through a mutex so replies and
//! bus grants never interleave on the wire. Bus handoff uses a capacity-1
//! channel: the reader pushes a release when a slave acknowledges its
//! grant, and the master task waits on the channel with a timeout so a
//! silent slave degrades the loop to a fixed-rate poller.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use deku::DekuContainerWrite;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::crypto::{CryptoError, KeyExchangeStore, SessionCipher};
use crate::frame::{
    self, BROADCAST_ADDR, ENVELOPE_ADDR, Frame, FrameError, MAGIC, MAGIC_LEN, MASTER_ADDR,
};
use crate::message::{self, Message, MessageError, TimePayload, parse_message};
use crate::ndjson::SnapshotWriter;
use crate::seqfile::SeqFile;
use crate::transport::{
    self, FrameReader, FrameSink, ReadMode, SharedRecordFile, SourceConfig,
};

/// Size of a firmware image; upgrade writes patch into a buffer of
/// exactly this many bytes.
pub const UPDATE_SIZE: usize = 0x80000;

pub const DEFAULT_GRANT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_COMMAND_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Read-only: never transmit.
    Passive,
    /// Drive the RS485 bus, polling slaves in turn.
    Master,
    /// Send a configured command sequence, capture responses, exit.
    Commanding,
    /// Impersonate the cloud endpoint: acknowledge and answer everything.
    Server,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("firmware write of {length} bytes at offset {offset:#x} outside image of {UPDATE_SIZE:#x} bytes")]
    FirmwareOutOfRange { offset: u32, length: u32 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Frame-level failures are dropped (or upgraded to process exit by
    /// `halt_on_error`); anything else tears the session down.
    fn is_frame_error(&self) -> bool {
        !matches!(self, SessionError::Io(_))
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CommandParseError {
    #[error("empty command")]
    Empty,
    #[error("invalid function code {0:?}")]
    InvalidFunction(String),
    #[error("invalid parameter {0:?} (expected [bhl]<hex>)")]
    InvalidParam(String),
}

/// A command parameter with its wire width: `b`yte, `h`alf-word, or
/// `l`ong word, serialized little-endian.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CommandParam {
    Byte(u8),
    Half(u16),
    Long(u32),
}

/// One command to issue in commanding mode, written as
/// `<function-hex>[,b<hex>|h<hex>|l<hex>...]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub function: u16,
    pub params: Vec<CommandParam>,
}

impl Command {
    pub fn parse(s: &str) -> Result<Command, CommandParseError> {
        let mut fields = s.split(',');
        let function = fields.next().ok_or(CommandParseError::Empty)?;
        let function = u16::from_str_radix(function.trim(), 16)
            .map_err(|_| CommandParseError::InvalidFunction(function.to_string()))?;
        let mut params = Vec::new();
        for field in fields {
            let field = field.trim();
            let (kind, value) = field
                .split_at_checked(1)
                .ok_or_else(|| CommandParseError::InvalidParam(field.to_string()))?;
            let invalid = || CommandParseError::InvalidParam(field.to_string());
            let param = match kind {
                "b" | "B" => CommandParam::Byte(u8::from_str_radix(value, 16).map_err(|_| invalid())?),
                "h" | "H" => CommandParam::Half(u16::from_str_radix(value, 16).map_err(|_| invalid())?),
                "l" | "L" => CommandParam::Long(u32::from_str_radix(value, 16).map_err(|_| invalid())?),
                _ => return Err(invalid()),
            };
            params.push(param);
        }
        Ok(Command { function, params })
    }

    pub fn param_bytes(&self) -> Vec<u8> {
        let mut data = Vec::new();
        for param in &self.params {
            match param {
                CommandParam::Byte(v) => data.push(*v),
                CommandParam::Half(v) => data.extend(v.to_le_bytes()),
                CommandParam::Long(v) => data.extend(v.to_le_bytes()),
            }
        }
        data
    }
}

/// In-memory firmware image reassembled from UpgradeWrite messages and
/// flushed to disk at session end.
pub struct FirmwareBuffer {
    buf: Vec<u8>,
    path: PathBuf,
}

impl FirmwareBuffer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FirmwareBuffer {
            buf: vec![0; UPDATE_SIZE],
            path: path.into(),
        }
    }

    pub fn write(&mut self, offset: u32, length: u32, data: &[u8]) -> Result<(), SessionError> {
        let start = offset as usize;
        let len = length as usize;
        if start.checked_add(len).is_none_or(|end| end > UPDATE_SIZE) {
            return Err(SessionError::FirmwareOutOfRange { offset, length });
        }
        if data.len() != len {
            warn!(
                "firmware write at {offset:#x} announces {len} bytes but carries {}",
                data.len()
            );
        }
        let copy = len.min(data.len());
        self.buf[start..start + copy].copy_from_slice(&data[..copy]);
        Ok(())
    }

    pub fn save(&self) -> std::io::Result<()> {
        std::fs::write(&self.path, &self.buf)?;
        info!("wrote firmware image to {:?}", self.path);
        Ok(())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

/// Named session-state items, timestamped on write and dumped at
/// shutdown for debugging.
#[derive(Default)]
pub struct StateDict(BTreeMap<String, (String, chrono::DateTime<Local>)>);

impl StateDict {
    pub fn set(&mut self, name: &str, value: impl ToString) {
        self.0
            .insert(name.to_string(), (value.to_string(), Local::now()));
    }

    pub fn dump(&self) {
        info!("session state:");
        for (name, (value, updated)) in &self.0 {
            info!("    {name}: {value} ({})", updated.format("%H:%M:%S"));
        }
    }
}

pub struct SessionConfig {
    pub mode: Mode,
    pub slaves: Vec<u32>,
    pub commands: Vec<Command>,
    pub device_key: Option<[u8; 16]>,
    pub update_path: Option<PathBuf>,
    pub halt_on_error: bool,
    pub seq_path: PathBuf,
    pub key_cache_path: PathBuf,
    pub grant_timeout: Duration,
    pub poll_interval: Duration,
    pub command_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            mode: Mode::Passive,
            slaves: Vec::new(),
            commands: Vec::new(),
            device_key: None,
            update_path: None,
            halt_on_error: false,
            seq_path: PathBuf::from(crate::seqfile::DEFAULT_SEQ_FILE),
            key_cache_path: PathBuf::from("last0503.msg"),
            grant_timeout: DEFAULT_GRANT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            command_delay: DEFAULT_COMMAND_DELAY,
        }
    }
}

/// Which frame-reading discipline a session uses (see [`ReadMode`]).
pub fn read_mode(mode: Mode, source: &SourceConfig) -> ReadMode {
    if mode == Mode::Passive || source.is_rs485() {
        ReadMode::Passive
    } else {
        ReadMode::Active
    }
}

pub struct SessionController {
    config: SessionConfig,
    source_config: SourceConfig,
    cipher: Option<SessionCipher>,
    key_store: KeyExchangeStore,
    seq: Arc<SeqFile>,
    firmware: Option<FirmwareBuffer>,
    sink: Arc<Mutex<FrameSink>>,
    writer: SnapshotWriter,
    grant_tx: mpsc::Sender<()>,
    grant_rx: Option<mpsc::Receiver<()>>,
    record: Option<SharedRecordFile>,
    state: StateDict,
}

impl SessionController {
    pub fn new(
        config: SessionConfig,
        source_config: SourceConfig,
        sink: Arc<Mutex<FrameSink>>,
        writer: SnapshotWriter,
        record: Option<SharedRecordFile>,
    ) -> Self {
        let (grant_tx, grant_rx) = mpsc::channel(1);
        let mut key_store = KeyExchangeStore::new(&config.key_cache_path);
        let cipher = match &config.device_key {
            Some(key) => key_store.restore().and_then(|msg| {
                SessionCipher::new(key, &msg)
                    .inspect_err(|e| warn!("ignoring cached key exchange message: {e}"))
                    .ok()
            }),
            None => None,
        };
        let firmware = config
            .update_path
            .as_ref()
            .map(|path| FirmwareBuffer::new(path.clone()));
        let seq = Arc::new(SeqFile::new(&config.seq_path));
        let mut state = StateDict::default();
        state.set("passiveMode", config.mode == Mode::Passive);
        state.set("masterMode", config.mode == Mode::Master);
        if cipher.is_some() {
            state.set("cipher", "restored");
        }
        SessionController {
            config,
            source_config,
            cipher,
            key_store,
            seq,
            firmware,
            sink,
            writer,
            grant_tx,
            grant_rx: Some(grant_rx),
            record,
            state,
        }
    }

    pub fn has_cipher(&self) -> bool {
        self.cipher.is_some()
    }

    pub fn firmware(&self) -> Option<&FirmwareBuffer> {
        self.firmware.as_ref()
    }

    /// Start the master poll loop. Grants rotate through the slave list;
    /// each one cedes the bus until the slave acknowledges release or the
    /// grant times out, whichever comes first.
    pub fn spawn_master(&mut self, tracker: &TaskTracker, token: CancellationToken) {
        if self.config.mode != Mode::Master {
            return;
        }
        let Some(grant_rx) = self.grant_rx.take() else {
            warn!("master poll loop already running");
            return;
        };
        info!("starting master poll loop for {} slaves", self.config.slaves.len());
        tracker.spawn(run_master_poll(
            self.sink.clone(),
            self.seq.clone(),
            self.config.slaves.clone(),
            self.config.grant_timeout,
            self.config.poll_interval,
            grant_rx,
            token,
        ));
    }

    /// Read and handle frames until end of stream or cancellation.
    /// Network sources reconnect on end of stream instead of stopping.
    pub async fn run(
        &mut self,
        mut reader: FrameReader,
        token: CancellationToken,
    ) -> Result<(), SessionError> {
        let result = if self.config.mode == Mode::Commanding {
            self.run_commands(&mut reader).await
        } else {
            self.read_loop(&mut reader, token).await
        };
        self.shutdown()?;
        result
    }

    async fn read_loop(
        &mut self,
        reader: &mut FrameReader,
        token: CancellationToken,
    ) -> Result<(), SessionError> {
        loop {
            let read = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                read = reader.read_frame() => read,
            };
            if !read.msg.is_empty() {
                self.state.set("lastByteRead", Local::now().format("%H:%M:%S"));
                self.handle_raw(&read.msg).await?;
            }
            if read.eof {
                if self.source_config.is_network() && !token.is_cancelled() {
                    info!("connection closed, reopening listener");
                    let (source, sink) =
                        transport::open(&self.source_config, self.record.clone()).await?;
                    let mode = read_mode(self.config.mode, &self.source_config);
                    *self.sink.lock().await = sink;
                    *reader = FrameReader::new(source, mode, self.record.clone());
                    continue;
                }
                return Ok(());
            }
        }
    }

    /// Flush the firmware image and dump session state.
    fn shutdown(&mut self) -> Result<(), SessionError> {
        if let Some(firmware) = &self.firmware {
            firmware.save()?;
        }
        self.state.dump();
        Ok(())
    }

    /// Classify one raw frame, swallowing frame-level errors unless the
    /// session is configured to halt on them.
    pub async fn handle_raw(&mut self, msg: &[u8]) -> Result<(), SessionError> {
        if msg.iter().all(|b| *b == 0) {
            debug!("ignoring all-zero frame of {} bytes", msg.len());
            return Ok(());
        }
        match self.classify(msg).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_frame_error() => {
                match &e {
                    SessionError::Frame(FrameError::InvalidChecksum { .. }) => error!("{e}"),
                    _ => debug!("{e}"),
                }
                frame::dump_data(msg);
                if self.config.halt_on_error {
                    Err(e)
                } else {
                    Ok(())
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn classify(&mut self, msg: &[u8]) -> Result<(), SessionError> {
        let mut frame = frame::parse_frame(msg)?;
        // an encrypted envelope carries a complete inner frame; unwrap it
        // and classify that instead
        while frame.function == message::ENCRYPTED_ENVELOPE {
            let Some(cipher) = &self.cipher else {
                debug!("decryption key not yet available");
                return Ok(());
            };
            let (seq, plaintext) = cipher.decrypt(&frame.data)?;
            debug!("decrypted message with peer sequence {seq}");
            if plaintext.len() < MAGIC_LEN || plaintext[..MAGIC_LEN] != MAGIC {
                warn!("decrypted data lacks the magic prefix, discarding stale cipher");
                self.cipher = None;
                self.state.set("cipher", "discarded");
                return Ok(());
            }
            frame = frame::parse_frame(&plaintext[MAGIC_LEN..])?;
        }
        self.dispatch(frame).await
    }

    async fn dispatch(&mut self, frame: Frame) -> Result<(), SessionError> {
        match parse_message(&frame)? {
            Message::KeyExchange(data) => {
                match &self.config.device_key {
                    Some(key) => match SessionCipher::new(key, &data) {
                        Ok(cipher) => {
                            debug!("creating cipher from key exchange message");
                            self.cipher = Some(cipher);
                            self.key_store.save(&data);
                            self.state.set("cipher", "established");
                        }
                        Err(e) => warn!("ignoring key exchange message: {e}"),
                    },
                    None => info!("no device key configured, telemetry will stay encrypted"),
                }
                self.maybe_reply(&frame, message::RESP_ACK, &[]).await;
            }
            Message::PostData(snapshot) => {
                if !snapshot.is_empty() {
                    self.writer.write(&snapshot).await?;
                }
                self.maybe_reply(&frame, message::RESP_ACK, &[]).await;
            }
            Message::GetGmt => {
                let now = Local::now();
                let payload = TimePayload {
                    time: now.timestamp() as u32,
                    tz_offset: now.offset().local_minus_utc(),
                }
                .to_bytes()
                .expect("failed to serialize time payload");
                self.maybe_reply(&frame, message::RESP_SERVER_GMT, &payload)
                    .await;
            }
            Message::UpgradeWrite {
                offset,
                length,
                data,
            } => match &mut self.firmware {
                Some(firmware) => firmware.write(offset, length, &data)?,
                None => debug!("ignoring firmware write, no update file configured"),
            },
            Message::MasterGrantAck => {
                debug!("bus released by {:#010x}", frame.from_addr);
                // capacity-1 channel: a pending release is already enough
                let _ = self.grant_tx.try_send(());
            }
            Message::Ack => debug!("ack for sequence {}", frame.seq),
            Message::MasterGrant => debug!("bus granted to {:#010x}", frame.to_addr),
            // remaining messages are logged by the parser and carry no
            // session state
            _ => {}
        }
        Ok(())
    }

    /// Send a reply to an inbound frame, but only when this session is
    /// supposed to transmit at all. Replies echo the inbound sequence
    /// number and swap the addresses.
    async fn maybe_reply(&mut self, inbound: &Frame, function: u16, data: &[u8]) {
        if !matches!(self.config.mode, Mode::Server | Mode::Master) {
            return;
        }
        let msg =
            self.format_outbound(inbound.seq, inbound.to_addr, inbound.from_addr, function, data);
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.send_frame(&msg).await {
            error!("failed to send reply: {e}");
        }
    }

    /// Serialize an outbound frame, wrapping it in an encrypted envelope
    /// when a session cipher is active.
    fn format_outbound(
        &mut self,
        seq: u16,
        from_addr: u32,
        to_addr: u32,
        function: u16,
        data: &[u8],
    ) -> Vec<u8> {
        let msg = frame::format_frame(seq, from_addr, to_addr, function, data);
        match &mut self.cipher {
            Some(cipher) => {
                debug!("encrypting message");
                let mut plaintext = MAGIC.to_vec();
                plaintext.extend(&msg);
                let ciphertext = cipher.encrypt(&plaintext);
                frame::format_frame(
                    cipher.encrypt_seq.wrapping_add(1000),
                    ENVELOPE_ADDR,
                    BROADCAST_ADDR,
                    message::ENCRYPTED_ENVELOPE,
                    &ciphertext,
                )
            }
            None => msg,
        }
    }

    /// Commanding mode: issue each configured command to the single
    /// configured slave, reading one response per command.
    async fn run_commands(&mut self, reader: &mut FrameReader) -> Result<(), SessionError> {
        let Some(&slave) = self.config.slaves.first() else {
            warn!("commanding mode without a slave address");
            return Ok(());
        };
        let commands = self.config.commands.clone();
        for command in &commands {
            let seq = self.seq.next_seq();
            info!("sending command {:#06x} to {slave:#010x}", command.function);
            let msg = self.format_outbound(
                seq,
                MASTER_ADDR,
                slave,
                command.function,
                &command.param_bytes(),
            );
            self.sink.lock().await.send_frame(&msg).await?;
            if self.source_config.is_rs485() {
                self.grant_and_await_release(reader, slave).await?;
            }
            let read = reader.read_frame().await;
            if !read.msg.is_empty() {
                self.handle_raw(&read.msg).await?;
            }
            if read.eof {
                break;
            }
            sleep(self.config.command_delay).await;
        }
        Ok(())
    }

    /// On a shared bus a command is followed by a grant so the slave may
    /// answer; wait until it cedes the bus back (or the grant times out).
    async fn grant_and_await_release(
        &mut self,
        reader: &mut FrameReader,
        slave: u32,
    ) -> Result<(), SessionError> {
        let seq = self.seq.next_seq();
        let grant = frame::format_frame(seq, MASTER_ADDR, slave, message::POLESTAR_MASTER_GRANT, &[]);
        self.sink.lock().await.send_frame(&grant).await?;
        let wait = async {
            loop {
                let read = reader.read_frame().await;
                if !read.msg.is_empty()
                    && frame::parse_frame(&read.msg)
                        .map(|f| f.function == message::POLESTAR_MASTER_GRANT_ACK)
                        .unwrap_or(false)
                {
                    return;
                }
                if read.eof {
                    return;
                }
            }
        };
        if timeout(self.config.grant_timeout, wait).await.is_err() {
            debug!("no bus release from {slave:#010x} within {:?}", self.config.grant_timeout);
        }
        Ok(())
    }
}

async fn run_master_poll(
    sink: Arc<Mutex<FrameSink>>,
    seq: Arc<SeqFile>,
    slaves: Vec<u32>,
    grant_timeout: Duration,
    poll_interval: Duration,
    mut grant_rx: mpsc::Receiver<()>,
    token: CancellationToken,
) {
    loop {
        for &slave in &slaves {
            if token.is_cancelled() {
                return;
            }
            // drop any stale release left over from a previous grant
            while grant_rx.try_recv().is_ok() {}
            let grant = frame::format_frame(
                seq.next_seq(),
                MASTER_ADDR,
                slave,
                message::POLESTAR_MASTER_GRANT,
                &[],
            );
            {
                let mut sink = sink.lock().await;
                if let Err(e) = sink.send_frame(&grant).await {
                    error!("failed to send master grant: {e}");
                }
            }
            tokio::select! {
                _ = token.cancelled() => return,
                release = timeout(grant_timeout, grant_rx.recv()) => match release {
                    Ok(Some(())) => debug!("slave {slave:#010x} released the bus"),
                    Ok(None) => return,
                    Err(_) => debug!("no bus release from {slave:#010x} within {grant_timeout:?}"),
                },
            }
        }
        tokio::select! {
            _ = token.cancelled() => return,
            _ = sleep(poll_interval) => {}
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_command_parse() {
        let command = Command::parse("0012,b1,h5,l1a2b3c4").unwrap();
        assert_eq!(command.function, 0x0012);
        assert_eq!(
            command.params,
            vec![
                CommandParam::Byte(0x01),
                CommandParam::Half(0x0005),
                CommandParam::Long(0x01a2_b3c4),
            ]
        );
        assert_eq!(
            command.param_bytes(),
            vec![0x01, 0x05, 0x00, 0xc4, 0xb3, 0xa2, 0x01]
        );
    }

    #[test]
    fn test_command_parse_no_params() {
        let command = Command::parse("500").unwrap();
        assert_eq!(command.function, 0x0500);
        assert!(command.params.is_empty());
        assert!(command.param_bytes().is_empty());
    }

    #[test]
    fn test_command_parse_rejects_garbage() {
        assert!(matches!(
            Command::parse("zzz"),
            Err(CommandParseError::InvalidFunction(_))
        ));
        assert!(matches!(
            Command::parse("12,x5"),
            Err(CommandParseError::InvalidParam(_))
        ));
        assert!(matches!(
            Command::parse("12,b"),
            Err(CommandParseError::InvalidParam(_))
        ));
    }

    #[test]
    fn test_firmware_overlay_last_writer_wins() {
        let dir = tempfile::tempdir().unwrap();
        let mut firmware = FirmwareBuffer::new(dir.path().join("fw.bin"));
        firmware.write(0x10, 4, &[1, 1, 1, 1]).unwrap();
        firmware.write(0x12, 4, &[2, 2, 2, 2]).unwrap();
        assert_eq!(&firmware.as_bytes()[0x10..0x18], &[1, 1, 2, 2, 2, 2, 0, 0]);

        firmware.save().unwrap();
        let on_disk = std::fs::read(dir.path().join("fw.bin")).unwrap();
        assert_eq!(on_disk.len(), UPDATE_SIZE);
        assert_eq!(&on_disk[0x10..0x18], &[1, 1, 2, 2, 2, 2, 0, 0]);
    }

    #[test]
    fn test_firmware_rejects_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let mut firmware = FirmwareBuffer::new(dir.path().join("fw.bin"));
        assert!(matches!(
            firmware.write(UPDATE_SIZE as u32 - 2, 4, &[0; 4]),
            Err(SessionError::FirmwareOutOfRange { .. })
        ));
        assert!(matches!(
            firmware.write(u32::MAX, 1, &[0]),
            Err(SessionError::FirmwareOutOfRange { .. })
        ));
        // a write ending exactly at the boundary is fine
        firmware.write(UPDATE_SIZE as u32 - 4, 4, &[9; 4]).unwrap();
    }

    #[test]
    fn test_read_mode_selection() {
        let rs485 = SourceConfig::Serial {
            path: "/dev/ttyUSB0".into(),
            baud: 115200,
            rs485: true,
        };
        let rs232 = SourceConfig::Serial {
            path: "/dev/ttyUSB0".into(),
            baud: 115200,
            rs485: false,
        };
        let network = SourceConfig::Network { ports: vec![22222] };
        assert_eq!(read_mode(Mode::Master, &rs485), ReadMode::Passive);
        assert_eq!(read_mode(Mode::Commanding, &rs232), ReadMode::Active);
        assert_eq!(read_mode(Mode::Server, &network), ReadMode::Active);
        assert_eq!(read_mode(Mode::Passive, &network), ReadMode::Passive);
    }
}
