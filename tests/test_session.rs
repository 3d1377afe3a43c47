//! End-to-end session tests: framed byte streams in, replies and NDJSON
//! telemetry out.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use deku::DekuContainerWrite;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use semonitor::crypto::{KEY_EXCHANGE_LEN, SessionCipher};
use semonitor::frame::{self, BROADCAST_ADDR, ENVELOPE_ADDR, MAGIC, MASTER_ADDR};
use semonitor::message;
use semonitor::ndjson::SnapshotWriter;
use semonitor::records::{DEV_OPTIMIZER_PACKED, DeviceHeader};
use semonitor::session::{Mode, SessionConfig, SessionController};
use semonitor::transport::{ByteSource, FrameReader, FrameSink, ReadMode};

const INVERTER_ADDR: u32 = 0x7f10_4920;

fn file_source_config() -> semonitor::transport::SourceConfig {
    semonitor::transport::SourceConfig::File {
        path: "capture.dat".to_string(),
        follow: false,
    }
}

fn packed_optimizer_device() -> Vec<u8> {
    let mut body = vec![0u8; 13];
    body[..4].copy_from_slice(&1400000000u32.to_le_bytes());
    body[4..6].copy_from_slice(&60u16.to_le_bytes());
    body[6..13].copy_from_slice(&[0x00, 0x05, 0x14, 0x04, 0x10, 0x00, 0x14]);
    let mut data = DeviceHeader {
        se_type: DEV_OPTIMIZER_PACKED,
        se_id: 0x100f_7220,
        dev_len: 13,
    }
    .to_bytes()
    .unwrap();
    data.extend(body);
    data
}

fn with_magic(msg: &[u8]) -> Vec<u8> {
    let mut bytes = MAGIC.to_vec();
    bytes.extend(msg);
    bytes
}

struct Harness {
    controller: SessionController,
    sink_capture: tokio::io::DuplexStream,
    writer_capture: tokio::io::DuplexStream,
}

fn harness(config: SessionConfig) -> Harness {
    let (sink_writer, sink_capture) = tokio::io::duplex(1 << 16);
    let (json_writer, writer_capture) = tokio::io::duplex(1 << 16);
    let sink = Arc::new(Mutex::new(FrameSink::new(
        Some(Box::new(sink_writer)),
        None,
        "test",
    )));
    let writer = SnapshotWriter::new(Box::new(json_writer));
    let controller =
        SessionController::new(config, file_source_config(), sink, writer, None);
    Harness {
        controller,
        sink_capture,
        writer_capture,
    }
}

fn reader_for(stream: Vec<u8>, mode: ReadMode) -> FrameReader {
    FrameReader::new(
        ByteSource::from_reader(Box::new(Cursor::new(stream)), "test", false),
        mode,
        None,
    )
}

async fn read_all(mut capture: tokio::io::DuplexStream) -> Vec<u8> {
    let mut bytes = Vec::new();
    capture.read_to_end(&mut bytes).await.unwrap();
    bytes
}

async fn parse_captured_frames(bytes: Vec<u8>) -> Vec<frame::Frame> {
    let mut reader = reader_for(bytes, ReadMode::Active);
    let mut frames = Vec::new();
    loop {
        let read = reader.read_frame().await;
        if !read.msg.is_empty() {
            frames.push(frame::parse_frame(&read.msg).unwrap());
        }
        if read.eof {
            return frames;
        }
    }
}

#[tokio::test]
async fn test_server_session_with_encryption() {
    let dir = tempfile::tempdir().unwrap();
    let config = SessionConfig {
        mode: Mode::Server,
        device_key: Some([0u8; 16]),
        seq_path: dir.path().join("seseq.txt"),
        key_cache_path: dir.path().join("last0503.msg"),
        ..SessionConfig::default()
    };

    // the inverter's side of the session, sharing the all-zero exchange
    let mut inverter_cipher = SessionCipher::new(&[0u8; 16], &[0u8; KEY_EXCHANGE_LEN]).unwrap();

    let mut stream = Vec::new();
    stream.extend(with_magic(&frame::format_frame(
        1,
        INVERTER_ADDR,
        MASTER_ADDR,
        message::KEY_EXCHANGE,
        &[0u8; KEY_EXCHANGE_LEN],
    )));
    let inner = frame::format_frame(
        2,
        INVERTER_ADDR,
        MASTER_ADDR,
        message::SERVER_POST_DATA,
        &packed_optimizer_device(),
    );
    let ciphertext = inverter_cipher.encrypt(&with_magic(&inner));
    stream.extend(with_magic(&frame::format_frame(
        3,
        ENVELOPE_ADDR,
        BROADCAST_ADDR,
        message::ENCRYPTED_ENVELOPE,
        &ciphertext,
    )));
    stream.extend(with_magic(&frame::format_frame(
        4,
        INVERTER_ADDR,
        MASTER_ADDR,
        message::SERVER_GET_GMT,
        &[],
    )));

    let Harness {
        mut controller,
        sink_capture,
        writer_capture,
    } = harness(config);
    controller
        .run(reader_for(stream, ReadMode::Active), CancellationToken::new())
        .await
        .unwrap();
    assert!(controller.has_cipher());
    drop(controller);

    // one telemetry line came out
    let json = read_all(writer_capture).await;
    let lines: Vec<serde_json::Value> = String::from_utf8(json)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 1);
    let optimizer = &lines[0]["optimizers"]["100F7220"];
    assert_eq!(optimizer["Vmod"], 32.0);
    assert_eq!(optimizer["Vopt"], 32.125);
    assert_eq!(optimizer["ID"], "100F7220");

    // the server replied to all three messages, encrypted because the
    // cipher was installed before the first reply went out
    let replies = parse_captured_frames(read_all(sink_capture).await).await;
    assert_eq!(replies.len(), 3);
    let mut inner_functions = Vec::new();
    for reply in &replies {
        assert_eq!(reply.function, message::ENCRYPTED_ENVELOPE);
        assert_eq!(reply.from_addr, ENVELOPE_ADDR);
        let (_, plaintext) = inverter_cipher.decrypt(&reply.data).unwrap();
        assert_eq!(plaintext[..4], MAGIC);
        let inner = frame::parse_frame(&plaintext[4..]).unwrap();
        inner_functions.push(inner.function);
        if inner.function == message::RESP_SERVER_GMT {
            assert_eq!(inner.data.len(), 8);
            // replies echo the inbound sequence and swap addresses
            assert_eq!(inner.seq, 4);
            assert_eq!(inner.to_addr, INVERTER_ADDR);
        }
    }
    assert_eq!(
        inner_functions,
        vec![message::RESP_ACK, message::RESP_ACK, message::RESP_SERVER_GMT]
    );
}

#[tokio::test]
async fn test_passive_session_never_transmits() {
    let dir = tempfile::tempdir().unwrap();
    let config = SessionConfig {
        mode: Mode::Passive,
        seq_path: dir.path().join("seseq.txt"),
        key_cache_path: dir.path().join("last0503.msg"),
        ..SessionConfig::default()
    };

    let mut stream = Vec::new();
    stream.extend(with_magic(&frame::format_frame(
        1,
        INVERTER_ADDR,
        MASTER_ADDR,
        message::SERVER_POST_DATA,
        &packed_optimizer_device(),
    )));
    stream.extend(with_magic(&frame::format_frame(
        2,
        INVERTER_ADDR,
        MASTER_ADDR,
        message::SERVER_GET_GMT,
        &[],
    )));

    let Harness {
        mut controller,
        sink_capture,
        writer_capture,
    } = harness(config);
    controller
        .run(reader_for(stream, ReadMode::Passive), CancellationToken::new())
        .await
        .unwrap();
    drop(controller);

    // telemetry still flows, but nothing is written back
    let json = read_all(writer_capture).await;
    assert_eq!(String::from_utf8(json).unwrap().lines().count(), 1);
    assert!(read_all(sink_capture).await.is_empty());
}

#[tokio::test]
async fn test_firmware_reassembly() {
    let dir = tempfile::tempdir().unwrap();
    let update_path = dir.path().join("firmware.bin");
    let config = SessionConfig {
        mode: Mode::Passive,
        update_path: Some(update_path.clone()),
        seq_path: dir.path().join("seseq.txt"),
        key_cache_path: dir.path().join("last0503.msg"),
        ..SessionConfig::default()
    };

    let mut stream = Vec::new();
    for (offset, data) in [(0x10u32, vec![0xaa; 4]), (0x12u32, vec![0xbb; 4])] {
        let mut payload = Vec::new();
        payload.extend(offset.to_le_bytes());
        payload.extend((data.len() as u32).to_le_bytes());
        payload.extend(&data);
        stream.extend(with_magic(&frame::format_frame(
            1,
            MASTER_ADDR,
            INVERTER_ADDR,
            message::UPGRADE_WRITE,
            &payload,
        )));
    }

    let Harness { mut controller, .. } = harness(config);
    controller
        .run(reader_for(stream, ReadMode::Passive), CancellationToken::new())
        .await
        .unwrap();

    // last writer wins in the overlap; the image is flushed at shutdown
    let image = std::fs::read(&update_path).unwrap();
    assert_eq!(image.len(), 0x80000);
    assert_eq!(
        &image[0x10..0x18],
        &[0xaa, 0xaa, 0xbb, 0xbb, 0xbb, 0xbb, 0x00, 0x00]
    );
}

#[tokio::test]
async fn test_stale_cipher_is_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let config = SessionConfig {
        mode: Mode::Passive,
        device_key: Some([0u8; 16]),
        seq_path: dir.path().join("seseq.txt"),
        key_cache_path: dir.path().join("last0503.msg"),
        ..SessionConfig::default()
    };
    let Harness { mut controller, .. } = harness(config);

    let key_exchange = frame::format_frame(
        1,
        INVERTER_ADDR,
        MASTER_ADDR,
        message::KEY_EXCHANGE,
        &[0u8; KEY_EXCHANGE_LEN],
    );
    controller.handle_raw(&key_exchange).await.unwrap();
    assert!(controller.has_cipher());

    // an envelope enciphered under a different exchange decrypts to
    // garbage; the missing magic prefix proves the cipher is stale
    let mut other = SessionCipher::new(&[0u8; 16], &[0x55; KEY_EXCHANGE_LEN]).unwrap();
    let ciphertext = other.encrypt(&with_magic(&frame::format_frame(
        2,
        INVERTER_ADDR,
        MASTER_ADDR,
        message::SERVER_GET_GMT,
        &[],
    )));
    let envelope = frame::format_frame(
        3,
        ENVELOPE_ADDR,
        BROADCAST_ADDR,
        message::ENCRYPTED_ENVELOPE,
        &ciphertext,
    );
    controller.handle_raw(&envelope).await.unwrap();
    assert!(!controller.has_cipher());
}

#[tokio::test]
async fn test_all_zero_frames_are_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let config = SessionConfig {
        mode: Mode::Passive,
        halt_on_error: true,
        seq_path: dir.path().join("seseq.txt"),
        key_cache_path: dir.path().join("last0503.msg"),
        ..SessionConfig::default()
    };
    let Harness { mut controller, .. } = harness(config);
    // would be a length/checksum error if it were parsed at all
    controller.handle_raw(&[0u8; 64]).await.unwrap();
}

#[tokio::test]
async fn test_halt_on_error_propagates_parse_failures() {
    let dir = tempfile::tempdir().unwrap();
    let mut corrupt = frame::format_frame(1, 2, 3, 0x0080, &[]);
    let last = corrupt.len() - 1;
    corrupt[last] ^= 0xff;

    // checksum failures are swallowed by default
    let Harness { mut controller, .. } = harness(SessionConfig {
        mode: Mode::Passive,
        seq_path: dir.path().join("seseq.txt"),
        key_cache_path: dir.path().join("last0503.msg"),
        ..SessionConfig::default()
    });
    controller.handle_raw(&corrupt).await.unwrap();

    // but upgraded to a session error with halt_on_error
    let Harness { mut controller, .. } = harness(SessionConfig {
        mode: Mode::Passive,
        halt_on_error: true,
        seq_path: dir.path().join("seseq.txt"),
        key_cache_path: dir.path().join("last0503.msg"),
        ..SessionConfig::default()
    });
    assert!(controller.handle_raw(&corrupt).await.is_err());
}

#[tokio::test]
async fn test_master_polling_rotates_slaves() {
    let dir = tempfile::tempdir().unwrap();
    let config = SessionConfig {
        mode: Mode::Master,
        slaves: vec![0xaaaa, 0xbbbb],
        grant_timeout: Duration::from_millis(20),
        poll_interval: Duration::from_millis(10),
        seq_path: dir.path().join("seseq.txt"),
        key_cache_path: dir.path().join("last0503.msg"),
        ..SessionConfig::default()
    };
    let Harness {
        mut controller,
        sink_capture,
        writer_capture: _writer_capture,
    } = harness(config);

    let tracker = TaskTracker::new();
    let token = CancellationToken::new();
    controller.spawn_master(&tracker, token.clone());

    // no slave ever acknowledges, so polling degrades to a fixed-rate
    // rotation bounded by the grant timeout
    tokio::time::sleep(Duration::from_millis(160)).await;
    token.cancel();
    tracker.close();
    tracker.wait().await;
    drop(controller);

    let grants = parse_captured_frames(read_all(sink_capture).await).await;
    assert!(grants.len() >= 4, "only {} grants sent", grants.len());
    let mut last_seq = 0u16;
    for (i, grant) in grants.iter().enumerate() {
        assert_eq!(grant.function, message::POLESTAR_MASTER_GRANT);
        assert_eq!(grant.from_addr, MASTER_ADDR);
        let expected = if i % 2 == 0 { 0xaaaa } else { 0xbbbb };
        assert_eq!(grant.to_addr, expected, "grant {i} out of rotation");
        assert!(grant.seq > last_seq, "sequence numbers must increase");
        last_seq = grant.seq;
    }
}
