pub mod crc;
pub mod crypto;
pub mod frame;
pub mod message;
pub mod ndjson;
pub mod records;
pub mod seqfile;
pub mod session;
pub mod transport;

// development tool for decoding unknown device types; not in release builds
#[cfg(feature = "explorer")]
pub mod explorer;
