//! Persistent outbound sequence numbers.
//!
//! Outbound frames carry a 16-bit sequence number that survives process
//! restarts, so the cloud side never sees the counter jump backwards. The
//! counter lives in a small ASCII file and wraps from 65535 back to 1.

use std::path::PathBuf;

use log::warn;

pub const DEFAULT_SEQ_FILE: &str = "seseq.txt";

pub struct SeqFile {
    path: PathBuf,
}

impl SeqFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        SeqFile { path: path.into() }
    }

    /// Allocate the next sequence number and persist it. An unreadable or
    /// malformed file restarts the counter at 1.
    pub fn next_seq(&self) -> u16 {
        let last = std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|s| s.trim().parse::<u16>().ok())
            .unwrap_or(0);
        let seq = if last == u16::MAX { 1 } else { last + 1 };
        if let Err(e) = std::fs::write(&self.path, format!("{seq}\n")) {
            warn!("failed to persist sequence number to {:?}: {e}", self.path);
        }
        seq
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_starts_at_one_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let seq = SeqFile::new(dir.path().join(DEFAULT_SEQ_FILE));
        assert_eq!(seq.next_seq(), 1);
        assert_eq!(seq.next_seq(), 2);
    }

    #[test]
    fn test_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_SEQ_FILE);
        assert_eq!(SeqFile::new(&path).next_seq(), 1);
        assert_eq!(SeqFile::new(&path).next_seq(), 2);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "2\n");
    }

    #[test]
    fn test_wraps_to_one() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_SEQ_FILE);
        std::fs::write(&path, "65535\n").unwrap();
        let seq = SeqFile::new(&path);
        assert_eq!(seq.next_seq(), 1);
    }

    #[test]
    fn test_malformed_file_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_SEQ_FILE);
        std::fs::write(&path, "not a number\n").unwrap();
        assert_eq!(SeqFile::new(&path).next_seq(), 1);
    }

    #[test]
    fn test_monotonic_over_many_calls() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(DEFAULT_SEQ_FILE), "65530\n").unwrap();
        let seq = SeqFile::new(dir.path().join(DEFAULT_SEQ_FILE));
        let values: Vec<u16> = (0..8).map(|_| seq.next_seq()).collect();
        assert_eq!(values, vec![65531, 65532, 65533, 65534, 65535, 1, 2, 3]);
    }
}
