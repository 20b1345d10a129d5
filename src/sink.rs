use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::ApplicationError;

/// Destination for verified pieces. Pieces may arrive in any order, each
/// exactly once.
pub trait OutputSink: Send {
    fn write_piece(&mut self, index: u32, data: &[u8]) -> Result<(), ApplicationError>;
}

/// Writes pieces at their offset in a file sized to the whole torrent
pub struct FileSink {
    file:         File,
    piece_length: u64,
}

impl FileSink {
    pub fn create(
        path:         impl AsRef<Path>,
        total_length: u64,
        piece_length: u64,
    ) -> Result<Self, ApplicationError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        file.set_len(total_length)?;
        Ok(Self { file, piece_length })
    }
}

impl OutputSink for FileSink {
    fn write_piece(&mut self, index: u32, data: &[u8]) -> Result<(), ApplicationError> {
        self.file
            .seek(SeekFrom::Start(index as u64 * self.piece_length))?;
        self.file.write_all(data)?;
        self.file.flush()?;
        Ok(())
    }
}

/// Keeps pieces in memory, keyed by index
#[derive(Debug, Default)]
pub struct MemorySink {
    pub pieces: BTreeMap<u32, Vec<u8>>,
    /// Number of writes seen, to catch duplicates
    pub writes: usize,
}

impl MemorySink {
    /// Concatenates the stored pieces in index order.
    pub fn assembled(&self) -> Vec<u8> {
        self.pieces.values().flatten().copied().collect()
    }
}

impl OutputSink for MemorySink {
    fn write_piece(&mut self, index: u32, data: &[u8]) -> Result<(), ApplicationError> {
        self.writes += 1;
        self.pieces.insert(index, data.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_sink_places_pieces_by_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");

        let mut sink = FileSink::create(&path, 10, 4).unwrap();
        sink.write_piece(2, &[9, 9]).unwrap();
        sink.write_piece(0, &[1, 2, 3, 4]).unwrap();
        sink.write_piece(1, &[5, 6, 7, 8]).unwrap();
        drop(sink);

        assert_eq!(std::fs::read(&path).unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 9]);
    }

    #[test]
    fn memory_sink_assembles_in_index_order() {
        let mut sink = MemorySink::default();
        sink.write_piece(1, b"world").unwrap();
        sink.write_piece(0, b"hello ").unwrap();
        assert_eq!(sink.assembled(), b"hello world");
        assert_eq!(sink.writes, 2);
    }
}
