//! The assembly buffer: a single contiguous in-memory byte buffer that the
//! collector writes verified pieces into at disjoint, index-addressed
//! slots. Owned exclusively by the collector — workers never touch it.

use std::io::Write;
use std::path::Path;

pub struct AssemblyBuffer {
    bytes: Vec<u8>,
    piece_length: u64,
    total_length: u64,
}

impl AssemblyBuffer {
    pub fn new(total_length: u64, piece_length: u64) -> AssemblyBuffer {
        AssemblyBuffer {
            bytes: vec![0u8; total_length as usize],
            piece_length,
            total_length,
        }
    }

    /// Writes a verified piece's bytes into its slot: `[i*piece_length,
    /// min(i*piece_length + piece_length, total_length))`.
    pub fn write_piece(&mut self, index: usize, piece: &[u8]) {
        let begin = index as u64 * self.piece_length;
        let end = (begin + self.piece_length).min(self.total_length);
        let begin = begin as usize;
        let end = end as usize;
        self.bytes[begin..end].copy_from_slice(&piece[..end - begin]);
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn save_to_file(bytes: &[u8], path: &Path) -> std::io::Result<()> {
        let mut file = std::fs::File::create(path)?;
        file.write_all(bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_land_in_disjoint_slots() {
        let mut buf = AssemblyBuffer::new(10, 4);
        buf.write_piece(0, &[1, 2, 3, 4]);
        buf.write_piece(1, &[5, 6, 7, 8]);
        buf.write_piece(2, &[9, 9]); // short last piece
        assert_eq!(buf.into_bytes(), vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 9]);
    }

    #[test]
    fn save_to_file_writes_exact_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        AssemblyBuffer::save_to_file(&[1, 2, 3], &path).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), vec![1, 2, 3]);
    }
}
