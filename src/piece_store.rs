//! The piece store: accumulates incoming sub-pieces into per-piece buffers,
//! verifies completed pieces against their SHA-1, scatter-writes them to the
//! output files, and evicts cached buffers under memory pressure.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    sync::Mutex,
};

use rand::seq::SliceRandom;
use sha1::{Digest, Sha1};

use crate::{
    bitfield::Bitfield,
    block_count, block_len,
    metainfo::Torrent,
    storage::{self, FileInfo},
    PieceIndex, BLOCK_LEN,
};

/// A caller violated the `save` protocol contract (the only error the
/// piece store itself can produce; hash/disk failures reset the piece
/// instead of erroring, per the spec's error taxonomy).
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SaveError {
    #[error("sub-piece end {end} exceeds piece length {piece_len}")]
    OffsetOverflow { end: u64, piece_len: u32 },
    #[error("piece index {index} is out of range ({piece_count} pieces)")]
    InvalidPieceIndex { index: PieceIndex, piece_count: usize },
}

/// A single piece's in-progress download state.
struct Piece {
    expected_hash: crate::Sha1Hash,
    len: u32,
    /// One bit per sub-piece (block); set once that block has been received
    /// and copied into `buffer`.
    completed_mask: Bitfield,
    /// Lazily allocated on the first received block, dropped once evicted
    /// or on a failed verification.
    buffer: Option<Vec<u8>>,
    on_disk: bool,
}

impl Piece {
    fn new(expected_hash: crate::Sha1Hash, len: u32) -> Self {
        Self {
            expected_hash,
            len,
            completed_mask: Bitfield::new(block_count(len)),
            buffer: None,
            on_disk: false,
        }
    }

    fn is_complete(&self) -> bool {
        self.completed_mask.all()
    }

    /// Marks the whole piece as verified without ever buffering it, used by
    /// the startup re-verification pass.
    fn mark_verified_from_disk(&mut self) {
        self.completed_mask.fill(true);
        self.on_disk = true;
        self.buffer = None;
    }

    fn reset(&mut self) {
        self.completed_mask = Bitfield::new(block_count(self.len));
    }
}

/// The outcome of a single `save` call, for the caller (the peer session)
/// to react to: whether the piece it belonged to just finished verifying.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaveOutcome {
    /// The block was accepted (or was a duplicate of an already-completed
    /// block, a no-op).
    Accepted,
    /// This was the piece's last missing block, and the piece verified and
    /// was written to disk.
    PieceVerified,
    /// This was the piece's last missing block, but the hash didn't match;
    /// the piece has been reset and will be re-downloaded from scratch.
    PieceFailedVerification,
}

/// Owns every piece's state and the torrent's output file handles.
pub struct PieceStore {
    pieces: Vec<Piece>,
    files: Vec<Mutex<File>>,
    file_infos: Vec<FileInfo>,
    piece_length: u32,
}

impl PieceStore {
    /// Creates the on-disk file layout (creating files and truncating them
    /// to their declared length) and runs the best-effort startup
    /// re-verification pass over every piece.
    pub fn new(torrent: &Torrent, download_dir: &std::path::Path) -> io::Result<Self> {
        let base_dir = if torrent.is_archive() {
            download_dir.join(&torrent.name)
        } else {
            download_dir.to_path_buf()
        };

        let mut files = Vec::with_capacity(torrent.files.len());
        let mut file_infos = Vec::with_capacity(torrent.files.len());
        for file in &torrent.files {
            let path = base_dir.join(&file.path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let handle = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)?;
            handle.set_len(file.len)?;
            files.push(Mutex::new(handle));
            file_infos.push(FileInfo {
                path,
                len: file.len,
                offset: file.offset,
            });
        }

        let pieces = torrent
            .pieces
            .iter()
            .enumerate()
            .map(|(i, hash)| Piece::new(*hash, torrent.piece_len(i)))
            .collect();

        let mut store = Self {
            pieces,
            files,
            file_infos,
            piece_length: torrent.piece_length,
        };
        store.verify_from_disk();
        Ok(store)
    }

    /// Best-effort re-verification of every piece from whatever is already
    /// on disk, without ever buffering a piece in RAM. Any I/O failure for a
    /// given piece just leaves it empty; it isn't fatal to the process.
    fn verify_from_disk(&mut self) {
        for index in 0..self.pieces.len() {
            match self.read_piece(index) {
                Ok(buf) => {
                    let digest = Sha1::digest(&buf);
                    if digest.as_slice() == &self.pieces[index].expected_hash[..] {
                        self.pieces[index].mark_verified_from_disk();
                        log::debug!("Piece {} verified clean from disk", index);
                    }
                }
                Err(e) => {
                    log::debug!("Piece {} startup read failed: {}", index, e);
                }
            }
        }
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Returns true if the piece has been verified and written to disk.
    pub fn is_complete(&self, index: PieceIndex) -> bool {
        self.pieces[index].on_disk
    }

    /// Returns true once every piece in the torrent has been verified.
    pub fn all_complete(&self) -> bool {
        self.pieces.iter().all(|p| p.on_disk)
    }

    pub fn completed_count(&self) -> usize {
        self.pieces.iter().filter(|p| p.on_disk).count()
    }

    /// The first sub-piece offset at or after `hint` within `index` that is
    /// not yet complete.
    ///
    /// # Panics
    ///
    /// Panics if the piece has no incomplete sub-piece at or after `hint`;
    /// per the spec this means the caller violated its precondition that
    /// the piece isn't already fully downloaded.
    pub fn first_incomplete_after(&self, index: PieceIndex, hint: u32) -> (u32, u32) {
        let piece = &self.pieces[index];
        let start_block = (hint / BLOCK_LEN) as usize;
        for block in start_block..block_count(piece.len) {
            if !piece.completed_mask.get(block) {
                let offset = block as u32 * BLOCK_LEN;
                return (offset, block_len(piece.len, block));
            }
        }
        panic!(
            "first_incomplete_after({}, {}) called on a piece with no incomplete blocks",
            index, hint
        );
    }

    /// Ingests a received sub-piece. Idempotent: a sub-piece offset that has
    /// already been completed is silently discarded.
    pub fn save(
        &mut self,
        index: PieceIndex,
        offset: u32,
        data: &[u8],
    ) -> Result<SaveOutcome, SaveError> {
        if index >= self.pieces.len() {
            return Err(SaveError::InvalidPieceIndex {
                index,
                piece_count: self.pieces.len(),
            });
        }
        let piece_len = self.pieces[index].len;
        let end = offset as u64 + data.len() as u64;
        if end > piece_len as u64 {
            return Err(SaveError::OffsetOverflow { end, piece_len });
        }

        let block = (offset / BLOCK_LEN) as usize;
        let piece = &mut self.pieces[index];
        if piece.completed_mask.get(block) {
            return Ok(SaveOutcome::Accepted);
        }

        let buffer = piece.buffer.get_or_insert_with(|| vec![0u8; piece_len as usize]);
        buffer[offset as usize..offset as usize + data.len()].copy_from_slice(data);
        piece.completed_mask.set(block, true);

        if !piece.is_complete() {
            return Ok(SaveOutcome::Accepted);
        }

        let buffer = piece.buffer.as_ref().expect("just populated above");
        let digest = Sha1::digest(buffer);
        if digest.as_slice() != &piece.expected_hash[..] {
            log::warn!(
                "Piece {} failed verification, resetting (expected {}, got {})",
                index,
                hex::encode(piece.expected_hash),
                hex::encode(digest)
            );
            self.pieces[index].reset();
            return Ok(SaveOutcome::PieceFailedVerification);
        }

        let torrent_offset = index as u64 * self.piece_length as u64;
        let buffer = self.pieces[index].buffer.take().expect("verified above");
        match self.write_piece(torrent_offset, &buffer) {
            Ok(()) => {
                let piece = &mut self.pieces[index];
                piece.buffer = Some(buffer);
                piece.on_disk = true;
                log::info!("Piece {} verified and written to disk", index);
                Ok(SaveOutcome::PieceVerified)
            }
            Err(e) => {
                log::warn!("Piece {} disk write failed: {}, resetting", index, e);
                self.pieces[index].reset();
                Ok(SaveOutcome::PieceFailedVerification)
            }
        }
    }

    /// Scatter-writes `buf` (exactly one piece's worth of bytes) to the
    /// files it overlaps with.
    fn write_piece(&self, torrent_offset: u64, buf: &[u8]) -> io::Result<()> {
        let range = torrent_offset..torrent_offset + buf.len() as u64;
        let file_range = storage::files_intersecting(&self.file_infos, range);
        let mut written = 0usize;
        for file_index in file_range {
            let file_info = &self.file_infos[file_index];
            let slice = file_info.slice(torrent_offset + written as u64, buf.len() as u64 - written as u64);
            let chunk = &buf[written..written + slice.len as usize];
            let mut handle = self.files[file_index]
                .lock()
                .expect("file mutex poisoned");
            handle.seek(SeekFrom::Start(slice.offset))?;
            handle.write_all(chunk)?;
            written += slice.len as usize;
        }
        Ok(())
    }

    /// Gather-reads one piece's worth of bytes from the files it overlaps
    /// with, for the startup re-verification pass.
    fn read_piece(&self, index: PieceIndex) -> io::Result<Vec<u8>> {
        let piece_len = self.pieces[index].len;
        let torrent_offset = index as u64 * self.piece_length as u64;
        let mut buf = vec![0u8; piece_len as usize];
        let range = torrent_offset..torrent_offset + piece_len as u64;
        let file_range = storage::files_intersecting(&self.file_infos, range);
        let mut read = 0usize;
        for file_index in file_range {
            let file_info = &self.file_infos[file_index];
            let slice = file_info.slice(torrent_offset + read as u64, piece_len as u64 - read as u64);
            let chunk = &mut buf[read..read + slice.len as usize];
            let mut handle = self.files[file_index]
                .lock()
                .expect("file mutex poisoned");
            handle.seek(SeekFrom::Start(slice.offset))?;
            handle.read_exact(chunk)?;
            read += slice.len as usize;
        }
        Ok(buf)
    }

    /// The total byte length of all pieces that are on disk and still hold
    /// a cached buffer.
    pub fn cached_bytes(&self) -> u64 {
        self.pieces
            .iter()
            .filter(|p| p.on_disk && p.buffer.is_some())
            .map(|p| p.len as u64)
            .sum()
    }

    /// If the cached-buffer budget is exceeded, drops the buffers of a
    /// randomly chosen half of the on-disk, still-cached pieces.
    pub fn evict_if_over_budget(&mut self, cap: u64) {
        if self.cached_bytes() <= cap {
            return;
        }
        let mut candidates: Vec<usize> = self
            .pieces
            .iter()
            .enumerate()
            .filter(|(_, p)| p.on_disk && p.buffer.is_some())
            .map(|(i, _)| i)
            .collect();
        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(candidates.len() / 2);
        for index in candidates {
            self.pieces[index].buffer = None;
        }
    }

    /// Returns the indices of pieces that are incomplete and present in
    /// `peer_bitfield`.
    pub fn downloadable_from(&self, peer_bitfield: &Bitfield) -> Vec<PieceIndex> {
        (0..self.pieces.len())
            .filter(|&i| !self.pieces[i].on_disk && peer_bitfield.get(i))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::{Info, Metainfo, RawFile};
    use pretty_assertions::assert_eq;
    use serde_bytes::ByteBuf;
    use tempfile::tempdir;

    fn torrent_two_pieces_two_files() -> Torrent {
        // piece_length = 32768, 2 pieces, file A = 20000 bytes, file B = 45536
        // bytes, total 65536 bytes (matches the spec's end-to-end scenario).
        let piece0 = vec![0u8; 32768];
        let piece1 = vec![1u8; 32768];
        let mut pieces = Vec::new();
        pieces.extend_from_slice(Sha1::digest(&piece0).as_slice());
        pieces.extend_from_slice(Sha1::digest(&piece1).as_slice());

        let metainfo = Metainfo {
            info: Info {
                name: "archive".into(),
                pieces: ByteBuf::from(pieces),
                piece_length: 32768,
                length: None,
                files: Some(vec![
                    RawFile { path: vec!["a.bin".into()], length: 20000 },
                    RawFile { path: vec!["b.bin".into()], length: 45536 },
                ]),
                private: None,
            },
            announce: None,
            announce_list: None,
        };
        metainfo.into_torrent().unwrap()
    }

    #[test]
    fn save_is_idempotent_for_a_repeated_subpiece() {
        let torrent = torrent_two_pieces_two_files();
        let dir = tempdir().unwrap();
        let mut store = PieceStore::new(&torrent, dir.path()).unwrap();

        let data = vec![7u8; 16384];
        store.save(0, 0, &data).unwrap();
        let count_after_first = store.pieces[0].completed_mask.count_ones();
        store.save(0, 0, &data).unwrap();
        assert_eq!(store.pieces[0].completed_mask.count_ones(), count_after_first);
    }

    #[test]
    fn piece_spanning_two_files_scatters_correctly() {
        let torrent = torrent_two_pieces_two_files();
        let dir = tempdir().unwrap();
        let mut store = PieceStore::new(&torrent, dir.path()).unwrap();

        let piece0 = vec![0u8; 32768];
        let outcome1 = store.save(0, 0, &piece0[0..16384]).unwrap();
        assert_eq!(outcome1, SaveOutcome::Accepted);
        let outcome2 = store.save(0, 16384, &piece0[16384..32768]).unwrap();
        assert_eq!(outcome2, SaveOutcome::PieceVerified);
        assert!(store.is_complete(0));

        let mut file_a = fs::File::open(dir.path().join("archive/a.bin")).unwrap();
        let mut buf_a = vec![0u8; 20000];
        file_a.read_exact(&mut buf_a).unwrap();
        assert_eq!(buf_a, piece0[0..20000]);

        let mut file_b = fs::File::open(dir.path().join("archive/b.bin")).unwrap();
        let mut buf_b = vec![0u8; 12768];
        file_b.read_exact(&mut buf_b).unwrap();
        assert_eq!(buf_b, piece0[20000..32768]);
    }

    #[test]
    fn verification_failure_resets_the_mask_and_offset_restarts_at_zero() {
        let torrent = torrent_two_pieces_two_files();
        let dir = tempdir().unwrap();
        let mut store = PieceStore::new(&torrent, dir.path()).unwrap();

        store.save(1, 0, &vec![1u8; 16384]).unwrap();
        // corrupted second half: wrong bytes, right length
        let outcome = store.save(1, 16384, &vec![0xFFu8; 16384]).unwrap();
        assert_eq!(outcome, SaveOutcome::PieceFailedVerification);
        assert!(!store.is_complete(1));
        assert_eq!(store.first_incomplete_after(1, 0), (0, 16384));
    }

    #[test]
    fn offset_overflow_is_a_protocol_error() {
        let torrent = torrent_two_pieces_two_files();
        let dir = tempdir().unwrap();
        let mut store = PieceStore::new(&torrent, dir.path()).unwrap();
        let err = store.save(0, 32760, &vec![0u8; 100]).unwrap_err();
        assert_eq!(err, SaveError::OffsetOverflow { end: 32860, piece_len: 32768 });
    }

    #[test]
    fn out_of_range_piece_index_is_a_protocol_error() {
        let torrent = torrent_two_pieces_two_files();
        let dir = tempdir().unwrap();
        let mut store = PieceStore::new(&torrent, dir.path()).unwrap();
        let err = store.save(2, 0, &vec![0u8; 100]).unwrap_err();
        assert_eq!(err, SaveError::InvalidPieceIndex { index: 2, piece_count: 2 });
    }

    #[test]
    fn startup_reverification_marks_clean_pieces_complete_without_buffering() {
        let torrent = torrent_two_pieces_two_files();
        let dir = tempdir().unwrap();
        {
            let mut store = PieceStore::new(&torrent, dir.path()).unwrap();
            store.save(0, 0, &vec![0u8; 16384]).unwrap();
            store.save(0, 16384, &vec![0u8; 16384]).unwrap();
            assert!(store.is_complete(0));
        }
        // reopening (simulating a restart) should re-verify piece 0 from disk
        let store = PieceStore::new(&torrent, dir.path()).unwrap();
        assert!(store.is_complete(0));
        assert!(!store.is_complete(1));
    }

    #[test]
    fn eviction_never_exceeds_cap_by_more_than_the_largest_single_piece() {
        let torrent = torrent_two_pieces_two_files();
        let dir = tempdir().unwrap();
        let mut store = PieceStore::new(&torrent, dir.path()).unwrap();
        store.save(0, 0, &vec![0u8; 16384]).unwrap();
        store.save(0, 16384, &vec![0u8; 16384]).unwrap();
        store.save(1, 0, &vec![1u8; 16384]).unwrap();
        store.save(1, 16384, &vec![1u8; 16384]).unwrap();
        assert!(store.all_complete());

        store.evict_if_over_budget(0);
        assert!(store.cached_bytes() <= 32768);
    }

    #[test]
    fn downloadable_from_excludes_complete_pieces() {
        let torrent = torrent_two_pieces_two_files();
        let dir = tempdir().unwrap();
        let mut store = PieceStore::new(&torrent, dir.path()).unwrap();
        store.save(0, 0, &vec![0u8; 16384]).unwrap();
        store.save(0, 16384, &vec![0u8; 16384]).unwrap();

        let mut bf = Bitfield::new(2);
        bf.fill(true);
        assert_eq!(store.downloadable_from(&bf), vec![1]);
    }
}
