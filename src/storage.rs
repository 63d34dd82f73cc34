//! File layout helpers: mapping the torrent's linear byte space onto the set
//! of output files, and vice versa.

use std::{ops::Range, path::PathBuf};

use crate::FileIndex;

/// Information about one of the torrent's output files.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileInfo {
    /// The file's path, relative to the download directory.
    pub path: PathBuf,
    /// The file's length, in bytes.
    pub len: u64,
    /// The file's first byte's offset in the virtual concatenation of all
    /// files. Always 0 for a single-file torrent.
    pub offset: u64,
}

impl FileInfo {
    /// The file's first and one-past-the-last byte offsets in the torrent.
    pub fn byte_range(&self) -> Range<u64> {
        self.offset..self.offset + self.len
    }

    /// Returns the `(in_file_offset, len)` slice of this file that overlaps
    /// with the range `[torrent_offset, torrent_offset + len)`.
    ///
    /// The returned length is clamped to the file's end, so the caller may
    /// pass a range that extends beyond this file (e.g. the tail of a piece
    /// that continues into the next file).
    ///
    /// # Panics
    ///
    /// Panics if `torrent_offset` does not fall within this file's range.
    pub fn slice(&self, torrent_offset: u64, len: u64) -> FileSlice {
        assert!(
            self.byte_range().contains(&torrent_offset),
            "torrent offset {} outside file range {:?}",
            torrent_offset,
            self.byte_range()
        );
        let in_file_offset = torrent_offset - self.offset;
        let max_len = self.len - in_file_offset;
        FileSlice {
            offset: in_file_offset,
            len: len.min(max_len),
        }
    }
}

/// The location of a byte range within a single file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileSlice {
    /// The byte offset within the file.
    pub offset: u64,
    /// The length of the slice, in bytes.
    pub len: u64,
}

/// Finds the index of the file that contains `torrent_offset`, via binary
/// search on the (sorted, contiguous) file offset ranges.
///
/// The spec notes that a naive port of the reference binary search can exit
/// with the wrong file on some inputs (an off-by-one in its right-boundary
/// update); this uses the standard invariant-preserving form instead:
/// `lo..hi` always contains the answer, and each iteration strictly shrinks
/// it.
///
/// # Panics
///
/// Panics if `files` is empty or `torrent_offset` is past the last file's
/// end.
pub fn find_file_containing_offset(
    files: &[FileInfo],
    torrent_offset: u64,
) -> FileIndex {
    assert!(!files.is_empty());
    let mut lo = 0usize;
    let mut hi = files.len();
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let file = &files[mid];
        if torrent_offset < file.offset {
            hi = mid;
        } else if torrent_offset >= file.offset + file.len {
            lo = mid + 1;
        } else {
            return mid;
        }
    }
    panic!("torrent offset {} not covered by any file", torrent_offset);
}

/// Returns the (left-inclusive) range of file indices that overlap with
/// `byte_range`, a range of torrent-wide byte offsets.
///
/// Walks forward from the file containing `byte_range.start` until a file no
/// longer intersects the range.
pub fn files_intersecting(
    files: &[FileInfo],
    byte_range: Range<u64>,
) -> Range<FileIndex> {
    if byte_range.start >= byte_range.end || files.is_empty() {
        return 0..0;
    }
    let start = find_file_containing_offset(files, byte_range.start);
    let mut end = start + 1;
    while end < files.len() && files[end].offset < byte_range.end {
        end += 1;
    }
    start..end
}
