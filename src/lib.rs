//! `bitleech` is a leech-only BitTorrent engine: given a parsed metainfo file
//! it discovers peers through HTTP trackers, downloads every piece of the
//! swarm's content over the peer wire protocol, verifies each piece against
//! its SHA-1 hash, and writes it to the right offsets of the torrent's
//! output files. It never serves a byte back to the swarm.

#[macro_use]
extern crate serde_derive;

pub mod bitfield;
pub mod conf;
pub mod error;
pub mod metainfo;
pub mod peer;
pub mod piece_store;
pub mod storage;
pub mod swarm;
pub mod tracker;
pub mod wire;

pub use bitfield::Bitfield;
pub use error::{Error, Result};

/// The index of a piece within a torrent.
pub type PieceIndex = usize;

/// The index of a file within a torrent's file list.
pub type FileIndex = usize;

/// The peer ID is an arbitrary 20 byte string.
///
/// Guidelines for choosing a peer ID: http://bittorrent.org/beps/bep_0020.html.
pub type PeerId = [u8; 20];

/// A SHA-1 hash digest, 20 bytes long.
pub type Sha1Hash = [u8; 20];

/// The protocol's block (sub-piece) unit, fixed at 16 KiB. The last block of
/// the last piece may be shorter.
pub const BLOCK_LEN: u32 = 0x4000;

/// Returns the length of the block at `index` within a piece of length
/// `piece_len`.
///
/// # Panics
///
/// Panics if `index`'s nominal byte offset is not smaller than `piece_len`.
pub(crate) fn block_len(piece_len: u32, index: usize) -> u32 {
    let block_offset = index as u32 * BLOCK_LEN;
    assert!(piece_len > block_offset, "block index out of bounds");
    std::cmp::min(piece_len - block_offset, BLOCK_LEN)
}

/// Returns the number of blocks a piece of the given length is divided into.
pub(crate) fn block_count(piece_len: u32) -> usize {
    (piece_len as usize + (BLOCK_LEN as usize - 1)) / BLOCK_LEN as usize
}
