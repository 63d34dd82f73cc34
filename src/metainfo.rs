//! Bencoded `.torrent` metainfo parsing and conversion into the read-only
//! [`Torrent`] descriptor the rest of the engine works with.
//!
//! Bencode decoding itself is handled by `serde_bencode`; this module is
//! concerned with shaping the result into the flat, pre-computed structures
//! (`pieces`, `files` with cumulative offsets) the piece store and peer
//! sessions need, so they never have to walk the metainfo dictionary again.

use std::{fs, path::Path};

use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};

use crate::{
    error::{Error, Result},
    storage::FileInfo,
    Sha1Hash,
};

/// The raw bencoded metainfo dictionary, as it appears in a `.torrent` file.
#[derive(Debug, Serialize, Deserialize)]
pub struct Metainfo {
    pub info: Info,
    #[serde(default)]
    pub announce: Option<String>,
    #[serde(rename = "announce-list", default)]
    pub announce_list: Option<Vec<Vec<String>>>,
}

impl Metainfo {
    /// Parses a metainfo dictionary from the raw bytes of a `.torrent` file.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        serde_bencode::from_bytes(buf)
            .map_err(|e| Error::InvalidMetainfo(e.to_string()))
    }

    /// Reads and parses a `.torrent` file from disk.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let buf = fs::read(path).map_err(|e| {
            Error::InvalidMetainfo(format!("{}: {}", path.display(), e))
        })?;
        Self::from_bytes(&buf)
    }

    /// The SHA-1 hash of the bencoded `info` dictionary, the torrent's
    /// swarm-wide identifier.
    pub fn info_hash(&self) -> Result<Sha1Hash> {
        let info = serde_bencode::to_bytes(&self.info)
            .map_err(|e| Error::InvalidMetainfo(e.to_string()))?;
        let digest = Sha1::digest(&info);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);
        Ok(info_hash)
    }

    /// All tracker announce URLs: the primary `announce` plus every URL
    /// found in the (optional, possibly tiered) `announce-list`, in order,
    /// without duplicates.
    pub fn trackers(&self) -> Vec<String> {
        let mut urls = Vec::new();
        if let Some(announce) = &self.announce {
            urls.push(announce.clone());
        }
        if let Some(tiers) = &self.announce_list {
            for tier in tiers {
                for url in tier {
                    if !urls.contains(url) {
                        urls.push(url.clone());
                    }
                }
            }
        }
        urls
    }

    /// Converts the parsed metainfo into the engine's read-only torrent
    /// descriptor.
    pub fn into_torrent(self) -> Result<Torrent> {
        let info_hash = self.info_hash()?;
        let trackers = self.trackers();
        Torrent::new(self.info, info_hash, trackers)
    }
}

/// The bencoded `info` dictionary.
#[derive(Debug, Serialize, Deserialize)]
pub struct Info {
    pub name: String,
    #[serde(with = "serde_bytes")]
    pub pieces: ByteBuf,
    #[serde(rename = "piece length")]
    pub piece_length: u32,
    pub length: Option<u64>,
    pub files: Option<Vec<RawFile>>,
    pub private: Option<u8>,
}

/// A single file entry as it appears in a multi-file `info` dictionary.
#[derive(Debug, Serialize, Deserialize)]
pub struct RawFile {
    pub path: Vec<String>,
    pub length: u64,
}

/// The read-only torrent descriptor the rest of the engine is built around:
/// the info-hash, the per-piece expected hashes, and the file layout with
/// pre-computed cumulative offsets.
#[derive(Clone, Debug)]
pub struct Torrent {
    /// SHA-1 of the bencoded `info` dictionary.
    pub info_hash: Sha1Hash,
    /// The torrent's (display) name; also the default download directory
    /// name for multi-file torrents.
    pub name: String,
    /// The nominal length of all but the last piece, in bytes.
    pub piece_length: u32,
    /// The 20-byte SHA-1 of each piece, in order.
    pub pieces: Vec<Sha1Hash>,
    /// The files, in order, with cumulative byte offsets into the virtual
    /// concatenation of all files.
    pub files: Vec<FileInfo>,
    /// The sum of the length of all files.
    pub total_len: u64,
    /// Every tracker announce URL found in the metainfo, in order, without
    /// duplicates.
    pub trackers: Vec<String>,
}

impl Torrent {
    fn new(info: Info, info_hash: Sha1Hash, trackers: Vec<String>) -> Result<Self> {
        if info.pieces.len() % 20 != 0 {
            return Err(Error::InvalidMetainfo(
                "pieces field is not a multiple of 20 bytes".into(),
            ));
        }
        let pieces: Vec<Sha1Hash> = info
            .pieces
            .chunks_exact(20)
            .map(|c| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(c);
                hash
            })
            .collect();
        if pieces.is_empty() {
            return Err(Error::InvalidMetainfo("torrent has no pieces".into()));
        }

        let mut files = Vec::new();
        let mut offset = 0u64;
        match (&info.length, &info.files) {
            (Some(len), None) => {
                files.push(FileInfo {
                    path: info.name.clone().into(),
                    len: *len,
                    offset: 0,
                });
                offset = *len;
            }
            (None, Some(raw_files)) => {
                if raw_files.is_empty() {
                    return Err(Error::InvalidMetainfo(
                        "multi-file torrent has an empty files list".into(),
                    ));
                }
                for raw in raw_files {
                    let path = raw.path.iter().collect::<std::path::PathBuf>();
                    files.push(FileInfo {
                        path,
                        len: raw.length,
                        offset,
                    });
                    offset += raw.length;
                }
            }
            _ => {
                return Err(Error::InvalidMetainfo(
                    "info dictionary must have exactly one of length/files"
                        .into(),
                ));
            }
        }

        let total_len = offset;
        let expected_len =
            (pieces.len() as u64 - 1) * info.piece_length as u64
                + last_piece_len(total_len, info.piece_length, pieces.len());
        if expected_len != total_len {
            return Err(Error::InvalidMetainfo(format!(
                "file lengths ({}) do not match piece count ({}) at piece length {}",
                total_len,
                pieces.len(),
                info.piece_length
            )));
        }

        Ok(Self {
            info_hash,
            name: info.name,
            piece_length: info.piece_length,
            pieces,
            files,
            total_len,
        })
    }

    /// The number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// The length, in bytes, of the piece at `index`. The last piece may be
    /// shorter than `piece_length`.
    pub fn piece_len(&self, index: crate::PieceIndex) -> u32 {
        if index == self.pieces.len() - 1 {
            last_piece_len(self.total_len, self.piece_length, self.pieces.len()) as u32
        } else {
            self.piece_length
        }
    }

    /// Returns true if this is a multi-file (archive) torrent.
    pub fn is_archive(&self) -> bool {
        self.files.len() > 1
    }
}

fn last_piece_len(total_len: u64, piece_length: u32, piece_count: usize) -> u64 {
    total_len - piece_length as u64 * (piece_count as u64 - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_file_metainfo() -> Metainfo {
        Metainfo {
            info: Info {
                name: "foo.txt".into(),
                pieces: ByteBuf::from(vec![1u8; 40]),
                piece_length: 10,
                length: Some(15),
                files: None,
                private: None,
            },
            announce: Some("http://tracker.example/announce".into()),
            announce_list: None,
        }
    }

    #[test]
    fn single_file_descriptor_has_one_file_at_offset_zero() {
        let torrent = single_file_metainfo().into_torrent().unwrap();
        assert_eq!(torrent.files.len(), 1);
        assert_eq!(torrent.files[0].offset, 0);
        assert_eq!(torrent.files[0].len, 15);
        assert_eq!(torrent.piece_count(), 2);
        assert_eq!(torrent.piece_len(0), 10);
        assert_eq!(torrent.piece_len(1), 5);
    }

    #[test]
    fn multi_file_descriptor_accumulates_offsets() {
        let metainfo = Metainfo {
            info: Info {
                name: "archive".into(),
                pieces: ByteBuf::from(vec![2u8; 20]),
                piece_length: 32768,
                length: None,
                files: Some(vec![
                    RawFile { path: vec!["a.bin".into()], length: 20000 },
                    RawFile { path: vec!["sub".into(), "b.bin".into()], length: 12768 },
                ]),
                private: None,
            },
            announce: None,
            announce_list: None,
        };
        let torrent = metainfo.into_torrent().unwrap();
        assert_eq!(torrent.files[0].offset, 0);
        assert_eq!(torrent.files[1].offset, 20000);
        assert_eq!(torrent.total_len, 32768);
        assert!(torrent.is_archive());
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let mut metainfo = single_file_metainfo();
        metainfo.info.length = Some(999);
        assert!(metainfo.into_torrent().is_err());
    }

    #[test]
    fn trackers_collects_announce_and_announce_list_without_duplicates() {
        let mut metainfo = single_file_metainfo();
        metainfo.announce_list = Some(vec![
            vec!["http://tracker.example/announce".into()],
            vec!["http://backup.example/announce".into()],
        ]);
        let trackers = metainfo.trackers();
        assert_eq!(
            trackers,
            vec![
                "http://tracker.example/announce".to_string(),
                "http://backup.example/announce".to_string(),
            ]
        );
    }
}
