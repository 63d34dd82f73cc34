//! This module defines types used to configure the engine and its parts.
//!
//! Every numeric constant the spec fixes (sub-piece length, piece cache
//! budget, in-flight request cap, timer periods) is sourced from here, with
//! the spec's own value as the compiled-in default, so tests can exercise
//! non-default values without touching engine logic.

use std::{path::PathBuf, time::Duration};

use crate::PeerId;

/// The default `bitleech` client id, the 20 ASCII byte peer-id sent in every
/// handshake and tracker announce.
pub const DEFAULT_CLIENT_ID: &PeerId = b"-BT0001-000000000000";

/// The global configuration for the engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the configuration with reasonable defaults, except for the
    /// download directory, as it is not sensible to guess that for the user.
    /// Uses the default client id, [`DEFAULT_CLIENT_ID`].
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf {
                client_id: *DEFAULT_CLIENT_ID,
                port: 6881,
            },
            torrent: TorrentConf::new(download_dir),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and peers.
    pub client_id: PeerId,
    /// The port announced to trackers. This client never listens on it: it
    /// only leeches, so nothing actually binds to this port.
    pub port: u16,
}

/// Configuration for a torrent download.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which the torrent's files are placed.
    pub download_dir: PathBuf,

    /// The number of concurrent REQUESTs a single peer session keeps
    /// outstanding.
    pub max_in_flight_requests: usize,

    /// The soft cap, in bytes, on the total size of verified pieces that may
    /// remain cached in memory before the swarm evicts half of them.
    pub piece_cache_cap: u64,

    /// How often the swarm re-announces to each tracker.
    pub tracker_announce_interval: Duration,

    /// How often the swarm reaps peer sessions that never connected.
    pub peer_reap_interval: Duration,

    /// A peer session that hasn't connected within this long after creation
    /// is reaped.
    pub peer_connect_timeout: Duration,

    /// How often the swarm checks the piece cache budget.
    pub cache_eviction_interval: Duration,

    /// How often the swarm reports progress and checks for completion.
    pub progress_interval: Duration,

    /// How often a connected peer session emits a keep-alive in the absence
    /// of other traffic.
    pub keepalive_interval: Duration,

    /// The timeout applied to a tracker's HTTP announce request.
    pub tracker_timeout: Duration,
}

impl TorrentConf {
    /// Returns the torrent configuration with the spec's defaults, except
    /// for the download directory, as it is not sensible to guess that for
    /// the user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            max_in_flight_requests: 4,
            piece_cache_cap: 16 * 1024 * 1024,
            tracker_announce_interval: Duration::from_secs(60),
            peer_reap_interval: Duration::from_secs(5),
            peer_connect_timeout: Duration::from_secs(30),
            cache_eviction_interval: Duration::from_secs(5),
            progress_interval: Duration::from_secs(1),
            keepalive_interval: Duration::from_secs(30),
            tracker_timeout: Duration::from_secs(10),
        }
    }
}
