//! The swarm coordinator: owns the trackers and the set of peer sessions for
//! a single torrent download, and drives the periodic housekeeping (tracker
//! refresh, dead peer reaping, piece cache eviction, completion check).

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};

use tokio::{sync::RwLock, task::JoinHandle, time};

use crate::{
    conf::Conf,
    error::Result,
    metainfo::Torrent,
    peer,
    piece_store::PieceStore,
    tracker::{dedupe_peers, Tracker},
};

struct PeerHandle {
    join: JoinHandle<()>,
    started_at: Instant,
    connected: Arc<AtomicBool>,
}

/// Owns a single torrent's download: its trackers, its peer sessions, and
/// the shared piece store they all write into.
pub struct Swarm {
    torrent: Arc<Torrent>,
    piece_store: Arc<RwLock<PieceStore>>,
    conf: Arc<Conf>,
    trackers: Vec<Tracker>,
    peers: HashMap<SocketAddr, PeerHandle>,
}

impl Swarm {
    pub fn new(torrent: Torrent, conf: Conf, piece_store: PieceStore) -> Self {
        let trackers = torrent
            .trackers
            .iter()
            .cloned()
            .map(|url| Tracker::new(url, conf.torrent.tracker_timeout))
            .collect();
        Self {
            torrent: Arc::new(torrent),
            piece_store: Arc::new(RwLock::new(piece_store)),
            conf: Arc::new(conf),
            trackers,
            peers: HashMap::new(),
        }
    }

    /// Runs the swarm until every piece has been downloaded and verified.
    pub async fn run(&mut self) -> Result<()> {
        self.announce_all(Some("started")).await;
        self.admit_peers().await;

        let mut tracker_refresh = time::interval(self.conf.torrent.tracker_announce_interval);
        let mut peer_reap = time::interval(self.conf.torrent.peer_reap_interval);
        let mut cache_eviction = time::interval(self.conf.torrent.cache_eviction_interval);
        let mut progress = time::interval(self.conf.torrent.progress_interval);
        // the first tick of every interval fires immediately; we already did
        // the initial announce/admission above, so skip it once for those.
        tracker_refresh.tick().await;

        loop {
            tokio::select! {
                _ = tracker_refresh.tick() => {
                    self.announce_all(None).await;
                    self.admit_peers().await;
                }
                _ = peer_reap.tick() => {
                    self.reap_dead_peers();
                }
                _ = cache_eviction.tick() => {
                    self.piece_store.write().await.evict_if_over_budget(self.conf.torrent.piece_cache_cap);
                }
                _ = progress.tick() => {
                    let store = self.piece_store.read().await;
                    let done = store.completed_count();
                    let total = store.piece_count();
                    drop(store);
                    log::info!("Progress: {}/{} pieces", done, total);
                    if done == total {
                        log::info!("Download complete");
                        self.announce_all(Some("stopped")).await;
                        self.shut_down_peers();
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn announce_all(&mut self, event: Option<&str>) {
        let info_hash = self.torrent.info_hash;
        let peer_id = self.conf.engine.client_id;
        let port = self.conf.engine.port;
        let left = {
            let store = self.piece_store.read().await;
            let missing = store.piece_count() - store.completed_count();
            // an approximation: exact remaining bytes would need per-piece
            // lengths, which isn't worth tracking just for this field.
            missing as u64 * self.torrent.piece_length as u64
        };
        for tracker in &mut self.trackers {
            tracker
                .announce(info_hash, peer_id, port, 0, 0, left, event)
                .await;
        }
    }

    async fn admit_peers(&mut self) {
        let peer_lists: Vec<Vec<String>> = self
            .trackers
            .iter()
            .map(|t| t.peers().to_vec())
            .collect();
        let peers = dedupe_peers(peer_lists);

        for peer_str in peers {
            let addr: SocketAddr = match peer_str.parse() {
                Ok(addr) => addr,
                Err(e) => {
                    log::debug!("Skipping unparsable peer address {}: {}", peer_str, e);
                    continue;
                }
            };
            if self.peers.contains_key(&addr) {
                continue;
            }
            self.spawn_peer(addr);
        }
    }

    fn spawn_peer(&mut self, addr: SocketAddr) {
        let torrent = Arc::clone(&self.torrent);
        let piece_store = Arc::clone(&self.piece_store);
        let conf = Arc::clone(&self.conf);
        let connected = Arc::new(AtomicBool::new(false));
        let connected_clone = Arc::clone(&connected);

        let join = tokio::spawn(async move {
            if let Err(e) = peer::run(addr, torrent, piece_store, conf, connected_clone).await {
                log::debug!("Peer {} session ended: {}", addr, e);
            }
        });

        self.peers.insert(
            addr,
            PeerHandle {
                join,
                started_at: Instant::now(),
                connected,
            },
        );
    }

    /// Aborts and drops any peer session that never completed its handshake
    /// within the connect timeout.
    fn reap_dead_peers(&mut self) {
        let timeout = self.conf.torrent.peer_connect_timeout;
        let dead: Vec<SocketAddr> = self
            .peers
            .iter()
            .filter(|(_, handle)| {
                !handle.connected.load(Ordering::Relaxed) && handle.started_at.elapsed() > timeout
            })
            .map(|(addr, _)| *addr)
            .collect();
        for addr in dead {
            log::debug!("Reaping peer {}, never connected", addr);
            if let Some(handle) = self.peers.remove(&addr) {
                handle.join.abort();
            }
        }
    }

    fn shut_down_peers(&mut self) {
        for (_, handle) in self.peers.drain() {
            handle.join.abort();
        }
    }
}
