//! A single peer connection: handshake, piece availability exchange, and the
//! choke/request/piece loop that pulls sub-pieces into the shared piece
//! store.
//!
//! Each peer session owns nothing but its own connection state; the pieces
//! it downloads are written straight into the torrent-wide [`PieceStore`]
//! shared with every other session, so that a sub-piece already supplied by
//! one peer is never re-requested from another.

use std::{
    net::SocketAddr,
    sync::{atomic::AtomicBool, atomic::Ordering, Arc},
    time::Instant,
};

use futures::{SinkExt, StreamExt};
use rand::seq::SliceRandom;
use tokio::{net::TcpStream, sync::RwLock, time};
use tokio_util::codec::Framed;

use crate::{
    conf::Conf,
    error::{Error, Result},
    metainfo::Torrent,
    piece_store::{PieceStore, SaveOutcome},
    wire::{BlockInfo, Frame, Handshake, WireCodec},
    Bitfield, PieceIndex,
};

/// A peer connection's lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Connecting,
    HandshakeSent,
    BitfieldWait,
    Choked,
    Unchoked,
    Closed,
}

/// Runs a single outbound peer session to completion (until the connection
/// closes or a protocol violation is detected).
///
/// This is spawned as its own task per peer by the swarm; errors are
/// returned to the caller to log, never panicked on, since a single
/// misbehaving peer must never bring down the rest of the swarm.
pub async fn run(
    addr: SocketAddr,
    torrent: Arc<Torrent>,
    piece_store: Arc<RwLock<PieceStore>>,
    conf: Arc<Conf>,
    connected: Arc<AtomicBool>,
) -> Result<()> {
    let mut session = Session {
        addr,
        torrent,
        piece_store,
        conf,
        connected,
        state: State::Connecting,
        peer_bitfield: Bitfield::new(0),
        am_choked: true,
        current_piece: None,
        cursor: 0,
        in_flight: Vec::new(),
        last_activity: Instant::now(),
    };
    session.run().await
}

struct Session {
    addr: SocketAddr,
    torrent: Arc<Torrent>,
    piece_store: Arc<RwLock<PieceStore>>,
    conf: Arc<Conf>,
    /// Flipped to true once the handshake succeeds, so the swarm's reaper
    /// knows not to kill this session even if it later goes quiet.
    connected: Arc<AtomicBool>,
    state: State,
    /// The pieces the peer has advertised it holds, via BITFIELD/HAVE.
    peer_bitfield: Bitfield,
    /// Whether the peer currently has us choked (true until an UNCHOKE
    /// arrives).
    am_choked: bool,
    /// The piece we're currently pulling sub-pieces from.
    current_piece: Option<PieceIndex>,
    /// The next sub-piece offset to request within `current_piece`.
    cursor: u32,
    /// Requests sent to the peer that haven't yet been answered with a
    /// PIECE message.
    in_flight: Vec<BlockInfo>,
    last_activity: Instant,
}

impl Session {
    async fn run(&mut self) -> Result<()> {
        log::info!("Connecting to peer {}", self.addr);
        let socket = time::timeout(
            self.conf.torrent.peer_connect_timeout,
            TcpStream::connect(self.addr),
        )
        .await
        .map_err(|_| Error::Protocol(format!("connect to {} timed out", self.addr)))??;
        log::info!("Connected to peer {}", self.addr);

        let mut framed = Framed::new(socket, WireCodec);

        self.state = State::HandshakeSent;
        let handshake = Handshake::new(self.torrent.info_hash, self.conf.engine.client_id);
        framed.send(Frame::Handshake(handshake)).await?;

        let reply = framed
            .next()
            .await
            .ok_or_else(|| Error::Protocol(format!("peer {} closed before handshake", self.addr)))??;
        let peer_handshake = match reply {
            Frame::Handshake(hs) => hs,
            other => {
                return Err(Error::Protocol(format!(
                    "expected handshake, got {}",
                    other.name()
                )))
            }
        };
        if peer_handshake.info_hash != self.torrent.info_hash {
            return Err(Error::Protocol(format!(
                "peer {} advertised info hash {}, expected {}",
                self.addr,
                hex::encode(peer_handshake.info_hash),
                hex::encode(self.torrent.info_hash)
            )));
        }
        log::debug!("Peer {} handshake ok", self.addr);
        self.connected.store(true, Ordering::Relaxed);

        self.state = State::BitfieldWait;
        let our_bitfield = self.our_bitfield().await;
        framed.send(Frame::Bitfield(our_bitfield)).await?;
        framed.send(Frame::Interested).await?;
        self.peer_bitfield = Bitfield::new(self.torrent.piece_count());
        self.last_activity = Instant::now();

        let mut keepalive = time::interval(self.conf.torrent.keepalive_interval);
        keepalive.tick().await; // the first tick fires immediately

        loop {
            if self.state == State::Closed {
                return Ok(());
            }
            tokio::select! {
                frame = framed.next() => {
                    match frame {
                        Some(frame) => {
                            self.last_activity = Instant::now();
                            self.handle_frame(&mut framed, frame?).await?;
                        }
                        None => {
                            log::info!("Peer {} closed the connection", self.addr);
                            return Ok(());
                        }
                    }
                }
                _ = keepalive.tick() => {
                    if self.last_activity.elapsed() >= self.conf.torrent.keepalive_interval {
                        framed.send(Frame::KeepAlive).await?;
                        self.last_activity = Instant::now();
                    }
                }
            }
        }
    }

    async fn our_bitfield(&self) -> Bitfield {
        let store = self.piece_store.read().await;
        let mut bf = Bitfield::new(self.torrent.piece_count());
        for i in 0..self.torrent.piece_count() {
            if store.is_complete(i) {
                bf.set(i, true);
            }
        }
        bf
    }

    async fn handle_frame(
        &mut self,
        framed: &mut Framed<TcpStream, WireCodec>,
        frame: Frame,
    ) -> Result<()> {
        match frame {
            Frame::KeepAlive => {}
            Frame::Choke => {
                log::debug!("Peer {} choked us", self.addr);
                self.state = State::Choked;
                self.am_choked = true;
                self.in_flight.clear();
            }
            Frame::Unchoke => {
                log::debug!("Peer {} unchoked us", self.addr);
                self.state = State::Unchoked;
                self.am_choked = false;
                self.top_up_pipeline(framed).await?;
            }
            Frame::Interested | Frame::NotInterested => {
                // we never upload, so peer interest in us is a no-op
            }
            Frame::Have { piece_index } => {
                if piece_index as usize >= self.torrent.piece_count() {
                    return Err(Error::Protocol(format!(
                        "peer {} sent HAVE for piece {}, but the torrent only has {} pieces",
                        self.addr,
                        piece_index,
                        self.torrent.piece_count()
                    )));
                }
                self.peer_bitfield.set(piece_index as usize, true);
                if !self.am_choked {
                    self.top_up_pipeline(framed).await?;
                }
            }
            Frame::Bitfield(bf) => {
                if !bitfield_byte_len_matches(bf.len(), self.torrent.piece_count()) {
                    return Err(Error::Protocol(format!(
                        "peer {} sent a bitfield of {} bytes, expected {}",
                        self.addr,
                        (bf.len() + 7) / 8,
                        (self.torrent.piece_count() + 7) / 8
                    )));
                }
                for i in 0..self.torrent.piece_count() {
                    self.peer_bitfield.set(i, bf.get(i));
                }
            }
            Frame::Request(_) | Frame::Cancel(_) => {
                // we never serve blocks; ignore upload requests
            }
            Frame::Handshake(_) => {
                return Err(Error::Protocol(format!(
                    "peer {} sent a second handshake",
                    self.addr
                )));
            }
            Frame::Piece { piece_index, offset, data } => {
                self.handle_piece(framed, piece_index as usize, offset, data).await?;
            }
        }
        Ok(())
    }

    async fn handle_piece(
        &mut self,
        framed: &mut Framed<TcpStream, WireCodec>,
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    ) -> Result<()> {
        if piece_index >= self.torrent.piece_count() {
            return Err(Error::Protocol(format!(
                "peer {} sent PIECE for piece {}, but the torrent only has {} pieces",
                self.addr,
                piece_index,
                self.torrent.piece_count()
            )));
        }

        self.in_flight.retain(|b| {
            !(b.piece_index as usize == piece_index && b.offset == offset)
        });

        let outcome = {
            let mut store = self.piece_store.write().await;
            store.save(piece_index, offset, &data)?
        };
        match outcome {
            SaveOutcome::Accepted => {}
            SaveOutcome::PieceVerified => {
                log::info!("Piece {} complete", piece_index);
                if self.current_piece == Some(piece_index) {
                    self.current_piece = None;
                }
            }
            SaveOutcome::PieceFailedVerification => {
                log::warn!("Piece {} failed verification, will retry", piece_index);
                if self.current_piece == Some(piece_index) {
                    self.current_piece = None;
                }
            }
        }

        if !self.am_choked {
            self.top_up_pipeline(framed).await?;
        }
        Ok(())
    }

    /// Keeps up to `max_in_flight_requests` outstanding REQUESTs.
    ///
    /// The cursor sticks to the current piece, advancing sequentially to
    /// the next piece index (modulo the piece count) once it runs past the
    /// end of the one it's on; only when the cursor's piece turns out to be
    /// unusable (not claimed by the peer, or already complete) does a fresh
    /// piece get picked, uniformly at random among the peer's incomplete,
    /// advertised pieces. If no such piece exists the peer has nothing left
    /// to offer and the connection is closed.
    async fn top_up_pipeline(&mut self, framed: &mut Framed<TcpStream, WireCodec>) -> Result<()> {
        while self.in_flight.len() < self.conf.torrent.max_in_flight_requests {
            if !self.cursor_is_usable().await {
                match self.pick_piece().await {
                    Some(index) => {
                        self.current_piece = Some(index);
                        self.cursor = 0;
                    }
                    None => {
                        log::debug!("Peer {} has nothing left to offer, closing", self.addr);
                        self.state = State::Closed;
                        return Ok(());
                    }
                }
            }
            let index = self.current_piece.expect("cursor validated above");

            let (offset, len) = {
                let store = self.piece_store.read().await;
                store.first_incomplete_after(index, self.cursor)
            };

            let block = BlockInfo { piece_index: index as u32, offset, len };
            framed.send(Frame::Request(block)).await?;
            self.in_flight.push(block);
            self.last_activity = Instant::now();

            let piece_len = self.torrent.piece_len(index);
            if offset + len >= piece_len {
                self.current_piece = Some((index + 1) % self.torrent.piece_count());
                self.cursor = 0;
            } else {
                self.cursor = offset + len;
            }
        }
        Ok(())
    }

    /// Whether the current cursor still points at a piece worth requesting
    /// from: one the peer has advertised and that isn't already complete.
    async fn cursor_is_usable(&self) -> bool {
        match self.current_piece {
            None => false,
            Some(index) => {
                if !self.peer_bitfield.get(index) {
                    return false;
                }
                let store = self.piece_store.read().await;
                !store.is_complete(index)
            }
        }
    }

    async fn pick_piece(&self) -> Option<PieceIndex> {
        let store = self.piece_store.read().await;
        let candidates = store.downloadable_from(&self.peer_bitfield);
        drop(store);
        candidates.choose(&mut rand::thread_rng()).copied()
    }
}

/// Whether a received BITFIELD's byte length matches the one the protocol
/// requires for a torrent with `piece_count` pieces (`⌈piece_count/8⌉`).
/// `received_bits` is the bit-length the wire codec reports, which is
/// always a multiple of 8 (one full byte per received payload byte).
fn bitfield_byte_len_matches(received_bits: usize, piece_count: usize) -> bool {
    let expected_bytes = (piece_count + 7) / 8;
    let received_bytes = (received_bits + 7) / 8;
    received_bytes == expected_bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitfield_length_must_match_ceil_piece_count_over_eight() {
        // 10 pieces needs exactly 2 bytes (16 bits)
        assert!(bitfield_byte_len_matches(16, 10));
        // one byte short or one byte too many are both rejected
        assert!(!bitfield_byte_len_matches(8, 10));
        assert!(!bitfield_byte_len_matches(24, 10));
    }

    #[test]
    fn bitfield_length_matches_on_an_exact_byte_boundary() {
        // 8 pieces needs exactly 1 byte
        assert!(bitfield_byte_len_matches(8, 8));
        assert!(!bitfield_byte_len_matches(16, 8));
    }
}
