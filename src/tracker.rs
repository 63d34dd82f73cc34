//! HTTP tracker announces: building the announce query string, parsing the
//! bencoded response, and turning its peer list into socket addresses.

use std::{collections::HashMap, time::Duration};

use serde_bytes::ByteBuf;

use crate::{PeerId, Sha1Hash};

/// A tracker this torrent announces to.
pub struct Tracker {
    announce_url: String,
    client: reqwest::Client,
    timeout: Duration,
    /// The last peer list this tracker returned. Kept around so a failed
    /// announce doesn't wipe out peers we already know about.
    last_peers: Vec<String>,
}

impl Tracker {
    pub fn new(announce_url: String, timeout: Duration) -> Self {
        Self {
            announce_url,
            client: reqwest::Client::new(),
            timeout,
            last_peers: Vec::new(),
        }
    }

    /// Announces to the tracker and returns the (possibly unchanged) peer
    /// list as `"ip:port"` strings.
    ///
    /// Announce failures (network errors, non-200 responses, unparsable
    /// bodies, or a `failure reason` key in the response) are logged and
    /// swallowed: the previous peer list is returned unchanged rather than
    /// propagated as an error, since one bad tracker must never stall the
    /// rest of the swarm.
    pub async fn announce(
        &mut self,
        info_hash: Sha1Hash,
        peer_id: PeerId,
        port: u16,
        downloaded: u64,
        uploaded: u64,
        left: u64,
        event: Option<&str>,
    ) -> &[String] {
        match self
            .try_announce(info_hash, peer_id, port, downloaded, uploaded, left, event)
            .await
        {
            Ok(peers) => {
                log::info!(
                    "Tracker {} returned {} peers",
                    self.announce_url,
                    peers.len()
                );
                self.last_peers = peers;
            }
            Err(e) => {
                log::warn!("Tracker {} announce failed: {}", self.announce_url, e);
            }
        }
        &self.last_peers
    }

    /// The peer list returned by the most recent successful announce (or
    /// empty, before the first one completes).
    pub fn peers(&self) -> &[String] {
        &self.last_peers
    }

    async fn try_announce(
        &self,
        info_hash: Sha1Hash,
        peer_id: PeerId,
        port: u16,
        downloaded: u64,
        uploaded: u64,
        left: u64,
        event: Option<&str>,
    ) -> crate::Result<Vec<String>> {
        let url = build_announce_url(
            &self.announce_url,
            info_hash,
            peer_id,
            port,
            downloaded,
            uploaded,
            left,
            event,
        );
        let resp = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| crate::Error::Tracker(e.to_string()))?;
        let body = resp
            .bytes()
            .await
            .map_err(|e| crate::Error::Tracker(e.to_string()))?;
        let response: AnnounceResponse = serde_bencode::from_bytes(&body)
            .map_err(|e| crate::Error::Tracker(e.to_string()))?;
        if let Some(reason) = response.failure_reason {
            return Err(crate::Error::Tracker(reason));
        }
        Ok(parse_peers(response.peers))
    }
}

/// Builds the announce query string.
///
/// Per the protocol, `info_hash` is sent as raw bytes; this client encodes
/// it the way trackers expect (every byte as a `%`-prefixed hex pair,
/// rather than standard percent-encoding, which only escapes the bytes that
/// aren't already URL-safe). `peer_id` is a 20-character printable ASCII
/// string and is sent literally, unencoded.
fn build_announce_url(
    base: &str,
    info_hash: Sha1Hash,
    peer_id: PeerId,
    port: u16,
    downloaded: u64,
    uploaded: u64,
    left: u64,
    event: Option<&str>,
) -> String {
    let separator = if base.contains('?') { '&' } else { '?' };
    let mut url = format!(
        "{}{}info_hash={}&peer_id={}&port={}&downloaded={}&uploaded={}&left={}",
        base,
        separator,
        hex_encode_raw(&info_hash),
        peer_id_literal(&peer_id),
        port,
        downloaded,
        uploaded,
        left,
    );
    if let Some(event) = event {
        url.push_str("&event=");
        url.push_str(event);
    }
    url
}

/// Renders a peer id as its literal ASCII string. Peer ids are always
/// printable ASCII (the client generates its own, per §6/§7), so this never
/// loses information the way a lossy UTF-8 conversion normally would.
fn peer_id_literal(peer_id: &PeerId) -> &str {
    std::str::from_utf8(peer_id).expect("peer id is always printable ASCII")
}

/// Encodes every byte of `bytes` as `%XX`, uppercase hex, exactly as the
/// reference tracker client does for `info_hash` (not the subset-escaping
/// `percent-encoding` crate would produce).
fn hex_encode_raw(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for b in bytes {
        out.push('%');
        out.push_str(&format!("{:02X}", b));
    }
    out
}

/// The bencoded tracker announce response.
#[derive(Debug, Deserialize)]
struct AnnounceResponse {
    #[serde(rename = "failure reason", default)]
    failure_reason: Option<String>,
    #[serde(default)]
    peers: PeerList,
}

/// The `peers` key can be either a single compact byte string (6 bytes per
/// peer: 4 for the IPv4 address, 2 for the port) or a list of dictionaries
/// with explicit `ip`/`port` keys.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PeerList {
    Compact(#[serde(with = "serde_bytes")] ByteBuf),
    Dictionary(Vec<PeerDict>),
}

impl Default for PeerList {
    fn default() -> Self {
        PeerList::Compact(ByteBuf::new())
    }
}

#[derive(Debug, Deserialize)]
struct PeerDict {
    ip: String,
    port: u16,
}

fn parse_peers(list: PeerList) -> Vec<String> {
    match list {
        PeerList::Compact(bytes) => bytes
            .chunks_exact(6)
            .map(|chunk| {
                let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                format!("{}.{}.{}.{}:{}", chunk[0], chunk[1], chunk[2], chunk[3], port)
            })
            .collect(),
        PeerList::Dictionary(dicts) => dicts
            .into_iter()
            .map(|d| format!("{}:{}", d.ip, d.port))
            .collect(),
    }
}

/// Deduplicates peer address strings coming from multiple trackers while
/// preserving first-seen order.
pub fn dedupe_peers(trackers_peers: impl IntoIterator<Item = Vec<String>>) -> Vec<String> {
    let mut seen = HashMap::new();
    let mut out = Vec::new();
    for peers in trackers_peers {
        for peer in peers {
            if seen.insert(peer.clone(), ()).is_none() {
                out.push(peer);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_peer_list_parses_ipv4_and_port() {
        let bytes = ByteBuf::from(vec![127, 0, 0, 1, 0x1A, 0xE1]);
        let peers = parse_peers(PeerList::Compact(bytes));
        assert_eq!(peers, vec!["127.0.0.1:6881".to_string()]);
    }

    #[test]
    fn dictionary_peer_list_parses() {
        let dicts = vec![
            PeerDict { ip: "10.0.0.5".into(), port: 51413 },
            PeerDict { ip: "10.0.0.6".into(), port: 6881 },
        ];
        let peers = parse_peers(PeerList::Dictionary(dicts));
        assert_eq!(peers, vec!["10.0.0.5:51413".to_string(), "10.0.0.6:6881".to_string()]);
    }

    #[test]
    fn announce_url_hex_encodes_info_hash_raw_and_sends_peer_id_literally() {
        let info_hash = [0xAB; 20];
        let peer_id = *b"-BT0001-000000000000";
        let url = build_announce_url(
            "http://tracker.example/announce",
            info_hash,
            peer_id,
            6881,
            0,
            0,
            1000,
            Some("started"),
        );
        assert!(url.starts_with("http://tracker.example/announce?info_hash=%AB%AB%AB"));
        assert!(url.contains("&peer_id=-BT0001-000000000000&"));
        assert!(!url.contains("%2D%42%54")); // peer_id must not be hex-encoded
        assert!(url.contains("&event=started"));
        assert!(url.contains("&left=1000"));
    }

    #[test]
    fn announce_url_appends_with_ampersand_if_base_has_a_query_already() {
        let url = build_announce_url(
            "http://tracker.example/announce?passkey=xyz",
            [0u8; 20],
            [0u8; 20],
            6881,
            0,
            0,
            0,
            None,
        );
        assert!(url.contains("passkey=xyz&info_hash="));
    }

    #[test]
    fn dedupe_peers_preserves_first_seen_order() {
        let a = vec!["1.1.1.1:6881".to_string(), "2.2.2.2:6881".to_string()];
        let b = vec!["2.2.2.2:6881".to_string(), "3.3.3.3:6881".to_string()];
        let merged = dedupe_peers(vec![a, b]);
        assert_eq!(
            merged,
            vec![
                "1.1.1.1:6881".to_string(),
                "2.2.2.2:6881".to_string(),
                "3.3.3.3:6881".to_string(),
            ]
        );
    }
}
