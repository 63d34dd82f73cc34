//! `bitleech` binary entry point: reads a `.torrent` file, discovers peers,
//! and downloads every piece of the swarm's content to disk.
//!
//! CLI argument parsing, log initialization, and the external tracker list
//! are all this binary's job; everything else is delegated to the
//! `bitleech` library.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::Parser;

use bitleech::{
    conf::Conf,
    metainfo::Metainfo,
    piece_store::PieceStore,
    swarm::Swarm,
};

/// A leech-only BitTorrent client: downloads a torrent's content and exits.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the `.torrent` metainfo file to download.
    torrent: PathBuf,

    /// Directory under which the torrent's files are placed.
    #[arg(long, default_value = "./downloads")]
    download_dir: PathBuf,

    /// A text file of extra tracker announce URLs, one per line, that
    /// augments the metainfo's own announce list.
    #[arg(long, default_value = "./externalTrackerList.txt")]
    tracker_list: PathBuf,

    /// The port announced to trackers (this client never listens on it).
    #[arg(long, default_value_t = 6881)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let metainfo = Metainfo::from_file(&args.torrent)
        .with_context(|| format!("reading torrent file {}", args.torrent.display()))?;
    let mut torrent = metainfo
        .into_torrent()
        .context("parsing torrent metainfo")?;
    for url in external_trackers(&args.tracker_list) {
        if !torrent.trackers.contains(&url) {
            torrent.trackers.push(url);
        }
    }

    log::info!(
        "Downloading \"{}\" ({} pieces, {} trackers)",
        torrent.name,
        torrent.piece_count(),
        torrent.trackers.len()
    );

    fs::create_dir_all(&args.download_dir)
        .with_context(|| format!("creating download directory {}", args.download_dir.display()))?;
    let piece_store = PieceStore::new(&torrent, &args.download_dir)
        .context("setting up the output file layout")?;

    let mut conf = Conf::new(args.download_dir);
    conf.engine.port = args.port;

    let mut swarm = Swarm::new(torrent, conf, piece_store);
    swarm.run().await?;

    log::info!("Download finished");
    Ok(())
}

/// Reads extra tracker announce URLs from `path`, one per line, blank lines
/// trimmed and skipped. A missing file is not an error: the external
/// tracker list is optional.
fn external_trackers(path: &Path) -> Vec<String> {
    match fs::read_to_string(path) {
        Ok(contents) => contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_owned)
            .collect(),
        Err(e) => {
            log::debug!("No external tracker list at {}: {}", path.display(), e);
            Vec::new()
        }
    }
}
