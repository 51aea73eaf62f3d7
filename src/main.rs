use std::net::TcpListener;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use swarmd::config::EngineConfig;
use swarmd::coordinator::{DownloadCoordinator, UploadCoordinator};
use swarmd::metainfo::Metainfo;
use swarmd::tracker::tcp::run_reference_tracker;
use swarmd::utils;

#[derive(Parser, Debug)]
#[command(about = "A peer-wire BitTorrent engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download a torrent to a directory, connecting out to peers the
    /// tracker returns.
    Download {
        #[arg(short, long, help = "path to *.torrent file")]
        file: String,
        #[arg(short, long, default_value = "downloads", help = "directory to save the downloaded files in")]
        out: PathBuf,
        #[arg(short, long, default_value_t = EngineConfig::default().download_listen_port, help = "port advertised to trackers")]
        port: u16,
    },
    /// Seed a torrent whose content is already present on disk.
    Upload {
        #[arg(short, long, help = "path to *.torrent file")]
        file: String,
        #[arg(short, long, help = "directory the torrent's files already live in")]
        dir: PathBuf,
    },
    /// Run the reference private tracker in-process, for local testing
    /// against `download`/`upload` without a third-party tracker.
    Tracker {
        #[arg(short, long, default_value_t = swarmd::tracker::tcp::DEFAULT_PORT)]
        port: u16,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Download { file, out, port } => {
            let metainfo = Metainfo::from_path(&PathBuf::from(file))?;
            let mut config = EngineConfig::default();
            config.download_dir = out;
            config.download_listen_port = port;
            let peer_id = utils::generate_peer_id();
            log::info!("downloading {} as peer {}", metainfo.name, hex_of(&peer_id));
            DownloadCoordinator::new(metainfo, config, peer_id).run()?;
        }
        Command::Upload { file, dir } => {
            let metainfo = Metainfo::from_path(&PathBuf::from(file))?;
            let mut config = EngineConfig::default();
            config.download_dir = dir;
            let peer_id = utils::generate_peer_id();
            log::info!("seeding {} as peer {}", metainfo.name, hex_of(&peer_id));
            UploadCoordinator::new(metainfo, config, peer_id).run()?;
        }
        Command::Tracker { port } => {
            let listener = TcpListener::bind(("0.0.0.0", port))?;
            log::info!("reference tracker listening on {}", listener.local_addr()?);
            run_reference_tracker(listener)?;
        }
    }

    Ok(())
}

fn hex_of(bytes: &[u8; 20]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
