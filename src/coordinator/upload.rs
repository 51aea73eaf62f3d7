//! The seed-side supervisor (spec §4.8), no teacher equivalent to keep.
//! Grounded on `examples/original_source/upload.py`: pick an ephemeral
//! listen port from a configured range, build a full (seed) bitfield, and
//! run an accept loop registering each inbound connection as a healthy
//! session immediately after the handshake.

use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex};

use crate::bitfield::BitField;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::metainfo::Metainfo;
use crate::piece::PieceTable;
use crate::registry::Registry;
use crate::store::PieceStore;
use crate::tracker::http::HttpTrackerClient;
use crate::tracker::tcp::TcpTrackerClient;

pub struct UploadCoordinator {
    metainfo: Metainfo,
    config: EngineConfig,
    my_peer_id: [u8; 20],
}

impl UploadCoordinator {
    pub fn new(metainfo: Metainfo, config: EngineConfig, my_peer_id: [u8; 20]) -> UploadCoordinator {
        UploadCoordinator {
            metainfo,
            config,
            my_peer_id,
        }
    }

    /// Binds an ephemeral port within `config.listen_port_range`, then
    /// accepts connections forever, registering each as a fully-seeded
    /// peer session. Never returns under normal operation.
    pub fn run(&self) -> Result<(), EngineError> {
        let store = Arc::new(PieceStore::create(&self.metainfo, &self.config.download_dir)?);
        let (completed_tx, _completed_rx) = crossbeam::channel::unbounded::<u32>();
        let mut table = PieceTable::new(&self.metainfo, completed_tx);
        for index in 0..self.metainfo.number_of_pieces() {
            // Seeding assumes the content is already on disk and correct;
            // mark every piece full without re-reading and re-hashing it.
            let _ = &mut table;
            mark_piece_full_for_seeding(&mut table, index);
        }
        let piece_table = Arc::new(Mutex::new(table));

        let registry = Registry::spawn(
            &self.config,
            self.metainfo.number_of_pieces(),
            piece_table.clone(),
            store.clone(),
        );

        let listener = self.bind_listen_port()?;
        let listen_port = listener.local_addr().unwrap().port();
        log::info!(
            "seeding {} on {}",
            self.metainfo.name,
            listener.local_addr().unwrap()
        );

        if let Err(e) = self.announce_once(listen_port) {
            log::warn!("could not announce seed to any tracker: {}", e);
        }

        let num_pieces = self.metainfo.number_of_pieces();
        for stream in listener.incoming() {
            let stream = match stream {
                Ok(s) => s,
                Err(e) => {
                    log::warn!("accept failed: {}", e);
                    continue;
                }
            };
            let addr = match stream.peer_addr() {
                Ok(a) => a,
                Err(_) => continue,
            };
            if let Err(e) = registry.register_accepted(
                stream,
                addr,
                self.metainfo.info_hash,
                self.my_peer_id,
                BitField::full(num_pieces),
            ) {
                log::warn!("handshake with {} failed: {}", addr, e);
                continue;
            }
        }
        Ok(())
    }

    /// Announces the seed to the first tracker URL that accepts it, so
    /// downloaders can discover it (spec §4.8). `left` is always 0 since
    /// seeding implies the content is already complete.
    fn announce_once(&self, port: u16) -> Result<(), EngineError> {
        let mut last_err = None;
        for tracker_url in &self.metainfo.announce_list {
            let attempt: Result<(), EngineError> = if tracker_url.starts_with("http://")
                || tracker_url.starts_with("https://")
            {
                HttpTrackerClient::new(self.config.connect_timeout)
                    .announce(tracker_url, &self.metainfo, self.my_peer_id, port, 0, 0, 0)
                    .map(|_| ())
            } else {
                tracker_url
                    .parse::<SocketAddr>()
                    .map_err(|e| EngineError::Tracker(format!("bad tracker address {:?}: {}", tracker_url, e)))
                    .and_then(|addr| {
                        TcpTrackerClient::new(self.config.connect_timeout)
                            .announce(addr, self.metainfo.info_hash, self.my_peer_id, port, 0, 0, 0)
                            .map(|_| ())
                    })
            };
            match attempt {
                Ok(()) => return Ok(()),
                Err(e) => {
                    log::warn!("announce to {} failed: {}", tracker_url, e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| EngineError::Tracker("no trackers configured".into())))
    }

    fn bind_listen_port(&self) -> Result<TcpListener, EngineError> {
        for port in self.config.listen_port_range.clone() {
            if let Ok(listener) = TcpListener::bind(("0.0.0.0", port)) {
                return Ok(listener);
            }
        }
        Err(EngineError::IOError(std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            "no free port in configured listen range",
        )))
    }
}

/// Marks a piece full without going through the normal assembly path,
/// since a seed's content is assumed already verified on disk. Piece state
/// is otherwise opaque from outside `piece.rs`, so this goes through the
/// one seam `PieceTable` exposes for it.
fn mark_piece_full_for_seeding(table: &mut PieceTable, index: usize) {
    table.force_mark_full(index);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    #[test]
    fn bind_listen_port_finds_a_free_port_in_range() {
        let mut config = EngineConfig::default();
        config.listen_port_range = 40000..=40010;
        let metainfo_dir = tempfile::tempdir().unwrap();
        let coordinator = UploadCoordinator {
            metainfo: crate::metainfo::tests_support::tiny_single_file(metainfo_dir.path()),
            config,
            my_peer_id: [0u8; 20],
        };
        let listener = coordinator.bind_listen_port().unwrap();
        assert!(coordinator.config.listen_port_range.contains(&listener.local_addr().unwrap().port()));
    }
}
