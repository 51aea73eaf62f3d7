//! Integration tests exercising real loopback sockets and real files,
//! complementing the unit tests inside each module. Grounded in the same
//! real-socket style `peer::session`'s own tests use, scaled up to a full
//! seed/leech pair.

use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};

use swarmd::bitfield::BitField;
use swarmd::config::EngineConfig;
use swarmd::metainfo::Metainfo;
use swarmd::peer::message::Message;
use swarmd::piece::{AssemblyOutcome, PieceTable};
use swarmd::registry::Registry;
use swarmd::store::PieceStore;
use swarmd::tracker::tcp::{run_reference_tracker, TcpTrackerClient};

#[derive(Serialize)]
struct FixtureInfo {
    name: String,
    pieces: ByteBuf,
    #[serde(rename = "piece length")]
    piece_length: i64,
    length: i64,
}

#[derive(Serialize)]
struct FixtureTorrent {
    info: FixtureInfo,
    announce: String,
}

/// Builds a decodable single-file `.torrent` with one piece, so tests don't
/// need to depend on `metainfo.rs`'s private raw structs.
fn single_piece_torrent_bytes(content: &[u8], announce: &str) -> Vec<u8> {
    let mut hasher = Sha1::new();
    hasher.update(content);
    let hash = hasher.finalize();

    let torrent = FixtureTorrent {
        info: FixtureInfo {
            name: "fixture.bin".into(),
            pieces: ByteBuf::from(hash.to_vec()),
            piece_length: 16384,
            length: content.len() as i64,
        },
        announce: announce.into(),
    };
    serde_bencode::to_bytes(&torrent).unwrap()
}

#[test]
fn seed_and_leech_single_piece_torrent_over_loopback() {
    let content: Vec<u8> = (0u8..64).collect();
    let bytes = single_piece_torrent_bytes(&content, "127.0.0.1:0");

    let seed_dir = tempfile::tempdir().unwrap();
    let leech_dir = tempfile::tempdir().unwrap();

    let seed_metainfo = Metainfo::from_bytes(&bytes).unwrap();
    let leech_metainfo = Metainfo::from_bytes(&bytes).unwrap();
    let info_hash = seed_metainfo.info_hash;
    assert_eq!(info_hash, leech_metainfo.info_hash);

    std::fs::write(seed_dir.path().join(&seed_metainfo.name), &content).unwrap();

    let seed_config = EngineConfig::default();
    let seed_store = Arc::new(PieceStore::create(&seed_metainfo, seed_dir.path()).unwrap());
    let (seed_completed_tx, _seed_completed_rx) = crossbeam::channel::unbounded();
    let mut seed_table = PieceTable::new(&seed_metainfo, seed_completed_tx);
    for i in 0..seed_metainfo.number_of_pieces() {
        seed_table.force_mark_full(i);
    }
    let seed_table = Arc::new(Mutex::new(seed_table));
    let seed_registry = Registry::spawn(&seed_config, seed_metainfo.number_of_pieces(), seed_table, seed_store);

    let seed_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let seed_addr = seed_listener.local_addr().unwrap();
    let seed_peer_id = [1u8; 20];
    let seed_num_pieces = seed_metainfo.number_of_pieces();
    {
        let registry = seed_registry.clone();
        std::thread::spawn(move || {
            for stream in seed_listener.incoming() {
                let stream = stream.unwrap();
                let addr = stream.peer_addr().unwrap();
                let _ = registry.register_accepted(
                    stream,
                    addr,
                    info_hash,
                    seed_peer_id,
                    BitField::full(seed_num_pieces),
                );
            }
        });
    }

    let leech_config = EngineConfig::default();
    let leech_store = Arc::new(PieceStore::create(&leech_metainfo, leech_dir.path()).unwrap());
    let (leech_completed_tx, leech_completed_rx) = crossbeam::channel::unbounded();
    let leech_table = Arc::new(Mutex::new(PieceTable::new(&leech_metainfo, leech_completed_tx)));
    let leech_registry = Registry::spawn(
        &leech_config,
        leech_metainfo.number_of_pieces(),
        leech_table.clone(),
        leech_store,
    );
    let leech_peer_id = [2u8; 20];

    leech_registry
        .add_peer(
            seed_addr,
            info_hash,
            leech_peer_id,
            Duration::from_secs(2),
            8,
            BitField::empty(leech_metainfo.number_of_pieces()),
        )
        .unwrap();

    let holders = leech_registry.wait_for_piece_holder(0, Duration::from_secs(2));
    assert!(!holders.is_empty(), "expected the seed to show up as a holder for piece 0");
    let peer = &holders[0];
    if peer.peer_choking() {
        peer.send(&Message::Interested).unwrap();
        // give the seed's dispatcher a moment to unchoke us
        std::thread::sleep(Duration::from_millis(200));
    }

    loop {
        let reserved = leech_table.lock().unwrap().reserve_block(0);
        let Some((index, begin, length)) = reserved else { break };
        leech_registry.send_request(peer, index, begin, length).unwrap();
    }

    let completed = leech_completed_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(completed, 0);
    assert!(leech_table.lock().unwrap().is_full(0));

    let downloaded = std::fs::read(leech_dir.path().join(&leech_metainfo.name)).unwrap();
    assert_eq!(downloaded, content);
}

#[test]
fn piece_recovers_after_hash_mismatch() {
    let content: Vec<u8> = (0u8..32).collect();
    let bytes = single_piece_torrent_bytes(&content, "127.0.0.1:0");
    let metainfo = Metainfo::from_bytes(&bytes).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let store = PieceStore::create(&metainfo, dir.path()).unwrap();
    let (tx, rx) = crossbeam::channel::unbounded();
    let mut table = PieceTable::new(&metainfo, tx);

    // Deliver corrupted bytes for every block in the single piece.
    loop {
        let Some((index, begin, length)) = table.reserve_block(0) else { break };
        let garbage = vec![0xFFu8; length as usize];
        table.deliver_block(index as usize, begin, garbage);
    }
    let outcome = table.try_assemble(0, &store).unwrap();
    assert_eq!(outcome, AssemblyOutcome::HashMismatch);
    assert!(!table.is_full(0));
    assert!(rx.try_recv().is_err());

    // Blocks were reset to FREE; redeliver the real content and it commits.
    loop {
        let Some((index, begin, length)) = table.reserve_block(0) else { break };
        let chunk = content[begin as usize..begin as usize + length as usize].to_vec();
        table.deliver_block(index as usize, begin, chunk);
    }
    let outcome = table.try_assemble(0, &store).unwrap();
    assert_eq!(outcome, AssemblyOutcome::Committed);
    assert!(table.is_full(0));
    assert_eq!(rx.try_recv().unwrap(), 0);
}

#[test]
fn stale_pending_block_is_redelivered_after_sweep() {
    let content: Vec<u8> = (0u8..8).collect();
    let bytes = single_piece_torrent_bytes(&content, "127.0.0.1:0");
    let metainfo = Metainfo::from_bytes(&bytes).unwrap();

    let (tx, _rx) = crossbeam::channel::unbounded();
    let mut table = PieceTable::new(&metainfo, tx);

    let first = table.reserve_block(0).unwrap();
    assert!(table.reserve_block(0).is_none(), "single small piece has only one block");

    std::thread::sleep(Duration::from_millis(20));
    table.sweep(Duration::from_millis(1));

    let reserved_again = table.reserve_block(0).unwrap();
    assert_eq!(reserved_again, first);
}

#[test]
fn reference_tracker_records_and_returns_peers() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        let _ = run_reference_tracker(listener);
    });

    let client = TcpTrackerClient::new(Duration::from_secs(2));
    let info_hash = [7u8; 20];

    let first = client
        .announce(addr, info_hash, [1u8; 20], 6001, 0, 0, 100)
        .unwrap();
    assert_eq!(first, vec![SocketAddr::new("127.0.0.1".parse().unwrap(), 6001)]);

    let second = client
        .announce(addr, info_hash, [2u8; 20], 6002, 0, 0, 100)
        .unwrap();
    let ports: Vec<u16> = second.iter().map(|a| a.port()).collect();
    assert!(ports.contains(&6001) && ports.contains(&6002));
}
