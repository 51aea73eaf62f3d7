//! Peer registry and scheduler (spec §4.6), replacing the teacher's empty
//! `peer::manager::PeerManager` stub. Grounded on
//! `examples/original_source/peers_manager.py` (`PeersManager`): a table of
//! connected peers keyed by address, a bounded worker pool draining inbound
//! requests, and `get_peers_having_piece`. Arena + index: peers are stored
//! in a `Vec` and referenced everywhere else only by `PeerId`, never by a
//! direct pointer back into this table.

use std::collections::HashMap;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::Duration;

use crossbeam::channel::Sender;

use crate::bitfield::BitField;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::peer::message::Message;
use crate::peer::session::{self, PeerHandle, PeerId, SessionEvent};
use crate::piece::{AssemblyOutcome, PieceTable};
use crate::store::PieceStore;

pub struct Registry {
    peers: RwLock<Vec<Arc<PeerHandle>>>,
    by_addr: RwLock<HashMap<SocketAddr, PeerId>>,
    next_id: AtomicUsize,
    availability_changed: Condvar,
    availability_lock: Mutex<()>,
    events_tx: Sender<SessionEvent>,
    request_queue_tx: Sender<(PeerId, u32, u32, u32)>,
    num_pieces: usize,
}

impl Registry {
    /// Spawns the registry's background dispatcher plus its bounded
    /// inbound-request and piece-assembly worker pools.
    pub fn spawn(
        config: &EngineConfig,
        num_pieces: usize,
        piece_table: Arc<Mutex<PieceTable>>,
        store: Arc<PieceStore>,
    ) -> Arc<Registry> {
        let (events_tx, events_rx) = crossbeam::channel::unbounded::<SessionEvent>();
        let (request_queue_tx, request_queue_rx) =
            crossbeam::channel::bounded::<(PeerId, u32, u32, u32)>(256);
        let (assembly_tx, assembly_rx) = crossbeam::channel::bounded::<usize>(256);

        let registry = Arc::new(Registry {
            peers: RwLock::new(Vec::new()),
            by_addr: RwLock::new(HashMap::new()),
            next_id: AtomicUsize::new(0),
            availability_changed: Condvar::new(),
            availability_lock: Mutex::new(()),
            events_tx,
            request_queue_tx,
            num_pieces,
        });

        for _ in 0..config.request_workers {
            let registry = registry.clone();
            let store = store.clone();
            let piece_table = piece_table.clone();
            let rx = request_queue_rx.clone();
            std::thread::spawn(move || {
                for (peer_id, index, begin, length) in rx.iter() {
                    registry.service_request(&piece_table, &store, peer_id, index, begin, length);
                }
            });
        }

        for _ in 0..config.assembly_workers {
            let registry = registry.clone();
            let store = store.clone();
            let piece_table = piece_table.clone();
            let rx = assembly_rx.clone();
            std::thread::spawn(move || {
                for index in rx.iter() {
                    let outcome = {
                        let mut table = piece_table.lock().unwrap();
                        table.try_assemble(index, &store)
                    };
                    match outcome {
                        Ok(AssemblyOutcome::Committed) => {
                            log::info!("piece {} committed", index);
                            registry.broadcast_have(index as u32);
                            registry.notify_availability_changed();
                        }
                        Ok(AssemblyOutcome::HashMismatch) => {
                            log::warn!("piece {} failed hash verification, resetting", index);
                        }
                        Err(e) => log::error!("failed to assemble piece {}: {}", index, e),
                    }
                }
            });
        }

        {
            let registry = registry.clone();
            let piece_table = piece_table.clone();
            std::thread::spawn(move || {
                for event in events_rx.iter() {
                    registry.handle_event(event, &piece_table, &assembly_tx);
                }
            });
        }

        registry
    }

    fn handle_event(
        &self,
        event: SessionEvent,
        piece_table: &Arc<Mutex<PieceTable>>,
        assembly_tx: &Sender<usize>,
    ) {
        match event {
            SessionEvent::BitfieldReceived(_, _) | SessionEvent::Have(_, _) => {
                self.notify_availability_changed();
            }
            SessionEvent::Interested(peer_id) => {
                if let Some(peer) = self.get(peer_id) {
                    let _ = peer.send(&Message::Unchoke);
                }
            }
            SessionEvent::RequestReceived(peer_id, index, begin, length) => {
                let _ = self.request_queue_tx.send((peer_id, index, begin, length));
            }
            SessionEvent::BlockReceived(_, index, begin, data) => {
                let ready = {
                    let mut table = piece_table.lock().unwrap();
                    table.deliver_block(index as usize, begin, data)
                };
                if ready {
                    let _ = assembly_tx.send(index as usize);
                }
            }
            SessionEvent::Disconnected(peer_id) => {
                self.remove(peer_id);
                self.notify_availability_changed();
            }
            SessionEvent::Choked(_) | SessionEvent::Unchoked(_) | SessionEvent::NotInterested(_) => {}
        }
    }

    fn service_request(
        &self,
        piece_table: &Arc<Mutex<PieceTable>>,
        store: &Arc<PieceStore>,
        peer_id: PeerId,
        index: u32,
        begin: u32,
        length: u32,
    ) {
        let Some(peer) = self.get(peer_id) else { return };
        let block = {
            let table = piece_table.lock().unwrap();
            table.read_block(index as usize, begin, length, store)
        };
        match block {
            Ok(Some(data)) => {
                if let Err(e) = peer.send(&Message::Piece(index, begin, data)) {
                    log::warn!("marking peer {} unhealthy after failed send: {}", peer.addr, e);
                    peer.close();
                    self.remove(peer_id);
                    self.notify_availability_changed();
                }
            }
            Ok(None) => log::debug!("peer {} requested piece {} we don't have yet", peer.addr, index),
            Err(e) => log::warn!("failed to read piece {} for {}: {}", index, peer.addr, e),
        }
    }

    fn next_peer_id(&self) -> PeerId {
        PeerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn insert(&self, handle: Arc<PeerHandle>) {
        self.by_addr.write().unwrap().insert(handle.addr, handle.id);
        self.peers.write().unwrap().push(handle);
    }

    fn remove(&self, id: PeerId) {
        let mut peers = self.peers.write().unwrap();
        if let Some(pos) = peers.iter().position(|p| p.id == id) {
            let handle = peers.remove(pos);
            self.by_addr.write().unwrap().remove(&handle.addr);
        }
    }

    pub fn get(&self, id: PeerId) -> Option<Arc<PeerHandle>> {
        self.peers.read().unwrap().iter().find(|p| p.id == id).cloned()
    }

    pub fn connected_count(&self) -> usize {
        self.peers.read().unwrap().iter().filter(|p| p.is_active()).count()
    }

    pub fn events_sender(&self) -> Sender<SessionEvent> {
        self.events_tx.clone()
    }

    /// Dials a peer and registers the session once the handshake completes.
    /// Silently skips addresses already connected or already at
    /// `max_peers`, matching the reference implementation's dedup-by-address
    /// behavior.
    pub fn add_peer(
        &self,
        addr: SocketAddr,
        info_hash: [u8; 20],
        my_peer_id: [u8; 20],
        connect_timeout: Duration,
        max_peers: usize,
        our_bitfield: BitField,
    ) -> Result<(), EngineError> {
        if self.by_addr.read().unwrap().contains_key(&addr) {
            return Ok(());
        }
        if self.connected_count() >= max_peers {
            return Ok(());
        }
        let id = self.next_peer_id();
        let handle = session::connect(
            id,
            addr,
            info_hash,
            my_peer_id,
            self.num_pieces,
            connect_timeout,
            self.events_tx.clone(),
            our_bitfield,
        )?;
        self.insert(handle);
        Ok(())
    }

    /// Registers an already-handshaken inbound connection (used by the
    /// upload coordinator's accept loop). `our_bitfield` is sent to the new
    /// peer immediately, since an accept loop only runs for a seed with
    /// everything on disk (spec §4.8).
    pub fn register_accepted(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        info_hash: [u8; 20],
        my_peer_id: [u8; 20],
        our_bitfield: BitField,
    ) -> Result<(), EngineError> {
        let id = self.next_peer_id();
        let handle = session::accept(
            id,
            addr,
            stream,
            info_hash,
            my_peer_id,
            self.num_pieces,
            self.events_tx.clone(),
            our_bitfield,
        )?;
        self.insert(handle);
        Ok(())
    }

    pub fn get_peers_having_piece(&self, index: usize) -> Vec<Arc<PeerHandle>> {
        self.peers
            .read()
            .unwrap()
            .iter()
            .filter(|p| p.is_active() && p.has_piece(index))
            .cloned()
            .collect()
    }

    fn notify_availability_changed(&self) {
        let _guard = self.availability_lock.lock().unwrap();
        self.availability_changed.notify_all();
    }

    /// Blocks until some active peer holds `index`, polling on a `Condvar`
    /// rather than the reference implementation's busy loop (Design Notes
    /// "Busy-wait for peers holding piece i"). `poll_timeout` bounds each
    /// wait so a caller can still check an external shutdown flag.
    pub fn wait_for_piece_holder(&self, index: usize, poll_timeout: Duration) -> Vec<Arc<PeerHandle>> {
        loop {
            let holders = self.get_peers_having_piece(index);
            if !holders.is_empty() {
                return holders;
            }
            let guard = self.availability_lock.lock().unwrap();
            let _ = self.availability_changed.wait_timeout(guard, poll_timeout).unwrap();
        }
    }

    pub fn broadcast_have(&self, index: u32) {
        for peer in self.peers.read().unwrap().iter().filter(|p| p.is_active()) {
            let _ = peer.send(&Message::Have(index));
        }
    }

    pub fn send_request(&self, peer: &Arc<PeerHandle>, index: u32, begin: u32, length: u32) -> Result<(), EngineError> {
        peer.send(&Message::Request(index, begin, length))?;
        peer.record_request_sent(index, begin);
        Ok(())
    }

    /// Requests still unanswered past the configured timeout, across every
    /// connected peer, for the sweep pass to demote back to FREE.
    pub fn timed_out_requests(&self, timeout: Duration) -> Vec<(PeerId, u32, u32)> {
        self.peers
            .read()
            .unwrap()
            .iter()
            .flat_map(|p| {
                p.timed_out_requests(timeout)
                    .into_iter()
                    .map(move |(index, begin)| (p.id, index, begin))
            })
            .collect()
    }
}
