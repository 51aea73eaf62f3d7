//! One connection to one remote peer (spec §4.5), replacing the teacher's
//! `peer/connection.rs`. A session moves through
//! Connecting → Handshaking → Active → Closed and, once active, runs two
//! threads: a reader that only does blocking I/O and framing, and a
//! dispatcher that interprets frames and updates local state or forwards
//! them onward — so a slow piece-table lock never stalls the socket read.
//! Grounded on `examples/original_source/peer.py` (`run`, `get_messages`).

use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use crossbeam::channel::Sender;

use crate::bitfield::BitField;
use crate::error::EngineError;
use crate::peer::handshake::Handshake;
use crate::peer::message::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Handshaking,
    Active,
    Closed,
}

/// Events a session surfaces to whatever owns it (the registry and, through
/// it, the coordinators). Kept deliberately flat rather than routed through
/// a shared event bus, per the direct-calls/channels resolution.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    BitfieldReceived(PeerId, BitField),
    Have(PeerId, u32),
    Choked(PeerId),
    Unchoked(PeerId),
    Interested(PeerId),
    NotInterested(PeerId),
    BlockReceived(PeerId, u32, u32, Vec<u8>),
    RequestReceived(PeerId, u32, u32, u32),
    Disconnected(PeerId),
}

/// One open connection. Owned by the registry behind an `Arc`, addressed by
/// peers elsewhere only through its `PeerId`, never a back-reference.
pub struct PeerHandle {
    pub id: PeerId,
    pub addr: SocketAddr,
    pub peer_id: [u8; 20],
    writer: Mutex<TcpStream>,
    state: RwLock<SessionState>,
    am_choking: AtomicBool,
    am_interested: AtomicBool,
    peer_choking: AtomicBool,
    peer_interested: AtomicBool,
    bitfield: Mutex<BitField>,
    pending_requests: Mutex<std::collections::HashMap<(u32, u32), Instant>>,
    downloaded: AtomicUsize,
    uploaded: AtomicUsize,
}

impl PeerHandle {
    pub fn state(&self) -> SessionState {
        *self.state.read().unwrap()
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    pub fn peer_choking(&self) -> bool {
        self.peer_choking.load(Ordering::Relaxed)
    }

    pub fn am_interested(&self) -> bool {
        self.am_interested.load(Ordering::Relaxed)
    }

    pub fn bitfield(&self) -> BitField {
        self.bitfield.lock().unwrap().clone()
    }

    pub fn has_piece(&self, index: usize) -> bool {
        self.bitfield.lock().unwrap().has_piece(index)
    }

    pub fn downloaded(&self) -> usize {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub fn uploaded(&self) -> usize {
        self.uploaded.load(Ordering::Relaxed)
    }

    pub fn record_request_sent(&self, index: u32, begin: u32) {
        self.pending_requests
            .lock()
            .unwrap()
            .insert((index, begin), Instant::now());
    }

    pub fn clear_request(&self, index: u32, begin: u32) {
        self.pending_requests.lock().unwrap().remove(&(index, begin));
    }

    /// Requests still outstanding past `timeout`, for cancel-on-timeout
    /// bookkeeping the reference implementation never does but spec.md §3
    /// requires.
    pub fn timed_out_requests(&self, timeout: Duration) -> Vec<(u32, u32)> {
        let now = Instant::now();
        self.pending_requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, sent_at)| now.duration_since(**sent_at) > timeout)
            .map(|(k, _)| *k)
            .collect()
    }

    pub fn send(&self, message: &Message) -> Result<(), EngineError> {
        let bytes = message.serialize();
        let mut stream = self.writer.lock().unwrap();
        stream.write_all(&bytes).map_err(|source| EngineError::PeerUnreachable {
            addr: self.addr,
            source,
        })?;
        match message {
            Message::Piece(_, _, data) => {
                self.uploaded.fetch_add(data.len(), Ordering::Relaxed);
            }
            Message::Interested => self.am_interested.store(true, Ordering::Relaxed),
            Message::NotInterested => self.am_interested.store(false, Ordering::Relaxed),
            _ => {}
        }
        Ok(())
    }

    pub fn close(&self) {
        *self.state.write().unwrap() = SessionState::Closed;
        let _ = self.writer.lock().unwrap().shutdown(std::net::Shutdown::Both);
    }
}

/// Outbound connection: dials, performs the handshake, and spawns the
/// reader/dispatcher pair. Used by the download coordinator.
pub fn connect(
    id: PeerId,
    addr: SocketAddr,
    info_hash: [u8; 20],
    my_peer_id: [u8; 20],
    num_pieces: usize,
    connect_timeout: Duration,
    events_tx: Sender<SessionEvent>,
    our_bitfield: BitField,
) -> Result<std::sync::Arc<PeerHandle>, EngineError> {
    let stream = TcpStream::connect_timeout(&addr, connect_timeout)
        .map_err(|source| EngineError::PeerUnreachable { addr, source })?;
    establish(id, addr, stream, info_hash, my_peer_id, num_pieces, events_tx, true, our_bitfield)
}

/// Inbound connection: the remote has already dialed us; the first thing on
/// the wire is their handshake. Used by the upload coordinator's accept loop.
pub fn accept(
    id: PeerId,
    addr: SocketAddr,
    stream: TcpStream,
    info_hash: [u8; 20],
    my_peer_id: [u8; 20],
    num_pieces: usize,
    events_tx: Sender<SessionEvent>,
    our_bitfield: BitField,
) -> Result<std::sync::Arc<PeerHandle>, EngineError> {
    establish(id, addr, stream, info_hash, my_peer_id, num_pieces, events_tx, false, our_bitfield)
}

fn establish(
    id: PeerId,
    addr: SocketAddr,
    mut stream: TcpStream,
    info_hash: [u8; 20],
    my_peer_id: [u8; 20],
    num_pieces: usize,
    events_tx: Sender<SessionEvent>,
    we_dialed: bool,
    our_bitfield: BitField,
) -> Result<std::sync::Arc<PeerHandle>, EngineError> {
    let our_handshake = Handshake::new(info_hash, my_peer_id);

    let remote_handshake = if we_dialed {
        stream
            .write_all(&our_handshake.to_bytes())
            .map_err(|source| EngineError::PeerUnreachable { addr, source })?;
        Handshake::read_from(&mut stream)?
    } else {
        let remote = Handshake::read_from(&mut stream)?;
        stream
            .write_all(&our_handshake.to_bytes())
            .map_err(|source| EngineError::PeerUnreachable { addr, source })?;
        remote
    };

    if !remote_handshake.matches(&info_hash) {
        return Err(EngineError::HandshakeRejected {
            addr,
            reason: "info_hash mismatch".into(),
        });
    }

    let reader_stream = stream
        .try_clone()
        .map_err(|source| EngineError::PeerUnreachable { addr, source })?;

    let handle = std::sync::Arc::new(PeerHandle {
        id,
        addr,
        peer_id: remote_handshake.peer_id,
        writer: Mutex::new(stream),
        state: RwLock::new(SessionState::Active),
        am_choking: AtomicBool::new(true),
        am_interested: AtomicBool::new(false),
        peer_choking: AtomicBool::new(true),
        peer_interested: AtomicBool::new(false),
        bitfield: Mutex::new(BitField::empty(num_pieces)),
        pending_requests: Mutex::new(std::collections::HashMap::new()),
        downloaded: AtomicUsize::new(0),
        uploaded: AtomicUsize::new(0),
    });

    spawn_reader_and_dispatcher(handle.clone(), reader_stream, num_pieces, events_tx);

    if let Err(e) = handle.send(&Message::Bitfield(our_bitfield.to_wire())) {
        log::warn!("failed to send initial bitfield to {}: {}", addr, e);
    }

    log::info!("peer session established with {}", addr);
    Ok(handle)
}

/// The reader thread only parses frames and hands them to the dispatcher
/// thread over an in-process channel; the dispatcher applies state updates
/// and forwards anything the registry/coordinator needs to react to.
fn spawn_reader_and_dispatcher(
    handle: std::sync::Arc<PeerHandle>,
    mut stream: TcpStream,
    num_pieces: usize,
    events_tx: Sender<SessionEvent>,
) {
    let (frames_tx, frames_rx) = crossbeam::channel::bounded::<Message>(64);

    let reader_handle = handle.clone();
    std::thread::spawn(move || loop {
        if !reader_handle.is_active() {
            break;
        }
        match Message::read_from(&mut stream) {
            Ok(msg) => {
                if frames_tx.send(msg).is_err() {
                    break;
                }
            }
            // An unrecognized id or a malformed argument list is a single
            // bad frame, not a dead connection (spec's fail-open forward
            // compatibility); only a real I/O failure ends the session.
            Err(EngineError::MalformedInput(reason)) => {
                log::debug!("discarding malformed frame from {}: {}", reader_handle.addr, reason);
            }
            Err(_) => {
                reader_handle.close();
                break;
            }
        }
    });

    std::thread::spawn(move || {
        for msg in frames_rx.iter() {
            dispatch_one(&handle, msg, num_pieces, &events_tx);
        }
        handle.close();
        let _ = events_tx.send(SessionEvent::Disconnected(handle.id));
    });
}

fn dispatch_one(
    handle: &std::sync::Arc<PeerHandle>,
    msg: Message,
    num_pieces: usize,
    events_tx: &Sender<SessionEvent>,
) {
    match msg {
        Message::KeepAlive => {}
        Message::Choke => {
            handle.peer_choking.store(true, Ordering::Relaxed);
            let _ = events_tx.send(SessionEvent::Choked(handle.id));
        }
        Message::Unchoke => {
            handle.peer_choking.store(false, Ordering::Relaxed);
            let _ = events_tx.send(SessionEvent::Unchoked(handle.id));
        }
        Message::Interested => {
            handle.peer_interested.store(true, Ordering::Relaxed);
            let _ = events_tx.send(SessionEvent::Interested(handle.id));
        }
        Message::NotInterested => {
            handle.peer_interested.store(false, Ordering::Relaxed);
            let _ = events_tx.send(SessionEvent::NotInterested(handle.id));
        }
        Message::Have(index) => {
            handle.bitfield.lock().unwrap().set(index as usize);
            let _ = events_tx.send(SessionEvent::Have(handle.id, index));
        }
        Message::Bitfield(payload) => match BitField::from_wire(&payload, num_pieces) {
            Ok(bf) => {
                *handle.bitfield.lock().unwrap() = bf.clone();
                let _ = events_tx.send(SessionEvent::BitfieldReceived(handle.id, bf));
            }
            Err(e) => log::warn!("bad bitfield from {}: {}", handle.addr, e),
        },
        Message::Request(index, begin, length) => {
            let _ = events_tx.send(SessionEvent::RequestReceived(handle.id, index, begin, length));
        }
        Message::Piece(index, begin, data) => {
            handle.clear_request(index, begin);
            handle.downloaded.fetch_add(data.len(), Ordering::Relaxed);
            let _ = events_tx.send(SessionEvent::BlockReceived(handle.id, index, begin, data));
        }
        Message::Cancel(_, _, _) => {}
        Message::Port(_) => {}
    }
}
