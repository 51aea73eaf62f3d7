//! The in-tree private tracker dialect (spec §6): a single bencoded
//! dictionary sent over a blocking TCP connection, answered with a single
//! bencoded dictionary in turn. Grounded on
//! `examples/original_source/tracker.py::scraper` (the client side: connect,
//! sendall one bencoded dict, recv one bencoded dict back) and
//! `server.py::processRequest`'s `event` branch (the server side, mirrored
//! in `demos/tracker.rs`). Uses the hand-rolled `bencode::Value` codec
//! rather than `serde_bencode` since the request/response key set is
//! smaller and more ad hoc than a `.torrent` file's fixed shape.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::sync::Mutex;
use std::time::Duration;

use crate::bencode::Value;
use crate::error::EngineError;

/// Default port the reference tracker listens on, matching
/// `server.py`'s `SERVER_PORT`.
pub const DEFAULT_PORT: u16 = 1234;

pub struct TcpTrackerClient {
    connect_timeout: Duration,
}

impl TcpTrackerClient {
    pub fn new(connect_timeout: Duration) -> TcpTrackerClient {
        TcpTrackerClient { connect_timeout }
    }

    pub fn announce(
        &self,
        tracker_addr: SocketAddr,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        port: u16,
        uploaded: u64,
        downloaded: u64,
        left: u64,
    ) -> Result<Vec<SocketAddr>, EngineError> {
        let request = Value::dict([
            ("info_hash", Value::bytes(info_hash.to_vec())),
            ("peer_id", Value::bytes(peer_id.to_vec())),
            ("port", Value::Int(port as i64)),
            ("uploaded", Value::Int(uploaded as i64)),
            ("downloaded", Value::Int(downloaded as i64)),
            ("left", Value::Int(left as i64)),
            ("event", Value::str("started")),
        ]);

        let mut stream = TcpStream::connect_timeout(&tracker_addr, self.connect_timeout)
            .map_err(|source| EngineError::PeerUnreachable { addr: tracker_addr, source })?;
        stream
            .write_all(&request.encode())
            .map_err(|source| EngineError::PeerUnreachable { addr: tracker_addr, source })?;
        stream
            .shutdown(std::net::Shutdown::Write)
            .map_err(|source| EngineError::PeerUnreachable { addr: tracker_addr, source })?;

        let mut buf = Vec::new();
        stream
            .read_to_end(&mut buf)
            .map_err(|source| EngineError::PeerUnreachable { addr: tracker_addr, source })?;

        let response = Value::decode(&buf)?;
        parse_peers(&response)
    }
}

fn parse_peers(response: &Value) -> Result<Vec<SocketAddr>, EngineError> {
    let peers = response
        .get("peers")
        .and_then(Value::as_list)
        .ok_or_else(|| EngineError::Tracker("response missing 'peers' list".into()))?;

    let mut out = Vec::with_capacity(peers.len());
    for peer in peers {
        let ip = peer
            .get("ip")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::Tracker("peer entry missing 'ip'".into()))?;
        let port = peer
            .get("port")
            .and_then(Value::as_int)
            .ok_or_else(|| EngineError::Tracker("peer entry missing 'port'".into()))?;
        let ip: std::net::IpAddr = ip
            .parse()
            .map_err(|_| EngineError::Tracker(format!("peer entry has unparseable ip {:?}", ip)))?;
        out.push(SocketAddr::new(ip, port as u16));
    }
    Ok(out)
}

/// Builds the response dictionary the reference tracker (`demos/tracker.rs`)
/// sends back, listing every other known peer for the announced info_hash.
pub fn encode_peers_response(peers: &[(std::net::IpAddr, u16)]) -> Vec<u8> {
    let list = peers
        .iter()
        .map(|(ip, port)| {
            Value::dict([
                ("ip", Value::str(ip.to_string())),
                ("port", Value::Int(*port as i64)),
            ])
        })
        .collect();
    Value::dict([("peers", Value::List(list))]).encode()
}

/// Runs the reference tracker server forever on an already-bound listener,
/// mirroring `server.py::processRequest`'s `event` branch: each announce is
/// recorded under its `info_hash` and answered with every other peer seen
/// for that torrent so far. No persistence, no scrape, no `torrent`/`get`
/// metainfo-repository branches (those were a separate, unrelated feature
/// of `server.py` and aren't part of this dialect).
pub fn run_reference_tracker(listener: TcpListener) -> Result<(), EngineError> {
    let swarms: Mutex<HashMap<[u8; 20], Vec<(IpAddr, u16)>>> = Mutex::new(HashMap::new());
    for stream in listener.incoming() {
        let mut stream = match stream {
            Ok(s) => s,
            Err(e) => {
                log::warn!("reference tracker: accept failed: {}", e);
                continue;
            }
        };
        let peer_ip = match stream.peer_addr() {
            Ok(addr) => addr.ip(),
            Err(_) => continue,
        };
        if let Err(e) = serve_one(&mut stream, peer_ip, &swarms) {
            log::warn!("reference tracker: request failed: {}", e);
        }
    }
    Ok(())
}

fn serve_one(
    stream: &mut TcpStream,
    peer_ip: IpAddr,
    swarms: &Mutex<HashMap<[u8; 20], Vec<(IpAddr, u16)>>>,
) -> Result<(), EngineError> {
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf)?;
    let request = Value::decode(&buf)?;

    let info_hash: [u8; 20] = request
        .get("info_hash")
        .and_then(Value::as_bytes)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| EngineError::Tracker("announce missing 20-byte info_hash".into()))?;
    let port = request
        .get("port")
        .and_then(Value::as_int)
        .ok_or_else(|| EngineError::Tracker("announce missing port".into()))? as u16;

    let peers = {
        let mut swarms = swarms.lock().unwrap();
        let swarm = swarms.entry(info_hash).or_default();
        if !swarm.iter().any(|(ip, p)| *ip == peer_ip && *p == port) {
            swarm.push((peer_ip, port));
        }
        swarm.clone()
    };

    stream.write_all(&encode_peers_response(&peers))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, ToSocketAddrs};

    #[test]
    fn announce_round_trips_with_a_fake_tcp_server() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).unwrap();
            let (req, _) = Value::decode_prefix(&buf).unwrap();
            assert_eq!(req.get("event").and_then(Value::as_str), Some("started"));
            let response = encode_peers_response(&[("10.0.0.2".parse().unwrap(), 6881)]);
            stream.write_all(&response).unwrap();
        });

        let client = TcpTrackerClient::new(Duration::from_secs(2));
        let peers = client
            .announce(addr, [1u8; 20], [2u8; 20], 6881, 0, 0, 100, )
            .unwrap();
        assert_eq!(peers, vec!["10.0.0.2:6881".to_socket_addrs().unwrap().next().unwrap()]);
        server.join().unwrap();
    }

    #[test]
    fn parse_peers_rejects_missing_list() {
        let response = Value::dict([("interval", Value::Int(10))]);
        assert!(parse_peers(&response).is_err());
    }
}
