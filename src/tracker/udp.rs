//! Optional BEP-15 UDP tracker support (spec §4.7, §9 Open Question
//! resolution: implemented but not wired into
//! `coordinator::download::DownloadCoordinator`'s default announce path,
//! since full UDP dialect support is an explicit Non-goal). Only the
//! connect+announce handshake is implemented; scrape is not, matching the
//! same scope line.

use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use rand::Rng;

use crate::error::EngineError;

const PROTOCOL_ID: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;

pub struct UdpTrackerClient {
    socket: UdpSocket,
    read_timeout: Duration,
}

impl UdpTrackerClient {
    pub fn bind(read_timeout: Duration) -> Result<UdpTrackerClient, EngineError> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_read_timeout(Some(read_timeout))?;
        Ok(UdpTrackerClient { socket, read_timeout })
    }

    /// BEP-15 step one: exchange a transaction id for a connection id.
    pub fn connect(&self, tracker: SocketAddr) -> Result<u64, EngineError> {
        let mut rng = rand::thread_rng();
        let transaction_id: u32 = rng.gen();

        let mut req = Vec::with_capacity(16);
        req.write_u64::<BigEndian>(PROTOCOL_ID).unwrap();
        req.write_u32::<BigEndian>(ACTION_CONNECT).unwrap();
        req.write_u32::<BigEndian>(transaction_id).unwrap();

        self.socket
            .send_to(&req, tracker)
            .map_err(|source| EngineError::PeerUnreachable { addr: tracker, source })?;

        let mut buf = [0u8; 16];
        let (len, _) = self
            .socket
            .recv_from(&mut buf)
            .map_err(|source| EngineError::PeerUnreachable { addr: tracker, source })?;
        if len < 16 {
            return Err(EngineError::Tracker("connect response too short".into()));
        }

        let mut cursor = &buf[..];
        let action = cursor.read_u32::<BigEndian>().unwrap();
        let got_transaction_id = cursor.read_u32::<BigEndian>().unwrap();
        let connection_id = cursor.read_u64::<BigEndian>().unwrap();

        if action != ACTION_CONNECT || got_transaction_id != transaction_id {
            return Err(EngineError::Tracker("connect response mismatch".into()));
        }
        Ok(connection_id)
    }

    /// BEP-15 step two: announce using a connection id from `connect`.
    pub fn announce(
        &self,
        tracker: SocketAddr,
        connection_id: u64,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        downloaded: u64,
        left: u64,
        uploaded: u64,
        port: u16,
    ) -> Result<Vec<SocketAddr>, EngineError> {
        let mut rng = rand::thread_rng();
        let transaction_id: u32 = rng.gen();

        let mut req = Vec::with_capacity(98);
        req.write_u64::<BigEndian>(connection_id).unwrap();
        req.write_u32::<BigEndian>(ACTION_ANNOUNCE).unwrap();
        req.write_u32::<BigEndian>(transaction_id).unwrap();
        req.extend_from_slice(&info_hash);
        req.extend_from_slice(&peer_id);
        req.write_u64::<BigEndian>(downloaded).unwrap();
        req.write_u64::<BigEndian>(left).unwrap();
        req.write_u64::<BigEndian>(uploaded).unwrap();
        req.write_u32::<BigEndian>(0).unwrap(); // event: none
        req.write_u32::<BigEndian>(0).unwrap(); // ip_address: default
        req.write_u32::<BigEndian>(rng.gen()).unwrap(); // key
        req.write_i32::<BigEndian>(-1).unwrap(); // num_want: default
        req.write_u16::<BigEndian>(port).unwrap();

        self.socket
            .send_to(&req, tracker)
            .map_err(|source| EngineError::PeerUnreachable { addr: tracker, source })?;

        let mut buf = [0u8; 1024];
        let (len, _) = self
            .socket
            .recv_from(&mut buf)
            .map_err(|source| EngineError::PeerUnreachable { addr: tracker, source })?;
        if len < 20 {
            return Err(EngineError::Tracker("announce response too short".into()));
        }

        let mut cursor = &buf[..20];
        let action = cursor.read_u32::<BigEndian>().unwrap();
        let got_transaction_id = cursor.read_u32::<BigEndian>().unwrap();
        let _interval = cursor.read_u32::<BigEndian>().unwrap();
        let _leechers = cursor.read_u32::<BigEndian>().unwrap();
        let _seeders = cursor.read_u32::<BigEndian>().unwrap();

        if action != ACTION_ANNOUNCE || got_transaction_id != transaction_id {
            return Err(EngineError::Tracker("announce response mismatch".into()));
        }

        let mut peers = Vec::new();
        let mut rest = &buf[20..len];
        while rest.len() >= 6 {
            let ip = std::net::Ipv4Addr::new(rest[0], rest[1], rest[2], rest[3]);
            let peer_port = u16::from_be_bytes([rest[4], rest[5]]);
            peers.push(SocketAddr::from((ip, peer_port)));
            rest = &rest[6..];
        }
        Ok(peers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Fakes just enough of a BEP-15 responder to exercise the two-step
    /// handshake without a real tracker.
    fn fake_udp_tracker() -> (UdpSocket, SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = socket.local_addr().unwrap();
        (socket, addr)
    }

    #[test]
    fn connect_then_announce_against_a_fake_responder() {
        let (server, server_addr) = fake_udp_tracker();
        let client = UdpTrackerClient::bind(Duration::from_secs(2)).unwrap();

        let server_thread = std::thread::spawn(move || {
            let mut buf = [0u8; 64];
            let (_, client_addr) = server.recv_from(&mut buf).unwrap();
            let transaction_id = u32::from_be_bytes(buf[12..16].try_into().unwrap());
            let mut resp = Vec::new();
            resp.write_u32::<BigEndian>(ACTION_CONNECT).unwrap();
            resp.write_u32::<BigEndian>(transaction_id).unwrap();
            resp.write_u64::<BigEndian>(0xdeadbeef).unwrap();
            server.send_to(&resp, client_addr).unwrap();

            let (_, client_addr) = server.recv_from(&mut buf).unwrap();
            let transaction_id = u32::from_be_bytes(buf[12..16].try_into().unwrap());
            let mut resp = Vec::new();
            resp.write_u32::<BigEndian>(ACTION_ANNOUNCE).unwrap();
            resp.write_u32::<BigEndian>(transaction_id).unwrap();
            resp.write_u32::<BigEndian>(1800).unwrap();
            resp.write_u32::<BigEndian>(0).unwrap();
            resp.write_u32::<BigEndian>(1).unwrap();
            resp.extend_from_slice(&[127, 0, 0, 1, 0x1A, 0xE1]);
            server.send_to(&resp, client_addr).unwrap();
        });

        let connection_id = client.connect(server_addr).unwrap();
        assert_eq!(connection_id, 0xdeadbeef);

        let peers = client
            .announce(server_addr, connection_id, [1u8; 20], [2u8; 20], 0, 100, 0, 6881)
            .unwrap();
        assert_eq!(peers, vec!["127.0.0.1:6881".parse().unwrap()]);

        server_thread.join().unwrap();
    }
}
