//! HTTP/GET tracker dialect (spec §4.7, §6). Restructured from the
//! teacher's free `announce`/`scrape` functions into an `HttpTrackerClient`
//! type — the teacher's own `utils.rs` already expected a `HttpTracker`
//! struct that never existed; this fills that gap. Uses one blocking
//! `TcpStream` per request rather than `mio` polling, matching how
//! `examples/original_source/tracker.py` does a single blocking
//! `connect`+`sendall`+`recv` (there's no concurrent multiplexing need for
//! a one-shot GET).

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use urlencoding::encode_binary;

use crate::error::EngineError;
use crate::metainfo::Metainfo;

#[derive(Debug, Serialize, Deserialize)]
pub struct AnnounceResponse {
    pub failure_reason: Option<String>,
    pub warning_message: Option<String>,
    pub interval: u64,
    pub min_interval: Option<u64>,
    pub tracker_id: Option<String>,
    pub complete: Option<u64>,
    pub incomplete: Option<u64>,
    pub peers: peers::Peers,
}

impl AnnounceResponse {
    pub fn peers(&self) -> Vec<SocketAddr> {
        self.peers.0.clone()
    }
}

/// Deserializes the `peers` key in both its compact (one binary string of
/// packed 6/18-byte entries) and non-compact (list-of-dicts) forms.
mod peers {
    use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};
    use serde::ser::{Serialize, Serializer};
    use std::fmt;
    use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

    #[derive(Debug, Clone)]
    pub struct Peers(pub Vec<SocketAddr>);

    struct PeersVisitor;

    #[derive(Deserialize)]
    struct DictPeer {
        ip: String,
        port: u16,
        #[allow(dead_code)]
        #[serde(rename = "peer id", default)]
        peer_id: Option<serde_bytes::ByteBuf>,
    }

    impl<'de> Visitor<'de> for PeersVisitor {
        type Value = Peers;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("either a compact peer string or a list of peer dicts")
        }

        fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            let mut out = Vec::new();
            let mut i = 0;
            while i < v.len() {
                if i + 6 <= v.len() {
                    let addr = Ipv4Addr::new(v[i], v[i + 1], v[i + 2], v[i + 3]);
                    let port = u16::from_be_bytes([v[i + 4], v[i + 5]]);
                    out.push(SocketAddr::V4(SocketAddrV4::new(addr, port)));
                    i += 6;
                } else {
                    return Err(E::custom("invalid compact peer length"));
                }
            }
            Ok(Peers(out))
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Peers, A::Error>
        where
            A: SeqAccess<'de>,
        {
            let mut out = Vec::new();
            while let Some(p) = seq.next_element::<DictPeer>()? {
                if let Ok(ip) = p.ip.parse::<std::net::IpAddr>() {
                    out.push(SocketAddr::new(ip, p.port));
                }
            }
            Ok(Peers(out))
        }

        fn visit_map<A>(self, mut map: A) -> Result<Peers, A::Error>
        where
            A: MapAccess<'de>,
        {
            // A single dict peer rather than a list; accept it for leniency.
            let mut ip = None;
            let mut port = None;
            while let Some(key) = map.next_key::<String>()? {
                match key.as_str() {
                    "ip" => ip = Some(map.next_value::<String>()?),
                    "port" => port = Some(map.next_value::<u16>()?),
                    _ => {
                        let _ = map.next_value::<serde::de::IgnoredAny>()?;
                    }
                }
            }
            let mut out = Vec::new();
            if let (Some(ip), Some(port)) = (ip, port) {
                if let Ok(ip) = ip.parse::<std::net::IpAddr>() {
                    out.push(SocketAddr::new(ip, port));
                }
            }
            Ok(Peers(out))
        }
    }

    impl<'de> Deserialize<'de> for Peers {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            deserializer.deserialize_any(PeersVisitor)
        }
    }

    impl Serialize for Peers {
        fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            let mut packed = Vec::new();
            for peer in &self.0 {
                if let SocketAddr::V4(addr) = peer {
                    packed.extend(addr.ip().octets());
                    packed.extend(addr.port().to_be_bytes());
                }
            }
            serializer.serialize_bytes(&packed)
        }
    }
}

pub struct HttpTrackerClient {
    connect_timeout: Duration,
}

impl HttpTrackerClient {
    pub fn new(connect_timeout: Duration) -> HttpTrackerClient {
        HttpTrackerClient { connect_timeout }
    }

    pub fn announce(
        &self,
        announce_url: &str,
        metainfo: &Metainfo,
        peer_id: [u8; 20],
        port: u16,
        uploaded: u64,
        downloaded: u64,
        left: u64,
    ) -> Result<AnnounceResponse, EngineError> {
        let url = url::Url::parse(announce_url)
            .map_err(|e| EngineError::Tracker(format!("bad announce url: {}", e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| EngineError::Tracker("announce url has no host".into()))?;
        let tracker_port = url.port().unwrap_or(6969);
        let addr = (host, tracker_port)
            .to_socket_addrs()
            .map_err(|e| EngineError::Tracker(format!("could not resolve {}: {}", host, e)))?
            .next()
            .ok_or_else(|| EngineError::Tracker(format!("no address for {}", host)))?;

        let query = format!(
            "?info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            encode_binary(&metainfo.info_hash),
            encode_binary(&peer_id),
            port,
            uploaded,
            downloaded,
            left,
        );
        let request = format!(
            "GET {}{} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            url.path(),
            query,
            host
        );

        let response_bytes = self.blocking_request(addr, &request)?;
        parse_announce_response(&response_bytes)
    }

    fn blocking_request(&self, addr: SocketAddr, request: &str) -> Result<Vec<u8>, EngineError> {
        let mut stream = TcpStream::connect_timeout(&addr, self.connect_timeout)
            .map_err(|source| EngineError::PeerUnreachable { addr, source })?;
        stream
            .write_all(request.as_bytes())
            .map_err(|source| EngineError::PeerUnreachable { addr, source })?;
        let mut buf = Vec::new();
        stream
            .read_to_end(&mut buf)
            .map_err(|source| EngineError::PeerUnreachable { addr, source })?;
        Ok(buf)
    }
}

fn parse_announce_response(raw: &[u8]) -> Result<AnnounceResponse, EngineError> {
    let header_end = find_header_end(raw)
        .ok_or_else(|| EngineError::Tracker("malformed HTTP response: no header terminator".into()))?;
    let body = &raw[header_end..];
    serde_bencode::from_bytes::<AnnounceResponse>(body)
        .map_err(|e| EngineError::Tracker(format!("bad announce response: {}", e)))
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
    if raw.len() < 4 {
        return None;
    }
    for i in 0..=raw.len() - 4 {
        if &raw[i..i + 4] == b"\r\n\r\n" {
            return Some(i + 4);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compact_peers_response() {
        let mut body = Vec::new();
        body.extend_from_slice(b"d8:intervali1800e5:peers6:");
        body.extend_from_slice(&[127, 0, 0, 1, 0x1A, 0xE1]);
        body.push(b'e');
        let raw = [b"HTTP/1.1 200 OK\r\n\r\n".as_slice(), &body].concat();
        let response = parse_announce_response(&raw).unwrap();
        assert_eq!(response.interval, 1800);
        assert_eq!(response.peers(), vec!["127.0.0.1:6881".parse().unwrap()]);
    }

    #[test]
    fn parses_dict_style_peers_response() {
        let body = b"d8:intervali900e5:peersl\
            d2:ip9:127.0.0.14:porti6882ee\
            e";
        let raw = [b"HTTP/1.1 200 OK\r\n\r\n".as_slice(), body].concat();
        let response = parse_announce_response(&raw).unwrap();
        assert_eq!(response.interval, 900);
        assert_eq!(response.peers(), vec!["127.0.0.1:6882".parse().unwrap()]);
    }

    #[test]
    fn rejects_response_with_no_header_terminator() {
        assert!(parse_announce_response(b"not an http response").is_err());
    }
}
