use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

/// Explicit configuration for one engine instance. Threaded through
/// construction of the coordinators, registry and tracker client instead of
/// relying on process-wide constants (see Design Notes, "Global state").
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root directory downloads are written under (`downloads/<name>` per
    /// file, mirrored for multi-file torrents).
    pub download_dir: PathBuf,
    /// Maximum number of simultaneously connected peers.
    pub max_peers: usize,
    /// Worker pool size servicing inbound REQUESTs.
    pub request_workers: usize,
    /// Worker pool size assembling (hashing + writing) completed pieces.
    pub assembly_workers: usize,
    /// Port range an upload coordinator picks an ephemeral listen port from.
    pub listen_port_range: RangeInclusive<u16>,
    /// How often the download coordinator re-announces to pick up new peers.
    pub tracker_reannounce_interval: Duration,
    /// TCP connect timeout for outbound peer connections.
    pub connect_timeout: Duration,
    /// How long a PENDING block may go unanswered before it is demoted
    /// back to FREE.
    pub block_timeout: Duration,
    /// Listen port advertised to trackers while downloading.
    pub download_listen_port: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            download_dir: PathBuf::from("downloads"),
            max_peers: 8,
            request_workers: 3,
            assembly_workers: 4,
            listen_port_range: 6666..=9999,
            tracker_reannounce_interval: Duration::from_secs(25),
            connect_timeout: Duration::from_secs(5),
            block_timeout: Duration::from_secs(120),
            download_listen_port: 6881,
        }
    }
}
