//! Parses a `.torrent` metainfo file into the normalized view the rest of
//! the engine works with: content identity, piece hashes, file layout and
//! the piece→file mapping used by the piece store (spec §3, §4.2).

use serde::{Deserialize, Serialize};
use serde_bencode::{from_bytes, to_bytes};
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};
use std::io::Read;
use std::path::PathBuf;

use crate::error::EngineError;

const SHA1_LEN: usize = 20;

#[derive(Debug, Deserialize, Serialize)]
struct RawFile {
    path: Vec<String>,
    length: i64,
}

#[derive(Debug, Deserialize, Serialize)]
struct RawInfo {
    name: String,
    pieces: ByteBuf,
    #[serde(rename = "piece length")]
    piece_length: i64,
    #[serde(default)]
    length: Option<i64>,
    #[serde(default)]
    files: Option<Vec<RawFile>>,
}

#[derive(Debug, Deserialize, Serialize)]
struct RawTorrent {
    info: RawInfo,
    #[serde(default)]
    announce: Option<String>,
    #[serde(default)]
    #[serde(rename = "announce-list")]
    announce_list: Option<Vec<Vec<String>>>,
}

/// One file within the torrent's (possibly single-file) layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: Vec<String>,
    pub length: u64,
}

/// One contiguous slice of a piece that lies within a single underlying
/// file, identified by index into `Metainfo::files` (arena + index, per
/// Design Notes "Cyclic references").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSpan {
    pub file_index: usize,
    pub file_offset: u64,
    pub piece_offset: u64,
    pub length: u64,
}

/// The normalized, immutable view of a parsed `.torrent` file.
#[derive(Debug, Clone)]
pub struct Metainfo {
    pub name: String,
    pub info_hash: [u8; 20],
    pub piece_length: u64,
    pub piece_hashes: Vec<[u8; 20]>,
    pub files: Vec<FileEntry>,
    pub total_length: u64,
    pub announce_list: Vec<String>,
    /// `piece_file_mapping[i]` lists the file spans piece `i` is made of,
    /// in file order. Every piece has at least one entry; every file
    /// appears in at least one piece's mapping.
    pub piece_file_mapping: Vec<Vec<FileSpan>>,
}

impl Metainfo {
    pub fn from_bytes(bytes: &[u8]) -> Result<Metainfo, EngineError> {
        let raw: RawTorrent = from_bytes(bytes)?;
        Metainfo::from_raw(raw)
    }

    pub fn from_path(path: &std::path::Path) -> Result<Metainfo, EngineError> {
        let mut file = std::fs::File::open(path)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        Metainfo::from_bytes(&buf)
    }

    fn from_raw(raw: RawTorrent) -> Result<Metainfo, EngineError> {
        if raw.info.piece_length <= 0 {
            return Err(EngineError::InvalidMetainfo(
                "piece length must be positive".into(),
            ));
        }
        if raw.info.pieces.len() % SHA1_LEN != 0 {
            return Err(EngineError::InvalidMetainfo(
                "pieces field is not a multiple of 20 bytes".into(),
            ));
        }
        let piece_length = raw.info.piece_length as u64;
        let piece_hashes: Vec<[u8; 20]> = raw
            .info
            .pieces
            .chunks(SHA1_LEN)
            .map(|chunk| {
                let mut arr = [0u8; 20];
                arr.copy_from_slice(chunk);
                arr
            })
            .collect();

        let files = match (&raw.info.length, &raw.info.files) {
            (Some(len), None) => vec![FileEntry {
                path: vec![raw.info.name.clone()],
                length: *len as u64,
            }],
            (None, Some(files)) => files
                .iter()
                .map(|f| FileEntry {
                    path: f.path.clone(),
                    length: f.length as u64,
                })
                .collect(),
            _ => {
                return Err(EngineError::InvalidMetainfo(
                    "info dict must have exactly one of `length` or `files`".into(),
                ))
            }
        };
        if files.is_empty() {
            return Err(EngineError::InvalidMetainfo("no files listed".into()));
        }
        let total_length: u64 = files.iter().map(|f| f.length).sum();

        let expected_pieces = ((total_length + piece_length - 1) / piece_length).max(1) as usize;
        if expected_pieces != piece_hashes.len() {
            return Err(EngineError::InvalidMetainfo(format!(
                "piece count mismatch: {} hashes but {} implied by file lengths",
                piece_hashes.len(),
                expected_pieces
            )));
        }

        let info_hash = {
            let encoded = to_bytes(&raw.info)?;
            let mut hasher = Sha1::new();
            hasher.update(&encoded);
            let digest = hasher.finalize();
            let mut arr = [0u8; 20];
            arr.copy_from_slice(&digest);
            arr
        };

        let mut announce_list = Vec::new();
        if let Some(lists) = &raw.announce_list {
            for group in lists {
                for url in group {
                    announce_list.push(url.clone());
                }
            }
        }
        if let Some(announce) = &raw.announce {
            if !announce_list.contains(announce) {
                announce_list.insert(0, announce.clone());
            }
        }

        let piece_file_mapping = build_piece_file_mapping(&files, piece_length, piece_hashes.len());

        Ok(Metainfo {
            name: raw.info.name,
            info_hash,
            piece_length,
            piece_hashes,
            files,
            total_length,
            announce_list,
            piece_file_mapping,
        })
    }

    pub fn number_of_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Length of the given piece; the last piece is the remainder of
    /// `total_length` and may be shorter than `piece_length`.
    pub fn piece_size(&self, piece_index: usize) -> u64 {
        if piece_index + 1 == self.number_of_pieces() {
            self.total_length - (piece_index as u64) * self.piece_length
        } else {
            self.piece_length
        }
    }

    /// Root directory downloaded content is written under, relative to a
    /// caller-supplied download directory (spec §6 on-disk layout).
    pub fn root_dir(&self, download_dir: &std::path::Path) -> PathBuf {
        download_dir.join(&self.name)
    }

    /// The on-disk path for one file entry, honoring the single-file vs
    /// multi-file layout distinction.
    pub fn file_path(&self, download_dir: &std::path::Path, file_index: usize) -> PathBuf {
        let file = &self.files[file_index];
        if self.files.len() == 1 && file.path.len() == 1 && file.path[0] == self.name {
            download_dir.join(&self.name)
        } else {
            let mut p = self.root_dir(download_dir);
            for component in &file.path {
                p.push(component);
            }
            p
        }
    }
}

/// Walks files in declared order, partitioning their byte ranges at every
/// piece boundary (spec §4.2), grounded on the reference implementation's
/// `pieces_manager.py::_load_files`.
fn build_piece_file_mapping(
    files: &[FileEntry],
    piece_length: u64,
    number_of_pieces: usize,
) -> Vec<Vec<FileSpan>> {
    let mut mapping: Vec<Vec<FileSpan>> = vec![Vec::new(); number_of_pieces];
    let mut global_offset: u64 = 0;

    for (file_index, file) in files.iter().enumerate() {
        let mut remaining = file.length;
        let mut file_offset: u64 = 0;

        while remaining > 0 {
            let piece_index = (global_offset / piece_length) as usize;
            let piece_offset = global_offset % piece_length;
            let piece_len_here = piece_length - piece_offset;
            let take = remaining.min(piece_len_here);

            mapping[piece_index].push(FileSpan {
                file_index,
                file_offset,
                piece_offset,
                length: take,
            });

            global_offset += take;
            file_offset += take;
            remaining -= take;
        }
    }

    mapping
}

/// Tiny `Metainfo` fixtures for tests elsewhere in the crate that need a
/// value to construct a type around but don't exercise parsing itself.
#[cfg(test)]
pub(crate) mod tests_support {
    use super::{FileEntry, FileSpan, Metainfo};

    pub fn tiny_single_file(_unused_dir: &std::path::Path) -> Metainfo {
        Metainfo {
            name: "fixture.bin".into(),
            info_hash: [0u8; 20],
            piece_length: 16384,
            piece_hashes: vec![[0u8; 20]],
            files: vec![FileEntry {
                path: vec!["fixture.bin".into()],
                length: 16,
            }],
            total_length: 16,
            announce_list: vec![],
            piece_file_mapping: vec![vec![FileSpan {
                file_index: 0,
                file_offset: 0,
                piece_offset: 0,
                length: 16,
            }]],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_bencode::to_bytes as ben_to_bytes;

    fn make_single_file_torrent(content: &[u8], piece_length: i64) -> Vec<u8> {
        let num_pieces = ((content.len() as i64 + piece_length - 1) / piece_length).max(1);
        let mut pieces = Vec::new();
        for i in 0..num_pieces {
            let start = (i * piece_length) as usize;
            let end = ((i + 1) * piece_length).min(content.len() as i64) as usize;
            let mut hasher = Sha1::new();
            hasher.update(&content[start..end]);
            pieces.extend_from_slice(&hasher.finalize());
        }
        let info = RawInfo {
            name: "file.bin".to_string(),
            pieces: ByteBuf::from(pieces),
            piece_length,
            length: Some(content.len() as i64),
            files: None,
        };
        let raw = RawTorrent {
            info,
            announce: Some("http://tracker.example:6969/announce".to_string()),
            announce_list: None,
        };
        ben_to_bytes(&raw).unwrap()
    }

    #[test]
    fn single_file_single_piece_scenario() {
        let content: Vec<u8> = (0u8..=0x0F).collect();
        let bytes = make_single_file_torrent(&content, 16384);
        let meta = Metainfo::from_bytes(&bytes).unwrap();
        assert_eq!(meta.number_of_pieces(), 1);
        assert_eq!(meta.total_length, 16);
        assert_eq!(meta.piece_size(0), 16);
        assert_eq!(meta.announce_list, vec!["http://tracker.example:6969/announce"]);
    }

    #[test]
    fn rejects_bad_piece_length() {
        let mut bytes =
            make_single_file_torrent(&[0u8; 16], 16384).to_vec();
        // Corrupt by re-encoding with piece_length <= 0 directly.
        let info = RawInfo {
            name: "x".into(),
            pieces: ByteBuf::from(vec![0u8; 20]),
            piece_length: 0,
            length: Some(16),
            files: None,
        };
        let raw = RawTorrent {
            info,
            announce: None,
            announce_list: None,
        };
        bytes = ben_to_bytes(&raw).unwrap();
        assert!(Metainfo::from_bytes(&bytes).is_err());
    }

    #[test]
    fn two_file_two_piece_straddling_boundary() {
        // File A length 20000, File B length 13000, piece length 16384.
        let info = RawInfo {
            name: "multi".into(),
            pieces: ByteBuf::from(vec![0u8; 20 * 3]),
            piece_length: 16384,
            length: None,
            files: Some(vec![
                RawFile {
                    path: vec!["A.bin".into()],
                    length: 20000,
                },
                RawFile {
                    path: vec!["B.bin".into()],
                    length: 13000,
                },
            ]),
        };
        let raw = RawTorrent {
            info,
            announce: Some("http://tracker.example:6969/announce".into()),
            announce_list: None,
        };
        let bytes = ben_to_bytes(&raw).unwrap();
        let meta = Metainfo::from_bytes(&bytes).unwrap();

        assert_eq!(meta.number_of_pieces(), 3);
        assert_eq!(meta.piece_file_mapping[0].len(), 1);
        assert_eq!(meta.piece_file_mapping[1].len(), 2);
        assert_eq!(meta.piece_file_mapping[2].len(), 1);

        for (i, spans) in meta.piece_file_mapping.iter().enumerate() {
            let total: u64 = spans.iter().map(|s| s.length).sum();
            assert_eq!(total, meta.piece_size(i));
        }

        assert_eq!(meta.piece_size(2), 232);
    }

    #[test]
    fn rejects_piece_count_mismatch() {
        let info = RawInfo {
            name: "x".into(),
            pieces: ByteBuf::from(vec![0u8; 20]), // implies 1 piece
            piece_length: 16384,
            length: Some(32000), // implies 2 pieces
            files: None,
        };
        let raw = RawTorrent {
            info,
            announce: None,
            announce_list: None,
        };
        let bytes = ben_to_bytes(&raw).unwrap();
        assert!(Metainfo::from_bytes(&bytes).is_err());
    }
}
