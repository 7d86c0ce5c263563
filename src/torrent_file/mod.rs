// SPDX-FileCopyrightText: 2025 The seedcore Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod parser;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::torrent_file::parser::ParseError;

pub const HASH_LENGTH: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Torrent {
    // Raw bencoded `info` dictionary, filled in by the parser after
    // deserialization. The info hash is computed over these exact bytes.
    #[serde(skip)]
    pub info_dict_bencode: Vec<u8>,

    pub info: Info,
    pub announce: Option<String>,

    #[serde(rename = "announce-list", default)]
    pub announce_list: Option<Vec<Vec<String>>>,
}

impl Torrent {
    pub fn info_hash(&self) -> [u8; HASH_LENGTH] {
        Sha1::digest(&self.info_dict_bencode).into()
    }

    pub fn piece_hashes(&self) -> Result<Vec<[u8; HASH_LENGTH]>, ParseError> {
        if self.info.pieces.len() % HASH_LENGTH != 0 {
            return Err(ParseError::InvalidPieces(self.info.pieces.len()));
        }
        Ok(self
            .info
            .pieces
            .chunks_exact(HASH_LENGTH)
            .map(|chunk| {
                let mut hash = [0u8; HASH_LENGTH];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect())
    }

    pub fn piece_count(&self) -> usize {
        self.info.pieces.len() / HASH_LENGTH
    }

    /// Every announce URL the torrent knows about, tiers flattened.
    pub fn tracker_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self.announce.iter().cloned().collect();
        if let Some(tiers) = &self.announce_list {
            for url in tiers.iter().flatten() {
                if !urls.contains(url) {
                    urls.push(url.clone());
                }
            }
        }
        urls
    }

    pub fn file_list(&self) -> Vec<(Vec<String>, u64)> {
        if !self.info.files.is_empty() {
            self.info
                .files
                .iter()
                .map(|f| (f.path.clone(), f.length as u64))
                .collect()
        } else {
            // Single-file case: the torrent name is the file name
            vec![(vec![self.info.name.clone()], self.info.length as u64)]
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Info {
    #[serde(rename = "piece length")]
    pub piece_length: i64,

    #[serde(with = "serde_bytes")]
    #[serde(default)]
    pub pieces: Vec<u8>,

    #[serde(default)]
    pub private: Option<i64>,

    #[serde(default)]
    pub files: Vec<InfoFile>,

    pub name: String,

    #[serde(default)]
    pub length: i64,
}

impl Info {
    pub fn total_length(&self) -> i64 {
        if self.length > 0 {
            return self.length;
        }
        self.files.iter().map(|f| f.length).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct InfoFile {
    pub length: i64,

    pub path: Vec<String>,
}
