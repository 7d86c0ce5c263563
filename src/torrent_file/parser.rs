// SPDX-FileCopyrightText: 2025 The seedcore Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::torrent_file::{Info, Torrent};
use serde_bencode::de;
use serde_bencode::value::Value;

use std::fmt;

#[derive(Debug)]
pub enum ParseError {
    Bencode(serde_bencode::Error),
    MissingInfoDict,
    InvalidPieces(usize),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ParseError::Bencode(e) => write!(f, "Bencode parsing error: {}", e),
            ParseError::MissingInfoDict => write!(f, "Missing 'info' dictionary in torrent file"),
            ParseError::InvalidPieces(len) => {
                write!(f, "'pieces' length {} is not a multiple of 20", len)
            }
        }
    }
}

impl std::error::Error for ParseError {}

impl From<serde_bencode::Error> for ParseError {
    fn from(e: serde_bencode::Error) -> Self {
        ParseError::Bencode(e)
    }
}

/// Parses a complete `.torrent` file.
pub fn from_bytes(bencode_data: &[u8]) -> Result<Torrent, ParseError> {
    // Pull the raw `info` value out first so its exact encoding can be kept
    // for the info hash.
    let generic_bencode: Value = de::from_bytes(bencode_data)?;
    let info_dict_value = if let Value::Dict(mut top_level_dict) = generic_bencode {
        top_level_dict
            .remove("info".as_bytes())
            .ok_or(ParseError::MissingInfoDict)?
    } else {
        return Err(ParseError::MissingInfoDict);
    };
    let info_dict_bencode = serde_bencode::to_bytes(&info_dict_value)?;

    let mut torrent: Torrent = de::from_bytes(bencode_data)?;
    torrent.info_dict_bencode = info_dict_bencode;
    torrent.piece_hashes()?;

    Ok(torrent)
}

/// Parses a bare `info` dictionary, as assembled from peers during the
/// metadata exchange.
pub fn from_info_bytes(info_bytes: &[u8]) -> Result<Torrent, ParseError> {
    let info: Info = de::from_bytes(info_bytes)?;
    let torrent = Torrent {
        info_dict_bencode: info_bytes.to_vec(),
        info,
        announce: None,
        announce_list: None,
    };
    torrent.piece_hashes()?;
    Ok(torrent)
}

/// Wraps raw info bytes into a minimal `.torrent` document without
/// re-encoding them, so the info hash is preserved.
pub fn wrap_info_bytes(info_bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(info_bytes.len() + 8);
    out.extend_from_slice(b"d4:info");
    out.extend_from_slice(info_bytes);
    out.push(b'e');
    out
}
