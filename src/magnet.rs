//! Magnet URI parsing
//!
//! Parses magnet URIs of the form `magnet:?xt=urn:btih:<hash>&dn=<name>` and
//! extracts the info-hash used as the job key. Both the 40-char hex and the
//! 32-char base32 encodings of the `btih` parameter are accepted; base32 is
//! decoded and normalized to lowercase hex.
//!
//! Uploaded .torrent files are handled just far enough to recover the same
//! info-hash: the bencoded `info` dictionary is located and SHA-1 hashed,
//! without interpreting its contents.

use crate::error::{BrokerError, Result};
use crate::types::InfoHash;
use sha1::{Digest, Sha1};

/// Parsed magnet URI
#[derive(Debug, Clone)]
pub struct Magnet {
    /// Info hash, normalized to lowercase hex
    pub info_hash: InfoHash,
    /// Display name (`dn` parameter), if present
    pub display_name: Option<String>,
    /// Original URI string
    pub original_uri: String,
}

impl Magnet {
    /// Parse a magnet URI string.
    pub fn parse(uri: &str) -> Result<Self> {
        if !uri.starts_with("magnet:?") {
            return Err(BrokerError::invalid_input(
                "magnet",
                "URI must start with 'magnet:?'",
            ));
        }

        let query = &uri[8..];

        let mut info_hash: Option<InfoHash> = None;
        let mut display_name: Option<String> = None;

        for param in query.split('&') {
            let (key, value) = match param.split_once('=') {
                Some((k, v)) => (k, v),
                None => continue,
            };

            let value = url_decode(value);

            match key {
                "xt" => {
                    if let Some(hash) = parse_btih(&value) {
                        info_hash = Some(hash);
                    }
                }
                "dn" => {
                    if !value.is_empty() {
                        display_name = Some(value);
                    }
                }
                // Trackers and the other magnet extensions are irrelevant
                // here: the debrid service joins the swarm, not us.
                _ => {}
            }
        }

        let info_hash = info_hash.ok_or_else(|| {
            BrokerError::invalid_input("magnet", "missing or invalid 'xt' parameter (info hash)")
        })?;

        Ok(Magnet {
            info_hash,
            display_name,
            original_uri: uri.to_string(),
        })
    }

    /// Display name or the hex hash when the magnet carries no `dn`.
    pub fn name(&self) -> String {
        self.display_name
            .clone()
            .unwrap_or_else(|| self.info_hash.as_str().to_string())
    }
}

/// Parse a BitTorrent info hash from an xt parameter.
///
/// Supports both hex (40 chars) and base32 (32 chars) formats.
fn parse_btih(xt: &str) -> Option<InfoHash> {
    let hash_str = xt.strip_prefix("urn:btih:")?;

    match hash_str.len() {
        40 => InfoHash::parse(hash_str),
        32 => base32_decode(hash_str).map(|bytes| InfoHash::from_bytes(&bytes)),
        _ => None,
    }
}

/// Decode base32 (RFC 4648) to a 20-byte SHA-1 digest
fn base32_decode(input: &str) -> Option<[u8; 20]> {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

    let input = input.to_uppercase();
    let input = input.as_bytes();

    if input.len() != 32 {
        return None;
    }

    let mut bits = 0u64;
    let mut bit_count = 0u32;
    let mut output = Vec::with_capacity(20);

    for &c in input {
        let val = ALPHABET.iter().position(|&x| x == c)? as u64;
        bits = (bits << 5) | val;
        bit_count += 5;

        while bit_count >= 8 {
            bit_count -= 8;
            output.push((bits >> bit_count) as u8);
            bits &= (1 << bit_count) - 1;
        }
    }

    if output.len() == 20 {
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&output);
        Some(hash)
    } else {
        None
    }
}

/// URL-decode a string with proper UTF-8 handling
fn url_decode(s: &str) -> String {
    let mut bytes = Vec::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '%' {
            let mut hex = String::with_capacity(2);
            if let Some(&h1) = chars.peek() {
                if h1.is_ascii_hexdigit() {
                    hex.push(chars.next().unwrap());
                    if let Some(&h2) = chars.peek() {
                        if h2.is_ascii_hexdigit() {
                            hex.push(chars.next().unwrap());
                        }
                    }
                }
            }
            if hex.len() == 2 {
                if let Ok(byte) = u8::from_str_radix(&hex, 16) {
                    bytes.push(byte);
                    continue;
                }
            }
            bytes.push(b'%');
            bytes.extend(hex.as_bytes());
        } else if c == '+' {
            bytes.push(b' ');
        } else {
            let mut buf = [0u8; 4];
            bytes.extend(c.encode_utf8(&mut buf).as_bytes());
        }
    }

    String::from_utf8(bytes).unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).to_string())
}

/// Extract the info-hash from raw .torrent bytes.
///
/// The metainfo file is a bencoded dictionary; the info-hash is the SHA-1 of
/// the raw bytes of its `info` value. We locate that value by walking the
/// bencode structure and hash the slice verbatim — nothing inside it is
/// decoded or validated.
pub fn torrent_info_hash(data: &[u8]) -> Result<InfoHash> {
    let err = || BrokerError::invalid_input("torrent", "not a valid metainfo file");

    if data.first() != Some(&b'd') {
        return Err(err());
    }

    let mut pos = 1;
    while pos < data.len() && data[pos] != b'e' {
        let (key, key_end) = read_bencode_string(data, pos).ok_or_else(err)?;
        let value_end = skip_bencode_value(data, key_end).ok_or_else(err)?;

        if key == b"info" {
            let mut hasher = Sha1::new();
            hasher.update(&data[key_end..value_end]);
            let digest: [u8; 20] = hasher.finalize().into();
            return Ok(InfoHash::from_bytes(&digest));
        }
        pos = value_end;
    }

    Err(err())
}

/// Read a bencoded string header at `pos`; returns (contents, end offset).
fn read_bencode_string(data: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    let colon = data[pos..].iter().position(|&b| b == b':')? + pos;
    let len: usize = std::str::from_utf8(&data[pos..colon]).ok()?.parse().ok()?;
    let start = colon + 1;
    let end = start.checked_add(len)?;
    if end > data.len() {
        return None;
    }
    Some((&data[start..end], end))
}

/// Skip one bencoded value starting at `pos`; returns the offset past it.
fn skip_bencode_value(data: &[u8], pos: usize) -> Option<usize> {
    match data.get(pos)? {
        b'i' => {
            let end = data[pos..].iter().position(|&b| b == b'e')? + pos;
            Some(end + 1)
        }
        b'l' | b'd' => {
            let mut p = pos + 1;
            while *data.get(p)? != b'e' {
                p = skip_bencode_value(data, p)?;
            }
            Some(p + 1)
        }
        b'0'..=b'9' => read_bencode_string(data, pos).map(|(_, end)| end),
        _ => None,
    }
}
