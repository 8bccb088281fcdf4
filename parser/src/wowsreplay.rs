use std::io::Read;
use std::path::Path;

use crypto::blowfish::Blowfish;
use crypto::symmetriccipher::BlockDecryptor;
use nom::{multi::length_data, number::complete::le_i32, number::complete::le_u32};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, ErrorKind};
use crate::types::Version;

pub const REPLAY_SIGNATURE: [u8; 4] = [0x12, 0x32, 0x34, 0x11];

const BLOWFISH_KEY: [u8; 16] = [
    0x29, 0xB7, 0xC9, 0x09, 0x38, 0x3F, 0x84, 0x88, 0xFA, 0x98, 0xEC, 0x4E, 0x13, 0x19, 0x79,
    0xFB,
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[allow(non_snake_case)]
#[serde(default)]
pub struct VehicleInfoMeta {
    pub shipId: u64,
    pub relation: u32,
    pub id: i64,
    pub name: String,
}

/// The JSON header stored in the first block of the container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[allow(non_snake_case)]
#[serde(default)]
pub struct ReplayMeta {
    pub matchGroup: String,
    pub gameMode: i64,
    pub clientVersionFromExe: String,
    pub clientVersionFromXml: String,
    pub scenarioUiCategoryId: i64,
    pub mapDisplayName: String,
    pub mapId: i64,
    pub mapName: String,
    pub playerID: i64,
    pub playerName: String,
    pub playerVehicle: String,
    pub scenario: String,
    pub duration: i64,
    pub gameType: String,
    pub dateTime: String,
    pub battleDuration: i64,
    pub vehicles: Vec<VehicleInfoMeta>,
}

pub struct ReplayFile {
    pub meta: ReplayMeta,
    /// Header as it was stored, including fields [`ReplayMeta`] doesn't model.
    pub raw_meta: serde_json::Value,
    /// Additional container blocks that carry JSON. Anything else is skipped.
    pub extra_data: Vec<serde_json::Value>,
    /// Decrypted and inflated packet stream.
    pub packet_data: Vec<u8>,
}

impl ReplayFile {
    pub fn from_file(path: &Path) -> Result<ReplayFile, ErrorKind> {
        let contents = std::fs::read(path)?;
        ReplayFile::from_bytes(&contents)
    }

    pub fn from_bytes(contents: &[u8]) -> Result<ReplayFile, ErrorKind> {
        unwrap_container(contents)
    }

    pub fn version(&self) -> Result<Version, ErrorKind> {
        Version::from_client_xml(&self.meta.clientVersionFromXml)
    }
}

fn truncated(what: &'static str) -> impl Fn(nom::Err<Error>) -> ErrorKind {
    move |_| ErrorKind::TruncatedContainer(what)
}

/// Strips the container around the packet stream: signature, JSON header,
/// opaque blocks, then Blowfish and zlib.
pub fn unwrap_container(contents: &[u8]) -> Result<ReplayFile, ErrorKind> {
    if contents.len() < REPLAY_SIGNATURE.len() || contents[..4] != REPLAY_SIGNATURE {
        return Err(ErrorKind::InvalidSignature {
            found: contents.iter().take(4).copied().collect(),
        });
    }
    let i = &contents[4..];

    let (i, block_count) = le_i32::<_, Error>(i).map_err(truncated("block count"))?;
    let (i, header) = length_data(le_u32::<_, Error>)(i).map_err(truncated("header"))?;

    let raw_meta: serde_json::Value = serde_json::from_slice(header)?;
    let meta: ReplayMeta = serde_json::from_value(raw_meta.clone())?;

    let mut i = i;
    let mut extra_data = Vec::new();
    for _ in 1..block_count.max(1) {
        let (rest, block) =
            length_data(le_u32::<_, Error>)(i).map_err(truncated("extra block"))?;
        match serde_json::from_slice(block) {
            Ok(value) => extra_data.push(value),
            Err(_) => debug!("skipping non-JSON container block of {} bytes", block.len()),
        }
        i = rest;
    }

    let packet_data = inflate(&decrypt(i))?;
    debug!(
        "unwrapped replay for {} ({} packet bytes)",
        meta.clientVersionFromXml,
        packet_data.len()
    );

    Ok(ReplayFile {
        meta,
        raw_meta,
        extra_data,
        packet_data,
    })
}

/// Blowfish-ECB with each block XORed against the previous plaintext block.
/// The first 8 byte chunk is not part of the payload.
fn decrypt(encrypted: &[u8]) -> Vec<u8> {
    let blowfish = Blowfish::new(&BLOWFISH_KEY);
    let mut decrypted = Vec::with_capacity(encrypted.len());
    let mut previous = [0u8; 8];

    for chunk in encrypted.chunks_exact(8).skip(1) {
        let mut block = [0u8; 8];
        blowfish.decrypt_block(chunk, &mut block);
        for (byte, prev) in block.iter_mut().zip(previous.iter()) {
            *byte ^= prev;
        }
        previous = block;
        decrypted.extend_from_slice(&block);
    }

    decrypted
}

fn inflate(compressed: &[u8]) -> Result<Vec<u8>, ErrorKind> {
    let mut packet_data = Vec::new();
    flate2::read::ZlibDecoder::new(compressed)
        .read_to_end(&mut packet_data)
        .map_err(ErrorKind::Inflate)?;
    Ok(packet_data)
}
