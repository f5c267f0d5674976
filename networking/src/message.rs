use std::fmt;
use std::io::{self, Read, Write};

use bincode::Options;
use ledger::{AccountBlock, Address, CompressedFileMeta, Hash, HashHeight, SnapshotBlock};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use snap::read::FrameDecoder;
use snap::write::FrameEncoder;
use thiserror::Error;

/// Upper bound on a single protocol payload.
pub const MAX_MESSAGE_SIZE: u64 = 64 * 1024 * 1024;

/// Upper bound on a decompressed ledger file.
pub const MAX_FILE_SIZE: u64 = 512 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("empty payload")]
    Empty,

    #[error("payload size {size} exceeds maximum of {max}")]
    TooLarge { size: u64, max: u64 },

    #[error("unknown message code {0}")]
    UnknownCode(u8),

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("snappy framing failed: {0}")]
    Compression(#[from] io::Error),
}

/// Protocol message codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MsgCode {
    Handshake = 1,
    Status = 2,
    GetSubLedger = 3,
    GetChunk = 4,
    GetAccountBlocks = 5,
    FileList = 6,
    SubLedger = 7,
    AccountBlocks = 8,
    NewSnapshotBlock = 9,
    NewAccountBlock = 10,
    Exception = 11,
}

impl MsgCode {
    pub fn from_code(code: u8) -> Result<Self, CodecError> {
        Ok(match code {
            1 => MsgCode::Handshake,
            2 => MsgCode::Status,
            3 => MsgCode::GetSubLedger,
            4 => MsgCode::GetChunk,
            5 => MsgCode::GetAccountBlocks,
            6 => MsgCode::FileList,
            7 => MsgCode::SubLedger,
            8 => MsgCode::AccountBlocks,
            9 => MsgCode::NewSnapshotBlock,
            10 => MsgCode::NewAccountBlock,
            11 => MsgCode::Exception,
            other => return Err(CodecError::UnknownCode(other)),
        })
    }

    pub fn code(&self) -> u8 {
        *self as u8
    }
}

impl fmt::Display for MsgCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Envelope carried by the transport. `id` correlates a response with the
/// request that caused it; unsolicited messages carry id 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Msg {
    pub code: MsgCode,
    pub id: u64,
    pub payload: Vec<u8>,
}

impl Msg {
    pub fn new<T: Serialize>(code: MsgCode, id: u64, payload: &T) -> Result<Self, CodecError> {
        Ok(Self {
            code,
            id,
            payload: encode(payload)?,
        })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        decode(&self.payload)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub network_id: u64,
    pub height: u64,
    pub head: Hash,
    pub genesis: Hash,
}

/// Head announcement sent whenever a peer's chain tip moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStatus {
    pub head: Hash,
    pub height: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetSubLedger {
    pub from: HashHeight,
    pub count: u64,
    pub forward: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetChunk {
    pub start: u64,
    pub end: u64,
}

/// Caller-facing request for a run of snapshot blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetSnapshotBlocks {
    pub from: HashHeight,
    pub count: u64,
    pub forward: bool,
}

impl GetSnapshotBlocks {
    /// Inclusive height range covered by this request, or `None` when empty.
    pub fn range(&self) -> Option<(u64, u64)> {
        if self.count == 0 {
            return None;
        }
        let start = self.from.height;
        if self.forward {
            Some((start, start.saturating_add(self.count - 1)))
        } else {
            Some((start.saturating_sub(self.count - 1), start))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetAccountBlocks {
    pub address: Address,
    pub from: HashHeight,
    pub count: u64,
    pub forward: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileList {
    pub files: Vec<CompressedFileMeta>,
    pub chunks: Vec<[u64; 2]>,
    pub nonce: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubLedger {
    pub snapshot_blocks: Vec<SnapshotBlock>,
    pub account_blocks: Vec<AccountBlock>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBlocks {
    pub address: Address,
    pub blocks: Vec<AccountBlock>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExceptionCode {
    Missing,
    Canceled,
    Unsupported,
}

/// Contents of one compressed ledger file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileBundle {
    pub snapshot_blocks: Vec<SnapshotBlock>,
    pub account_blocks: Vec<AccountBlock>,
}

fn bincode_options(limit: u64) -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(limit)
        .with_fixint_encoding()
        .allow_trailing_bytes()
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    bincode_options(MAX_MESSAGE_SIZE)
        .serialize(value)
        .map_err(|e| CodecError::Encode(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, CodecError> {
    if data.is_empty() {
        return Err(CodecError::Empty);
    }
    if data.len() as u64 > MAX_MESSAGE_SIZE {
        return Err(CodecError::TooLarge {
            size: data.len() as u64,
            max: MAX_MESSAGE_SIZE,
        });
    }
    bincode_options(MAX_MESSAGE_SIZE)
        .deserialize(data)
        .map_err(|e| CodecError::Decode(e.to_string()))
}

/// Serialize and snappy-frame a file bundle.
pub fn encode_file(bundle: &FileBundle) -> Result<Vec<u8>, CodecError> {
    let raw = bincode_options(MAX_FILE_SIZE)
        .serialize(bundle)
        .map_err(|e| CodecError::Encode(e.to_string()))?;
    let mut encoder = FrameEncoder::new(Vec::new());
    encoder.write_all(&raw)?;
    encoder
        .into_inner()
        .map_err(|e| CodecError::Compression(io::Error::other(e.to_string())))
}

pub fn decode_file(data: &[u8]) -> Result<FileBundle, CodecError> {
    if data.is_empty() {
        return Err(CodecError::Empty);
    }
    let mut decoder = FrameDecoder::new(data).take(MAX_FILE_SIZE + 1);
    let mut raw = Vec::new();
    decoder.read_to_end(&mut raw)?;
    if raw.len() as u64 > MAX_FILE_SIZE {
        return Err(CodecError::TooLarge {
            size: raw.len() as u64,
            max: MAX_FILE_SIZE,
        });
    }
    bincode_options(MAX_FILE_SIZE)
        .deserialize(&raw)
        .map_err(|e| CodecError::Decode(e.to_string()))
}
