//! Firehose frame decoding.
//!
//! A frame is two concatenated DAG-CBOR values: a header `{op, t}` and a body.
//! `op == 1` is a message whose type is named by `t` (`#commit`, `#identity`,
//! ...); `op == -1` is an error frame with body `{error, message?}`.
//!
//! `#commit` bodies carry the operations of one repository commit plus a CAR
//! v1 archive (`blocks`) holding the record blocks those operations point at.
//! Record blocks are decoded into `serde_json::Value` with links rendered as
//! `{"$link": "<cid>"}` and byte strings as `{"$bytes": "<base64>"}`.

use std::io::Cursor;

use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use ciborium::Value as Cbor;
use cid::Cid;
use serde_json::{Map, Number, Value};

use crate::error::DecodeError;

/// CBOR tag for content-addressed links.
const CID_TAG: u64 = 42;

/// A decoded firehose frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A repository commit.
    Commit(CommitEvent),
    /// The relay reported an error and will close the stream.
    Error {
        error: String,
        message: Option<String>,
    },
    /// Any other message type (`#identity`, `#account`, `#info`, ...).
    Other(String),
}

/// Body of a `#commit` message.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitEvent {
    pub seq: i64,
    /// DID of the repository.
    pub repo: String,
    pub ops: Vec<RepoOp>,
    /// CAR v1 archive of blocks referenced by `ops`.
    pub blocks: Vec<u8>,
    /// The relay omitted blocks because the commit was too large.
    pub too_big: bool,
}

/// One record operation within a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoOp {
    /// `create`, `update` or `delete`.
    pub action: String,
    /// `<collection>/<rkey>`.
    pub path: String,
    /// Block identifier of the new record. `None` for deletes.
    pub cid: Option<String>,
}

impl RepoOp {
    /// Collection NSID portion of the path.
    pub fn collection(&self) -> &str {
        self.path.split('/').next().unwrap_or_default()
    }

    pub fn is_create(&self) -> bool {
        self.action == "create"
    }
}

/// Turns raw frame bytes into commits and record payloads.
///
/// The ingestor only depends on this trait, so the wire decoding can be
/// swapped without touching connection handling.
pub trait CommitDecoder: Send + Sync {
    /// Decode a binary WebSocket message into a [`Frame`].
    fn decode_frame(&self, bytes: &[u8]) -> Result<Frame, DecodeError>;

    /// Decode the block identified by `cid` out of a commit's archive.
    fn decode_block(&self, commit: &CommitEvent, cid: &str) -> Result<Value, DecodeError>;
}

/// DAG-CBOR + CAR v1 decoder for `com.atproto.sync.subscribeRepos`.
#[derive(Debug, Default, Clone, Copy)]
pub struct CarCommitDecoder;

impl CommitDecoder for CarCommitDecoder {
    fn decode_frame(&self, bytes: &[u8]) -> Result<Frame, DecodeError> {
        let mut reader = bytes;

        let header: Cbor = ciborium::from_reader(&mut reader)
            .map_err(|e| DecodeError::Cbor(format!("header: {e}")))?;
        let header = as_map(&header).ok_or_else(|| DecodeError::Header("not a map".into()))?;

        let op = map_get(header, "op")
            .and_then(as_i64)
            .ok_or_else(|| DecodeError::Header("missing op".into()))?;

        if op == -1 {
            let body: Cbor = ciborium::from_reader(&mut reader)
                .map_err(|e| DecodeError::Cbor(format!("error body: {e}")))?;
            let body = as_map(&body).ok_or_else(|| DecodeError::Body("not a map".into()))?;
            return Ok(Frame::Error {
                error: map_get(body, "error")
                    .and_then(as_text)
                    .unwrap_or("Unknown")
                    .to_string(),
                message: map_get(body, "message").and_then(as_text).map(str::to_string),
            });
        }

        if op != 1 {
            return Err(DecodeError::Header(format!("unknown op {op}")));
        }

        let kind = map_get(header, "t")
            .and_then(as_text)
            .ok_or_else(|| DecodeError::Header("missing t".into()))?;

        if kind != "#commit" {
            return Ok(Frame::Other(kind.to_string()));
        }

        let body: Cbor = ciborium::from_reader(&mut reader)
            .map_err(|e| DecodeError::Cbor(format!("commit body: {e}")))?;
        parse_commit(&body).map(Frame::Commit)
    }

    fn decode_block(&self, commit: &CommitEvent, cid: &str) -> Result<Value, DecodeError> {
        let wanted = Cid::try_from(cid).map_err(|e| DecodeError::Cid(e.to_string()))?;

        let data = find_block(&commit.blocks, &wanted)?
            .ok_or_else(|| DecodeError::MissingBlock(cid.to_string()))?;

        let block: Cbor = ciborium::from_reader(data)
            .map_err(|e| DecodeError::Cbor(format!("block {cid}: {e}")))?;
        Ok(cbor_to_json(&block))
    }
}

fn parse_commit(body: &Cbor) -> Result<CommitEvent, DecodeError> {
    let body = as_map(body).ok_or_else(|| DecodeError::Body("not a map".into()))?;

    let seq = map_get(body, "seq")
        .and_then(as_i64)
        .ok_or_else(|| DecodeError::Body("missing seq".into()))?;
    let repo = map_get(body, "repo")
        .and_then(as_text)
        .ok_or_else(|| DecodeError::Body("missing repo".into()))?
        .to_string();
    let too_big = matches!(map_get(body, "tooBig"), Some(Cbor::Bool(true)));

    let blocks = match map_get(body, "blocks") {
        Some(Cbor::Bytes(bytes)) => bytes.clone(),
        None | Some(Cbor::Null) => Vec::new(),
        Some(_) => return Err(DecodeError::Body("blocks is not a byte string".into())),
    };

    let ops = match map_get(body, "ops") {
        Some(Cbor::Array(items)) => items
            .iter()
            .map(parse_op)
            .collect::<Result<Vec<_>, _>>()?,
        _ => return Err(DecodeError::Body("missing ops".into())),
    };

    Ok(CommitEvent {
        seq,
        repo,
        ops,
        blocks,
        too_big,
    })
}

fn parse_op(op: &Cbor) -> Result<RepoOp, DecodeError> {
    let op = as_map(op).ok_or_else(|| DecodeError::Body("op is not a map".into()))?;

    let action = map_get(op, "action")
        .and_then(as_text)
        .ok_or_else(|| DecodeError::Body("op missing action".into()))?;
    let path = map_get(op, "path")
        .and_then(as_text)
        .ok_or_else(|| DecodeError::Body("op missing path".into()))?;
    let cid = match map_get(op, "cid") {
        None | Some(Cbor::Null) => None,
        Some(link) => Some(link_to_cid(link)?.to_string()),
    };

    Ok(RepoOp {
        action: action.to_string(),
        path: path.to_string(),
        cid,
    })
}

/// Decode a tag-42 link. The payload carries a leading multibase `0x00` byte.
fn link_to_cid(value: &Cbor) -> Result<Cid, DecodeError> {
    match value {
        Cbor::Tag(CID_TAG, inner) => match inner.as_ref() {
            Cbor::Bytes(bytes) => {
                let raw = bytes.strip_prefix(&[0u8]).unwrap_or(bytes.as_slice());
                Cid::try_from(raw).map_err(|e| DecodeError::Cid(e.to_string()))
            }
            _ => Err(DecodeError::Cid("link payload is not bytes".into())),
        },
        _ => Err(DecodeError::Cid("expected tag 42".into())),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// CAR v1
// ═══════════════════════════════════════════════════════════════════════════

/// Scan a CAR v1 archive for the block with identifier `wanted`.
fn find_block<'a>(car: &'a [u8], wanted: &Cid) -> Result<Option<&'a [u8]>, DecodeError> {
    let mut pos = 0usize;

    let header_len = read_varint(car, &mut pos)?;
    pos = advance(car, pos, header_len)?;

    while pos < car.len() {
        let section_len = read_varint(car, &mut pos)?;
        let end = advance(car, pos, section_len)?;
        let section = &car[pos..end];

        let mut cursor = Cursor::new(section);
        let cid = Cid::read_bytes(&mut cursor).map_err(|e| DecodeError::Car(e.to_string()))?;
        if &cid == wanted {
            let data_start = usize::try_from(cursor.position())
                .map_err(|_| DecodeError::Car("section offset overflow".into()))?;
            return Ok(Some(&section[data_start..]));
        }

        pos = end;
    }

    Ok(None)
}

/// Read an unsigned LEB128 varint starting at `pos`.
fn read_varint(buf: &[u8], pos: &mut usize) -> Result<usize, DecodeError> {
    let mut value: u64 = 0;
    for shift in (0..64).step_by(7) {
        let byte = *buf
            .get(*pos)
            .ok_or_else(|| DecodeError::Car("truncated varint".into()))?;
        *pos += 1;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return usize::try_from(value).map_err(|_| DecodeError::Car("varint overflow".into()));
        }
    }
    Err(DecodeError::Car("varint too long".into()))
}

fn advance(buf: &[u8], pos: usize, len: usize) -> Result<usize, DecodeError> {
    pos.checked_add(len)
        .filter(|end| *end <= buf.len())
        .ok_or_else(|| DecodeError::Car("truncated section".into()))
}

// ═══════════════════════════════════════════════════════════════════════════
// CBOR helpers
// ═══════════════════════════════════════════════════════════════════════════

fn as_map(value: &Cbor) -> Option<&[(Cbor, Cbor)]> {
    match value {
        Cbor::Map(entries) => Some(entries),
        _ => None,
    }
}

fn map_get<'a>(entries: &'a [(Cbor, Cbor)], key: &str) -> Option<&'a Cbor> {
    entries
        .iter()
        .find(|(k, _)| matches!(k, Cbor::Text(text) if text == key))
        .map(|(_, v)| v)
}

fn as_text(value: &Cbor) -> Option<&str> {
    match value {
        Cbor::Text(text) => Some(text),
        _ => None,
    }
}

fn as_i64(value: &Cbor) -> Option<i64> {
    match value {
        Cbor::Integer(int) => i64::try_from(*int).ok(),
        _ => None,
    }
}

/// Convert a DAG-CBOR value into the JSON data model.
fn cbor_to_json(value: &Cbor) -> Value {
    match value {
        Cbor::Null => Value::Null,
        Cbor::Bool(b) => Value::Bool(*b),
        Cbor::Integer(int) => {
            let wide = i128::from(*int);
            if let Ok(n) = i64::try_from(wide) {
                Value::Number(n.into())
            } else if let Ok(n) = u64::try_from(wide) {
                Value::Number(n.into())
            } else {
                Value::String(wide.to_string())
            }
        }
        Cbor::Float(f) => Number::from_f64(*f).map_or(Value::Null, Value::Number),
        Cbor::Text(text) => Value::String(text.clone()),
        Cbor::Bytes(bytes) => {
            let mut obj = Map::new();
            obj.insert("$bytes".into(), Value::String(STANDARD_NO_PAD.encode(bytes)));
            Value::Object(obj)
        }
        Cbor::Array(items) => Value::Array(items.iter().map(cbor_to_json).collect()),
        Cbor::Map(entries) => Value::Object(
            entries
                .iter()
                .filter_map(|(k, v)| match k {
                    Cbor::Text(key) => Some((key.clone(), cbor_to_json(v))),
                    _ => None,
                })
                .collect(),
        ),
        Cbor::Tag(CID_TAG, _) => match link_to_cid(value) {
            Ok(cid) => {
                let mut obj = Map::new();
                obj.insert("$link".into(), Value::String(cid.to_string()));
                Value::Object(obj)
            }
            Err(_) => Value::Null,
        },
        Cbor::Tag(_, inner) => cbor_to_json(inner),
        _ => Value::Null,
    }
}
