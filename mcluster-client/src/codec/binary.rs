//! # Binary Protocol Encoding and Parsing
//!
//! Purpose: Frame requests with the 24-byte memcached binary header and map
//! response headers/status codes onto `Frame`.
//!
//! ## Notes
//! - Multi-get is pipelined as one quiet `GETKQ` per key followed by a `NOOP`.
//!   Misses produce nothing; the `NOOP` response is the terminal marker.
//! - Storage replies are normalised to text semantics: `ADD` on an existing
//!   key is `NotStored`, `REPLACE`/`APPEND`/`PREPEND` on a missing key is
//!   `NotStored`.
//! - Counters are sent with an exptime of `0xffffffff`, so a missing key is
//!   reported instead of created.

use std::io::BufRead;

use bytes::{Buf, BufMut, BytesMut};

use mcluster_common::{
    Header, Item, McError, McResult, Opcode, Status, StoreMode, HEADER_LEN, MAGIC_RESPONSE,
};

use super::{check_length, Frame, Request};

/// Counter exptime meaning "fail if the key does not exist".
const ARITH_NO_CREATE: u32 = 0xffff_ffff;

/// Encodes a binary request (or pipeline) into `out`.
///
/// Nothing is appended when a length does not fit the header.
pub fn encode(request: &Request<'_>, out: &mut BytesMut) -> McResult<()> {
    let mark = out.len();
    let result = encode_into(request, out);
    if result.is_err() {
        out.truncate(mark);
    }
    result
}

fn encode_into(request: &Request<'_>, out: &mut BytesMut) -> McResult<()> {
    match *request {
        Request::Get { keys, .. } => {
            for key in keys {
                put_header(out, Header::request(Opcode::GetKQ, key.len(), 0, 0)?);
                out.put_slice(key);
            }
            put_header(out, Header::request(Opcode::Noop, 0, 0, 0)?);
        }
        Request::Store {
            mode,
            key,
            value,
            flags,
            ttl,
        } => {
            let (opcode, cas) = match mode {
                StoreMode::Set => (Opcode::Set, 0),
                StoreMode::Add => (Opcode::Add, 0),
                StoreMode::Replace => (Opcode::Replace, 0),
                StoreMode::Append => (Opcode::Append, 0),
                StoreMode::Prepend => (Opcode::Prepend, 0),
                StoreMode::Cas(token) => (Opcode::Set, token),
            };
            let extras = if matches!(opcode, Opcode::Append | Opcode::Prepend) { 0 } else { 8 };

            let mut header = Header::request(opcode, key.len(), extras, value.len())?;
            header.cas = cas;
            put_header(out, header);
            if extras > 0 {
                out.put_u32(flags);
                out.put_u32(ttl.to_wire());
            }
            out.put_slice(key);
            out.put_slice(value);
        }
        Request::Delete { key } => {
            put_header(out, Header::request(Opcode::Delete, key.len(), 0, 0)?);
            out.put_slice(key);
        }
        Request::Touch { key, ttl } => {
            put_header(out, Header::request(Opcode::Touch, key.len(), 4, 0)?);
            out.put_u32(ttl.to_wire());
            out.put_slice(key);
        }
        Request::Arith { key, delta, incr } => {
            let opcode = if incr { Opcode::Increment } else { Opcode::Decrement };
            put_header(out, Header::request(opcode, key.len(), 20, 0)?);
            out.put_u64(delta);
            out.put_u64(0);
            out.put_u32(ARITH_NO_CREATE);
            out.put_slice(key);
        }
        Request::Flush { delay } => {
            if delay.as_secs() > 0 {
                put_header(out, Header::request(Opcode::Flush, 0, 4, 0)?);
                out.put_u32(delay.to_wire());
            } else {
                put_header(out, Header::request(Opcode::Flush, 0, 0, 0)?);
            }
        }
        Request::Version => put_header(out, Header::request(Opcode::Version, 0, 0, 0)?),
        Request::Stats => put_header(out, Header::request(Opcode::Stat, 0, 0, 0)?),
    }
    Ok(())
}

/// Reads one response packet and maps it onto a frame.
pub fn read_frame<R: BufRead>(
    reader: &mut R,
    body: &mut Vec<u8>,
    limit: Option<usize>,
) -> McResult<Frame> {
    let mut raw = [0u8; HEADER_LEN];
    reader.read_exact(&mut raw)?;
    let header = Header::decode(&raw);

    if header.magic != MAGIC_RESPONSE {
        return Err(McError::protocol(format!("bad response magic 0x{:02x}", header.magic)));
    }
    let opcode = Opcode::from_u8(header.opcode)
        .ok_or_else(|| McError::protocol(format!("unknown opcode 0x{:02x}", header.opcode)))?;
    let value_len = header
        .value_len()
        .ok_or_else(|| McError::protocol("body shorter than key and extras"))?;
    let status = header.status();

    if status == Status::NoError && opcode.is_retrieval() {
        check_length(value_len, limit)?;
    } else {
        check_length(value_len, None)?;
    }

    body.clear();
    body.resize(header.body_len as usize, 0);
    reader.read_exact(body)?;

    let extras_len = header.extras_len as usize;
    let key_end = extras_len + header.key_len as usize;
    let extras = &body[..extras_len];
    let key = &body[extras_len..key_end];
    let value = &body[key_end..];

    if status != Status::NoError {
        return Ok(map_status(opcode, status, value));
    }

    let frame = match opcode {
        Opcode::Get | Opcode::GetK | Opcode::GetKQ => {
            if extras_len != 4 {
                return Err(McError::protocol("retrieval response without flags"));
            }
            let flags = (&extras[..]).get_u32();
            Frame::Value(Item {
                key: key.to_vec(),
                value: value.to_vec(),
                flags,
                cas: header.cas,
            })
        }
        Opcode::Noop => Frame::End,
        Opcode::Set | Opcode::Add | Opcode::Replace | Opcode::Append | Opcode::Prepend => Frame::Stored,
        Opcode::Delete => Frame::Deleted,
        Opcode::Touch => Frame::Touched,
        Opcode::Flush => Frame::Ok,
        Opcode::Increment | Opcode::Decrement => {
            if value.len() != 8 {
                return Err(McError::protocol("counter response is not 8 bytes"));
            }
            Frame::Number((&value[..]).get_u64())
        }
        Opcode::Version => Frame::Version(String::from_utf8_lossy(value).into_owned()),
        Opcode::Stat if key.is_empty() => Frame::End,
        Opcode::Stat => Frame::Stat {
            name: String::from_utf8_lossy(key).into_owned(),
            value: String::from_utf8_lossy(value).into_owned(),
        },
    };
    Ok(frame)
}

fn map_status(opcode: Opcode, status: Status, message: &[u8]) -> Frame {
    match (status, opcode) {
        (Status::KeyExists, Opcode::Add) => Frame::NotStored,
        (Status::KeyExists, _) => Frame::Exists,
        (Status::KeyNotFound, Opcode::Replace | Opcode::Append | Opcode::Prepend) => Frame::NotStored,
        (Status::KeyNotFound, _) => Frame::NotFound,
        (Status::ItemNotStored, _) => Frame::NotStored,
        (status, _) => {
            let mut text = String::from_utf8_lossy(message).into_owned();
            if text.is_empty() {
                text = format!("{opcode} failed with {status:?}");
            }
            Frame::ServerError {
                message: text,
                temporary: status.is_temporary(),
            }
        }
    }
}

fn put_header(out: &mut BytesMut, header: Header) {
    out.put_slice(&header.encode());
}
