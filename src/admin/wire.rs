//! Admin channel wire format.
//!
//! Requests are a single opcode byte followed by an opcode-specific
//! payload. Non-streaming opcodes answer with a prelude `(i16 ret_code,
//! utf8 error_message when nonzero)` followed by the success payload;
//! the streaming opcodes (`GetPartitionAsStream`, `PutPartitionAsStream`)
//! place the prelude *after* the `-1`-terminated tuple stream, so a pipe
//! can pump bytes before learning the final status.
//!
//! Strings are `u16` length-prefixed UTF-8, blobs are `i32`
//! length-prefixed bytes, and all integers are big-endian. Opcodes and
//! error codes are stable across versions: additions only, never
//! renumbering.

use std::io::{Read, Write};

use crate::error::{Result, StoreError};

/// Upper bound on any single length-prefixed blob accepted off the wire.
pub const MAX_BLOB_BYTES: usize = 64 * 1024 * 1024;

/// Terminates the tuple stream of the bulk-transfer opcodes.
pub const STREAM_END: i32 = -1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    UpdateClusterMetadata = 0x01,
    UpdateStoresMetadata = 0x02,
    RebalancingServerMode = 0x03,
    NormalServerMode = 0x04,
    RestartServices = 0x05,
    RedirectGet = 0x06,
    GetPartitionAsStream = 0x07,
    PutPartitionAsStream = 0x08,
}

impl OpCode {
    pub fn from_u8(raw: u8) -> Result<OpCode> {
        Ok(match raw {
            0x01 => OpCode::UpdateClusterMetadata,
            0x02 => OpCode::UpdateStoresMetadata,
            0x03 => OpCode::RebalancingServerMode,
            0x04 => OpCode::NormalServerMode,
            0x05 => OpCode::RestartServices,
            0x06 => OpCode::RedirectGet,
            0x07 => OpCode::GetPartitionAsStream,
            0x08 => OpCode::PutPartitionAsStream,
            other => {
                return Err(StoreError::InvalidRequest(format!(
                    "unknown opcode 0x{other:02x}"
                )))
            }
        })
    }
}

/// Stable error code table. Code 0 is success and never appears here.
pub fn error_code(err: &StoreError) -> i16 {
    match err {
        StoreError::ObsoleteVersion(_) => 1,
        StoreError::InconsistentMetadata(_) => 2,
        StoreError::StoreNotFound(_) => 3,
        StoreError::UnknownMetadataKey(_) => 4,
        StoreError::PermissionDenied(_) => 5,
        StoreError::InvalidClockFormat(_) => 6,
        StoreError::InvalidRequest(_) => 7,
        StoreError::Io(_) => 8,
        StoreError::Timeout(_) => 9,
        StoreError::NotSupported(_) => 10,
    }
}

/// Re-inflates a received `(code, message)` pair into an error kind.
pub fn error_from_code(code: i16, message: String) -> StoreError {
    match code {
        1 => StoreError::ObsoleteVersion(message),
        2 => StoreError::InconsistentMetadata(message),
        3 => StoreError::StoreNotFound(message),
        4 => StoreError::UnknownMetadataKey(message),
        5 => StoreError::PermissionDenied(message),
        6 => StoreError::InvalidClockFormat(crate::versioning::ClockError::Truncated {
            expected: 0,
            got: 0,
        }),
        7 => StoreError::InvalidRequest(message),
        8 => StoreError::Io(std::io::Error::other(message)),
        9 => StoreError::Timeout(message),
        10 => StoreError::NotSupported(message),
        other => StoreError::InvalidRequest(format!("unknown error code {other}: {message}")),
    }
}

pub fn write_u8(w: &mut impl Write, value: u8) -> Result<()> {
    w.write_all(&[value])?;
    Ok(())
}

pub fn read_u8(r: &mut impl Read) -> Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

pub fn write_i16(w: &mut impl Write, value: i16) -> Result<()> {
    w.write_all(&value.to_be_bytes())?;
    Ok(())
}

pub fn read_i16(r: &mut impl Read) -> Result<i16> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)?;
    Ok(i16::from_be_bytes(buf))
}

pub fn write_i32(w: &mut impl Write, value: i32) -> Result<()> {
    w.write_all(&value.to_be_bytes())?;
    Ok(())
}

pub fn read_i32(r: &mut impl Read) -> Result<i32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(i32::from_be_bytes(buf))
}

pub fn write_utf(w: &mut impl Write, value: &str) -> Result<()> {
    let len = u16::try_from(value.len())
        .map_err(|_| StoreError::InvalidRequest("string exceeds u16 length prefix".into()))?;
    w.write_all(&len.to_be_bytes())?;
    w.write_all(value.as_bytes())?;
    Ok(())
}

pub fn read_utf(r: &mut impl Read) -> Result<String> {
    let mut len = [0u8; 2];
    r.read_exact(&mut len)?;
    let mut buf = vec![0u8; u16::from_be_bytes(len) as usize];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf)
        .map_err(|_| StoreError::InvalidRequest("string payload is not valid UTF-8".into()))
}

pub fn write_blob(w: &mut impl Write, value: &[u8]) -> Result<()> {
    let len = i32::try_from(value.len())
        .map_err(|_| StoreError::InvalidRequest("blob exceeds i32 length prefix".into()))?;
    w.write_all(&len.to_be_bytes())?;
    w.write_all(value)?;
    Ok(())
}

pub fn read_blob(r: &mut impl Read) -> Result<Vec<u8>> {
    let len = read_i32(r)?;
    read_blob_body(r, len)
}

/// Body read for a blob whose length prefix the caller already consumed
/// (the streaming loops peek the prefix to spot the `-1` sentinel).
pub fn read_blob_body(r: &mut impl Read, len: i32) -> Result<Vec<u8>> {
    if len < 0 {
        return Err(StoreError::InvalidRequest(format!(
            "negative blob length {len}"
        )));
    }
    let len = len as usize;
    if len > MAX_BLOB_BYTES {
        return Err(StoreError::InvalidRequest(format!(
            "blob of {len} bytes exceeds the {MAX_BLOB_BYTES} byte limit"
        )));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

/// Success prelude.
pub fn write_ok(w: &mut impl Write) -> Result<()> {
    write_i16(w, 0)
}

/// Failure prelude: the mapped code and the display message.
pub fn write_error(w: &mut impl Write, err: &StoreError) -> Result<()> {
    write_i16(w, error_code(err))?;
    write_utf(w, &err.to_string())
}

/// Reads a response prelude, converting a nonzero code into its kind.
pub fn read_prelude(r: &mut impl Read) -> Result<()> {
    let code = read_i16(r)?;
    if code == 0 {
        return Ok(());
    }
    let message = read_utf(r)?;
    Err(error_from_code(code, message))
}

/// One `(key, value)` tuple of a bulk stream.
pub fn write_stream_entry(w: &mut impl Write, key: &[u8], value: &[u8]) -> Result<()> {
    write_blob(w, key)?;
    write_blob(w, value)
}

/// Reads the next tuple, or `None` on the end-of-stream sentinel.
pub fn read_stream_entry(r: &mut impl Read) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
    let key_len = read_i32(r)?;
    if key_len == STREAM_END {
        return Ok(None);
    }
    let key = read_blob_body(r, key_len)?;
    let value = read_blob(r)?;
    Ok(Some((key, value)))
}

pub fn write_stream_end(w: &mut impl Write) -> Result<()> {
    write_i32(w, STREAM_END)
}
