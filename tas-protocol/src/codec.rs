use std::io;

use thiserror::Error;

/// Errors produced while framing messages on the controller stream.
///
/// Per the propagation policy: `UnknownCode` and `Truncated` are surfaced
/// to the controller as an alert and the offending command is treated as
/// a no-op by the caller — they are not fatal to this crate's functions.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown message code {0}")]
    UnknownCode(u32),

    #[error("message truncated while reading {what}")]
    Truncated { what: &'static str },

    #[error("io error while {action}: {source}")]
    Io {
        action: &'static str,
        #[source]
        source: io::Error,
    },
}

impl ProtocolError {
    pub(crate) fn io(action: &'static str, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::UnexpectedEof {
            return Self::Truncated { what: action };
        }
        Self::Io { action, source }
    }
}

pub(crate) fn write_u32(w: &mut impl io::Write, v: u32) -> Result<(), ProtocolError> {
    w.write_all(&v.to_le_bytes())
        .map_err(|e| ProtocolError::io("writing u32", e))
}

pub(crate) fn read_u32(r: &mut impl io::Read) -> Result<u32, ProtocolError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)
        .map_err(|e| ProtocolError::io("reading u32", e))?;
    Ok(u32::from_le_bytes(buf))
}

pub(crate) fn write_u64(w: &mut impl io::Write, v: u64) -> Result<(), ProtocolError> {
    w.write_all(&v.to_le_bytes())
        .map_err(|e| ProtocolError::io("writing u64", e))
}

pub(crate) fn read_u64(r: &mut impl io::Read) -> Result<u64, ProtocolError> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)
        .map_err(|e| ProtocolError::io("reading u64", e))?;
    Ok(u64::from_le_bytes(buf))
}

pub(crate) fn write_i64(w: &mut impl io::Write, v: i64) -> Result<(), ProtocolError> {
    w.write_all(&v.to_le_bytes())
        .map_err(|e| ProtocolError::io("writing i64", e))
}

pub(crate) fn read_i64(r: &mut impl io::Read) -> Result<i64, ProtocolError> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)
        .map_err(|e| ProtocolError::io("reading i64", e))?;
    Ok(i64::from_le_bytes(buf))
}

pub(crate) fn write_f32(w: &mut impl io::Write, v: f32) -> Result<(), ProtocolError> {
    w.write_all(&v.to_le_bytes())
        .map_err(|e| ProtocolError::io("writing f32", e))
}

pub(crate) fn read_f32(r: &mut impl io::Read) -> Result<f32, ProtocolError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)
        .map_err(|e| ProtocolError::io("reading f32", e))?;
    Ok(f32::from_le_bytes(buf))
}

pub(crate) fn write_string(w: &mut impl io::Write, s: &str) -> Result<(), ProtocolError> {
    let bytes = s.as_bytes();
    write_u32(w, bytes.len() as u32)?;
    w.write_all(bytes)
        .map_err(|e| ProtocolError::io("writing string body", e))
}

pub(crate) fn read_string(r: &mut impl io::Read) -> Result<String, ProtocolError> {
    let len = read_u32(r)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)
        .map_err(|e| ProtocolError::io("reading string body", e))?;
    String::from_utf8(buf).map_err(|_| ProtocolError::Truncated {
        what: "string body (invalid utf8)",
    })
}

pub(crate) fn write_bytes(w: &mut impl io::Write, bytes: &[u8]) -> Result<(), ProtocolError> {
    write_u32(w, bytes.len() as u32)?;
    w.write_all(bytes)
        .map_err(|e| ProtocolError::io("writing byte blob", e))
}

pub(crate) fn read_bytes(r: &mut impl io::Read) -> Result<Vec<u8>, ProtocolError> {
    let len = read_u32(r)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)
        .map_err(|e| ProtocolError::io("reading byte blob", e))?;
    Ok(buf)
}
