//! The on-disk snapshot format: an 8-byte magic, a version, a region
//! count, an opaque checkpoint-thread context blob, then one record per
//! kept region. Little-endian throughout, mirroring `tas_protocol`'s
//! wire codec conventions.

use std::io::{self, Read, Write};

use crate::error::CheckpointError;
use crate::region::{MappedRegion, PayloadKind, Prot, RegionFlags};

pub const MAGIC: [u8; 8] = *b"TASCKPT\0";
pub const VERSION: u32 = 1;
pub const CONTEXT_BLOB_LEN: usize = 512;

fn io_err(action: &'static str, source: io::Error) -> CheckpointError {
    CheckpointError::Io {
        action,
        path: std::path::PathBuf::new(),
        source,
    }
}

pub struct Preamble {
    pub version: u32,
    pub region_count: u64,
    pub context_blob: Box<[u8; CONTEXT_BLOB_LEN]>,
}

impl Preamble {
    pub fn write(&self, w: &mut impl Write) -> Result<(), CheckpointError> {
        w.write_all(&MAGIC).map_err(|e| io_err("writing", e))?;
        w.write_all(&self.version.to_le_bytes())
            .map_err(|e| io_err("writing", e))?;
        w.write_all(&self.region_count.to_le_bytes())
            .map_err(|e| io_err("writing", e))?;
        w.write_all(self.context_blob.as_slice())
            .map_err(|e| io_err("writing", e))?;
        Ok(())
    }

    pub fn read(r: &mut impl Read) -> Result<Self, CheckpointError> {
        let mut magic = [0u8; 8];
        r.read_exact(&mut magic).map_err(|e| io_err("reading", e))?;
        if magic != MAGIC {
            return Err(CheckpointError::SnapshotUnreadable {
                path: std::path::PathBuf::new(),
                reason: "magic mismatch".to_owned(),
            });
        }
        let mut buf4 = [0u8; 4];
        r.read_exact(&mut buf4).map_err(|e| io_err("reading", e))?;
        let version = u32::from_le_bytes(buf4);

        let mut buf8 = [0u8; 8];
        r.read_exact(&mut buf8).map_err(|e| io_err("reading", e))?;
        let region_count = u64::from_le_bytes(buf8);

        let mut context_blob = Box::new([0u8; CONTEXT_BLOB_LEN]);
        r.read_exact(context_blob.as_mut_slice())
            .map_err(|e| io_err("reading", e))?;

        Ok(Self {
            version,
            region_count,
            context_blob,
        })
    }
}

fn prot_bits(prot: &Prot) -> u32 {
    (prot.read as u32) | ((prot.write as u32) << 1) | ((prot.exec as u32) << 2)
}

fn prot_from_bits(bits: u32) -> Prot {
    Prot {
        read: bits & 0b001 != 0,
        write: bits & 0b010 != 0,
        exec: bits & 0b100 != 0,
    }
}

fn flags_bits(flags: &RegionFlags) -> u32 {
    (flags.shared as u32) | ((flags.anonymous as u32) << 1)
}

fn flags_from_bits(bits: u32) -> RegionFlags {
    RegionFlags {
        shared: bits & 0b01 != 0,
        anonymous: bits & 0b10 != 0,
    }
}

/// One region's header plus, for `PayloadKind::Raw`, its bytes.
pub struct RegionRecord {
    pub region: MappedRegion,
    pub kind: PayloadKind,
    pub payload: Vec<u8>,
}

impl RegionRecord {
    pub fn write(&self, w: &mut impl Write) -> Result<(), CheckpointError> {
        w.write_all(&self.region.start.to_le_bytes())
            .map_err(|e| io_err("writing", e))?;
        w.write_all(&self.region.end.to_le_bytes())
            .map_err(|e| io_err("writing", e))?;
        w.write_all(&prot_bits(&self.region.prot).to_le_bytes())
            .map_err(|e| io_err("writing", e))?;
        w.write_all(&flags_bits(&self.region.flags).to_le_bytes())
            .map_err(|e| io_err("writing", e))?;

        let name_bytes = self.region.name.as_bytes();
        let name_len = u16::try_from(name_bytes.len()).unwrap_or(u16::MAX);
        w.write_all(&name_len.to_le_bytes())
            .map_err(|e| io_err("writing", e))?;
        w.write_all(&name_bytes[..name_len as usize])
            .map_err(|e| io_err("writing", e))?;

        w.write_all(&self.region.backing_offset.to_le_bytes())
            .map_err(|e| io_err("writing", e))?;
        w.write_all(&[self.kind as u8])
            .map_err(|e| io_err("writing", e))?;

        if self.kind == PayloadKind::Raw {
            w.write_all(&self.payload).map_err(|e| io_err("writing", e))?;
        }
        Ok(())
    }

    pub fn read(r: &mut impl Read) -> Result<Self, CheckpointError> {
        let mut buf8 = [0u8; 8];
        r.read_exact(&mut buf8).map_err(|e| io_err("reading", e))?;
        let start = u64::from_le_bytes(buf8);
        r.read_exact(&mut buf8).map_err(|e| io_err("reading", e))?;
        let end = u64::from_le_bytes(buf8);

        let mut buf4 = [0u8; 4];
        r.read_exact(&mut buf4).map_err(|e| io_err("reading", e))?;
        let prot = prot_from_bits(u32::from_le_bytes(buf4));
        r.read_exact(&mut buf4).map_err(|e| io_err("reading", e))?;
        let flags = flags_from_bits(u32::from_le_bytes(buf4));

        let mut buf2 = [0u8; 2];
        r.read_exact(&mut buf2).map_err(|e| io_err("reading", e))?;
        let name_len = u16::from_le_bytes(buf2) as usize;
        let mut name_buf = vec![0u8; name_len];
        r.read_exact(&mut name_buf).map_err(|e| io_err("reading", e))?;
        let name = String::from_utf8_lossy(&name_buf).into_owned();

        r.read_exact(&mut buf8).map_err(|e| io_err("reading", e))?;
        let backing_offset = u64::from_le_bytes(buf8);

        let mut kind_buf = [0u8; 1];
        r.read_exact(&mut kind_buf).map_err(|e| io_err("reading", e))?;
        let kind = PayloadKind::from_u8(kind_buf[0]).ok_or_else(|| CheckpointError::SnapshotUnreadable {
            path: std::path::PathBuf::new(),
            reason: format!("unknown payload kind {}", kind_buf[0]),
        })?;

        let payload = if kind == PayloadKind::Raw {
            let mut buf = vec![0u8; (end - start) as usize];
            r.read_exact(&mut buf).map_err(|e| io_err("reading", e))?;
            buf
        } else {
            Vec::new()
        };

        Ok(Self {
            region: MappedRegion {
                start,
                end,
                prot,
                flags,
                name,
                backing_offset,
            },
            kind,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use std::io::Cursor;

    #[test]
    fn preamble_round_trips() {
        let preamble = Preamble {
            version: VERSION,
            region_count: 3,
            context_blob: Box::new([7u8; CONTEXT_BLOB_LEN]),
        };
        let mut buf = Vec::new();
        preamble.write(&mut buf).unwrap();
        let back = Preamble::read(&mut Cursor::new(buf)).unwrap();
        assert_eq!(back.version, VERSION);
        assert_eq!(back.region_count, 3);
        assert_eq!(*back.context_blob, [7u8; CONTEXT_BLOB_LEN]);
    }

    #[test]
    fn wrong_magic_is_reported_not_panicked() {
        let mut buf = vec![0u8; 8 + 4 + 8 + CONTEXT_BLOB_LEN];
        buf[0] = b'X';
        let result = Preamble::read(&mut Cursor::new(buf));
        assert!(matches!(result, Err(CheckpointError::SnapshotUnreadable { .. })));
    }

    #[test]
    fn raw_region_record_round_trips() {
        let record = RegionRecord {
            region: MappedRegion {
                start: 0x1000,
                end: 0x2000,
                prot: Prot { read: true, write: true, exec: false },
                flags: RegionFlags { shared: false, anonymous: true },
                name: "[heap]".to_owned(),
                backing_offset: 0,
            },
            kind: PayloadKind::Raw,
            payload: vec![1, 2, 3, 4],
        };
        let mut buf = Vec::new();
        record.write(&mut buf).unwrap();

        // Raw payload length is implied by `end - start`, so construct a
        // region whose span matches the test payload.
        let mut buf2 = Vec::new();
        let record2 = RegionRecord {
            region: MappedRegion { end: record.region.start + 4, ..record.region.clone() },
            kind: PayloadKind::Raw,
            payload: vec![1, 2, 3, 4],
        };
        record2.write(&mut buf2).unwrap();
        let back = RegionRecord::read(&mut Cursor::new(buf2)).unwrap();
        assert_eq!(back.payload, vec![1, 2, 3, 4]);
        assert_eq!(back.kind, PayloadKind::Raw);
    }

    #[test]
    fn zero_fill_record_has_no_payload_bytes_on_disk() {
        let region = MappedRegion {
            start: 0,
            end: 0x1000,
            prot: Prot { read: true, write: true, exec: false },
            flags: RegionFlags { shared: false, anonymous: true },
            name: String::new(),
            backing_offset: 0,
        };
        let record = RegionRecord { region, kind: PayloadKind::ZeroFill, payload: Vec::new() };
        let mut buf = Vec::new();
        record.write(&mut buf).unwrap();
        let back = RegionRecord::read(&mut Cursor::new(buf)).unwrap();
        assert_eq!(back.kind, PayloadKind::ZeroFill);
        assert!(back.payload.is_empty());
    }
}
