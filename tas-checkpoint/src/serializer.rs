//! Parses `/proc/self/maps` and serializes the regions a `RegionPolicy`
//! selects. `prepare_records` does all the allocating, fallible work —
//! reading `/proc/self/maps`, copying live region bytes, classifying
//! them against their backing files — and must run on the checkpoint
//! thread's ordinary stack, after every other thread is already
//! quiesced but before the write-checkpoint signal is raised.
//! `write_prepared` then only writes bytes `prepare_records` already
//! computed, which is what makes it safe to call from inside that
//! signal's handler.

use std::fs;
use std::io::Write;

use crate::error::CheckpointError;
use crate::format::{Preamble, RegionRecord, CONTEXT_BLOB_LEN};
use crate::region::{MappedRegion, PayloadKind, RegionFlags, RegionPolicy, Prot};

/// Parses one `/proc/self/maps` line, e.g.
/// `7f1234500000-7f1234600000 rw-p 00001000 08:01 123 /lib/libc.so.6`.
fn parse_line(line: &str) -> Option<MappedRegion> {
    let mut fields = line.split_whitespace();
    let range = fields.next()?;
    let perms = fields.next()?;
    let offset = fields.next()?;
    let _dev = fields.next()?;
    let _inode = fields.next()?;
    let name = fields.next().unwrap_or("").to_owned();

    let (start_s, end_s) = range.split_once('-')?;
    let start = u64::from_str_radix(start_s, 16).ok()?;
    let end = u64::from_str_radix(end_s, 16).ok()?;
    let backing_offset = u64::from_str_radix(offset, 16).ok()?;

    let mut perms_chars = perms.chars();
    let prot = Prot {
        read: perms_chars.next() == Some('r'),
        write: perms_chars.next() == Some('w'),
        exec: perms_chars.next() == Some('x'),
    };
    let shared = perms_chars.next() == Some('s');

    // Pseudo-paths like `[heap]`/`[stack]`/`[vdso]` have no real backing
    // file to reconstruct content from, so they count as anonymous the
    // same as a blank name does.
    let anonymous = name.is_empty() || name.starts_with('[');
    Some(MappedRegion {
        start,
        end,
        prot,
        flags: RegionFlags { shared, anonymous },
        name,
        backing_offset,
    })
}

/// Reads and parses the current process's own memory map.
pub fn enumerate_regions() -> Result<Vec<MappedRegion>, CheckpointError> {
    let contents = fs::read_to_string("/proc/self/maps").map_err(CheckpointError::MapsUnreadable)?;
    Ok(contents.lines().filter_map(parse_line).collect())
}

/// Reads `region`'s live bytes.
///
/// # Safety
/// The caller must guarantee every other thread is quiesced (blocked on
/// the resume lock) for the duration of this call, so the region's
/// content cannot change while it is being copied.
unsafe fn read_region(region: &MappedRegion) -> Vec<u8> {
    let len = region.len() as usize;
    // SAFETY: forwarded from the caller's contract; `region` came from a
    // freshly parsed `/proc/self/maps`, so `[start, end)` is mapped and
    // readable.
    unsafe { std::slice::from_raw_parts(region.start as *const u8, len).to_vec() }
}

fn classify(region: &MappedRegion, bytes: &[u8]) -> PayloadKind {
    if region.flags.anonymous && bytes.iter().all(|b| *b == 0) {
        return PayloadKind::ZeroFill;
    }
    if !region.flags.anonymous {
        if let Ok(backing) = fs::read(&region.name) {
            let offset = region.backing_offset as usize;
            if let Some(slice) = backing.get(offset..offset + bytes.len()) {
                if slice == bytes {
                    return PayloadKind::FileBacked;
                }
            }
        }
    }
    PayloadKind::Raw
}

/// Enumerates every region `policy` keeps and reads its content,
/// producing records ready to be written verbatim. Does real filesystem
/// I/O and heap allocation throughout (`/proc/self/maps`, each region's
/// bytes, each backing file read for classification), so it must never
/// run inside the self-raised write-checkpoint signal handler — only
/// after `ThreadRegistry::suspend_all` has already quiesced every other
/// thread, and before that signal is raised.
///
/// # Safety
/// The caller must guarantee every other thread is quiesced (blocked on
/// the resume lock) for the duration of this call, so no region's
/// content can change while it is being copied.
pub unsafe fn prepare_records(policy: &RegionPolicy) -> Result<Vec<RegionRecord>, CheckpointError> {
    let regions = enumerate_regions()?
        .into_iter()
        .filter(|r| r.should_keep(policy) && !r.is_empty());

    let mut records = Vec::new();
    for region in regions {
        // SAFETY: forwarded from this function's own contract.
        let bytes = unsafe { read_region(&region) };
        let kind = classify(&region, &bytes);
        let payload = if kind == PayloadKind::Raw { bytes } else { Vec::new() };
        records.push(RegionRecord { region, kind, payload });
    }
    Ok(records)
}

/// Writes a preamble and `records`, already built by `prepare_records`,
/// to `writer`. Performs no allocation or filesystem access beyond
/// `Write::write_all` on bytes already in hand, which is what makes it
/// safe to call from inside the self-raised write-checkpoint signal
/// handler, running on its dedicated alternate stack.
pub fn write_prepared(
    writer: &mut impl Write,
    context_blob: Box<[u8; CONTEXT_BLOB_LEN]>,
    records: &[RegionRecord],
) -> Result<(), CheckpointError> {
    let preamble = Preamble {
        version: crate::format::VERSION,
        region_count: records.len() as u64,
        context_blob,
    };
    preamble.write(writer)?;
    for record in records {
        record.write(writer)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn parses_a_typical_maps_line() {
        let line = "7f1234500000-7f1234600000 r-xp 00001000 08:01 123 /lib/x86_64-linux-gnu/libc.so.6";
        let region = parse_line(line).unwrap();
        assert_eq!(region.start, 0x7f1234500000);
        assert_eq!(region.end, 0x7f1234600000);
        assert!(region.prot.read);
        assert!(!region.prot.write);
        assert!(region.prot.exec);
        assert!(!region.flags.anonymous);
    }

    #[test]
    fn parses_an_anonymous_heap_line() {
        let line = "55aa00000000-55aa00021000 rw-p 00000000 00:00 0 [heap]";
        let region = parse_line(line).unwrap();
        assert_eq!(region.name, "[heap]");
        assert!(region.flags.anonymous);
    }

    #[test]
    fn all_zero_anonymous_region_classifies_as_zero_fill() {
        let region = MappedRegion {
            start: 0,
            end: 0x10,
            prot: Prot { read: true, write: true, exec: false },
            flags: RegionFlags { shared: false, anonymous: true },
            name: String::new(),
            backing_offset: 0,
        };
        let bytes = vec![0u8; 16];
        assert_eq!(classify(&region, &bytes), PayloadKind::ZeroFill);
    }

    #[test]
    fn nonzero_anonymous_region_classifies_as_raw() {
        let region = MappedRegion {
            start: 0,
            end: 0x10,
            prot: Prot { read: true, write: true, exec: false },
            flags: RegionFlags { shared: false, anonymous: true },
            name: String::new(),
            backing_offset: 0,
        };
        let bytes = vec![1u8; 16];
        assert_eq!(classify(&region, &bytes), PayloadKind::Raw);
    }

    #[test]
    fn enumerate_regions_reads_the_real_process_map() {
        let regions = enumerate_regions().unwrap();
        assert!(!regions.is_empty());
    }
}
