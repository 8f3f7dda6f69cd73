//! Reconstructs a process address space from a snapshot file, using
//! `mmap`/`mprotect` to recreate each kept region exactly where the
//! snapshot recorded it.
//!
//! `prepare_restore` does the allocating, fallible work of reading every
//! record out of the snapshot file and opening each `FileBacked`
//! region's backing file; it runs before any thread is quiesced, since
//! reading the snapshot doesn't touch live process memory. `restore_prepared`
//! then only issues `mmap`/`mprotect`/`copy_nonoverlapping` against data
//! already in hand, which is what makes it safe to call from inside the
//! self-raised write-checkpoint signal handler once every other thread
//! is quiesced.

use std::fs::File;
use std::io::Read;
use std::os::fd::AsRawFd;

use crate::error::CheckpointError;
use crate::format::{Preamble, RegionRecord, CONTEXT_BLOB_LEN};
use crate::region::{MappedRegion, PayloadKind};

fn prot_flags(prot: &crate::region::Prot) -> libc::c_int {
    let mut flags = 0;
    if prot.read {
        flags |= libc::PROT_READ;
    }
    if prot.write {
        flags |= libc::PROT_WRITE;
    }
    if prot.exec {
        flags |= libc::PROT_EXEC;
    }
    flags
}

/// Validates that the region geometry a snapshot describes is at least
/// plausible against the current process's address space layout, without
/// mutating anything. Called during `load`'s preflight so a malformed
/// snapshot can be rejected cleanly before any memory is touched.
pub fn check_restore(preamble: &Preamble) -> Result<(), CheckpointError> {
    if preamble.version != crate::format::VERSION {
        return Err(CheckpointError::SnapshotUnreadable {
            path: std::path::PathBuf::new(),
            reason: format!(
                "snapshot version {} does not match supported version {}",
                preamble.version,
                crate::format::VERSION
            ),
        });
    }
    Ok(())
}

/// One record from a snapshot file, plus whatever `prepare_restore`
/// already had to open or read on its behalf so that applying it later
/// needs no further allocation or filesystem access.
pub(crate) enum PreparedRegion {
    FileBacked { region: MappedRegion, file: File },
    ZeroFill { region: MappedRegion },
    Raw { region: MappedRegion, payload: Vec<u8> },
}

impl PreparedRegion {
    fn region(&self) -> &MappedRegion {
        match self {
            Self::FileBacked { region, .. } | Self::ZeroFill { region } | Self::Raw { region, .. } => region,
        }
    }
}

/// Reads every record described by `preamble` out of `reader`, opening
/// each `FileBacked` region's backing file eagerly. Ordinary fallible
/// I/O — safe to call before any thread is quiesced, since it never
/// touches live process memory.
pub fn prepare_restore(
    reader: &mut impl Read,
    preamble: &Preamble,
) -> Result<Vec<PreparedRegion>, CheckpointError> {
    let mut prepared = Vec::with_capacity(preamble.region_count as usize);
    for _ in 0..preamble.region_count {
        let record = RegionRecord::read(reader)?;
        let prepared_region = match record.kind {
            PayloadKind::FileBacked => {
                let file = File::open(&record.region.name).map_err(|e| CheckpointError::Io {
                    action: "opening backing file for",
                    path: record.region.name.clone().into(),
                    source: e,
                })?;
                PreparedRegion::FileBacked { region: record.region, file }
            }
            PayloadKind::ZeroFill => PreparedRegion::ZeroFill { region: record.region },
            PayloadKind::Raw => PreparedRegion::Raw {
                region: record.region,
                payload: record.payload,
            },
        };
        prepared.push(prepared_region);
    }
    Ok(prepared)
}

/// Re-creates one already-prepared region in the live address space and
/// fills its content. Issues only `mmap`/`mprotect`/`copy_nonoverlapping`
/// against data `prepare_restore` already read or opened — no further
/// allocation or filesystem access — which is what makes it safe to call
/// from inside the self-raised write-checkpoint signal handler.
///
/// # Safety
/// Must only be called once every other thread is quiesced and the
/// caller has committed to overwriting memory (i.e. `check_restore`
/// already passed) — a failure partway through this call is
/// unrecoverable.
pub(crate) unsafe fn restore_prepared(prepared: &PreparedRegion) -> Result<(), CheckpointError> {
    let region = prepared.region();
    let len = region.len() as usize;
    let addr = region.start as *mut libc::c_void;
    let prot = prot_flags(&region.prot);

    match prepared {
        PreparedRegion::FileBacked { region, file } => {
            // SAFETY: `addr` is a fixed target address recorded by the
            // serializer from this same process's own address space
            // layout; `MAP_FIXED` overwrites whatever was mapped there
            // (or nothing, for a fresh region), which is the intended
            // effect during a load.
            let mapped = unsafe {
                libc::mmap(
                    addr,
                    len,
                    prot,
                    libc::MAP_FIXED | libc::MAP_PRIVATE,
                    file.as_raw_fd(),
                    region.backing_offset as libc::off_t,
                )
            };
            if mapped == libc::MAP_FAILED {
                return Err(CheckpointError::FatalDuringOverwrite(format!(
                    "mmap(FileBacked) failed for region {:#x}-{:#x}",
                    region.start, region.end
                )));
            }
        }
        PreparedRegion::ZeroFill { region } => {
            // SAFETY: same fixed-address contract as above; anonymous
            // mappings are zeroed by the kernel, matching the recorded
            // content.
            let mapped = unsafe {
                libc::mmap(
                    addr,
                    len,
                    prot,
                    libc::MAP_FIXED | libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            if mapped == libc::MAP_FAILED {
                return Err(CheckpointError::FatalDuringOverwrite(format!(
                    "mmap(ZeroFill) failed for region {:#x}-{:#x}",
                    region.start, region.end
                )));
            }
        }
        PreparedRegion::Raw { region, payload } => {
            // SAFETY: same fixed-address contract; the mapping is then
            // immediately filled from the snapshot's own payload bytes,
            // which are `len` bytes by construction of the writer.
            let mapped = unsafe {
                libc::mmap(
                    addr,
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_FIXED | libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            if mapped == libc::MAP_FAILED {
                return Err(CheckpointError::FatalDuringOverwrite(format!(
                    "mmap(Raw) failed for region {:#x}-{:#x}",
                    region.start, region.end
                )));
            }
            // SAFETY: `mapped` was just created above with exactly `len`
            // writable bytes, and `payload` has `len` bytes by the
            // writer's own invariant.
            unsafe {
                std::ptr::copy_nonoverlapping(payload.as_ptr(), mapped.cast(), len);
            }
            if !region.prot.write {
                // SAFETY: `mapped` is the same region just populated.
                unsafe {
                    libc::mprotect(mapped, len, prot);
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn check_restore_rejects_a_future_version() {
        let preamble = Preamble {
            version: crate::format::VERSION + 1,
            region_count: 0,
            context_blob: Box::new([0u8; CONTEXT_BLOB_LEN]),
        };
        assert!(check_restore(&preamble).is_err());
    }

    #[test]
    fn check_restore_accepts_the_current_version() {
        let preamble = Preamble {
            version: crate::format::VERSION,
            region_count: 0,
            context_blob: Box::new([0u8; CONTEXT_BLOB_LEN]),
        };
        assert!(check_restore(&preamble).is_ok());
    }
}
