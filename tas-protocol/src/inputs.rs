use crate::codec::ProtocolError;
use crate::codec::{read_bytes, write_bytes};
use std::io;

/// A single frame's worth of input state.
///
/// The exact layout (keyboard scancodes, controller axes, mouse deltas) is
/// owned by the movie file format, an external collaborator out of core.
/// The harness core only needs to carry the blob through
/// `AllInputs` / `PreviewInputs` without interpreting it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AllInputs {
    pub raw: Vec<u8>,
}

impl AllInputs {
    pub(crate) fn write(&self, w: &mut impl io::Write) -> Result<(), ProtocolError> {
        write_bytes(w, &self.raw)
    }

    pub(crate) fn read(r: &mut impl io::Read) -> Result<Self, ProtocolError> {
        Ok(Self {
            raw: read_bytes(r)?,
        })
    }
}
