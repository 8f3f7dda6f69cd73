use crate::codec::ProtocolError;
use crate::codec::{read_u32, write_u32};
use std::io;

/// The struct carried by the `Config` wire message.
///
/// `osd_mask` and `av_dumping` are stored and forwarded as-is: HUD
/// rendering and AV dumping are external collaborators, out of core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedConfig {
    pub fastforward: bool,
    pub fps: u32,
    pub screen_capture: bool,
    pub osd_mask: u32,
    pub av_dumping: bool,
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self {
            fastforward: false,
            fps: 60,
            screen_capture: false,
            osd_mask: 0,
            av_dumping: false,
        }
    }
}

impl SharedConfig {
    pub(crate) fn write(&self, w: &mut impl io::Write) -> Result<(), ProtocolError> {
        write_u32(w, self.fastforward as u32)?;
        write_u32(w, self.fps)?;
        write_u32(w, self.screen_capture as u32)?;
        write_u32(w, self.osd_mask)?;
        write_u32(w, self.av_dumping as u32)?;
        Ok(())
    }

    pub(crate) fn read(r: &mut impl io::Read) -> Result<Self, ProtocolError> {
        Ok(Self {
            fastforward: read_u32(r)? != 0,
            fps: read_u32(r)?,
            screen_capture: read_u32(r)? != 0,
            osd_mask: read_u32(r)?,
            av_dumping: read_u32(r)? != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use std::io::Cursor;

    #[test]
    fn round_trips_through_the_wire_encoding() {
        let cfg = SharedConfig {
            fastforward: true,
            fps: 320,
            screen_capture: true,
            osd_mask: 0b101,
            av_dumping: false,
        };
        let mut buf = Vec::new();
        cfg.write(&mut buf).unwrap();
        let got = SharedConfig::read(&mut Cursor::new(buf)).unwrap();
        assert_eq!(cfg, got);
    }
}
