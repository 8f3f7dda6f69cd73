use std::io;

use crate::codec::ProtocolError;
use crate::codec::{
    read_f32, read_i64, read_string, read_u32, read_u64, write_f32, write_i64, write_string,
    write_u32, write_u64,
};
use crate::config::SharedConfig;
use crate::inputs::AllInputs;

/// Diagnostic information about the hosted game, sent once whenever it
/// changes. Video/audio backend identification only; rendering itself
/// is out of core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GameInfo {
    pub video_backend: u32,
    pub audio_backend: u32,
}

/// The numeric wire code for a `Message`. Kept as its own type so
/// `Message::code()` and the `TryFrom<u32>` match arm in `read` can't
/// drift apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageCode {
    // Harness -> controller
    Alert = 1,
    FramecountTime = 2,
    GameInfo = 3,
    Fps = 4,
    StartBoundary = 5,
    LoadingSucceeded = 6,
    // Controller -> harness
    UserQuit = 7,
    Config = 8,
    DumpFile = 9,
    AllInputs = 10,
    Expose = 11,
    PreviewInputs = 12,
    SaveState = 13,
    LoadState = 14,
    StopEncode = 15,
    EndBoundary = 16,
}

impl TryFrom<u32> for MessageCode {
    type Error = ProtocolError;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        Ok(match code {
            1 => Self::Alert,
            2 => Self::FramecountTime,
            3 => Self::GameInfo,
            4 => Self::Fps,
            5 => Self::StartBoundary,
            6 => Self::LoadingSucceeded,
            7 => Self::UserQuit,
            8 => Self::Config,
            9 => Self::DumpFile,
            10 => Self::AllInputs,
            11 => Self::Expose,
            12 => Self::PreviewInputs,
            13 => Self::SaveState,
            14 => Self::LoadState,
            15 => Self::StopEncode,
            16 => Self::EndBoundary,
            other => return Err(ProtocolError::UnknownCode(other)),
        })
    }
}

/// One message of the controller wire protocol, in either direction.
///
/// `Message::write` / `Message::read` are the only framing entry points;
/// both operate over anything implementing `io::Write` / `io::Read`, so
/// callers can drive them over a Unix socket in production or a
/// `Cursor<Vec<u8>>` in tests.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Alert(String),
    FramecountTime { framecount: u64, sec: i64, nsec: i64 },
    GameInfo(GameInfo),
    Fps { fps: f32, lfps: f32 },
    StartBoundary,
    LoadingSucceeded,
    UserQuit,
    Config(SharedConfig),
    DumpFile(String),
    AllInputs(AllInputs),
    Expose,
    PreviewInputs(AllInputs),
    SaveState(String),
    LoadState(String),
    StopEncode,
    EndBoundary,
}

impl Message {
    pub fn code(&self) -> MessageCode {
        match self {
            Self::Alert(_) => MessageCode::Alert,
            Self::FramecountTime { .. } => MessageCode::FramecountTime,
            Self::GameInfo(_) => MessageCode::GameInfo,
            Self::Fps { .. } => MessageCode::Fps,
            Self::StartBoundary => MessageCode::StartBoundary,
            Self::LoadingSucceeded => MessageCode::LoadingSucceeded,
            Self::UserQuit => MessageCode::UserQuit,
            Self::Config(_) => MessageCode::Config,
            Self::DumpFile(_) => MessageCode::DumpFile,
            Self::AllInputs(_) => MessageCode::AllInputs,
            Self::Expose => MessageCode::Expose,
            Self::PreviewInputs(_) => MessageCode::PreviewInputs,
            Self::SaveState(_) => MessageCode::SaveState,
            Self::LoadState(_) => MessageCode::LoadState,
            Self::StopEncode => MessageCode::StopEncode,
            Self::EndBoundary => MessageCode::EndBoundary,
        }
    }

    pub fn write(&self, w: &mut impl io::Write) -> Result<(), ProtocolError> {
        write_u32(w, self.code() as u32)?;
        match self {
            Self::Alert(s) => write_string(w, s),
            Self::FramecountTime {
                framecount,
                sec,
                nsec,
            } => {
                write_u64(w, *framecount)?;
                write_i64(w, *sec)?;
                write_i64(w, *nsec)
            }
            Self::GameInfo(info) => {
                write_u32(w, info.video_backend)?;
                write_u32(w, info.audio_backend)
            }
            Self::Fps { fps, lfps } => {
                write_f32(w, *fps)?;
                write_f32(w, *lfps)
            }
            Self::StartBoundary
            | Self::LoadingSucceeded
            | Self::UserQuit
            | Self::Expose
            | Self::StopEncode
            | Self::EndBoundary => Ok(()),
            Self::Config(cfg) => cfg.write(w),
            Self::DumpFile(path) | Self::SaveState(path) | Self::LoadState(path) => {
                write_string(w, path)
            }
            Self::AllInputs(inputs) | Self::PreviewInputs(inputs) => inputs.write(w),
        }
    }

    pub fn read(r: &mut impl io::Read) -> Result<Self, ProtocolError> {
        let code = MessageCode::try_from(read_u32(r)?)?;
        Ok(match code {
            MessageCode::Alert => Self::Alert(read_string(r)?),
            MessageCode::FramecountTime => Self::FramecountTime {
                framecount: read_u64(r)?,
                sec: read_i64(r)?,
                nsec: read_i64(r)?,
            },
            MessageCode::GameInfo => Self::GameInfo(GameInfo {
                video_backend: read_u32(r)?,
                audio_backend: read_u32(r)?,
            }),
            MessageCode::Fps => Self::Fps {
                fps: read_f32(r)?,
                lfps: read_f32(r)?,
            },
            MessageCode::StartBoundary => Self::StartBoundary,
            MessageCode::LoadingSucceeded => Self::LoadingSucceeded,
            MessageCode::UserQuit => Self::UserQuit,
            MessageCode::Config => Self::Config(SharedConfig::read(r)?),
            MessageCode::DumpFile => Self::DumpFile(read_string(r)?),
            MessageCode::AllInputs => Self::AllInputs(AllInputs::read(r)?),
            MessageCode::Expose => Self::Expose,
            MessageCode::PreviewInputs => Self::PreviewInputs(AllInputs::read(r)?),
            MessageCode::SaveState => Self::SaveState(read_string(r)?),
            MessageCode::LoadState => Self::LoadState(read_string(r)?),
            MessageCode::StopEncode => Self::StopEncode,
            MessageCode::EndBoundary => Self::EndBoundary,
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use std::io::Cursor;

    fn round_trip(msg: Message) {
        let mut buf = Vec::new();
        msg.write(&mut buf).unwrap();
        let got = Message::read(&mut Cursor::new(buf)).unwrap();
        assert_eq!(msg, got);
    }

    #[test]
    fn round_trips_every_variant() {
        round_trip(Message::Alert("disk full".to_owned()));
        round_trip(Message::FramecountTime {
            framecount: 60,
            sec: 1,
            nsec: 0,
        });
        round_trip(Message::GameInfo(GameInfo {
            video_backend: 2,
            audio_backend: 0,
        }));
        round_trip(Message::Fps {
            fps: 59.94,
            lfps: 60.0,
        });
        round_trip(Message::StartBoundary);
        round_trip(Message::LoadingSucceeded);
        round_trip(Message::UserQuit);
        round_trip(Message::Config(SharedConfig::default()));
        round_trip(Message::DumpFile("out.mp4".to_owned()));
        round_trip(Message::AllInputs(AllInputs {
            raw: vec![1, 2, 3],
        }));
        round_trip(Message::Expose);
        round_trip(Message::PreviewInputs(AllInputs::default()));
        round_trip(Message::SaveState("/tmp/s1".to_owned()));
        round_trip(Message::LoadState("/tmp/s1".to_owned()));
        round_trip(Message::StopEncode);
        round_trip(Message::EndBoundary);
    }

    #[test]
    fn unknown_code_is_reported_not_panicked() {
        let mut buf = Vec::new();
        write_u32(&mut buf, 9999).unwrap();
        let err = Message::read(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownCode(9999)));
    }

    #[test]
    fn truncated_stream_is_reported_not_panicked() {
        let buf = vec![16, 0]; // half of a valid EndBoundary code
        let err = Message::read(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated { .. }));
    }
}
