//! Wire protocol between the harness core and the external controller
//! process, plus the structs that ride over it (`SharedConfig`, inputs).
//!
//! Framing is a `u32` little-endian message code followed by a
//! fixed-layout payload (no length prefix — every code has a statically
//! known payload shape). See `Message::write` / `Message::read`.

mod codec;
mod config;
mod inputs;
mod message;

pub use codec::ProtocolError;
pub use config::SharedConfig;
pub use inputs::AllInputs;
pub use message::GameInfo;
pub use message::Message;
pub use message::MessageCode;
