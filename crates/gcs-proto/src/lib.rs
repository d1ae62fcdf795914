//! Wire format for the ground link: MAVLink 2 frames over the common dialect.

pub mod codec;
mod dialect;
pub mod error;
pub mod frame;
pub mod ids;
pub mod message;

pub use codec::{decode, decode_frame, encode};
pub use error::{DecodeError, EncodeError, PayloadError};
pub use frame::{Framer, FramerStats};
pub use message::*;
