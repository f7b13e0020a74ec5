//! Wire contracts shared by every pipeline stage: configuration, value
//! encoding, message identity, and stream/key naming.
//!
//! Nothing in this crate performs IO. Stages and the log-store backends build
//! on these types; keeping them here means a payload produced by one stage is
//! always readable by the next one.

pub mod config;
pub mod encoding;
pub mod error;
pub mod message;
pub mod naming;

pub use config::{Config, ReadStart};
pub use encoding::{decode_value, encode_value};
pub use error::{CoreError, CoreResult};
pub use message::{MessageId, Payload};
pub use naming::KeySpace;
