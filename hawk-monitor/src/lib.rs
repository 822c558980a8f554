//! Battery monitor protocol codecs and device sessions
//!
//! This crate turns raw GATT traffic into canonical battery readings. It
//! knows the two wire protocols the supported monitors speak (the
//! encrypted BM6 family and the legacy framed BM2/generic family) and
//! provides the per-device session that drives requests over a
//! `hawk_transport` connection pool.

pub mod crypto;
pub mod emulator;
pub mod error;
pub mod protocol;
pub mod reading;
pub mod session;

pub use error::{MonitorError, ProtocolError};
pub use protocol::{BasicInfo, Frame, ProtocolFamily, RequestKind};
pub use reading::Reading;
pub use session::{
    event_channel, DeviceSession, RuntimeStatus, SessionConfig, SessionEvent,
};
