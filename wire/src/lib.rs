//! # `wire`
//! The protocol engine of the load generator: packet templates with their
//! variable-substitution and mutation machinery, and the length-prefixed
//! framing used to consume server responses. Deliberately dependency-free so
//! it can be exercised against in-memory buffers as easily as live sockets.
//!
//! - `wire::field` - fixed-offset little-endian integer fields.
//! - `wire::vars` - variable declaration table and per-scope value stores.
//! - `wire::packet` - packet templates and the in-place rewrite engine.
//! - `wire::frame` - framing reader and server error frame recognition.
pub mod field;
pub mod frame;
pub mod packet;
pub mod vars;

pub use field::{Field, FieldError};
pub use frame::{FrameConfig, FrameError};
pub use packet::{
    Action, MAX_PACKET_ACTIONS, MAX_PACKET_VARS, MAX_PAYLOAD, Operator, Packet, PacketError,
};
pub use vars::{CELL_LEN, SCOPE_SLOTS, SLOT_COUNT, SlotRef, VarDecls, VarError, VarStore};
