//! NetPDL packet decoder
//!
//! Walks a loaded protocol database against captured packets and emits
//! structured field trees. One [`Decoder`] owns one set of run-time
//! state (variables, lookup tables); any number of decoders can share
//! the same frozen database across threads.

use thiserror::Error;

mod asn1;
mod engine;
mod eval;
mod lookup;
mod packet;
mod state;
mod tree;

pub use engine::{Decoder, DecoderConfig};
pub use eval::{EvalError, Value};
pub use lookup::{LookupStore, Table};
pub use packet::{LinkLayer, Packet, MAX_PACKET_LEN};
pub use state::VariableStore;
pub use tree::{ChildFields, DecodedField, DecodedPacket, DecodedProto, FieldId};

/// Failures the decoder surfaces to the caller. Everything that happens
/// inside a packet (truncation, malformed fields, expression errors) is
/// recorded in the decoded tree instead.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("packet of {0} bytes exceeds the 65535-byte bound")]
    PacketTooLong(usize),
}
