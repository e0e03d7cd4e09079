//! NetPDL protocol database
//!
//! Loads a NetPDL protocol-description document into an immutable arena
//! of typed nodes. Loading is two passes: a streaming pass instantiates
//! one node per element and links the forest, then the organizer
//! resolves every cross reference (templates, ADT calls, block includes,
//! bit groups, protocol references) so decoding never chases names.

use thiserror::Error;

mod attrs;
mod db;
mod load;
mod node;
mod organize;

pub use db::{
    ChildIter, DatabaseInfo, LoadFlags, ProtocolDatabase, DEFAULTPROTO_NAME, MAX_NESTING_LEVELS,
    PADDINGPROTO_NAME, STARTPROTO_NAME, SUPPORTED_NETPDL_MAJOR, SUPPORTED_NETPDL_MINOR,
};
pub use load::{load_file, load_xml};
pub use node::{
    Asn1Encoding, CallHandlerEvent, CallHandlerInfo, CaseValue, Column, EntryPolicy, ExecEvent,
    FieldBase, FieldVariant, Links, LoopCtrlKind, LoopKind, MissingPolicy, Node, NodeData, NodeId,
    PacketHdrItem, PartialPolicy, Portion, ShowMode, TableAction, Terminator, Validity,
};

pub use netbee_expr as expr;

/// Everything that can go wrong while building a database. Load is
/// all-or-nothing: any of these unwinds the partial database.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("NetPDL document is not well-formed XML near line {line}: {reason}")]
    XmlSyntax { line: u32, reason: String },

    #[error("element <{element}> at line {line} violates the NetPDL schema: {reason}")]
    SchemaViolation {
        element: String,
        line: u32,
        reason: String,
    },

    #[error(
        "database declares NetPDL version {found_major}.{found_minor}, \
         this library supports {}.{}",
        db::SUPPORTED_NETPDL_MAJOR,
        db::SUPPORTED_NETPDL_MINOR
    )]
    VersionMismatch { found_major: u32, found_minor: u32 },

    #[error("element <{element}> at line {line}: {reason}")]
    Structural {
        element: String,
        line: u32,
        reason: String,
    },

    #[error("element <{element}> at line {line}: {source}")]
    Expr {
        element: String,
        line: u32,
        #[source]
        source: netbee_expr::ExprError,
    },

    #[error("cannot read the NetPDL database: {0}")]
    Io(#[from] std::io::Error),
}
