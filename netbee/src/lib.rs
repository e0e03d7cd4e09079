//! Declarative network-packet analysis driven by NetPDL
//!
//! Protocol formats and their encapsulation rules live in an external
//! XML description; this crate loads that description once and decodes
//! captured packets against it, producing structured field trees ready
//! for rendering.
//!
//! The pieces live in focused crates, re-exported here:
//! [`protodb`](netbee_protodb) loads and organizes the description,
//! [`decoder`](netbee_decoder) walks packets against it,
//! [`reader`](netbee_reader) serializes and indexes the results and
//! [`expr`](netbee_expr) is the expression language underneath.

use std::path::Path;

#[doc(inline)]
pub use netbee_decoder as decoder;

#[doc(inline)]
pub use netbee_expr as expr;

#[doc(inline)]
pub use netbee_protodb as protodb;

#[doc(inline)]
pub use netbee_reader as reader;

pub use netbee_decoder::{Decoder, DecoderConfig, DecodedPacket, LinkLayer, Packet};
pub use netbee_protodb::{LoadError, LoadFlags, ProtocolDatabase};

/// Version of this library.
pub const VERSION_MAJOR: u32 = 0;
pub const VERSION_MINOR: u32 = 2;
pub const VERSION_REVCODE: u32 = 13;
/// Release date, day-month-year.
pub const VERSION_DATE: &str = "22-08-2012";

/// Version numbers of the library, the NetPDL language it understands,
/// and (when a database is loaded) the database itself.
#[derive(Debug, Clone)]
pub struct VersionInfo {
    pub lib_major: u32,
    pub lib_minor: u32,
    pub lib_revcode: u32,
    pub lib_date: &'static str,
    pub supported_netpdl_major: u32,
    pub supported_netpdl_minor: u32,
    pub db_creator: Option<String>,
    pub db_date: Option<String>,
    pub db_major: u32,
    pub db_minor: u32,
}

/// Library-only version information, available before any load.
pub fn version_info() -> VersionInfo {
    VersionInfo {
        lib_major: VERSION_MAJOR,
        lib_minor: VERSION_MINOR,
        lib_revcode: VERSION_REVCODE,
        lib_date: VERSION_DATE,
        supported_netpdl_major: netbee_protodb::SUPPORTED_NETPDL_MAJOR,
        supported_netpdl_minor: netbee_protodb::SUPPORTED_NETPDL_MINOR,
        db_creator: None,
        db_date: None,
        db_major: 0,
        db_minor: 0,
    }
}

/// The loaded library: a frozen protocol database handing out decoders.
///
/// Construct one per process (or more, nothing shared is mutable),
/// then create one [`Decoder`] per thread of decoding work.
pub struct NetBee {
    db: ProtocolDatabase,
}

/// Load a NetPDL database from a file.
pub fn initialize(path: impl AsRef<Path>, flags: LoadFlags) -> Result<NetBee, LoadError> {
    let db = netbee_protodb::load_file(path, flags)?;
    Ok(NetBee { db })
}

/// Load a NetPDL database held in memory.
pub fn initialize_from_xml(xml: &str, flags: LoadFlags) -> Result<NetBee, LoadError> {
    let db = netbee_protodb::load_xml(xml, flags)?;
    Ok(NetBee { db })
}

impl NetBee {
    pub fn database(&self) -> &ProtocolDatabase {
        &self.db
    }

    /// A fresh decoder with its own run-time state.
    pub fn decoder(&self) -> Decoder<'_> {
        Decoder::new(&self.db)
    }

    pub fn decoder_with_config(&self, config: DecoderConfig) -> Decoder<'_> {
        Decoder::with_config(&self.db, config)
    }

    pub fn version_info(&self) -> VersionInfo {
        let info = self.db.info();
        VersionInfo {
            db_creator: (!info.creator.is_empty()).then(|| info.creator.clone()),
            db_date: (!info.date.is_empty()).then(|| info.date.clone()),
            db_major: info.version_major,
            db_minor: info.version_minor,
            ..version_info()
        }
    }
}
