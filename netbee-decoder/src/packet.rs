/// Largest packet the decoder accepts.
pub const MAX_PACKET_LEN: usize = 65_535;

/// Link layer of a captured packet.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LinkLayer {
    Ethernet,
    TokenRing,
    Fddi,
    Hci,
    Ieee80211,
}

impl LinkLayer {
    /// Numeric code seeded into the `$linklayer` run-time variable.
    pub fn code(&self) -> u32 {
        match self {
            LinkLayer::Ethernet => 1,
            LinkLayer::TokenRing => 6,
            LinkLayer::Fddi => 10,
            LinkLayer::Hci => 187,
            LinkLayer::Ieee80211 => 105,
        }
    }
}

/// A captured packet handed to the decoder: the captured bytes plus the
/// capture-header metadata.
#[derive(Debug, Clone)]
pub struct Packet<'p> {
    pub data: &'p [u8],
    /// On-wire length; at least `data.len()`.
    pub length: u32,
    pub ts_sec: u32,
    pub ts_usec: u32,
    pub link_layer: LinkLayer,
}

impl<'p> Packet<'p> {
    pub fn new(data: &'p [u8], link_layer: LinkLayer) -> Self {
        Packet {
            data,
            length: data.len() as u32,
            ts_sec: 0,
            ts_usec: 0,
            link_layer,
        }
    }

    pub fn with_timestamp(mut self, ts_sec: u32, ts_usec: u32) -> Self {
        self.ts_sec = ts_sec;
        self.ts_usec = ts_usec;
        self
    }

    pub fn captured_len(&self) -> usize {
        self.data.len()
    }
}
