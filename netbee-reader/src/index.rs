//! Random access into a stream of emitted `<packet>` elements.
//!
//! Packets are written out once and indexed by byte offset, so a
//! capture of any size costs one offset entry per packet in memory, not
//! the packets themselves.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::pdml::{parse_packet, PdmlField, PdmlPacket};
use crate::ReaderError;

/// Initial capacity of the packet-offset table.
const INITIAL_PACKET_SLOTS: usize = 16;

enum Source {
    Memory(String),
    File(File),
}

/// An index over previously emitted packets (PDML or PSML alike), from
/// a file on disk or an in-memory buffer handed over by the emitter.
pub struct PxmlReader {
    source: Source,
    /// (start, length) of each `<packet>` element, in packet order.
    offsets: Vec<(u64, u32)>,
}

impl PxmlReader {
    pub fn from_string(document: String) -> Result<Self, ReaderError> {
        let offsets = scan_offsets(document.as_bytes())?;
        Ok(PxmlReader {
            source: Source::Memory(document),
            offsets,
        })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, ReaderError> {
        let mut file = File::open(path)?;
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;
        let offsets = scan_offsets(&contents)?;
        file.seek(SeekFrom::Start(0))?;
        Ok(PxmlReader {
            source: Source::File(file),
            offsets,
        })
    }

    pub fn packet_count(&self) -> usize {
        self.offsets.len()
    }

    /// Raw XML of packet `n` (1-based, following the `num` attribute
    /// convention).
    pub fn get_packet_xml(&mut self, n: u64) -> Result<String, ReaderError> {
        let index = n
            .checked_sub(1)
            .map(|i| i as usize)
            .filter(|i| *i < self.offsets.len())
            .ok_or(ReaderError::OutOfRange(n))?;
        let (start, len) = self.offsets[index];

        match &mut self.source {
            Source::Memory(text) => {
                Ok(text[start as usize..start as usize + len as usize].to_string())
            }
            Source::File(file) => {
                file.seek(SeekFrom::Start(start))?;
                let mut buf = vec![0u8; len as usize];
                file.read_exact(&mut buf)?;
                String::from_utf8(buf)
                    .map_err(|_| ReaderError::Parse("packet slice is not UTF-8".to_string()))
            }
        }
    }

    /// Packet `n` parsed into a tree.
    pub fn get_packet(&mut self, n: u64) -> Result<PdmlPacket, ReaderError> {
        let xml = self.get_packet_xml(n)?;
        parse_packet(&xml)
    }

    /// The first field named `field` inside `proto` of packet `n`,
    /// searched depth-first; `start_field` restricts the search to
    /// fields after that one in document order.
    pub fn get_field(
        &mut self,
        n: u64,
        proto: &str,
        field: &str,
        start_field: Option<&str>,
    ) -> Result<Option<PdmlField>, ReaderError> {
        let packet = self.get_packet(n)?;
        let found = match start_field {
            None => packet.field(proto, field),
            Some(start) => packet.field_after(proto, field, start),
        };
        Ok(found.cloned())
    }
}

/// Locate every top-level `<packet>` element. The offset table starts
/// small and grows by 10x whenever it fills up, so long captures do not
/// reallocate per packet.
fn scan_offsets(bytes: &[u8]) -> Result<Vec<(u64, u32)>, ReaderError> {
    let mut offsets: Vec<(u64, u32)> = Vec::with_capacity(INITIAL_PACKET_SLOTS);
    let mut position = 0usize;

    while let Some(found) = find_from(bytes, b"<packet", position) {
        let end = packet_end(bytes, found)
            .ok_or_else(|| ReaderError::Parse("unterminated <packet> element".to_string()))?;

        if offsets.len() == offsets.capacity() {
            offsets.reserve(offsets.capacity() * 9);
        }
        offsets.push((found as u64, (end - found) as u32));
        position = end;
    }

    Ok(offsets)
}

fn find_from(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// Byte just past the `</packet>` that closes the element starting at
/// `start`, tracking nesting (PSML packets contain no nested packets,
/// but be safe).
fn packet_end(bytes: &[u8], start: usize) -> Option<usize> {
    // Self-closing <packet .../>?
    let tag_close = find_from(bytes, b">", start)?;
    if bytes[tag_close - 1] == b'/' {
        return Some(tag_close + 1);
    }

    let mut depth = 1;
    let mut cursor = tag_close;
    loop {
        let open = find_from(bytes, b"<packet", cursor);
        let close = find_from(bytes, b"</packet>", cursor)?;
        match open {
            Some(open) if open < close => {
                depth += 1;
                cursor = open + 7;
            }
            _ => {
                depth -= 1;
                cursor = close + 9;
                if depth == 0 {
                    return Some(cursor);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_packets() -> String {
        concat!(
            "<pdml>",
            "<packet num=\"1\"><proto name=\"a\"/></packet>",
            "<packet num=\"2\"><proto name=\"b\"/></packet>",
            "<packet num=\"3\"/>",
            "</pdml>"
        )
        .to_string()
    }

    #[test]
    fn offsets_cover_every_packet() {
        let mut reader = PxmlReader::from_string(three_packets()).unwrap();
        assert_eq!(reader.packet_count(), 3);

        let xml = reader.get_packet_xml(2).unwrap();
        assert!(xml.starts_with("<packet num=\"2\""));
        assert!(xml.ends_with("</packet>"));

        let xml = reader.get_packet_xml(3).unwrap();
        assert_eq!(xml, "<packet num=\"3\"/>");
    }

    #[test]
    fn out_of_range_packets_are_reported() {
        let mut reader = PxmlReader::from_string(three_packets()).unwrap();
        assert!(matches!(
            reader.get_packet_xml(0),
            Err(ReaderError::OutOfRange(0))
        ));
        assert!(matches!(
            reader.get_packet_xml(4),
            Err(ReaderError::OutOfRange(4))
        ));
    }
}
