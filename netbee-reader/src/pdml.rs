//! PDML: the full decoded field tree as XML, one `<packet>` element per
//! packet. The writer is a visitor over the decoded tree; the reader
//! parses one packet slice back into a light tree.

use std::collections::HashMap;

use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};

use netbee_decoder::{DecodedPacket, FieldId};

use crate::ReaderError;

/// Serialize one decoded packet as a `<packet>` element.
pub fn write_packet(packet: &DecodedPacket) -> String {
    let mut writer = Writer::new(Vec::new());

    let mut start = BytesStart::new("packet");
    start.push_attribute(("num", packet.num.to_string().as_str()));
    start.push_attribute(("length", packet.length.to_string().as_str()));
    start.push_attribute(("caplength", packet.cap_length.to_string().as_str()));
    start.push_attribute((
        "timestamp",
        format!("{}.{:06}", packet.ts_sec, packet.ts_usec).as_str(),
    ));
    let _ = writer.write_event(Event::Start(start));

    for (ord, proto) in packet.protos().iter().enumerate() {
        let mut start = BytesStart::new("proto");
        start.push_attribute(("name", proto.name.as_str()));
        start.push_attribute(("longname", proto.longname.as_str()));
        start.push_attribute(("pos", proto.position.to_string().as_str()));
        start.push_attribute(("size", proto.size.to_string().as_str()));
        let _ = writer.write_event(Event::Start(start));

        for (id, _) in packet.proto_fields(ord) {
            write_field(&mut writer, packet, id);
        }

        let _ = writer.write_event(Event::End(BytesEnd::new("proto")));
    }

    let _ = writer.write_event(Event::End(BytesEnd::new("packet")));
    String::from_utf8(writer.into_inner()).unwrap_or_default()
}

fn write_field(writer: &mut Writer<Vec<u8>>, packet: &DecodedPacket, id: FieldId) {
    let field = packet.field(id);

    let mut start = BytesStart::new("field");
    start.push_attribute(("name", field.name.as_str()));
    start.push_attribute(("longname", field.longname.as_str()));
    start.push_attribute(("pos", field.position.to_string().as_str()));
    start.push_attribute(("size", field.size.to_string().as_str()));
    if !field.value.is_empty() {
        start.push_attribute(("value", hex::encode(&field.value).as_str()));
    }
    if !field.show.is_empty() {
        start.push_attribute(("show", field.show.as_str()));
    }
    if let Some(detail) = &field.show_detail {
        start.push_attribute(("showdtl", detail.as_str()));
    }
    if let Some(map) = &field.show_map {
        start.push_attribute(("showmap", map.as_str()));
    }
    if let Some(mask) = field.mask {
        start.push_attribute(("mask", format!("{mask:#x}").as_str()));
    }

    let has_children = packet.children(id).next().is_some();
    if !has_children {
        let _ = writer.write_event(Event::Empty(start));
        return;
    }

    let _ = writer.write_event(Event::Start(start));
    for (child, _) in packet.children(id) {
        write_field(writer, packet, child);
    }
    let _ = writer.write_event(Event::End(BytesEnd::new("field")));
}

/// A parsed `<field>` element.
#[derive(Debug, Clone, Default)]
pub struct PdmlField {
    pub name: String,
    pub longname: String,
    pub pos: usize,
    pub size: usize,
    pub value: Vec<u8>,
    pub show: String,
    pub fields: Vec<PdmlField>,
}

#[derive(Debug, Clone, Default)]
pub struct PdmlProto {
    pub name: String,
    pub longname: String,
    pub pos: usize,
    pub size: usize,
    pub fields: Vec<PdmlField>,
}

#[derive(Debug, Clone, Default)]
pub struct PdmlPacket {
    pub num: u64,
    pub length: u32,
    pub cap_length: u32,
    pub timestamp: String,
    pub protos: Vec<PdmlProto>,
}

impl PdmlPacket {
    /// Depth-first search with sibling recursion: the first field with
    /// this name inside the named protocol.
    pub fn field(&self, proto: &str, name: &str) -> Option<&PdmlField> {
        let proto = self.protos.iter().find(|p| p.name == proto)?;
        find_in(&proto.fields, name)
    }

    /// The first occurrence of `name` after a field named `start`, in
    /// document order.
    pub fn field_after(&self, proto: &str, name: &str, start: &str) -> Option<&PdmlField> {
        let proto = self.protos.iter().find(|p| p.name == proto)?;
        let mut flat = Vec::new();
        flatten(&proto.fields, &mut flat);
        let from = flat.iter().position(|f| f.name == start)?;
        flat[from + 1..].iter().find(|f| f.name == name).copied()
    }
}

fn find_in<'a>(fields: &'a [PdmlField], name: &str) -> Option<&'a PdmlField> {
    for field in fields {
        if field.name == name {
            return Some(field);
        }
        if let Some(found) = find_in(&field.fields, name) {
            return Some(found);
        }
    }
    None
}

fn flatten<'a>(fields: &'a [PdmlField], out: &mut Vec<&'a PdmlField>) {
    for field in fields {
        out.push(field);
        flatten(&field.fields, out);
    }
}

/// Parse one `<packet>` slice back into a tree.
pub fn parse_packet(xml: &str) -> Result<PdmlPacket, ReaderError> {
    let mut reader = Reader::from_reader(xml.as_bytes());
    reader.trim_text(true);
    let mut buf = Vec::new();

    let mut packet = PdmlPacket::default();
    // Stack of open <field> elements; fields close into their parent or
    // into the open proto.
    let mut field_stack: Vec<PdmlField> = Vec::new();
    let mut open_proto: Option<PdmlProto> = None;

    fn close_field(
        field_stack: &mut Vec<PdmlField>,
        open_proto: &mut Option<PdmlProto>,
    ) {
        if let Some(done) = field_stack.pop() {
            if let Some(parent) = field_stack.last_mut() {
                parent.fields.push(done);
            } else if let Some(proto) = open_proto.as_mut() {
                proto.fields.push(done);
            }
        }
    }

    loop {
        let event = reader.read_event_into(&mut buf);
        let (element, self_closing) = match &event {
            Err(e) => return Err(ReaderError::Parse(e.to_string())),
            Ok(Event::Eof) => break,
            Ok(Event::Start(e)) => (Some(e.clone()), false),
            Ok(Event::Empty(e)) => (Some(e.clone()), true),
            Ok(Event::End(e)) => {
                match e.name().as_ref() {
                    b"field" => close_field(&mut field_stack, &mut open_proto),
                    b"proto" => {
                        if let Some(done) = open_proto.take() {
                            packet.protos.push(done);
                        }
                    }
                    _ => {}
                }
                (None, false)
            }
            Ok(_) => (None, false),
        };

        if let Some(e) = element {
            let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
            let attrs = collect_attrs(&reader, &e)?;

            match name.as_str() {
                "packet" => {
                    packet.num = attr_num(&attrs, "num");
                    packet.length = attr_num(&attrs, "length") as u32;
                    packet.cap_length = attr_num(&attrs, "caplength") as u32;
                    packet.timestamp = attrs.get("timestamp").cloned().unwrap_or_default();
                }
                "proto" => {
                    open_proto = Some(PdmlProto {
                        name: attrs.get("name").cloned().unwrap_or_default(),
                        longname: attrs.get("longname").cloned().unwrap_or_default(),
                        pos: attr_num(&attrs, "pos") as usize,
                        size: attr_num(&attrs, "size") as usize,
                        fields: Vec::new(),
                    });
                }
                "field" => {
                    field_stack.push(PdmlField {
                        name: attrs.get("name").cloned().unwrap_or_default(),
                        longname: attrs.get("longname").cloned().unwrap_or_default(),
                        pos: attr_num(&attrs, "pos") as usize,
                        size: attr_num(&attrs, "size") as usize,
                        value: attrs
                            .get("value")
                            .and_then(|v| hex::decode(v).ok())
                            .unwrap_or_default(),
                        show: attrs.get("show").cloned().unwrap_or_default(),
                        fields: Vec::new(),
                    });
                    if self_closing {
                        close_field(&mut field_stack, &mut open_proto);
                    }
                }
                _ => {}
            }
        }
        buf.clear();
    }

    Ok(packet)
}

fn collect_attrs(
    reader: &Reader<&[u8]>,
    start: &BytesStart<'_>,
) -> Result<HashMap<String, String>, ReaderError> {
    let mut out = HashMap::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| ReaderError::Parse(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .decode_and_unescape_value(reader)
            .map_err(|e| ReaderError::Parse(e.to_string()))?
            .into_owned();
        out.insert(key, value);
    }
    Ok(out)
}

fn attr_num(attrs: &HashMap<String, String>, name: &str) -> u64 {
    attrs
        .get(name)
        .and_then(|v| v.parse().ok())
        .unwrap_or_default()
}
