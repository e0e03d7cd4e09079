//! PSML: one summary line per packet, one `<section>` per column of the
//! database's summary structure.

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use netbee_decoder::DecodedPacket;
use netbee_protodb::{NodeData, PacketHdrItem, ProtocolDatabase};

/// Column names declared by the database's `showsumstruct`.
pub fn structure(db: &ProtocolDatabase) -> Vec<String> {
    let mut out = Vec::new();
    for id in db.node_ids() {
        if matches!(db.node(id).data, NodeData::ShowSumStructure) {
            for (_, child) in db.children(id) {
                if let NodeData::SumSection { name, .. } = &child.data {
                    out.push(name.clone());
                }
            }
        }
    }
    out
}

/// Run each decoded protocol's summary template over the packet and
/// produce one value per summary column.
pub fn summary_values(db: &ProtocolDatabase, packet: &DecodedPacket) -> Vec<String> {
    let columns = structure(db);
    let mut values = vec![String::new(); columns.len()];
    let mut current: Option<usize> = None;

    let mut append = |values: &mut Vec<String>, current: Option<usize>, text: &str| {
        if let Some(column) = current {
            if !values[column].is_empty() {
                values[column].push(' ');
            }
            values[column].push_str(text);
        }
    };

    for (ord, proto) in packet.protos().iter().enumerate() {
        let template = match &db.proto_node(proto.proto_index).data {
            NodeData::Proto {
                show_sum_template_link,
                ..
            } => *show_sum_template_link,
            _ => continue,
        };
        if template.is_none() {
            continue;
        }

        for (_, item) in db.children(template) {
            match &item.data {
                NodeData::ShowCodeSection { name } => {
                    current = columns.iter().position(|c| c == name);
                }
                NodeData::ShowCodeText { value, .. } => {
                    append(&mut values, current, value);
                }
                NodeData::ShowCodeProtoHdr => {
                    append(&mut values, current, &proto.name);
                }
                NodeData::ShowCodeProtoField { field, .. } => {
                    let shown = packet
                        .proto_fields(ord)
                        .find(|(_, f)| f.name == *field)
                        .map(|(_, f)| f.show.clone())
                        .unwrap_or_default();
                    append(&mut values, current, &shown);
                }
                NodeData::ShowCodePacketHdr { item } => {
                    let text = match item {
                        PacketHdrItem::Number => packet.num.to_string(),
                        PacketHdrItem::Timestamp => {
                            format!("{}.{:06}", packet.ts_sec, packet.ts_usec)
                        }
                        PacketHdrItem::Length => packet.length.to_string(),
                        PacketHdrItem::CapturedLength => packet.cap_length.to_string(),
                    };
                    append(&mut values, current, &text);
                }
                _ => {}
            }
        }
    }

    values
}

/// The `<structure>` header listing the summary columns.
pub fn write_structure(columns: &[String]) -> String {
    let mut writer = Writer::new(Vec::new());
    let _ = writer.write_event(Event::Start(BytesStart::new("structure")));
    for column in columns {
        let _ = writer.write_event(Event::Start(BytesStart::new("section")));
        let _ = writer.write_event(Event::Text(BytesText::new(column)));
        let _ = writer.write_event(Event::End(BytesEnd::new("section")));
    }
    let _ = writer.write_event(Event::End(BytesEnd::new("structure")));
    String::from_utf8(writer.into_inner()).unwrap_or_default()
}

/// One `<packet>` summary line.
pub fn write_summary(packet: &DecodedPacket, values: &[String]) -> String {
    let mut writer = Writer::new(Vec::new());

    let mut start = BytesStart::new("packet");
    start.push_attribute(("num", packet.num.to_string().as_str()));
    let _ = writer.write_event(Event::Start(start));

    for value in values {
        let _ = writer.write_event(Event::Start(BytesStart::new("section")));
        let _ = writer.write_event(Event::Text(BytesText::new(value)));
        let _ = writer.write_event(Event::End(BytesEnd::new("section")));
    }

    let _ = writer.write_event(Event::End(BytesEnd::new("packet")));
    String::from_utf8(writer.into_inner()).unwrap_or_default()
}
