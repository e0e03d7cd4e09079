use std::io::Write;

use netbee_decoder::{Decoder, LinkLayer, Packet};
use netbee_protodb::{load_xml, LoadFlags};
use netbee_reader::{pdml, psml, PxmlReader};

const DB: &str = r##"
<netpdl name="test" version="0.2" creator="nbee.org" date="10-06-2012">
  <showsumstruct>
    <sumsection name="num"/>
    <sumsection name="info"/>
  </showsumstruct>
  <showsumtemplate name="ethsum">
    <section name="num"/>
    <packethdr value="num"/>
    <section name="info"/>
    <protohdr/>
    <protofield name="type"/>
  </showsumtemplate>
  <proto name="startproto">
    <format><fields/></format>
    <encapsulation><nextproto proto="#ethernet"/></encapsulation>
  </proto>
  <proto name="ethernet" longname="Ethernet 802.3" showsumtemplate="ethsum">
    <format>
      <fields>
        <field type="fixed" name="dst" size="6"/>
        <field type="fixed" name="src" size="6"/>
        <field type="fixed" name="type" size="2"/>
      </fields>
    </format>
  </proto>
  <proto name="defaultproto">
    <format><fields><field type="eatall" name="payload"/></fields></format>
  </proto>
</netpdl>
"##;

fn decode_two() -> (netbee_protodb::ProtocolDatabase, Vec<netbee_decoder::DecodedPacket>) {
    let db = load_xml(DB, LoadFlags::FULL).unwrap();
    let mut decoder = Decoder::new(&db);

    let first = hex::decode("FFFFFFFFFFFF0011223344550800AABB").unwrap();
    let second = hex::decode("00112233445566778899AABB0806").unwrap();
    let packets = vec![
        decoder.decode(&Packet::new(&first, LinkLayer::Ethernet)).unwrap(),
        decoder.decode(&Packet::new(&second, LinkLayer::Ethernet)).unwrap(),
    ];
    (db, packets)
}

#[test]
fn decoded_packets_round_trip_through_pdml() {
    let (_db, packets) = decode_two();

    let mut document = String::from("<pdml>");
    for packet in &packets {
        document.push_str(&pdml::write_packet(packet));
    }
    document.push_str("</pdml>");

    let mut reader = PxmlReader::from_string(document).unwrap();
    assert_eq!(reader.packet_count(), 2);

    let first = reader.get_packet(1).unwrap();
    assert_eq!(first.num, 1);
    assert_eq!(first.length, 16);
    let ethernet = first.protos.iter().find(|p| p.name == "ethernet").unwrap();
    assert_eq!(ethernet.size, 14);

    let src = reader.get_field(1, "ethernet", "src", None).unwrap().unwrap();
    assert_eq!(src.pos, 6);
    assert_eq!(src.size, 6);
    assert_eq!(src.value, hex::decode("001122334455").unwrap());

    // Name-scoped search honors the start marker.
    let after = reader
        .get_field(1, "ethernet", "dst", Some("src"))
        .unwrap();
    assert!(after.is_none(), "no dst after src in document order");

    assert!(matches!(
        reader.get_packet_xml(3),
        Err(netbee_reader::ReaderError::OutOfRange(3))
    ));
}

#[test]
fn file_backed_reader_seeks_per_packet() {
    let (_db, packets) = decode_two();

    let mut document = String::from("<pdml>");
    for packet in &packets {
        document.push_str(&pdml::write_packet(packet));
    }
    document.push_str("</pdml>");

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(document.as_bytes()).unwrap();

    let mut reader = PxmlReader::open(file.path()).unwrap();
    assert_eq!(reader.packet_count(), 2);

    let second = reader.get_packet(2).unwrap();
    assert_eq!(second.num, 2);
    let type_field = second.field("ethernet", "type").unwrap();
    assert_eq!(type_field.value, hex::decode("0806").unwrap());
}

#[test]
fn psml_summaries_fill_the_declared_columns() {
    let (db, packets) = decode_two();

    let columns = psml::structure(&db);
    assert_eq!(columns, vec!["num".to_string(), "info".to_string()]);

    let values = psml::summary_values(&db, &packets[0]);
    assert_eq!(values[0], "1");
    assert!(values[1].contains("ethernet"), "{}", values[1]);

    let line = psml::write_summary(&packets[0], &values);
    assert!(line.starts_with("<packet num=\"1\">"));
    assert!(line.contains("<section>1</section>"));

    let header = psml::write_structure(&columns);
    assert!(header.contains("<section>num</section>"));
}
