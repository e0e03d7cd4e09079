use netbee_decoder::{Decoder, DecoderConfig, DecodedPacket, LinkLayer, Packet};
use netbee_protodb::{load_xml, LoadFlags, ProtocolDatabase};

fn load(xml: &str) -> ProtocolDatabase {
    load_xml(xml, LoadFlags::FULL).unwrap()
}

fn decode(db: &ProtocolDatabase, bytes: &[u8]) -> DecodedPacket {
    let mut decoder = Decoder::new(db);
    decoder
        .decode(&Packet::new(bytes, LinkLayer::Ethernet))
        .unwrap()
}

/// (name, position, size) triples of one decoded protocol's top fields.
fn field_shapes(packet: &DecodedPacket, proto: &str) -> Vec<(String, usize, usize)> {
    let ord = packet
        .protos()
        .iter()
        .position(|p| p.name == proto)
        .unwrap_or_else(|| panic!("no proto '{proto}' in {:?}", packet.protos()));
    packet
        .proto_fields(ord)
        .map(|(_, f)| (f.name.clone(), f.position, f.size))
        .collect()
}

const ETHERNET_DB: &str = r##"
<netpdl name="test" version="0.2" creator="nbee.org" date="10-06-2012">
  <showtemplate name="mac" showtype="hex" showgrp="1" showsep=":"/>
  <showtemplate name="dec16" showtype="dec"/>
  <proto name="startproto">
    <format><fields/></format>
    <encapsulation><nextproto proto="#ethernet"/></encapsulation>
  </proto>
  <proto name="ethernet" longname="Ethernet 802.3">
    <format>
      <fields>
        <field type="fixed" name="dst" longname="MAC Destination" size="6" showtemplate="mac"/>
        <field type="fixed" name="src" longname="MAC Source" size="6" showtemplate="mac"/>
        <field type="fixed" name="type" longname="Ethertype" size="2" showtemplate="dec16"/>
      </fields>
    </format>
  </proto>
  <proto name="defaultproto" longname="Data">
    <format><fields><field type="eatall" name="payload"/></fields></format>
  </proto>
</netpdl>
"##;

#[test]
fn ethernet_header_decodes_field_by_field() {
    let db = load(ETHERNET_DB);
    let bytes = hex::decode("FFFFFFFFFFFF0011223344550800AABB").unwrap();
    let packet = decode(&db, &bytes);

    assert_eq!(
        field_shapes(&packet, "ethernet"),
        vec![
            ("dst".to_string(), 0, 6),
            ("src".to_string(), 6, 6),
            ("type".to_string(), 12, 2),
        ]
    );

    let ethernet = &packet.protos()[0];
    assert_eq!(ethernet.name, "ethernet");
    assert_eq!(ethernet.size, 14, "cursor after ethernet");

    // The cursor moved exactly as far as the decoded fields are wide.
    let consumed: usize = packet.proto_fields(0).map(|(_, f)| f.size).sum();
    assert_eq!(consumed, ethernet.size);

    // No encapsulation matched: the default protocol takes the rest.
    assert_eq!(
        field_shapes(&packet, "defaultproto"),
        vec![("payload".to_string(), 14, 2)]
    );
    assert!(!packet.truncated);

    let dst = packet.fields().find(|f| f.name == "dst").unwrap();
    assert_eq!(dst.value, vec![0xFF; 6]);
    assert_eq!(dst.show, "ff:ff:ff:ff:ff:ff");
}

#[test]
fn switch_case_show_overrides_the_field() {
    let db = load(
        r##"
<netpdl name="test" version="0.2">
  <proto name="startproto">
    <format><fields/></format>
    <encapsulation><nextproto proto="#ethernet"/></encapsulation>
  </proto>
  <proto name="ethernet">
    <format>
      <fields>
        <field type="fixed" name="dst" size="6"/>
        <field type="fixed" name="src" size="6"/>
        <field type="fixed" name="type" size="2"/>
        <switch expr="buf2int(this.type)">
          <case value="0x0800" show="IPv4"/>
          <case value="0x0806" show="ARP"/>
          <default show="unknown"/>
        </switch>
      </fields>
    </format>
  </proto>
  <proto name="defaultproto">
    <format><fields><field type="eatall" name="payload"/></fields></format>
  </proto>
</netpdl>
"##,
    );

    let bytes = hex::decode("FFFFFFFFFFFF0011223344550800AABB").unwrap();
    let packet = decode(&db, &bytes);
    let type_field = packet.fields().find(|f| f.name == "type").unwrap();
    assert_eq!(type_field.show, "IPv4");

    let bytes = hex::decode("FFFFFFFFFFFF0011223344551234AABB").unwrap();
    let packet = decode(&db, &bytes);
    let type_field = packet.fields().find(|f| f.name == "type").unwrap();
    assert_eq!(type_field.show, "unknown");
}

#[test]
fn tlv_options_iterate_over_the_buffer() {
    let db = load(
        r##"
<netpdl name="test" version="0.2">
  <variable name="$packetlength" type="number" validity="thispacket"/>
  <proto name="startproto">
    <format><fields/></format>
    <encapsulation><nextproto proto="#opts"/></encapsulation>
  </proto>
  <proto name="opts">
    <format>
      <fields>
        <loop type="size" expr="$packetlength">
          <cfield type="tlv" name="opt" tsize="1" lsize="1"/>
        </loop>
      </fields>
    </format>
  </proto>
  <proto name="defaultproto">
    <format><fields><field type="eatall" name="payload"/></fields></format>
  </proto>
</netpdl>
"##,
    );

    let bytes = hex::decode("010341424302 00FF05FFFFFFFFFF".replace(' ', "")).unwrap();
    let packet = decode(&db, &bytes);

    let opts: Vec<_> = packet
        .fields()
        .filter(|f| f.name == "opt")
        .map(|f| (f.position, f.size))
        .collect();
    assert_eq!(opts.len(), 3);
    assert_eq!(opts[0], (0, 5));
    assert_eq!(opts[1], (5, 2));
    assert_eq!(opts[2], (7, 7));

    // Subfields hang off each TLV: type/length/value portions.
    let ord = packet.protos().iter().position(|p| p.name == "opts").unwrap();
    let (first_tlv, _) = packet.proto_fields(ord).next().unwrap();
    let parts: Vec<_> = packet
        .children(first_tlv)
        .map(|(_, f)| (f.name.clone(), f.size, f.value.clone()))
        .collect();
    assert_eq!(parts.len(), 3);
    assert_eq!(parts[0], ("type".to_string(), 1, vec![0x01]));
    assert_eq!(parts[1], ("length".to_string(), 1, vec![0x03]));
    assert_eq!(parts[2], ("value".to_string(), 3, b"ABC".to_vec()));
}

#[test]
fn token_ended_fields_stop_at_their_delimiter() {
    let db = load(
        r##"
<netpdl name="test" version="0.2">
  <proto name="startproto">
    <format><fields/></format>
    <encapsulation><nextproto proto="#http"/></encapsulation>
  </proto>
  <proto name="http">
    <format>
      <fields>
        <field type="tokenended" name="request" endtoken="\x0d\x0a" enddiscard="2"/>
        <field type="tokenended" name="header" endtoken="\x0d\x0a" enddiscard="2"/>
      </fields>
    </format>
  </proto>
  <proto name="defaultproto">
    <format><fields><field type="eatall" name="payload"/></fields></format>
  </proto>
</netpdl>
"##,
    );

    let packet = decode(&db, b"GET /index HTTP/1.1\r\nHost: x\r\n\r\n");
    let shapes = field_shapes(&packet, "http");
    assert_eq!(shapes[0], ("request".to_string(), 0, 19));
    assert_eq!(shapes[1], ("header".to_string(), 21, 7));

    let request = packet.fields().find(|f| f.name == "request").unwrap();
    assert_eq!(request.value, b"GET /index HTTP/1.1".to_vec());
}

const FLOWS_DB: &str = r##"
<netpdl name="test" version="0.2">
  <lookuptable name="flows" validity="dynamic" exactentries="16">
    <key name="srcaddr" type="buffer" size="4"/>
    <key name="dstaddr" type="buffer" size="4"/>
    <data name="count" type="number"/>
  </lookuptable>
  <proto name="startproto">
    <format><fields/></format>
    <encapsulation><nextproto proto="#pair"/></encapsulation>
  </proto>
  <proto name="pair">
    <format>
      <fields>
        <field type="fixed" name="src" size="4"/>
        <field type="fixed" name="dst" size="4"/>
        <if expr="checklookuptable(flows, this.src, this.dst)">
          <if-true><field type="variable" name="known" size="flows.count"/></if-true>
          <if-false><field type="eatall" name="unknown"/></if-false>
        </if>
      </fields>
    </format>
    <execute-code>
      <after>
        <update-lookuptable name="flows" action="add" validity="keepforever">
          <lookupkey value="this.src"/>
          <lookupkey value="this.dst"/>
          <lookupdata value="1"/>
        </update-lookuptable>
      </after>
    </execute-code>
  </proto>
  <proto name="defaultproto">
    <format><fields><field type="eatall" name="payload"/></fields></format>
  </proto>
</netpdl>
"##;

#[test]
fn lookup_tables_remember_flows_across_packets() {
    let db = load(FLOWS_DB);
    let mut decoder = Decoder::new(&db);

    let a_b = hex::decode("0A0000010A0000020000").unwrap();
    let a_c = hex::decode("0A0000010A0000030000").unwrap();

    // First sighting of (A, B): the check misses.
    let packet = decoder.decode(&Packet::new(&a_b, LinkLayer::Ethernet)).unwrap();
    assert!(packet.fields().any(|f| f.name == "unknown"));

    // Second (A, B): the row inserted by the first packet hits, and the
    // bound count drives the field size.
    let packet = decoder.decode(&Packet::new(&a_b, LinkLayer::Ethernet)).unwrap();
    let known = packet.fields().find(|f| f.name == "known").unwrap();
    assert_eq!(known.size, 1);

    // (A, C) was never inserted.
    let packet = decoder.decode(&Packet::new(&a_c, LinkLayer::Ethernet)).unwrap();
    assert!(packet.fields().any(|f| f.name == "unknown"));
}

#[test]
fn aged_rows_are_gone_at_their_deadline() {
    let db = load(
        r##"
<netpdl name="test" version="0.2">
  <lookuptable name="seen" validity="dynamic" exactentries="16">
    <key name="addr" type="buffer" size="4"/>
    <data name="hits" type="number"/>
  </lookuptable>
  <proto name="startproto">
    <format><fields/></format>
    <encapsulation><nextproto proto="#p"/></encapsulation>
  </proto>
  <proto name="p">
    <format>
      <fields>
        <field type="fixed" name="addr" size="4"/>
        <if expr="checklookuptable(seen, this.addr)">
          <if-true><field type="eatall" name="fresh"/></if-true>
          <if-false><field type="eatall" name="stale"/></if-false>
        </if>
      </fields>
    </format>
    <execute-code>
      <after>
        <update-lookuptable name="seen" action="add" validity="keepmaxtime" keeptime="60">
          <lookupkey value="this.addr"/>
          <lookupdata value="1"/>
        </update-lookuptable>
      </after>
    </execute-code>
  </proto>
  <proto name="defaultproto">
    <format><fields><field type="eatall" name="payload"/></fields></format>
  </proto>
</netpdl>
"##,
    );
    fn at(decoder: &mut Decoder<'_>, bytes: &[u8], sec: u32) -> DecodedPacket {
        decoder
            .decode(&Packet::new(bytes, LinkLayer::Ethernet).with_timestamp(sec, 0))
            .unwrap()
    }

    let mut decoder = Decoder::new(&db);
    let bytes = hex::decode("0A00000100").unwrap();

    let packet = at(&mut decoder, &bytes, 1000);
    assert!(packet.fields().any(|f| f.name == "stale"));

    // Within keeptime the row is live.
    let packet = at(&mut decoder, &bytes, 1059);
    assert!(packet.fields().any(|f| f.name == "fresh"));

    // At the deadline it is not.
    let packet = at(&mut decoder, &bytes, 1119);
    assert!(packet.fields().any(|f| f.name == "stale"));
}

const FLAGS_DB: &str = r##"
<netpdl name="test" version="0.2">
  <proto name="startproto">
    <format><fields/></format>
    <encapsulation><nextproto proto="#flagged"/></encapsulation>
  </proto>
  <proto name="flagged">
    <format>
      <fields>
        <field type="fixed" name="flags" size="1"/>
        <if expr="buf2int(this.flags) &amp; 0x01">
          <if-true><field type="eatall" name="lowbit"/></if-true>
          <if-false><field type="eatall" name="nolowbit"/></if-false>
        </if>
      </fields>
    </format>
  </proto>
  <proto name="defaultproto">
    <format><fields><field type="eatall" name="payload"/></fields></format>
  </proto>
</netpdl>
"##;

#[test]
fn if_branches_follow_the_flag_bit() {
    let db = load(FLAGS_DB);

    let packet = decode(&db, &[0x03, 0xAA]);
    assert!(packet.fields().any(|f| f.name == "lowbit"));

    let packet = decode(&db, &[0x02, 0xAA]);
    assert!(packet.fields().any(|f| f.name == "nolowbit"));
}

#[test]
fn truncation_marks_the_packet_and_keeps_the_stub_field() {
    let db = load(FLAGS_DB);
    let packet = decode(&db, &[]);

    assert!(packet.truncated);
    // The truncated field is present with its truncated (zero) size.
    let flags = packet.fields().find(|f| f.name == "flags").unwrap();
    assert_eq!(flags.size, 0);
}

#[test]
fn bit_groups_share_one_covering_integer() {
    let db = load(
        r##"
<netpdl name="test" version="0.2">
  <proto name="startproto">
    <format><fields/></format>
    <encapsulation><nextproto proto="#ip"/></encapsulation>
  </proto>
  <proto name="ip">
    <format>
      <fields>
        <field type="bit" name="version" size="1" mask="0xF0"/>
        <field type="bit" name="hlen" size="1" mask="0x0F"/>
        <field type="fixed" name="tos" size="1"/>
      </fields>
    </format>
  </proto>
  <proto name="defaultproto">
    <format><fields><field type="eatall" name="payload"/></fields></format>
  </proto>
</netpdl>
"##,
    );

    let packet = decode(&db, &[0x45, 0x00, 0xFF]);
    let shapes = field_shapes(&packet, "ip");

    // Both bit fields sit on byte 0; the cursor moves once.
    assert_eq!(shapes[0], ("version".to_string(), 0, 1));
    assert_eq!(shapes[1], ("hlen".to_string(), 0, 1));
    assert_eq!(shapes[2], ("tos".to_string(), 1, 1));

    let version = packet.fields().find(|f| f.name == "version").unwrap();
    assert_eq!(version.value, vec![4]);
    assert_eq!(version.show, "4");
    let hlen = packet.fields().find(|f| f.name == "hlen").unwrap();
    assert_eq!(hlen.value, vec![5]);
}

#[test]
fn arithmetic_wraps_at_32_bits() {
    // 0xFFFFFFFF + 2 wraps to 1, driving a one-byte field.
    let db = load(
        r##"
<netpdl name="test" version="0.2">
  <proto name="startproto">
    <format><fields/></format>
    <encapsulation><nextproto proto="#p"/></encapsulation>
  </proto>
  <proto name="p">
    <format>
      <fields>
        <field type="variable" name="wrapped" size="(4294967295 + 2)"/>
      </fields>
    </format>
  </proto>
  <proto name="defaultproto">
    <format><fields><field type="eatall" name="payload"/></fields></format>
  </proto>
</netpdl>
"##,
    );

    let packet = decode(&db, &[0xAA, 0xBB]);
    let wrapped = packet.fields().find(|f| f.name == "wrapped").unwrap();
    assert_eq!(wrapped.size, 1);
}

#[test]
fn byte_order_reversal_is_an_involution() {
    let db = load(
        r##"
<netpdl name="test" version="0.2">
  <proto name="startproto">
    <format><fields/></format>
    <encapsulation><nextproto proto="#p"/></encapsulation>
  </proto>
  <proto name="p">
    <format>
      <fields>
        <field type="fixed" name="word" size="4"/>
        <if expr="changebyteorder(changebyteorder(this.word)) == this.word">
          <if-true><field type="eatall" name="same"/></if-true>
          <if-false><field type="eatall" name="different"/></if-false>
        </if>
      </fields>
    </format>
  </proto>
  <proto name="defaultproto">
    <format><fields><field type="eatall" name="payload"/></fields></format>
  </proto>
</netpdl>
"##,
    );

    let packet = decode(&db, &[1, 2, 3, 4, 9]);
    assert!(packet.fields().any(|f| f.name == "same"));
}

#[test]
fn division_by_zero_aborts_into_the_default_protocol() {
    let db = load(
        r##"
<netpdl name="test" version="0.2">
  <proto name="startproto">
    <format><fields/></format>
    <encapsulation><nextproto proto="#p"/></encapsulation>
  </proto>
  <proto name="p">
    <format>
      <fields>
        <field type="variable" name="bad" size="1 / 0"/>
      </fields>
    </format>
  </proto>
  <proto name="defaultproto">
    <format><fields><field type="eatall" name="payload"/></fields></format>
  </proto>
</netpdl>
"##,
    );

    let packet = decode(&db, &[0xAA, 0xBB]);
    assert!(packet.fields().any(|f| f.name == "decoding-error"));
    // The default protocol still got the bytes.
    assert!(packet.fields().any(|f| f.name == "payload" && f.size == 2));
}

#[test]
fn loops_repeat_their_body() {
    let db = load(
        r##"
<netpdl name="test" version="0.2">
  <proto name="startproto">
    <format><fields/></format>
    <encapsulation><nextproto proto="#p"/></encapsulation>
  </proto>
  <proto name="p">
    <format>
      <fields>
        <loop type="times2repeat" expr="3">
          <field type="fixed" name="b" size="1"/>
        </loop>
      </fields>
    </format>
  </proto>
  <proto name="defaultproto">
    <format><fields><field type="eatall" name="payload"/></fields></format>
  </proto>
</netpdl>
"##,
    );

    let packet = decode(&db, &[1, 2, 3, 4]);
    let bs: Vec<_> = packet
        .fields()
        .filter(|f| f.name == "b")
        .map(|f| f.position)
        .collect();
    assert_eq!(bs, vec![0, 1, 2]);
}

#[test]
fn padding_aligns_to_the_protocol_start() {
    let db = load(
        r##"
<netpdl name="test" version="0.2">
  <proto name="startproto">
    <format><fields/></format>
    <encapsulation><nextproto proto="#p"/></encapsulation>
  </proto>
  <proto name="p">
    <format>
      <fields>
        <field type="fixed" name="head" size="3"/>
        <field type="padding" name="pad" align="4"/>
        <field type="fixed" name="next" size="1"/>
      </fields>
    </format>
  </proto>
  <proto name="defaultproto">
    <format><fields><field type="eatall" name="payload"/></fields></format>
  </proto>
</netpdl>
"##,
    );

    let packet = decode(&db, &[1, 2, 3, 0, 5]);
    let shapes = field_shapes(&packet, "p");
    assert_eq!(shapes[1], ("pad".to_string(), 3, 1));
    assert_eq!(shapes[2], ("next".to_string(), 4, 1));
}

#[test]
fn preferred_encapsulation_candidates_override() {
    let xml = r##"
<netpdl name="test" version="0.2">
  <proto name="startproto">
    <format><fields/></format>
    <encapsulation>
      <nextproto proto="#first"/>
      <nextproto proto="#second" preferred="yes"/>
    </encapsulation>
  </proto>
  <proto name="first">
    <format><fields><field type="eatall" name="in-first"/></fields></format>
  </proto>
  <proto name="second">
    <format><fields><field type="eatall" name="in-second"/></fields></format>
  </proto>
  <proto name="defaultproto">
    <format><fields><field type="eatall" name="payload"/></fields></format>
  </proto>
</netpdl>
"##;
    let db = load(xml);

    let packet = decode(&db, &[1]);
    assert!(packet.fields().any(|f| f.name == "in-second"));

    let mut strict = Decoder::with_config(
        &db,
        DecoderConfig {
            preferred_wins: false,
        },
    );
    let packet = strict.decode(&Packet::new(&[1], LinkLayer::Ethernet)).unwrap();
    assert!(packet.fields().any(|f| f.name == "in-first"));
}

#[test]
fn missing_packetdata_branch_handles_short_packets() {
    let db = load(
        r##"
<netpdl name="test" version="0.2">
  <proto name="startproto">
    <format><fields/></format>
    <encapsulation><nextproto proto="#p"/></encapsulation>
  </proto>
  <proto name="p">
    <format>
      <fields>
        <field type="fixed" name="head" size="1"/>
        <if expr="true">
          <if-true><field type="fixed" name="body" size="8"/></if-true>
          <missing-packetdata><field type="eatall" name="short"/></missing-packetdata>
        </if>
      </fields>
    </format>
  </proto>
  <proto name="defaultproto">
    <format><fields><field type="eatall" name="payload"/></fields></format>
  </proto>
</netpdl>
"##,
    );

    let packet = decode(&db, &[1, 2, 3]);
    assert!(!packet.truncated);
    let short = packet.fields().find(|f| f.name == "short").unwrap();
    assert_eq!(short.position, 1);
    assert_eq!(short.size, 2);
}

#[test]
fn hdrline_splits_name_and_value() {
    let db = load(
        r##"
<netpdl name="test" version="0.2">
  <proto name="startproto">
    <format><fields/></format>
    <encapsulation><nextproto proto="#http"/></encapsulation>
  </proto>
  <proto name="http">
    <format>
      <fields>
        <cfield type="hdrline" name="hdr" separator=": ">
          <subfield portion="hname" name="hname"/>
          <subfield portion="hvalue" name="hvalue"/>
        </cfield>
      </fields>
    </format>
  </proto>
  <proto name="defaultproto">
    <format><fields><field type="eatall" name="payload"/></fields></format>
  </proto>
</netpdl>
"##,
    );

    let packet = decode(&db, b"Host: example.org\r\nrest");
    let hname = packet.fields().find(|f| f.name == "hname").unwrap();
    assert_eq!(hname.value, b"Host".to_vec());
    let hvalue = packet.fields().find(|f| f.name == "hvalue").unwrap();
    assert_eq!(hvalue.value, b"example.org".to_vec());
}

#[test]
fn asn1_fields_recurse_into_constructed_types() {
    let db = load(
        r##"
<netpdl name="test" version="0.2">
  <proto name="startproto">
    <format><fields/></format>
    <encapsulation><nextproto proto="#tlv"/></encapsulation>
  </proto>
  <proto name="tlv">
    <format>
      <fields>
        <cfield type="asn1" name="cert" encoding="der"/>
      </fields>
    </format>
  </proto>
  <proto name="defaultproto">
    <format><fields><field type="eatall" name="payload"/></fields></format>
  </proto>
</netpdl>
"##,
    );

    // SEQUENCE { INTEGER 4, OCTET STRING "hi" }
    let bytes = hex::decode("30070201040402 6869".replace(' ', "")).unwrap();
    let packet = decode(&db, &bytes);

    let cert = packet.fields().find(|f| f.name == "cert").unwrap();
    assert_eq!(cert.size, 9);
    let names: Vec<_> = packet
        .fields()
        .filter(|f| f.name != "cert")
        .map(|f| f.name.clone())
        .collect();
    assert!(names.contains(&"integer".to_string()));
    assert!(names.contains(&"octetstring".to_string()));
}

#[test]
fn choice_picks_exactly_one_layout() {
    let db = load(
        r##"
<netpdl name="test" version="0.2">
  <proto name="startproto">
    <format><fields/></format>
    <encapsulation><nextproto proto="#p"/></encapsulation>
  </proto>
  <proto name="p">
    <format>
      <fields>
        <field type="fixed" name="tag" size="1"/>
        <choice>
          <fieldmatch match="buf2int(this.tag) == 1">
            <field type="fixed" name="one" size="1"/>
          </fieldmatch>
          <fieldmatch match="buf2int(this.tag) == 2">
            <field type="fixed" name="two" size="2"/>
          </fieldmatch>
          <exit-when expr="true"/>
          <default-item><field type="eatall" name="other"/></default-item>
        </choice>
      </fields>
    </format>
  </proto>
  <proto name="defaultproto">
    <format><fields><field type="eatall" name="payload"/></fields></format>
  </proto>
</netpdl>
"##,
    );

    let packet = decode(&db, &[0x02, 0xAA, 0xBB]);
    assert!(packet.fields().any(|f| f.name == "two" && f.size == 2));
    assert!(!packet.fields().any(|f| f.name == "one"));

    let packet = decode(&db, &[0x09, 0xAA]);
    assert!(packet.fields().any(|f| f.name == "other"));
}
