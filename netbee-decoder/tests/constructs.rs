use netbee_decoder::{DecodedPacket, Decoder, LinkLayer, Packet};
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

fn wrap(fields: &str) -> String {
    format!(
        r##"
<netpdl name="test" version="0.2">
  <proto name="startproto">
    <format><fields/></format>
    <encapsulation><nextproto proto="#p"/></encapsulation>
  </proto>
  <proto name="p">
    <format><fields>{fields}</fields></format>
  </proto>
  <proto name="defaultproto">
    <format><fields><field type="eatall" name="payload"/></fields></format>
  </proto>
</netpdl>
"##
    )
}

#[test]
fn set_repeats_its_lookahead_until_the_default_fires() {
    let db = load(&wrap(
        r#"
        <set>
          <field type="fixed" name="kind" size="1"/>
          <fieldmatch match="buf2int(this.kind) == 1" recurring="yes">
            <field type="fixed" name="one" size="1"/>
          </fieldmatch>
          <fieldmatch match="buf2int(this.kind) == 2" recurring="yes">
            <field type="fixed" name="two" size="2"/>
          </fieldmatch>
          <exit-when expr="false"/>
          <default-item><field type="eatall" name="junk"/></default-item>
        </set>
"#,
    ));

    let packet = decode(&db, &[0x01, 0xAA, 0x02, 0xBB, 0xCC, 0x03, 0xDD]);

    let kinds: Vec<_> = packet
        .fields()
        .filter(|f| f.name == "kind")
        .map(|f| f.position)
        .collect();
    assert_eq!(kinds, vec![0, 2, 5]);

    assert!(packet.fields().any(|f| f.name == "one" && f.position == 1));
    assert!(packet
        .fields()
        .any(|f| f.name == "two" && f.position == 3 && f.size == 2));
    // The unmatched kind falls to the default item, which ends the set.
    assert!(packet.fields().any(|f| f.name == "junk" && f.position == 6));
}

#[test]
fn non_recurring_matches_fire_once() {
    let db = load(&wrap(
        r#"
        <set>
          <field type="fixed" name="kind" size="1"/>
          <fieldmatch match="buf2int(this.kind) == 1" recurring="no">
            <field type="fixed" name="one" size="1"/>
          </fieldmatch>
          <exit-when expr="false"/>
          <default-item><field type="eatall" name="rest"/></default-item>
        </set>
"#,
    ));

    // Two consecutive kind=1 records: only the first may match.
    let packet = decode(&db, &[0x01, 0xAA, 0x01, 0xBB]);

    let ones: Vec<_> = packet.fields().filter(|f| f.name == "one").collect();
    assert_eq!(ones.len(), 1);
    assert!(packet.fields().any(|f| f.name == "rest" && f.position == 3));
}

#[test]
fn token_wrapped_fields_take_the_bytes_between_delimiters() {
    let db = load(&wrap(
        r#"<field type="tokenwrapped" name="bracketed" begintoken="[" endtoken="]"/>"#,
    ));

    let packet = decode(&db, b"xx[abc]yy");
    let field = packet.fields().find(|f| f.name == "bracketed").unwrap();
    assert_eq!(field.position, 3);
    assert_eq!(field.size, 3);
    assert_eq!(field.value, b"abc".to_vec());

    // The remainder continues right after the closing token.
    assert!(packet
        .fields()
        .any(|f| f.name == "payload" && f.position == 7 && f.size == 2));
}

#[test]
fn token_wrapped_without_a_begin_continues_empty() {
    let db = load(&wrap(
        r#"<field type="tokenwrapped" name="bracketed" begintoken="[" endtoken="]"/>
           <field type="eatall" name="tail"/>"#,
    ));

    let packet = decode(&db, b"plain");
    let field = packet.fields().find(|f| f.name == "bracketed").unwrap();
    assert_eq!(field.size, 0);
    assert!(packet.fields().any(|f| f.name == "tail" && f.size == 5));
}

#[test]
fn delimited_fields_stop_before_their_end_pattern() {
    let db = load(&wrap(
        r#"<cfield type="delimited" name="tag" beginregex="&lt;" endregex="&gt;"/>"#,
    ));

    let packet = decode(&db, b"ab<hi>cd");
    let field = packet.fields().find(|f| f.name == "tag").unwrap();
    assert_eq!(field.position, 3);
    assert_eq!(field.value, b"hi".to_vec());
    assert!(packet.fields().any(|f| f.name == "payload" && f.position == 6));
}

#[test]
fn line_fields_consume_their_terminator() {
    let db = load(&wrap(
        r#"<field type="line" name="first"/>
           <field type="line" name="second"/>"#,
    ));

    let packet = decode(&db, b"abc\ndef");
    let first = packet.fields().find(|f| f.name == "first").unwrap();
    assert_eq!((first.position, first.size), (0, 3));
    let second = packet.fields().find(|f| f.name == "second").unwrap();
    assert_eq!((second.position, second.size), (4, 3));
}

#[test]
fn dynamic_fields_bind_named_captures() {
    let db = load(&wrap(
        r#"
        <cfield type="dynamic" name="request"
                pattern="(?P&lt;verb&gt;[A-Z]+) (?P&lt;path&gt;/\S*)">
          <subfield portion="verb" name="verb"/>
          <subfield portion="path" name="path"/>
        </cfield>
"#,
    ));

    let packet = decode(&db, b"GET /idx rest");
    let verb = packet.fields().find(|f| f.name == "verb").unwrap();
    assert_eq!(verb.value, b"GET".to_vec());
    let path = packet.fields().find(|f| f.name == "path").unwrap();
    assert_eq!(path.value, b"/idx".to_vec());
    assert_eq!((path.position, path.size), (4, 4));
}

#[test]
fn pattern_fields_match_anchored_at_the_cursor() {
    let db = load(&wrap(
        r#"<field type="pattern" name="digits" pattern="[0-9]+"/>
           <field type="eatall" name="tail"/>"#,
    ));

    let packet = decode(&db, b"123abc");
    let digits = packet.fields().find(|f| f.name == "digits").unwrap();
    assert_eq!(digits.value, b"123".to_vec());

    // A match further into the buffer does not count.
    let packet = decode(&db, b"abc123");
    let digits = packet.fields().find(|f| f.name == "digits").unwrap();
    assert_eq!(digits.size, 0);
}

#[test]
fn execute_before_seeds_variables_for_the_fields() {
    let db = load(
        r##"
<netpdl name="test" version="0.2">
  <variable name="$hdrlen" type="number" validity="thispacket"/>
  <proto name="startproto">
    <format><fields/></format>
    <encapsulation><nextproto proto="#p"/></encapsulation>
  </proto>
  <proto name="p">
    <execute-code>
      <before>
        <assign-variable name="$hdrlen" value="3"/>
      </before>
    </execute-code>
    <format><fields>
      <field type="variable" name="header" size="$hdrlen"/>
    </fields></format>
  </proto>
  <proto name="defaultproto">
    <format><fields><field type="eatall" name="payload"/></fields></format>
  </proto>
</netpdl>
"##,
    );

    let packet = decode(&db, &[1, 2, 3, 4]);
    let header = packet.fields().find(|f| f.name == "header").unwrap();
    assert_eq!(header.size, 3);
    assert!(packet.fields().any(|f| f.name == "payload" && f.position == 3));
}

#[test]
fn verify_failure_skips_the_protocol() {
    let db = load(
        r##"
<netpdl name="test" version="0.2">
  <variable name="$framelength" type="number" validity="thispacket"/>
  <proto name="startproto">
    <format><fields/></format>
    <encapsulation><nextproto proto="#picky"/></encapsulation>
  </proto>
  <proto name="picky">
    <execute-code>
      <verify when="$framelength &gt; 100"/>
    </execute-code>
    <format><fields><field type="eatall" name="accepted"/></fields></format>
  </proto>
  <proto name="defaultproto">
    <format><fields><field type="eatall" name="payload"/></fields></format>
  </proto>
</netpdl>
"##,
    );

    let packet = decode(&db, &[1, 2, 3]);
    assert!(!packet.fields().any(|f| f.name == "accepted"));
    assert!(packet.fields().any(|f| f.name == "payload"));
}

#[test]
fn loop_break_stops_at_the_marker() {
    let db = load(&wrap(
        r#"
        <loop type="times2repeat" expr="10">
          <field type="fixed" name="b" size="1"/>
          <if expr="buf2int(this.b) == 0">
            <if-true><loopctrl type="break"/></if-true>
          </if>
        </loop>
        <field type="eatall" name="tail"/>
"#,
    ));

    let packet = decode(&db, &[1, 2, 0, 4, 5]);
    let bs: Vec<_> = packet.fields().filter(|f| f.name == "b").collect();
    assert_eq!(bs.len(), 3, "stops at the zero byte");
    assert!(packet.fields().any(|f| f.name == "tail" && f.position == 3));
}
