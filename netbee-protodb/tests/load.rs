use netbee_protodb::{
    load_xml, FieldVariant, LoadError, LoadFlags, NodeData, ProtocolDatabase,
};

const ETHERNET_DB: &str = r##"
<netpdl name="netpdl-test" version="0.2" creator="nbee.org" date="10-06-2012">
  <variable name="$linklayer" type="number" validity="static"/>
  <variable name="$framelength" type="number" validity="thispacket"/>
  <alias name="ETHERTYPE_IP" value="0x0800"/>

  <lookuptable name="flows" validity="dynamic" exactentries="64">
    <key name="srcaddr" type="buffer" size="4"/>
    <key name="dstaddr" type="buffer" size="4"/>
    <data name="count" type="number"/>
  </lookuptable>

  <showtemplate name="mac" showtype="hex" showgrp="1" showsep=":"/>
  <showtemplate name="dec16" showtype="dec"/>

  <proto name="startproto" longname="Starting protocol">
    <format><fields/></format>
    <encapsulation>
      <nextproto proto="#ethernet"/>
    </encapsulation>
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
    <format>
      <fields>
        <field type="eatall" name="payload" longname="Payload"/>
      </fields>
    </format>
  </proto>
</netpdl>
"##;

fn find_field<'d>(db: &'d ProtocolDatabase, name: &str) -> Option<&'d NodeData> {
    for id in db.node_ids() {
        if let NodeData::Field { base, .. } = &db.node(id).data {
            if base.name == name {
                return Some(&db.node(id).data);
            }
        }
    }
    None
}

#[test]
fn loads_and_organizes_the_sample() {
    let db = load_xml(ETHERNET_DB, LoadFlags::FULL).unwrap();

    assert_eq!(db.proto_count(), 3);
    assert_eq!(db.proto_index("ethernet"), Some(1));
    assert_eq!(db.proto_name(db.start_proto()), "startproto");
    assert_eq!(db.proto_name(db.default_proto()), "defaultproto");
    assert!(db.padding_proto().is_none());

    assert_eq!(db.info().creator, "nbee.org");
    assert_eq!(db.info().version_major, 0);
    assert_eq!(db.info().version_minor, 2);

    match find_field(&db, "dst").unwrap() {
        NodeData::Field { base, variant, .. } => {
            assert!(matches!(variant, FieldVariant::Fixed { size: 6 }));
            assert!(base.show_template_link.is_some());
        }
        _ => unreachable!(),
    }
}

#[test]
fn loading_twice_is_observationally_equal() {
    let first = load_xml(ETHERNET_DB, LoadFlags::FULL).unwrap();
    let second = load_xml(ETHERNET_DB, LoadFlags::FULL).unwrap();

    assert_eq!(first.node_count(), second.node_count());
    for tag in ["proto", "field", "showtemplate", "lookuptable", "variable", "alias"] {
        assert_eq!(first.count_tag(tag), second.count_tag(tag), "tag {tag}");
    }

    // Resolved links land on the same indices.
    for (a, b) in first.node_ids().zip(second.node_ids()) {
        let (a, b) = (first.node(a), second.node(b));
        assert_eq!(a.data.tag(), b.data.tag());
        assert_eq!(a.links.parent, b.links.parent);
        assert_eq!(a.links.next_sibling, b.links.next_sibling);
    }
}

#[test]
fn minimal_load_skips_visualization() {
    let db = load_xml(ETHERNET_DB, LoadFlags::MINIMAL).unwrap();
    assert_eq!(db.count_tag("showtemplate"), 0);

    // Fields keep their template names but stay unbound.
    match find_field(&db, "dst").unwrap() {
        NodeData::Field { base, .. } => assert!(base.show_template_link.is_none()),
        _ => unreachable!(),
    }
}

#[test]
fn missing_mandatory_protocols_fail_the_load() {
    let xml = r#"
<netpdl name="x" version="0.2">
  <proto name="startproto"><format><fields/></format></proto>
</netpdl>
"#;
    match load_xml(xml, LoadFlags::FULL) {
        Err(LoadError::Structural { reason, .. }) => {
            assert!(reason.contains("defaultproto"), "{reason}")
        }
        other => panic!("expected a structural failure, got {other:?}"),
    }
}

#[test]
fn version_mismatch_is_detected() {
    let xml = r#"<netpdl name="x" version="3.1"><proto name="startproto"/></netpdl>"#;
    assert!(matches!(
        load_xml(xml, LoadFlags::FULL),
        Err(LoadError::VersionMismatch {
            found_major: 3,
            found_minor: 1
        })
    ));
}

#[test]
fn nesting_deeper_than_the_cap_fails() {
    let mut xml = String::from(r#"<netpdl name="x" version="0.2">"#);
    for _ in 0..40 {
        xml.push_str(r#"<block name="b">"#);
    }
    for _ in 0..40 {
        xml.push_str("</block>");
    }
    xml.push_str("</netpdl>");

    match load_xml(&xml, LoadFlags::FULL) {
        Err(LoadError::Structural { reason, .. }) => assert!(reason.contains("nested"), "{reason}"),
        other => panic!("expected a structural failure, got {other:?}"),
    }
}

#[test]
fn duplicate_protocols_fail_the_load() {
    let xml = r#"
<netpdl name="x" version="0.2">
  <proto name="startproto"><format><fields/></format></proto>
  <proto name="startproto"><format><fields/></format></proto>
  <proto name="defaultproto"><format><fields/></format></proto>
</netpdl>
"#;
    assert!(matches!(
        load_xml(xml, LoadFlags::FULL),
        Err(LoadError::Structural { .. })
    ));
}

#[test]
fn reserved_lookup_columns_are_rejected() {
    let xml = r#"
<netpdl name="x" version="0.2">
  <lookuptable name="t" validity="static">
    <key name="k" type="number"/>
    <data name="timestamp" type="number"/>
  </lookuptable>
  <proto name="startproto"><format><fields/></format></proto>
  <proto name="defaultproto"><format><fields/></format></proto>
</netpdl>
"#;
    match load_xml(xml, LoadFlags::FULL) {
        Err(LoadError::Structural { reason, .. }) => {
            assert!(reason.contains("reserved"), "{reason}")
        }
        other => panic!("expected a structural failure, got {other:?}"),
    }
}

#[test]
fn adt_calls_expand_into_concrete_fields() {
    let xml = r#"
<netpdl name="x" version="0.2">
  <adt name="u16val">
    <field type="fixed" name="val" longname="Value" size="2"/>
  </adt>
  <proto name="startproto"><format><fields/></format></proto>
  <proto name="defaultproto">
    <format>
      <fields>
        <adtfield adttype="u16val" name="checksum" longname="Checksum"/>
      </fields>
    </format>
  </proto>
</netpdl>
"#;
    let db = load_xml(xml, LoadFlags::FULL).unwrap();

    assert_eq!(db.count_tag("adtfield"), 0, "calls must not survive");
    match find_field(&db, "checksum").unwrap() {
        NodeData::Field { base, variant, .. } => {
            assert_eq!(base.longname, "Checksum");
            assert!(matches!(variant, FieldVariant::Fixed { size: 2 }));
        }
        _ => unreachable!(),
    }
}

#[test]
fn unknown_adt_fails_the_load() {
    let xml = r#"
<netpdl name="x" version="0.2">
  <proto name="startproto"><format><fields>
    <adtfield adttype="nosuch"/>
  </fields></format></proto>
  <proto name="defaultproto"><format><fields/></format></proto>
</netpdl>
"#;
    match load_xml(xml, LoadFlags::FULL) {
        Err(LoadError::Structural { reason, .. }) => assert!(reason.contains("nosuch")),
        other => panic!("expected a structural failure, got {other:?}"),
    }
}

#[test]
fn includeblk_binds_to_its_block() {
    let xml = r#"
<netpdl name="x" version="0.2">
  <proto name="startproto"><format><fields/></format></proto>
  <proto name="defaultproto">
    <format>
      <fields>
        <block name="vlan" longname="VLAN tag">
          <field type="fixed" name="tci" size="2"/>
        </block>
        <includeblk name="vlan"/>
      </fields>
    </format>
  </proto>
</netpdl>
"#;
    let db = load_xml(xml, LoadFlags::FULL).unwrap();

    let mut bound = false;
    for id in db.node_ids() {
        if let NodeData::IncludeBlk { link, .. } = &db.node(id).data {
            assert!(link.is_some());
            bound = true;
        }
    }
    assert!(bound);
}

#[test]
fn bit_groups_are_stitched() {
    let xml = r#"
<netpdl name="x" version="0.2">
  <proto name="startproto"><format><fields/></format></proto>
  <proto name="defaultproto">
    <format>
      <fields>
        <field type="bit" name="version" size="1" mask="0xF0"/>
        <field type="bit" name="hlen" size="1" mask="0x0F"/>
        <field type="fixed" name="tos" size="1"/>
      </fields>
    </format>
  </proto>
</netpdl>
"#;
    let db = load_xml(xml, LoadFlags::FULL).unwrap();

    let mut flags = Vec::new();
    let mut mask_bits = 0;
    let mut covering = 0;
    for id in db.node_ids() {
        if let NodeData::Field {
            variant: FieldVariant::Bit { last_of_group, mask, size },
            ..
        } = &db.node(id).data
        {
            flags.push(*last_of_group);
            mask_bits += mask.count_ones();
            covering = *size;
        }
    }
    assert_eq!(flags, vec![false, true]);

    // The group's masks cover its whole integer.
    assert_eq!(mask_bits, covering * 8);
}

#[test]
fn bit_subfields_are_stitched_too() {
    let xml = r#"
<netpdl name="x" version="0.2">
  <proto name="startproto"><format><fields/></format></proto>
  <proto name="defaultproto">
    <format>
      <fields>
        <cfield type="tlv" name="opt" tsize="1" lsize="1">
          <subfield portion="tlv-value" type="bit" name="hi" size="1" mask="0xF0"/>
          <subfield portion="tlv-value" type="bit" name="lo" size="1" mask="0x0F"/>
        </cfield>
      </fields>
    </format>
  </proto>
</netpdl>
"#;
    let db = load_xml(xml, LoadFlags::FULL).unwrap();

    let mut flags = Vec::new();
    for id in db.node_ids() {
        if let NodeData::Subfield {
            variant: FieldVariant::Bit { last_of_group, .. },
            ..
        } = &db.node(id).data
        {
            flags.push(*last_of_group);
        }
    }
    assert_eq!(flags, vec![false, true]);
}

#[test]
fn case_insensitive_switch_needs_buffer_kind() {
    let xml = r#"
<netpdl name="x" version="0.2">
  <proto name="startproto"><format><fields>
    <switch expr="1 + 1" casesensitive="no">
      <case value="2"><field type="fixed" name="f" size="1"/></case>
    </switch>
  </fields></format></proto>
  <proto name="defaultproto"><format><fields/></format></proto>
</netpdl>
"#;
    assert!(matches!(
        load_xml(xml, LoadFlags::FULL),
        Err(LoadError::Structural { .. })
    ));
}

#[test]
fn malformed_xml_reports_a_syntax_error() {
    let xml = "<netpdl name='x' version='0.2'><proto></netpdl>";
    assert!(matches!(
        load_xml(xml, LoadFlags::FULL),
        Err(LoadError::XmlSyntax { .. })
    ));
}

#[test]
fn update_lookuptable_shape_is_checked() {
    let xml = r#"
<netpdl name="x" version="0.2">
  <lookuptable name="flows" validity="dynamic" exactentries="8">
    <key name="addr" type="buffer" size="4"/>
    <data name="count" type="number"/>
  </lookuptable>
  <variable name="$a" type="buffer" validity="thispacket" size="4"/>
  <proto name="startproto">
    <execute-code>
      <before>
        <update-lookuptable name="flows" action="add" validity="keepforever">
          <lookupkey value="$a"/>
        </update-lookuptable>
      </before>
    </execute-code>
    <format><fields/></format>
  </proto>
  <proto name="defaultproto"><format><fields/></format></proto>
</netpdl>
"#;
    match load_xml(xml, LoadFlags::FULL) {
        Err(LoadError::Structural { reason, .. }) => {
            assert!(reason.contains("data columns"), "{reason}")
        }
        other => panic!("expected a structural failure, got {other:?}"),
    }
}

#[test]
fn dynamic_policies_need_a_dynamic_table() {
    let xml = r#"
<netpdl name="x" version="0.2">
  <lookuptable name="fixed" validity="static" exactentries="8">
    <key name="addr" type="buffer" size="4"/>
    <data name="count" type="number"/>
  </lookuptable>
  <variable name="$a" type="buffer" validity="thispacket" size="4"/>
  <proto name="startproto">
    <execute-code>
      <before>
        <update-lookuptable name="fixed" action="add" validity="keepmaxtime" keeptime="60">
          <lookupkey value="$a"/>
          <lookupdata value="1"/>
        </update-lookuptable>
      </before>
    </execute-code>
    <format><fields/></format>
  </proto>
  <proto name="defaultproto"><format><fields/></format></proto>
</netpdl>
"#;
    match load_xml(xml, LoadFlags::FULL) {
        Err(LoadError::Structural { reason, .. }) => {
            assert!(reason.contains("dynamic"), "{reason}")
        }
        other => panic!("expected a structural failure, got {other:?}"),
    }
}
