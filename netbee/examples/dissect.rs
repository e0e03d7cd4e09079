//! Dissect one hard-coded Ethernet frame and print the field tree plus
//! its PDML rendering.

use netbee::reader::pdml;
use netbee::{initialize_from_xml, LinkLayer, LoadFlags, Packet};

const DATABASE: &str = r##"
<netpdl name="demo" version="0.2" creator="nbee.org" date="10-06-2012">
  <showtemplate name="mac" showtype="hex" showgrp="1" showsep=":"/>
  <showtemplate name="hex16" showtype="hex"/>
  <proto name="startproto">
    <format><fields/></format>
    <encapsulation><nextproto proto="#ethernet"/></encapsulation>
  </proto>
  <proto name="ethernet" longname="Ethernet 802.3">
    <format>
      <fields>
        <field type="fixed" name="dst" longname="MAC Destination" size="6" showtemplate="mac"/>
        <field type="fixed" name="src" longname="MAC Source" size="6" showtemplate="mac"/>
        <field type="fixed" name="type" longname="Ethertype" size="2" showtemplate="hex16"/>
        <switch expr="buf2int(this.type)">
          <case value="0x0800" show="IPv4"/>
          <case value="0x0806" show="ARP"/>
          <default show="unknown"/>
        </switch>
      </fields>
    </format>
  </proto>
  <proto name="defaultproto" longname="Data">
    <format><fields><field type="eatall" name="payload"/></fields></format>
  </proto>
</netpdl>
"##;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let nbee = initialize_from_xml(DATABASE, LoadFlags::FULL)?;
    let mut decoder = nbee.decoder();

    let frame = hex::decode("FFFFFFFFFFFF0011223344550800AABBCCDD")?;
    let decoded = decoder.decode(&Packet::new(&frame, LinkLayer::Ethernet))?;

    for (ord, proto) in decoded.protos().iter().enumerate() {
        println!("{} ({} bytes at {})", proto.longname, proto.size, proto.position);
        for (_, field) in decoded.proto_fields(ord) {
            println!("  {:12} {:>3}+{:<3} {}", field.name, field.position, field.size, field.show);
        }
    }

    println!("\n{}", pdml::write_packet(&decoded));
    Ok(())
}
