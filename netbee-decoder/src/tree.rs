//! The decoded-packet tree, built with the same arena-and-index
//! discipline as the protocol database.

/// Index of a decoded field; 0 is the "no field" sentinel.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct FieldId(u32);

impl FieldId {
    pub const NONE: FieldId = FieldId(0);

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }

    pub fn is_some(&self) -> bool {
        self.0 != 0
    }

    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone)]
pub struct DecodedField {
    pub name: String,
    pub longname: String,
    /// Byte offset in the packet.
    pub position: usize,
    pub size: usize,
    /// Raw bytes of the field.
    pub value: Vec<u8>,
    pub show: String,
    pub show_detail: Option<String>,
    pub show_map: Option<String>,
    /// Mask, for members of a bit group.
    pub mask: Option<u32>,
    /// Ordinal of the owning protocol within this packet.
    pub proto: usize,
    pub parent: FieldId,
    pub first_child: FieldId,
    pub prev_sibling: FieldId,
    pub next_sibling: FieldId,
}

#[derive(Debug, Clone)]
pub struct DecodedProto {
    /// Protocol index in the database.
    pub proto_index: usize,
    pub name: String,
    pub longname: String,
    pub position: usize,
    pub size: usize,
    pub first_field: FieldId,
    pub last_field: FieldId,
    /// One-line summary, when the protocol's template produces one.
    pub summary: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DecodedPacket {
    pub num: u64,
    pub length: u32,
    pub cap_length: u32,
    pub ts_sec: u32,
    pub ts_usec: u32,
    /// The packet ran out before its description did.
    pub truncated: bool,
    protos: Vec<DecodedProto>,
    fields: Vec<DecodedField>,
    /// Emission order, newest last; field references resolve against it.
    order: Vec<FieldId>,
}

impl DecodedPacket {
    pub(crate) fn new(num: u64, length: u32, cap_length: u32, ts_sec: u32, ts_usec: u32) -> Self {
        let sentinel = DecodedField {
            name: String::new(),
            longname: String::new(),
            position: 0,
            size: 0,
            value: Vec::new(),
            show: String::new(),
            show_detail: None,
            show_map: None,
            mask: None,
            proto: usize::MAX,
            parent: FieldId::NONE,
            first_child: FieldId::NONE,
            prev_sibling: FieldId::NONE,
            next_sibling: FieldId::NONE,
        };
        DecodedPacket {
            num,
            length,
            cap_length,
            ts_sec,
            ts_usec,
            truncated: false,
            protos: Vec::new(),
            fields: vec![sentinel],
            order: Vec::new(),
        }
    }

    pub fn protos(&self) -> &[DecodedProto] {
        &self.protos
    }

    pub fn field(&self, id: FieldId) -> &DecodedField {
        &self.fields[id.index()]
    }

    pub fn field_count(&self) -> usize {
        self.fields.len() - 1
    }

    /// Every field in emission order.
    pub fn fields(&self) -> impl Iterator<Item = &DecodedField> + '_ {
        self.order.iter().map(|id| self.field(*id))
    }

    /// Top-level fields of one decoded protocol, in order.
    pub fn proto_fields(&self, proto_ord: usize) -> ChildFields<'_> {
        let first = self
            .protos
            .get(proto_ord)
            .map(|p| p.first_field)
            .unwrap_or(FieldId::NONE);
        ChildFields { packet: self, next: first }
    }

    pub fn children(&self, id: FieldId) -> ChildFields<'_> {
        ChildFields {
            packet: self,
            next: self.field(id).first_child,
        }
    }

    /// The most recently decoded field with this name, optionally
    /// restricted to one protocol's fields.
    pub fn find_latest(&self, name: &str, proto_ord: Option<usize>) -> Option<&DecodedField> {
        self.order.iter().rev().map(|id| self.field(*id)).find(|f| {
            f.name == name && proto_ord.map(|p| f.proto == p).unwrap_or(true)
        })
    }

    pub(crate) fn push_proto(&mut self, proto: DecodedProto) -> usize {
        self.protos.push(proto);
        self.protos.len() - 1
    }

    pub(crate) fn proto_mut(&mut self, ord: usize) -> &mut DecodedProto {
        &mut self.protos[ord]
    }

    pub(crate) fn last_emitted_mut(&mut self) -> Option<&mut DecodedField> {
        let id = *self.order.last()?;
        Some(&mut self.fields[id.index()])
    }

    /// Append a field under `parent` (or at the top level of its proto
    /// when `parent` is none) and thread the sibling links.
    pub(crate) fn push_field(&mut self, parent: FieldId, mut field: DecodedField) -> FieldId {
        let id = FieldId(self.fields.len() as u32);
        field.parent = parent;

        if parent.is_some() {
            let prev = {
                let mut cursor = self.fields[parent.index()].first_child;
                let mut last = FieldId::NONE;
                while cursor.is_some() {
                    last = cursor;
                    cursor = self.fields[cursor.index()].next_sibling;
                }
                last
            };
            if prev.is_none() {
                self.fields[parent.index()].first_child = id;
            } else {
                self.fields[prev.index()].next_sibling = id;
                field.prev_sibling = prev;
            }
        } else if let Some(proto) = self.protos.get_mut(field.proto) {
            if proto.first_field.is_none() {
                proto.first_field = id;
            } else {
                let prev = proto.last_field;
                self.fields[prev.index()].next_sibling = id;
                field.prev_sibling = prev;
            }
            proto.last_field = id;
        }

        self.fields.push(field);
        self.order.push(id);
        id
    }
}

pub struct ChildFields<'a> {
    packet: &'a DecodedPacket,
    next: FieldId,
}

impl<'a> Iterator for ChildFields<'a> {
    type Item = (FieldId, &'a DecodedField);

    fn next(&mut self) -> Option<Self::Item> {
        if self.next.is_none() {
            return None;
        }
        let id = self.next;
        let field = self.packet.field(id);
        self.next = field.next_sibling;
        Some((id, field))
    }
}
