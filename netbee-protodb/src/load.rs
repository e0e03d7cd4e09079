//! Streaming pass: one node per element, linked as encountered.

use std::collections::HashMap;
use std::path::Path;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::{debug, warn};

use netbee_expr::{ColumnKind, ExpectedKind, Expr, ExprKind, Pattern, SymbolScope, VariableKind};

use crate::attrs::{decode_escapes, parse_number, Attrs};
use crate::db::{DatabaseInfo, LoadFlags, ProtocolDatabase, MAX_NESTING_LEVELS, SUPPORTED_NETPDL_MAJOR, SUPPORTED_NETPDL_MINOR};
use crate::node::{
    Asn1Encoding, CaseValue, Column, EntryPolicy, ExecEvent, FieldBase, FieldVariant, Links,
    LoopCtrlKind, LoopKind, MissingPolicy, Node, NodeData, NodeId, PacketHdrItem, PartialPolicy,
    Portion, ShowMode, TableAction, Terminator, Validity,
};
use crate::{organize, LoadError};

/// Load and organize a database from a file on disk.
pub fn load_file(path: impl AsRef<Path>, flags: LoadFlags) -> Result<ProtocolDatabase, LoadError> {
    let bytes = std::fs::read(path)?;
    load_bytes(&bytes, flags)
}

/// Load and organize a database held in memory.
pub fn load_xml(xml: &str, flags: LoadFlags) -> Result<ProtocolDatabase, LoadError> {
    load_bytes(xml.as_bytes(), flags)
}

fn load_bytes(bytes: &[u8], flags: LoadFlags) -> Result<ProtocolDatabase, LoadError> {
    let mut loader = Loader::new(flags);
    loader.run(bytes)?;
    let db = organize::organize(loader)?;
    debug!(
        nodes = db.node_count(),
        protocols = db.proto_count(),
        "protocol database loaded"
    );
    Ok(db)
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum FieldClass {
    Simple,
    Complex,
    /// Subfields accept both families.
    Any,
}

pub(crate) struct TableShape {
    pub keys: Vec<(String, ColumnKind)>,
    pub data: Vec<(String, ColumnKind)>,
    pub dynamic: bool,
}

pub(crate) struct Loader {
    pub(crate) flags: LoadFlags,
    pub(crate) nodes: Vec<Node>,
    pub(crate) info: DatabaseInfo,
    /// Open elements, innermost last.
    pub(crate) stack: Vec<NodeId>,
    /// Most recent child of each open element, for sibling linking.
    pub(crate) last_child: Vec<NodeId>,
    pub(crate) aliases: HashMap<String, String>,
    pub(crate) variables: HashMap<String, VariableKind>,
    pub(crate) tables: HashMap<String, TableShape>,
    /// Name of the protocol being read, for local ADT scoping.
    pub(crate) current_proto: Option<String>,
    /// Open-element count of a subtree being skipped (minimal mode).
    pub(crate) skipping: Option<u32>,
    pub(crate) seen_root: bool,
    pub(crate) line: u32,
    pub(crate) scanned: usize,
}

impl Loader {
    fn new(flags: LoadFlags) -> Self {
        let sentinel = Node {
            links: Links::default(),
            call_handler: None,
            line: 0,
            data: NodeData::Sentinel,
        };
        Loader {
            flags,
            nodes: vec![sentinel],
            info: DatabaseInfo::default(),
            stack: Vec::new(),
            last_child: Vec::new(),
            aliases: HashMap::new(),
            variables: HashMap::new(),
            tables: HashMap::new(),
            current_proto: None,
            skipping: None,
            seen_root: false,
            line: 1,
            scanned: 0,
        }
    }

    fn run(&mut self, bytes: &[u8]) -> Result<(), LoadError> {
        let mut reader = Reader::from_reader(bytes);
        reader.trim_text(true);
        let mut buf = Vec::new();

        loop {
            match reader.read_event_into(&mut buf) {
                Err(e) => {
                    self.track_line(bytes, reader.buffer_position());
                    return Err(LoadError::XmlSyntax {
                        line: self.line,
                        reason: e.to_string(),
                    });
                }
                Ok(Event::Eof) => break,
                Ok(Event::Start(e)) => {
                    self.track_line(bytes, reader.buffer_position());
                    self.on_start(&reader, &e, false)?;
                }
                Ok(Event::Empty(e)) => {
                    self.track_line(bytes, reader.buffer_position());
                    self.on_start(&reader, &e, true)?;
                }
                Ok(Event::End(_)) => self.on_end(),
                // Character data carries no information in NetPDL.
                Ok(_) => {}
            }
            buf.clear();
        }

        if !self.seen_root {
            return Err(LoadError::Structural {
                element: "netpdl".to_string(),
                line: self.line,
                reason: "document has no <netpdl> root element".to_string(),
            });
        }

        Ok(())
    }

    fn track_line(&mut self, bytes: &[u8], position: usize) {
        let position = position.min(bytes.len());
        if position > self.scanned {
            self.line += bytes[self.scanned..position]
                .iter()
                .filter(|b| **b == b'\n')
                .count() as u32;
            self.scanned = position;
        }
    }

    fn on_start(
        &mut self,
        reader: &Reader<&[u8]>,
        start: &BytesStart<'_>,
        empty: bool,
    ) -> Result<(), LoadError> {
        if let Some(depth) = self.skipping.as_mut() {
            if !empty {
                *depth += 1;
            }
            return Ok(());
        }

        let decoder = reader.decoder();
        let element = decoder
            .decode(start.name().as_ref())
            .map_err(|e| LoadError::XmlSyntax {
                line: self.line,
                reason: e.to_string(),
            })?
            .into_owned();

        let mut map = HashMap::new();
        for attr in start.attributes() {
            let attr = attr.map_err(|e| LoadError::XmlSyntax {
                line: self.line,
                reason: e.to_string(),
            })?;
            let key = decoder
                .decode(attr.key.as_ref())
                .map_err(|e| LoadError::XmlSyntax {
                    line: self.line,
                    reason: e.to_string(),
                })?
                .into_owned();
            let value = attr
                .decode_and_unescape_value(reader)
                .map_err(|e| LoadError::XmlSyntax {
                    line: self.line,
                    reason: e.to_string(),
                })?
                .into_owned();
            map.insert(key, value);
        }

        let attrs = Attrs::new(element, self.line, map);

        // Visualization subtrees are not materialized in a minimal load.
        if self.flags.minimal && is_visualization(&attrs.element) {
            if !empty {
                self.skipping = Some(1);
            }
            return Ok(());
        }

        if self.stack.len() >= MAX_NESTING_LEVELS {
            return Err(LoadError::Structural {
                element: attrs.element,
                line: self.line,
                reason: format!("elements nested deeper than {MAX_NESTING_LEVELS} levels"),
            });
        }

        if self.stack.is_empty() {
            if attrs.element != "netpdl" {
                return Err(LoadError::Structural {
                    element: attrs.element.clone(),
                    line: self.line,
                    reason: "root element must be <netpdl>".to_string(),
                });
            }
            if self.seen_root {
                return Err(LoadError::Structural {
                    element: attrs.element.clone(),
                    line: self.line,
                    reason: "multiple root elements".to_string(),
                });
            }
        } else {
            self.check_nesting(&attrs)?;
        }

        let call_handler = attrs.call_handler()?;
        let data = self.build(&attrs)?;

        let id = self.push_node(Node {
            links: Links::default(),
            call_handler,
            line: self.line,
            data,
        });

        self.after_push(&attrs, id)?;

        if !empty {
            self.stack.push(id);
            self.last_child.push(NodeId::NONE);
        } else {
            self.after_close(id);
        }

        Ok(())
    }

    fn on_end(&mut self) {
        if let Some(depth) = self.skipping.as_mut() {
            *depth -= 1;
            if *depth == 0 {
                self.skipping = None;
            }
            return;
        }

        if let Some(id) = self.stack.pop() {
            self.last_child.pop();
            self.after_close(id);
        }
    }

    /// Element-specific bookkeeping once the subtree is complete.
    fn after_close(&mut self, id: NodeId) {
        if matches!(self.nodes[id.index()].data, NodeData::Proto { .. }) {
            self.current_proto = None;
        }
    }

    fn push_node(&mut self, mut node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);

        if let (Some(&parent), Some(last)) = (self.stack.last(), self.last_child.last_mut()) {
            node.links.parent = parent;
            let prev = *last;
            *last = id;
            if prev.is_none() {
                self.nodes[parent.index()].links.first_child = id;
            } else {
                self.nodes[prev.index()].links.next_sibling = id;
                node.links.prev_sibling = prev;
            }
        }

        self.nodes.push(node);
        id
    }

    /// Structural-schema check: is this child legal under its parent?
    /// Violations are hard failures under VALIDATE, warnings otherwise.
    fn check_nesting(&self, attrs: &Attrs) -> Result<(), LoadError> {
        let parent = self.stack.last().map(|id| self.nodes[id.index()].data.tag());
        let parent = match parent {
            Some(tag) => tag,
            None => return Ok(()),
        };

        if child_allowed(parent, &attrs.element) {
            return Ok(());
        }

        if self.flags.validate {
            return Err(LoadError::SchemaViolation {
                element: attrs.element.clone(),
                line: attrs.line,
                reason: format!("not allowed inside <{parent}>"),
            });
        }

        warn!(
            element = %attrs.element,
            parent = %parent,
            line = attrs.line,
            "element in unexpected position"
        );
        Ok(())
    }

    // ----- expression helpers -------------------------------------------

    fn parse_expr(
        &self,
        attrs: &Attrs,
        text: &str,
        expected: ExpectedKind,
    ) -> Result<Expr, LoadError> {
        netbee_expr::parse(text, expected, self).map_err(|source| LoadError::Expr {
            element: attrs.element.clone(),
            line: attrs.line,
            source,
        })
    }

    fn expr_attr(
        &self,
        attrs: &Attrs,
        name: &str,
        expected: ExpectedKind,
    ) -> Result<Expr, LoadError> {
        let text = attrs.required(name)?;
        self.parse_expr(attrs, text, expected)
    }

    fn opt_expr_attr(
        &self,
        attrs: &Attrs,
        name: &str,
        expected: ExpectedKind,
    ) -> Result<Option<Expr>, LoadError> {
        match attrs.get(name) {
            None => Ok(None),
            Some(text) => {
                let text = text.to_owned();
                Ok(Some(self.parse_expr(attrs, &text, expected)?))
            }
        }
    }

    /// Conditions accept both number and boolean kinds.
    fn condition_attr(&self, attrs: &Attrs, name: &str) -> Result<Expr, LoadError> {
        let expr = self.expr_attr(attrs, name, ExpectedKind::Any)?;
        match expr.kind() {
            ExprKind::Number | ExprKind::Boolean => Ok(expr),
            found => Err(LoadError::Expr {
                element: attrs.element.clone(),
                line: attrs.line,
                source: netbee_expr::ExprError::TypeMismatch {
                    expected: ExpectedKind::BooleanOnly,
                    found,
                },
            }),
        }
    }

    fn opt_condition_attr(&self, attrs: &Attrs, name: &str) -> Result<Option<Expr>, LoadError> {
        if attrs.get(name).is_none() {
            return Ok(None);
        }
        Ok(Some(self.condition_attr(attrs, name)?))
    }

    fn pattern_attr(&self, attrs: &Attrs, name: &str) -> Result<Pattern, LoadError> {
        let text = attrs.required(name)?;
        Pattern::compile(text, true).map_err(|source| LoadError::Expr {
            element: attrs.element.clone(),
            line: attrs.line,
            source,
        })
    }

    fn structural(&self, attrs: &Attrs, reason: impl Into<String>) -> LoadError {
        LoadError::Structural {
            element: attrs.element.clone(),
            line: attrs.line,
            reason: reason.into(),
        }
    }

    // ----- element dispatch ---------------------------------------------

    fn build(&mut self, attrs: &Attrs) -> Result<NodeData, LoadError> {
        match attrs.element.as_str() {
            "netpdl" => self.build_root(attrs),
            "proto" => self.build_proto(attrs),
            "format" => Ok(NodeData::Format),
            "fields" => Ok(NodeData::Fields),
            "encapsulation" => Ok(NodeData::Encapsulation),
            "execute-code" => Ok(NodeData::ExecuteCode),
            "init" => self.build_exec_section(attrs, ExecEvent::Init),
            "verify" => self.build_exec_section(attrs, ExecEvent::Verify),
            "before" => self.build_exec_section(attrs, ExecEvent::Before),
            "after" => self.build_exec_section(attrs, ExecEvent::After),
            "variable" => self.build_variable(attrs),
            "lookuptable" => self.build_lookuptable(attrs),
            "key" => self.build_column(attrs, true),
            "data" => self.build_column(attrs, false),
            "alias" => self.build_alias(attrs),
            "assign-variable" => self.build_assign_variable(attrs),
            "assign-lookuptable" => self.build_assign_lookuptable(attrs),
            "update-lookuptable" => self.build_update_lookuptable(attrs),
            "lookupkey" => {
                let value = self.expr_attr(attrs, "value", ExpectedKind::Any)?;
                let mask = attrs.bytes("mask")?;
                Ok(NodeData::LookupKey { value, mask })
            }
            "lookupdata" => {
                let value = self.expr_attr(attrs, "value", ExpectedKind::Any)?;
                Ok(NodeData::LookupData { value })
            }
            "showtemplate" => self.build_showtemplate(attrs),
            "showdtl" => Ok(NodeData::ShowDtl),
            "showmap" => Ok(NodeData::ShowMap),
            "showsumtemplate" => Ok(NodeData::ShowSumTemplate {
                name: attrs.required("name")?.to_string(),
            }),
            "showsumstruct" => Ok(NodeData::ShowSumStructure),
            "sumsection" => {
                let name = attrs.required("name")?.to_string();
                let longname = attrs.get("longname").unwrap_or(&name).to_string();
                Ok(NodeData::SumSection { name, longname })
            }
            "if" => {
                let expr = self.condition_attr(attrs, "expr")?;
                Ok(NodeData::If {
                    expr,
                    true_branch: NodeId::NONE,
                    false_branch: NodeId::NONE,
                    missing_branch: NodeId::NONE,
                })
            }
            "if-true" => Ok(NodeData::IfTrue),
            "if-false" => Ok(NodeData::IfFalse),
            "missing-packetdata" => Ok(NodeData::MissingPacketData),
            "switch" => self.build_switch(attrs),
            "case" => self.build_case(attrs),
            "default" => Ok(NodeData::DefaultCase {
                show: attrs.get("show").map(str::to_string),
            }),
            "loop" => self.build_loop(attrs),
            "loopctrl" => {
                let kind = match attrs.required("type")? {
                    "break" => LoopCtrlKind::Break,
                    "continue" => LoopCtrlKind::Continue,
                    other => {
                        return Err(self.structural(attrs, format!("unknown loopctrl type '{other}'")))
                    }
                };
                Ok(NodeData::LoopCtrl { kind })
            }
            "includeblk" => Ok(NodeData::IncludeBlk {
                name: attrs.required("name")?.to_string(),
                link: NodeId::NONE,
            }),
            "block" => {
                let name = attrs.required("name")?.to_string();
                let longname = attrs.get("longname").unwrap_or(&name).to_string();
                Ok(NodeData::Block {
                    name,
                    longname,
                    show_sum_template: attrs.get("showsumtemplate").map(str::to_string),
                    show_sum_template_link: NodeId::NONE,
                })
            }
            "field" => self.build_field(attrs, false),
            "cfield" => self.build_field(attrs, true),
            "subfield" => self.build_subfield(attrs),
            "fieldmatch" => {
                let expr = self.condition_attr(attrs, "match")?;
                Ok(NodeData::Fieldmatch {
                    expr,
                    recurring: attrs.flag("recurring", false)?,
                    next_match: NodeId::NONE,
                    base_adt: attrs.get("baseadt").map(str::to_string),
                })
            }
            "adtfield" => Ok(NodeData::Adtfield {
                adt_name: attrs.required("adttype")?.to_string(),
                name: attrs.get("name").map(str::to_string),
                longname: attrs.get("longname").map(str::to_string),
                show_template: attrs.get("showtemplate").map(str::to_string),
            }),
            "replace" => Ok(NodeData::Replace {
                name_ref: attrs.required("nameref")?.to_string(),
                name: attrs.get("name").map(str::to_string),
                longname: attrs.get("longname").map(str::to_string),
                show_template: attrs.get("showtemplate").map(str::to_string),
            }),
            "adt" => Ok(NodeData::Adt {
                name: attrs.required("name")?.to_string(),
                proto_scope: self.current_proto.clone(),
            }),
            "set" => Ok(NodeData::Set {
                field_to_repeat: NodeId::NONE,
                first_match: NodeId::NONE,
                exit_when: NodeId::NONE,
                default_item: NodeId::NONE,
                missing_branch: NodeId::NONE,
            }),
            "choice" => Ok(NodeData::Choice {
                first_match: NodeId::NONE,
                exit_when: NodeId::NONE,
                default_item: NodeId::NONE,
                missing_branch: NodeId::NONE,
            }),
            "exit-when" => Ok(NodeData::ExitWhen {
                expr: self.condition_attr(attrs, "expr")?,
            }),
            "default-item" => Ok(NodeData::DefaultItem {
                base_adt: attrs.get("baseadt").map(str::to_string),
            }),
            "map" => Ok(NodeData::Map),
            "xmlpi" => Ok(NodeData::MapXmlPi {
                name: attrs.required("name")?.to_string(),
            }),
            "xmldoctype" => Ok(NodeData::MapXmlDoctype {
                name: attrs.required("name")?.to_string(),
            }),
            "xmlelement" => Ok(NodeData::MapXmlElement {
                name: attrs.required("name")?.to_string(),
                namespace: attrs.get("ns").map(str::to_string),
                hierarchy: attrs.get("hierarchy").map(str::to_string),
            }),
            "nextproto" => Ok(NodeData::NextProto {
                proto: self.expr_attr(attrs, "proto", ExpectedKind::NumberOnly)?,
                preferred: attrs.flag("preferred", false)?,
            }),
            "protofield" => Ok(NodeData::ShowCodeProtoField {
                field: attrs.required("name")?.to_string(),
                header: attrs.flag("header", false)?,
            }),
            "protohdr" => Ok(NodeData::ShowCodeProtoHdr),
            "packethdr" => {
                let item = match attrs.required("value")? {
                    "num" => PacketHdrItem::Number,
                    "timestamp" => PacketHdrItem::Timestamp,
                    "length" => PacketHdrItem::Length,
                    "caplength" => PacketHdrItem::CapturedLength,
                    other => {
                        return Err(
                            self.structural(attrs, format!("unknown packethdr item '{other}'"))
                        )
                    }
                };
                Ok(NodeData::ShowCodePacketHdr { item })
            }
            "text" => Ok(NodeData::ShowCodeText {
                value: attrs.get("value").unwrap_or_default().to_string(),
                when: self.opt_condition_attr(attrs, "when")?,
                expr: self.opt_expr_attr(attrs, "expr", ExpectedKind::Any)?,
            }),
            "section" => Ok(NodeData::ShowCodeSection {
                name: attrs.required("name")?.to_string(),
            }),
            other => Err(LoadError::Structural {
                element: other.to_string(),
                line: attrs.line,
                reason: "element not recognized by the NetPDL grammar".to_string(),
            }),
        }
    }

    /// Post-allocation bookkeeping that needs the node id or mutates the
    /// loader side indices.
    fn after_push(&mut self, attrs: &Attrs, id: NodeId) -> Result<(), LoadError> {
        match &self.nodes[id.index()].data {
            NodeData::Proto { name, .. } => {
                self.current_proto = Some(name.clone());
            }
            NodeData::Variable { name, kind, .. } => {
                let (name, kind) = (name.clone(), *kind);
                if self.variables.insert(name.clone(), kind).is_some() {
                    return Err(self.structural(attrs, format!("duplicate variable '{name}'")));
                }
            }
            NodeData::LookupTable { name, dynamic_entries, .. } => {
                let (name, dynamic) = (name.clone(), *dynamic_entries);
                let prior = self.tables.insert(
                    name.clone(),
                    TableShape {
                        keys: Vec::new(),
                        data: Vec::new(),
                        dynamic,
                    },
                );
                if prior.is_some() {
                    return Err(self.structural(attrs, format!("duplicate lookup table '{name}'")));
                }
            }
            NodeData::Alias { name, value } => {
                let (name, value) = (name.clone(), value.clone());
                if self.aliases.insert(name.clone(), value).is_some() {
                    return Err(self.structural(attrs, format!("duplicate alias '{name}'")));
                }
            }
            NodeData::KeyColumn(column) => {
                let column = column.clone();
                self.attach_column(attrs, id, column, true)?;
            }
            NodeData::DataColumn(column) => {
                let column = column.clone();
                self.attach_column(attrs, id, column, false)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn attach_column(
        &mut self,
        attrs: &Attrs,
        id: NodeId,
        column: Column,
        is_key: bool,
    ) -> Result<(), LoadError> {
        let parent = self.nodes[id.index()].links.parent;
        let table_name = match &mut self.nodes[parent.index()].data {
            NodeData::LookupTable { name, keys, data, .. } => {
                let list = if is_key { keys } else { data };
                if list.iter().any(|c| c.name == column.name) {
                    return Err(LoadError::Structural {
                        element: attrs.element.clone(),
                        line: attrs.line,
                        reason: format!("duplicate column '{}'", column.name),
                    });
                }
                list.push(column.clone());
                name.clone()
            }
            _ => {
                return Err(self.structural(attrs, "key/data only belong inside <lookuptable>"));
            }
        };

        let shape = self
            .tables
            .get_mut(&table_name)
            .expect("table registered before its columns");
        let list = if is_key { &mut shape.keys } else { &mut shape.data };
        list.push((column.name, column.kind));
        Ok(())
    }

    // ----- per-element builders -----------------------------------------

    fn build_root(&mut self, attrs: &Attrs) -> Result<NodeData, LoadError> {
        let name = attrs.get("name").unwrap_or_default().to_string();
        let version = attrs.required("version")?;

        let (major, minor) = version
            .split_once('.')
            .and_then(|(maj, min)| Some((maj.parse().ok()?, min.parse().ok()?)))
            .ok_or_else(|| self.structural(attrs, format!("malformed version '{version}'")))?;

        if (major, minor) != (SUPPORTED_NETPDL_MAJOR, SUPPORTED_NETPDL_MINOR) {
            return Err(LoadError::VersionMismatch {
                found_major: major,
                found_minor: minor,
            });
        }

        let creator = attrs.get("creator").unwrap_or_default().to_string();
        let date = attrs.get("date").unwrap_or_default().to_string();

        self.info = DatabaseInfo {
            name: name.clone(),
            creator: creator.clone(),
            date: date.clone(),
            version_major: major,
            version_minor: minor,
        };
        self.seen_root = true;

        Ok(NodeData::Root {
            name,
            version_major: major,
            version_minor: minor,
            creator,
            date,
        })
    }

    fn build_proto(&mut self, attrs: &Attrs) -> Result<NodeData, LoadError> {
        let name = attrs.required("name")?.to_string();
        let longname = attrs.get("longname").unwrap_or(&name).to_string();
        Ok(NodeData::Proto {
            name,
            longname,
            format: NodeId::NONE,
            first_field: NodeId::NONE,
            encapsulation: NodeId::NONE,
            init: Vec::new(),
            verify: Vec::new(),
            before: Vec::new(),
            after: Vec::new(),
            show_sum_template: attrs.get("showsumtemplate").map(str::to_string),
            show_sum_template_link: NodeId::NONE,
        })
    }

    fn build_exec_section(&self, attrs: &Attrs, event: ExecEvent) -> Result<NodeData, LoadError> {
        Ok(NodeData::ExecuteSection {
            event,
            when: self.opt_condition_attr(attrs, "when")?,
        })
    }

    fn build_variable(&self, attrs: &Attrs) -> Result<NodeData, LoadError> {
        let name = attrs.required("name")?.trim_start_matches('$').to_string();
        let kind = match attrs.required("type")? {
            "number" => VariableKind::Number,
            "buffer" => VariableKind::Buffer,
            "refbuffer" => VariableKind::RefBuffer,
            "protocol" => VariableKind::Protocol,
            other => return Err(self.structural(attrs, format!("unknown variable type '{other}'"))),
        };
        let validity = match attrs.required("validity")? {
            "static" => Validity::Static,
            "thispacket" => Validity::ThisPacket,
            other => {
                return Err(self.structural(attrs, format!("unknown validity '{other}'")))
            }
        };

        // A refbuffer aliases the packet being decoded, so it cannot
        // outlive it.
        if kind == VariableKind::RefBuffer && validity == Validity::Static {
            return Err(self.structural(attrs, "refbuffer variables must be 'thispacket'"));
        }

        let size = match kind {
            VariableKind::Buffer => attrs.positive_number("size")?,
            _ => attrs.number("size")?.unwrap_or(0),
        };

        let (init_number, init_bytes) = match kind {
            VariableKind::Number | VariableKind::Protocol => (
                match attrs.get("value") {
                    None => None,
                    Some(text) => Some(parse_number(text).ok_or_else(|| {
                        self.structural(
                            attrs,
                            format!("initializer '{text}' is not a number"),
                        )
                    })?),
                },
                None,
            ),
            VariableKind::Buffer => (None, attrs.bytes("value")?),
            VariableKind::RefBuffer => {
                if attrs.get("value").is_some() {
                    return Err(
                        self.structural(attrs, "refbuffer variables cannot have an initializer")
                    );
                }
                (None, None)
            }
        };

        Ok(NodeData::Variable {
            name,
            kind,
            validity,
            size,
            init_number,
            init_bytes,
        })
    }

    fn build_lookuptable(&self, attrs: &Attrs) -> Result<NodeData, LoadError> {
        let name = attrs.required("name")?.to_string();
        let dynamic_entries = match attrs.required("validity")? {
            "static" => false,
            "dynamic" => true,
            other => return Err(self.structural(attrs, format!("unknown validity '{other}'"))),
        };
        Ok(NodeData::LookupTable {
            name,
            exact_entries: attrs.number("exactentries")?.unwrap_or(100),
            mask_entries: attrs.number("maskentries")?.unwrap_or(0),
            dynamic_entries,
            keys: Vec::new(),
            data: Vec::new(),
        })
    }

    fn build_column(&self, attrs: &Attrs, is_key: bool) -> Result<NodeData, LoadError> {
        let name = attrs.required("name")?.to_string();

        // Two data columns are maintained by the engine itself.
        if name == "timestamp" || name == "lifetime" {
            return Err(self.structural(attrs, format!("column name '{name}' is reserved")));
        }

        let kind = match attrs.required("type")? {
            "number" => ColumnKind::Number,
            "buffer" => ColumnKind::Buffer,
            "protocol" => ColumnKind::Protocol,
            other => return Err(self.structural(attrs, format!("unknown column type '{other}'"))),
        };
        let size = match kind {
            ColumnKind::Buffer => attrs.positive_number("size")?,
            _ => attrs.number("size")?.unwrap_or(4),
        };

        let column = Column { name, kind, size };
        Ok(if is_key {
            NodeData::KeyColumn(column)
        } else {
            NodeData::DataColumn(column)
        })
    }

    fn build_alias(&self, attrs: &Attrs) -> Result<NodeData, LoadError> {
        Ok(NodeData::Alias {
            name: attrs.required("name")?.to_string(),
            value: attrs.required("value")?.to_string(),
        })
    }

    /// `name="$var"` or `name="$var[start:size]"`, numeric bounds.
    fn split_storage_ref<'n>(
        &self,
        attrs: &Attrs,
        name: &'n str,
    ) -> Result<(&'n str, u32, u32), LoadError> {
        match name.split_once('[') {
            None => Ok((name, 0, 0)),
            Some((base, rest)) => {
                let rest = rest
                    .strip_suffix(']')
                    .ok_or_else(|| self.structural(attrs, format!("malformed slice in '{name}'")))?;
                let (start, size) = rest
                    .split_once(':')
                    .ok_or_else(|| self.structural(attrs, format!("malformed slice in '{name}'")))?;
                let start = parse_number(start)
                    .ok_or_else(|| self.structural(attrs, "slice start is not a number"))?;
                let size = parse_number(size)
                    .ok_or_else(|| self.structural(attrs, "slice size is not a number"))?;
                Ok((base, start, size))
            }
        }
    }

    fn build_assign_variable(&self, attrs: &Attrs) -> Result<NodeData, LoadError> {
        let raw = attrs.required("name")?;
        let raw = raw.strip_prefix('$').unwrap_or(raw);
        let (name, offset_start, offset_size) = self.split_storage_ref(attrs, raw)?;

        let kind = self.variables.get(name).copied().ok_or_else(|| LoadError::Expr {
            element: attrs.element.clone(),
            line: attrs.line,
            source: netbee_expr::ExprError::UnknownName(format!("${name}")),
        })?;

        if offset_size != 0 && kind.expr_kind() != ExprKind::Buffer {
            return Err(self.structural(attrs, "only buffer variables can have offsets"));
        }

        let expected = match kind.expr_kind() {
            ExprKind::Buffer => ExpectedKind::BufferOnly,
            _ => ExpectedKind::NumberOnly,
        };
        let value = self.expr_attr(attrs, "value", expected)?;

        Ok(NodeData::AssignVariable {
            name: name.to_string(),
            offset_start,
            offset_size,
            value,
        })
    }

    fn build_assign_lookuptable(&self, attrs: &Attrs) -> Result<NodeData, LoadError> {
        let raw = attrs.required("name")?;
        let (cell, offset_start, offset_size) = self.split_storage_ref(attrs, raw)?;
        let (table, column) = cell.split_once('.').ok_or_else(|| {
            self.structural(attrs, format!("'{cell}' is not of the form table.column"))
        })?;

        if column == "timestamp" || column == "lifetime" {
            return Err(self.structural(attrs, format!("column '{column}' is maintained by the engine")));
        }

        let kind = self
            .lookup_column_kind(table, column)
            .ok_or_else(|| LoadError::Expr {
                element: attrs.element.clone(),
                line: attrs.line,
                source: netbee_expr::ExprError::UnknownName(format!("{table}.{column}")),
            })?;

        if offset_size != 0 && kind != ColumnKind::Buffer {
            return Err(self.structural(attrs, "only buffer columns can have offsets"));
        }

        let expected = match kind {
            ColumnKind::Buffer => ExpectedKind::BufferOnly,
            _ => ExpectedKind::NumberOnly,
        };
        let value = self.expr_attr(attrs, "value", expected)?;

        Ok(NodeData::AssignLookupTable {
            table: table.to_string(),
            column: column.to_string(),
            offset_start,
            offset_size,
            kind,
            value,
        })
    }

    fn build_update_lookuptable(&self, attrs: &Attrs) -> Result<NodeData, LoadError> {
        let table = attrs.required("name")?.to_string();
        let shape = self
            .tables
            .get(&table)
            .ok_or_else(|| self.structural(attrs, format!("lookup table '{table}' is not declared")))?;

        let action = match attrs.required("action")? {
            "add" => TableAction::Add,
            "purge" => TableAction::Purge,
            "obsolete" => TableAction::Obsolete,
            other => return Err(self.structural(attrs, format!("unknown action '{other}'"))),
        };

        let mut policy = None;
        let mut keep_time = 0;
        let mut hit_time = 0;
        let mut new_hit_time = 0;

        if action == TableAction::Add {
            let validity = match attrs.required("validity")? {
                "keepforever" => EntryPolicy::KeepForever,
                "keepmaxtime" => EntryPolicy::KeepMaxTime,
                "updateonhit" => EntryPolicy::UpdateOnHit,
                "replaceonhit" => EntryPolicy::ReplaceOnHit,
                "addonhit" => EntryPolicy::AddOnHit,
                other => {
                    return Err(self.structural(attrs, format!("unknown validity '{other}'")))
                }
            };

            if validity != EntryPolicy::KeepForever {
                if !shape.dynamic {
                    return Err(self.structural(
                        attrs,
                        format!("table '{table}' does not allow dynamic entries"),
                    ));
                }
                keep_time = attrs.positive_number("keeptime")?;
            }
            if matches!(validity, EntryPolicy::UpdateOnHit | EntryPolicy::AddOnHit) {
                hit_time = attrs.positive_number("hittime")?;
            }
            if matches!(validity, EntryPolicy::ReplaceOnHit | EntryPolicy::AddOnHit) {
                new_hit_time = attrs.positive_number("newhittime")?;
            }

            policy = Some(validity);
        }

        Ok(NodeData::UpdateLookupTable {
            table,
            action,
            policy,
            keep_time,
            hit_time,
            new_hit_time,
        })
    }

    fn build_showtemplate(&self, attrs: &Attrs) -> Result<NodeData, LoadError> {
        let mode = match attrs.required("showtype")? {
            "dec" => ShowMode::Dec,
            "hex" => ShowMode::Hex,
            "bin" => ShowMode::Bin,
            "ascii" => ShowMode::Ascii,
            other => return Err(self.structural(attrs, format!("unknown showtype '{other}'"))),
        };
        Ok(NodeData::ShowTemplate {
            name: attrs.required("name")?.to_string(),
            mode,
            group: attrs.number("showgrp")?.unwrap_or(1),
            separator: attrs.get("showsep").unwrap_or_default().to_string(),
            plugin: attrs.get("showplg").map(str::to_string),
            native_function: attrs.get("shownativefunction").map(str::to_string),
        })
    }

    fn build_switch(&self, attrs: &Attrs) -> Result<NodeData, LoadError> {
        let expr = self.expr_attr(attrs, "expr", ExpectedKind::Any)?;
        let case_sensitive = attrs.flag("casesensitive", true)?;

        match expr.kind() {
            ExprKind::Number | ExprKind::Buffer => {}
            found => {
                return Err(LoadError::Expr {
                    element: attrs.element.clone(),
                    line: attrs.line,
                    source: netbee_expr::ExprError::TypeMismatch {
                        expected: ExpectedKind::NumberOnly,
                        found,
                    },
                })
            }
        }

        // Case folding only makes sense over byte strings.
        if !case_sensitive && expr.kind() != ExprKind::Buffer {
            return Err(self.structural(
                attrs,
                "casesensitive='no' requires a buffer-kinded switch expression",
            ));
        }

        Ok(NodeData::Switch {
            expr,
            case_sensitive,
            first_case: NodeId::NONE,
            default_case: NodeId::NONE,
        })
    }

    fn build_case(&self, attrs: &Attrs) -> Result<NodeData, LoadError> {
        let raw = attrs.required("value")?;
        let value = match parse_number(raw) {
            Some(number) => CaseValue::Number {
                value: number,
                max: attrs.number("maxvalue")?,
            },
            None => {
                if attrs.get("maxvalue").is_some() {
                    return Err(
                        self.structural(attrs, "maxvalue only applies to numeric cases")
                    );
                }
                CaseValue::Bytes(decode_escapes(raw).map_err(|reason| {
                    self.structural(attrs, format!("attribute 'value': {reason}"))
                })?)
            }
        };

        Ok(NodeData::Case {
            value,
            show: attrs.get("show").map(str::to_string),
            next_case: NodeId::NONE,
        })
    }

    fn build_loop(&self, attrs: &Attrs) -> Result<NodeData, LoadError> {
        let kind = match attrs.required("type")? {
            "size" => LoopKind::Size,
            "times2repeat" => LoopKind::TimesToRepeat,
            "while" => LoopKind::While,
            "do-while" => LoopKind::DoWhile,
            other => return Err(self.structural(attrs, format!("unknown loop type '{other}'"))),
        };

        let expr = match kind {
            LoopKind::Size | LoopKind::TimesToRepeat => {
                self.expr_attr(attrs, "expr", ExpectedKind::NumberOnly)?
            }
            LoopKind::While | LoopKind::DoWhile => self.condition_attr(attrs, "expr")?,
        };

        Ok(NodeData::Loop {
            kind,
            expr,
            missing_branch: NodeId::NONE,
        })
    }

    fn field_base(&self, attrs: &Attrs) -> Result<FieldBase, LoadError> {
        let name = attrs.required("name")?.to_string();
        let longname = attrs.get("longname").unwrap_or(&name).to_string();
        Ok(FieldBase {
            name,
            longname,
            network_byte_order: attrs.flag("bigendian", true)?,
            show_template: attrs.get("showtemplate").map(str::to_string),
            show_template_link: NodeId::NONE,
        })
    }

    fn terminator(
        &self,
        attrs: &Attrs,
        token_attr: &str,
        regex_attr: &str,
    ) -> Result<Terminator, LoadError> {
        match (attrs.get(token_attr), attrs.get(regex_attr)) {
            (Some(_), Some(_)) => Err(self.structural(
                attrs,
                format!("'{token_attr}' and '{regex_attr}' are mutually exclusive"),
            )),
            (Some(_), None) => Ok(Terminator::Token(
                attrs.bytes(token_attr)?.unwrap_or_default(),
            )),
            (None, Some(_)) => Ok(Terminator::Regex(self.pattern_attr(attrs, regex_attr)?)),
            (None, None) => Err(self.structural(
                attrs,
                format!("one of '{token_attr}' or '{regex_attr}' is required"),
            )),
        }
    }

    fn missing_policy(&self, attrs: &Attrs, name: &str) -> Result<MissingPolicy, LoadError> {
        match attrs.get(name) {
            None | Some("continue") => Ok(MissingPolicy::ContinueDecoding),
            Some("skipfield") => Ok(MissingPolicy::SkipField),
            Some(other) => Err(self.structural(attrs, format!("unknown policy '{other}'"))),
        }
    }

    fn field_variant(&self, attrs: &Attrs, class: FieldClass) -> Result<FieldVariant, LoadError> {
        let kind = attrs.required("type")?;
        let simple = class != FieldClass::Complex;
        let complex = class != FieldClass::Simple;

        match kind {
            "fixed" if simple => Ok(FieldVariant::Fixed {
                size: attrs.positive_number("size")?,
            }),
            "bit" if simple => Ok(FieldVariant::Bit {
                mask: attrs.required_number("mask")?,
                size: attrs.positive_number("size")?,
                last_of_group: false,
            }),
            "variable" if simple => Ok(FieldVariant::Variable {
                size: self.expr_attr(attrs, "size", ExpectedKind::NumberOnly)?,
            }),
            "tokenended" if simple => Ok(FieldVariant::TokenEnded {
                end: self.terminator(attrs, "endtoken", "endregex")?,
                end_offset: self.opt_expr_attr(attrs, "endoffset", ExpectedKind::NumberOnly)?,
                end_discard: self.opt_expr_attr(attrs, "enddiscard", ExpectedKind::NumberOnly)?,
            }),
            "tokenwrapped" if simple => Ok(FieldVariant::TokenWrapped {
                begin: self.terminator(attrs, "begintoken", "beginregex")?,
                end: self.terminator(attrs, "endtoken", "endregex")?,
                begin_offset: self.opt_expr_attr(attrs, "beginoffset", ExpectedKind::NumberOnly)?,
                end_offset: self.opt_expr_attr(attrs, "endoffset", ExpectedKind::NumberOnly)?,
                end_discard: self.opt_expr_attr(attrs, "enddiscard", ExpectedKind::NumberOnly)?,
                on_missing_begin: self.missing_policy(attrs, "onmissingbegin")?,
                on_missing_end: self.missing_policy(attrs, "onmissingend")?,
            }),
            // Simple and complex 'line' decode the same way; the complex
            // form's encoding attribute is accepted as ASCII.
            "line" => Ok(FieldVariant::Line),
            "pattern" if simple => Ok(FieldVariant::Pattern {
                pattern: self.pattern_attr(attrs, "pattern")?,
                on_partial: match attrs.get("onpartialdecoding") {
                    None | Some("continue") => PartialPolicy::ContinueDecoding,
                    Some("skipfield") => PartialPolicy::SkipField,
                    Some(other) => {
                        return Err(self.structural(attrs, format!("unknown policy '{other}'")))
                    }
                },
            }),
            "eatall" if simple => Ok(FieldVariant::Eatall),
            "padding" if simple => Ok(FieldVariant::Padding {
                align: attrs.positive_number("align")?,
            }),
            "plugin" if simple => Ok(FieldVariant::Plugin {
                plugin: attrs.required("plugin")?.to_string(),
            }),
            "tlv" if complex => Ok(FieldVariant::Tlv {
                type_size: attrs.positive_number("tsize")?,
                length_size: attrs.positive_number("lsize")?,
                value_expr: self.opt_expr_attr(attrs, "valueexpr", ExpectedKind::NumberOnly)?,
                type_link: NodeId::NONE,
                length_link: NodeId::NONE,
                value_link: NodeId::NONE,
            }),
            "delimited" if complex => {
                let begin = match attrs.get("beginregex") {
                    None => None,
                    Some(_) => Some(self.pattern_attr(attrs, "beginregex")?),
                };
                Ok(FieldVariant::Delimited {
                    begin,
                    end: self.pattern_attr(attrs, "endregex")?,
                    on_missing_begin: self.missing_policy(attrs, "onmissingbegin")?,
                    on_missing_end: self.missing_policy(attrs, "onmissingend")?,
                })
            }
            "hdrline" if complex => Ok(FieldVariant::Hdrline {
                separator: self.pattern_attr(attrs, "separator")?,
                name_link: NodeId::NONE,
                value_link: NodeId::NONE,
            }),
            "dynamic" if complex => {
                let pattern = self.pattern_attr(attrs, "pattern")?;
                let captures = pattern
                    .regex()
                    .capture_names()
                    .flatten()
                    .map(|name| (name.to_string(), NodeId::NONE))
                    .collect();
                Ok(FieldVariant::Dynamic { pattern, captures })
            }
            "asn1" if complex => Ok(FieldVariant::Asn1 {
                encoding: match attrs.required("encoding")? {
                    "ber" => Asn1Encoding::Ber,
                    "der" => Asn1Encoding::Der,
                    "cer" => Asn1Encoding::Cer,
                    other => {
                        return Err(
                            self.structural(attrs, format!("unknown ASN.1 encoding '{other}'"))
                        )
                    }
                },
            }),
            "xml" if complex => Ok(FieldVariant::Xml {
                size: self.opt_expr_attr(attrs, "size", ExpectedKind::NumberOnly)?,
            }),
            other => Err(self.structural(attrs, format!("unknown field type '{other}'"))),
        }
    }

    fn build_field(&self, attrs: &Attrs, complex: bool) -> Result<NodeData, LoadError> {
        let class = if complex {
            FieldClass::Complex
        } else {
            FieldClass::Simple
        };
        Ok(NodeData::Field {
            base: self.field_base(attrs)?,
            variant: self.field_variant(attrs, class)?,
            base_adt: attrs.get("baseadt").map(str::to_string),
        })
    }

    fn build_subfield(&self, attrs: &Attrs) -> Result<NodeData, LoadError> {
        let portion = match attrs.required("portion")? {
            "tlv-type" => Portion::TlvType,
            "tlv-length" => Portion::TlvLength,
            "tlv-value" => Portion::TlvValue,
            "hname" => Portion::HdrlineName,
            "hvalue" => Portion::HdrlineValue,
            other => Portion::Dynamic(other.to_string()),
        };

        // Subfields may describe their portion with a full field variant
        // (a TLV value that is itself a header line, say); without one
        // they emit the portion bytes as-is.
        let variant = if attrs.get("type").is_some() {
            self.field_variant(attrs, FieldClass::Any)?
        } else {
            FieldVariant::Eatall
        };

        Ok(NodeData::Subfield {
            portion,
            base: self.field_base(attrs)?,
            variant,
            base_adt: attrs.get("baseadt").map(str::to_string),
        })
    }
}

impl SymbolScope for Loader {
    fn alias(&self, name: &str) -> Option<&str> {
        self.aliases.get(name).map(String::as_str)
    }

    fn variable_kind(&self, name: &str) -> Option<VariableKind> {
        self.variables.get(name).copied()
    }

    fn is_lookup_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    fn lookup_column_kind(&self, table: &str, column: &str) -> Option<ColumnKind> {
        let shape = self.tables.get(table)?;
        // The engine-maintained columns read as numbers.
        if column == "timestamp" || column == "lifetime" {
            return Some(ColumnKind::Number);
        }
        shape
            .keys
            .iter()
            .chain(&shape.data)
            .find(|(name, _)| name == column)
            .map(|(_, kind)| *kind)
    }

    fn lookup_key_count(&self, table: &str) -> Option<usize> {
        self.tables.get(table).map(|shape| shape.keys.len())
    }
}

fn is_visualization(element: &str) -> bool {
    matches!(
        element,
        "showtemplate" | "showsumtemplate" | "showsumstruct" | "showdtl" | "showmap"
    )
}

/// The structural schema: which children each container admits. Only
/// checked for containers with a fixed shape; unknown parents admit
/// anything (their own builders validate the details).
fn child_allowed(parent: &str, child: &str) -> bool {
    let statements = |c: &str| {
        matches!(
            c,
            "assign-variable"
                | "assign-lookuptable"
                | "update-lookuptable"
                | "if"
                | "switch"
                | "loop"
        )
    };
    let fieldish = |c: &str| {
        matches!(
            c,
            "field"
                | "cfield"
                | "adtfield"
                | "block"
                | "includeblk"
                | "if"
                | "switch"
                | "loop"
                | "loopctrl"
                | "set"
                | "choice"
                | "map"
        )
    };

    match parent {
        "netpdl" => matches!(
            child,
            "proto"
                | "variable"
                | "lookuptable"
                | "alias"
                | "adt"
                | "showtemplate"
                | "showsumtemplate"
                | "showsumstruct"
        ),
        "proto" => matches!(child, "format" | "encapsulation" | "execute-code" | "adt"),
        "format" => matches!(child, "fields" | "block"),
        "fields" => fieldish(child),
        "block" => fieldish(child),
        "encapsulation" => matches!(child, "nextproto" | "if" | "switch"),
        "execute-code" => matches!(child, "init" | "verify" | "before" | "after"),
        "init" | "verify" | "before" | "after" => statements(child),
        "lookuptable" => matches!(child, "key" | "data"),
        "update-lookuptable" => matches!(child, "lookupkey" | "lookupdata"),
        "if" => matches!(child, "if-true" | "if-false" | "missing-packetdata"),
        // Branches inside an encapsulation section carry nextproto.
        "if-true" | "if-false" | "missing-packetdata" | "default-item" => {
            fieldish(child) || statements(child) || child == "nextproto"
        }
        "switch" => matches!(child, "case" | "default"),
        "case" | "default" => fieldish(child) || statements(child) || child == "nextproto",
        "loop" => fieldish(child) || child == "missing-packetdata",
        "set" | "choice" => {
            matches!(
                child,
                "fieldmatch" | "exit-when" | "default-item" | "missing-packetdata" | "field"
                    | "cfield"
            )
        }
        "fieldmatch" => fieldish(child),
        "adtfield" => child == "replace",
        "adt" => matches!(child, "field" | "cfield" | "adtfield"),
        "field" | "cfield" | "subfield" => {
            matches!(child, "subfield" | "field" | "cfield" | "switch" | "if" | "map")
        }
        "map" => matches!(child, "xmlpi" | "xmldoctype" | "xmlelement"),
        "showsumstruct" => child == "sumsection",
        "showsumtemplate" => {
            matches!(child, "protofield" | "protohdr" | "packethdr" | "text" | "section")
        }
        "showtemplate" => matches!(child, "showdtl" | "showmap"),
        "showdtl" | "showmap" => matches!(child, "protofield" | "text"),
        "nextproto" => false,
        _ => true,
    }
}
