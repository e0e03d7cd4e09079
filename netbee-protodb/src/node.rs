//! The node model: one arena of typed elements, walkable as a forest.

use netbee_expr::{ColumnKind, Expr, Pattern, VariableKind};

/// Index of a node inside the database arena. Index 0 is reserved as the
/// "no node" sentinel; the arena keeps a placeholder there.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    pub const NONE: NodeId = NodeId(0);

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

/// Bookkeeping edges shared by every node.
#[derive(Debug, Clone, Default)]
pub struct Links {
    pub parent: NodeId,
    pub first_child: NodeId,
    pub prev_sibling: NodeId,
    pub next_sibling: NodeId,
}

impl Default for NodeId {
    fn default() -> Self {
        NodeId::NONE
    }
}

/// `callhandle` attribute parsed into its parts; any element may carry one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallHandlerInfo {
    pub namespace: String,
    pub function: String,
    pub event: CallHandlerEvent,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CallHandlerEvent {
    Before,
    After,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub links: Links,
    pub call_handler: Option<CallHandlerInfo>,
    /// Line in the source document this node came from, for diagnostics.
    pub line: u32,
    pub data: NodeData,
}

/// Lifetime class of a run-time variable.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Validity {
    Static,
    ThisPacket,
}

/// Kinds of loop the decoder can drive.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LoopKind {
    /// Body repeats until `expr` bytes have been consumed.
    Size,
    /// Body repeats `expr` times.
    TimesToRepeat,
    While,
    DoWhile,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LoopCtrlKind {
    Break,
    Continue,
}

/// Policy when a wrapped/delimited field cannot find its begin or end.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MissingPolicy {
    /// Emit an empty field and keep going.
    ContinueDecoding,
    SkipField,
}

/// Policy when a pattern field matches only a prefix of the input.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PartialPolicy {
    ContinueDecoding,
    SkipField,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Asn1Encoding {
    Ber,
    Der,
    Cer,
}

/// How a token-terminated field recognizes its delimiter.
#[derive(Debug, Clone)]
pub enum Terminator {
    Token(Vec<u8>),
    Regex(Pattern),
}

/// Which portion of a complex field a subfield describes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Portion {
    TlvType,
    TlvLength,
    TlvValue,
    HdrlineName,
    HdrlineValue,
    /// Named capture of a dynamic field's pattern.
    Dynamic(String),
}

/// Attributes shared by every field element.
#[derive(Debug, Clone)]
pub struct FieldBase {
    pub name: String,
    pub longname: String,
    /// Multi-byte reads honor network byte order unless unset.
    pub network_byte_order: bool,
    pub show_template: Option<String>,
    pub show_template_link: NodeId,
}

#[derive(Debug, Clone)]
pub enum FieldVariant {
    Fixed {
        size: u32,
    },
    Bit {
        mask: u32,
        /// Size in bytes of the integer covering the whole bit group.
        size: u32,
        last_of_group: bool,
    },
    Variable {
        size: Expr,
    },
    TokenEnded {
        end: Terminator,
        end_offset: Option<Expr>,
        end_discard: Option<Expr>,
    },
    TokenWrapped {
        begin: Terminator,
        end: Terminator,
        begin_offset: Option<Expr>,
        end_offset: Option<Expr>,
        end_discard: Option<Expr>,
        on_missing_begin: MissingPolicy,
        on_missing_end: MissingPolicy,
    },
    /// One text line, terminated by LF or CRLF (or end of packet).
    Line,
    Pattern {
        pattern: Pattern,
        on_partial: PartialPolicy,
    },
    Eatall,
    Padding {
        align: u32,
    },
    Plugin {
        plugin: String,
    },
    Tlv {
        type_size: u32,
        length_size: u32,
        value_expr: Option<Expr>,
        type_link: NodeId,
        length_link: NodeId,
        value_link: NodeId,
    },
    Delimited {
        begin: Option<Pattern>,
        end: Pattern,
        on_missing_begin: MissingPolicy,
        on_missing_end: MissingPolicy,
    },
    Hdrline {
        separator: Pattern,
        name_link: NodeId,
        value_link: NodeId,
    },
    Dynamic {
        pattern: Pattern,
        /// Named captures declared by the pattern, with the subfield
        /// bound to each one (resolved by the organizer).
        captures: Vec<(String, NodeId)>,
    },
    Asn1 {
        encoding: Asn1Encoding,
    },
    Xml {
        size: Option<Expr>,
    },
}

impl FieldVariant {
    /// Stable label used in diagnostics and show output.
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldVariant::Fixed { .. } => "fixed",
            FieldVariant::Bit { .. } => "bit",
            FieldVariant::Variable { .. } => "variable",
            FieldVariant::TokenEnded { .. } => "tokenended",
            FieldVariant::TokenWrapped { .. } => "tokenwrapped",
            FieldVariant::Line => "line",
            FieldVariant::Pattern { .. } => "pattern",
            FieldVariant::Eatall => "eatall",
            FieldVariant::Padding { .. } => "padding",
            FieldVariant::Plugin { .. } => "plugin",
            FieldVariant::Tlv { .. } => "tlv",
            FieldVariant::Delimited { .. } => "delimited",
            FieldVariant::Hdrline { .. } => "hdrline",
            FieldVariant::Dynamic { .. } => "dynamic",
            FieldVariant::Asn1 { .. } => "asn1",
            FieldVariant::Xml { .. } => "xml",
        }
    }
}

/// Declared column of a lookup table.
#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
    /// Byte width; required for buffer columns.
    pub size: u32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TableAction {
    Add,
    Purge,
    Obsolete,
}

/// Lifetime policy of an inserted lookup-table row.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EntryPolicy {
    KeepForever,
    KeepMaxTime,
    UpdateOnHit,
    ReplaceOnHit,
    AddOnHit,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ShowMode {
    Dec,
    Hex,
    Bin,
    Ascii,
}

/// Which packet-header property a PSML `packethdr` item renders.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PacketHdrItem {
    Number,
    Timestamp,
    Length,
    CapturedLength,
}

/// The event an `execute-code` section runs at.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExecEvent {
    Init,
    Verify,
    Before,
    After,
}

#[derive(Debug, Clone)]
pub enum NodeData {
    /// Arena slot 0; never reachable through links.
    Sentinel,

    Root {
        name: String,
        version_major: u32,
        version_minor: u32,
        creator: String,
        date: String,
    },

    Proto {
        name: String,
        longname: String,
        /// Container links bound by the organizer.
        format: NodeId,
        first_field: NodeId,
        encapsulation: NodeId,
        /// Ordered statement lists split out of `execute-code`.
        init: Vec<NodeId>,
        verify: Vec<NodeId>,
        before: Vec<NodeId>,
        after: Vec<NodeId>,
        show_sum_template: Option<String>,
        show_sum_template_link: NodeId,
    },

    /// Structural containers; children carry the payload.
    Format,
    Fields,
    Encapsulation,
    ExecuteCode,
    ExecuteSection {
        event: ExecEvent,
        /// `when` guard on the section, if any.
        when: Option<Expr>,
    },

    Variable {
        name: String,
        kind: VariableKind,
        validity: Validity,
        size: u32,
        init_number: Option<u32>,
        init_bytes: Option<Vec<u8>>,
    },

    LookupTable {
        name: String,
        exact_entries: u32,
        mask_entries: u32,
        /// Whether rows with non-forever lifetimes may be inserted.
        dynamic_entries: bool,
        keys: Vec<Column>,
        data: Vec<Column>,
    },

    Alias {
        name: String,
        value: String,
    },

    AssignVariable {
        name: String,
        offset_start: u32,
        offset_size: u32,
        value: Expr,
    },

    AssignLookupTable {
        table: String,
        column: String,
        offset_start: u32,
        offset_size: u32,
        kind: ColumnKind,
        value: Expr,
    },

    UpdateLookupTable {
        table: String,
        action: TableAction,
        policy: Option<EntryPolicy>,
        keep_time: u32,
        hit_time: u32,
        new_hit_time: u32,
    },

    LookupKey {
        value: Expr,
        mask: Option<Vec<u8>>,
    },

    LookupData {
        value: Expr,
    },

    /// Table columns appear both embedded in their table and as child
    /// nodes, so sibling walks see them like any other element.
    KeyColumn(Column),
    DataColumn(Column),

    ShowTemplate {
        name: String,
        mode: ShowMode,
        /// Digits grouped together in the rendered value.
        group: u32,
        separator: String,
        plugin: Option<String>,
        native_function: Option<String>,
    },

    ShowDtl,
    ShowMap,

    ShowSumTemplate {
        name: String,
    },

    ShowSumStructure,

    SumSection {
        name: String,
        longname: String,
    },

    If {
        expr: Expr,
        true_branch: NodeId,
        false_branch: NodeId,
        missing_branch: NodeId,
    },
    IfTrue,
    IfFalse,
    MissingPacketData,

    Switch {
        expr: Expr,
        case_sensitive: bool,
        first_case: NodeId,
        default_case: NodeId,
    },

    Case {
        value: CaseValue,
        show: Option<String>,
        next_case: NodeId,
    },

    DefaultCase {
        show: Option<String>,
    },

    Loop {
        kind: LoopKind,
        expr: Expr,
        missing_branch: NodeId,
    },

    LoopCtrl {
        kind: LoopCtrlKind,
    },

    Block {
        name: String,
        longname: String,
        show_sum_template: Option<String>,
        show_sum_template_link: NodeId,
    },

    IncludeBlk {
        name: String,
        link: NodeId,
    },

    Field {
        base: FieldBase,
        variant: FieldVariant,
        /// `baseadt` reference expanded by the organizer.
        base_adt: Option<String>,
    },

    Subfield {
        portion: Portion,
        base: FieldBase,
        variant: FieldVariant,
        base_adt: Option<String>,
    },

    Fieldmatch {
        expr: Expr,
        recurring: bool,
        next_match: NodeId,
        base_adt: Option<String>,
    },

    Adtfield {
        adt_name: String,
        name: Option<String>,
        longname: Option<String>,
        show_template: Option<String>,
    },

    Replace {
        name_ref: String,
        name: Option<String>,
        longname: Option<String>,
        show_template: Option<String>,
    },

    Adt {
        name: String,
        /// Name of the protocol this ADT is scoped to, if local.
        proto_scope: Option<String>,
    },

    Set {
        field_to_repeat: NodeId,
        first_match: NodeId,
        exit_when: NodeId,
        default_item: NodeId,
        missing_branch: NodeId,
    },

    Choice {
        first_match: NodeId,
        exit_when: NodeId,
        default_item: NodeId,
        missing_branch: NodeId,
    },

    ExitWhen {
        expr: Expr,
    },

    DefaultItem {
        base_adt: Option<String>,
    },

    Map,
    MapXmlPi {
        name: String,
    },
    MapXmlDoctype {
        name: String,
    },
    MapXmlElement {
        name: String,
        namespace: Option<String>,
        hierarchy: Option<String>,
    },

    NextProto {
        proto: Expr,
        preferred: bool,
    },

    ShowCodeProtoField {
        field: String,
        header: bool,
    },
    ShowCodeProtoHdr,
    ShowCodePacketHdr {
        item: PacketHdrItem,
    },
    ShowCodeText {
        value: String,
        when: Option<Expr>,
        expr: Option<Expr>,
    },
    ShowCodeSection {
        name: String,
    },
}

/// Value a switch case matches against.
#[derive(Debug, Clone)]
pub enum CaseValue {
    Number { value: u32, max: Option<u32> },
    Bytes(Vec<u8>),
}

impl NodeData {
    /// Discriminant label; used for diagnostics and observational
    /// equality checks across loads.
    pub fn tag(&self) -> &'static str {
        match self {
            NodeData::Sentinel => "sentinel",
            NodeData::Root { .. } => "netpdl",
            NodeData::Proto { .. } => "proto",
            NodeData::Format => "format",
            NodeData::Fields => "fields",
            NodeData::Encapsulation => "encapsulation",
            NodeData::ExecuteCode => "execute-code",
            NodeData::ExecuteSection { .. } => "execute-section",
            NodeData::Variable { .. } => "variable",
            NodeData::LookupTable { .. } => "lookuptable",
            NodeData::Alias { .. } => "alias",
            NodeData::AssignVariable { .. } => "assign-variable",
            NodeData::AssignLookupTable { .. } => "assign-lookuptable",
            NodeData::UpdateLookupTable { .. } => "update-lookuptable",
            NodeData::LookupKey { .. } => "lookupkey",
            NodeData::LookupData { .. } => "lookupdata",
            NodeData::KeyColumn(_) => "key",
            NodeData::DataColumn(_) => "data",
            NodeData::ShowTemplate { .. } => "showtemplate",
            NodeData::ShowDtl => "showdtl",
            NodeData::ShowMap => "showmap",
            NodeData::ShowSumTemplate { .. } => "showsumtemplate",
            NodeData::ShowSumStructure => "showsumstruct",
            NodeData::SumSection { .. } => "sumsection",
            NodeData::If { .. } => "if",
            NodeData::IfTrue => "if-true",
            NodeData::IfFalse => "if-false",
            NodeData::MissingPacketData => "missing-packetdata",
            NodeData::Switch { .. } => "switch",
            NodeData::Case { .. } => "case",
            NodeData::DefaultCase { .. } => "default",
            NodeData::Loop { .. } => "loop",
            NodeData::LoopCtrl { .. } => "loopctrl",
            NodeData::Block { .. } => "block",
            NodeData::IncludeBlk { .. } => "includeblk",
            NodeData::Field { .. } => "field",
            NodeData::Subfield { .. } => "subfield",
            NodeData::Fieldmatch { .. } => "fieldmatch",
            NodeData::Adtfield { .. } => "adtfield",
            NodeData::Replace { .. } => "replace",
            NodeData::Adt { .. } => "adt",
            NodeData::Set { .. } => "set",
            NodeData::Choice { .. } => "choice",
            NodeData::ExitWhen { .. } => "exit-when",
            NodeData::DefaultItem { .. } => "default-item",
            NodeData::Map => "map",
            NodeData::MapXmlPi { .. } => "map-xml-pi",
            NodeData::MapXmlDoctype { .. } => "map-xml-doctype",
            NodeData::MapXmlElement { .. } => "map-xml-element",
            NodeData::NextProto { .. } => "nextproto",
            NodeData::ShowCodeProtoField { .. } => "protofield",
            NodeData::ShowCodeProtoHdr => "protohdr",
            NodeData::ShowCodePacketHdr { .. } => "packethdr",
            NodeData::ShowCodeText { .. } => "text",
            NodeData::ShowCodeSection { .. } => "section",
        }
    }
}
