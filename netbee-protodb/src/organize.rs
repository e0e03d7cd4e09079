//! Second pass: resolve every forward reference and expand macro-like
//! constructs, so the frozen database needs no name lookups at decode
//! time.

use std::collections::HashMap;

use tracing::trace;

use netbee_expr::{Expr, ExprKind};

use crate::db::{
    LoadFlags, ProtocolDatabase, DEFAULTPROTO_NAME, PADDINGPROTO_NAME, STARTPROTO_NAME,
};
use crate::load::Loader;
use crate::node::{
    CaseValue, ExecEvent, FieldVariant, Links, Node, NodeData, NodeId, Portion,
};
use crate::LoadError;

/// Hard cap on arena growth during ADT expansion; reaching it means the
/// ADT call graph is cyclic or absurdly deep.
const MAX_ELEMENTS: usize = 1 << 20;

pub(crate) fn organize(loader: Loader) -> Result<ProtocolDatabase, LoadError> {
    let Loader {
        flags,
        mut nodes,
        info,
        tables,
        ..
    } = loader;

    let protos = collect_protos(&nodes)?;
    let adts = collect_adts(&nodes)?;
    let templates = collect_named(&nodes, "showtemplate")?;
    let sum_templates = collect_named(&nodes, "showsumtemplate")?;

    expand_adts(&mut nodes, &adts)?;

    let proto_index: HashMap<String, u32> = protos
        .iter()
        .enumerate()
        .map(|(i, (name, _))| (name.clone(), i as u32))
        .collect();

    for id in 1..nodes.len() {
        let id = NodeId(id as u32);
        organize_node(&mut nodes, id, flags, &templates, &sum_templates, &tables)?;
    }

    stitch_bit_groups(&mut nodes)?;
    bind_expressions(&mut nodes, &proto_index)?;

    let start_proto = protos
        .iter()
        .position(|(name, _)| name == STARTPROTO_NAME);
    let default_proto = protos
        .iter()
        .position(|(name, _)| name == DEFAULTPROTO_NAME);
    let padding_proto = protos
        .iter()
        .position(|(name, _)| name == PADDINGPROTO_NAME);

    let (start_proto, default_proto) = match (start_proto, default_proto) {
        (Some(start), Some(default)) => (start, default),
        _ => {
            return Err(LoadError::Structural {
                element: "netpdl".to_string(),
                line: 0,
                reason: format!(
                    "protocols '{STARTPROTO_NAME}' and '{DEFAULTPROTO_NAME}' must always be present"
                ),
            })
        }
    };

    trace!(
        protocols = protos.len(),
        templates = templates.len(),
        "database organized"
    );

    Ok(ProtocolDatabase {
        nodes,
        info,
        flags,
        protos: protos.into_iter().map(|(_, id)| id).collect(),
        start_proto,
        default_proto,
        padding_proto,
    })
}

fn structural(nodes: &[Node], id: NodeId, reason: String) -> LoadError {
    let node = &nodes[id.index()];
    LoadError::Structural {
        element: node.data.tag().to_string(),
        line: node.line,
        reason,
    }
}

fn child_ids(nodes: &[Node], id: NodeId) -> Vec<NodeId> {
    let mut out = Vec::new();
    let mut child = nodes[id.index()].links.first_child;
    while child.is_some() {
        out.push(child);
        child = nodes[child.index()].links.next_sibling;
    }
    out
}

fn collect_protos(nodes: &[Node]) -> Result<Vec<(String, NodeId)>, LoadError> {
    let mut out: Vec<(String, NodeId)> = Vec::new();
    for (index, node) in nodes.iter().enumerate().skip(1) {
        if let NodeData::Proto { name, .. } = &node.data {
            if out.iter().any(|(n, _)| n == name) {
                return Err(structural(
                    nodes,
                    NodeId(index as u32),
                    format!("duplicate protocol '{name}'"),
                ));
            }
            out.push((name.clone(), NodeId(index as u32)));
        }
    }
    Ok(out)
}

struct AdtIndex {
    /// ADTs declared at the database level.
    global: HashMap<String, NodeId>,
    /// ADTs scoped to a protocol, keyed by (proto, name).
    local: HashMap<(String, String), NodeId>,
}

fn collect_adts(nodes: &[Node]) -> Result<AdtIndex, LoadError> {
    let mut index = AdtIndex {
        global: HashMap::new(),
        local: HashMap::new(),
    };

    for (i, node) in nodes.iter().enumerate().skip(1) {
        if let NodeData::Adt { name, proto_scope } = &node.data {
            let id = NodeId(i as u32);
            let clash = match proto_scope {
                None => index.global.insert(name.clone(), id).is_some(),
                Some(proto) => index
                    .local
                    .insert((proto.clone(), name.clone()), id)
                    .is_some(),
            };
            if clash {
                return Err(structural(nodes, id, format!("duplicate ADT '{name}'")));
            }
        }
    }

    Ok(index)
}

fn collect_named(nodes: &[Node], tag: &str) -> Result<HashMap<String, NodeId>, LoadError> {
    let mut out = HashMap::new();
    for (i, node) in nodes.iter().enumerate().skip(1) {
        let name = match &node.data {
            NodeData::ShowTemplate { name, .. } if tag == "showtemplate" => name.clone(),
            NodeData::ShowSumTemplate { name } if tag == "showsumtemplate" => name.clone(),
            _ => continue,
        };
        if out.insert(name.clone(), NodeId(i as u32)).is_some() {
            return Err(structural(
                nodes,
                NodeId(i as u32),
                format!("duplicate {tag} '{name}'"),
            ));
        }
    }
    Ok(out)
}

/// Name of the protocol that lexically contains `id`, if any.
fn owning_proto(nodes: &[Node], id: NodeId) -> Option<String> {
    let mut cursor = nodes[id.index()].links.parent;
    while cursor.is_some() {
        if let NodeData::Proto { name, .. } = &nodes[cursor.index()].data {
            return Some(name.clone());
        }
        cursor = nodes[cursor.index()].links.parent;
    }
    None
}

fn find_adt(
    nodes: &[Node],
    adts: &AdtIndex,
    call_site: NodeId,
    name: &str,
) -> Option<NodeId> {
    if let Some(proto) = owning_proto(nodes, call_site) {
        if let Some(&id) = adts.local.get(&(proto, name.to_string())) {
            return Some(id);
        }
    }
    adts.global.get(name).copied()
}

// ----- ADT expansion ------------------------------------------------------

/// Clone `src` and its subtree to fresh arena indices under `parent`.
fn clone_subtree(nodes: &mut Vec<Node>, src: NodeId, parent: NodeId, prev: NodeId) -> NodeId {
    let new_id = NodeId(nodes.len() as u32);
    let mut node = nodes[src.index()].clone();
    node.links = Links {
        parent,
        first_child: NodeId::NONE,
        prev_sibling: prev,
        next_sibling: NodeId::NONE,
    };
    nodes.push(node);

    let mut child = nodes[src.index()].links.first_child;
    let mut last = NodeId::NONE;
    while child.is_some() {
        let cloned = clone_subtree(nodes, child, new_id, last);
        if last.is_none() {
            nodes[new_id.index()].links.first_child = cloned;
        } else {
            nodes[last.index()].links.next_sibling = cloned;
        }
        last = cloned;
        child = nodes[child.index()].links.next_sibling;
    }

    new_id
}

struct Rename {
    name_ref: String,
    name: Option<String>,
    longname: Option<String>,
    show_template: Option<String>,
}

/// Pull `<replace>` directives out of a call node's child list.
fn extract_replaces(nodes: &mut [Node], call: NodeId) -> Vec<Rename> {
    let mut renames = Vec::new();
    let mut kept_first = NodeId::NONE;
    let mut kept_last = NodeId::NONE;

    let children = child_ids(nodes, call);
    for child in children {
        if let NodeData::Replace {
            name_ref,
            name,
            longname,
            show_template,
        } = &nodes[child.index()].data
        {
            renames.push(Rename {
                name_ref: name_ref.clone(),
                name: name.clone(),
                longname: longname.clone(),
                show_template: show_template.clone(),
            });
            continue;
        }

        if kept_last.is_none() {
            kept_first = child;
            nodes[child.index()].links.prev_sibling = NodeId::NONE;
        } else {
            nodes[kept_last.index()].links.next_sibling = child;
            nodes[child.index()].links.prev_sibling = kept_last;
        }
        nodes[child.index()].links.next_sibling = NodeId::NONE;
        kept_last = child;
    }

    nodes[call.index()].links.first_child = kept_first;
    renames
}

/// Apply rename directives across a cloned subtree (the root included).
fn apply_renames(nodes: &mut Vec<Node>, root: NodeId, renames: &[Rename]) {
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        let base = match &mut nodes[id.index()].data {
            NodeData::Field { base, .. } | NodeData::Subfield { base, .. } => Some(base),
            _ => None,
        };
        if let Some(base) = base {
            for rename in renames {
                if base.name == rename.name_ref {
                    if let Some(name) = &rename.name {
                        base.name = name.clone();
                    }
                    if let Some(longname) = &rename.longname {
                        base.longname = longname.clone();
                    }
                    if let Some(template) = &rename.show_template {
                        base.show_template = Some(template.clone());
                    }
                }
            }
        }

        let mut child = nodes[id.index()].links.first_child;
        while child.is_some() {
            stack.push(child);
            child = nodes[child.index()].links.next_sibling;
        }
    }
}

fn expand_adts(nodes: &mut Vec<Node>, adts: &AdtIndex) -> Result<(), LoadError> {
    let mut i = 1;
    // The arena grows while clones are appended; scanning past the
    // original tail picks up nested ADT calls inside the clones.
    while i < nodes.len() {
        if nodes.len() > MAX_ELEMENTS {
            return Err(LoadError::Structural {
                element: "adtfield".to_string(),
                line: 0,
                reason: "element count exceeded while expanding ADT calls".to_string(),
            });
        }

        let id = NodeId(i as u32);
        match &nodes[id.index()].data {
            NodeData::Adtfield { .. } => expand_adtfield(nodes, adts, id)?,
            NodeData::Field { base_adt: Some(_), .. }
            | NodeData::Subfield { base_adt: Some(_), .. }
            | NodeData::Fieldmatch { base_adt: Some(_), .. }
            | NodeData::DefaultItem { base_adt: Some(_) } => expand_base_adt(nodes, adts, id)?,
            _ => {}
        }
        i += 1;
    }
    Ok(())
}

/// Swap an `adtfield` call for a clone of the named ADT's field, keeping
/// the call site's name, long name and template when it supplies them.
fn expand_adtfield(nodes: &mut Vec<Node>, adts: &AdtIndex, call: NodeId) -> Result<(), LoadError> {
    let (adt_name, name, longname, show_template) = match &nodes[call.index()].data {
        NodeData::Adtfield {
            adt_name,
            name,
            longname,
            show_template,
        } => (
            adt_name.clone(),
            name.clone(),
            longname.clone(),
            show_template.clone(),
        ),
        _ => return Ok(()),
    };

    let adt = find_adt(nodes, adts, call, &adt_name)
        .ok_or_else(|| structural(nodes, call, format!("ADT '{adt_name}' is not declared")))?;

    let field_src = nodes[adt.index()].links.first_child;
    if field_src.is_none() {
        return Err(structural(
            nodes,
            adt,
            format!("ADT '{adt_name}' declares no field"),
        ));
    }

    let renames = extract_replaces(nodes, call);

    // The call node takes over the ADT field's payload in place, so the
    // surrounding sibling chain stays untouched.
    let mut data = nodes[field_src.index()].data.clone();
    match &mut data {
        NodeData::Field { base, .. } => {
            if let Some(name) = name {
                base.name = name;
            }
            if let Some(longname) = longname {
                base.longname = longname;
            }
            if let Some(template) = show_template {
                base.show_template = Some(template);
            }
        }
        _ => {
            return Err(structural(
                nodes,
                adt,
                format!("ADT '{adt_name}' does not wrap a field"),
            ))
        }
    }
    nodes[call.index()].data = data;
    nodes[call.index()].links.first_child = NodeId::NONE;

    let mut src_child = nodes[field_src.index()].links.first_child;
    let mut last = NodeId::NONE;
    while src_child.is_some() {
        let cloned = clone_subtree(nodes, src_child, call, last);
        if last.is_none() {
            nodes[call.index()].links.first_child = cloned;
        } else {
            nodes[last.index()].links.next_sibling = cloned;
        }
        last = cloned;
        src_child = nodes[src_child.index()].links.next_sibling;
    }

    apply_renames(nodes, call, &renames);
    Ok(())
}

/// Append a clone of the referenced ADT's children under the call node.
fn expand_base_adt(nodes: &mut Vec<Node>, adts: &AdtIndex, call: NodeId) -> Result<(), LoadError> {
    let adt_name = match &mut nodes[call.index()].data {
        NodeData::Field { base_adt, .. }
        | NodeData::Subfield { base_adt, .. }
        | NodeData::Fieldmatch { base_adt, .. }
        | NodeData::DefaultItem { base_adt } => base_adt.take(),
        _ => None,
    };
    let adt_name = match adt_name {
        Some(name) => name,
        None => return Ok(()),
    };

    let adt = find_adt(nodes, adts, call, &adt_name)
        .ok_or_else(|| structural(nodes, call, format!("ADT '{adt_name}' is not declared")))?;

    let renames = extract_replaces(nodes, call);

    // Find the tail of the call node's surviving children.
    let mut last = NodeId::NONE;
    let mut cursor = nodes[call.index()].links.first_child;
    while cursor.is_some() {
        last = cursor;
        cursor = nodes[cursor.index()].links.next_sibling;
    }

    let first_cloned = {
        let mut src_child = nodes[adt.index()].links.first_child;
        let mut first = NodeId::NONE;
        while src_child.is_some() {
            let cloned = clone_subtree(nodes, src_child, call, last);
            if last.is_none() {
                nodes[call.index()].links.first_child = cloned;
            } else {
                nodes[last.index()].links.next_sibling = cloned;
            }
            if first.is_none() {
                first = cloned;
            }
            last = cloned;
            src_child = nodes[src_child.index()].links.next_sibling;
        }
        first
    };

    if first_cloned.is_none() {
        return Err(structural(
            nodes,
            adt,
            format!("ADT '{adt_name}' declares no content"),
        ));
    }

    apply_renames(nodes, call, &renames);
    Ok(())
}

// ----- per-node hooks -----------------------------------------------------

fn organize_node(
    nodes: &mut Vec<Node>,
    id: NodeId,
    flags: LoadFlags,
    templates: &HashMap<String, NodeId>,
    sum_templates: &HashMap<String, NodeId>,
    tables: &HashMap<String, crate::load::TableShape>,
) -> Result<(), LoadError> {
    match &nodes[id.index()].data {
        NodeData::Proto { .. } => organize_proto(nodes, id, flags, sum_templates),
        NodeData::If { .. } => organize_if(nodes, id),
        NodeData::Switch { .. } => organize_switch(nodes, id),
        NodeData::Loop { .. } => organize_loop(nodes, id),
        NodeData::Set { .. } | NodeData::Choice { .. } => organize_set_like(nodes, id),
        NodeData::Block { .. } => organize_block(nodes, id, flags, sum_templates),
        NodeData::IncludeBlk { .. } => organize_includeblk(nodes, id),
        NodeData::Field { .. } | NodeData::Subfield { .. } => {
            organize_field(nodes, id, flags, templates)
        }
        NodeData::UpdateLookupTable { .. } => organize_update(nodes, id, tables),
        NodeData::Map => organize_map(nodes, id),
        NodeData::Adtfield { .. } => Err(structural(
            nodes,
            id,
            "ADT call survived expansion".to_string(),
        )),
        _ => Ok(()),
    }
}

/// An XML map is a chain of processing-instruction / doctype / element
/// entries and nothing else.
fn organize_map(nodes: &mut Vec<Node>, id: NodeId) -> Result<(), LoadError> {
    let children = child_ids(nodes, id);
    if children.is_empty() {
        return Err(structural(nodes, id, "map declares no entries".to_string()));
    }
    for child in children {
        match &nodes[child.index()].data {
            NodeData::MapXmlPi { .. }
            | NodeData::MapXmlDoctype { .. }
            | NodeData::MapXmlElement { .. } => {}
            other => {
                return Err(structural(
                    nodes,
                    child,
                    format!("<{}> does not belong in an XML map", other.tag()),
                ))
            }
        }
    }
    Ok(())
}

fn organize_proto(
    nodes: &mut Vec<Node>,
    id: NodeId,
    flags: LoadFlags,
    sum_templates: &HashMap<String, NodeId>,
) -> Result<(), LoadError> {
    let children = child_ids(nodes, id);
    let mut format = NodeId::NONE;
    let mut encapsulation = NodeId::NONE;
    let mut sections: [Vec<NodeId>; 4] = Default::default();

    for child in children {
        match &nodes[child.index()].data {
            NodeData::Format => format = child,
            NodeData::Encapsulation => encapsulation = child,
            NodeData::ExecuteCode => {
                for section in child_ids(nodes, child) {
                    if let NodeData::ExecuteSection { event, .. } = &nodes[section.index()].data {
                        let slot = match event {
                            ExecEvent::Init => 0,
                            ExecEvent::Verify => 1,
                            ExecEvent::Before => 2,
                            ExecEvent::After => 3,
                        };
                        sections[slot].push(section);
                    }
                }
            }
            _ => {}
        }
    }

    let mut first_field = NodeId::NONE;
    if format.is_some() {
        for child in child_ids(nodes, format) {
            if matches!(nodes[child.index()].data, NodeData::Fields) {
                first_field = nodes[child.index()].links.first_child;
                break;
            }
        }
    }

    let sum_link = resolve_sum_template(nodes, id, flags, sum_templates)?;

    let [init, verify, before, after] = sections;
    if let NodeData::Proto {
        format: slot_format,
        first_field: slot_first,
        encapsulation: slot_encap,
        init: slot_init,
        verify: slot_verify,
        before: slot_before,
        after: slot_after,
        show_sum_template_link,
        ..
    } = &mut nodes[id.index()].data
    {
        *slot_format = format;
        *slot_first = first_field;
        *slot_encap = encapsulation;
        *slot_init = init;
        *slot_verify = verify;
        *slot_before = before;
        *slot_after = after;
        *show_sum_template_link = sum_link;
    }

    Ok(())
}

fn resolve_sum_template(
    nodes: &[Node],
    id: NodeId,
    flags: LoadFlags,
    sum_templates: &HashMap<String, NodeId>,
) -> Result<NodeId, LoadError> {
    let name = match &nodes[id.index()].data {
        NodeData::Proto {
            show_sum_template, ..
        }
        | NodeData::Block {
            show_sum_template, ..
        } => show_sum_template.clone(),
        _ => None,
    };

    match name {
        None => Ok(NodeId::NONE),
        // A minimal database has no visualization primitives to bind to.
        Some(_) if flags.minimal => Ok(NodeId::NONE),
        Some(name) => sum_templates.get(&name).copied().ok_or_else(|| {
            structural(nodes, id, format!("showsumtemplate '{name}' is not declared"))
        }),
    }
}

fn organize_if(nodes: &mut Vec<Node>, id: NodeId) -> Result<(), LoadError> {
    let mut true_branch = NodeId::NONE;
    let mut false_branch = NodeId::NONE;
    let mut missing = NodeId::NONE;

    for child in child_ids(nodes, id) {
        match &nodes[child.index()].data {
            NodeData::IfTrue => true_branch = child,
            NodeData::IfFalse => false_branch = child,
            NodeData::MissingPacketData => missing = child,
            _ => {}
        }
    }

    if true_branch.is_none() {
        return Err(structural(nodes, id, "if has no <if-true> branch".to_string()));
    }

    if let NodeData::If {
        true_branch: t,
        false_branch: f,
        missing_branch: m,
        ..
    } = &mut nodes[id.index()].data
    {
        *t = true_branch;
        *f = false_branch;
        *m = missing;
    }
    Ok(())
}

fn organize_switch(nodes: &mut Vec<Node>, id: NodeId) -> Result<(), LoadError> {
    let expr_kind = match &nodes[id.index()].data {
        NodeData::Switch { expr, .. } => expr.kind(),
        _ => return Ok(()),
    };

    let mut first_case = NodeId::NONE;
    let mut last_case = NodeId::NONE;
    let mut default_case = NodeId::NONE;

    for child in child_ids(nodes, id) {
        match &nodes[child.index()].data {
            NodeData::Case { value, .. } => {
                let case_ok = match (value, expr_kind) {
                    (CaseValue::Number { .. }, ExprKind::Number) => true,
                    (CaseValue::Bytes(_), ExprKind::Buffer) => true,
                    _ => false,
                };
                if !case_ok {
                    return Err(structural(
                        nodes,
                        child,
                        "case value kind does not match the switch expression".to_string(),
                    ));
                }

                if first_case.is_none() {
                    first_case = child;
                } else if let NodeData::Case { next_case, .. } = &mut nodes[last_case.index()].data
                {
                    *next_case = child;
                }
                last_case = child;
            }
            NodeData::DefaultCase { .. } => default_case = child,
            _ => {}
        }
    }

    if let NodeData::Switch {
        first_case: f,
        default_case: d,
        ..
    } = &mut nodes[id.index()].data
    {
        *f = first_case;
        *d = default_case;
    }
    Ok(())
}

fn organize_loop(nodes: &mut Vec<Node>, id: NodeId) -> Result<(), LoadError> {
    let mut missing = NodeId::NONE;
    for child in child_ids(nodes, id) {
        if matches!(nodes[child.index()].data, NodeData::MissingPacketData) {
            missing = child;
        }
    }
    if let NodeData::Loop { missing_branch, .. } = &mut nodes[id.index()].data {
        *missing_branch = missing;
    }
    Ok(())
}

fn organize_set_like(nodes: &mut Vec<Node>, id: NodeId) -> Result<(), LoadError> {
    let mut field_to_repeat = NodeId::NONE;
    let mut first_match = NodeId::NONE;
    let mut last_match = NodeId::NONE;
    let mut match_count = 0usize;
    let mut exit_whens = Vec::new();
    let mut default_items = Vec::new();
    let mut missing = NodeId::NONE;

    for child in child_ids(nodes, id) {
        match &nodes[child.index()].data {
            NodeData::Field { .. } if field_to_repeat.is_none() => field_to_repeat = child,
            NodeData::Fieldmatch { .. } => {
                match_count += 1;
                if first_match.is_none() {
                    first_match = child;
                } else if let NodeData::Fieldmatch { next_match, .. } =
                    &mut nodes[last_match.index()].data
                {
                    *next_match = child;
                }
                last_match = child;
            }
            NodeData::ExitWhen { .. } => exit_whens.push(child),
            NodeData::DefaultItem { .. } => default_items.push(child),
            NodeData::MissingPacketData => missing = child,
            _ => {}
        }
    }

    if exit_whens.len() != 1 {
        return Err(structural(
            nodes,
            id,
            format!("requires exactly one <exit-when>, found {}", exit_whens.len()),
        ));
    }
    if default_items.len() != 1 {
        return Err(structural(
            nodes,
            id,
            format!(
                "requires exactly one <default-item>, found {}",
                default_items.len()
            ),
        ));
    }
    if match_count == 0 {
        return Err(structural(
            nodes,
            id,
            "requires at least one <fieldmatch>".to_string(),
        ));
    }

    match &mut nodes[id.index()].data {
        NodeData::Set {
            field_to_repeat: ftr,
            first_match: fm,
            exit_when: ew,
            default_item: di,
            missing_branch: mb,
        } => {
            *ftr = field_to_repeat;
            *fm = first_match;
            *ew = exit_whens[0];
            *di = default_items[0];
            *mb = missing;
        }
        NodeData::Choice {
            first_match: fm,
            exit_when: ew,
            default_item: di,
            missing_branch: mb,
        } => {
            *fm = first_match;
            *ew = exit_whens[0];
            *di = default_items[0];
            *mb = missing;
        }
        _ => {}
    }
    Ok(())
}

fn organize_block(
    nodes: &mut Vec<Node>,
    id: NodeId,
    flags: LoadFlags,
    sum_templates: &HashMap<String, NodeId>,
) -> Result<(), LoadError> {
    let link = resolve_sum_template(nodes, id, flags, sum_templates)?;
    if let NodeData::Block {
        show_sum_template_link,
        ..
    } = &mut nodes[id.index()].data
    {
        *show_sum_template_link = link;
    }
    Ok(())
}

/// The include target is a block declared in the same format subtree.
fn organize_includeblk(nodes: &mut Vec<Node>, id: NodeId) -> Result<(), LoadError> {
    let wanted = match &nodes[id.index()].data {
        NodeData::IncludeBlk { name, .. } => name.clone(),
        _ => return Ok(()),
    };

    let mut format = nodes[id.index()].links.parent;
    while format.is_some() && !matches!(nodes[format.index()].data, NodeData::Format) {
        format = nodes[format.index()].links.parent;
    }
    if format.is_none() {
        return Err(structural(
            nodes,
            id,
            format!("includeblk '{wanted}' appears outside a <format>"),
        ));
    }

    let mut found = NodeId::NONE;
    let mut stack = vec![format];
    while let Some(cursor) = stack.pop() {
        if let NodeData::Block { name, .. } = &nodes[cursor.index()].data {
            if *name == wanted {
                found = cursor;
                break;
            }
        }
        let mut child = nodes[cursor.index()].links.first_child;
        while child.is_some() {
            stack.push(child);
            child = nodes[child.index()].links.next_sibling;
        }
    }

    if found.is_none() {
        return Err(structural(
            nodes,
            id,
            format!("block '{wanted}' is not declared in this format"),
        ));
    }

    if let NodeData::IncludeBlk { link, .. } = &mut nodes[id.index()].data {
        *link = found;
    }
    Ok(())
}

fn organize_field(
    nodes: &mut Vec<Node>,
    id: NodeId,
    flags: LoadFlags,
    templates: &HashMap<String, NodeId>,
) -> Result<(), LoadError> {
    // Bind the show template by name.
    let template_name = match &nodes[id.index()].data {
        NodeData::Field { base, .. } | NodeData::Subfield { base, .. } => {
            base.show_template.clone()
        }
        _ => None,
    };

    let template_link = match template_name {
        None => NodeId::NONE,
        Some(_) if flags.minimal => NodeId::NONE,
        Some(name) => *templates.get(&name).ok_or_else(|| {
            structural(nodes, id, format!("showtemplate '{name}' is not declared"))
        })?,
    };

    // Bind complex-field subfields by portion.
    let children = child_ids(nodes, id);
    let mut by_portion: Vec<(Portion, NodeId)> = Vec::new();
    for child in &children {
        if let NodeData::Subfield { portion, .. } = &nodes[child.index()].data {
            by_portion.push((portion.clone(), *child));
        }
    }

    let find = |portion: &Portion| {
        by_portion
            .iter()
            .find(|(p, _)| p == portion)
            .map(|(_, id)| *id)
            .unwrap_or(NodeId::NONE)
    };
    let tlv_type = find(&Portion::TlvType);
    let tlv_length = find(&Portion::TlvLength);
    let tlv_value = find(&Portion::TlvValue);
    let hname = find(&Portion::HdrlineName);
    let hvalue = find(&Portion::HdrlineValue);

    match &mut nodes[id.index()].data {
        NodeData::Field { base, variant, .. } | NodeData::Subfield { base, variant, .. } => {
            base.show_template_link = template_link;
            match variant {
                FieldVariant::Tlv {
                    type_link,
                    length_link,
                    value_link,
                    ..
                } => {
                    *type_link = tlv_type;
                    *length_link = tlv_length;
                    *value_link = tlv_value;
                }
                FieldVariant::Hdrline {
                    name_link,
                    value_link,
                    ..
                } => {
                    *name_link = hname;
                    *value_link = hvalue;
                }
                FieldVariant::Dynamic { captures, .. } => {
                    for (capture, link) in captures.iter_mut() {
                        for (portion, sub) in &by_portion {
                            if matches!(portion, Portion::Dynamic(name) if name == capture) {
                                *link = *sub;
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        _ => {}
    }
    Ok(())
}

/// Keys and data supplied to an update must match the table declaration.
fn organize_update(
    nodes: &mut Vec<Node>,
    id: NodeId,
    tables: &HashMap<String, crate::load::TableShape>,
) -> Result<(), LoadError> {
    let (table_name, is_add) = match &nodes[id.index()].data {
        NodeData::UpdateLookupTable { table, action, .. } => {
            (table.clone(), *action == crate::node::TableAction::Add)
        }
        _ => return Ok(()),
    };

    let shape = tables.get(&table_name).ok_or_else(|| {
        structural(nodes, id, format!("lookup table '{table_name}' is not declared"))
    })?;

    if !is_add {
        return Ok(());
    }

    let mut keys = Vec::new();
    let mut data = Vec::new();
    for child in child_ids(nodes, id) {
        match &nodes[child.index()].data {
            NodeData::LookupKey { value, mask } => keys.push((child, value.kind(), mask.is_some())),
            NodeData::LookupData { value } => data.push((child, value.kind())),
            _ => {}
        }
    }

    if keys.len() != shape.keys.len() {
        return Err(structural(
            nodes,
            id,
            format!(
                "table '{table_name}' declares {} keys, update supplies {}",
                shape.keys.len(),
                keys.len()
            ),
        ));
    }
    if data.len() != shape.data.len() {
        return Err(structural(
            nodes,
            id,
            format!(
                "table '{table_name}' declares {} data columns, update supplies {}",
                shape.data.len(),
                data.len()
            ),
        ));
    }

    for ((child, kind, has_mask), (_, declared)) in keys.iter().zip(&shape.keys) {
        if *kind != declared.expr_kind() {
            return Err(structural(
                nodes,
                *child,
                "key expression kind does not match the declared column".to_string(),
            ));
        }
        if *has_mask && *kind != ExprKind::Buffer {
            return Err(structural(
                nodes,
                *child,
                "masks only apply to buffer keys".to_string(),
            ));
        }
    }
    for ((child, kind), (_, declared)) in data.iter().zip(&shape.data) {
        if *kind != declared.expr_kind() {
            return Err(structural(
                nodes,
                *child,
                "data expression kind does not match the declared column".to_string(),
            ));
        }
    }

    Ok(())
}

// ----- bit groups ---------------------------------------------------------

/// A maximal run of sibling bit fields shares one covering integer; the
/// run's terminal member is flagged so the decoder knows when to move
/// the cursor.
fn stitch_bit_groups(nodes: &mut Vec<Node>) -> Result<(), LoadError> {
    for index in 1..nodes.len() {
        let parent = NodeId(index as u32);
        let children = child_ids(nodes, parent);

        let mut group: Vec<(NodeId, u32, u32)> = Vec::new();
        for (position, child) in children.iter().enumerate() {
            let bit = match &nodes[child.index()].data {
                NodeData::Field {
                    variant: FieldVariant::Bit { mask, size, .. },
                    ..
                }
                | NodeData::Subfield {
                    variant: FieldVariant::Bit { mask, size, .. },
                    ..
                } => Some((*child, *mask, *size)),
                _ => None,
            };

            match bit {
                Some(entry) => {
                    let covering = entry.2;
                    if let Some((_, _, first_size)) = group.first() {
                        if *first_size != covering {
                            return Err(structural(
                                nodes,
                                entry.0,
                                format!(
                                    "bit field size {covering} differs from its group's {first_size}"
                                ),
                            ));
                        }
                    }
                    let closes = entry.1 & 1 == 1;
                    group.push(entry);
                    let next_is_bit = children.get(position + 1).map(|next| {
                        matches!(
                            &nodes[next.index()].data,
                            NodeData::Field {
                                variant: FieldVariant::Bit { .. },
                                ..
                            } | NodeData::Subfield {
                                variant: FieldVariant::Bit { .. },
                                ..
                            }
                        )
                    });
                    if closes || next_is_bit != Some(true) {
                        close_bit_group(nodes, &mut group);
                    }
                }
                None => close_bit_group(nodes, &mut group),
            }
        }
        close_bit_group(nodes, &mut group);
    }
    Ok(())
}

fn close_bit_group(nodes: &mut [Node], group: &mut Vec<(NodeId, u32, u32)>) {
    if let Some((last, _, _)) = group.last() {
        if let NodeData::Field {
            variant: FieldVariant::Bit { last_of_group, .. },
            ..
        }
        | NodeData::Subfield {
            variant: FieldVariant::Bit { last_of_group, .. },
            ..
        } = &mut nodes[last.index()].data
        {
            *last_of_group = true;
        }
    }
    group.clear();
}

// ----- expression binding -------------------------------------------------

fn bind_expressions(
    nodes: &mut Vec<Node>,
    proto_index: &HashMap<String, u32>,
) -> Result<(), LoadError> {
    for index in 1..nodes.len() {
        let line = nodes[index].line;
        let tag = nodes[index].data.tag();

        let mut unresolved: Option<String> = None;
        for_each_expr_mut(&mut nodes[index].data, &mut |expr| {
            expr.walk_mut(&mut |node| {
                if let Expr::ProtoRef { name, resolved } = node {
                    match proto_index.get(name.as_str()) {
                        Some(&index) => *resolved = Some(index),
                        None => {
                            if unresolved.is_none() {
                                unresolved = Some(name.clone());
                            }
                        }
                    }
                }
            });
        });

        if let Some(name) = unresolved {
            return Err(LoadError::Structural {
                element: tag.to_string(),
                line,
                reason: format!("protocol '#{name}' is not declared"),
            });
        }
    }
    Ok(())
}

/// Visit every expression owned by a node.
pub(crate) fn for_each_expr_mut(data: &mut NodeData, f: &mut dyn FnMut(&mut Expr)) {
    match data {
        NodeData::If { expr, .. }
        | NodeData::Switch { expr, .. }
        | NodeData::Loop { expr, .. }
        | NodeData::Fieldmatch { expr, .. }
        | NodeData::ExitWhen { expr } => f(expr),
        NodeData::ExecuteSection { when, .. } => {
            if let Some(when) = when {
                f(when);
            }
        }
        NodeData::AssignVariable { value, .. }
        | NodeData::AssignLookupTable { value, .. }
        | NodeData::LookupKey { value, .. }
        | NodeData::LookupData { value } => f(value),
        NodeData::NextProto { proto, .. } => f(proto),
        NodeData::ShowCodeText { when, expr, .. } => {
            if let Some(when) = when {
                f(when);
            }
            if let Some(expr) = expr {
                f(expr);
            }
        }
        NodeData::Field { variant, .. } | NodeData::Subfield { variant, .. } => {
            match variant {
                FieldVariant::Variable { size } => f(size),
                FieldVariant::TokenEnded {
                    end_offset,
                    end_discard,
                    ..
                } => {
                    if let Some(e) = end_offset {
                        f(e);
                    }
                    if let Some(e) = end_discard {
                        f(e);
                    }
                }
                FieldVariant::TokenWrapped {
                    begin_offset,
                    end_offset,
                    end_discard,
                    ..
                } => {
                    for e in [begin_offset, end_offset, end_discard].into_iter().flatten() {
                        f(e);
                    }
                }
                FieldVariant::Tlv { value_expr, .. } => {
                    if let Some(e) = value_expr {
                        f(e);
                    }
                }
                FieldVariant::Xml { size } => {
                    if let Some(e) = size {
                        f(e);
                    }
                }
                _ => {}
            }
        }
        _ => {}
    }
}
