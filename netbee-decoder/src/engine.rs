//! The decoder engine: a work-stack automaton over the description
//! graph. Each frame records where the walk resumes; loops iterate in
//! place instead of recursing, so stack depth stays bounded by the
//! description's nesting, never by the packet.

use byteorder::{ByteOrder, NetworkEndian};
use itertools::Itertools;
use tracing::{debug, trace, warn};

use netbee_expr::Expr;
use netbee_protodb::{
    Asn1Encoding, CaseValue, FieldBase, FieldVariant, LoopCtrlKind, LoopKind, MissingPolicy, Node,
    NodeData, NodeId, PartialPolicy, ProtocolDatabase, ShowMode, TableAction, Terminator,
};

use crate::asn1;
use crate::eval::{self, EvalCtx, EvalError, Value};
use crate::lookup::LookupStore;
use crate::packet::{Packet, MAX_PACKET_LEN};
use crate::state::VariableStore;
use crate::tree::{DecodedField, DecodedPacket, DecodedProto, FieldId};
use crate::DecodeError;

/// Knobs for behavior the description language leaves ambiguous.
#[derive(Debug, Copy, Clone)]
pub struct DecoderConfig {
    /// A later encapsulation candidate with `preferred="yes"` overrides
    /// an earlier match. Off means strictly first-match-wins.
    pub preferred_wins: bool,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        DecoderConfig {
            preferred_wins: true,
        }
    }
}

/// One decoder instance: owns its run-time state, shares the immutable
/// database. Decoders on different threads just need their own instance.
pub struct Decoder<'db> {
    db: &'db ProtocolDatabase,
    config: DecoderConfig,
    vars: VariableStore,
    tables: LookupStore,
    /// Lazily-run `init` sections, once per protocol per decoder.
    init_done: Vec<bool>,
    packet_count: u64,
}

impl<'db> Decoder<'db> {
    pub fn new(db: &'db ProtocolDatabase) -> Self {
        Decoder::with_config(db, DecoderConfig::default())
    }

    pub fn with_config(db: &'db ProtocolDatabase, config: DecoderConfig) -> Self {
        Decoder {
            db,
            config,
            vars: VariableStore::from_database(db),
            tables: LookupStore::from_database(db),
            init_done: vec![false; db.proto_count()],
            packet_count: 0,
        }
    }

    pub fn packets_decoded(&self) -> u64 {
        self.packet_count
    }

    /// Decode one packet into a field tree. Run-time trouble (truncated
    /// packets, malformed fields, expression failures) never fails the
    /// call; it is recorded in the returned tree.
    pub fn decode(&mut self, packet: &Packet<'_>) -> Result<DecodedPacket, DecodeError> {
        if packet.data.len() > MAX_PACKET_LEN {
            return Err(DecodeError::PacketTooLong(packet.data.len()));
        }

        self.packet_count += 1;
        self.vars.reset_packet();
        self.vars.seed("linklayer", packet.link_layer.code());
        self.vars.seed("framelength", packet.length);
        self.vars.seed("packetlength", packet.captured_len() as u32);
        self.vars.seed("timestamp_sec", packet.ts_sec);

        let tree = DecodedPacket::new(
            self.packet_count,
            packet.length,
            packet.captured_len() as u32,
            packet.ts_sec,
            packet.ts_usec,
        );

        let mut run = Run {
            db: self.db,
            config: self.config,
            vars: &mut self.vars,
            tables: &mut self.tables,
            init_done: &mut self.init_done,
            data: packet.data,
            tree,
            cursor: 0,
            limit: packet.data.len(),
            proto_start: 0,
            current_proto: self.db.start_proto(),
            current_ord: None,
            now: packet.ts_sec as u64,
            next_proto: None,
        };
        run.drive();

        debug!(
            num = run.tree.num,
            protos = run.tree.protos().len(),
            fields = run.tree.field_count(),
            truncated = run.tree.truncated,
            "packet decoded"
        );
        Ok(run.tree)
    }
}

/// How a single dispatch step went wrong.
enum Fault {
    /// The packet ran out under the cursor.
    Truncated { node: NodeId },
    /// A field invariant does not hold (bad TLV length and such).
    Malformed { node: NodeId, reason: String },
    Eval(EvalError),
}

impl From<EvalError> for Fault {
    fn from(e: EvalError) -> Self {
        Fault::Eval(e)
    }
}

/// Outcome of running a node list.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Flow {
    Normal,
    /// Abandon the current protocol and fall through to the default.
    AbortProto,
    /// Abandon the whole packet (unhandled truncation).
    EndPacket,
}

/// Side signal from a dispatched node.
enum Signal {
    None,
    Break,
    Continue,
}

/// A suspended position in the walk.
enum Frame {
    /// Run a sibling chain; `next` is the node to run next.
    Seq { next: NodeId },
    Loop(LoopFrame),
    Set(SetFrame),
    /// Scope marker: the innermost missing-packetdata handler ends here.
    PopMissing,
}

struct LoopFrame {
    kind: LoopKind,
    expr: NodeId,
    body: NodeId,
    /// Iterations left (times-to-repeat).
    remaining: u32,
    /// Cursor bound (size loops).
    limit: usize,
    last_cursor: usize,
    started: bool,
}

struct SetFrame {
    node: NodeId,
    /// Non-recurring matches that already fired.
    fired: Vec<NodeId>,
    last_cursor: usize,
    started: bool,
}

struct Run<'a, 'p> {
    db: &'a ProtocolDatabase,
    config: DecoderConfig,
    vars: &'a mut VariableStore,
    tables: &'a mut LookupStore,
    init_done: &'a mut Vec<bool>,
    data: &'p [u8],
    tree: DecodedPacket,
    cursor: usize,
    /// Logical end of decodable bytes; nested decodes shrink it.
    limit: usize,
    proto_start: usize,
    /// Database index of the protocol being decoded.
    current_proto: usize,
    /// Ordinal of that protocol inside the output tree, once it emits.
    current_ord: Option<usize>,
    now: u64,
    /// Encapsulation verdict for the current protocol.
    next_proto: Option<usize>,
}

impl<'a, 'p> Run<'a, 'p> {
    // ----- top-level protocol chain ------------------------------------

    fn drive(&mut self) {
        let mut guard = 0;
        loop {
            guard += 1;
            if guard > 1024 {
                warn!("protocol chain did not terminate, giving up");
                break;
            }

            match self.run_proto() {
                Flow::EndPacket => break,
                Flow::AbortProto => {
                    if self.current_proto == self.db.default_proto() {
                        break;
                    }
                    self.current_proto = self.db.default_proto();
                    continue;
                }
                Flow::Normal => {}
            }

            if self.cursor >= self.limit {
                break;
            }

            match self.next_proto.take() {
                Some(next) => self.current_proto = next,
                None if self.current_proto == self.db.default_proto() => break,
                None => self.current_proto = self.db.default_proto(),
            }
        }
    }

    fn run_proto(&mut self) -> Flow {
        let proto = self.current_proto;
        self.proto_start = self.cursor;
        self.current_ord = None;
        self.next_proto = None;

        trace!(proto = self.db.proto_name(proto), cursor = self.cursor, "protocol starts");

        let (init, verify, before, after, first_field, encapsulation) =
            match &self.db.proto_node(proto).data {
                NodeData::Proto {
                    init,
                    verify,
                    before,
                    after,
                    first_field,
                    encapsulation,
                    ..
                } => (
                    init.clone(),
                    verify.clone(),
                    before.clone(),
                    after.clone(),
                    *first_field,
                    *encapsulation,
                ),
                _ => return Flow::Normal,
            };

        if !self.init_done[proto] {
            self.init_done[proto] = true;
            for section in &init {
                if let Flow::EndPacket = self.run_section(*section) {
                    return Flow::EndPacket;
                }
            }
        }

        // A failed verify means this protocol does not apply.
        for section in &verify {
            if let NodeData::ExecuteSection { when: Some(when), .. } = &self.db.node(*section).data
            {
                match self.eval_truthy(when) {
                    Ok(true) => {}
                    Ok(false) | Err(_) => {
                        trace!(proto = self.db.proto_name(proto), "verify failed");
                        return Flow::AbortProto;
                    }
                }
            }
            if let Flow::EndPacket = self.run_section(*section) {
                return Flow::EndPacket;
            }
        }

        for section in &before {
            if let Flow::EndPacket = self.run_section(*section) {
                return Flow::EndPacket;
            }
        }

        let flow = if first_field.is_some() {
            self.run_nodes(first_field)
        } else {
            Flow::Normal
        };

        if flow == Flow::Normal {
            for section in &after {
                if let Flow::EndPacket = self.run_section(*section) {
                    return Flow::EndPacket;
                }
            }
        }

        if let Some(ord) = self.current_ord {
            let size = self.cursor - self.proto_start;
            self.tree.proto_mut(ord).size = size;
        }

        if flow != Flow::Normal {
            return flow;
        }

        if encapsulation.is_some() {
            let first = self.db.node(encapsulation).links.first_child;
            if first.is_some() {
                if let Flow::EndPacket = self.run_nodes(first) {
                    return Flow::EndPacket;
                }
            }
        }

        Flow::Normal
    }

    /// Run one execute-x section, honoring its `when` guard.
    fn run_section(&mut self, section: NodeId) -> Flow {
        if let NodeData::ExecuteSection { when: Some(when), .. } = &self.db.node(section).data {
            match self.eval_truthy(when) {
                Ok(true) => {}
                Ok(false) => return Flow::Normal,
                Err(_) => return Flow::AbortProto,
            }
        }
        let first = self.db.node(section).links.first_child;
        if first.is_none() {
            return Flow::Normal;
        }
        self.run_nodes(first)
    }

    // ----- the walker ---------------------------------------------------

    fn run_nodes(&mut self, first: NodeId) -> Flow {
        let mut stack: Vec<Frame> = vec![Frame::Seq { next: first }];
        let mut handlers: Vec<NodeId> = Vec::new();

        while let Some(top) = stack.last_mut() {
            match top {
                Frame::Seq { next } => {
                    if next.is_none() {
                        stack.pop();
                        continue;
                    }
                    let node = *next;
                    *next = self.db.node(node).links.next_sibling;

                    match self.dispatch(node, &mut stack, &mut handlers) {
                        Ok(Signal::None) => {}
                        Ok(Signal::Break) => unwind_loop(&mut stack, &mut handlers, true),
                        Ok(Signal::Continue) => unwind_loop(&mut stack, &mut handlers, false),
                        Err(fault) => {
                            match self.handle_fault(fault, &mut stack, &mut handlers) {
                                Flow::Normal => {}
                                other => return other,
                            }
                        }
                    }
                }

                Frame::PopMissing => {
                    handlers.pop();
                    stack.pop();
                }

                Frame::Loop(_) => {
                    let step = {
                        let frame = match stack.last_mut() {
                            Some(Frame::Loop(frame)) => frame,
                            _ => unreachable!(),
                        };
                        self.step_loop(frame)
                    };
                    match step {
                        Ok(Some(body)) => stack.push(Frame::Seq { next: body }),
                        Ok(None) => {
                            stack.pop();
                        }
                        Err(fault) => {
                            stack.pop();
                            match self.handle_fault(fault, &mut stack, &mut handlers) {
                                Flow::Normal => {}
                                other => return other,
                            }
                        }
                    }
                }

                Frame::Set(_) => {
                    let step = {
                        let frame = match stack.last_mut() {
                            Some(Frame::Set(frame)) => frame,
                            _ => unreachable!(),
                        };
                        self.step_set(frame)
                    };
                    match step {
                        Ok(SetStep::Run(body)) => stack.push(Frame::Seq { next: body }),
                        Ok(SetStep::Finish(default_body)) => {
                            stack.pop();
                            if default_body.is_some() {
                                stack.push(Frame::Seq { next: default_body });
                            }
                        }
                        Ok(SetStep::Done) => {
                            stack.pop();
                        }
                        Err(fault) => {
                            stack.pop();
                            match self.handle_fault(fault, &mut stack, &mut handlers) {
                                Flow::Normal => {}
                                other => return other,
                            }
                        }
                    }
                }
            }
        }

        Flow::Normal
    }

    /// One loop activation: decide whether the body runs again.
    fn step_loop(&mut self, frame: &mut LoopFrame) -> Result<Option<NodeId>, Fault> {
        let expr = match &self.db.node(frame.expr).data {
            NodeData::Loop { expr, .. } => expr.clone(),
            _ => return Ok(None),
        };

        match frame.kind {
            LoopKind::TimesToRepeat => {
                if !frame.started {
                    frame.started = true;
                    frame.remaining = self.eval_number(&expr)?;
                }
                if frame.remaining == 0 {
                    return Ok(None);
                }
                frame.remaining -= 1;
                Ok(Some(frame.body))
            }
            LoopKind::Size => {
                if !frame.started {
                    frame.started = true;
                    frame.limit = self.cursor + self.eval_number(&expr)? as usize;
                    frame.last_cursor = usize::MAX;
                }
                // Exit on budget exhausted or a body that stopped advancing.
                if self.cursor >= frame.limit || self.cursor == frame.last_cursor {
                    return Ok(None);
                }
                frame.last_cursor = self.cursor;
                Ok(Some(frame.body))
            }
            LoopKind::While => {
                if self.eval_truthy(&expr)? {
                    Ok(Some(frame.body))
                } else {
                    Ok(None)
                }
            }
            LoopKind::DoWhile => {
                if !frame.started {
                    frame.started = true;
                    return Ok(Some(frame.body));
                }
                if self.eval_truthy(&expr)? {
                    Ok(Some(frame.body))
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// One set iteration: exit check, then the first fieldmatch that
    /// matches picks the layout.
    fn step_set(&mut self, frame: &mut SetFrame) -> Result<SetStep, Fault> {
        let (field_to_repeat, first_match, exit_when, default_item) =
            match &self.db.node(frame.node).data {
                NodeData::Set {
                    field_to_repeat,
                    first_match,
                    exit_when,
                    default_item,
                    ..
                } => (*field_to_repeat, *first_match, *exit_when, *default_item),
                _ => return Ok(SetStep::Done),
            };

        if self.cursor >= self.limit {
            return Ok(SetStep::Done);
        }
        if frame.started && self.cursor == frame.last_cursor {
            warn!("set stopped advancing, exiting");
            return Ok(SetStep::Done);
        }
        frame.started = true;
        frame.last_cursor = self.cursor;

        if let NodeData::ExitWhen { expr } = &self.db.node(exit_when).data {
            let expr = expr.clone();
            if self.eval_truthy(&expr)? {
                return Ok(SetStep::Done);
            }
        }

        // The lookahead field decodes first; match expressions usually
        // inspect it.
        if field_to_repeat.is_some() {
            self.decode_field(field_to_repeat, FieldId::NONE)?;
        }

        let mut cursor = first_match;
        while cursor.is_some() {
            let (expr, recurring, next) = match &self.db.node(cursor).data {
                NodeData::Fieldmatch {
                    expr,
                    recurring,
                    next_match,
                    ..
                } => (expr.clone(), *recurring, *next_match),
                _ => break,
            };

            let already_fired = frame.fired.contains(&cursor);
            if !(already_fired && !recurring) && self.eval_truthy(&expr)? {
                if !recurring {
                    frame.fired.push(cursor);
                }
                let body = self.db.node(cursor).links.first_child;
                return Ok(SetStep::Run(body));
            }
            cursor = next;
        }

        // Nothing matched: the default item consumes the remainder.
        let body = if default_item.is_some() {
            self.db.node(default_item).links.first_child
        } else {
            NodeId::NONE
        };
        Ok(SetStep::Finish(body))
    }

    /// Faults route to the innermost missing-packetdata handler; without
    /// one they end the protocol or the packet.
    fn handle_fault(
        &mut self,
        fault: Fault,
        stack: &mut Vec<Frame>,
        handlers: &mut Vec<NodeId>,
    ) -> Flow {
        if let Some(handler) = handlers.last().copied() {
            // Unwind to the frame that registered the handler, then run
            // the handler branch in its place.
            while let Some(frame) = stack.pop() {
                if matches!(frame, Frame::PopMissing) {
                    handlers.pop();
                    break;
                }
            }
            let first = self.db.node(handler).links.first_child;
            if first.is_some() {
                stack.push(Frame::Seq { next: first });
            }
            trace!("missing-packetdata branch taken");
            return Flow::Normal;
        }

        match fault {
            Fault::Truncated { node } => {
                // The truncated field still shows up, with what is left.
                let remaining = self.limit.saturating_sub(self.cursor);
                let position = self.cursor;
                let value = self.data[position..self.limit].to_vec();
                if let NodeData::Field { base, .. } | NodeData::Subfield { base, .. } =
                    &self.db.node(node).data
                {
                    let base = base.clone();
                    self.emit(FieldId::NONE, &base, position, remaining, value, None);
                }
                self.cursor = self.limit;
                self.tree.truncated = true;
                debug!("packet truncated under the cursor");
                Flow::EndPacket
            }
            Fault::Malformed { node, reason } => {
                let line = self.db.node(node).line;
                debug!(line, reason = %reason, "malformed field");
                Flow::AbortProto
            }
            Fault::Eval(error) => {
                // Leave a diagnostic in the tree, then fall through to
                // the default protocol.
                let ord = self.ensure_proto_entry();
                let position = self.cursor;
                self.tree.push_field(
                    FieldId::NONE,
                    DecodedField {
                        name: "decoding-error".to_string(),
                        longname: error.to_string(),
                        position,
                        size: 0,
                        value: Vec::new(),
                        show: error.to_string(),
                        show_detail: None,
                        show_map: None,
                        mask: None,
                        proto: ord,
                        parent: FieldId::NONE,
                        first_child: FieldId::NONE,
                        prev_sibling: FieldId::NONE,
                        next_sibling: FieldId::NONE,
                    },
                );
                debug!(error = %error, "expression evaluation failed");
                Flow::AbortProto
            }
        }
    }

    // ----- node dispatch ------------------------------------------------

    fn dispatch(
        &mut self,
        id: NodeId,
        stack: &mut Vec<Frame>,
        handlers: &mut Vec<NodeId>,
    ) -> Result<Signal, Fault> {
        let node: &Node = self.db.node(id);
        match &node.data {
            NodeData::Field { .. } => {
                self.decode_field(id, FieldId::NONE)?;
                Ok(Signal::None)
            }

            NodeData::AssignVariable {
                name,
                offset_start,
                offset_size,
                value,
            } => {
                let (name, start, size) = (name.clone(), *offset_start, *offset_size);
                let value = value.clone();
                let result = self.eval(&value)?;
                if size != 0 {
                    let bytes = result.into_bytes()?;
                    self.vars.set_slice(&name, start, size, &bytes)?;
                } else {
                    self.vars.set(&name, result)?;
                }
                Ok(Signal::None)
            }

            NodeData::AssignLookupTable {
                table,
                column,
                offset_start,
                offset_size,
                value,
                ..
            } => {
                let (table, column) = (table.clone(), column.clone());
                let (start, size) = (*offset_start, *offset_size);
                let value = value.clone();
                let result = self.eval(&value)?;

                if size != 0 {
                    let current = self.tables.table(&table)?.bound_column(&column)?;
                    let mut bytes = current.into_bytes()?;
                    let end = start as usize + size as usize;
                    if end > bytes.len() {
                        bytes.resize(end, 0);
                    }
                    let patch = result.into_bytes()?;
                    let n = (size as usize).min(patch.len());
                    bytes[start as usize..start as usize + n].copy_from_slice(&patch[..n]);
                    self.tables
                        .table_mut(&table)?
                        .write_bound_column(&column, Value::Bytes(bytes))?;
                } else {
                    self.tables
                        .table_mut(&table)?
                        .write_bound_column(&column, result)?;
                }
                Ok(Signal::None)
            }

            NodeData::UpdateLookupTable {
                table,
                action,
                policy,
                keep_time,
                hit_time,
                new_hit_time,
            } => {
                let table = table.clone();
                let action = *action;
                let policy = *policy;
                let (keep, hit, newhit) = (*keep_time, *hit_time, *new_hit_time);

                match action {
                    TableAction::Purge => self.tables.table_mut(&table)?.purge(),
                    TableAction::Obsolete => self.tables.table_mut(&table)?.mark_obsolete(),
                    TableAction::Add => {
                        let mut keys = Vec::new();
                        let mut masks = Vec::new();
                        let mut data = Vec::new();
                        for child in self.child_list(id) {
                            match self.db.node(child).data.clone() {
                                NodeData::LookupKey { value, mask } => {
                                    keys.push(self.eval(&value)?);
                                    masks.push(mask);
                                }
                                NodeData::LookupData { value } => {
                                    data.push(self.eval(&value)?);
                                }
                                _ => {}
                            }
                        }
                        let policy =
                            policy.unwrap_or(netbee_protodb::EntryPolicy::KeepForever);
                        let now = self.now;
                        self.tables
                            .table_mut(&table)?
                            .update(&keys, &masks, data, policy, keep, hit, newhit, now)?;
                    }
                }
                Ok(Signal::None)
            }

            NodeData::If {
                expr,
                true_branch,
                false_branch,
                missing_branch,
            } => {
                let expr = expr.clone();
                let (t, f, m) = (*true_branch, *false_branch, *missing_branch);
                let taken = if self.eval_truthy(&expr)? { t } else { f };

                if m.is_some() {
                    handlers.push(m);
                    stack.push(Frame::PopMissing);
                }
                if taken.is_some() {
                    let first = self.db.node(taken).links.first_child;
                    if first.is_some() {
                        stack.push(Frame::Seq { next: first });
                    }
                }
                Ok(Signal::None)
            }

            NodeData::Switch {
                expr,
                case_sensitive,
                first_case,
                default_case,
            } => {
                let expr = expr.clone();
                let sensitive = *case_sensitive;
                let (first_case, default_case) = (*first_case, *default_case);
                let value = self.eval(&expr)?;

                let mut selected = NodeId::NONE;
                let mut show: Option<String> = None;

                let mut case = first_case;
                while case.is_some() {
                    if let NodeData::Case {
                        value: case_value,
                        show: case_show,
                        next_case,
                    } = &self.db.node(case).data
                    {
                        let matches = match (case_value, &value) {
                            (CaseValue::Number { value: v, max }, Value::Number(n)) => match max {
                                Some(max) => *v <= *n && *n <= *max,
                                None => n == v,
                            },
                            (CaseValue::Bytes(expected), Value::Bytes(got)) => {
                                if sensitive {
                                    expected == got
                                } else {
                                    expected.eq_ignore_ascii_case(got)
                                }
                            }
                            _ => false,
                        };
                        if matches {
                            selected = case;
                            show = case_show.clone();
                            break;
                        }
                        case = *next_case;
                    } else {
                        break;
                    }
                }

                if selected.is_none() && default_case.is_some() {
                    selected = default_case;
                    if let NodeData::DefaultCase { show: s } = &self.db.node(default_case).data {
                        show = s.clone();
                    }
                }

                // A case's show string overrides the template output of
                // the field the switch refines.
                if let Some(show) = show {
                    if let Some(field) = self.tree.last_emitted_mut() {
                        field.show = show.clone();
                        field.show_map = Some(show);
                    }
                }

                if selected.is_some() {
                    let first = self.db.node(selected).links.first_child;
                    if first.is_some() {
                        stack.push(Frame::Seq { next: first });
                    }
                }
                Ok(Signal::None)
            }

            NodeData::Loop { kind, missing_branch, .. } => {
                let kind = *kind;
                let missing = *missing_branch;
                if missing.is_some() {
                    handlers.push(missing);
                    stack.push(Frame::PopMissing);
                }
                stack.push(Frame::Loop(LoopFrame {
                    kind,
                    expr: id,
                    body: self.db.node(id).links.first_child,
                    remaining: 0,
                    limit: 0,
                    last_cursor: 0,
                    started: false,
                }));
                Ok(Signal::None)
            }

            NodeData::LoopCtrl { kind } => Ok(match kind {
                LoopCtrlKind::Break => Signal::Break,
                LoopCtrlKind::Continue => Signal::Continue,
            }),

            NodeData::Block { .. } => {
                let first = self.db.node(id).links.first_child;
                if first.is_some() {
                    stack.push(Frame::Seq { next: first });
                }
                Ok(Signal::None)
            }

            NodeData::IncludeBlk { link, .. } => {
                if link.is_some() {
                    let first = self.db.node(*link).links.first_child;
                    if first.is_some() {
                        stack.push(Frame::Seq { next: first });
                    }
                }
                Ok(Signal::None)
            }

            NodeData::Set { missing_branch, .. } => {
                let missing = *missing_branch;
                if missing.is_some() {
                    handlers.push(missing);
                    stack.push(Frame::PopMissing);
                }
                stack.push(Frame::Set(SetFrame {
                    node: id,
                    fired: Vec::new(),
                    last_cursor: 0,
                    started: false,
                }));
                Ok(Signal::None)
            }

            NodeData::Choice {
                first_match,
                default_item,
                missing_branch,
                ..
            } => {
                let (first_match, default_item, missing) =
                    (*first_match, *default_item, *missing_branch);
                if missing.is_some() {
                    handlers.push(missing);
                    stack.push(Frame::PopMissing);
                }

                let mut selected = NodeId::NONE;
                let mut cursor = first_match;
                while cursor.is_some() {
                    if let NodeData::Fieldmatch {
                        expr, next_match, ..
                    } = &self.db.node(cursor).data
                    {
                        let expr = expr.clone();
                        let next = *next_match;
                        if self.eval_truthy(&expr)? {
                            selected = cursor;
                            break;
                        }
                        cursor = next;
                    } else {
                        break;
                    }
                }
                if selected.is_none() {
                    selected = default_item;
                }
                if selected.is_some() {
                    let first = self.db.node(selected).links.first_child;
                    if first.is_some() {
                        stack.push(Frame::Seq { next: first });
                    }
                }
                Ok(Signal::None)
            }

            NodeData::NextProto { proto, preferred } => {
                let preferred = *preferred;
                let proto = proto.clone();
                let index = self.eval_number(&proto)? as usize;
                if index < self.db.proto_count() {
                    match self.next_proto {
                        None => self.next_proto = Some(index),
                        Some(_) if preferred && self.config.preferred_wins => {
                            self.next_proto = Some(index)
                        }
                        Some(_) => {}
                    }
                }
                Ok(Signal::None)
            }

            // Structure handled by their parents, or declarations that
            // carry no decode-time behavior of their own.
            _ => Ok(Signal::None),
        }
    }

    fn child_list(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut child = self.db.node(id).links.first_child;
        while child.is_some() {
            out.push(child);
            child = self.db.node(child).links.next_sibling;
        }
        out
    }

    // ----- expression plumbing ------------------------------------------

    fn eval(&mut self, expr: &Expr) -> Result<Value, EvalError> {
        let mut ctx = EvalCtx {
            tree: &self.tree,
            vars: &*self.vars,
            tables: &mut *self.tables,
            current_proto: self.current_ord,
            now: self.now,
        };
        eval::eval(&mut ctx, expr)
    }

    fn eval_number(&mut self, expr: &Expr) -> Result<u32, EvalError> {
        self.eval(expr)?.as_number()
    }

    fn eval_truthy(&mut self, expr: &Expr) -> Result<bool, EvalError> {
        Ok(self.eval(expr)?.truthy())
    }
}

enum SetStep {
    /// Run one fieldmatch body, then come back.
    Run(NodeId),
    /// Run the default item, then the set is over.
    Finish(NodeId),
    Done,
}

/// Pop frames until the innermost loop; `pop_loop` removes the loop
/// frame itself (break) or leaves it for its next activation (continue).
fn unwind_loop(stack: &mut Vec<Frame>, handlers: &mut Vec<NodeId>, pop_loop: bool) {
    while let Some(frame) = stack.last() {
        match frame {
            Frame::Loop(_) => {
                if pop_loop {
                    stack.pop();
                }
                return;
            }
            Frame::PopMissing => {
                handlers.pop();
                stack.pop();
            }
            _ => {
                stack.pop();
            }
        }
    }
}

impl<'a, 'p> Run<'a, 'p> {
    // ----- field decoding -----------------------------------------------

    /// Bytes left under the cursor.
    fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.cursor)
    }

    fn region(&self) -> &'p [u8] {
        let data = self.data;
        &data[self.cursor..self.limit]
    }

    /// Take `size` bytes at the cursor, or fault.
    fn take(&self, node: NodeId, size: usize) -> Result<&'p [u8], Fault> {
        if self.remaining() < size {
            return Err(Fault::Truncated { node });
        }
        let data = self.data;
        Ok(&data[self.cursor..self.cursor + size])
    }

    fn field_parts(&self, id: NodeId) -> Option<(FieldBase, FieldVariant)> {
        match &self.db.node(id).data {
            NodeData::Field { base, variant, .. } | NodeData::Subfield { base, variant, .. } => {
                Some((base.clone(), variant.clone()))
            }
            _ => None,
        }
    }

    /// Decode one field (or complex field) at the cursor, emitting into
    /// the tree under `parent`.
    fn decode_field(&mut self, id: NodeId, parent: FieldId) -> Result<(), Fault> {
        let (base, variant) = match self.field_parts(id) {
            Some(parts) => parts,
            None => return Ok(()),
        };

        match variant {
            FieldVariant::Fixed { size } => {
                let size = size as usize;
                let bytes = self.take(id, size)?.to_vec();
                let position = self.cursor;
                self.emit(parent, &base, position, size, bytes, None);
                self.cursor += size;
            }

            FieldVariant::Bit {
                mask,
                size,
                last_of_group,
            } => {
                let size = size as usize;
                if size > 4 {
                    return Err(Fault::Malformed {
                        node: id,
                        reason: format!("bit group covering size {size} exceeds 4 bytes"),
                    });
                }
                let raw = self.take(id, size)?;
                let covering = NetworkEndian::read_uint(raw, size) as u32;
                let shift = if mask == 0 { 0 } else { mask.trailing_zeros() };
                let value = (covering & mask) >> shift;
                let bytes = eval::int_to_buf(value, size as u32);
                let position = self.cursor;
                self.emit(parent, &base, position, size, bytes, Some(mask));
                // The cursor moves once, with the group's last member.
                if last_of_group {
                    self.cursor += size;
                }
            }

            FieldVariant::Variable { size } => {
                let size = self.eval_number(&size)? as usize;
                let bytes = self.take(id, size)?.to_vec();
                let position = self.cursor;
                self.emit(parent, &base, position, size, bytes, None);
                self.cursor += size;
            }

            FieldVariant::TokenEnded {
                end,
                end_offset,
                end_discard,
            } => {
                let region = self.region();
                let found = find_terminator(&end, region);
                let (match_start, _match_len) = match found {
                    Some(found) => found,
                    None => return Err(Fault::Truncated { node: id }),
                };

                let mut field_len = match_start as i64;
                if let Some(expr) = &end_offset {
                    field_len += self.eval_number(expr)? as i32 as i64;
                }
                let field_len = field_len.clamp(0, region.len() as i64) as usize;

                let discard = match &end_discard {
                    Some(expr) => self.eval_number(expr)? as i32 as i64,
                    None => 0,
                };

                let position = self.cursor;
                let bytes = self.data[position..position + field_len].to_vec();
                self.emit(parent, &base, position, field_len, bytes, None);

                let advance = (field_len as i64 + discard).clamp(0, self.remaining() as i64);
                self.cursor += advance as usize;
            }

            FieldVariant::TokenWrapped {
                begin,
                end,
                begin_offset,
                end_offset,
                end_discard,
                on_missing_begin,
                on_missing_end,
            } => {
                let region = self.region();
                let begin_found = find_terminator(&begin, region);
                let (b_start, b_len) = match begin_found {
                    Some(found) => found,
                    None => {
                        if on_missing_begin == MissingPolicy::ContinueDecoding {
                            let position = self.cursor;
                            self.emit(parent, &base, position, 0, Vec::new(), None);
                        }
                        return Ok(());
                    }
                };

                let mut content_start = (b_start + b_len) as i64;
                if let Some(expr) = &begin_offset {
                    content_start += self.eval_number(expr)? as i32 as i64;
                }
                let content_start = content_start.clamp(0, region.len() as i64) as usize;

                let tail = &region[content_start..];
                let end_found = find_terminator(&end, tail);
                let (e_start, e_len) = match end_found {
                    Some(found) => found,
                    None => {
                        if on_missing_end == MissingPolicy::ContinueDecoding {
                            let position = self.cursor;
                            self.emit(parent, &base, position, 0, Vec::new(), None);
                        }
                        return Ok(());
                    }
                };

                let mut content_len = e_start as i64;
                if let Some(expr) = &end_offset {
                    content_len += self.eval_number(expr)? as i32 as i64;
                }
                let content_len = content_len.clamp(0, tail.len() as i64) as usize;

                let discard = match &end_discard {
                    Some(expr) => self.eval_number(expr)? as i32 as i64,
                    None => 0,
                };

                let position = self.cursor + content_start;
                let bytes = self.data[position..position + content_len].to_vec();
                self.emit(parent, &base, position, content_len, bytes, None);

                let consumed = content_start + e_start + e_len;
                let advance = (consumed as i64 + discard).clamp(0, self.remaining() as i64);
                self.cursor += advance as usize;
            }

            FieldVariant::Line => {
                let (line_len, eol_len) = split_line(self.region());
                let position = self.cursor;
                let bytes = self.data[position..position + line_len].to_vec();
                self.emit(parent, &base, position, line_len, bytes, None);
                self.cursor += line_len + eol_len;
            }

            FieldVariant::Pattern {
                pattern,
                on_partial,
            } => {
                let matched = pattern
                    .regex()
                    .find(self.region())
                    .filter(|m| m.start() == 0)
                    .map(|m| m.end());
                match matched {
                    Some(len) => {
                        let position = self.cursor;
                        let bytes = self.data[position..position + len].to_vec();
                        self.emit(parent, &base, position, len, bytes, None);
                        self.cursor += len;
                    }
                    None => {
                        if on_partial == PartialPolicy::ContinueDecoding {
                            let position = self.cursor;
                            self.emit(parent, &base, position, 0, Vec::new(), None);
                        }
                    }
                }
            }

            FieldVariant::Eatall => {
                let size = self.remaining();
                let position = self.cursor;
                let bytes = self.data[position..self.limit].to_vec();
                self.emit(parent, &base, position, size, bytes, None);
                self.cursor = self.limit;
            }

            FieldVariant::Padding { align } => {
                let align = align as usize;
                // Alignment counts from the start of the current protocol.
                let into_proto = self.cursor - self.proto_start;
                let pad = (align - into_proto % align) % align;
                if pad > 0 {
                    let pad = pad.min(self.remaining());
                    let position = self.cursor;
                    let bytes = self.data[position..position + pad].to_vec();
                    self.emit(parent, &base, position, pad, bytes, None);
                    self.cursor += pad;
                }
            }

            FieldVariant::Plugin { plugin } => {
                // Plugin dispatch lives outside the core; the field marks
                // its place without consuming anything.
                let position = self.cursor;
                let mut field_base = base.clone();
                if field_base.longname.is_empty() {
                    field_base.longname = plugin.clone();
                }
                self.emit(parent, &field_base, position, 0, Vec::new(), None);
            }

            FieldVariant::Tlv {
                type_size,
                length_size,
                value_expr,
                type_link,
                length_link,
                value_link,
            } => {
                self.decode_tlv(
                    id,
                    parent,
                    &base,
                    type_size as usize,
                    length_size as usize,
                    value_expr.as_ref(),
                    type_link,
                    length_link,
                    value_link,
                )?;
            }

            FieldVariant::Delimited {
                begin,
                end,
                on_missing_begin,
                on_missing_end,
            } => {
                let region = self.region();
                let content_start = match &begin {
                    None => 0,
                    Some(pattern) => match pattern.find(region) {
                        Some((start, len)) => start + len,
                        None => {
                            if on_missing_begin == MissingPolicy::ContinueDecoding {
                                let position = self.cursor;
                                self.emit(parent, &base, position, 0, Vec::new(), None);
                            }
                            return Ok(());
                        }
                    },
                };

                let tail = &region[content_start..];
                match end.find(tail) {
                    Some((e_start, e_len)) => {
                        let position = self.cursor + content_start;
                        let bytes = self.data[position..position + e_start].to_vec();
                        self.emit(parent, &base, position, e_start, bytes, None);
                        self.cursor += content_start + e_start + e_len;
                    }
                    None => {
                        if on_missing_end == MissingPolicy::ContinueDecoding {
                            // No closing delimiter: the field runs out.
                            let position = self.cursor + content_start;
                            let size = tail.len();
                            let bytes = tail.to_vec();
                            self.emit(parent, &base, position, size, bytes, None);
                            self.cursor = self.limit;
                        }
                    }
                }
            }

            FieldVariant::Hdrline {
                separator,
                name_link,
                value_link,
            } => {
                let (line_len, eol_len) = split_line(self.region());
                let position = self.cursor;
                let data = self.data;
                let line = &data[position..position + line_len];
                let field = self.emit(parent, &base, position,
                    line_len,
                    line.to_vec(),
                    None,
                );

                if let Some((s_start, s_len)) = separator.find(line) {
                    self.emit_portion(field, name_link, "hname", position, s_start)?;
                    self.emit_portion(
                        field,
                        value_link,
                        "hvalue",
                        position + s_start + s_len,
                        line_len - s_start - s_len,
                    )?;
                }
                self.cursor += line_len + eol_len;
            }

            FieldVariant::Dynamic { pattern, captures } => {
                let region = self.region();
                let caps = match pattern.regex().captures(region) {
                    Some(caps) => caps,
                    None => return Ok(()),
                };
                let whole = caps.get(0).map(|m| (m.start(), m.end())).unwrap_or((0, 0));
                let position = self.cursor + whole.0;
                let size = whole.1 - whole.0;
                let bytes = region[whole.0..whole.1].to_vec();
                let field = self.emit(parent, &base, position, size, bytes, None);

                for (name, link) in &captures {
                    if let Some(m) = caps.name(name) {
                        self.emit_portion(
                            field,
                            *link,
                            name,
                            self.cursor + m.start(),
                            m.end() - m.start(),
                        )?;
                    }
                }
                self.cursor += whole.1;
            }

            FieldVariant::Asn1 { encoding } => {
                let consumed = self.decode_asn1(id, parent, &base, encoding, self.cursor, 0)?;
                self.cursor += consumed;
            }

            FieldVariant::Xml { size } => {
                let size = match &size {
                    Some(expr) => (self.eval_number(expr)? as usize).min(self.remaining()),
                    None => self.remaining(),
                };
                let position = self.cursor;
                let bytes = self.data[position..position + size].to_vec();
                self.emit(parent, &base, position, size, bytes, None);
                self.cursor += size;
            }
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn decode_tlv(
        &mut self,
        id: NodeId,
        parent: FieldId,
        base: &FieldBase,
        type_size: usize,
        length_size: usize,
        value_expr: Option<&Expr>,
        type_link: NodeId,
        length_link: NodeId,
        value_link: NodeId,
    ) -> Result<(), Fault> {
        if length_size > 8 {
            return Err(Fault::Malformed {
                node: id,
                reason: format!("TLV length of {length_size} bytes is not readable"),
            });
        }
        let header = self.take(id, type_size + length_size)?;
        let length = NetworkEndian::read_uint(&header[type_size..], length_size) as usize;

        let value_len = match value_expr {
            Some(expr) => self.eval_number(expr)? as usize,
            None => length,
        };

        if self.remaining() < type_size + length_size + value_len {
            return Err(Fault::Malformed {
                node: id,
                reason: format!(
                    "TLV declares {value_len} value bytes, {} available",
                    self.remaining() - type_size - length_size
                ),
            });
        }

        let position = self.cursor;
        let total = type_size + length_size + value_len;
        let bytes = self.data[position..position + total].to_vec();
        let field = self.emit(parent, base, position, total, bytes, None);

        self.emit_portion(field, type_link, "type", position, type_size)?;
        self.emit_portion(field, length_link, "length", position + type_size, length_size)?;
        self.emit_portion(
            field,
            value_link,
            "value",
            position + type_size + length_size,
            value_len,
        )?;

        self.cursor += total;
        Ok(())
    }

    /// Emit one portion of a complex field. A bound subfield brings its
    /// own name, template and possibly a whole nested layout.
    fn emit_portion(
        &mut self,
        parent: FieldId,
        link: NodeId,
        fallback_name: &str,
        position: usize,
        size: usize,
    ) -> Result<(), Fault> {
        let end = (position + size).min(self.data.len());
        let position = position.min(end);
        let bytes = self.data[position..end].to_vec();

        match self.field_parts(link) {
            None => {
                let base = FieldBase {
                    name: fallback_name.to_string(),
                    longname: fallback_name.to_string(),
                    network_byte_order: true,
                    show_template: None,
                    show_template_link: NodeId::NONE,
                };
                self.emit(parent, &base, position, end - position, bytes, None);
            }
            Some((base, FieldVariant::Eatall)) => {
                self.emit(parent, &base, position, end - position, bytes, None);
            }
            Some(_) => {
                // The subfield declares its own layout: decode it inside
                // the portion's bounds.
                let saved_cursor = self.cursor;
                let saved_limit = self.limit;
                self.cursor = position;
                self.limit = end;
                let result = self.decode_field(link, parent);
                self.cursor = saved_cursor;
                self.limit = saved_limit;
                result?;
            }
        }
        Ok(())
    }

    /// Decode one ASN.1 TLV (recursing into constructed values) and
    /// return the bytes it occupies.
    fn decode_asn1(
        &mut self,
        id: NodeId,
        parent: FieldId,
        base: &FieldBase,
        encoding: Asn1Encoding,
        position: usize,
        depth: usize,
    ) -> Result<usize, Fault> {
        if depth > 32 {
            return Err(Fault::Malformed {
                node: id,
                reason: "ASN.1 nesting deeper than 32 levels".to_string(),
            });
        }

        let data = self.data;
        let bytes = &data[position..self.limit];
        let header = asn1::header(bytes, encoding).map_err(|e| Fault::Malformed {
            node: id,
            reason: format!("bad ASN.1 header: {e:?}"),
        })?;

        let name = if depth == 0 {
            base.name.clone()
        } else {
            asn1::tag_name(&header.id).to_string()
        };

        match header.content_len {
            Some(content_len) => {
                let total = header.header_len + content_len;
                if bytes.len() < total {
                    return Err(Fault::Malformed {
                        node: id,
                        reason: "ASN.1 length exceeds the remaining buffer".to_string(),
                    });
                }

                let field_base = FieldBase {
                    name,
                    longname: asn1::tag_name(&header.id).to_string(),
                    network_byte_order: true,
                    show_template: base.show_template.clone(),
                    show_template_link: base.show_template_link,
                };
                let value = if header.id.constructed {
                    Vec::new()
                } else {
                    bytes[header.header_len..total].to_vec()
                };
                let field = self.emit(parent, &field_base, position, total, value, None);

                if header.id.constructed {
                    let mut offset = header.header_len;
                    while offset < total {
                        let consumed = self.decode_asn1(
                            id,
                            field,
                            base,
                            encoding,
                            position + offset,
                            depth + 1,
                        )?;
                        if consumed == 0 {
                            break;
                        }
                        offset += consumed;
                    }
                }
                Ok(total)
            }
            None => {
                // Indefinite length: children run until end-of-contents.
                let field_base = FieldBase {
                    name,
                    longname: asn1::tag_name(&header.id).to_string(),
                    network_byte_order: true,
                    show_template: base.show_template.clone(),
                    show_template_link: base.show_template_link,
                };
                let field =
                    self.emit(parent, &field_base, position, 0, Vec::new(), None);

                let mut offset = header.header_len;
                loop {
                    let rest = &data[position + offset..self.limit];
                    if rest.len() >= 2 && rest[0] == 0 && rest[1] == 0 {
                        offset += 2;
                        break;
                    }
                    if rest.is_empty() {
                        return Err(Fault::Malformed {
                            node: id,
                            reason: "unterminated indefinite-length ASN.1 value".to_string(),
                        });
                    }
                    let consumed =
                        self.decode_asn1(id, field, base, encoding, position + offset, depth + 1)?;
                    if consumed == 0 {
                        break;
                    }
                    offset += consumed;
                }
                Ok(offset)
            }
        }
    }

    // ----- emission -----------------------------------------------------

    /// The tree grows a protocol entry the first time it emits a field.
    fn ensure_proto_entry(&mut self) -> usize {
        if let Some(ord) = self.current_ord {
            return ord;
        }
        let (name, longname) = match &self.db.proto_node(self.current_proto).data {
            NodeData::Proto { name, longname, .. } => (name.clone(), longname.clone()),
            _ => (String::new(), String::new()),
        };
        let ord = self.tree.push_proto(DecodedProto {
            proto_index: self.current_proto,
            name,
            longname,
            position: self.proto_start,
            size: 0,
            first_field: FieldId::NONE,
            last_field: FieldId::NONE,
            summary: None,
        });
        self.current_ord = Some(ord);
        ord
    }

    fn emit(
        &mut self,
        parent: FieldId,
        base: &FieldBase,
        position: usize,
        size: usize,
        value: Vec<u8>,
        mask: Option<u32>,
    ) -> FieldId {
        let proto = self.ensure_proto_entry();
        let show = self.render_show(base, &value, mask);

        self.tree.push_field(
            parent,
            DecodedField {
                name: base.name.clone(),
                longname: base.longname.clone(),
                position,
                size,
                value,
                show,
                show_detail: None,
                show_map: None,
                mask,
                proto,
                parent: FieldId::NONE,
                first_child: FieldId::NONE,
                prev_sibling: FieldId::NONE,
                next_sibling: FieldId::NONE,
            },
        )
    }

    /// Render the human-readable value per the field's show template.
    fn render_show(&self, base: &FieldBase, value: &[u8], mask: Option<u32>) -> String {
        let template = self.db.get(base.show_template_link).map(|n| &n.data);

        let (mode, group, separator) = match template {
            Some(NodeData::ShowTemplate {
                mode,
                group,
                separator,
                ..
            }) => (*mode, *group as usize, separator.as_str()),
            _ => {
                // No template: bit fields read as numbers, the rest as hex.
                if mask.is_some() {
                    return eval::buf_to_int(&value[..value.len().min(4)])
                        .map(|n| n.to_string())
                        .unwrap_or_default();
                }
                (ShowMode::Hex, 0, "")
            }
        };

        match mode {
            ShowMode::Dec => {
                if value.len() <= 4 {
                    eval::buf_to_int(value).map(|n| n.to_string()).unwrap_or_default()
                } else {
                    hex_show(value, 0, "")
                }
            }
            ShowMode::Hex => hex_show(value, group, separator),
            ShowMode::Bin => {
                let mut out = String::with_capacity(value.len() * 8);
                for b in value {
                    for bit in (0..8).rev() {
                        out.push(if b >> bit & 1 == 1 { '1' } else { '0' });
                    }
                }
                out
            }
            ShowMode::Ascii => value
                .iter()
                .map(|b| {
                    if b.is_ascii_graphic() || *b == b' ' {
                        *b as char
                    } else {
                        '.'
                    }
                })
                .collect(),
        }
    }
}

/// Lower-case hex rendering; a positive `group` splits the bytes into
/// separator-joined chunks (a MAC with group 1 and ":" reads as usual),
/// otherwise the value gets a plain `0x` prefix.
fn hex_show(value: &[u8], group: usize, separator: &str) -> String {
    use std::fmt::Write as _;

    if group == 0 || separator.is_empty() {
        let mut out = String::with_capacity(2 + value.len() * 2);
        out.push_str("0x");
        for b in value {
            let _ = write!(out, "{b:02x}");
        }
        return out;
    }

    value
        .chunks(group)
        .map(|chunk| {
            let mut part = String::with_capacity(chunk.len() * 2);
            for b in chunk {
                let _ = write!(part, "{b:02x}");
            }
            part
        })
        .join(separator)
}

/// Locate a token or regex terminator inside `region`; returns the match
/// start and length.
fn find_terminator(terminator: &Terminator, region: &[u8]) -> Option<(usize, usize)> {
    match terminator {
        Terminator::Token(token) => {
            if token.is_empty() || region.len() < token.len() {
                return None;
            }
            region
                .windows(token.len())
                .position(|window| window == &token[..])
                .map(|start| (start, token.len()))
        }
        Terminator::Regex(pattern) => pattern.find(region).map(|(s, e)| (s, e - s)),
    }
}

/// Length of the first line and of its terminator (LF or CRLF).
fn split_line(region: &[u8]) -> (usize, usize) {
    match region.iter().position(|b| *b == b'\n') {
        None => (region.len(), 0),
        Some(lf) => {
            if lf > 0 && region[lf - 1] == b'\r' {
                (lf - 1, 2)
            } else {
                (lf, 1)
            }
        }
    }
}
