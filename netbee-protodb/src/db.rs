//! The frozen protocol database and its walk helpers.

use crate::node::{Node, NodeData, NodeId};

/// NetPDL language version this library understands.
pub const SUPPORTED_NETPDL_MAJOR: u32 = 0;
pub const SUPPORTED_NETPDL_MINOR: u32 = 2;

/// Maximum element nesting the loader accepts before failing the load.
pub const MAX_NESTING_LEVELS: usize = 30;

/// Names the language fixes for the two mandatory protocols and the
/// optional padding protocol.
pub const STARTPROTO_NAME: &str = "startproto";
pub const DEFAULTPROTO_NAME: &str = "defaultproto";
pub const PADDINGPROTO_NAME: &str = "etherpadding";

/// What to load from the database document.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LoadFlags {
    /// Skip visualization primitives (show templates, summaries).
    pub minimal: bool,
    /// Treat structural-schema violations as hard failures.
    pub validate: bool,
}

impl LoadFlags {
    pub const FULL: LoadFlags = LoadFlags {
        minimal: false,
        validate: false,
    };

    pub const MINIMAL: LoadFlags = LoadFlags {
        minimal: true,
        validate: false,
    };

    pub const VALIDATE: LoadFlags = LoadFlags {
        minimal: false,
        validate: true,
    };
}

impl Default for LoadFlags {
    fn default() -> Self {
        LoadFlags::FULL
    }
}

/// Database metadata read off the root element.
#[derive(Debug, Clone, Default)]
pub struct DatabaseInfo {
    pub name: String,
    pub creator: String,
    pub date: String,
    pub version_major: u32,
    pub version_minor: u32,
}

/// An organized, immutable NetPDL protocol description.
///
/// All cross references are indices into the single node arena, so the
/// whole description is `Send + Sync` and can back any number of
/// decoders at once.
#[derive(Debug)]
pub struct ProtocolDatabase {
    pub(crate) nodes: Vec<Node>,
    pub(crate) info: DatabaseInfo,
    pub(crate) flags: LoadFlags,
    /// Protocols in declaration order; position is the protocol index
    /// expressions resolve `#name` references to.
    pub(crate) protos: Vec<NodeId>,
    pub(crate) start_proto: usize,
    pub(crate) default_proto: usize,
    pub(crate) padding_proto: Option<usize>,
}

impl ProtocolDatabase {
    pub fn info(&self) -> &DatabaseInfo {
        &self.info
    }

    pub fn flags(&self) -> LoadFlags {
        self.flags
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        if id.is_none() {
            None
        } else {
            self.nodes.get(id.index())
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len() - 1
    }

    /// Iterate over every node id in arena order (sentinel excluded).
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (1..self.nodes.len() as u32).map(NodeId)
    }

    /// Children of `id` in document order.
    pub fn children(&self, id: NodeId) -> ChildIter<'_> {
        ChildIter {
            db: self,
            next: self.node(id).links.first_child,
        }
    }

    /// Protocols in declaration order.
    pub fn protocols(&self) -> impl Iterator<Item = (usize, &Node)> + '_ {
        self.protos
            .iter()
            .enumerate()
            .map(move |(i, id)| (i, self.node(*id)))
    }

    pub fn proto_count(&self) -> usize {
        self.protos.len()
    }

    pub fn proto_node(&self, index: usize) -> &Node {
        self.node(self.protos[index])
    }

    pub fn proto_node_id(&self, index: usize) -> NodeId {
        self.protos[index]
    }

    pub fn proto_name(&self, index: usize) -> &str {
        match &self.proto_node(index).data {
            NodeData::Proto { name, .. } => name,
            _ => unreachable!("protocol list points at non-proto node"),
        }
    }

    /// Index of the protocol with this name, if declared.
    pub fn proto_index(&self, name: &str) -> Option<usize> {
        self.protos
            .iter()
            .position(|id| matches!(&self.node(*id).data, NodeData::Proto { name: n, .. } if n == name))
    }

    pub fn start_proto(&self) -> usize {
        self.start_proto
    }

    pub fn default_proto(&self) -> usize {
        self.default_proto
    }

    pub fn padding_proto(&self) -> Option<usize> {
        self.padding_proto
    }

    /// Count of nodes whose discriminant label equals `tag`; handy for
    /// observational equality between loads.
    pub fn count_tag(&self, tag: &str) -> usize {
        self.nodes[1..].iter().filter(|n| n.data.tag() == tag).count()
    }
}

pub struct ChildIter<'a> {
    db: &'a ProtocolDatabase,
    next: NodeId,
}

impl<'a> Iterator for ChildIter<'a> {
    type Item = (NodeId, &'a Node);

    fn next(&mut self) -> Option<Self::Item> {
        if self.next.is_none() {
            return None;
        }
        let id = self.next;
        let node = self.db.node(id);
        self.next = node.links.next_sibling;
        Some((id, node))
    }
}
