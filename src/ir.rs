// Copyright 2024 Cornell University
// released under MIT License

use cranelift_entity::{entity_impl, PrimaryMap, SecondaryMap};
use rustc_hash::FxHashMap;
use std::ops::Index;

/// Source location of a block: `(start, end, fileid)`.
pub type SourceLoc = (usize, usize, usize);

#[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct BlockId(u32);
entity_impl!(BlockId, "block");

#[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct PortId(u32);
entity_impl!(PortId, "port");

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum Dir {
    In,
    Out,
}

impl std::fmt::Display for Dir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dir::In => write!(f, "in"),
            Dir::Out => write!(f, "out"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Port {
    owner: BlockId,
    dir: Dir,
    /// zero-based position among the owner's ports of the same direction
    index: u32,
    /// producing output port, only ever set on input ports
    source: Option<PortId>,
    sinks: Vec<PortId>,
}

impl Port {
    pub fn owner(&self) -> BlockId {
        self.owner
    }

    pub fn dir(&self) -> Dir {
        self.dir
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn source(&self) -> Option<PortId> {
        self.source
    }

    pub fn sinks(&self) -> &[PortId] {
        &self.sinks
    }
}

/// Declaration-ordered parameter map of a block.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Params {
    entries: Vec<(String, String)>,
}

impl Params {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Sets `key`, keeping the position of an earlier declaration.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    type_name: String,
    name: String,
    inputs: Vec<PortId>,
    outputs: Vec<PortId>,
    pub params: Params,
    parent: Option<BlockId>,
    children: Vec<BlockId>,
    pub library_ref: Option<String>,
}

impl Block {
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// local name, unique within the enclosing scope
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inputs(&self) -> &[PortId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[PortId] {
        &self.outputs
    }

    pub fn parent(&self) -> Option<BlockId> {
        self.parent
    }

    pub fn children(&self) -> &[BlockId] {
        &self.children
    }
}

/// A resolved block/port/line graph as handed over by a model loader.
#[derive(Debug, Clone, Default)]
pub struct Diagram {
    pub name: String,
    blocks: PrimaryMap<BlockId, Block>,
    ports: PrimaryMap<PortId, Port>,
    top: Vec<BlockId>,
    by_name: FxHashMap<String, BlockId>,
    locations: SecondaryMap<BlockId, Option<SourceLoc>>,
}

impl Diagram {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// add a new block, either at the top level or nested inside `parent`
    pub fn add_block(
        &mut self,
        type_name: impl Into<String>,
        name: impl Into<String>,
        parent: Option<BlockId>,
    ) -> BlockId {
        let block = Block {
            type_name: type_name.into(),
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            params: Params::default(),
            parent,
            children: Vec::new(),
            library_ref: None,
        };
        let lookup_name = match parent {
            Some(p) => format!("{}/{}", self.full_name(p), block.name),
            None => block.name.clone(),
        };
        assert!(
            !self.by_name.contains_key(&lookup_name),
            "we already have a block named {lookup_name}!"
        );
        let id = self.blocks.push(block);
        self.by_name.insert(lookup_name, id);
        match parent {
            Some(p) => self.blocks[p].children.push(id),
            None => self.top.push(id),
        }
        id
    }

    pub fn add_input(&mut self, block: BlockId) -> PortId {
        let index = self.blocks[block].inputs.len() as u32;
        let id = self.ports.push(Port {
            owner: block,
            dir: Dir::In,
            index,
            source: None,
            sinks: Vec::new(),
        });
        self.blocks[block].inputs.push(id);
        id
    }

    pub fn add_output(&mut self, block: BlockId) -> PortId {
        let index = self.blocks[block].outputs.len() as u32;
        let id = self.ports.push(Port {
            owner: block,
            dir: Dir::Out,
            index,
            source: None,
            sinks: Vec::new(),
        });
        self.blocks[block].outputs.push(id);
        id
    }

    /// Adds `inputs` input and `outputs` output ports to `block`.
    pub fn add_ports(&mut self, block: BlockId, inputs: usize, outputs: usize) {
        for _ in 0..inputs {
            self.add_input(block);
        }
        for _ in 0..outputs {
            self.add_output(block);
        }
    }

    /// Draws a line from an output port to an input port.
    pub fn connect(&mut self, src: PortId, dst: PortId) {
        assert_eq!(self.ports[src].dir, Dir::Out, "lines start at output ports");
        assert_eq!(self.ports[dst].dir, Dir::In, "lines end at input ports");
        assert!(
            self.ports[dst].source.is_none(),
            "input {dst} already has a producer"
        );
        self.ports[dst].source = Some(src);
        self.ports[src].sinks.push(dst);
    }

    pub fn set_param(&mut self, block: BlockId, key: impl Into<String>, value: impl Into<String>) {
        self.blocks[block].params.insert(key, value);
    }

    /// Marks `block` as an instance of the library element `name`.
    pub fn set_library_ref(&mut self, block: BlockId, name: impl Into<String>) {
        self.blocks[block].library_ref = Some(name.into());
    }

    pub fn set_location(&mut self, block: BlockId, start: usize, end: usize, fileid: usize) {
        self.locations[block] = Some((start, end, fileid));
    }

    pub fn location(&self, block: BlockId) -> Option<SourceLoc> {
        self.locations.get(block).copied().flatten()
    }

    pub fn block_ids(&self) -> Vec<BlockId> {
        self.blocks.keys().collect()
    }

    /// Blocks declared directly in the given scope (`None` is the top level), in declaration order.
    pub fn scope(&self, parent: Option<BlockId>) -> &[BlockId] {
        match parent {
            Some(p) => &self.blocks[p].children,
            None => &self.top,
        }
    }

    pub fn block_by_name(&self, path: &str) -> Option<BlockId> {
        self.by_name.get(path).copied()
    }

    /// full hierarchical name, scopes separated by `/`
    pub fn full_name(&self, block: BlockId) -> String {
        let mut name = self.blocks[block].name.clone();
        let mut parent = self.blocks[block].parent;
        while let Some(p) = parent {
            name = format!("{}/{name}", self.blocks[p].name);
            parent = self.blocks[p].parent;
        }
        name
    }

    /// Output port feeding input `index` of `block`, if connected.
    pub fn feeder(&self, block: BlockId, index: usize) -> Option<PortId> {
        let port = *self.blocks[block].inputs.get(index)?;
        self.ports[port].source
    }

    /// Blocks consuming any output of `block`, each listed once, in fan-out order.
    pub fn successors(&self, block: BlockId) -> Vec<BlockId> {
        let mut out: Vec<BlockId> = Vec::new();
        for port in &self.blocks[block].outputs {
            for sink in &self.ports[*port].sinks {
                let owner = self.ports[*sink].owner;
                if !out.contains(&owner) {
                    out.push(owner);
                }
            }
        }
        out
    }
}

impl Index<BlockId> for Diagram {
    type Output = Block;

    fn index(&self, index: BlockId) -> &Self::Output {
        &self.blocks[index]
    }
}

impl Index<&BlockId> for Diagram {
    type Output = Block;

    fn index(&self, index: &BlockId) -> &Self::Output {
        &self.blocks[*index]
    }
}

impl Index<PortId> for Diagram {
    type Output = Port;

    fn index(&self, index: PortId) -> &Self::Output {
        &self.ports[index]
    }
}

impl Index<&PortId> for Diagram {
    type Output = Port;

    fn index(&self, index: &PortId) -> &Self::Output {
        &self.ports[*index]
    }
}
