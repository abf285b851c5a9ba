// SPDX-License-Identifier: MIT

//! Bounded-subset AML tree engine.
//!
//! Parses a definition block (DSDT) far enough to resolve named device
//! resources: scopes, devices, methods, name objects and their attached
//! buffers. Anything else is preserved as an opaque byte run bounded by the
//! enclosing package, so an unmodified tree re-serializes byte-identically.
//! This is not an AML interpreter; it only edits the known-shape nodes the
//! platform drivers care about.

pub mod resource;

use crate::acpi::{table_checksum, SdtHeader, SDT_CHECKSUM_OFFSET, SDT_HEADER_LEN};
use crate::memory::MemoryImage;
use crate::{Error, Result};
use derivative::Derivative;
use log::trace;

const ZERO_OP: u8 = 0x00;
const ONE_OP: u8 = 0x01;
const NAME_OP: u8 = 0x08;
const BYTE_PREFIX: u8 = 0x0A;
const WORD_PREFIX: u8 = 0x0B;
const DWORD_PREFIX: u8 = 0x0C;
const STRING_PREFIX: u8 = 0x0D;
const QWORD_PREFIX: u8 = 0x0E;
const SCOPE_OP: u8 = 0x10;
const BUFFER_OP: u8 = 0x11;
const PACKAGE_OP: u8 = 0x12;
const METHOD_OP: u8 = 0x14;
const DUAL_NAME_PREFIX: u8 = 0x2E;
const MULTI_NAME_PREFIX: u8 = 0x2F;
const EXT_OP_PREFIX: u8 = 0x5B;
const ROOT_CHAR: u8 = 0x5C;
const PARENT_PREFIX_CHAR: u8 = 0x5E;
const ONES_OP: u8 = 0xFF;

const EXT_OP_REGION_OP: u8 = 0x80;
const EXT_FIELD_OP: u8 = 0x81;
const EXT_DEVICE_OP: u8 = 0x82;
const EXT_PROCESSOR_OP: u8 = 0x83;

/// Opaque handle to a node inside an [`AmlTree`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Root,
    Scope,
    Device,
    Method,
    Name,
    Buffer,
    Integer,
    String,
    /// Raw payload bytes, e.g. a buffer's byte list or a name string.
    Data,
    /// Unparsed construct kept verbatim for re-serialization.
    Opaque,
}

#[derive(Derivative, Clone)]
#[derivative(Debug)]
struct AmlNode {
    kind: NodeKind,
    parent: Option<NodeId>,
    /// Raw NameString bytes as they appeared in the block.
    name_raw: Vec<u8>,
    /// Decoded name segments, in declaration order.
    segs: Vec<[u8; 4]>,
    fixed: Vec<NodeId>,
    variable: Vec<NodeId>,
    #[derivative(Debug = "ignore")]
    data: Vec<u8>,
    value: u64,
}

impl AmlNode {
    fn new(kind: NodeKind, parent: Option<NodeId>) -> Self {
        Self {
            kind,
            parent,
            name_raw: Vec::new(),
            segs: Vec::new(),
            fixed: Vec::new(),
            variable: Vec::new(),
            data: Vec::new(),
            value: 0,
        }
    }
}

/// Parsed, mutable in-memory form of a definition block.
#[derive(Debug, Clone)]
pub struct AmlTree {
    header_raw: Vec<u8>,
    nodes: Vec<AmlNode>,
    root: NodeId,
}

impl AmlTree {
    /// Parse a definition block (header included). The declared header
    /// length bounds the parse; trailing bytes past it are ignored.
    pub fn parse(block: &[u8]) -> Result<AmlTree> {
        if block.len() < SDT_HEADER_LEN {
            return Err(Error::InvalidFormat(format!(
                "definition block of {} bytes is shorter than a table header",
                block.len()
            )));
        }
        let header: SdtHeader = MemoryImage::new(0, block[..SDT_HEADER_LEN].to_vec())
            .read_struct(0)?;
        let declared = header.length as usize;
        if declared < SDT_HEADER_LEN || declared > block.len() {
            return Err(Error::InvalidFormat(format!(
                "definition block declares {} bytes, {} available",
                declared,
                block.len()
            )));
        }

        let mut tree = AmlTree {
            header_raw: block[..SDT_HEADER_LEN].to_vec(),
            nodes: vec![AmlNode::new(NodeKind::Root, None)],
            root: NodeId(0),
        };
        let mut parser = Parser {
            data: &block[..declared],
            pos: SDT_HEADER_LEN,
        };
        let root = tree.root;
        parser.parse_term_list(&mut tree, root, declared)?;
        Ok(tree)
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    fn node(&self, id: NodeId) -> &AmlNode {
        &self.nodes[id.0]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut AmlNode {
        &mut self.nodes[id.0]
    }

    fn alloc(&mut self, node: AmlNode) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }

    pub fn kind(&self, id: NodeId) -> NodeKind {
        self.node(id).kind
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).parent
    }

    /// Positional fixed-argument access (argument 0 of a named node is its
    /// name string; argument 1 of a `Name` node is the attached object).
    pub fn fixed_arg(&self, id: NodeId, index: usize) -> Option<NodeId> {
        self.node(id).fixed.get(index).copied()
    }

    /// Positional access to the variable-argument list.
    pub fn variable_arg(&self, id: NodeId, index: usize) -> Option<NodeId> {
        self.node(id).variable.get(index).copied()
    }

    /// Raw payload bytes of a data node.
    pub fn data(&self, id: NodeId) -> Option<&[u8]> {
        match self.node(id).kind {
            NodeKind::Data | NodeKind::Opaque => Some(&self.node(id).data),
            _ => None,
        }
    }

    /// Mutable access to a data node's payload. In-place edits are visible
    /// immediately; callers that change the byte count must follow up with
    /// [`AmlTree::update_node`] to keep the length bookkeeping consistent.
    pub fn data_mut(&mut self, id: NodeId) -> Option<&mut [u8]> {
        match self.node(id).kind {
            NodeKind::Data | NodeKind::Opaque => Some(&mut self.node_mut(id).data),
            _ => None,
        }
    }

    pub fn integer_value(&self, id: NodeId) -> Option<u64> {
        match self.node(id).kind {
            NodeKind::Integer => Some(self.node(id).value),
            _ => None,
        }
    }

    /// Hierarchical name resolution for paths like `\_SB_.PCI0._CRS.RBUF`.
    pub fn find_node(&self, path: &str) -> Option<NodeId> {
        let segs: Vec<[u8; 4]> = path
            .trim_start_matches('\\')
            .split('.')
            .filter(|seg| !seg.is_empty())
            .map(seg_from_str)
            .collect::<Option<Vec<_>>>()?;
        self.resolve(self.root, &segs)
    }

    fn resolve(&self, from: NodeId, segs: &[[u8; 4]]) -> Option<NodeId> {
        if segs.is_empty() {
            return Some(from);
        }
        for child in &self.node(from).variable {
            let child_segs = &self.node(*child).segs;
            if !child_segs.is_empty()
                && segs.len() >= child_segs.len()
                && segs[..child_segs.len()] == child_segs[..]
            {
                if let Some(found) = self.resolve(*child, &segs[child_segs.len()..]) {
                    return Some(found);
                }
            }
        }
        None
    }

    /// Replace the payload of a buffer's data node and keep the buffer's
    /// size argument consistent with the new byte count.
    pub fn update_node(&mut self, id: NodeId, bytes: &[u8]) -> Result<()> {
        if self.node(id).kind != NodeKind::Data {
            return Err(Error::InvalidFormat(format!(
                "node {:?} is not a data node",
                self.node(id).kind
            )));
        }
        let buffer = self
            .node(id)
            .parent
            .filter(|parent| self.node(*parent).kind == NodeKind::Buffer)
            .ok_or_else(|| {
                Error::InvalidFormat("data node is not attached to a buffer".to_string())
            })?;

        self.node_mut(id).data = bytes.to_vec();

        let byte_list_len: usize = self
            .node(buffer)
            .variable
            .iter()
            .map(|child| self.node(*child).data.len())
            .sum();
        if let Some(size_arg) = self.fixed_arg(buffer, 0) {
            if self.node(size_arg).kind == NodeKind::Integer
                && self.node(size_arg).value != byte_list_len as u64
            {
                let node = self.node_mut(size_arg);
                node.value = byte_list_len as u64;
                node.data = encode_integer(byte_list_len as u64);
            }
        }
        Ok(())
    }

    /// Serialize the whole tree back into a definition block with
    /// recomputed package lengths, header length and checksum.
    pub fn write_tree(&self) -> Result<Vec<u8>> {
        let mut out = self.header_raw.clone();
        for child in &self.node(self.root).variable {
            self.serialize_node(*child, &mut out)?;
        }
        let length = out.len() as u32;
        out[4..8].copy_from_slice(&length.to_le_bytes());
        out[SDT_CHECKSUM_OFFSET as usize] = 0;
        out[SDT_CHECKSUM_OFFSET as usize] = table_checksum(&out);
        Ok(out)
    }

    fn serialize_node(&self, id: NodeId, out: &mut Vec<u8>) -> Result<()> {
        let node = self.node(id);
        match node.kind {
            NodeKind::Root => Err(Error::InvalidFormat(
                "root node cannot be serialized as a term".to_string(),
            )),
            NodeKind::Scope => {
                out.push(SCOPE_OP);
                self.serialize_package(node, None, out)
            }
            NodeKind::Device => {
                out.extend_from_slice(&[EXT_OP_PREFIX, EXT_DEVICE_OP]);
                self.serialize_package(node, None, out)
            }
            NodeKind::Method => {
                out.push(METHOD_OP);
                self.serialize_package(node, Some(node.data.as_slice()), out)
            }
            NodeKind::Name => {
                out.push(NAME_OP);
                out.extend_from_slice(&node.name_raw);
                let object = node.fixed.get(1).ok_or_else(|| {
                    Error::InvalidFormat("name node without an object".to_string())
                })?;
                self.serialize_node(*object, out)
            }
            NodeKind::Buffer => {
                let mut payload = Vec::new();
                if let Some(size_arg) = node.fixed.first() {
                    payload.extend_from_slice(&self.node(*size_arg).data);
                }
                for child in &node.variable {
                    payload.extend_from_slice(&self.node(*child).data);
                }
                out.push(BUFFER_OP);
                out.extend_from_slice(&pkg_length_for_payload(payload.len()));
                out.extend_from_slice(&payload);
                Ok(())
            }
            NodeKind::Integer | NodeKind::String | NodeKind::Data | NodeKind::Opaque => {
                out.extend_from_slice(&node.data);
                Ok(())
            }
        }
    }

    /// Emit `PkgLength NameString [extra] children` for a package-carrying op
    /// whose opcode bytes are already written.
    fn serialize_package(
        &self,
        node: &AmlNode,
        extra: Option<&[u8]>,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&node.name_raw);
        if let Some(extra) = extra {
            payload.extend_from_slice(extra);
        }
        for child in &node.variable {
            self.serialize_node(*child, &mut payload)?;
        }
        out.extend_from_slice(&pkg_length_for_payload(payload.len()));
        out.extend_from_slice(&payload);
        Ok(())
    }
}

fn seg_from_str(seg: &str) -> Option<[u8; 4]> {
    if seg.is_empty() || seg.len() > 4 || !seg.is_ascii() {
        return None;
    }
    let mut out = [b'_'; 4];
    out[..seg.len()].copy_from_slice(seg.as_bytes());
    Some(out)
}

fn is_lead_name_char(byte: u8) -> bool {
    byte == b'_' || byte.is_ascii_uppercase()
}

fn is_name_char(byte: u8) -> bool {
    is_lead_name_char(byte) || byte.is_ascii_digit()
}

/// Raw PkgLength value encoding. The value includes the PkgLength field
/// itself but not the opcode byte(s).
fn encode_pkg_length(len: usize) -> Vec<u8> {
    if len <= 0x3F {
        return vec![len as u8];
    }
    if len <= 0x0FFF {
        return vec![((len & 0x0F) as u8) | 0x40, (len >> 4) as u8];
    }
    if len <= 0x0F_FFFF {
        return vec![
            ((len & 0x0F) as u8) | 0x80,
            (len >> 4) as u8,
            (len >> 12) as u8,
        ];
    }
    vec![
        ((len & 0x0F) as u8) | 0xC0,
        (len >> 4) as u8,
        (len >> 12) as u8,
        (len >> 20) as u8,
    ]
}

/// PkgLength for a payload of `payload_len` bytes. Self-referential (the
/// encoded value counts its own bytes); resolved by iterating, which
/// converges within the 4-byte encoding bound.
fn pkg_length_for_payload(payload_len: usize) -> Vec<u8> {
    let mut total_len = payload_len + 1;
    loop {
        let encoded = encode_pkg_length(total_len);
        let new_total_len = payload_len + encoded.len();
        if new_total_len == total_len {
            return encoded;
        }
        total_len = new_total_len;
    }
}

fn encode_integer(value: u64) -> Vec<u8> {
    match value {
        0 => vec![ZERO_OP],
        1 => vec![ONE_OP],
        v if v <= u8::MAX as u64 => vec![BYTE_PREFIX, v as u8],
        v if v <= u16::MAX as u64 => {
            let mut out = vec![WORD_PREFIX];
            out.extend_from_slice(&(v as u16).to_le_bytes());
            out
        }
        v if v <= u32::MAX as u64 => {
            let mut out = vec![DWORD_PREFIX];
            out.extend_from_slice(&(v as u32).to_le_bytes());
            out
        }
        v => {
            let mut out = vec![QWORD_PREFIX];
            out.extend_from_slice(&v.to_le_bytes());
            out
        }
    }
}

struct Parser<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.pos + len > self.data.len() {
            return Err(Error::InvalidFormat(format!(
                "AML stream truncated at offset {}",
                self.pos
            )));
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn take_byte(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// Returns the absolute end offset of the package whose PkgLength starts
    /// at the current position.
    fn parse_pkg_end(&mut self) -> Result<usize> {
        let start = self.pos;
        let lead = self.take_byte()?;
        let byte_count = (lead >> 6) as usize;
        let mut value = if byte_count == 0 {
            (lead & 0x3F) as usize
        } else {
            (lead & 0x0F) as usize
        };
        for index in 0..byte_count {
            let byte = self.take_byte()? as usize;
            value |= byte << (4 + index * 8);
        }
        let end = start + value;
        if value == 0 || end > self.data.len() {
            return Err(Error::InvalidFormat(format!(
                "invalid PkgLength {} at offset {}",
                value, start
            )));
        }
        Ok(end)
    }

    /// NameString := {RootChar|ParentPrefix*} (NameSeg | DualName | MultiName | Null)
    fn parse_name_string(&mut self) -> Result<(Vec<u8>, Vec<[u8; 4]>)> {
        let start = self.pos;
        while matches!(self.peek(), Some(ROOT_CHAR) | Some(PARENT_PREFIX_CHAR)) {
            self.take_byte()?;
        }
        let seg_count = match self.peek() {
            Some(0x00) => {
                self.take_byte()?;
                0
            }
            Some(DUAL_NAME_PREFIX) => {
                self.take_byte()?;
                2
            }
            Some(MULTI_NAME_PREFIX) => {
                self.take_byte()?;
                self.take_byte()? as usize
            }
            _ => 1,
        };
        let mut segs = Vec::with_capacity(seg_count);
        for _ in 0..seg_count {
            let seg = self.take(4)?;
            if !is_lead_name_char(seg[0]) || !seg[1..].iter().all(|b| is_name_char(*b)) {
                return Err(Error::InvalidFormat(format!(
                    "invalid NameSeg {:02X?} at offset {}",
                    seg,
                    self.pos - 4
                )));
            }
            segs.push([seg[0], seg[1], seg[2], seg[3]]);
        }
        Ok((self.data[start..self.pos].to_vec(), segs))
    }

    fn parse_term_list(&mut self, tree: &mut AmlTree, parent: NodeId, end: usize) -> Result<()> {
        while self.pos < end {
            let opcode_pos = self.pos;
            match self.take_byte()? {
                NAME_OP => {
                    let (name_raw, segs) = self.parse_name_string()?;
                    let id = tree.alloc(AmlNode {
                        name_raw: name_raw.clone(),
                        segs,
                        ..AmlNode::new(NodeKind::Name, Some(parent))
                    });
                    let name_arg = tree.alloc(AmlNode {
                        data: name_raw,
                        ..AmlNode::new(NodeKind::Data, Some(id))
                    });
                    let object = self.parse_data_ref_object(tree, id)?;
                    tree.node_mut(id).fixed = vec![name_arg, object];
                    tree.node_mut(parent).variable.push(id);
                }
                SCOPE_OP => {
                    let pkg_end = self.parse_pkg_end()?;
                    let id = self.parse_named_package(tree, parent, NodeKind::Scope)?;
                    self.parse_term_list(tree, id, pkg_end)?;
                }
                METHOD_OP => {
                    let pkg_end = self.parse_pkg_end()?;
                    let id = self.parse_named_package(tree, parent, NodeKind::Method)?;
                    let flags = self.take_byte()?;
                    tree.node_mut(id).data = vec![flags];
                    self.parse_term_list(tree, id, pkg_end)?;
                }
                EXT_OP_PREFIX => match self.take_byte()? {
                    EXT_DEVICE_OP => {
                        let pkg_end = self.parse_pkg_end()?;
                        let id = self.parse_named_package(tree, parent, NodeKind::Device)?;
                        self.parse_term_list(tree, id, pkg_end)?;
                    }
                    EXT_FIELD_OP | EXT_PROCESSOR_OP => {
                        // Package-length-delimited constructs we do not edit.
                        let pkg_end = self.parse_pkg_end()?;
                        self.pos = pkg_end;
                        self.opaque(tree, parent, opcode_pos);
                    }
                    EXT_OP_REGION_OP => {
                        // No PkgLength: NameString, RegionSpace, two TermArgs.
                        self.parse_name_string()?;
                        self.take_byte()?;
                        self.parse_integer()?;
                        self.parse_integer()?;
                        self.opaque(tree, parent, opcode_pos);
                    }
                    ext => {
                        trace!(
                            "Unhandled extended opcode 0x5B 0x{:02X} at offset {}",
                            ext,
                            opcode_pos
                        );
                        self.pos = end;
                        self.opaque(tree, parent, opcode_pos);
                    }
                },
                opcode => {
                    // Anything else (Return, Store, If, ...) is preserved
                    // verbatim up to the end of the enclosing package.
                    trace!("Unhandled opcode 0x{:02X} at offset {}", opcode, opcode_pos);
                    self.pos = end;
                    self.opaque(tree, parent, opcode_pos);
                }
            }
        }
        Ok(())
    }

    fn parse_named_package(
        &mut self,
        tree: &mut AmlTree,
        parent: NodeId,
        kind: NodeKind,
    ) -> Result<NodeId> {
        let (name_raw, segs) = self.parse_name_string()?;
        let id = tree.alloc(AmlNode {
            name_raw: name_raw.clone(),
            segs,
            ..AmlNode::new(kind, Some(parent))
        });
        let name_arg = tree.alloc(AmlNode {
            data: name_raw,
            ..AmlNode::new(NodeKind::Data, Some(id))
        });
        tree.node_mut(id).fixed = vec![name_arg];
        tree.node_mut(parent).variable.push(id);
        Ok(id)
    }

    fn parse_data_ref_object(&mut self, tree: &mut AmlTree, parent: NodeId) -> Result<NodeId> {
        let start = self.pos;
        match self.peek() {
            Some(BUFFER_OP) => {
                self.take_byte()?;
                let pkg_end = self.parse_pkg_end()?;
                let id = tree.alloc(AmlNode::new(NodeKind::Buffer, Some(parent)));
                let (size_raw, size_value) = self.parse_integer()?;
                let size_arg = tree.alloc(AmlNode {
                    data: size_raw,
                    value: size_value,
                    ..AmlNode::new(NodeKind::Integer, Some(id))
                });
                tree.node_mut(id).fixed = vec![size_arg];
                if self.pos < pkg_end {
                    let byte_list = self.take(pkg_end - self.pos)?.to_vec();
                    let data = tree.alloc(AmlNode {
                        data: byte_list,
                        ..AmlNode::new(NodeKind::Data, Some(id))
                    });
                    tree.node_mut(id).variable.push(data);
                }
                Ok(id)
            }
            Some(PACKAGE_OP) => {
                self.take_byte()?;
                let pkg_end = self.parse_pkg_end()?;
                self.pos = pkg_end;
                Ok(tree.alloc(AmlNode {
                    data: self.data[start..pkg_end].to_vec(),
                    ..AmlNode::new(NodeKind::Opaque, Some(parent))
                }))
            }
            Some(STRING_PREFIX) => {
                self.take_byte()?;
                while self.take_byte()? != 0x00 {}
                Ok(tree.alloc(AmlNode {
                    data: self.data[start..self.pos].to_vec(),
                    ..AmlNode::new(NodeKind::String, Some(parent))
                }))
            }
            _ => {
                let (raw, value) = self.parse_integer()?;
                Ok(tree.alloc(AmlNode {
                    data: raw,
                    value,
                    ..AmlNode::new(NodeKind::Integer, Some(parent))
                }))
            }
        }
    }

    fn parse_integer(&mut self) -> Result<(Vec<u8>, u64)> {
        let start = self.pos;
        let value = match self.take_byte()? {
            ZERO_OP => 0,
            ONE_OP => 1,
            ONES_OP => u64::MAX,
            BYTE_PREFIX => self.take_byte()? as u64,
            WORD_PREFIX => {
                let bytes = self.take(2)?;
                u16::from_le_bytes([bytes[0], bytes[1]]) as u64
            }
            DWORD_PREFIX => {
                let bytes = self.take(4)?;
                u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as u64
            }
            QWORD_PREFIX => {
                let bytes = self.take(8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                u64::from_le_bytes(raw)
            }
            opcode => {
                return Err(Error::InvalidFormat(format!(
                    "expected integer constant, found opcode 0x{:02X} at offset {}",
                    opcode, start
                )))
            }
        };
        Ok((self.data[start..self.pos].to_vec(), value))
    }

    fn opaque(&mut self, tree: &mut AmlTree, parent: NodeId, start: usize) {
        if self.pos <= start {
            return;
        }
        let id = tree.alloc(AmlNode {
            data: self.data[start..self.pos].to_vec(),
            ..AmlNode::new(NodeKind::Opaque, Some(parent))
        });
        tree.node_mut(parent).variable.push(id);
    }
}
