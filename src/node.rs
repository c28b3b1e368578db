//! In-memory node representations and their page codecs.
//!
//! A page holds exactly one of five node kinds: row-tree leaf, row-tree
//! internal, index, overflow, or free. The codec is symmetric: unmarshalling
//! a marshalled node yields an equal node. Decoding dispatches on the node
//! area's leading bytes; unknown tags and length overruns are corruption.

use crate::codec;
use crate::config::{
    INDEX_HEADER_SIZE, INTERNAL_CELL_SIZE, INTERNAL_HEADER_SIZE, LEAF_CELL_HEADER_SIZE,
    LEAF_HEADER_SIZE, MAX_OVERFLOW_PAGE_DATA, NODE_AREA_SIZE, OVERFLOW_PAGE_TAG,
    RIGHT_CHILD_UNSET,
};
use crate::error::{Error, Result};
use crate::index::key::IndexKey;
use crate::schema::ColumnKind;
use crate::types::PageIndex;

/// One record of a row-tree leaf.
#[derive(Clone, Debug, PartialEq)]
pub struct LeafCell {
    pub key: u64,
    pub null_bitmask: u64,
    pub payload: Vec<u8>,
}

/// Row-tree leaf: cells sorted ascending by key, threaded by `next_leaf`.
#[derive(Clone, Debug, PartialEq)]
pub struct LeafNode {
    pub is_root: bool,
    pub parent: PageIndex,
    /// Next leaf in key order; 0 on the rightmost leaf.
    pub next_leaf: PageIndex,
    pub row_size: usize,
    pub cells: Vec<LeafCell>,
}

impl LeafNode {
    pub fn empty(row_size: usize) -> Self {
        Self {
            is_root: false,
            parent: PageIndex(0),
            next_leaf: PageIndex(0),
            row_size,
            cells: Vec::new(),
        }
    }

    /// Binary search for `key`: `Ok(i)` when present, `Err(i)` at the
    /// insertion position.
    pub fn find(&self, key: u64) -> std::result::Result<usize, usize> {
        self.cells.binary_search_by(|c| c.key.cmp(&key))
    }

    pub fn first_key(&self) -> Option<u64> {
        self.cells.first().map(|c| c.key)
    }

    pub fn last_key(&self) -> Option<u64> {
        self.cells.last().map(|c| c.key)
    }
}

/// Separator cell of a row-tree internal node; all keys reachable through
/// `child` are ≤ `key`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InternalCell {
    pub key: u64,
    pub child: PageIndex,
}

/// Row-tree internal node.
#[derive(Clone, Debug, PartialEq)]
pub struct InternalNode {
    pub is_root: bool,
    pub parent: PageIndex,
    pub cells: Vec<InternalCell>,
    /// Child whose keys are greater than every cell key.
    pub right_child: Option<PageIndex>,
}

impl InternalNode {
    pub fn empty() -> Self {
        Self {
            is_root: false,
            parent: PageIndex(0),
            cells: Vec::new(),
            right_child: None,
        }
    }

    /// Child slot whose subtree may contain `key`: the first cell whose key
    /// is ≥ `key`, or the right-child slot.
    pub fn index_of_child(&self, key: u64) -> usize {
        self.cells.partition_point(|c| c.key < key)
    }

    /// All children in order, the right child last.
    pub fn child_slots(&self) -> Vec<PageIndex> {
        let mut slots: Vec<PageIndex> = self.cells.iter().map(|c| c.child).collect();
        if let Some(rc) = self.right_child {
            slots.push(rc);
        }
        slots
    }

    /// Child page at conceptual slot `i` (`cells.len()` is the right child).
    pub fn child_at(&self, i: usize) -> Result<PageIndex> {
        if i < self.cells.len() {
            Ok(self.cells[i].child)
        } else if i == self.cells.len() {
            self.right_child.ok_or_else(|| {
                Error::invariant("internal.child_at", "right child not set")
            })
        } else {
            Err(Error::invariant(
                "internal.child_at",
                format!("slot {} out of range for {} cells", i, self.cells.len()),
            ))
        }
    }

    /// Conceptual slot of the given child page.
    pub fn slot_of_child(&self, child: PageIndex) -> Result<usize> {
        if let Some(i) = self.cells.iter().position(|c| c.child == child) {
            return Ok(i);
        }
        if self.right_child == Some(child) {
            return Ok(self.cells.len());
        }
        Err(Error::invariant(
            "internal.slot_of_child",
            format!("page {} is not a child of this node", child),
        ))
    }

    /// Rebuild cells and right child from conceptual key/child arrays
    /// (`children.len() == keys.len() + 1`).
    pub fn set_slots(&mut self, keys: Vec<u64>, children: Vec<PageIndex>) -> Result<()> {
        if children.len() != keys.len() + 1 {
            return Err(Error::invariant(
                "internal.set_slots",
                format!("{} keys with {} children", keys.len(), children.len()),
            ));
        }
        self.right_child = Some(children[keys.len()]);
        self.cells = keys
            .into_iter()
            .zip(children)
            .map(|(key, child)| InternalCell { key, child })
            .collect();
        Ok(())
    }
}

/// One record of an index node: a typed key, the row it maps to, and (in
/// internal nodes) the subtree holding smaller keys.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexCell {
    pub key: IndexKey,
    pub row_id: u64,
    pub child: PageIndex,
}

/// Index node: a B-tree node over typed keys, leaf and internal in one shape.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexNode {
    pub is_root: bool,
    pub is_leaf: bool,
    pub parent: PageIndex,
    /// Serialized width of one key; varchar keys are null-padded to this.
    pub key_size: usize,
    pub cells: Vec<IndexCell>,
    pub right_child: Option<PageIndex>,
}

impl IndexNode {
    pub fn empty_leaf(key_size: usize) -> Self {
        Self {
            is_root: false,
            is_leaf: true,
            parent: PageIndex(0),
            key_size,
            cells: Vec::new(),
            right_child: None,
        }
    }

    pub fn find(&self, key: &IndexKey) -> std::result::Result<usize, usize> {
        self.cells.binary_search_by(|c| c.key.cmp(key))
    }

    /// All children in order, the right child last. Empty for leaves.
    pub fn child_slots(&self) -> Vec<PageIndex> {
        if self.is_leaf {
            return Vec::new();
        }
        let mut slots: Vec<PageIndex> = self.cells.iter().map(|c| c.child).collect();
        if let Some(rc) = self.right_child {
            slots.push(rc);
        }
        slots
    }

    pub fn child_at(&self, i: usize) -> Result<PageIndex> {
        if i < self.cells.len() {
            Ok(self.cells[i].child)
        } else if i == self.cells.len() {
            self.right_child.ok_or_else(|| {
                Error::invariant("index.child_at", "right child not set")
            })
        } else {
            Err(Error::invariant(
                "index.child_at",
                format!("slot {} out of range for {} cells", i, self.cells.len()),
            ))
        }
    }

    pub fn slot_of_child(&self, child: PageIndex) -> Result<usize> {
        if let Some(i) = self.cells.iter().position(|c| c.child == child) {
            return Ok(i);
        }
        if self.right_child == Some(child) {
            return Ok(self.cells.len());
        }
        Err(Error::invariant(
            "index.slot_of_child",
            format!("page {} is not a child of this node", child),
        ))
    }
}

/// Overflow page: one link of a spilled varchar chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OverflowNode {
    /// Next chain link; 0 terminates the chain.
    pub next: PageIndex,
    pub data: Vec<u8>,
}

impl OverflowNode {
    pub fn empty() -> Self {
        Self {
            next: PageIndex(0),
            data: Vec::new(),
        }
    }
}

/// Free page: one link of the free-list stack.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FreeNode {
    /// Next free page; 0 terminates the list.
    pub next_free_page: PageIndex,
}

/// The payload of a page: exactly one node kind.
#[derive(Clone, Debug, PartialEq)]
pub enum Node {
    Leaf(LeafNode),
    Internal(InternalNode),
    Index(IndexNode),
    Overflow(OverflowNode),
    Free(FreeNode),
}

impl Node {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Node::Leaf(_) => "leaf",
            Node::Internal(_) => "internal",
            Node::Index(_) => "index",
            Node::Overflow(_) => "overflow",
            Node::Free(_) => "free",
        }
    }

    pub fn set_is_root(&mut self, is_root: bool) {
        match self {
            Node::Leaf(n) => n.is_root = is_root,
            Node::Internal(n) => n.is_root = is_root,
            Node::Index(n) => n.is_root = is_root,
            Node::Overflow(_) | Node::Free(_) => {}
        }
    }

    pub fn set_parent(&mut self, parent: PageIndex) {
        match self {
            Node::Leaf(n) => n.parent = parent,
            Node::Internal(n) => n.parent = parent,
            Node::Index(n) => n.parent = parent,
            Node::Overflow(_) | Node::Free(_) => {}
        }
    }

    pub fn parent(&self) -> Option<PageIndex> {
        match self {
            Node::Leaf(n) if !n.is_root => Some(n.parent),
            Node::Internal(n) if !n.is_root => Some(n.parent),
            Node::Index(n) if !n.is_root => Some(n.parent),
            _ => None,
        }
    }

    pub fn into_leaf(self) -> Result<LeafNode> {
        match self {
            Node::Leaf(n) => Ok(n),
            other => Err(wrong_kind("leaf", &other)),
        }
    }

    pub fn into_internal(self) -> Result<InternalNode> {
        match self {
            Node::Internal(n) => Ok(n),
            other => Err(wrong_kind("internal", &other)),
        }
    }

    pub fn into_index(self) -> Result<IndexNode> {
        match self {
            Node::Index(n) => Ok(n),
            other => Err(wrong_kind("index", &other)),
        }
    }

    pub fn into_overflow(self) -> Result<OverflowNode> {
        match self {
            Node::Overflow(n) => Ok(n),
            other => Err(wrong_kind("overflow", &other)),
        }
    }

    pub fn into_free(self) -> Result<FreeNode> {
        match self {
            Node::Free(n) => Ok(n),
            other => Err(wrong_kind("free", &other)),
        }
    }
}

fn wrong_kind(expected: &'static str, got: &Node) -> Error {
    Error::invariant(
        "node.kind",
        format!("expected {} node, found {}", expected, got.kind_name()),
    )
}

/// Maximum cells of a row-tree leaf holding rows of `row_size` bytes.
pub fn leaf_max_cells(row_size: usize) -> usize {
    (NODE_AREA_SIZE - LEAF_HEADER_SIZE) / (LEAF_CELL_HEADER_SIZE + row_size)
}

/// Maximum cells of a row-tree internal node.
pub fn internal_max_cells() -> usize {
    (NODE_AREA_SIZE - INTERNAL_HEADER_SIZE) / INTERNAL_CELL_SIZE
}

/// Maximum cells of an index node with keys of `key_size` bytes.
pub fn index_max_cells(key_size: usize) -> usize {
    (NODE_AREA_SIZE - INDEX_HEADER_SIZE) / (key_size + 12)
}

/// What a page is expected to contain, and how to decode or initialize it.
///
/// This plays the caller-supplied-unmarshaller role: the tree owning a page
/// knows its kind and geometry, the page store does not.
#[derive(Clone, Copy, Debug)]
pub enum NodeSpec {
    /// A row-tree page; the leading header byte decides leaf vs internal.
    Tree { row_size: usize },
    /// An index page of the given key kind and serialized key width.
    Index { kind: ColumnKind, key_size: usize },
    Overflow,
    Free,
}

impl NodeSpec {
    /// The node a freshly allocated page of this kind starts out as.
    pub fn empty(&self) -> Node {
        match self {
            NodeSpec::Tree { row_size } => Node::Leaf(LeafNode::empty(*row_size)),
            NodeSpec::Index { key_size, .. } => Node::Index(IndexNode::empty_leaf(*key_size)),
            NodeSpec::Overflow => Node::Overflow(OverflowNode::empty()),
            NodeSpec::Free => Node::Free(FreeNode {
                next_free_page: PageIndex(0),
            }),
        }
    }

    /// Decode a node area according to the expected kind.
    pub fn unmarshal(&self, buf: &[u8]) -> Result<Node> {
        if buf.len() < NODE_AREA_SIZE {
            return Err(Error::corrupt(
                "node.unmarshal",
                format!("node area is {} bytes, need {}", buf.len(), NODE_AREA_SIZE),
            ));
        }
        match self {
            NodeSpec::Tree { row_size } => unmarshal_tree(buf, *row_size),
            NodeSpec::Index { kind, key_size } => unmarshal_index(buf, *kind, *key_size),
            NodeSpec::Overflow => unmarshal_overflow(buf),
            NodeSpec::Free => unmarshal_free(buf),
        }
    }
}

/// Serialize a node into a zeroed `NODE_AREA_SIZE` buffer.
pub fn marshal(node: &Node) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; NODE_AREA_SIZE];
    match node {
        Node::Leaf(n) => marshal_leaf(n, &mut buf)?,
        Node::Internal(n) => marshal_internal(n, &mut buf)?,
        Node::Index(n) => marshal_index(n, &mut buf)?,
        Node::Overflow(n) => marshal_overflow(n, &mut buf)?,
        Node::Free(n) => {
            let mut pos = 0;
            codec::write_u32(&mut buf, &mut pos, n.next_free_page.0);
        }
    }
    Ok(buf)
}

fn marshal_leaf(node: &LeafNode, buf: &mut [u8]) -> Result<()> {
    let cell_size = LEAF_CELL_HEADER_SIZE + node.row_size;
    let needed = LEAF_HEADER_SIZE + node.cells.len() * cell_size;
    if needed > NODE_AREA_SIZE {
        return Err(Error::invariant(
            "leaf.marshal",
            format!("{} cells exceed node capacity", node.cells.len()),
        ));
    }
    validate_leaf_order(node)?;

    let mut pos = 0;
    codec::write_u8(buf, &mut pos, u8::from(node.is_root));
    codec::write_u8(buf, &mut pos, 0); // is_internal
    codec::write_u32(buf, &mut pos, node.parent.0);
    codec::write_u32(buf, &mut pos, node.cells.len() as u32);
    codec::write_u32(buf, &mut pos, node.next_leaf.0);
    for cell in &node.cells {
        if cell.payload.len() != node.row_size {
            return Err(Error::invariant(
                "leaf.marshal",
                format!(
                    "cell payload is {} bytes, row size is {}",
                    cell.payload.len(),
                    node.row_size
                ),
            ));
        }
        codec::write_u64(buf, &mut pos, cell.key);
        codec::write_u64(buf, &mut pos, cell.null_bitmask);
        buf[pos..pos + node.row_size].copy_from_slice(&cell.payload);
        pos += node.row_size;
    }
    Ok(())
}

fn marshal_internal(node: &InternalNode, buf: &mut [u8]) -> Result<()> {
    let needed = INTERNAL_HEADER_SIZE + node.cells.len() * INTERNAL_CELL_SIZE;
    if needed > NODE_AREA_SIZE {
        return Err(Error::invariant(
            "internal.marshal",
            format!("{} cells exceed node capacity", node.cells.len()),
        ));
    }
    validate_internal_order(node)?;

    let mut pos = 0;
    codec::write_u8(buf, &mut pos, u8::from(node.is_root));
    codec::write_u8(buf, &mut pos, 1); // is_internal
    codec::write_u32(buf, &mut pos, node.parent.0);
    codec::write_u32(buf, &mut pos, node.cells.len() as u32);
    codec::write_u32(
        buf,
        &mut pos,
        node.right_child.map_or(RIGHT_CHILD_UNSET, |p| p.0),
    );
    for cell in &node.cells {
        codec::write_u64(buf, &mut pos, cell.key);
        codec::write_u32(buf, &mut pos, cell.child.0);
    }
    Ok(())
}

fn marshal_index(node: &IndexNode, buf: &mut [u8]) -> Result<()> {
    let key_size = node.key_size;
    let cell_size = key_size + 12;
    let needed = INDEX_HEADER_SIZE + node.cells.len() * cell_size;
    if needed > NODE_AREA_SIZE {
        return Err(Error::invariant(
            "index.marshal",
            format!("{} cells exceed node capacity", node.cells.len()),
        ));
    }
    validate_index_order(node)?;

    let mut pos = 0;
    codec::write_u8(buf, &mut pos, u8::from(node.is_root));
    codec::write_u8(buf, &mut pos, u8::from(node.is_leaf));
    codec::write_u32(buf, &mut pos, node.parent.0);
    codec::write_u32(buf, &mut pos, node.cells.len() as u32);
    codec::write_u32(
        buf,
        &mut pos,
        node.right_child.map_or(RIGHT_CHILD_UNSET, |p| p.0),
    );
    for cell in &node.cells {
        cell.key.marshal(buf, &mut pos, key_size)?;
        codec::write_u64(buf, &mut pos, cell.row_id);
        codec::write_u32(buf, &mut pos, cell.child.0);
    }
    Ok(())
}

fn marshal_overflow(node: &OverflowNode, buf: &mut [u8]) -> Result<()> {
    if node.data.len() > MAX_OVERFLOW_PAGE_DATA {
        return Err(Error::invariant(
            "overflow.marshal",
            format!("{} bytes exceed overflow page capacity", node.data.len()),
        ));
    }
    let mut pos = 0;
    codec::write_u8(buf, &mut pos, OVERFLOW_PAGE_TAG);
    codec::write_u32(buf, &mut pos, node.next.0);
    codec::write_u16(buf, &mut pos, node.data.len() as u16);
    buf[pos..pos + node.data.len()].copy_from_slice(&node.data);
    Ok(())
}

fn unmarshal_tree(buf: &[u8], row_size: usize) -> Result<Node> {
    let mut pos = 0;
    let is_root = codec::read_bool(buf, &mut pos, "node.is_root")?;
    let is_internal = codec::read_bool(buf, &mut pos, "node.is_internal")?;
    let parent = PageIndex(codec::read_u32(buf, &mut pos, "node.parent")?);

    if is_internal {
        let cells = codec::read_u32(buf, &mut pos, "internal.keys_num")? as usize;
        let right_raw = codec::read_u32(buf, &mut pos, "internal.right_child")?;
        if INTERNAL_HEADER_SIZE + cells * INTERNAL_CELL_SIZE > NODE_AREA_SIZE {
            return Err(Error::corrupt(
                "internal.keys_num",
                format!("{} cells overrun the node area", cells),
            ));
        }
        let mut node = InternalNode {
            is_root,
            parent,
            cells: Vec::with_capacity(cells),
            right_child: (right_raw != RIGHT_CHILD_UNSET).then_some(PageIndex(right_raw)),
        };
        for _ in 0..cells {
            let key = codec::read_u64(buf, &mut pos, "internal.cell")?;
            let child = PageIndex(codec::read_u32(buf, &mut pos, "internal.cell")?);
            node.cells.push(InternalCell { key, child });
        }
        validate_internal_order(&node)?;
        Ok(Node::Internal(node))
    } else {
        let cells = codec::read_u32(buf, &mut pos, "leaf.cells")? as usize;
        let next_leaf = PageIndex(codec::read_u32(buf, &mut pos, "leaf.next_leaf")?);
        let cell_size = LEAF_CELL_HEADER_SIZE + row_size;
        if LEAF_HEADER_SIZE + cells * cell_size > NODE_AREA_SIZE {
            return Err(Error::corrupt(
                "leaf.cells",
                format!("{} cells overrun the node area", cells),
            ));
        }
        let mut node = LeafNode {
            is_root,
            parent,
            next_leaf,
            row_size,
            cells: Vec::with_capacity(cells),
        };
        for _ in 0..cells {
            let key = codec::read_u64(buf, &mut pos, "leaf.cell")?;
            let null_bitmask = codec::read_u64(buf, &mut pos, "leaf.cell")?;
            let payload = buf
                .get(pos..pos + row_size)
                .ok_or_else(|| Error::corrupt("leaf.cell", "payload overruns node area"))?
                .to_vec();
            pos += row_size;
            node.cells.push(LeafCell {
                key,
                null_bitmask,
                payload,
            });
        }
        validate_leaf_order(&node)?;
        Ok(Node::Leaf(node))
    }
}

fn unmarshal_index(buf: &[u8], kind: ColumnKind, key_size: usize) -> Result<Node> {
    let mut pos = 0;
    let is_root = codec::read_bool(buf, &mut pos, "index.is_root")?;
    let is_leaf = codec::read_bool(buf, &mut pos, "index.is_leaf")?;
    let parent = PageIndex(codec::read_u32(buf, &mut pos, "index.parent")?);
    let cells = codec::read_u32(buf, &mut pos, "index.keys")? as usize;
    let right_raw = codec::read_u32(buf, &mut pos, "index.right_child")?;

    let cell_size = key_size + 12;
    if INDEX_HEADER_SIZE + cells * cell_size > NODE_AREA_SIZE {
        return Err(Error::corrupt(
            "index.keys",
            format!("{} cells overrun the node area", cells),
        ));
    }

    let mut node = IndexNode {
        is_root,
        is_leaf,
        parent,
        key_size,
        cells: Vec::with_capacity(cells),
        right_child: (right_raw != RIGHT_CHILD_UNSET).then_some(PageIndex(right_raw)),
    };
    for _ in 0..cells {
        let key = IndexKey::unmarshal(buf, &mut pos, kind, key_size)?;
        let row_id = codec::read_u64(buf, &mut pos, "index.cell")?;
        let child = PageIndex(codec::read_u32(buf, &mut pos, "index.cell")?);
        node.cells.push(IndexCell { key, row_id, child });
    }
    validate_index_order(&node)?;
    Ok(Node::Index(node))
}

fn unmarshal_overflow(buf: &[u8]) -> Result<Node> {
    let mut pos = 0;
    let tag = codec::read_u8(buf, &mut pos, "overflow.tag")?;
    if tag != OVERFLOW_PAGE_TAG {
        return Err(Error::corrupt(
            "overflow.tag",
            format!("expected tag {} found {}", OVERFLOW_PAGE_TAG, tag),
        ));
    }
    let next = PageIndex(codec::read_u32(buf, &mut pos, "overflow.next")?);
    let len = codec::read_u16(buf, &mut pos, "overflow.len")? as usize;
    if len > MAX_OVERFLOW_PAGE_DATA {
        return Err(Error::corrupt(
            "overflow.len",
            format!("declared length {} overruns the page", len),
        ));
    }
    let data = buf
        .get(pos..pos + len)
        .ok_or_else(|| Error::corrupt("overflow.len", "data overruns node area"))?
        .to_vec();
    Ok(Node::Overflow(OverflowNode { next, data }))
}

fn unmarshal_free(buf: &[u8]) -> Result<Node> {
    let mut pos = 0;
    let next_free_page = PageIndex(codec::read_u32(buf, &mut pos, "free.next")?);
    Ok(Node::Free(FreeNode { next_free_page }))
}

fn validate_leaf_order(node: &LeafNode) -> Result<()> {
    for pair in node.cells.windows(2) {
        if pair[0].key >= pair[1].key {
            return Err(Error::corrupt(
                "leaf.keys_order",
                format!("keys not strictly ascending: {} >= {}", pair[0].key, pair[1].key),
            ));
        }
    }
    Ok(())
}

fn validate_internal_order(node: &InternalNode) -> Result<()> {
    for pair in node.cells.windows(2) {
        if pair[0].key >= pair[1].key {
            return Err(Error::corrupt(
                "internal.keys_order",
                format!("keys not strictly ascending: {} >= {}", pair[0].key, pair[1].key),
            ));
        }
    }
    if !node.cells.is_empty() && node.right_child.is_none() {
        return Err(Error::corrupt(
            "internal.right_child",
            "internal node with cells but no right child",
        ));
    }
    Ok(())
}

fn validate_index_order(node: &IndexNode) -> Result<()> {
    for pair in node.cells.windows(2) {
        if pair[0].key >= pair[1].key {
            return Err(Error::corrupt(
                "index.keys_order",
                "keys not strictly ascending",
            ));
        }
    }
    if !node.is_leaf && !node.cells.is_empty() && node.right_child.is_none() {
        return Err(Error::corrupt(
            "index.right_child",
            "internal index node with cells but no right child",
        ));
    }
    Ok(())
}
