//! Persistent B+Tree. Each node occupies exactly one page.
//!
//! Leaf payload: `{node_type=1, num_keys:u16, next_leaf:u32}` then per entry
//! `{key_len:u16, key, record_id:u64, data_page:u32, slot_off:u16}`. Leaves
//! are singly linked through `next_leaf` for range scans. Internal payload:
//! `{node_type=2, num_keys:u16, child0:u32}` then `{key_len:u16, key,
//! child:u32}` per separator.
//!
//! Descent is left-biased: a separator equal to the probe key routes left,
//! so a run of duplicate keys is always entered at its leftmost leaf and
//! collected along the chain. Within a leaf, entries with equal keys order
//! by `record_id`. Removal does not rebalance; empty leaves persist until
//! the index is rebuilt.

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::core::errors::NovusError;
use crate::storage::heap::RecordLoc;
use crate::storage::page::{Page, PageId, PageType, NO_PAGE};
use crate::storage::pager::{allocate_page, free_page, PageIo};

const NODE_LEAF: u8 = 1;
const NODE_INTERNAL: u8 = 2;

const NODE_HEADER: usize = 7;
const LEAF_ENTRY_FIXED: usize = 2 + 8 + 4 + 2;
const INTERNAL_ENTRY_FIXED: usize = 2 + 4;

/// Bulk-loaded nodes are filled to this fraction of the payload, leaving
/// room for later inserts.
const BULK_FILL_NUM: usize = 3;
const BULK_FILL_DEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub record_id: u64,
    pub loc: RecordLoc,
}

#[derive(Debug)]
struct LeafNode {
    next: PageId,
    entries: Vec<(Vec<u8>, IndexEntry)>,
}

#[derive(Debug)]
struct InternalNode {
    first_child: PageId,
    entries: Vec<(Vec<u8>, PageId)>,
}

#[derive(Debug)]
enum Node {
    Leaf(LeafNode),
    Internal(InternalNode),
}

fn parse_node(page: &Page) -> Result<Node, NovusError> {
    let payload = page.payload();
    let mut cursor = Cursor::new(payload);
    let node_type = cursor.read_u8()?;
    let num_keys = cursor.read_u16::<LittleEndian>()? as usize;
    match node_type {
        NODE_LEAF => {
            let next = cursor.read_u32::<LittleEndian>()?;
            let mut entries = Vec::with_capacity(num_keys);
            for _ in 0..num_keys {
                let key_len = cursor.read_u16::<LittleEndian>()? as usize;
                let mut key = vec![0u8; key_len];
                cursor.read_exact(&mut key)?;
                let record_id = cursor.read_u64::<LittleEndian>()?;
                let data_page = cursor.read_u32::<LittleEndian>()?;
                let slot = cursor.read_u16::<LittleEndian>()?;
                entries.push((
                    key,
                    IndexEntry {
                        record_id,
                        loc: RecordLoc {
                            page_id: data_page,
                            slot,
                        },
                    },
                ));
            }
            Ok(Node::Leaf(LeafNode { next, entries }))
        }
        NODE_INTERNAL => {
            let first_child = cursor.read_u32::<LittleEndian>()?;
            let mut entries = Vec::with_capacity(num_keys);
            for _ in 0..num_keys {
                let key_len = cursor.read_u16::<LittleEndian>()? as usize;
                let mut key = vec![0u8; key_len];
                cursor.read_exact(&mut key)?;
                let child = cursor.read_u32::<LittleEndian>()?;
                entries.push((key, child));
            }
            Ok(Node::Internal(InternalNode {
                first_child,
                entries,
            }))
        }
        other => Err(NovusError::Corruption(format!(
            "unknown index node type {other} on page {}",
            page.id()
        ))),
    }
}

fn leaf_len(entries: &[(Vec<u8>, IndexEntry)]) -> usize {
    NODE_HEADER
        + entries
            .iter()
            .map(|(k, _)| LEAF_ENTRY_FIXED + k.len())
            .sum::<usize>()
}

fn internal_len(entries: &[(Vec<u8>, PageId)]) -> usize {
    NODE_HEADER
        + entries
            .iter()
            .map(|(k, _)| INTERNAL_ENTRY_FIXED + k.len())
            .sum::<usize>()
}

fn write_leaf(
    io: &dyn PageIo,
    id: PageId,
    node: &LeafNode,
) -> Result<(), NovusError> {
    let mut page = Page::new(io.page_size(), id, PageType::IndexLeaf);
    let mut buf = Vec::with_capacity(leaf_len(&node.entries));
    buf.push(NODE_LEAF);
    buf.write_u16::<LittleEndian>(node.entries.len() as u16)?;
    buf.write_u32::<LittleEndian>(node.next)?;
    for (key, entry) in &node.entries {
        buf.write_u16::<LittleEndian>(key.len() as u16)?;
        buf.extend_from_slice(key);
        buf.write_u64::<LittleEndian>(entry.record_id)?;
        buf.write_u32::<LittleEndian>(entry.loc.page_id)?;
        buf.write_u16::<LittleEndian>(entry.loc.slot)?;
    }
    if buf.len() > page.payload().len() {
        return Err(NovusError::Corruption(format!(
            "leaf node overflow on page {id}"
        )));
    }
    page.payload_mut()[..buf.len()].copy_from_slice(&buf);
    io.write(page)
}

fn write_internal(
    io: &dyn PageIo,
    id: PageId,
    node: &InternalNode,
) -> Result<(), NovusError> {
    let mut page = Page::new(io.page_size(), id, PageType::IndexInternal);
    let mut buf = Vec::with_capacity(internal_len(&node.entries));
    buf.push(NODE_INTERNAL);
    buf.write_u16::<LittleEndian>(node.entries.len() as u16)?;
    buf.write_u32::<LittleEndian>(node.first_child)?;
    for (key, child) in &node.entries {
        buf.write_u16::<LittleEndian>(key.len() as u16)?;
        buf.extend_from_slice(key);
        buf.write_u32::<LittleEndian>(*child)?;
    }
    if buf.len() > page.payload().len() {
        return Err(NovusError::Corruption(format!(
            "internal node overflow on page {id}"
        )));
    }
    page.payload_mut()[..buf.len()].copy_from_slice(&buf);
    io.write(page)
}

fn node_capacity(io: &dyn PageIo) -> usize {
    io.page_size() - crate::storage::page::PAGE_HEADER_SIZE
}

/// Index of the child to descend into: left-biased, separators equal to the
/// key route left so duplicate runs are entered at their leftmost leaf.
fn child_for(node: &InternalNode, key: &[u8]) -> PageId {
    let idx = node.entries.partition_point(|(k, _)| k.as_slice() < key);
    if idx == 0 {
        node.first_child
    } else {
        node.entries[idx - 1].1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BTree {
    pub root: PageId,
}

impl BTree {
    /// Allocate an empty leaf as the root.
    pub fn create(io: &dyn PageIo) -> Result<Self, NovusError> {
        let root = allocate_page(io, PageType::IndexLeaf)?;
        write_leaf(
            io,
            root,
            &LeafNode {
                next: NO_PAGE,
                entries: Vec::new(),
            },
        )?;
        Ok(Self { root })
    }

    pub fn open(root: PageId) -> Self {
        Self { root }
    }

    fn leaf_for(&self, io: &dyn PageIo, key: &[u8]) -> Result<(PageId, LeafNode), NovusError> {
        let mut id = self.root;
        loop {
            let page = io.read(id)?;
            match parse_node(&page)? {
                Node::Leaf(leaf) => return Ok((id, leaf)),
                Node::Internal(internal) => id = child_for(&internal, key),
            }
        }
    }

    fn leftmost_leaf(&self, io: &dyn PageIo) -> Result<(PageId, LeafNode), NovusError> {
        let mut id = self.root;
        loop {
            let page = io.read(id)?;
            match parse_node(&page)? {
                Node::Leaf(leaf) => return Ok((id, leaf)),
                Node::Internal(internal) => id = internal.first_child,
            }
        }
    }

    /// All entries matching `key`, in `record_id` order of discovery along
    /// the leaf chain.
    pub fn lookup(&self, io: &dyn PageIo, key: &[u8]) -> Result<Vec<IndexEntry>, NovusError> {
        self.lookup_limit(io, key, usize::MAX)
    }

    /// As [`BTree::lookup`], stopping after `limit` entries.
    pub fn lookup_limit(
        &self,
        io: &dyn PageIo,
        key: &[u8],
        limit: usize,
    ) -> Result<Vec<IndexEntry>, NovusError> {
        let (_, mut leaf) = self.leaf_for(io, key)?;
        let mut out = Vec::new();
        loop {
            for (k, entry) in &leaf.entries {
                if k.as_slice() < key {
                    continue;
                }
                if k.as_slice() > key {
                    return Ok(out);
                }
                out.push(*entry);
                if out.len() >= limit {
                    return Ok(out);
                }
            }
            if leaf.next == NO_PAGE {
                return Ok(out);
            }
            let page = io.read(leaf.next)?;
            match parse_node(&page)? {
                Node::Leaf(next) => leaf = next,
                Node::Internal(_) => {
                    return Err(NovusError::Corruption("leaf chain hit internal node".into()))
                }
            }
        }
    }

    /// Entries with `min ≤ key ≤ max` in key order. An empty bound is
    /// unbounded on that side.
    pub fn range_scan(
        &self,
        io: &dyn PageIo,
        min: &[u8],
        max: &[u8],
    ) -> Result<Vec<(Vec<u8>, IndexEntry)>, NovusError> {
        let (_, mut leaf) = if min.is_empty() {
            self.leftmost_leaf(io)?
        } else {
            self.leaf_for(io, min)?
        };
        let mut out = Vec::new();
        loop {
            for (k, entry) in &leaf.entries {
                if k.as_slice() < min {
                    continue;
                }
                if !max.is_empty() && k.as_slice() > max {
                    return Ok(out);
                }
                out.push((k.clone(), *entry));
            }
            if leaf.next == NO_PAGE {
                return Ok(out);
            }
            let page = io.read(leaf.next)?;
            match parse_node(&page)? {
                Node::Leaf(next) => leaf = next,
                Node::Internal(_) => {
                    return Err(NovusError::Corruption("leaf chain hit internal node".into()))
                }
            }
        }
    }

    /// Insert an entry. Splits propagate upward; a root split allocates a
    /// new root with the two halves as children. New pages are written
    /// before any separator pointing at them, so a failed allocation leaves
    /// the pre-split tree intact.
    pub fn insert(
        &mut self,
        io: &dyn PageIo,
        key: &[u8],
        entry: IndexEntry,
    ) -> Result<(), NovusError> {
        if let Some((sep, right)) = self.insert_at(io, self.root, key, entry)? {
            let old_root = self.root;
            let new_root = allocate_page(io, PageType::IndexInternal)?;
            write_internal(
                io,
                new_root,
                &InternalNode {
                    first_child: old_root,
                    entries: vec![(sep, right)],
                },
            )?;
            self.root = new_root;
        }
        Ok(())
    }

    fn insert_at(
        &self,
        io: &dyn PageIo,
        node_id: PageId,
        key: &[u8],
        entry: IndexEntry,
    ) -> Result<Option<(Vec<u8>, PageId)>, NovusError> {
        let page = io.read(node_id)?;
        match parse_node(&page)? {
            Node::Leaf(mut leaf) => {
                let pos = leaf.entries.partition_point(|(k, e)| {
                    (k.as_slice(), e.record_id) < (key, entry.record_id)
                });
                leaf.entries.insert(pos, (key.to_vec(), entry));
                if leaf_len(&leaf.entries) <= node_capacity(io) {
                    write_leaf(io, node_id, &leaf)?;
                    return Ok(None);
                }
                self.split_leaf(io, node_id, leaf)
            }
            Node::Internal(mut internal) => {
                let idx = internal
                    .entries
                    .partition_point(|(k, _)| k.as_slice() < key);
                let child = if idx == 0 {
                    internal.first_child
                } else {
                    internal.entries[idx - 1].1
                };
                let Some((sep, right)) = self.insert_at(io, child, key, entry)? else {
                    return Ok(None);
                };
                internal.entries.insert(idx, (sep, right));
                if internal_len(&internal.entries) <= node_capacity(io) {
                    write_internal(io, node_id, &internal)?;
                    return Ok(None);
                }
                self.split_internal(io, node_id, internal)
            }
        }
    }

    fn split_leaf(
        &self,
        io: &dyn PageIo,
        node_id: PageId,
        leaf: LeafNode,
    ) -> Result<Option<(Vec<u8>, PageId)>, NovusError> {
        let capacity = node_capacity(io);
        let mid = split_point(leaf.entries.len(), |range| {
            leaf_len(&leaf.entries[range.0..range.1])
        }, capacity)
        .ok_or_else(|| NovusError::Corruption("leaf split impossible".into()))?;

        let right_entries = leaf.entries[mid..].to_vec();
        let sep = right_entries[0].0.clone();
        let right_id = allocate_page(io, PageType::IndexLeaf)?;
        write_leaf(
            io,
            right_id,
            &LeafNode {
                next: leaf.next,
                entries: right_entries,
            },
        )?;
        write_leaf(
            io,
            node_id,
            &LeafNode {
                next: right_id,
                entries: leaf.entries[..mid].to_vec(),
            },
        )?;
        Ok(Some((sep, right_id)))
    }

    fn split_internal(
        &self,
        io: &dyn PageIo,
        node_id: PageId,
        internal: InternalNode,
    ) -> Result<Option<(Vec<u8>, PageId)>, NovusError> {
        let capacity = node_capacity(io);
        // Promote the separator at `mid`; both rebuilt halves must fit.
        let n = internal.entries.len();
        let mut promote = None;
        let mid = n / 2;
        for delta in 0..n {
            for candidate in [mid.saturating_sub(delta), (mid + delta).min(n - 1)] {
                let left = &internal.entries[..candidate];
                let right = &internal.entries[candidate + 1..];
                if internal_len(left) <= capacity && internal_len(right) <= capacity {
                    promote = Some(candidate);
                    break;
                }
            }
            if promote.is_some() {
                break;
            }
        }
        let promote =
            promote.ok_or_else(|| NovusError::Corruption("internal split impossible".into()))?;

        let (sep, right_first) = internal.entries[promote].clone();
        let right_id = allocate_page(io, PageType::IndexInternal)?;
        write_internal(
            io,
            right_id,
            &InternalNode {
                first_child: right_first,
                entries: internal.entries[promote + 1..].to_vec(),
            },
        )?;
        write_internal(
            io,
            node_id,
            &InternalNode {
                first_child: internal.first_child,
                entries: internal.entries[..promote].to_vec(),
            },
        )?;
        Ok(Some((sep, right_id)))
    }

    /// Remove the entry matching `(key, record_id)`. Absent entries are
    /// ignored; no rebalance happens.
    pub fn remove(
        &mut self,
        io: &dyn PageIo,
        key: &[u8],
        record_id: u64,
    ) -> Result<(), NovusError> {
        let (mut leaf_id, mut leaf) = self.leaf_for(io, key)?;
        loop {
            if let Some(pos) = leaf
                .entries
                .iter()
                .position(|(k, e)| k.as_slice() == key && e.record_id == record_id)
            {
                leaf.entries.remove(pos);
                write_leaf(io, leaf_id, &leaf)?;
                return Ok(());
            }
            // The run of equal keys may continue in the next leaf.
            let exhausted = leaf
                .entries
                .last()
                .map(|(k, _)| k.as_slice() > key)
                .unwrap_or(false);
            if exhausted || leaf.next == NO_PAGE {
                return Ok(());
            }
            leaf_id = leaf.next;
            let page = io.read(leaf_id)?;
            match parse_node(&page)? {
                Node::Leaf(next) => leaf = next,
                Node::Internal(_) => {
                    return Err(NovusError::Corruption("leaf chain hit internal node".into()))
                }
            }
        }
    }

    /// Bottom-up build from entries sorted by `(key, record_id)`. Nodes are
    /// filled to 75% and leaves chained left to right; O(N) against O(N log N)
    /// for repeated inserts.
    pub fn bulk_load(
        io: &dyn PageIo,
        entries: &[(Vec<u8>, IndexEntry)],
    ) -> Result<Self, NovusError> {
        if entries.is_empty() {
            return Self::create(io);
        }
        let capacity = node_capacity(io);
        let target = capacity * BULK_FILL_NUM / BULK_FILL_DEN;

        // Group entries into leaves.
        let mut groups: Vec<Vec<(Vec<u8>, IndexEntry)>> = Vec::new();
        let mut current: Vec<(Vec<u8>, IndexEntry)> = Vec::new();
        for entry in entries {
            current.push(entry.clone());
            if leaf_len(&current) >= target {
                groups.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            groups.push(current);
        }

        let ids: Vec<PageId> = groups
            .iter()
            .map(|_| allocate_page(io, PageType::IndexLeaf))
            .collect::<Result<_, _>>()?;
        let mut level: Vec<(Vec<u8>, PageId)> = Vec::with_capacity(groups.len());
        for (i, group) in groups.into_iter().enumerate() {
            let next = ids.get(i + 1).copied().unwrap_or(NO_PAGE);
            let first_key = group[0].0.clone();
            write_leaf(
                io,
                ids[i],
                &LeafNode {
                    next,
                    entries: group,
                },
            )?;
            level.push((first_key, ids[i]));
        }

        // Build internal levels until one node remains.
        while level.len() > 1 {
            let mut next_level: Vec<(Vec<u8>, PageId)> = Vec::new();
            let mut i = 0;
            while i < level.len() {
                let first_key = level[i].0.clone();
                let first_child = level[i].1;
                let mut entries: Vec<(Vec<u8>, PageId)> = Vec::new();
                i += 1;
                while i < level.len() {
                    entries.push(level[i].clone());
                    i += 1;
                    if internal_len(&entries) >= target {
                        break;
                    }
                }
                let id = allocate_page(io, PageType::IndexInternal)?;
                write_internal(
                    io,
                    id,
                    &InternalNode {
                        first_child,
                        entries,
                    },
                )?;
                next_level.push((first_key, id));
            }
            level = next_level;
        }

        Ok(Self { root: level[0].1 })
    }

    /// Free every page of the tree.
    pub fn free(&self, io: &dyn PageIo) -> Result<(), NovusError> {
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            let page = io.read(id)?;
            if let Node::Internal(internal) = parse_node(&page)? {
                stack.push(internal.first_child);
                stack.extend(internal.entries.iter().map(|(_, c)| *c));
            }
            free_page(io, id)?;
        }
        Ok(())
    }
}

/// Find a split index where both halves fit `capacity`, preferring the
/// midpoint. `measure` reports the encoded size of a half-open range.
fn split_point(
    len: usize,
    measure: impl Fn((usize, usize)) -> usize,
    capacity: usize,
) -> Option<usize> {
    if len < 2 {
        return None;
    }
    let mid = len / 2;
    for delta in 0..len {
        for candidate in [mid.saturating_sub(delta), mid + delta] {
            if candidate == 0 || candidate >= len {
                continue;
            }
            if measure((0, candidate)) <= capacity && measure((candidate, len)) <= capacity {
                return Some(candidate);
            }
        }
    }
    None
}
