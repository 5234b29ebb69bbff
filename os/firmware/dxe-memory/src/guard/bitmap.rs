//! # Guarded Heap Bitmap
//!
//! One bit per page, set for every page of a guarded allocation's payload.
//! Guard pages themselves are never marked; they are recognized by the bit
//! patterns of their neighbors.
//!
//! The bits live in a radix tree keyed by page address:
//!
//! ```text
//!  63        54 53      45 44      36 35      27 26      18 17    12 11      0
//! +------------+----------+----------+----------+----------+--------+---------+
//! |  level 0   | level 1  | level 2  | level 3  |   word   |  bit   | offset  |
//! |  1024 ent  | 512 ent  | 512 ent  | 512 ent  | 512 x u64|  0..64 |         |
//! +------------+----------+----------+----------+----------+--------+---------+
//! ```
//!
//! A leaf holds 512 words and covers 128 MiB. The tree starts as a single
//! leaf and grows a new root only when an address beyond the current span
//! is marked, so small address spaces never pay for the upper levels. Nodes
//! are never freed.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use fw_memory_addresses::{PAGE_SHIFT, PAGE_SIZE, PhysicalAddress};

/// Maximum depth of the tree, including the leaf level.
pub const MAX_DEPTH: usize = 5;

const BITS_PER_WORD: u64 = u64::BITS as u64;
const WORDS_PER_LEAF: usize = 512;
const WORD_SHIFT: u32 = PAGE_SHIFT + 6;
const LEAF_SPAN_SHIFT: u32 = WORD_SHIFT + 9;

/// Shift of the index of each table level, top level first.
const TABLE_SHIFTS: [u32; MAX_DEPTH - 1] = [54, 45, 36, 27];

/// Entries of each table level, top level first.
const TABLE_ENTRIES: [usize; MAX_DEPTH - 1] = [1024, 512, 512, 512];

/// Address bits covered by a tree of the given depth.
const fn span_bits(depth: usize) -> u32 {
    match depth {
        0 | 1 => LEAF_SPAN_SHIFT,
        2 => 36,
        3 => 45,
        4 => 54,
        _ => u64::BITS,
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct NodeId(usize);

enum Node {
    Table(Box<[Option<NodeId>]>),
    Leaf(Box<[u64; WORDS_PER_LEAF]>),
}

/// Leaf word holding the bit of an address.
#[derive(Debug, Copy, Clone)]
struct WordRef {
    leaf: NodeId,
    word: usize,
    bit: u32,
}

/// Per-page guarded state.
pub struct GuardBitmap {
    nodes: Vec<Node>,
    root: Option<NodeId>,
    depth: usize,
}

impl Default for GuardBitmap {
    fn default() -> Self {
        Self::new()
    }
}

impl GuardBitmap {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            nodes: Vec::new(),
            root: None,
            depth: 1,
        }
    }

    /// Current number of levels, including the leaf level.
    #[must_use]
    pub const fn depth(&self) -> usize {
        self.depth
    }

    /// Number of allocated tables and leaves.
    #[must_use]
    pub const fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Whether no page was ever marked.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    fn push(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(node);
        id
    }

    fn new_table(&mut self, level: usize) -> NodeId {
        self.push(Node::Table(vec![None; TABLE_ENTRIES[level]].into_boxed_slice()))
    }

    fn new_leaf(&mut self) -> NodeId {
        self.push(Node::Leaf(Box::new([0; WORDS_PER_LEAF])))
    }

    /// Adds root levels until `addr` is covered.
    fn grow(&mut self, addr: PhysicalAddress) {
        while self.depth < MAX_DEPTH && addr.as_u64() >> span_bits(self.depth) != 0 {
            let level = MAX_DEPTH - 1 - self.depth;
            let table = self.new_table(level);
            if let (Some(old), Node::Table(entries)) = (self.root, &mut self.nodes[table.0]) {
                entries[0] = Some(old);
            }
            self.root = Some(table);
            self.depth += 1;
        }
    }

    /// Walks to the leaf word of `addr`.
    ///
    /// With `allocate`, missing levels and nodes are created; otherwise `None`
    /// is returned for addresses no bit was ever set for.
    fn find_node(&mut self, addr: PhysicalAddress, allocate: bool) -> Option<WordRef> {
        if self.depth < MAX_DEPTH && addr.as_u64() >> span_bits(self.depth) != 0 {
            if !allocate {
                return None;
            }
            self.grow(addr);
        }

        let mut node = match self.root {
            Some(root) => root,
            None if allocate => {
                let root = if self.depth == 1 {
                    self.new_leaf()
                } else {
                    self.new_table(MAX_DEPTH - self.depth)
                };
                self.root = Some(root);
                root
            }
            None => return None,
        };

        for level in (MAX_DEPTH - self.depth)..(MAX_DEPTH - 1) {
            let index = Self::table_index(addr, level);
            let child = match &self.nodes[node.0] {
                Node::Table(entries) => entries[index],
                Node::Leaf(_) => unreachable!("leaf above the leaf level"),
            };
            node = match child {
                Some(child) => child,
                None if allocate => {
                    let child = if level == MAX_DEPTH - 2 {
                        self.new_leaf()
                    } else {
                        self.new_table(level + 1)
                    };
                    if let Node::Table(entries) = &mut self.nodes[node.0] {
                        entries[index] = Some(child);
                    }
                    child
                }
                None => return None,
            };
        }

        Some(WordRef {
            leaf: node,
            word: Self::word_index(addr),
            bit: Self::bit_index(addr),
        })
    }

    /// Read-only walk; never allocates.
    fn lookup(&self, addr: PhysicalAddress) -> Option<u64> {
        if self.depth < MAX_DEPTH && addr.as_u64() >> span_bits(self.depth) != 0 {
            return None;
        }
        let mut node = self.root?;
        for level in (MAX_DEPTH - self.depth)..(MAX_DEPTH - 1) {
            node = match &self.nodes[node.0] {
                Node::Table(entries) => entries[Self::table_index(addr, level)]?,
                Node::Leaf(_) => return None,
            };
        }
        match &self.nodes[node.0] {
            Node::Leaf(words) => Some(words[Self::word_index(addr)]),
            Node::Table(_) => None,
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    const fn table_index(addr: PhysicalAddress, level: usize) -> usize {
        ((addr.as_u64() >> TABLE_SHIFTS[level]) as usize) & (TABLE_ENTRIES[level] - 1)
    }

    #[allow(clippy::cast_possible_truncation)]
    const fn word_index(addr: PhysicalAddress) -> usize {
        ((addr.as_u64() >> WORD_SHIFT) as usize) & (WORDS_PER_LEAF - 1)
    }

    #[allow(clippy::cast_possible_truncation)]
    const fn bit_index(addr: PhysicalAddress) -> u32 {
        ((addr.as_u64() >> PAGE_SHIFT) & (BITS_PER_WORD - 1)) as u32
    }

    const fn run_mask(bit: u32, count: u64) -> u64 {
        if count >= BITS_PER_WORD {
            u64::MAX
        } else {
            ((1u64 << count) - 1) << bit
        }
    }

    fn leaf_mut(&mut self, id: NodeId) -> &mut [u64; WORDS_PER_LEAF] {
        match &mut self.nodes[id.0] {
            Node::Leaf(words) => words,
            Node::Table(_) => unreachable!("word reference into a table"),
        }
    }

    /// Marks `pages` pages starting at `addr` as guarded payload.
    ///
    /// Runs may cross word and node boundaries.
    pub fn set_bits(&mut self, addr: PhysicalAddress, pages: u64) {
        self.update_bits(addr, pages, true);
    }

    /// Clears the marks of `pages` pages starting at `addr`.
    pub fn clear_bits(&mut self, addr: PhysicalAddress, pages: u64) {
        self.update_bits(addr, pages, false);
    }

    fn update_bits(&mut self, addr: PhysicalAddress, pages: u64, set: bool) {
        let mut addr = addr.align_down(PAGE_SIZE);
        let mut remaining = pages;
        while remaining > 0 {
            let bit = Self::bit_index(addr);
            let count = remaining.min(BITS_PER_WORD - u64::from(bit));
            if let Some(at) = self.find_node(addr, set) {
                let mask = Self::run_mask(at.bit, count);
                let word = &mut self.leaf_mut(at.leaf)[at.word];
                if set {
                    *word |= mask;
                } else {
                    *word &= !mask;
                }
            }
            remaining -= count;
            match addr.checked_add(count << PAGE_SHIFT) {
                Some(next) => addr = next,
                None => break,
            }
        }
    }

    /// Returns the marks of up to 64 pages starting at `addr`.
    ///
    /// Bit `i` of the result is the mark of page `addr + i * PAGE_SIZE`.
    /// Pages beyond the end of the address space read as unmarked.
    #[must_use]
    pub fn get_bits(&self, addr: PhysicalAddress, pages: u64) -> u64 {
        debug_assert!(pages <= BITS_PER_WORD);
        let mut addr = addr.align_down(PAGE_SIZE);
        let mut result = 0;
        let mut done = 0;
        while done < pages {
            let bit = Self::bit_index(addr);
            let count = (pages - done).min(BITS_PER_WORD - u64::from(bit));
            if let Some(word) = self.lookup(addr) {
                let bits = (word >> bit) & Self::run_mask(0, count);
                result |= bits << done;
            }
            done += count;
            match addr.checked_add(count << PAGE_SHIFT) {
                Some(next) => addr = next,
                None => break,
            }
        }
        result
    }

    /// Like [`get_bits`](Self::get_bits), starting one page below `addr`.
    ///
    /// The page below address zero reads as unmarked.
    fn get_bits_from_previous(&self, addr: PhysicalAddress, pages: u64) -> u64 {
        match addr.checked_sub(PAGE_SIZE) {
            Some(prev) => self.get_bits(prev, pages),
            None => self.get_bits(addr, pages - 1) << 1,
        }
    }

    /// Whether the page at `addr` belongs to a guarded payload.
    #[must_use]
    pub fn is_guarded(&self, addr: PhysicalAddress) -> bool {
        self.get_bits(addr, 1) == 1
    }

    /// Whether `addr` is a guard page: unmarked itself, with a marked page on
    /// at least one side.
    #[must_use]
    pub fn is_guard_page(&self, addr: PhysicalAddress) -> bool {
        matches!(self.get_bits_from_previous(addr, 3), 0b001 | 0b100 | 0b101)
    }

    /// Whether `addr` is the head guard of the payload starting one page above.
    #[must_use]
    pub fn is_head_guard(&self, addr: PhysicalAddress) -> bool {
        self.get_bits(addr, 2) == 0b10
    }

    /// Whether `addr` is the tail guard of the payload ending one page below.
    #[must_use]
    pub fn is_tail_guard(&self, addr: PhysicalAddress) -> bool {
        self.get_bits_from_previous(addr, 2) == 0b01
    }

    /// Maximal runs of marked pages in ascending address order.
    #[must_use]
    pub fn guarded_runs(&self) -> Vec<(PhysicalAddress, u64)> {
        let mut runs = Vec::new();
        if let Some(root) = self.root {
            self.collect_runs(root, MAX_DEPTH - self.depth, 0, &mut runs);
        }
        runs
    }

    fn collect_runs(
        &self,
        node: NodeId,
        level: usize,
        base: u64,
        runs: &mut Vec<(PhysicalAddress, u64)>,
    ) {
        match &self.nodes[node.0] {
            Node::Table(entries) => {
                for (index, child) in entries.iter().enumerate() {
                    if let Some(child) = child {
                        let base = base | ((index as u64) << TABLE_SHIFTS[level]);
                        self.collect_runs(*child, level + 1, base, runs);
                    }
                }
            }
            Node::Leaf(words) => {
                for (index, &word) in words.iter().enumerate() {
                    let word_base = base | ((index as u64) << WORD_SHIFT);
                    let mut bits = word;
                    while bits != 0 {
                        let start = bits.trailing_zeros();
                        let len = (bits >> start).trailing_ones();
                        let addr = PhysicalAddress::new(word_base + (u64::from(start) << PAGE_SHIFT));
                        Self::push_run(runs, addr, u64::from(len));
                        bits &= !Self::run_mask(start, u64::from(len));
                    }
                }
            }
        }
    }

    fn push_run(runs: &mut Vec<(PhysicalAddress, u64)>, addr: PhysicalAddress, pages: u64) {
        if let Some((start, len)) = runs.last_mut()
            && start.checked_add(*len << PAGE_SHIFT) == Some(addr)
        {
            *len += pages;
            return;
        }
        runs.push((addr, pages));
    }
}
