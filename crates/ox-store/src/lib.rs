#![forbid(unsafe_code)]

//! In-memory data engine: a hash index with incremental resizing, a
//! rank-augmented AVL tree, the sorted-set composite built from both, and
//! the `Engine` that ties them to a TTL heap and a teardown worker pool.

use std::cmp::Ordering;
use std::mem;
use std::sync::mpsc::{Receiver, SyncSender, TrySendError, sync_channel};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use ox_expire::{ExpiryHeap, HeapItem};

/// Migration quota per hash-index operation while a resize is outstanding.
const RESIZE_WORK: usize = 128;
/// A table resizes once its chains average more than this many nodes.
const MAX_LOAD_FACTOR: usize = 8;
const INITIAL_BUCKETS: usize = 4;
/// Keys evicted per `Engine::sweep` call.
const SWEEP_QUOTA: usize = 200;
/// Sorted sets at or above this member count are torn down off-thread.
const LARGE_ZSET_LEN: usize = 1024;
const POOL_THREADS: usize = 4;
const POOL_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    WrongType,
}

/// FNV-1a, the same keyed-by-name hashing the index has always used.
#[must_use]
pub fn hash_key(key: &str) -> u64 {
    let mut h = 0xcbf2_9ce4_8422_2325_u64;
    for &b in key.as_bytes() {
        h ^= u64::from(b);
        h = h.wrapping_mul(0x100_0000_01b3);
    }
    h
}

// ── HashIndex: chained table with incremental resizing ───────────────

#[derive(Debug)]
struct HashNode<T> {
    hash: u64,
    next: Option<usize>,
    item: T,
}

#[derive(Debug)]
enum HashSlot<T> {
    Occupied(HashNode<T>),
    Vacant(Option<usize>),
}

#[derive(Debug)]
struct BucketTable {
    buckets: Vec<Option<usize>>,
    mask: u64,
    len: usize,
}

impl BucketTable {
    fn with_buckets(n: usize) -> Self {
        Self {
            buckets: vec![None; n],
            mask: (n - 1) as u64,
            len: 0,
        }
    }

    fn bucket(&self, hash: u64) -> usize {
        (hash & self.mask) as usize
    }
}

/// Open-chained hash table over an index arena. Ids handed out by
/// `insert` stay valid until the item is popped, across any number of
/// resizes; a resize migrates a bounded batch of nodes per call so no
/// single operation pays for a full rehash.
#[derive(Debug)]
pub struct HashIndex<T> {
    slots: Vec<HashSlot<T>>,
    free: Option<usize>,
    primary: BucketTable,
    stale: Option<BucketTable>,
    migrate_pos: usize,
}

impl<T> Default for HashIndex<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HashIndex<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: None,
            primary: BucketTable::with_buckets(INITIAL_BUCKETS),
            stale: None,
            migrate_pos: 0,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.primary.len + self.stale.as_ref().map_or(0, |t| t.len)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn get(&self, id: usize) -> Option<&T> {
        match self.slots.get(id) {
            Some(HashSlot::Occupied(node)) => Some(&node.item),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut T> {
        match self.slots.get_mut(id) {
            Some(HashSlot::Occupied(node)) => Some(&mut node.item),
            _ => None,
        }
    }

    /// Insert an item under a precomputed hash; returns its stable id.
    pub fn insert(&mut self, hash: u64, item: T) -> usize {
        self.help_resizing();
        let id = self.alloc(HashNode {
            hash,
            next: None,
            item,
        });
        let b = self.primary.bucket(hash);
        self.node_mut(id).next = self.primary.buckets[b];
        self.primary.buckets[b] = Some(id);
        self.primary.len += 1;
        if self.stale.is_none() && self.primary.len > MAX_LOAD_FACTOR * self.primary.buckets.len() {
            self.start_resizing();
        }
        id
    }

    /// Find a live item. Probes the primary table first, then the stale
    /// one while a migration is outstanding.
    pub fn lookup(&mut self, hash: u64, mut eq: impl FnMut(&T) -> bool) -> Option<usize> {
        self.help_resizing();
        if let Some(id) = self.find_in_primary(hash, &mut eq) {
            return Some(id);
        }
        self.find_in_stale(hash, &mut eq)
    }

    /// Remove-and-return.
    pub fn pop(&mut self, hash: u64, mut eq: impl FnMut(&T) -> bool) -> Option<T> {
        self.help_resizing();
        let id = match detach(&mut self.slots, &mut self.primary, hash, &mut eq) {
            Some(id) => Some(id),
            None => self
                .stale
                .as_mut()
                .and_then(|stale| detach(&mut self.slots, stale, hash, &mut eq)),
        }?;
        Some(self.release(id))
    }

    /// All live items, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots.iter().enumerate().filter_map(|(id, slot)| match slot {
            HashSlot::Occupied(node) => Some((id, &node.item)),
            HashSlot::Vacant(_) => None,
        })
    }

    fn node(&self, id: usize) -> &HashNode<T> {
        match &self.slots[id] {
            HashSlot::Occupied(node) => node,
            HashSlot::Vacant(_) => unreachable!("vacant hash slot {id}"),
        }
    }

    fn node_mut(&mut self, id: usize) -> &mut HashNode<T> {
        match &mut self.slots[id] {
            HashSlot::Occupied(node) => node,
            HashSlot::Vacant(_) => unreachable!("vacant hash slot {id}"),
        }
    }

    fn alloc(&mut self, node: HashNode<T>) -> usize {
        match self.free {
            Some(id) => {
                self.free = match self.slots[id] {
                    HashSlot::Vacant(next) => next,
                    HashSlot::Occupied(_) => unreachable!("free list points at occupied slot"),
                };
                self.slots[id] = HashSlot::Occupied(node);
                id
            }
            None => {
                self.slots.push(HashSlot::Occupied(node));
                self.slots.len() - 1
            }
        }
    }

    fn release(&mut self, id: usize) -> T {
        match mem::replace(&mut self.slots[id], HashSlot::Vacant(self.free)) {
            HashSlot::Occupied(node) => {
                self.free = Some(id);
                node.item
            }
            HashSlot::Vacant(_) => unreachable!("releasing vacant hash slot {id}"),
        }
    }

    fn find_in_primary(&self, hash: u64, eq: &mut impl FnMut(&T) -> bool) -> Option<usize> {
        let mut cur = self.primary.buckets[self.primary.bucket(hash)];
        while let Some(id) = cur {
            let node = self.node(id);
            if node.hash == hash && eq(&node.item) {
                return Some(id);
            }
            cur = node.next;
        }
        None
    }

    fn find_in_stale(&self, hash: u64, eq: &mut impl FnMut(&T) -> bool) -> Option<usize> {
        let stale = self.stale.as_ref()?;
        let mut cur = stale.buckets[stale.bucket(hash)];
        while let Some(id) = cur {
            let node = self.node(id);
            if node.hash == hash && eq(&node.item) {
                return Some(id);
            }
            cur = node.next;
        }
        None
    }

    fn start_resizing(&mut self) {
        let doubled = BucketTable::with_buckets(self.primary.buckets.len() * 2);
        self.stale = Some(mem::replace(&mut self.primary, doubled));
        self.migrate_pos = 0;
    }

    /// Move a bounded batch of nodes from the stale table into the
    /// primary one, dropping the stale table once drained.
    fn help_resizing(&mut self) {
        let Some(stale) = self.stale.as_mut() else {
            return;
        };
        let mut moved = 0;
        while moved < RESIZE_WORK && stale.len > 0 {
            let Some(head) = stale.buckets[self.migrate_pos] else {
                self.migrate_pos += 1;
                continue;
            };
            let (hash, next) = match &self.slots[head] {
                HashSlot::Occupied(node) => (node.hash, node.next),
                HashSlot::Vacant(_) => unreachable!("vacant node in stale chain"),
            };
            stale.buckets[self.migrate_pos] = next;
            stale.len -= 1;
            let b = self.primary.bucket(hash);
            match &mut self.slots[head] {
                HashSlot::Occupied(node) => node.next = self.primary.buckets[b],
                HashSlot::Vacant(_) => unreachable!("vacant node in stale chain"),
            }
            self.primary.buckets[b] = Some(head);
            self.primary.len += 1;
            moved += 1;
        }
        if stale.len == 0 {
            self.stale = None;
            self.migrate_pos = 0;
        }
    }
}

fn detach<T>(
    slots: &mut [HashSlot<T>],
    table: &mut BucketTable,
    hash: u64,
    eq: &mut impl FnMut(&T) -> bool,
) -> Option<usize> {
    let b = table.bucket(hash);
    let mut prev: Option<usize> = None;
    let mut cur = table.buckets[b];
    while let Some(id) = cur {
        let (node_next, matched) = match &slots[id] {
            HashSlot::Occupied(node) => (node.next, node.hash == hash && eq(&node.item)),
            HashSlot::Vacant(_) => unreachable!("vacant node in chain"),
        };
        if matched {
            match prev {
                None => table.buckets[b] = node_next,
                Some(p) => match &mut slots[p] {
                    HashSlot::Occupied(node) => node.next = node_next,
                    HashSlot::Vacant(_) => unreachable!("vacant predecessor in chain"),
                },
            }
            table.len -= 1;
            return Some(id);
        }
        prev = cur;
        cur = node_next;
    }
    None
}

// ── RankedTree: AVL with subtree counts ──────────────────────────────

#[derive(Debug)]
struct TreeNode<T> {
    item: T,
    left: Option<usize>,
    right: Option<usize>,
    height: i32,
    count: usize,
}

#[derive(Debug)]
enum TreeSlot<T> {
    Occupied(TreeNode<T>),
    Vacant(Option<usize>),
}

/// Height-balanced BST over an index arena, augmented with subtree sizes
/// for O(log n) rank navigation. Parent-free: rank walks always start at
/// the root. Callers keep items unique under the supplied ordering.
#[derive(Debug)]
pub struct RankedTree<T> {
    slots: Vec<TreeSlot<T>>,
    free: Option<usize>,
    root: Option<usize>,
}

impl<T> Default for RankedTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RankedTree<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: None,
            root: None,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.count(self.root)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Payload of a live node id.
    #[must_use]
    pub fn get(&self, id: usize) -> &T {
        &self.node(id).item
    }

    pub fn insert(&mut self, item: T, cmp: &mut impl FnMut(&T, &T) -> Ordering) -> usize {
        let id = self.alloc(item);
        self.root = Some(self.insert_at(self.root, id, cmp));
        id
    }

    /// Detach and return a live node's payload. The id must have come
    /// from `insert` and not been removed since.
    pub fn remove(&mut self, id: usize, cmp: &mut impl FnMut(&T, &T) -> Ordering) -> T {
        self.root = self.remove_at(self.root, id, cmp);
        self.release(id)
    }

    /// Exact search: `probe` reports the ordering of a node's item
    /// relative to the wanted key. Never returns a near match.
    #[must_use]
    pub fn search(&self, mut probe: impl FnMut(&T) -> Ordering) -> Option<usize> {
        let mut cur = self.root;
        while let Some(id) = cur {
            cur = match probe(self.get(id)) {
                Ordering::Less => self.node(id).right,
                Ordering::Greater => self.node(id).left,
                Ordering::Equal => return Some(id),
            };
        }
        None
    }

    /// Node at `rank` (0-based in-order position), by count descent.
    #[must_use]
    pub fn select(&self, mut rank: usize) -> Option<usize> {
        let mut cur = self.root;
        while let Some(id) = cur {
            let left_count = self.count(self.node(id).left);
            match rank.cmp(&left_count) {
                Ordering::Less => cur = self.node(id).left,
                Ordering::Equal => return Some(id),
                Ordering::Greater => {
                    rank -= left_count + 1;
                    cur = self.node(id).right;
                }
            }
        }
        None
    }

    /// Rank of a live node, found by a root-down comparator descent.
    #[must_use]
    pub fn rank_of(&self, id: usize, cmp: &mut impl FnMut(&T, &T) -> Ordering) -> Option<usize> {
        let mut cur = self.root;
        let mut before = 0;
        while let Some(c) = cur {
            match cmp(self.get(id), self.get(c)) {
                Ordering::Less => cur = self.node(c).left,
                Ordering::Greater => {
                    before += self.count(self.node(c).left) + 1;
                    cur = self.node(c).right;
                }
                Ordering::Equal => return Some(before + self.count(self.node(c).left)),
            }
        }
        None
    }

    /// Node at a signed in-order distance from `id`, or `None` when the
    /// target falls outside the tree.
    #[must_use]
    pub fn offset(
        &self,
        id: usize,
        delta: i64,
        cmp: &mut impl FnMut(&T, &T) -> Ordering,
    ) -> Option<usize> {
        let rank = self.rank_of(id, cmp)? as i64 + delta;
        usize::try_from(rank).ok().and_then(|r| self.select(r))
    }

    /// Leftmost node whose item is `>=` the probed key, along with its
    /// rank; the rank is accumulated during the same descent. `probe`
    /// reports the ordering of a node's item relative to the key.
    #[must_use]
    pub fn lower_bound(&self, mut probe: impl FnMut(&T) -> Ordering) -> Option<(usize, usize)> {
        let mut cur = self.root;
        let mut before = 0;
        let mut best = None;
        while let Some(id) = cur {
            if probe(self.get(id)) == Ordering::Less {
                before += self.count(self.node(id).left) + 1;
                cur = self.node(id).right;
            } else {
                best = Some((id, before + self.count(self.node(id).left)));
                cur = self.node(id).left;
            }
        }
        best
    }

    /// Ascending in-order traversal.
    pub fn iter(&self) -> TreeIter<'_, T> {
        self.iter_from(0)
    }

    /// Ascending traversal starting at `rank`; O(log n) to seed, O(1)
    /// amortized per step.
    pub fn iter_from(&self, rank: usize) -> TreeIter<'_, T> {
        let mut stack = Vec::new();
        let mut cur = self.root;
        let mut r = rank;
        while let Some(id) = cur {
            let left_count = self.count(self.node(id).left);
            match r.cmp(&left_count) {
                Ordering::Less => {
                    stack.push(id);
                    cur = self.node(id).left;
                }
                Ordering::Equal => {
                    stack.push(id);
                    break;
                }
                Ordering::Greater => {
                    r -= left_count + 1;
                    cur = self.node(id).right;
                }
            }
        }
        TreeIter { tree: self, stack }
    }

    fn node(&self, id: usize) -> &TreeNode<T> {
        match &self.slots[id] {
            TreeSlot::Occupied(node) => node,
            TreeSlot::Vacant(_) => unreachable!("vacant tree slot {id}"),
        }
    }

    fn node_mut(&mut self, id: usize) -> &mut TreeNode<T> {
        match &mut self.slots[id] {
            TreeSlot::Occupied(node) => node,
            TreeSlot::Vacant(_) => unreachable!("vacant tree slot {id}"),
        }
    }

    fn alloc(&mut self, item: T) -> usize {
        let node = TreeNode {
            item,
            left: None,
            right: None,
            height: 0,
            count: 1,
        };
        match self.free {
            Some(id) => {
                self.free = match self.slots[id] {
                    TreeSlot::Vacant(next) => next,
                    TreeSlot::Occupied(_) => unreachable!("free list points at occupied slot"),
                };
                self.slots[id] = TreeSlot::Occupied(node);
                id
            }
            None => {
                self.slots.push(TreeSlot::Occupied(node));
                self.slots.len() - 1
            }
        }
    }

    fn release(&mut self, id: usize) -> T {
        match mem::replace(&mut self.slots[id], TreeSlot::Vacant(self.free)) {
            TreeSlot::Occupied(node) => {
                self.free = Some(id);
                node.item
            }
            TreeSlot::Vacant(_) => unreachable!("releasing vacant tree slot {id}"),
        }
    }

    fn height(&self, sub: Option<usize>) -> i32 {
        sub.map_or(-1, |id| self.node(id).height)
    }

    fn count(&self, sub: Option<usize>) -> usize {
        sub.map_or(0, |id| self.node(id).count)
    }

    fn refresh(&mut self, id: usize) {
        let (left, right) = {
            let node = self.node(id);
            (node.left, node.right)
        };
        let height = self.height(left).max(self.height(right)) + 1;
        let count = self.count(left) + self.count(right) + 1;
        let node = self.node_mut(id);
        node.height = height;
        node.count = count;
    }

    fn balance_factor(&self, id: usize) -> i32 {
        let node = self.node(id);
        self.height(node.left) - self.height(node.right)
    }

    fn insert_at(
        &mut self,
        cur: Option<usize>,
        id: usize,
        cmp: &mut impl FnMut(&T, &T) -> Ordering,
    ) -> usize {
        let Some(cur) = cur else {
            return id;
        };
        if cmp(self.get(id), self.get(cur)) == Ordering::Greater {
            let sub = self.insert_at(self.node(cur).right, id, cmp);
            self.node_mut(cur).right = Some(sub);
        } else {
            let sub = self.insert_at(self.node(cur).left, id, cmp);
            self.node_mut(cur).left = Some(sub);
        }
        self.refresh(cur);
        self.rebalance(cur)
    }

    fn remove_at(
        &mut self,
        cur: Option<usize>,
        id: usize,
        cmp: &mut impl FnMut(&T, &T) -> Ordering,
    ) -> Option<usize> {
        let cur = cur?;
        match cmp(self.get(id), self.get(cur)) {
            Ordering::Greater => {
                let sub = self.remove_at(self.node(cur).right, id, cmp);
                self.node_mut(cur).right = sub;
            }
            Ordering::Less => {
                let sub = self.remove_at(self.node(cur).left, id, cmp);
                self.node_mut(cur).left = sub;
            }
            Ordering::Equal => {
                debug_assert_eq!(cur, id, "comparator matched a different node");
                let (left, right) = {
                    let node = self.node(cur);
                    (node.left, node.right)
                };
                return match (left, right) {
                    (None, None) => None,
                    (None, Some(r)) => Some(r),
                    (Some(l), None) => Some(l),
                    (Some(l), Some(r)) => {
                        // Relink the in-order successor node; payloads
                        // never move between slots, so ids stay valid.
                        let (succ, new_right) = self.detach_min(r);
                        let node = self.node_mut(succ);
                        node.left = Some(l);
                        node.right = new_right;
                        self.refresh(succ);
                        Some(self.rebalance(succ))
                    }
                };
            }
        }
        self.refresh(cur);
        Some(self.rebalance(cur))
    }

    fn detach_min(&mut self, cur: usize) -> (usize, Option<usize>) {
        match self.node(cur).left {
            None => (cur, self.node(cur).right),
            Some(l) => {
                let (min, new_left) = self.detach_min(l);
                self.node_mut(cur).left = new_left;
                self.refresh(cur);
                (min, Some(self.rebalance(cur)))
            }
        }
    }

    fn rebalance(&mut self, id: usize) -> usize {
        let bf = self.balance_factor(id);
        if bf > 1 {
            // left-heavy
            let left = match self.node(id).left {
                Some(l) => l,
                None => unreachable!("left-heavy node without a left child"),
            };
            if self.balance_factor(left) < 0 {
                let rotated = self.rotate_left(left);
                self.node_mut(id).left = Some(rotated);
            }
            self.rotate_right(id)
        } else if bf < -1 {
            // right-heavy
            let right = match self.node(id).right {
                Some(r) => r,
                None => unreachable!("right-heavy node without a right child"),
            };
            if self.balance_factor(right) > 0 {
                let rotated = self.rotate_right(right);
                self.node_mut(id).right = Some(rotated);
            }
            self.rotate_left(id)
        } else {
            id
        }
    }

    fn rotate_right(&mut self, id: usize) -> usize {
        let left = match self.node(id).left {
            Some(l) => l,
            None => unreachable!("right rotation without a left child"),
        };
        let moved = self.node(left).right;
        self.node_mut(id).left = moved;
        self.node_mut(left).right = Some(id);
        self.refresh(id);
        self.refresh(left);
        left
    }

    fn rotate_left(&mut self, id: usize) -> usize {
        let right = match self.node(id).right {
            Some(r) => r,
            None => unreachable!("left rotation without a right child"),
        };
        let moved = self.node(right).left;
        self.node_mut(id).right = moved;
        self.node_mut(right).left = Some(id);
        self.refresh(id);
        self.refresh(right);
        right
    }
}

pub struct TreeIter<'a, T> {
    tree: &'a RankedTree<T>,
    stack: Vec<usize>,
}

impl<'a, T> Iterator for TreeIter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        let id = self.stack.pop()?;
        let mut cur = self.tree.node(id).right;
        while let Some(c) = cur {
            self.stack.push(c);
            cur = self.tree.node(c).left;
        }
        Some(self.tree.get(id))
    }
}

// ── SortedSet: hash index + ranked tree composite ────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ZMember {
    pub name: String,
    pub score: f64,
}

/// Ordered by (score, name); equal scores tie-break on ascending name,
/// which fixes the pagination order for `query`.
fn zorder(a: &ZMember, b: &ZMember) -> Ordering {
    a.score
        .total_cmp(&b.score)
        .then_with(|| a.name.cmp(&b.name))
}

/// One hash index keyed by member name (pointing at tree node ids) plus
/// one ranked tree ordered by (score, name): O(1) score lookup and
/// O(log n + k) ordered range scans over the same members.
#[derive(Debug, Default)]
pub struct SortedSet {
    index: HashIndex<usize>,
    tree: RankedTree<ZMember>,
}

impl SortedSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Insert or rescore a member. Returns true when the member is new.
    /// A changed score detaches the member from both structures and
    /// reinserts it; the tree position is a function of the score, so
    /// mutating in place would corrupt the ordering.
    pub fn add(&mut self, name: &str, score: f64) -> bool {
        let hash = hash_key(name);
        match self.find(name) {
            None => {
                let tid = self.tree.insert(
                    ZMember {
                        name: name.to_string(),
                        score,
                    },
                    &mut zorder,
                );
                self.index.insert(hash, tid);
                true
            }
            Some(tid) => {
                if self.tree.get(tid).score == score {
                    return false;
                }
                let tree = &self.tree;
                let tid = match self.index.pop(hash, |&t| tree.get(t).name == name) {
                    Some(tid) => tid,
                    None => unreachable!("member vanished between lookup and pop"),
                };
                let member = self.tree.remove(tid, &mut zorder);
                let fresh = self.tree.insert(
                    ZMember {
                        name: member.name,
                        score,
                    },
                    &mut zorder,
                );
                self.index.insert(hash, fresh);
                false
            }
        }
    }

    /// Member by name, through the hash index (no tree walk).
    #[must_use]
    pub fn lookup(&mut self, name: &str) -> Option<&ZMember> {
        let tid = self.find(name)?;
        Some(self.tree.get(tid))
    }

    #[must_use]
    pub fn score(&mut self, name: &str) -> Option<f64> {
        self.lookup(name).map(|m| m.score)
    }

    /// Tree node id of a member, via the name index.
    fn find(&mut self, name: &str) -> Option<usize> {
        let tree = &self.tree;
        let slot = self
            .index
            .lookup(hash_key(name), |&t| tree.get(t).name == name)?;
        self.index.get(slot).copied()
    }

    /// Remove a member from both structures.
    pub fn pop(&mut self, name: &str) -> Option<ZMember> {
        let tree = &self.tree;
        let tid = self
            .index
            .pop(hash_key(name), |&tid| tree.get(tid).name == name)?;
        Some(self.tree.remove(tid, &mut zorder))
    }

    /// Members at signed `offset` from the first member with
    /// `(score, name) >= (score, name)`, ascending, at most `limit`.
    #[must_use]
    pub fn query(&self, score: f64, name: &str, offset: i64, limit: usize) -> Vec<ZMember> {
        let Some((_, rank)) = self.tree.lower_bound(|m| {
            m.score
                .total_cmp(&score)
                .then_with(|| m.name.as_str().cmp(name))
        }) else {
            return Vec::new();
        };
        let Ok(start) = usize::try_from(rank as i64 + offset) else {
            return Vec::new();
        };
        self.tree.iter_from(start).take(limit).cloned().collect()
    }

    /// Full ascending (score, name) traversal.
    pub fn entries(&self) -> impl Iterator<Item = &ZMember> {
        self.tree.iter()
    }
}

// ── WorkerPool: deferred teardown off the command thread ─────────────

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool draining a bounded queue. Used only to drop large
/// detached structures off the command-processing thread; jobs are
/// fire-and-forget. A full or closed queue runs the job inline instead
/// of losing it.
pub struct WorkerPool {
    tx: Option<SyncSender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    #[must_use]
    pub fn new(threads: usize, queue_depth: usize) -> Self {
        let (tx, rx) = sync_channel::<Job>(queue_depth);
        let rx = Arc::new(Mutex::new(rx));
        let workers = (0..threads)
            .map(|_| {
                let rx = Arc::clone(&rx);
                thread::spawn(move || worker_loop(&rx))
            })
            .collect();
        Self {
            tx: Some(tx),
            workers,
        }
    }

    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        let job: Job = Box::new(job);
        match &self.tx {
            Some(tx) => match tx.try_send(job) {
                Ok(()) => {}
                Err(TrySendError::Full(job) | TrySendError::Disconnected(job)) => job(),
            },
            None => job(),
        }
    }
}

fn worker_loop(rx: &Mutex<Receiver<Job>>) {
    loop {
        let job = match rx.lock() {
            Ok(guard) => guard.recv(),
            Err(_) => return,
        };
        match job {
            Ok(job) => job(),
            Err(_) => return,
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the channel lets the workers drain and exit.
        self.tx = None;
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.len())
            .finish()
    }
}

// ── Engine: entries, TTLs, sweep ─────────────────────────────────────

#[derive(Debug)]
pub enum Value {
    Str(String),
    Zset(SortedSet),
}

#[derive(Debug)]
struct Entry {
    key: String,
    value: Value,
    heap_slot: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlValue {
    KeyMissing,
    NoExpiry,
    Remaining(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZaddOutcome {
    Inserted,
    Updated,
}

/// The data store: one hash index of typed entries plus one expiry heap.
/// Callers supply the clock (`now_ms`) on every operation; the engine
/// never reads time itself.
#[derive(Debug)]
pub struct Engine {
    index: HashIndex<Entry>,
    expiry: ExpiryHeap,
    pool: WorkerPool,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            index: HashIndex::new(),
            expiry: ExpiryHeap::new(),
            pool: WorkerPool::new(POOL_THREADS, POOL_QUEUE_DEPTH),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// String value of a key. A sorted-set entry reads as absent here;
    /// only `zadd` reports the kind conflict.
    pub fn get(&mut self, key: &str, now_ms: u64) -> Option<&str> {
        let id = self.live_entry(key, now_ms)?;
        match &self.entry(id).value {
            Value::Str(s) => Some(s.as_str()),
            Value::Zset(_) => None,
        }
    }

    /// Create or overwrite. Overwriting keeps an armed TTL untouched.
    pub fn set(&mut self, key: &str, value: &str, now_ms: u64) {
        match self.live_entry(key, now_ms) {
            Some(id) => {
                let old = mem::replace(&mut self.entry_mut(id).value, Value::Str(value.to_string()));
                self.dispose(old);
            }
            None => {
                self.index.insert(
                    hash_key(key),
                    Entry {
                        key: key.to_string(),
                        value: Value::Str(value.to_string()),
                        heap_slot: None,
                    },
                );
            }
        }
    }

    /// Remove an entry and disarm its TTL. Returns false for a missing
    /// (or already expired) key.
    pub fn del(&mut self, key: &str, now_ms: u64) -> bool {
        match self.live_entry(key, now_ms) {
            Some(id) => self.evict(id),
            None => false,
        }
    }

    /// Every live key. Expired-but-unswept entries are filtered out.
    pub fn keys(&self, now_ms: u64) -> Vec<String> {
        let expiry = &self.expiry;
        self.index
            .iter()
            .filter(|(_, entry)| match entry.heap_slot {
                Some(slot) => expiry
                    .peek(slot)
                    .is_none_or(|item| item.expires_at_ms > now_ms),
                None => true,
            })
            .map(|(_, entry)| entry.key.clone())
            .collect()
    }

    /// Add or rescore a sorted-set member, auto-vivifying the key.
    /// A string entry under the key is an error and nothing changes.
    pub fn zadd(
        &mut self,
        key: &str,
        score: f64,
        member: &str,
        now_ms: u64,
    ) -> Result<ZaddOutcome, StoreError> {
        match self.live_entry(key, now_ms) {
            Some(id) => match &mut self.entry_mut(id).value {
                Value::Zset(zs) => Ok(if zs.add(member, score) {
                    ZaddOutcome::Inserted
                } else {
                    ZaddOutcome::Updated
                }),
                Value::Str(_) => Err(StoreError::WrongType),
            },
            None => {
                let mut zs = SortedSet::new();
                zs.add(member, score);
                self.index.insert(
                    hash_key(key),
                    Entry {
                        key: key.to_string(),
                        value: Value::Zset(zs),
                        heap_slot: None,
                    },
                );
                Ok(ZaddOutcome::Inserted)
            }
        }
    }

    pub fn zrem(&mut self, key: &str, member: &str, now_ms: u64) -> Result<bool, StoreError> {
        match self.live_entry(key, now_ms) {
            Some(id) => match &mut self.entry_mut(id).value {
                Value::Zset(zs) => Ok(zs.pop(member).is_some()),
                Value::Str(_) => Err(StoreError::WrongType),
            },
            None => Ok(false),
        }
    }

    pub fn zscore(&mut self, key: &str, member: &str, now_ms: u64) -> Result<Option<f64>, StoreError> {
        match self.live_entry(key, now_ms) {
            Some(id) => match &mut self.entry_mut(id).value {
                Value::Zset(zs) => Ok(zs.score(member)),
                Value::Str(_) => Err(StoreError::WrongType),
            },
            None => Ok(None),
        }
    }

    /// Ranged scan: up to `limit` members at signed `offset` from the
    /// first member `>= (score, member)`, ascending. Absent key reads
    /// as an empty set.
    pub fn zquery(
        &mut self,
        key: &str,
        score: f64,
        member: &str,
        offset: i64,
        limit: usize,
        now_ms: u64,
    ) -> Result<Vec<ZMember>, StoreError> {
        match self.live_entry(key, now_ms) {
            Some(id) => match &self.entry(id).value {
                Value::Zset(zs) => Ok(zs.query(score, member, offset, limit)),
                Value::Str(_) => Err(StoreError::WrongType),
            },
            None => Ok(Vec::new()),
        }
    }

    /// Full ordered listing of a sorted set, `None` for an absent key.
    pub fn zshow(&mut self, key: &str, now_ms: u64) -> Result<Option<Vec<ZMember>>, StoreError> {
        match self.live_entry(key, now_ms) {
            Some(id) => match &self.entry(id).value {
                Value::Zset(zs) => Ok(Some(zs.entries().cloned().collect())),
                Value::Str(_) => Err(StoreError::WrongType),
            },
            None => Ok(None),
        }
    }

    /// Arm (`ttl_ms > 0`) or disarm (`ttl_ms <= 0`) a key's countdown.
    /// Disarming keeps the entry; it merely returns to the no-ttl state.
    /// Returns false iff the key is absent.
    pub fn expire(&mut self, key: &str, ttl_ms: i64, now_ms: u64) -> bool {
        let Some(id) = self.live_entry(key, now_ms) else {
            return false;
        };
        let slot = self.entry(id).heap_slot;
        if ttl_ms > 0 {
            let when = now_ms.saturating_add(u64::try_from(ttl_ms).unwrap_or(u64::MAX));
            let index = &mut self.index;
            let expiry = &mut self.expiry;
            let mut on_move = |owner: usize, s: usize| {
                if let Some(entry) = index.get_mut(owner) {
                    entry.heap_slot = Some(s);
                }
            };
            match slot {
                Some(slot) => expiry.update(slot, when, &mut on_move),
                None => expiry.insert(
                    HeapItem {
                        expires_at_ms: when,
                        owner: id,
                    },
                    &mut on_move,
                ),
            }
        } else if let Some(slot) = slot {
            self.detach_deadline(slot);
            self.entry_mut(id).heap_slot = None;
        }
        true
    }

    /// Remaining countdown, with absent and unarmed reported distinctly.
    pub fn ttl(&mut self, key: &str, now_ms: u64) -> TtlValue {
        let Some(id) = self.live_entry(key, now_ms) else {
            return TtlValue::KeyMissing;
        };
        match self.entry(id).heap_slot {
            None => TtlValue::NoExpiry,
            Some(slot) => match self.expiry.peek(slot) {
                Some(item) => {
                    let remain = item.expires_at_ms.saturating_sub(now_ms);
                    TtlValue::Remaining(i64::try_from(remain).unwrap_or(i64::MAX))
                }
                None => TtlValue::NoExpiry,
            },
        }
    }

    /// Evict due keys, oldest deadline first, bounded per call; the
    /// remainder waits for the next iteration.
    pub fn sweep(&mut self, now_ms: u64) -> usize {
        let mut evicted = 0;
        while evicted < SWEEP_QUOTA {
            let owner = match self.expiry.peek(0) {
                Some(item) if item.expires_at_ms <= now_ms => item.owner,
                _ => break,
            };
            if !self.evict(owner) {
                break;
            }
            evicted += 1;
        }
        evicted
    }

    fn entry(&self, id: usize) -> &Entry {
        match self.index.get(id) {
            Some(entry) => entry,
            None => unreachable!("live entry id {id} not in index"),
        }
    }

    fn entry_mut(&mut self, id: usize) -> &mut Entry {
        match self.index.get_mut(id) {
            Some(entry) => entry,
            None => unreachable!("live entry id {id} not in index"),
        }
    }

    /// Look up a key, lazily evicting it when its deadline has passed.
    fn live_entry(&mut self, key: &str, now_ms: u64) -> Option<usize> {
        let id = self.index.lookup(hash_key(key), |e| e.key == key)?;
        let due = self
            .entry(id)
            .heap_slot
            .and_then(|slot| self.expiry.peek(slot))
            .is_some_and(|item| item.expires_at_ms <= now_ms);
        if due {
            self.evict(id);
            return None;
        }
        Some(id)
    }

    fn evict(&mut self, id: usize) -> bool {
        let key = match self.index.get(id) {
            Some(entry) => entry.key.clone(),
            None => return false,
        };
        let Some(entry) = self.index.pop(hash_key(&key), |e| e.key == key) else {
            return false;
        };
        if let Some(slot) = entry.heap_slot {
            self.detach_deadline(slot);
        }
        self.dispose(entry.value);
        true
    }

    fn detach_deadline(&mut self, slot: usize) {
        let index = &mut self.index;
        self.expiry.remove(slot, &mut |owner: usize, s: usize| {
            if let Some(entry) = index.get_mut(owner) {
                entry.heap_slot = Some(s);
            }
        });
    }

    /// Large sorted sets are torn down on the worker pool so the
    /// command thread never stalls on a big deallocation.
    fn dispose(&mut self, value: Value) {
        if let Value::Zset(zs) = value {
            if zs.len() >= LARGE_ZSET_LEN {
                self.pool.execute(move || drop(zs));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cmp::Ordering;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::{Arc, Mutex};

    use proptest::prelude::*;

    use super::{
        Engine, HashIndex, RankedTree, SortedSet, StoreError, TtlValue, WorkerPool, ZaddOutcome,
        hash_key,
    };

    fn icmp(a: &i64, b: &i64) -> Ordering {
        a.cmp(b)
    }

    // ── HashIndex tests ─────────────────────────────────────────

    #[test]
    fn hash_index_insert_lookup_pop() {
        let mut idx = HashIndex::new();
        let id = idx.insert(hash_key("key"), "key".to_string());
        assert_eq!(idx.len(), 1);
        assert_eq!(idx.lookup(hash_key("key"), |k| k == "key"), Some(id));
        assert_eq!(idx.lookup(hash_key("other"), |k| k == "other"), None);
        assert_eq!(
            idx.pop(hash_key("key"), |k| k == "key"),
            Some("key".to_string())
        );
        assert_eq!(idx.len(), 0);
        assert_eq!(idx.lookup(hash_key("key"), |k| k == "key"), None);
    }

    #[test]
    fn hash_index_ids_stay_stable_across_resizes() {
        let mut idx = HashIndex::new();
        let ids: Vec<usize> = (0..500)
            .map(|i| {
                let key = format!("key{i}");
                idx.insert(hash_key(&key), key)
            })
            .collect();
        for (i, id) in ids.iter().enumerate() {
            assert_eq!(idx.get(*id).map(String::as_str), Some(format!("key{i}").as_str()));
        }
        assert_eq!(idx.len(), 500);
    }

    #[test]
    fn hash_index_drains_stale_table() {
        let mut idx = HashIndex::new();
        for i in 0..200 {
            let key = format!("key{i}");
            idx.insert(hash_key(&key), key);
        }
        // Any further traffic finishes the migration in bounded steps.
        for _ in 0..8 {
            let _ = idx.lookup(hash_key("key0"), |k| k == "key0");
        }
        assert!(idx.stale.is_none());
        assert_eq!(idx.primary.len, 200);
    }

    proptest! {
        #[test]
        fn hash_index_tracks_a_model(ops in proptest::collection::vec((0u8..3, 0u16..64), 1..400)) {
            let mut idx = HashIndex::new();
            let mut model = std::collections::HashMap::new();
            for (op, k) in ops {
                let key = format!("key{k}");
                match op {
                    0 => {
                        if !model.contains_key(&key) {
                            let id = idx.insert(hash_key(&key), key.clone());
                            model.insert(key, id);
                        }
                    }
                    1 => {
                        let expected = model.get(&key).copied();
                        let found = idx.lookup(hash_key(&key), |item| *item == key);
                        prop_assert_eq!(found, expected);
                    }
                    _ => {
                        let popped = idx.pop(hash_key(&key), |item| *item == key);
                        prop_assert_eq!(popped.is_some(), model.remove(&key).is_some());
                    }
                }
                prop_assert_eq!(idx.len(), model.len());
            }
            for (key, id) in &model {
                prop_assert_eq!(idx.lookup(hash_key(key), |item| item == key), Some(*id));
            }
        }
    }

    // ── RankedTree tests ────────────────────────────────────────

    #[test]
    fn tree_single_rotations() {
        // Ascending and descending runs force left and right rotations.
        let mut tree = RankedTree::new();
        for v in [1_i64, 2, 3] {
            tree.insert(v, &mut icmp);
        }
        assert_eq!(tree.height(tree.root), 1);
        let mut tree = RankedTree::new();
        for v in [3_i64, 2, 1] {
            tree.insert(v, &mut icmp);
        }
        assert_eq!(tree.height(tree.root), 1);
    }

    #[test]
    fn tree_double_rotations() {
        let mut tree = RankedTree::new();
        for v in [7_i64, 9, 8] {
            tree.insert(v, &mut icmp);
        }
        assert_eq!(tree.height(tree.root), 1);
        let mut tree = RankedTree::new();
        for v in [9_i64, 5, 7] {
            tree.insert(v, &mut icmp);
        }
        assert_eq!(tree.height(tree.root), 1);
    }

    #[test]
    fn tree_remove_two_children_keeps_order() {
        let mut tree = RankedTree::new();
        let mut ids = std::collections::HashMap::new();
        for v in [9_i64, 5, 3, 8, 12, 6] {
            ids.insert(v, tree.insert(v, &mut icmp));
        }
        assert_eq!(tree.remove(ids[&5], &mut icmp), 5);
        let collected: Vec<i64> = tree.iter().copied().collect();
        assert_eq!(collected, vec![3, 6, 8, 9, 12]);
        assert_eq!(tree.len(), 5);
        assert_eq!(tree.search(|v| v.cmp(&5)), None);
    }

    #[test]
    fn tree_select_and_rank_roundtrip() {
        let mut tree = RankedTree::new();
        for v in 0..64_i64 {
            tree.insert(v, &mut icmp);
        }
        for rank in 0..64 {
            let id = tree.select(rank).unwrap();
            assert_eq!(*tree.get(id), rank as i64);
            assert_eq!(tree.rank_of(id, &mut icmp), Some(rank));
        }
        assert_eq!(tree.select(64), None);
    }

    #[test]
    fn tree_offset_walks_across_subtrees() {
        let mut tree = RankedTree::new();
        let mut ids = std::collections::HashMap::new();
        for v in 0..32_i64 {
            ids.insert(v, tree.insert(v, &mut icmp));
        }
        let from = ids[&10];
        let fwd = tree.offset(from, 5, &mut icmp).unwrap();
        assert_eq!(*tree.get(fwd), 15);
        let back = tree.offset(from, -7, &mut icmp).unwrap();
        assert_eq!(*tree.get(back), 3);
        assert_eq!(tree.offset(from, 30, &mut icmp), None);
        assert_eq!(tree.offset(from, -11, &mut icmp), None);
    }

    #[test]
    fn tree_iter_from_rank_matches_full_traversal() {
        let mut tree = RankedTree::new();
        for v in [42_i64, 7, 19, 3, 88, 23, 61, 11] {
            tree.insert(v, &mut icmp);
        }
        let all: Vec<i64> = tree.iter().copied().collect();
        for start in 0..=all.len() {
            let tail: Vec<i64> = tree.iter_from(start).copied().collect();
            assert_eq!(tail, all[start.min(all.len())..]);
        }
    }

    fn assert_avl_invariants(tree: &RankedTree<i64>, id: Option<usize>) -> (i32, usize) {
        let Some(id) = id else {
            return (-1, 0);
        };
        let node = tree.node(id);
        let (lh, lc) = assert_avl_invariants(tree, node.left);
        let (rh, rc) = assert_avl_invariants(tree, node.right);
        assert!((lh - rh).abs() <= 1, "unbalanced at {}", node.item);
        assert_eq!(node.height, lh.max(rh) + 1);
        assert_eq!(node.count, lc + rc + 1);
        (node.height, node.count)
    }

    proptest! {
        #[test]
        fn tree_stays_sorted_and_balanced(values in proptest::collection::vec(-1000i64..1000, 1..200), removals in proptest::collection::vec(any::<prop::sample::Index>(), 0..50)) {
            let mut tree = RankedTree::new();
            let mut live = std::collections::BTreeMap::new();
            for v in values {
                if !live.contains_key(&v) {
                    live.insert(v, tree.insert(v, &mut icmp));
                }
            }
            for pick in removals {
                if live.is_empty() {
                    break;
                }
                let key = *pick.get(&live.keys().copied().collect::<Vec<_>>());
                let id = live.remove(&key).unwrap();
                prop_assert_eq!(tree.remove(id, &mut icmp), key);
            }
            let inorder: Vec<i64> = tree.iter().copied().collect();
            let expected: Vec<i64> = live.keys().copied().collect();
            prop_assert_eq!(&inorder, &expected);
            prop_assert_eq!(tree.len(), live.len());
            assert_avl_invariants(&tree, tree.root);
            for (rank, v) in expected.iter().enumerate() {
                let id = tree.select(rank).unwrap();
                prop_assert_eq!(tree.get(id), v);
            }
        }
    }

    // ── SortedSet tests ─────────────────────────────────────────

    #[test]
    fn zset_add_then_query_finds_member() {
        let mut zs = SortedSet::new();
        assert!(zs.add("alice", 3.0));
        let hits = zs.query(3.0, "alice", 0, 1);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "alice");
        assert_eq!(hits[0].score, 3.0);
    }

    #[test]
    fn zset_rescore_moves_the_member() {
        let mut zs = SortedSet::new();
        assert!(zs.add("alice", 1.0));
        assert!(!zs.add("alice", 9.0));
        assert_eq!(zs.len(), 1);
        // Nothing remains at the old tree position; the seek lands on
        // the reinserted member.
        let at_old = zs.query(1.0, "alice", 0, 1);
        assert_eq!(at_old.len(), 1);
        assert_eq!(at_old[0].score, 9.0);
        assert_eq!(zs.score("alice"), Some(9.0));
        // Equal-score re-add is a no-op.
        assert!(!zs.add("alice", 9.0));
        assert_eq!(zs.len(), 1);
    }

    #[test]
    fn zset_equal_scores_order_by_name() {
        let mut zs = SortedSet::new();
        for name in ["delta", "bravo", "echo", "alpha", "charlie"] {
            zs.add(name, 1.0);
        }
        let names: Vec<&str> = zs.entries().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "bravo", "charlie", "delta", "echo"]);
    }

    #[test]
    fn zset_query_offset_and_limit() {
        let mut zs = SortedSet::new();
        for (name, score) in [("a", 1.0), ("b", 2.0), ("c", 3.0), ("d", 4.0), ("e", 5.0)] {
            zs.add(name, score);
        }
        let page: Vec<String> = zs.query(2.0, "", 1, 2).into_iter().map(|m| m.name).collect();
        assert_eq!(page, vec!["c", "d"]);
        assert!(zs.query(2.0, "", 10, 2).is_empty());
        assert!(zs.query(9.0, "", 0, 2).is_empty());
        let from_start: Vec<String> = zs.query(0.0, "", 0, 3).into_iter().map(|m| m.name).collect();
        assert_eq!(from_start, vec!["a", "b", "c"]);
    }

    #[test]
    fn zset_pop_detaches_from_both_structures() {
        let mut zs = SortedSet::new();
        zs.add("a", 1.0);
        zs.add("b", 2.0);
        assert_eq!(zs.lookup("a").map(|m| m.score), Some(1.0));
        let popped = zs.pop("a").unwrap();
        assert_eq!(popped.name, "a");
        assert!(zs.lookup("a").is_none());
        assert_eq!(zs.len(), 1);
        assert_eq!(zs.score("a"), None);
        assert!(zs.query(1.0, "", 0, 10).iter().all(|m| m.name != "a"));
        assert!(zs.pop("a").is_none());
    }

    // ── WorkerPool tests ────────────────────────────────────────

    #[test]
    fn pool_runs_jobs_and_drains_on_drop() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = WorkerPool::new(2, 8);
            for _ in 0..32 {
                let counter = Arc::clone(&counter);
                pool.execute(move || {
                    counter.fetch_add(1, AtomicOrdering::SeqCst);
                });
            }
        }
        // Drop joins the workers, so every job has run.
        assert_eq!(counter.load(AtomicOrdering::SeqCst), 32);
    }

    #[test]
    fn pool_full_queue_falls_back_inline() {
        let gate = Arc::new(Mutex::new(()));
        let counter = Arc::new(AtomicUsize::new(0));
        let blocker = gate.lock().unwrap();
        let pool = WorkerPool::new(1, 1);
        // One job parks the worker, one fills the queue, the rest must
        // run inline on this thread.
        {
            let gate = Arc::clone(&gate);
            pool.execute(move || {
                let _unused = gate.lock();
            });
        }
        for _ in 0..4 {
            let counter = Arc::clone(&counter);
            pool.execute(move || {
                counter.fetch_add(1, AtomicOrdering::SeqCst);
            });
        }
        assert!(counter.load(AtomicOrdering::SeqCst) >= 3);
        drop(blocker);
        drop(pool);
        assert_eq!(counter.load(AtomicOrdering::SeqCst), 4);
    }

    // ── Engine tests ────────────────────────────────────────────

    #[test]
    fn set_get_and_del() {
        let mut engine = Engine::new();
        engine.set("a", "1", 100);
        assert_eq!(engine.get("a", 100), Some("1"));
        assert!(engine.del("a", 100));
        assert_eq!(engine.get("a", 100), None);
        assert!(!engine.del("a", 100));
    }

    #[test]
    fn get_on_sorted_set_reads_as_absent() {
        let mut engine = Engine::new();
        engine.zadd("z", 1.0, "m", 0).unwrap();
        assert_eq!(engine.get("z", 0), None);
    }

    #[test]
    fn zadd_reports_update_and_rescores() {
        let mut engine = Engine::new();
        assert_eq!(engine.zadd("z", 1.0, "m", 0), Ok(ZaddOutcome::Inserted));
        assert_eq!(engine.zadd("z", 2.0, "m", 0), Ok(ZaddOutcome::Updated));
        assert_eq!(engine.zscore("z", "m", 0), Ok(Some(2.0)));
    }

    #[test]
    fn zadd_on_string_key_is_an_error_and_mutates_nothing() {
        let mut engine = Engine::new();
        engine.set("k", "v", 0);
        assert_eq!(engine.zadd("k", 1.0, "m", 0), Err(StoreError::WrongType));
        assert_eq!(engine.get("k", 0), Some("v"));
    }

    #[test]
    fn zrem_and_zquery() {
        let mut engine = Engine::new();
        for (m, s) in [("a", 1.0), ("b", 2.0), ("c", 3.0)] {
            engine.zadd("z", s, m, 0).unwrap();
        }
        assert_eq!(engine.zrem("z", "b", 0), Ok(true));
        assert_eq!(engine.zrem("z", "b", 0), Ok(false));
        let names: Vec<String> = engine
            .zquery("z", 0.0, "", 0, 10, 0)
            .unwrap()
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(names, vec!["a", "c"]);
        assert_eq!(engine.zquery("missing", 0.0, "", 0, 10, 0), Ok(Vec::new()));
    }

    #[test]
    fn expire_arms_and_sweep_evicts() {
        let mut engine = Engine::new();
        engine.set("a", "1", 1_000);
        assert!(engine.expire("a", 10, 1_000));
        assert_eq!(engine.ttl("a", 1_000), TtlValue::Remaining(10));
        assert_eq!(engine.sweep(1_005), 0);
        assert_eq!(engine.sweep(1_010), 1);
        assert_eq!(engine.get("a", 1_010), None);
    }

    #[test]
    fn expire_nonpositive_disarms_without_deleting() {
        let mut engine = Engine::new();
        engine.set("a", "1", 0);
        assert!(engine.expire("a", 500, 0));
        assert_eq!(engine.ttl("a", 0), TtlValue::Remaining(500));
        assert!(engine.expire("a", -1, 0));
        assert_eq!(engine.ttl("a", 0), TtlValue::NoExpiry);
        assert_eq!(engine.get("a", 10_000), Some("1"));
    }

    #[test]
    fn ttl_reports_absent_and_unarmed_distinctly() {
        let mut engine = Engine::new();
        assert_eq!(engine.ttl("missing", 0), TtlValue::KeyMissing);
        engine.set("a", "1", 0);
        assert_eq!(engine.ttl("a", 0), TtlValue::NoExpiry);
        assert!(!engine.expire("missing", 100, 0));
    }

    #[test]
    fn lazy_expiry_hides_due_keys_before_sweep() {
        let mut engine = Engine::new();
        engine.set("a", "1", 0);
        engine.expire("a", 50, 0);
        assert_eq!(engine.get("a", 49), Some("1"));
        assert_eq!(engine.get("a", 50), None);
        assert_eq!(engine.ttl("a", 51), TtlValue::KeyMissing);
    }

    #[test]
    fn sweep_respects_quota() {
        let mut engine = Engine::new();
        for i in 0..250 {
            let key = format!("key{i}");
            engine.set(&key, "v", 0);
            engine.expire(&key, 10, 0);
        }
        assert_eq!(engine.sweep(100), 200);
        assert_eq!(engine.sweep(100), 50);
        assert_eq!(engine.sweep(100), 0);
        assert!(engine.keys(100).is_empty());
    }

    #[test]
    fn set_overwrite_keeps_ttl() {
        let mut engine = Engine::new();
        engine.set("a", "1", 0);
        engine.expire("a", 100, 0);
        engine.set("a", "2", 10);
        assert_eq!(engine.ttl("a", 10), TtlValue::Remaining(90));
        assert_eq!(engine.get("a", 99), Some("2"));
        assert_eq!(engine.get("a", 100), None);
    }

    #[test]
    fn heap_backrefs_survive_interleaved_expiry_changes() {
        let mut engine = Engine::new();
        for i in 0..40 {
            let key = format!("key{i}");
            engine.set(&key, "v", 0);
            engine.expire(&key, 1_000 - i64::from(i), 0);
        }
        // Rescheduling and disarming shuffle the heap; back-references
        // must keep every ttl answer consistent.
        for i in (0..40).step_by(3) {
            let key = format!("key{i}");
            engine.expire(&key, 10_000 + i64::from(i), 0);
        }
        for i in (0..40).step_by(5) {
            let key = format!("key{i}");
            engine.expire(&key, -1, 0);
        }
        for i in 0..40_i64 {
            let key = format!("key{i}");
            let ttl = engine.ttl(&key, 0);
            if i % 5 == 0 {
                assert_eq!(ttl, TtlValue::NoExpiry, "key{i}");
            } else if i % 3 == 0 {
                assert_eq!(ttl, TtlValue::Remaining(10_000 + i), "key{i}");
            } else {
                assert_eq!(ttl, TtlValue::Remaining(1_000 - i), "key{i}");
            }
        }
    }

    #[test]
    fn del_missing_and_expired_report_not_found() {
        let mut engine = Engine::new();
        engine.set("a", "1", 0);
        engine.expire("a", 10, 0);
        assert!(!engine.del("a", 11));
        assert!(!engine.del("never", 0));
    }

    #[test]
    fn deleting_a_large_sorted_set_hands_it_to_the_pool() {
        let mut engine = Engine::new();
        for i in 0..1_100 {
            let member = format!("m{i:04}");
            engine.zadd("big", f64::from(i), &member, 0).unwrap();
        }
        assert!(engine.del("big", 0));
        assert_eq!(engine.zscore("big", "m0000", 0), Ok(None));
        assert_eq!(engine.get("big", 0), None);
        // Dropping the engine joins the pool, so the teardown finished.
    }

    #[test]
    fn thousand_keys_roundtrip_across_resizes() {
        let mut engine = Engine::new();
        for i in 0..1_000 {
            let key = format!("key{i}");
            let value = format!("value{i}");
            engine.set(&key, &value, 0);
        }
        assert_eq!(engine.len(), 1_000);
        for i in 0..1_000 {
            let key = format!("key{i}");
            let value = format!("value{i}");
            assert_eq!(engine.get(&key, 0), Some(value.as_str()), "{key}");
        }
        assert_eq!(engine.keys(0).len(), 1_000);
    }
}
