//! Persistent id-keyed map
//!
//! A structurally-shared radix trie over the 64-bit ref id, branching 32
//! ways on 5-bit key chunks. `with` and `without` copy only the nodes on
//! the path from the root to the touched slot and share every other subtree
//! with the original, so replacing the committed world costs O(depth) map
//! work per touched ref instead of a full copy. Clones are O(1).

use refstm_core::RefId;
use std::sync::Arc;

const BITS: u32 = 5;
const MASK: u64 = (1 << BITS) - 1;

enum Node<V> {
    Leaf(u64, V),
    /// Bitmap of occupied chunk indices; children sorted by chunk index.
    Branch(u32, Vec<Arc<Node<V>>>),
}

/// Outcome of removing a key from a subtree.
enum Removal<V> {
    /// Key absent; the subtree is unchanged.
    Untouched,
    /// The subtree became empty.
    Empty,
    Replaced(Arc<Node<V>>),
}

pub(crate) struct PersistentMap<V> {
    root: Option<Arc<Node<V>>>,
    len: usize,
}

impl<V> Clone for PersistentMap<V> {
    fn clone(&self) -> Self {
        PersistentMap {
            root: self.root.clone(),
            len: self.len,
        }
    }
}

impl<V> PersistentMap<V> {
    pub fn new() -> Self {
        PersistentMap { root: None, len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn get(&self, id: RefId) -> Option<&V> {
        let key = id.as_u64();
        let mut node = self.root.as_deref()?;
        let mut shift = 0u32;
        loop {
            match node {
                Node::Leaf(k, v) => return (*k == key).then_some(v),
                Node::Branch(bitmap, children) => {
                    let bit = 1u32 << ((key >> shift) & MASK);
                    if bitmap & bit == 0 {
                        return None;
                    }
                    let pos = (bitmap & (bit - 1)).count_ones() as usize;
                    node = &children[pos];
                    shift += BITS;
                }
            }
        }
    }

    pub fn contains(&self, id: RefId) -> bool {
        self.get(id).is_some()
    }

    /// Copy of this map with `value` bound to `id`.
    pub fn with(&self, id: RefId, value: V) -> Self {
        let key = id.as_u64();
        let mut added = true;
        let root = match &self.root {
            None => Arc::new(Node::Leaf(key, value)),
            Some(root) => Self::insert_at(root, key, value, 0, &mut added),
        };
        PersistentMap {
            root: Some(root),
            len: self.len + usize::from(added),
        }
    }

    fn insert_at(
        node: &Arc<Node<V>>,
        key: u64,
        value: V,
        shift: u32,
        added: &mut bool,
    ) -> Arc<Node<V>> {
        match node.as_ref() {
            Node::Leaf(k, _) if *k == key => {
                *added = false;
                Arc::new(Node::Leaf(key, value))
            }
            Node::Leaf(k, _) => Self::split(
                *k,
                Arc::clone(node),
                key,
                Arc::new(Node::Leaf(key, value)),
                shift,
            ),
            Node::Branch(bitmap, children) => {
                let bit = 1u32 << ((key >> shift) & MASK);
                let pos = (bitmap & (bit - 1)).count_ones() as usize;
                let mut next = children.clone();
                if bitmap & bit == 0 {
                    next.insert(pos, Arc::new(Node::Leaf(key, value)));
                    Arc::new(Node::Branch(bitmap | bit, next))
                } else {
                    next[pos] = Self::insert_at(&children[pos], key, value, shift + BITS, added);
                    Arc::new(Node::Branch(*bitmap, next))
                }
            }
        }
    }

    /// Branch holding two leaves with distinct keys. Recurses past the
    /// chunks the keys share; distinct keys always diverge within the 64
    /// bits, so this terminates.
    fn split(ka: u64, a: Arc<Node<V>>, kb: u64, b: Arc<Node<V>>, shift: u32) -> Arc<Node<V>> {
        let ia = ((ka >> shift) & MASK) as u32;
        let ib = ((kb >> shift) & MASK) as u32;
        if ia == ib {
            let child = Self::split(ka, a, kb, b, shift + BITS);
            Arc::new(Node::Branch(1 << ia, vec![child]))
        } else if ia < ib {
            Arc::new(Node::Branch((1 << ia) | (1 << ib), vec![a, b]))
        } else {
            Arc::new(Node::Branch((1 << ia) | (1 << ib), vec![b, a]))
        }
    }

    /// Copy of this map without `id`. Absent keys leave the map unchanged.
    pub fn without(&self, id: RefId) -> Self {
        let Some(root) = &self.root else {
            return self.clone();
        };
        match Self::remove_at(root, id.as_u64(), 0) {
            Removal::Untouched => self.clone(),
            Removal::Empty => PersistentMap {
                root: None,
                len: self.len - 1,
            },
            Removal::Replaced(node) => PersistentMap {
                root: Some(node),
                len: self.len - 1,
            },
        }
    }

    fn remove_at(node: &Arc<Node<V>>, key: u64, shift: u32) -> Removal<V> {
        match node.as_ref() {
            Node::Leaf(k, _) if *k == key => Removal::Empty,
            Node::Leaf(..) => Removal::Untouched,
            Node::Branch(bitmap, children) => {
                let bit = 1u32 << ((key >> shift) & MASK);
                if bitmap & bit == 0 {
                    return Removal::Untouched;
                }
                let pos = (bitmap & (bit - 1)).count_ones() as usize;
                match Self::remove_at(&children[pos], key, shift + BITS) {
                    Removal::Untouched => Removal::Untouched,
                    Removal::Empty => {
                        if children.len() == 1 {
                            return Removal::Empty;
                        }
                        let mut next = children.clone();
                        next.remove(pos);
                        // A branch left holding a single leaf collapses; the
                        // leaf carries its full key, so depth is positional
                        // convenience only.
                        if next.len() == 1 {
                            if let Node::Leaf(..) = next[0].as_ref() {
                                return Removal::Replaced(next.remove(0));
                            }
                        }
                        Removal::Replaced(Arc::new(Node::Branch(bitmap & !bit, next)))
                    }
                    Removal::Replaced(child) => {
                        if children.len() == 1 {
                            if let Node::Leaf(..) = child.as_ref() {
                                return Removal::Replaced(child);
                            }
                        }
                        let mut next = children.clone();
                        next[pos] = child;
                        Removal::Replaced(Arc::new(Node::Branch(*bitmap, next)))
                    }
                }
            }
        }
    }
}
