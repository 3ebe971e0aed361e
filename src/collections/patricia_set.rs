//! Persistent sets of unsigned integers.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use super::{branching_bit, is_zero_bit, mask, match_prefix, PatriciaKey};

#[derive(Debug)]
enum Node {
    Leaf {
        key: u64,
    },
    Branch {
        prefix: u64,
        bit: u64,
        left: Arc<Node>,
        right: Arc<Node>,
    },
}

type Tree = Option<Arc<Node>>;

/// A persistent set of integer-encodable keys.
///
/// All mutating operations replace the root with a tree sharing every
/// unchanged subtree with the previous version, so clones are O(1) and held
/// snapshots stay valid.
pub struct PatriciaTreeSet<K: PatriciaKey> {
    root: Tree,
    _marker: PhantomData<K>,
}

impl<K: PatriciaKey> Clone for PatriciaTreeSet<K> {
    fn clone(&self) -> Self {
        PatriciaTreeSet {
            root: self.root.clone(),
            _marker: PhantomData,
        }
    }
}

impl<K: PatriciaKey> Default for PatriciaTreeSet<K> {
    fn default() -> Self {
        PatriciaTreeSet {
            root: None,
            _marker: PhantomData,
        }
    }
}

impl<K: PatriciaKey> PatriciaTreeSet<K> {
    /// The empty set.
    #[must_use]
    pub fn new() -> Self {
        PatriciaTreeSet::default()
    }

    /// True when no key is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Number of keys. Linear in the size of the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Membership test.
    #[must_use]
    pub fn contains(&self, key: K) -> bool {
        contains(key.encode(), self.root.as_ref())
    }

    /// Inserts a key.
    pub fn insert(&mut self, key: K) -> &mut Self {
        self.root = insert(key.encode(), self.root.take());
        self
    }

    /// Removes a key.
    pub fn remove(&mut self, key: K) -> &mut Self {
        self.root = remove(key.encode(), self.root.take());
        self
    }

    /// Set union in place.
    pub fn union_with(&mut self, other: &Self) -> &mut Self {
        self.root = merge(self.root.take(), other.root.clone());
        self
    }

    /// Set intersection in place.
    pub fn intersection_with(&mut self, other: &Self) -> &mut Self {
        self.root = intersect(self.root.clone(), other.root.clone());
        self
    }

    /// Subset test; sublinear when the trees share structure.
    #[must_use]
    pub fn is_subset_of(&self, other: &Self) -> bool {
        is_subset_of(self.root.as_ref(), other.root.as_ref())
    }

    /// Structural equality; sublinear when the trees share structure.
    #[must_use]
    pub fn equals(&self, other: &Self) -> bool {
        equals(self.root.as_ref(), other.root.as_ref())
    }

    /// Drops every key.
    pub fn clear(&mut self) {
        self.root = None;
    }

    /// Iterates keys (trie order).
    pub fn iter(&self) -> impl Iterator<Item = K> + '_ {
        Iter {
            stack: Vec::new(),
            next: self.root.clone(),
            _marker: PhantomData::<K>,
        }
    }

    /// Pointer identity of the root, for sharing assertions.
    #[must_use]
    pub fn root_ptr(&self) -> usize {
        self.root
            .as_ref()
            .map_or(0, |node| Arc::as_ptr(node) as usize)
    }
}

impl<K: PatriciaKey> PartialEq for PatriciaTreeSet<K> {
    fn eq(&self, other: &Self) -> bool {
        self.equals(other)
    }
}

impl<K: PatriciaKey> Eq for PatriciaTreeSet<K> {}

impl<K: PatriciaKey + fmt::Debug> fmt::Debug for PatriciaTreeSet<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl<K: PatriciaKey> FromIterator<K> for PatriciaTreeSet<K> {
    fn from_iter<I: IntoIterator<Item = K>>(iter: I) -> Self {
        let mut set = PatriciaTreeSet::new();
        for key in iter {
            set.insert(key);
        }
        set
    }
}

impl<K: PatriciaKey> Extend<K> for PatriciaTreeSet<K> {
    fn extend<I: IntoIterator<Item = K>>(&mut self, iter: I) {
        for key in iter {
            self.insert(key);
        }
    }
}

struct Iter<K> {
    stack: Vec<Arc<Node>>,
    next: Tree,
    _marker: PhantomData<K>,
}

impl<K: PatriciaKey> Iterator for Iter<K> {
    type Item = K;

    fn next(&mut self) -> Option<K> {
        let mut cur = self.next.take().or_else(|| self.stack.pop())?;
        loop {
            match &*cur {
                Node::Leaf { key } => return Some(K::decode(*key)),
                Node::Branch { left, right, .. } => {
                    self.stack.push(right.clone());
                    cur = left.clone();
                }
            }
        }
    }
}

fn leaf(key: u64) -> Arc<Node> {
    Arc::new(Node::Leaf { key })
}

fn join(prefix0: u64, tree0: Arc<Node>, prefix1: u64, tree1: Arc<Node>) -> Arc<Node> {
    let m = branching_bit(prefix0, prefix1);
    if is_zero_bit(prefix0, m) {
        Arc::new(Node::Branch {
            prefix: mask(prefix0, m),
            bit: m,
            left: tree0,
            right: tree1,
        })
    } else {
        Arc::new(Node::Branch {
            prefix: mask(prefix0, m),
            bit: m,
            left: tree1,
            right: tree0,
        })
    }
}

// Prevents branch nodes with a single child when a removal empties a side.
fn make_branch(prefix: u64, bit: u64, left: Tree, right: Tree) -> Tree {
    match (left, right) {
        (None, right) => right,
        (left, None) => left,
        (Some(left), Some(right)) => Some(Arc::new(Node::Branch {
            prefix,
            bit,
            left,
            right,
        })),
    }
}

fn contains(key: u64, tree: Option<&Arc<Node>>) -> bool {
    let Some(node) = tree else {
        return false;
    };
    match &**node {
        Node::Leaf { key: k } => *k == key,
        Node::Branch {
            bit, left, right, ..
        } => {
            if is_zero_bit(key, *bit) {
                contains(key, Some(left))
            } else {
                contains(key, Some(right))
            }
        }
    }
}

fn insert(key: u64, tree: Tree) -> Tree {
    let Some(node) = tree else {
        return Some(leaf(key));
    };
    match &*node {
        Node::Leaf { key: k } => {
            if *k == key {
                Some(node.clone())
            } else {
                Some(join(key, leaf(key), *k, node.clone()))
            }
        }
        Node::Branch {
            prefix,
            bit,
            left,
            right,
        } => {
            if match_prefix(key, *prefix, *bit) {
                if is_zero_bit(key, *bit) {
                    let new_left = insert(key, Some(left.clone()));
                    match new_left {
                        Some(ref nl) if Arc::ptr_eq(nl, left) => Some(node.clone()),
                        _ => make_branch(*prefix, *bit, new_left, Some(right.clone())),
                    }
                } else {
                    let new_right = insert(key, Some(right.clone()));
                    match new_right {
                        Some(ref nr) if Arc::ptr_eq(nr, right) => Some(node.clone()),
                        _ => make_branch(*prefix, *bit, Some(left.clone()), new_right),
                    }
                }
            } else {
                Some(join(key, leaf(key), *prefix, node.clone()))
            }
        }
    }
}

fn remove(key: u64, tree: Tree) -> Tree {
    let node = tree?;
    match &*node {
        Node::Leaf { key: k } => {
            if *k == key {
                None
            } else {
                Some(node.clone())
            }
        }
        Node::Branch {
            prefix,
            bit,
            left,
            right,
        } => {
            if !match_prefix(key, *prefix, *bit) {
                return Some(node.clone());
            }
            if is_zero_bit(key, *bit) {
                let new_left = remove(key, Some(left.clone()));
                match new_left {
                    Some(ref nl) if Arc::ptr_eq(nl, left) => Some(node.clone()),
                    _ => make_branch(*prefix, *bit, new_left, Some(right.clone())),
                }
            } else {
                let new_right = remove(key, Some(right.clone()));
                match new_right {
                    Some(ref nr) if Arc::ptr_eq(nr, right) => Some(node.clone()),
                    _ => make_branch(*prefix, *bit, Some(left.clone()), new_right),
                }
            }
        }
    }
}

fn equals(tree1: Option<&Arc<Node>>, tree2: Option<&Arc<Node>>) -> bool {
    match (tree1, tree2) {
        (None, None) => true,
        (Some(a), Some(b)) => {
            if Arc::ptr_eq(a, b) {
                // Shared structure: equal without descending.
                return true;
            }
            match (&**a, &**b) {
                (Node::Leaf { key: k1 }, Node::Leaf { key: k2 }) => k1 == k2,
                (
                    Node::Branch {
                        prefix: p1,
                        bit: m1,
                        left: l1,
                        right: r1,
                    },
                    Node::Branch {
                        prefix: p2,
                        bit: m2,
                        left: l2,
                        right: r2,
                    },
                ) => {
                    p1 == p2
                        && m1 == m2
                        && equals(Some(l1), Some(l2))
                        && equals(Some(r1), Some(r2))
                }
                _ => false,
            }
        }
        _ => false,
    }
}

fn is_subset_of(tree1: Option<&Arc<Node>>, tree2: Option<&Arc<Node>>) -> bool {
    match (tree1, tree2) {
        (None, _) => true,
        (Some(a), Some(b)) if Arc::ptr_eq(a, b) => true,
        (Some(_), None) => false,
        (Some(a), Some(b)) => match (&**a, &**b) {
            (Node::Leaf { key }, _) => contains(*key, Some(b)),
            (Node::Branch { .. }, Node::Leaf { .. }) => false,
            (
                Node::Branch {
                    prefix: p1,
                    bit: m1,
                    left: l1,
                    right: r1,
                },
                Node::Branch {
                    prefix: p2,
                    bit: m2,
                    left: l2,
                    right: r2,
                },
            ) => {
                if p1 == p2 && m1 == m2 {
                    is_subset_of(Some(l1), Some(l2)) && is_subset_of(Some(r1), Some(r2))
                } else if m1 > m2 && match_prefix(*p1, *p2, *m2) {
                    // tree1 spans a narrower key range contained in one side
                    // of tree2.
                    if is_zero_bit(*p1, *m2) {
                        is_subset_of(Some(a), Some(l2))
                    } else {
                        is_subset_of(Some(a), Some(r2))
                    }
                } else {
                    false
                }
            }
        },
    }
}

fn merge(s: Tree, t: Tree) -> Tree {
    match (s, t) {
        (None, t) => t,
        (s, None) => s,
        (Some(s), Some(t)) => {
            if Arc::ptr_eq(&s, &t) {
                // Sharing shortcut: the union of a tree with itself is itself.
                return Some(s);
            }
            match (&*s, &*t) {
                (Node::Leaf { key }, _) => insert(*key, Some(t.clone())),
                (_, Node::Leaf { key }) => insert(*key, Some(s.clone())),
                (
                    Node::Branch {
                        prefix: p,
                        bit: m,
                        left: s0,
                        right: s1,
                    },
                    Node::Branch {
                        prefix: q,
                        bit: n,
                        left: t0,
                        right: t1,
                    },
                ) => {
                    if m == n && p == q {
                        // Same prefix: merge the subtrees.
                        let new_left = merge(Some(s0.clone()), Some(t0.clone()));
                        let new_right = merge(Some(s1.clone()), Some(t1.clone()));
                        if tree_ptr_eq(&new_left, s0) && tree_ptr_eq(&new_right, s1) {
                            return Some(s.clone());
                        }
                        if tree_ptr_eq(&new_left, t0) && tree_ptr_eq(&new_right, t1) {
                            return Some(t.clone());
                        }
                        make_branch(*p, *m, new_left, new_right)
                    } else if m < n && match_prefix(*q, *p, *m) {
                        // q contains p: merge t with a subtree of s.
                        if is_zero_bit(*q, *m) {
                            let new_left = merge(Some(s0.clone()), Some(t.clone()));
                            if tree_ptr_eq(&new_left, s0) {
                                return Some(s.clone());
                            }
                            make_branch(*p, *m, new_left, Some(s1.clone()))
                        } else {
                            let new_right = merge(Some(s1.clone()), Some(t.clone()));
                            if tree_ptr_eq(&new_right, s1) {
                                return Some(s.clone());
                            }
                            make_branch(*p, *m, Some(s0.clone()), new_right)
                        }
                    } else if m > n && match_prefix(*p, *q, *n) {
                        // p contains q: merge s with a subtree of t.
                        if is_zero_bit(*p, *n) {
                            let new_left = merge(Some(s.clone()), Some(t0.clone()));
                            if tree_ptr_eq(&new_left, t0) {
                                return Some(t.clone());
                            }
                            make_branch(*q, *n, new_left, Some(t1.clone()))
                        } else {
                            let new_right = merge(Some(s.clone()), Some(t1.clone()));
                            if tree_ptr_eq(&new_right, t1) {
                                return Some(t.clone());
                            }
                            make_branch(*q, *n, Some(t0.clone()), new_right)
                        }
                    } else {
                        // The prefixes disagree.
                        Some(join(*p, s.clone(), *q, t.clone()))
                    }
                }
            }
        }
    }
}

fn tree_ptr_eq(tree: &Tree, node: &Arc<Node>) -> bool {
    tree.as_ref().is_some_and(|t| Arc::ptr_eq(t, node))
}

fn intersect(s: Tree, t: Tree) -> Tree {
    match (s, t) {
        (None, _) | (_, None) => None,
        (Some(s), Some(t)) => {
            if Arc::ptr_eq(&s, &t) {
                return Some(s);
            }
            match (&*s, &*t) {
                (Node::Leaf { key }, _) => {
                    if contains(*key, Some(&t)) {
                        Some(s.clone())
                    } else {
                        None
                    }
                }
                (_, Node::Leaf { key }) => {
                    if contains(*key, Some(&s)) {
                        Some(t.clone())
                    } else {
                        None
                    }
                }
                (
                    Node::Branch {
                        prefix: p,
                        bit: m,
                        left: s0,
                        right: s1,
                    },
                    Node::Branch {
                        prefix: q,
                        bit: n,
                        left: t0,
                        right: t1,
                    },
                ) => {
                    if m == n && p == q {
                        let new_left = intersect(Some(s0.clone()), Some(t0.clone()));
                        let new_right = intersect(Some(s1.clone()), Some(t1.clone()));
                        make_branch(*p, *m, new_left, new_right)
                    } else if m < n && match_prefix(*q, *p, *m) {
                        let side = if is_zero_bit(*q, *m) { s0 } else { s1 };
                        intersect(Some(side.clone()), Some(t.clone()))
                    } else if m > n && match_prefix(*p, *q, *n) {
                        let side = if is_zero_bit(*p, *n) { t0 } else { t1 };
                        intersect(Some(s.clone()), Some(side.clone()))
                    } else {
                        None
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(keys: &[u32]) -> PatriciaTreeSet<u32> {
        keys.iter().copied().collect()
    }

    #[test]
    fn test_insert_contains_remove() {
        let mut s = PatriciaTreeSet::<u32>::new();
        assert!(s.is_empty());
        s.insert(3).insert(17).insert(3).insert(0);
        assert_eq!(s.len(), 3);
        assert!(s.contains(17));
        assert!(!s.contains(5));
        s.remove(17);
        assert!(!s.contains(17));
        assert_eq!(s.len(), 2);
        // Removing an absent key leaves the tree untouched.
        let before = s.root_ptr();
        s.remove(1000);
        assert_eq!(s.root_ptr(), before);
    }

    #[test]
    fn test_canonical_equality() {
        // Same key set built in different orders: structurally identical.
        let a = set(&[1, 2, 3, 300, 77]);
        let b = set(&[300, 77, 3, 2, 1]);
        assert_eq!(a, b);
        assert!(a.is_subset_of(&b));
    }

    #[test]
    fn test_union_preserves_sharing() {
        let a = set(&[1, 2, 3]);
        let mut b = a.clone();
        b.union_with(&set(&[]));
        assert_eq!(a.root_ptr(), b.root_ptr());
        // Union with itself must not rebuild.
        let mut c = a.clone();
        let c_snapshot = c.clone();
        c.union_with(&c_snapshot);
        assert_eq!(c.root_ptr(), a.root_ptr());
    }

    #[test]
    fn test_union_and_intersection() {
        let mut a = set(&[1, 2, 3, 64]);
        let b = set(&[3, 64, 99]);
        a.union_with(&b);
        assert_eq!(a, set(&[1, 2, 3, 64, 99]));
        let mut c = set(&[1, 2, 3, 64]);
        c.intersection_with(&b);
        assert_eq!(c, set(&[3, 64]));
        let mut d = set(&[1, 2]);
        d.intersection_with(&set(&[3, 4]));
        assert!(d.is_empty());
    }

    #[test]
    fn test_subset() {
        let a = set(&[2, 64]);
        let b = set(&[1, 2, 64, 1000]);
        assert!(a.is_subset_of(&b));
        assert!(!b.is_subset_of(&a));
        assert!(set(&[]).is_subset_of(&a));
        assert!(!a.is_subset_of(&set(&[])));
    }

    #[test]
    fn test_large_keys() {
        let mut s = PatriciaTreeSet::<u64>::new();
        s.insert(u64::MAX).insert(0).insert(u64::MAX - 1);
        assert!(s.contains(u64::MAX));
        assert!(s.contains(0));
        assert_eq!(s.len(), 3);
    }
}
