//! Persistent maps from unsigned integers to abstract-domain values.
//!
//! Specializing the map for abstract values lets it save space by implicitly
//! binding every absent key to Top: bindings whose value is Top are never
//! stored, and an operation that combines a binding up to Top deletes it.
//! Bottom is not representable here; environments detect a Bottom result and
//! collapse wholesale (see
//! [`crate::analysis::PatriciaTreeMapAbstractEnvironment`]).

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use super::{branching_bit, is_zero_bit, mask, match_prefix, PatriciaKey};

/// The value-side capabilities the map needs from an abstract domain.
pub trait AbstractMapValue: Clone {
    /// The Top element (the implicit value of every unbound key).
    fn top() -> Self;
    /// True for the Top element.
    fn is_top(&self) -> bool;
    /// Partial order.
    fn leq(&self, other: &Self) -> bool;
    /// Semantic equality.
    fn equals(&self, other: &Self) -> bool;
    /// Greatest lower bound.
    fn meet(&self, other: &Self) -> Self;
}

#[derive(Debug)]
enum Node<V> {
    Leaf {
        key: u64,
        value: V,
    },
    Branch {
        prefix: u64,
        bit: u64,
        left: Arc<Node<V>>,
        right: Arc<Node<V>>,
    },
}

type Tree<V> = Option<Arc<Node<V>>>;

/// A persistent map keyed by integer-encodable keys, with implicit-Top
/// values.
///
/// The combining function of [`PatriciaTreeMap::update_with`],
/// [`PatriciaTreeMap::union_with`] and
/// [`PatriciaTreeMap::intersection_with`] is always called as
/// `combine(existing, new)`: the value already bound in `self` first, the
/// incoming value second.
pub struct PatriciaTreeMap<K: PatriciaKey, V: AbstractMapValue> {
    root: Tree<V>,
    _marker: PhantomData<K>,
}

impl<K: PatriciaKey, V: AbstractMapValue> Clone for PatriciaTreeMap<K, V> {
    fn clone(&self) -> Self {
        PatriciaTreeMap {
            root: self.root.clone(),
            _marker: PhantomData,
        }
    }
}

impl<K: PatriciaKey, V: AbstractMapValue> Default for PatriciaTreeMap<K, V> {
    fn default() -> Self {
        PatriciaTreeMap {
            root: None,
            _marker: PhantomData,
        }
    }
}

impl<K: PatriciaKey, V: AbstractMapValue> PatriciaTreeMap<K, V> {
    /// The map with no explicit bindings (every key at Top).
    #[must_use]
    pub fn new() -> Self {
        PatriciaTreeMap::default()
    }

    /// True when no explicit binding is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Number of explicit bindings. Linear in the size of the map.
    #[must_use]
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// The value bound to `key`; Top when unbound.
    #[must_use]
    pub fn at(&self, key: K) -> V {
        find_value(key.encode(), self.root.as_ref()).cloned().unwrap_or_else(V::top)
    }

    /// Binds `key` to `value` (deleting the binding when `value` is Top).
    pub fn insert_or_assign(&mut self, key: K, value: V) -> &mut Self {
        self.update_with(|_existing, new| new.clone(), key, value)
    }

    /// Applies a unary operation to the value bound at `key` (implicitly Top
    /// when absent).
    pub fn update(&mut self, operation: impl Fn(&V) -> V, key: K) -> &mut Self {
        self.update_with(|existing, _new| operation(existing), key, V::top())
    }

    /// Combines `value` into the binding at `key` via
    /// `combine(existing, new)`.
    pub fn update_with(
        &mut self,
        combine: impl Fn(&V, &V) -> V,
        key: K,
        value: V,
    ) -> &mut Self {
        self.root = update(&combine, key.encode(), &value, self.root.take());
        self
    }

    /// Structural union: `combine(existing, new)` runs on keys bound in
    /// both maps.
    pub fn union_with(&mut self, combine: impl Fn(&V, &V) -> V, other: &Self) -> &mut Self {
        self.root = merge(&combine, self.root.take(), other.root.clone());
        self
    }

    /// Structural intersection: only keys bound in both maps survive, with
    /// `combine(existing, new)` applied.
    pub fn intersection_with(
        &mut self,
        combine: impl Fn(&V, &V) -> V,
        other: &Self,
    ) -> &mut Self {
        self.root = intersect(&combine, self.root.clone(), other.root.clone());
        self
    }

    /// Pointwise order: true when every binding of `self` is ≤ the
    /// corresponding binding of `other`, and `other` binds no key that
    /// `self` leaves at (implicit) Top.
    #[must_use]
    pub fn leq(&self, other: &Self) -> bool {
        leq(self.root.as_ref(), other.root.as_ref())
    }

    /// Structural equality; sublinear on shared structure.
    #[must_use]
    pub fn equals(&self, other: &Self) -> bool {
        equals(self.root.as_ref(), other.root.as_ref())
    }

    /// Drops all bindings.
    pub fn clear(&mut self) {
        self.root = None;
    }

    /// Iterates explicit bindings (trie order).
    pub fn iter(&self) -> impl Iterator<Item = (K, &V)> + '_ {
        Iter {
            stack: Vec::new(),
            next: self.root.as_ref(),
            _marker: PhantomData::<K>,
        }
    }

    /// Pointer identity of the subtree holding exactly `key`, for sharing
    /// assertions in tests; 0 when unbound.
    #[must_use]
    pub fn leaf_ptr(&self, key: K) -> usize {
        leaf_ptr(key.encode(), self.root.as_ref())
    }

    /// Pointer identity of the root, for sharing assertions.
    #[must_use]
    pub fn root_ptr(&self) -> usize {
        self.root
            .as_ref()
            .map_or(0, |node| Arc::as_ptr(node) as usize)
    }
}

impl<K: PatriciaKey, V: AbstractMapValue> PartialEq for PatriciaTreeMap<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.equals(other)
    }
}

impl<K: PatriciaKey, V: AbstractMapValue> Eq for PatriciaTreeMap<K, V> {}

impl<K: PatriciaKey + fmt::Debug, V: AbstractMapValue + fmt::Debug> fmt::Debug
    for PatriciaTreeMap<K, V>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

struct Iter<'a, K, V> {
    stack: Vec<&'a Arc<Node<V>>>,
    next: Option<&'a Arc<Node<V>>>,
    _marker: PhantomData<K>,
}

impl<'a, K: PatriciaKey, V> Iterator for Iter<'a, K, V> {
    type Item = (K, &'a V);

    fn next(&mut self) -> Option<(K, &'a V)> {
        let mut cur = self.next.take().or_else(|| self.stack.pop())?;
        loop {
            match &**cur {
                Node::Leaf { key, value } => return Some((K::decode(*key), value)),
                Node::Branch { left, right, .. } => {
                    self.stack.push(right);
                    cur = left;
                }
            }
        }
    }
}

fn join<V>(
    prefix0: u64,
    tree0: Arc<Node<V>>,
    prefix1: u64,
    tree1: Arc<Node<V>>,
) -> Arc<Node<V>> {
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

fn make_branch<V>(prefix: u64, bit: u64, left: Tree<V>, right: Tree<V>) -> Tree<V> {
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

fn find_value<V>(key: u64, tree: Option<&Arc<Node<V>>>) -> Option<&V> {
    let node = tree?;
    match &**node {
        Node::Leaf { key: k, value } => {
            if *k == key {
                Some(value)
            } else {
                None
            }
        }
        Node::Branch {
            bit, left, right, ..
        } => {
            if is_zero_bit(key, *bit) {
                find_value(key, Some(left))
            } else {
                find_value(key, Some(right))
            }
        }
    }
}

fn leaf_ptr<V>(key: u64, tree: Option<&Arc<Node<V>>>) -> usize {
    let Some(node) = tree else {
        return 0;
    };
    match &**node {
        Node::Leaf { key: k, .. } => {
            if *k == key {
                Arc::as_ptr(node) as usize
            } else {
                0
            }
        }
        Node::Branch {
            bit, left, right, ..
        } => {
            if is_zero_bit(key, *bit) {
                leaf_ptr(key, Some(left))
            } else {
                leaf_ptr(key, Some(right))
            }
        }
    }
}

// Combine `value` with the value in `leaf`. Returns None when the combined
// value is Top (the binding disappears), the same leaf when nothing changed.
fn combine_leaf<V: AbstractMapValue>(
    combine: &impl Fn(&V, &V) -> V,
    value: &V,
    leaf: &Arc<Node<V>>,
) -> Tree<V> {
    let Node::Leaf { key, value: old } = &**leaf else {
        unreachable!("combine_leaf on a branch");
    };
    let combined = combine(old, value);
    if combined.is_top() {
        return None;
    }
    if !combined.equals(old) {
        return Some(Arc::new(Node::Leaf {
            key: *key,
            value: combined,
        }));
    }
    Some(leaf.clone())
}

// Create a new leaf with a Top value and combine `value` into it.
fn combine_new_leaf<V: AbstractMapValue>(
    combine: &impl Fn(&V, &V) -> V,
    key: u64,
    value: &V,
) -> Tree<V> {
    let fresh = Arc::new(Node::Leaf {
        key,
        value: V::top(),
    });
    combine_leaf(combine, value, &fresh)
}

fn update<V: AbstractMapValue>(
    combine: &impl Fn(&V, &V) -> V,
    key: u64,
    value: &V,
    tree: Tree<V>,
) -> Tree<V> {
    let Some(node) = tree else {
        return combine_new_leaf(combine, key, value);
    };
    match &*node {
        Node::Leaf { key: k, .. } => {
            if *k == key {
                return combine_leaf(combine, value, &node);
            }
            match combine_new_leaf(combine, key, value) {
                None => Some(node.clone()),
                Some(new_leaf) => Some(join(key, new_leaf, *k, node.clone())),
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
                    let new_left = update(combine, key, value, Some(left.clone()));
                    if tree_ptr_eq(&new_left, left) {
                        return Some(node.clone());
                    }
                    make_branch(*prefix, *bit, new_left, Some(right.clone()))
                } else {
                    let new_right = update(combine, key, value, Some(right.clone()));
                    if tree_ptr_eq(&new_right, right) {
                        return Some(node.clone());
                    }
                    make_branch(*prefix, *bit, Some(left.clone()), new_right)
                }
            } else {
                match combine_new_leaf(combine, key, value) {
                    None => Some(node.clone()),
                    Some(new_leaf) => Some(join(key, new_leaf, *prefix, node.clone())),
                }
            }
        }
    }
}

fn tree_ptr_eq<V>(tree: &Tree<V>, node: &Arc<Node<V>>) -> bool {
    tree.as_ref().is_some_and(|t| Arc::ptr_eq(t, node))
}

fn equals<V: AbstractMapValue>(
    tree1: Option<&Arc<Node<V>>>,
    tree2: Option<&Arc<Node<V>>>,
) -> bool {
    match (tree1, tree2) {
        (None, None) => true,
        (Some(a), Some(b)) => {
            if Arc::ptr_eq(a, b) {
                return true;
            }
            match (&**a, &**b) {
                (
                    Node::Leaf { key: k1, value: v1 },
                    Node::Leaf { key: k2, value: v2 },
                ) => k1 == k2 && v1.equals(v2),
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

fn leq<V: AbstractMapValue>(s: Option<&Arc<Node<V>>>, t: Option<&Arc<Node<V>>>) -> bool {
    match (s, t) {
        (Some(a), Some(b)) if Arc::ptr_eq(a, b) => true,
        // An empty tree is the Top environment: nothing but Top is above it.
        (None, None) => true,
        (None, Some(_)) => false,
        (Some(_), None) => true,
        (Some(a), Some(b)) => match (&**a, &**b) {
            (
                Node::Leaf { key: k1, value: v1 },
                Node::Leaf { key: k2, value: v2 },
            ) => k1 == k2 && v1.leq(v2),
            (Node::Leaf { .. }, Node::Branch { .. }) => false,
            (Node::Branch { .. }, Node::Leaf { key, value }) => {
                match find_value(*key, Some(a)) {
                    Some(sv) => sv.leq(value),
                    // t binds a non-Top value that s leaves at Top.
                    None => false,
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
                    leq(Some(s0), Some(t0)) && leq(Some(s1), Some(t1))
                } else if m < n && match_prefix(*q, *p, *m) {
                    let side = if is_zero_bit(*q, *m) { s0 } else { s1 };
                    leq(Some(side), Some(b))
                } else {
                    // t contains bindings to non-Top values in key ranges
                    // where s has none (and is therefore implicitly Top).
                    false
                }
            }
        },
    }
}

fn merge<V: AbstractMapValue>(
    combine: &impl Fn(&V, &V) -> V,
    s: Tree<V>,
    t: Tree<V>,
) -> Tree<V> {
    match (s, t) {
        (None, t) => t,
        (s, None) => s,
        (Some(s), Some(t)) => {
            if Arc::ptr_eq(&s, &t) {
                // Sharing shortcut: merging a tree with itself is a no-op.
                return Some(s);
            }
            match (&*s, &*t) {
                (Node::Leaf { key, value }, _) => {
                    // `s` is the existing side: its value goes first.
                    update(&|x: &V, y: &V| combine(y, x), *key, value, Some(t.clone()))
                }
                (_, Node::Leaf { key, value }) => {
                    update(combine, *key, value, Some(s.clone()))
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
                        let new_left = merge(combine, Some(s0.clone()), Some(t0.clone()));
                        let new_right = merge(combine, Some(s1.clone()), Some(t1.clone()));
                        if tree_ptr_eq(&new_left, s0) && tree_ptr_eq(&new_right, s1) {
                            return Some(s.clone());
                        }
                        if tree_ptr_eq(&new_left, t0) && tree_ptr_eq(&new_right, t1) {
                            return Some(t.clone());
                        }
                        make_branch(*p, *m, new_left, new_right)
                    } else if m < n && match_prefix(*q, *p, *m) {
                        if is_zero_bit(*q, *m) {
                            let new_left = merge(combine, Some(s0.clone()), Some(t.clone()));
                            if tree_ptr_eq(&new_left, s0) {
                                return Some(s.clone());
                            }
                            make_branch(*p, *m, new_left, Some(s1.clone()))
                        } else {
                            let new_right = merge(combine, Some(s1.clone()), Some(t.clone()));
                            if tree_ptr_eq(&new_right, s1) {
                                return Some(s.clone());
                            }
                            make_branch(*p, *m, Some(s0.clone()), new_right)
                        }
                    } else if m > n && match_prefix(*p, *q, *n) {
                        if is_zero_bit(*p, *n) {
                            let new_left = merge(combine, Some(s.clone()), Some(t0.clone()));
                            if tree_ptr_eq(&new_left, t0) {
                                return Some(t.clone());
                            }
                            make_branch(*q, *n, new_left, Some(t1.clone()))
                        } else {
                            let new_right = merge(combine, Some(s.clone()), Some(t1.clone()));
                            if tree_ptr_eq(&new_right, t1) {
                                return Some(t.clone());
                            }
                            make_branch(*q, *n, Some(t0.clone()), new_right)
                        }
                    } else {
                        Some(join(*p, s.clone(), *q, t.clone()))
                    }
                }
            }
        }
    }
}

fn intersect<V: AbstractMapValue>(
    combine: &impl Fn(&V, &V) -> V,
    s: Tree<V>,
    t: Tree<V>,
) -> Tree<V> {
    match (s, t) {
        (None, _) | (_, None) => None,
        (Some(s), Some(t)) => {
            if Arc::ptr_eq(&s, &t) {
                return Some(s);
            }
            match (&*s, &*t) {
                (Node::Leaf { key, .. }, _) => match find_value(*key, Some(&t)) {
                    None => None,
                    Some(other) => combine_leaf(combine, other, &s),
                },
                (_, Node::Leaf { key, .. }) => match find_value(*key, Some(&s)) {
                    None => None,
                    // `t`'s leaf holds the new value; the existing one comes
                    // from `s`.
                    Some(existing) => {
                        combine_leaf(&|x: &V, y: &V| combine(y, x), existing, &t)
                    }
                },
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
                        // The two halves cover disjoint key ranges, so this
                        // merge only rebuilds structure; the meet combine is
                        // never applied to overlapping bindings.
                        merge(
                            &|x: &V, y: &V| x.meet(y),
                            intersect(combine, Some(s0.clone()), Some(t0.clone())),
                            intersect(combine, Some(s1.clone()), Some(t1.clone())),
                        )
                    } else if m < n && match_prefix(*q, *p, *m) {
                        let side = if is_zero_bit(*q, *m) { s0 } else { s1 };
                        intersect(combine, Some(side.clone()), Some(t.clone()))
                    } else if m > n && match_prefix(*p, *q, *n) {
                        let side = if is_zero_bit(*p, *n) { t0 } else { t1 };
                        intersect(combine, Some(s.clone()), Some(side.clone()))
                    } else {
                        None
                    }
                }
            }
        }
    }
}
