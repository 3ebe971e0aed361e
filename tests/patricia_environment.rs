//! Map-level union and intersection over the hashed-set domain, including
//! the structural-sharing guarantees the analyses rely on.

use dexopt::analysis::{Domain, HashedSetAbstractDomain};
use dexopt::collections::PatriciaTreeMap;

type Dom = HashedSetAbstractDomain<&'static str>;
type Map = PatriciaTreeMap<u32, Dom>;

fn dom(elems: &[&'static str]) -> Dom {
    Dom::from_elements(elems.iter().copied())
}

fn set_union(a: &Dom, b: &Dom) -> Dom {
    let mut out = a.clone();
    out.join_with(b);
    out
}

fn set_meet(a: &Dom, b: &Dom) -> Dom {
    let mut out = a.clone();
    out.meet_with(b);
    out
}

fn sorted_elements(d: &Dom) -> Vec<&'static str> {
    let mut v: Vec<_> = d.elements().into_iter().copied().collect();
    v.sort_unstable();
    v
}

fn m1() -> Map {
    let mut m = Map::new();
    m.insert_or_assign(1, dom(&["a"]));
    m.insert_or_assign(2, dom(&["b"]));
    m.insert_or_assign(3, dom(&["d", "e"]));
    m
}

fn m2() -> Map {
    let mut m = Map::new();
    m.insert_or_assign(2, dom(&["c"]));
    m.insert_or_assign(3, dom(&["e", "f"]));
    m.insert_or_assign(4, dom(&["g"]));
    m
}

#[test]
fn union_combines_and_shares() {
    let original = m1();
    let mut merged = original.clone();
    merged.union_with(set_union, &m2());

    assert_eq!(sorted_elements(&merged.at(1)), vec!["a"]);
    assert_eq!(sorted_elements(&merged.at(2)), vec!["b", "c"]);
    assert_eq!(sorted_elements(&merged.at(3)), vec!["d", "e", "f"]);
    assert_eq!(sorted_elements(&merged.at(4)), vec!["g"]);
    assert_eq!(merged.len(), 4);

    // The subtree holding only key 1 is untouched by the union: the result
    // must share it with the input by pointer.
    assert_ne!(original.leaf_ptr(1), 0);
    assert_eq!(merged.leaf_ptr(1), original.leaf_ptr(1));
}

#[test]
fn intersection_keeps_only_common_keys() {
    let mut intersected = m1();
    intersected.intersection_with(set_meet, &m2());

    // {b} ∩ {c} is empty — the Top representative — so key 2 disappears;
    // keys 1 and 4 exist on only one side.
    assert_eq!(intersected.len(), 1);
    assert_eq!(sorted_elements(&intersected.at(3)), vec!["e"]);
    assert!(intersected.at(1).elements().is_empty());
    assert!(intersected.at(2).elements().is_empty());
}

#[test]
fn canonical_trees_are_equal() {
    // Same bindings in a different insertion order: structurally identical.
    let mut other = Map::new();
    other.insert_or_assign(3, dom(&["d", "e"]));
    other.insert_or_assign(1, dom(&["a"]));
    other.insert_or_assign(2, dom(&["b"]));
    assert!(m1().equals(&other));
    assert_eq!(m1(), other);
}

#[test]
fn join_is_least_upper_bound() {
    // Spot-check the lattice laws the maps are used under.
    let a = dom(&["a", "b"]);
    let b = dom(&["b", "c"]);
    let join = set_union(&a, &b);
    assert!(a.leq(&join));
    assert!(b.leq(&join));
    let meet = set_meet(&a, &b);
    assert!(meet.leq(&a));
    assert!(meet.leq(&b));
}

#[test]
fn self_merge_is_identity_by_pointer() {
    let base = m1();
    let mut merged = base.clone();
    let snapshot = base.clone();
    merged.union_with(set_union, &snapshot);
    assert_eq!(merged.root_ptr(), base.root_ptr());

    let mut intersected = base.clone();
    intersected.intersection_with(set_meet, &snapshot);
    assert_eq!(intersected.root_ptr(), base.root_ptr());
}
