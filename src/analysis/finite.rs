//! Finite lattices over a closed set of values.
//!
//! The lattice is described once by its elements and the immediate
//! order pairs (`a ≤ b`); construction computes the reflexive-transitive
//! closure as per-element bit vectors and tabulates every join and meet, so
//! the domain operations are O(1) table lookups. Construction rejects
//! relations that are not lattices (no unique least upper or greatest lower
//! bound for some pair).

use std::hash::Hash;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::analysis::domain::{AbstractDomain, AbstractValue, AbstractValueKind};

/// A finite lattice: elements, order closure, and join/meet tables.
///
/// Limited to 64 elements; the order closure lives in one machine word per
/// element.
#[derive(Debug)]
pub struct FiniteLattice<E: Eq + Hash + Clone> {
    elements: Vec<E>,
    index_of: FxHashMap<E, usize>,
    // below[i] has bit j set when j ≤ i.
    below: Vec<u64>,
    join_table: Vec<usize>,
    meet_table: Vec<usize>,
    bottom: usize,
    top: usize,
}

impl<E: Eq + Hash + Clone> FiniteLattice<E> {
    /// Builds the lattice from its elements and the immediate `a ≤ b`
    /// pairs.
    ///
    /// # Panics
    /// When there are more than 64 elements, when a pair names an unknown
    /// element, or when the closed relation is not a lattice. A broken
    /// lattice description is a programmer error.
    #[must_use]
    pub fn new(elements: Vec<E>, leq_pairs: &[(E, E)]) -> Self {
        let n = elements.len();
        assert!(n > 0 && n <= 64, "finite lattice must have 1..=64 elements");
        let index_of: FxHashMap<E, usize> = elements
            .iter()
            .enumerate()
            .map(|(i, e)| (e.clone(), i))
            .collect();

        // Reflexive base, then transitive closure over the given pairs.
        let mut below: Vec<u64> = (0..n).map(|i| 1u64 << i).collect();
        let mut changed = true;
        while changed {
            changed = false;
            for (a, b) in leq_pairs {
                let ai = index_of[a];
                let bi = index_of[b];
                let merged = below[bi] | below[ai];
                if merged != below[bi] {
                    below[bi] = merged;
                    changed = true;
                }
            }
        }

        let leq = |below: &[u64], a: usize, b: usize| below[b] & (1u64 << a) != 0;

        // The unique maximum and minimum must exist.
        let top = (0..n)
            .find(|&t| (0..n).all(|x| leq(&below, x, t)))
            .expect("finite lattice has no greatest element");
        let bottom = (0..n)
            .find(|&b| (0..n).all(|x| leq(&below, b, x)))
            .expect("finite lattice has no least element");

        // Tabulate joins and meets; every pair must have a unique bound.
        let mut join_table = vec![0usize; n * n];
        let mut meet_table = vec![0usize; n * n];
        for a in 0..n {
            for b in 0..n {
                let uppers: Vec<usize> = (0..n)
                    .filter(|&u| leq(&below, a, u) && leq(&below, b, u))
                    .collect();
                let lub = uppers
                    .iter()
                    .copied()
                    .find(|&u| uppers.iter().all(|&v| leq(&below, u, v)));
                let lowers: Vec<usize> = (0..n)
                    .filter(|&l| leq(&below, l, a) && leq(&below, l, b))
                    .collect();
                let glb = lowers
                    .iter()
                    .copied()
                    .find(|&l| lowers.iter().all(|&v| leq(&below, v, l)));
                join_table[a * n + b] = lub.expect("pair without a least upper bound");
                meet_table[a * n + b] = glb.expect("pair without a greatest lower bound");
            }
        }

        FiniteLattice {
            elements,
            index_of,
            below,
            join_table,
            meet_table,
            bottom,
            top,
        }
    }

    fn len(&self) -> usize {
        self.elements.len()
    }

    /// The element at a lattice index.
    #[must_use]
    pub fn element(&self, index: usize) -> &E {
        &self.elements[index]
    }

    /// The index of an element.
    ///
    /// # Panics
    /// When the element is not part of the lattice.
    #[must_use]
    pub fn index_of(&self, element: &E) -> usize {
        self.index_of[element]
    }

    fn leq(&self, a: usize, b: usize) -> bool {
        self.below[b] & (1u64 << a) != 0
    }

    fn join(&self, a: usize, b: usize) -> usize {
        self.join_table[a * self.len() + b]
    }

    fn meet(&self, a: usize, b: usize) -> usize {
        self.meet_table[a * self.len() + b]
    }
}

/// One element of a finite lattice as an abstract value.
///
/// The lattice's own greatest and least elements canonicalize to the
/// wrapping domain's Top and Bottom sentinels.
#[derive(Debug, Clone)]
pub struct FiniteValue<E: Eq + Hash + Clone> {
    lattice: Arc<FiniteLattice<E>>,
    index: usize,
}

impl<E: Eq + Hash + Clone> FiniteValue<E> {
    /// The concrete element.
    #[must_use]
    pub fn element(&self) -> &E {
        self.lattice.element(self.index)
    }
}

impl<E: Eq + Hash + Clone> AbstractValue for FiniteValue<E> {
    fn clear(&mut self) {
        self.index = self.lattice.top;
    }

    fn kind(&self) -> AbstractValueKind {
        if self.index == self.lattice.top {
            AbstractValueKind::Top
        } else if self.index == self.lattice.bottom {
            AbstractValueKind::Bottom
        } else {
            AbstractValueKind::Value
        }
    }

    fn leq(&self, other: &Self) -> bool {
        self.lattice.leq(self.index, other.index)
    }

    fn equals(&self, other: &Self) -> bool {
        self.index == other.index
    }

    fn join_with(&mut self, other: &Self) -> AbstractValueKind {
        self.index = self.lattice.join(self.index, other.index);
        self.kind()
    }

    fn meet_with(&mut self, other: &Self) -> AbstractValueKind {
        self.index = self.lattice.meet(self.index, other.index);
        self.kind()
    }
}

/// Sentinel-wrapped finite-lattice domain.
pub type FiniteAbstractDomain<E> = AbstractDomain<FiniteValue<E>>;

impl<E: Eq + Hash + Clone> FiniteAbstractDomain<E> {
    /// The domain holding `element` of `lattice`.
    #[must_use]
    pub fn of(lattice: &Arc<FiniteLattice<E>>, element: &E) -> Self {
        AbstractDomain::value(FiniteValue {
            lattice: Arc::clone(lattice),
            index: lattice.index_of(element),
        })
    }

    /// The concrete element, when one is held.
    #[must_use]
    pub fn element(&self) -> Option<&E> {
        self.get_value().map(FiniteValue::element)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::domain::Domain;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum N {
        Bottom,
        Null,
        NotNull,
        Nullable,
    }

    fn diamond() -> Arc<FiniteLattice<N>> {
        Arc::new(FiniteLattice::new(
            vec![N::Bottom, N::Null, N::NotNull, N::Nullable],
            &[
                (N::Bottom, N::Null),
                (N::Bottom, N::NotNull),
                (N::Null, N::Nullable),
                (N::NotNull, N::Nullable),
            ],
        ))
    }

    #[test]
    fn test_diamond_join_meet() {
        let lattice = diamond();
        let null = FiniteAbstractDomain::of(&lattice, &N::Null);
        let not_null = FiniteAbstractDomain::of(&lattice, &N::NotNull);

        let mut join = null.clone();
        join.join_with(&not_null);
        // Null ∨ NotNull is the lattice top, canonicalized to the sentinel.
        assert!(Domain::is_top(&join));

        let mut meet = null.clone();
        meet.meet_with(&not_null);
        assert!(meet.is_bottom());
    }

    #[test]
    fn test_order() {
        let lattice = diamond();
        let null = FiniteAbstractDomain::of(&lattice, &N::Null);
        let nullable = FiniteAbstractDomain::of(&lattice, &N::Nullable);
        // Nullable is top, so the wrapped element collapses.
        assert!(Domain::is_top(&nullable));
        assert!(Domain::leq(&null, &nullable));
        let mut refined = nullable.clone();
        refined.meet_with(&null);
        assert_eq!(refined.element(), Some(&N::Null));
    }

    #[test]
    fn test_chain_lattice() {
        let lattice = Arc::new(FiniteLattice::new(
            vec![0u8, 1, 2, 3],
            &[(0, 1), (1, 2), (2, 3)],
        ));
        let one = FiniteAbstractDomain::of(&lattice, &1);
        let two = FiniteAbstractDomain::of(&lattice, &2);
        assert!(Domain::leq(&one, &two));
        let mut join = one.clone();
        join.join_with(&two);
        assert_eq!(join.element(), Some(&2));
    }
}
