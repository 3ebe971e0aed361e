//! The register-aliasing domain used by copy propagation.
//!
//! An instance is an undirected graph whose vertices are register-values
//! (a register or a constant) and whose edges mean "definitely the same
//! value". The transitive closure is implicit: queries compute connected
//! components on demand, with the component map cached until the next
//! mutation.

use std::cell::RefCell;

use rustc_hash::FxHashSet;

use crate::analysis::domain::{AbstractDomain, AbstractValue, AbstractValueKind};
use crate::ir::{DexStringRef, DexTypeRef, Reg};

/// A vertex of the alias graph: a register or a constant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RegisterValue {
    /// A virtual register.
    Register(Reg),
    /// A literal integer constant.
    ConstLiteral(i64),
    /// An interned string constant.
    ConstString(DexStringRef),
    /// An interned type constant.
    ConstType(DexTypeRef),
    /// The absent value.
    None,
}

impl RegisterValue {
    /// The register number, for register vertices.
    #[must_use]
    pub fn reg(&self) -> Option<Reg> {
        match self {
            RegisterValue::Register(r) => Some(*r),
            _ => None,
        }
    }
}

/// The aliasing graph. See the module docs.
#[derive(Debug, Clone, Default)]
pub struct AliasedRegisters {
    vertices: Vec<RegisterValue>,
    adjacency: Vec<FxHashSet<usize>>,
    // Connected-component map, computed by queries and cleared by any change
    // to the graph.
    components: RefCell<Option<Vec<usize>>>,
}

impl AliasedRegisters {
    fn find(&self, r: &RegisterValue) -> Option<usize> {
        self.vertices.iter().position(|v| v == r)
    }

    fn find_or_create(&mut self, r: &RegisterValue) -> usize {
        if let Some(idx) = self.find(r) {
            return idx;
        }
        self.vertices.push(r.clone());
        self.adjacency.push(FxHashSet::default());
        self.invalidate_cache();
        self.vertices.len() - 1
    }

    fn invalidate_cache(&self) {
        *self.components.borrow_mut() = None;
    }

    fn component_map(&self) -> Vec<usize> {
        if let Some(cached) = self.components.borrow().as_ref() {
            return cached.clone();
        }
        // Union of reachability: flood-fill each unvisited vertex.
        let mut map = vec![usize::MAX; self.vertices.len()];
        let mut next_component = 0;
        for start in 0..self.vertices.len() {
            if map[start] != usize::MAX {
                continue;
            }
            let mut stack = vec![start];
            while let Some(v) = stack.pop() {
                if map[v] != usize::MAX {
                    continue;
                }
                map[v] = next_component;
                stack.extend(self.adjacency[v].iter().copied());
            }
            next_component += 1;
        }
        *self.components.borrow_mut() = Some(map.clone());
        map
    }

    /// Declares that `r1` and `r2` hold the same value. Both vertices are
    /// created when missing; transitivity is implicit.
    pub fn make_aliased(&mut self, r1: &RegisterValue, r2: &RegisterValue) {
        if r1 == r2 {
            return;
        }
        let a = self.find_or_create(r1);
        let b = self.find_or_create(r2);
        self.adjacency[a].insert(b);
        self.adjacency[b].insert(a);
        self.invalidate_cache();
    }

    /// Breaks every alias any vertex has to `r`. Aliases among `r`'s former
    /// neighbours are preserved (they still hold the same value as each
    /// other).
    pub fn break_alias(&mut self, r: &RegisterValue) {
        let Some(idx) = self.find(r) else {
            return;
        };
        let neighbours: Vec<usize> = self.adjacency[idx].drain().collect();
        let mut changed = !neighbours.is_empty();
        for n in &neighbours {
            self.adjacency[*n].remove(&idx);
        }
        // The ex-neighbours were transitively equal through r; keep them
        // connected to each other.
        for window in neighbours.windows(2) {
            if self.adjacency[window[0]].insert(window[1]) {
                self.adjacency[window[1]].insert(window[0]);
                changed = true;
            }
        }
        if changed {
            self.invalidate_cache();
        }
    }

    /// True when `r1` and `r2` are (transitively) known to hold the same
    /// value.
    #[must_use]
    pub fn are_aliases(&self, r1: &RegisterValue, r2: &RegisterValue) -> bool {
        if r1 == r2 {
            return true;
        }
        let (Some(a), Some(b)) = (self.find(r1), self.find(r2)) else {
            return false;
        };
        let components = self.component_map();
        components[a] == components[b]
    }

    /// The lowest-numbered register in `r`'s component other than `r`
    /// itself, usable as a replacement for a use of `r`.
    #[must_use]
    pub fn get_representative(&self, r: &RegisterValue) -> Option<Reg> {
        let idx = self.find(r)?;
        let components = self.component_map();
        let target = components[idx];
        self.vertices
            .iter()
            .enumerate()
            .filter(|(i, v)| components[*i] == target && *v != r)
            .filter_map(|(_, v)| v.reg())
            .min()
    }

    fn vertex_pairs_in_same_component(&self) -> Vec<(RegisterValue, RegisterValue)> {
        let components = self.component_map();
        let mut pairs = Vec::new();
        for i in 0..self.vertices.len() {
            for j in (i + 1)..self.vertices.len() {
                if components[i] == components[j] {
                    pairs.push((self.vertices[i].clone(), self.vertices[j].clone()));
                }
            }
        }
        pairs
    }
}

impl AbstractValue for AliasedRegisters {
    fn clear(&mut self) {
        self.vertices.clear();
        self.adjacency.clear();
        self.invalidate_cache();
    }

    fn kind(&self) -> AbstractValueKind {
        if self.adjacency.iter().all(FxHashSet::is_empty) {
            AbstractValueKind::Top
        } else {
            AbstractValueKind::Value
        }
    }

    fn leq(&self, other: &Self) -> bool {
        // More aliasing facts = lower. Every pair aliased in `other` must be
        // aliased here.
        other
            .vertex_pairs_in_same_component()
            .iter()
            .all(|(a, b)| self.are_aliases(a, b))
    }

    fn equals(&self, other: &Self) -> bool {
        self.leq(other) && other.leq(self)
    }

    fn join_with(&mut self, other: &Self) -> AbstractValueKind {
        // Keep only the facts present in both operands.
        let keep: Vec<(RegisterValue, RegisterValue)> = self
            .vertex_pairs_in_same_component()
            .into_iter()
            .filter(|(a, b)| other.are_aliases(a, b))
            .collect();
        self.clear();
        for (a, b) in keep {
            self.make_aliased(&a, &b);
        }
        self.kind()
    }

    fn widen_with(&mut self, other: &Self) -> AbstractValueKind {
        self.join_with(other)
    }

    fn meet_with(&mut self, other: &Self) -> AbstractValueKind {
        // Accumulate the facts of both operands.
        for (a, b) in other.vertex_pairs_in_same_component() {
            self.make_aliased(&a, &b);
        }
        self.kind()
    }

    fn narrow_with(&mut self, other: &Self) -> AbstractValueKind {
        self.meet_with(other)
    }
}

/// The sentinel-wrapped aliasing domain used by the fixpoint iterator.
pub type AliasDomain = AbstractDomain<AliasedRegisters>;

impl AliasDomain {
    /// Applies `operation` to the graph (materializing an empty graph on
    /// Top); Bottom absorbs.
    pub fn update(&mut self, operation: impl FnOnce(&mut AliasedRegisters)) {
        self.update_value(operation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg(r: Reg) -> RegisterValue {
        RegisterValue::Register(r)
    }

    #[test]
    fn test_transitive_aliasing() {
        let mut a = AliasedRegisters::default();
        a.make_aliased(&reg(0), &reg(1));
        a.make_aliased(&reg(1), &reg(2));
        assert!(a.are_aliases(&reg(0), &reg(2)));
        assert!(a.are_aliases(&reg(2), &reg(0)));
        assert!(!a.are_aliases(&reg(0), &reg(3)));
    }

    #[test]
    fn test_break_alias_preserves_neighbours() {
        let mut a = AliasedRegisters::default();
        a.make_aliased(&reg(0), &reg(1));
        a.make_aliased(&reg(0), &reg(2));
        a.break_alias(&reg(0));
        assert!(!a.are_aliases(&reg(0), &reg(1)));
        assert!(!a.are_aliases(&reg(0), &reg(2)));
        // 1 and 2 held the same value; still do.
        assert!(a.are_aliases(&reg(1), &reg(2)));
    }

    #[test]
    fn test_representative_is_lowest_register() {
        let mut a = AliasedRegisters::default();
        a.make_aliased(&reg(5), &reg(3));
        a.make_aliased(&reg(3), &RegisterValue::ConstLiteral(7));
        assert_eq!(a.get_representative(&reg(5)), Some(3));
        assert_eq!(a.get_representative(&RegisterValue::ConstLiteral(7)), Some(3));
        assert_eq!(a.get_representative(&reg(9)), None);
    }

    #[test]
    fn test_lattice_ops() {
        let mut a = AliasedRegisters::default();
        a.make_aliased(&reg(0), &reg(1));
        a.make_aliased(&reg(2), &reg(3));
        let mut b = AliasedRegisters::default();
        b.make_aliased(&reg(0), &reg(1));

        // a has strictly more facts: a ≤ b.
        assert!(a.leq(&b));
        assert!(!b.leq(&a));

        let mut join = a.clone();
        join.join_with(&b);
        assert!(join.are_aliases(&reg(0), &reg(1)));
        assert!(!join.are_aliases(&reg(2), &reg(3)));

        let mut meet = b.clone();
        meet.meet_with(&a);
        assert!(meet.are_aliases(&reg(2), &reg(3)));
        assert!(meet.are_aliases(&reg(0), &reg(1)));
    }

    #[test]
    fn test_empty_graph_is_top() {
        let a = AliasedRegisters::default();
        assert_eq!(a.kind(), AbstractValueKind::Top);
        let mut b = AliasedRegisters::default();
        b.make_aliased(&reg(0), &reg(1));
        assert_eq!(b.kind(), AbstractValueKind::Value);
        b.break_alias(&reg(0));
        assert_eq!(b.kind(), AbstractValueKind::Top);
    }
}
