//! Abstract-domain scaffolding.
//!
//! An [`AbstractValue`] is the meat of a domain: anything that can order,
//! join, widen, meet and narrow itself. [`AbstractDomain`] wraps such a value
//! with distinguished Top and Bottom sentinels and keeps the representation
//! canonical: a value that becomes effectively Top or Bottom after an
//! operation collapses to the sentinel via [`AbstractDomain::normalize`].

use rustc_hash::FxHashSet;
use std::hash::Hash;

use crate::collections::AbstractMapValue;

/// The effective kind of an abstract value after an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbstractValueKind {
    /// No valid execution reaches this point.
    Bottom,
    /// A proper value.
    Value,
    /// No information.
    Top,
}

/// Capabilities a value must provide to participate in the scaffolding.
///
/// The `*_with` operations mutate `self` and report the kind of the result
/// so the wrapping domain can collapse to a sentinel.
pub trait AbstractValue: Clone {
    /// Resets to a neutral (empty) value.
    fn clear(&mut self);

    /// The kind this value currently represents.
    fn kind(&self) -> AbstractValueKind;

    /// Partial order.
    fn leq(&self, other: &Self) -> bool;

    /// Semantic equality.
    fn equals(&self, other: &Self) -> bool;

    /// Least upper bound, in place.
    fn join_with(&mut self, other: &Self) -> AbstractValueKind;

    /// Widening, in place. Must be ≥ join.
    fn widen_with(&mut self, other: &Self) -> AbstractValueKind {
        self.join_with(other)
    }

    /// Greatest lower bound, in place.
    fn meet_with(&mut self, other: &Self) -> AbstractValueKind;

    /// Narrowing, in place. Must be ≤ meet.
    fn narrow_with(&mut self, other: &Self) -> AbstractValueKind {
        self.meet_with(other)
    }
}

/// Uniform surface shared by every abstract domain (sentinel-wrapped values,
/// environments, liveness sets).
pub trait Domain: Clone {
    /// The greatest element.
    fn top() -> Self;
    /// The least element.
    fn bottom() -> Self;
    /// True for the greatest element.
    fn is_top(&self) -> bool;
    /// True for the least element.
    fn is_bottom(&self) -> bool;
    /// Partial order.
    fn leq(&self, other: &Self) -> bool;
    /// Semantic equality.
    fn equals(&self, other: &Self) -> bool;
    /// Least upper bound, in place.
    fn join_with(&mut self, other: &Self);
    /// Widening, in place.
    fn widen_with(&mut self, other: &Self);
    /// Greatest lower bound, in place.
    fn meet_with(&mut self, other: &Self);
    /// Narrowing, in place.
    fn narrow_with(&mut self, other: &Self);
}

/// Sentinel-wrapping scaffolding over an [`AbstractValue`].
#[derive(Debug, Clone, PartialEq)]
pub enum AbstractDomain<V: AbstractValue> {
    /// The least element.
    Bottom,
    /// A proper value; kept normalized (never effectively Top or Bottom).
    Value(V),
    /// The greatest element.
    Top,
}

impl<V: AbstractValue> AbstractDomain<V> {
    /// Wraps a value, normalizing sentinel-equivalent values away.
    #[must_use]
    pub fn value(v: V) -> Self {
        let mut domain = AbstractDomain::Value(v);
        domain.normalize();
        domain
    }

    /// True when a proper value is present.
    #[must_use]
    pub fn is_value(&self) -> bool {
        matches!(self, AbstractDomain::Value(_))
    }

    /// Shared access to the proper value, when present.
    #[must_use]
    pub fn get_value(&self) -> Option<&V> {
        match self {
            AbstractDomain::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Applies `operation` to the proper value and re-normalizes. Bottom
    /// absorbs; Top materializes a default (Top-representative) value first.
    pub fn update_value(&mut self, operation: impl FnOnce(&mut V))
    where
        V: Default,
    {
        if matches!(self, AbstractDomain::Bottom) {
            return;
        }
        if matches!(self, AbstractDomain::Top) {
            let mut v = V::default();
            operation(&mut v);
            *self = AbstractDomain::Value(v);
        } else if let AbstractDomain::Value(v) = self {
            operation(v);
        }
        self.normalize();
    }

    /// Collapses a value that has become effectively Top or Bottom back to
    /// the sentinel.
    pub fn normalize(&mut self) {
        let kind = match self {
            AbstractDomain::Value(v) => v.kind(),
            _ => return,
        };
        match kind {
            AbstractValueKind::Top => *self = AbstractDomain::Top,
            AbstractValueKind::Bottom => *self = AbstractDomain::Bottom,
            AbstractValueKind::Value => {}
        }
    }

    fn apply(
        &mut self,
        other: &Self,
        absorb_self: AbstractValueKind,
        op: impl FnOnce(&mut V, &V) -> AbstractValueKind,
    ) {
        let mut combined = None;
        if let (AbstractDomain::Value(a), AbstractDomain::Value(b)) = (&mut *self, other) {
            combined = Some(op(a, b));
        }
        match combined {
            Some(AbstractValueKind::Top) => *self = AbstractDomain::Top,
            Some(AbstractValueKind::Bottom) => *self = AbstractDomain::Bottom,
            Some(AbstractValueKind::Value) => {}
            None => {
                // Sentinel cases: for joins, Top absorbs and Bottom yields;
                // for meets the duals.
                let self_absorbing = matches!(
                    (&*self, absorb_self),
                    (AbstractDomain::Top, AbstractValueKind::Top)
                        | (AbstractDomain::Bottom, AbstractValueKind::Bottom)
                );
                if self_absorbing {
                    return;
                }
                let other_absorbing = matches!(
                    (other, absorb_self),
                    (AbstractDomain::Top, AbstractValueKind::Top)
                        | (AbstractDomain::Bottom, AbstractValueKind::Bottom)
                );
                if other_absorbing {
                    *self = match absorb_self {
                        AbstractValueKind::Top => AbstractDomain::Top,
                        _ => AbstractDomain::Bottom,
                    };
                    return;
                }
                // The neutral sentinel yields to the other side.
                if matches!(
                    (&*self, absorb_self),
                    (AbstractDomain::Bottom, AbstractValueKind::Top)
                        | (AbstractDomain::Top, AbstractValueKind::Bottom)
                ) {
                    *self = other.clone();
                }
            }
        }
    }
}

impl<V: AbstractValue> Domain for AbstractDomain<V> {
    fn top() -> Self {
        AbstractDomain::Top
    }

    fn bottom() -> Self {
        AbstractDomain::Bottom
    }

    fn is_top(&self) -> bool {
        matches!(self, AbstractDomain::Top)
    }

    fn is_bottom(&self) -> bool {
        matches!(self, AbstractDomain::Bottom)
    }

    fn leq(&self, other: &Self) -> bool {
        match (self, other) {
            (AbstractDomain::Bottom, _) => true,
            (_, AbstractDomain::Bottom) => false,
            (_, AbstractDomain::Top) => true,
            (AbstractDomain::Top, _) => false,
            (AbstractDomain::Value(a), AbstractDomain::Value(b)) => a.leq(b),
        }
    }

    fn equals(&self, other: &Self) -> bool {
        match (self, other) {
            (AbstractDomain::Bottom, AbstractDomain::Bottom)
            | (AbstractDomain::Top, AbstractDomain::Top) => true,
            (AbstractDomain::Value(a), AbstractDomain::Value(b)) => a.equals(b),
            _ => false,
        }
    }

    fn join_with(&mut self, other: &Self) {
        self.apply(other, AbstractValueKind::Top, V::join_with);
    }

    fn widen_with(&mut self, other: &Self) {
        self.apply(other, AbstractValueKind::Top, V::widen_with);
    }

    fn meet_with(&mut self, other: &Self) {
        self.apply(other, AbstractValueKind::Bottom, V::meet_with);
    }

    fn narrow_with(&mut self, other: &Self) {
        self.apply(other, AbstractValueKind::Bottom, V::narrow_with);
    }
}

impl<V: AbstractValue> AbstractMapValue for AbstractDomain<V> {
    fn top() -> Self {
        AbstractDomain::Top
    }

    fn is_top(&self) -> bool {
        Domain::is_top(self)
    }

    fn leq(&self, other: &Self) -> bool {
        Domain::leq(self, other)
    }

    fn equals(&self, other: &Self) -> bool {
        Domain::equals(self, other)
    }

    fn meet(&self, other: &Self) -> Self {
        let mut out = self.clone();
        out.meet_with(other);
        out
    }
}

// ---------------------------------------------------------------------------
// Hashed-set domain

/// A hashed set of elements as an abstract value.
///
/// Join is union and meet is intersection; the empty set is the Top
/// representative, mirroring the implicit-Top convention of the environments
/// that hold these values.
#[derive(Debug, Clone)]
pub struct SetValue<T: Eq + Hash + Clone> {
    set: FxHashSet<T>,
}

impl<T: Eq + Hash + Clone> Default for SetValue<T> {
    fn default() -> Self {
        SetValue {
            set: FxHashSet::default(),
        }
    }
}

impl<T: Eq + Hash + Clone> SetValue<T> {
    /// The elements.
    pub fn elements(&self) -> impl Iterator<Item = &T> {
        self.set.iter()
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.set.len()
    }

    /// True when empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

impl<T: Eq + Hash + Clone> AbstractValue for SetValue<T> {
    fn clear(&mut self) {
        self.set.clear();
    }

    fn kind(&self) -> AbstractValueKind {
        if self.set.is_empty() {
            AbstractValueKind::Top
        } else {
            AbstractValueKind::Value
        }
    }

    fn leq(&self, other: &Self) -> bool {
        self.set.is_subset(&other.set)
    }

    fn equals(&self, other: &Self) -> bool {
        self.set == other.set
    }

    fn join_with(&mut self, other: &Self) -> AbstractValueKind {
        for e in &other.set {
            self.set.insert(e.clone());
        }
        self.kind()
    }

    fn meet_with(&mut self, other: &Self) -> AbstractValueKind {
        self.set.retain(|e| other.set.contains(e));
        self.kind()
    }
}

/// Sentinel-wrapped hashed-set domain.
pub type HashedSetAbstractDomain<T> = AbstractDomain<SetValue<T>>;

impl<T: Eq + Hash + Clone> HashedSetAbstractDomain<T> {
    /// A domain holding exactly the given elements.
    #[must_use]
    pub fn from_elements(elements: impl IntoIterator<Item = T>) -> Self {
        let mut set = SetValue::default();
        set.set.extend(elements);
        AbstractDomain::value(set)
    }

    /// Adds an element in place.
    pub fn add(&mut self, element: T) {
        match self {
            AbstractDomain::Bottom => {}
            AbstractDomain::Value(v) => {
                v.set.insert(element);
            }
            AbstractDomain::Top => {
                let mut set = SetValue::default();
                set.set.insert(element);
                *self = AbstractDomain::Value(set);
            }
        }
    }

    /// The elements, empty for the sentinels.
    pub fn elements(&self) -> Vec<&T> {
        match self {
            AbstractDomain::Value(v) => v.elements().collect(),
            _ => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Simple-value domain

/// A single concrete value as an abstract value: joining two different
/// values loses everything (Top), meeting them is a contradiction (Bottom).
#[derive(Debug, Clone)]
pub struct SimpleValue<T: Clone + PartialEq> {
    value: T,
}

impl<T: Clone + PartialEq> SimpleValue<T> {
    /// The concrete value.
    #[must_use]
    pub fn get(&self) -> &T {
        &self.value
    }
}

impl<T: Clone + PartialEq> AbstractValue for SimpleValue<T> {
    fn clear(&mut self) {}

    fn kind(&self) -> AbstractValueKind {
        AbstractValueKind::Value
    }

    fn leq(&self, other: &Self) -> bool {
        self.equals(other)
    }

    fn equals(&self, other: &Self) -> bool {
        self.value == other.value
    }

    fn join_with(&mut self, other: &Self) -> AbstractValueKind {
        if self.equals(other) {
            AbstractValueKind::Value
        } else {
            AbstractValueKind::Top
        }
    }

    fn meet_with(&mut self, other: &Self) -> AbstractValueKind {
        if self.equals(other) {
            AbstractValueKind::Value
        } else {
            AbstractValueKind::Bottom
        }
    }
}

/// Top / one concrete value / Bottom.
pub type SimpleValueAbstractDomain<T> = AbstractDomain<SimpleValue<T>>;

impl<T: Clone + PartialEq> SimpleValueAbstractDomain<T> {
    /// A domain holding exactly `value`.
    #[must_use]
    pub fn of(value: T) -> Self {
        AbstractDomain::Value(SimpleValue { value })
    }

    /// The concrete value, when one is held.
    #[must_use]
    pub fn concrete(&self) -> Option<&T> {
        self.get_value().map(SimpleValue::get)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type StrSet = HashedSetAbstractDomain<&'static str>;

    // Both Domain and AbstractMapValue provide leq; pin down the lattice
    // one.
    fn leq(a: &StrSet, b: &StrSet) -> bool {
        Domain::leq(a, b)
    }

    #[test]
    fn test_domain_sentinels() {
        let top: StrSet = Domain::top();
        let bottom = StrSet::bottom();
        assert!(leq(&bottom, &top));
        assert!(!leq(&top, &bottom));
        assert!(leq(&bottom, &bottom));
        let v = StrSet::from_elements(["a"]);
        assert!(leq(&bottom, &v));
        assert!(leq(&v, &top));
        assert!(!leq(&v, &bottom));
    }

    #[test]
    fn test_join_is_lub() {
        let a = StrSet::from_elements(["a", "b"]);
        let b = StrSet::from_elements(["b", "c"]);
        let mut join = a.clone();
        join.join_with(&b);
        assert!(leq(&a, &join));
        assert!(leq(&b, &join));
        let mut meet = a.clone();
        meet.meet_with(&b);
        assert!(leq(&meet, &a));
        assert!(leq(&meet, &b));
        assert_eq!(meet.elements(), vec![&"b"]);
    }

    #[test]
    fn test_empty_set_normalizes_to_top() {
        let a = StrSet::from_elements(["x"]);
        let b = StrSet::from_elements(["y"]);
        let mut meet = a;
        meet.meet_with(&b);
        // Disjoint sets intersect to empty, the Top representative.
        assert!(Domain::is_top(&meet));
    }

    #[test]
    fn test_simple_value() {
        let a = SimpleValueAbstractDomain::of(42i64);
        let b = SimpleValueAbstractDomain::of(42i64);
        let c = SimpleValueAbstractDomain::of(7i64);
        let mut j = a.clone();
        j.join_with(&b);
        assert_eq!(j.concrete(), Some(&42));
        j.join_with(&c);
        assert!(Domain::is_top(&j));
        let mut m = a.clone();
        m.meet_with(&c);
        assert!(m.is_bottom());
    }

    #[test]
    fn test_join_with_sentinels() {
        let v = SimpleValueAbstractDomain::of(1i64);
        let top: SimpleValueAbstractDomain<i64> = Domain::top();
        let mut x = v.clone();
        x.join_with(&top);
        assert!(Domain::is_top(&x));
        let mut y = v.clone();
        y.join_with(&SimpleValueAbstractDomain::bottom());
        assert_eq!(y.concrete(), Some(&1));
        let mut z = SimpleValueAbstractDomain::bottom();
        z.join_with(&v);
        assert_eq!(z.concrete(), Some(&1));
        let mut w = v.clone();
        w.meet_with(&top);
        assert_eq!(w.concrete(), Some(&1));
    }
}
