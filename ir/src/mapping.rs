//! Partial mappings between ordered index spaces.
//!
//! A [`Mapping`] sends points of a *use domain* of known size to points of a
//! target space, one [`MappingExpr`] per target dimension. Expressions form a
//! closed language: direct dimension references, strip-mining
//! ([`MappingExpr::Stripe`]) and its inverse ([`MappingExpr::UnStripe`]), plus
//! two placeholders with distinct meanings. `None` marks a target dimension no
//! source dimension maps to; `Unknown` marks a dimension whose expression has
//! simply not been discovered yet and that unification may still fill in.

use core::fmt;

use bitvec::prelude::*;
use smallvec::SmallVec;

/// One target dimension of a [`Mapping`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum MappingExpr {
    /// The `i`-th dimension of the use domain.
    Dim(usize),
    /// Iterates `operand` with step `factors.last()`, inside the blocks carved
    /// out by the coarser steps `factors[..n-1]`. The factor chain identifies
    /// the stripe level: `stripe(d, [4])` is the outer blocked counter,
    /// `stripe(d, [4, 1])` the point counter within a block.
    Stripe {
        operand: Box<MappingExpr>,
        factors: SmallVec<[u64; 2]>,
    },
    /// Recombines stripe levels into the original dimension, one operand per
    /// level, finest last. Inverse of the corresponding `Stripe` chain.
    UnStripe {
        operands: Vec<MappingExpr>,
        factors: SmallVec<[u64; 2]>,
    },
    /// No source dimension maps here.
    None,
    /// Not yet known; unification may substitute any expression.
    Unknown,
}

impl MappingExpr {
    pub fn has_none(&self) -> bool {
        match self {
            Self::None => true,
            Self::Dim(_) | Self::Unknown => false,
            Self::Stripe { operand, .. } => operand.has_none(),
            Self::UnStripe { operands, .. } => operands.iter().any(Self::has_none),
        }
    }

    pub fn has_unknown(&self) -> bool {
        match self {
            Self::Unknown => true,
            Self::Dim(_) | Self::None => false,
            Self::Stripe { operand, .. } => operand.has_unknown(),
            Self::UnStripe { operands, .. } => operands.iter().any(Self::has_unknown),
        }
    }

    pub fn is_fully_specified(&self) -> bool {
        !self.has_none() && !self.has_unknown()
    }

    /// Smallest use-domain size this expression is valid in.
    pub fn min_domain_size(&self) -> usize {
        match self {
            Self::Dim(d) => d + 1,
            Self::None | Self::Unknown => 0,
            Self::Stripe { operand, .. } => operand.min_domain_size(),
            Self::UnStripe { operands, .. } => operands
                .iter()
                .map(Self::min_domain_size)
                .max()
                .unwrap_or(0),
        }
    }

    /// Replaces each `Dim(i)` by `exprs[i]`. Out-of-range references become
    /// `None`.
    pub fn substitute_dims(&self, exprs: &[MappingExpr]) -> MappingExpr {
        match self {
            Self::Dim(d) => exprs.get(*d).cloned().unwrap_or(Self::None),
            Self::None => Self::None,
            Self::Unknown => Self::Unknown,
            Self::Stripe { operand, factors } => Self::Stripe {
                operand: Box::new(operand.substitute_dims(exprs)),
                factors: factors.clone(),
            },
            Self::UnStripe { operands, factors } => Self::UnStripe {
                operands: operands.iter().map(|e| e.substitute_dims(exprs)).collect(),
                factors: factors.clone(),
            },
        }
    }

    /// Marks the use-domain dimensions this expression reads in `mask`.
    pub fn collect_dependencies(&self, mask: &mut BitVec) {
        match self {
            Self::Dim(d) => mask.set(*d, true),
            Self::None | Self::Unknown => {}
            Self::Stripe { operand, .. } => operand.collect_dependencies(mask),
            Self::UnStripe { operands, .. } => {
                for operand in operands {
                    operand.collect_dependencies(mask);
                }
            }
        }
    }

    /// Least upper bound treating both `None` and `Unknown` as bottom.
    pub fn unify(&self, other: &Self) -> Option<Self> {
        self.unify_impl(other, true)
    }

    /// Least upper bound treating only `Unknown` as bottom; `None` unifies
    /// with nothing but itself.
    pub fn unify_unknown(&self, other: &Self) -> Option<Self> {
        self.unify_impl(other, false)
    }

    fn unify_impl(&self, other: &Self, none_is_bottom: bool) -> Option<Self> {
        match (self, other) {
            (Self::Unknown, e) | (e, Self::Unknown) => Some(e.clone()),
            (Self::None, Self::None) => Some(Self::None),
            (Self::None, e) | (e, Self::None) if none_is_bottom => Some(e.clone()),
            (Self::Dim(a), Self::Dim(b)) if a == b => Some(Self::Dim(*a)),
            (
                Self::Stripe { operand: a, factors: fa },
                Self::Stripe { operand: b, factors: fb },
            ) if fa == fb => Some(Self::Stripe {
                operand: Box::new(a.unify_impl(b, none_is_bottom)?),
                factors: fa.clone(),
            }),
            (
                Self::UnStripe { operands: a, factors: fa },
                Self::UnStripe { operands: b, factors: fb },
            ) => {
                // Factor chains may describe the same dimension down to
                // different depths; the shorter chain must be a prefix of the
                // longer one, whose finer levels carry over unchanged.
                let (short, short_f, long, long_f) = if fa.len() <= fb.len() {
                    (a, fa, b, fb)
                } else {
                    (b, fb, a, fa)
                };
                if long_f[..short_f.len()] != short_f[..] {
                    return None;
                }
                let mut operands = Vec::with_capacity(long.len());
                for (x, y) in short.iter().zip(long) {
                    operands.push(x.unify_impl(y, none_is_bottom)?);
                }
                operands.extend(long[short.len()..].iter().cloned());
                Some(Self::UnStripe { operands, factors: long_f.clone() })
            }
            _ => None,
        }
    }

    /// Accumulates into `inverse` the expressions mapping the target space
    /// back to the use domain, given that this expression computes target
    /// dimension `context`. Fails if two occurrences of a use dimension
    /// disagree.
    pub fn set_inverse(
        &self,
        context: MappingExpr,
        inverse: &mut [MappingExpr],
    ) -> Result<(), ()> {
        match self {
            Self::Dim(d) => {
                inverse[*d] = inverse[*d].unify(&context).ok_or(())?;
                Ok(())
            }
            Self::None | Self::Unknown => Ok(()),
            Self::Stripe { operand, factors } => {
                let level = factors.len() - 1;
                let mut operands = vec![Self::Unknown; factors.len()];
                operands[level] = context;
                operand.set_inverse(
                    Self::UnStripe { operands, factors: factors.clone() },
                    inverse,
                )
            }
            Self::UnStripe { operands, factors } => {
                for (i, operand) in operands.iter().enumerate() {
                    operand.set_inverse(
                        Self::Stripe {
                            operand: Box::new(context.clone()),
                            factors: factors[..=i].iter().copied().collect(),
                        },
                        inverse,
                    )?;
                }
                Ok(())
            }
        }
    }

    /// Structural simplification: collapses stripe-of-unstripe and
    /// unstripe-of-stripes pairs, and erases trivial single-level factors.
    pub fn canonicalize(&self) -> MappingExpr {
        match self {
            Self::Dim(d) => Self::Dim(*d),
            Self::None => Self::None,
            Self::Unknown => Self::Unknown,
            Self::Stripe { operand, factors } => {
                let operand = operand.canonicalize();
                if factors.len() == 1 && factors[0] == 1 {
                    return operand;
                }
                if let Self::UnStripe { operands, factors: inner } = &operand {
                    if factors.len() <= inner.len() && inner[..factors.len()] == factors[..] {
                        return operands[factors.len() - 1].clone();
                    }
                }
                Self::Stripe { operand: Box::new(operand), factors: factors.clone() }
            }
            Self::UnStripe { operands, factors } => {
                let operands: Vec<_> = operands.iter().map(Self::canonicalize).collect();
                if operands.len() == 1 && factors[0] == 1 {
                    return operands.into_iter().next().unwrap_or(Self::None);
                }
                if let Some(whole) = unstripe_of_stripes(&operands, factors) {
                    return whole;
                }
                Self::UnStripe { operands, factors: factors.clone() }
            }
        }
    }
}

/// Detects `unstripe(stripe(e, f[..1]), ..., stripe(e, f), f)` and returns `e`.
fn unstripe_of_stripes(operands: &[MappingExpr], factors: &[u64]) -> Option<MappingExpr> {
    let MappingExpr::Stripe { operand: first, factors: f0 } = operands.first()? else {
        return None;
    };
    if f0[..] != factors[..1] {
        return None;
    }
    for (i, expr) in operands.iter().enumerate() {
        let MappingExpr::Stripe { operand, factors: f } = expr else {
            return None;
        };
        if operand != first || f[..] != factors[..=i] {
            return None;
        }
    }
    Some((**first).clone())
}

impl fmt::Display for MappingExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dim(d) => write!(f, "d{d}"),
            Self::None => f.write_str("none"),
            Self::Unknown => f.write_str("?"),
            Self::Stripe { operand, factors } => {
                write!(f, "stripe({operand}, [")?;
                for (i, factor) in factors.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{factor}")?;
                }
                f.write_str("])")
            }
            Self::UnStripe { operands, factors } => {
                f.write_str("unstripe(")?;
                for operand in operands {
                    write!(f, "{operand}, ")?;
                }
                f.write_str("[")?;
                for (i, factor) in factors.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{factor}")?;
                }
                f.write_str("])")
            }
        }
    }
}

/// A partial mapping from a `use_domain_size`-dimensional space to a target
/// space with one expression per target dimension.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Mapping {
    use_domain_size: usize,
    exprs: SmallVec<[MappingExpr; 4]>,
}

impl Mapping {
    pub fn new(use_domain_size: usize, exprs: impl IntoIterator<Item = MappingExpr>) -> Self {
        let exprs: SmallVec<[MappingExpr; 4]> = exprs.into_iter().collect();
        debug_assert!(
            exprs.iter().all(|e| e.min_domain_size() <= use_domain_size),
            "expression references a dimension outside the use domain"
        );
        Self { use_domain_size, exprs }
    }

    /// The identity over an `n`-dimensional space.
    pub fn identity(n: usize) -> Self {
        Self { use_domain_size: n, exprs: (0..n).map(MappingExpr::Dim).collect() }
    }

    /// A mapping with no target dimensions.
    pub fn empty(use_domain_size: usize) -> Self {
        Self { use_domain_size, exprs: SmallVec::new() }
    }

    /// Number of target dimensions.
    pub fn len(&self) -> usize {
        self.exprs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exprs.is_empty()
    }

    pub fn use_domain_size(&self) -> usize {
        self.use_domain_size
    }

    pub fn exprs(&self) -> &[MappingExpr] {
        &self.exprs
    }

    pub fn has_none(&self) -> bool {
        self.exprs.iter().any(MappingExpr::has_none)
    }

    pub fn has_unknown(&self) -> bool {
        self.exprs.iter().any(MappingExpr::has_unknown)
    }

    pub fn is_fully_specified(&self) -> bool {
        !self.has_none() && !self.has_unknown()
    }

    /// Smallest use-domain size all expressions are valid in.
    pub fn min_domain_size(&self) -> usize {
        self.exprs.iter().map(MappingExpr::min_domain_size).max().unwrap_or(0)
    }

    /// Functional composition: if `self: A -> B` and `other: B -> C`, the
    /// result maps `A -> C`.
    pub fn compose(&self, other: &Mapping) -> Mapping {
        debug_assert_eq!(self.len(), other.use_domain_size());
        Mapping {
            use_domain_size: self.use_domain_size,
            exprs: other.exprs.iter().map(|e| e.substitute_dims(&self.exprs)).collect(),
        }
    }

    /// The inverse mapping. Use-domain dimensions no expression mentions map
    /// to `None`.
    pub fn inverse(&self) -> Mapping {
        let mut inverse = vec![MappingExpr::None; self.use_domain_size];
        for (target, expr) in self.exprs.iter().enumerate() {
            let consistent = expr.set_inverse(MappingExpr::Dim(target), &mut inverse);
            debug_assert!(consistent.is_ok(), "mapping is not invertible");
        }
        Mapping { use_domain_size: self.exprs.len(), exprs: inverse.into_iter().collect() }
    }

    /// Truncates or extends (with `None`) the target space to `len`
    /// dimensions.
    pub fn resize(mut self, len: usize) -> Mapping {
        self.exprs.resize(len, MappingExpr::None);
        self
    }

    /// Changes the use-domain size. Shrinking turns every expression that
    /// depends on a removed dimension into `None`.
    pub fn resize_use_domain(mut self, size: usize) -> Mapping {
        if size < self.use_domain_size {
            for expr in &mut self.exprs {
                if expr.min_domain_size() > size {
                    *expr = MappingExpr::None;
                }
            }
        }
        self.use_domain_size = size;
        self
    }

    /// Renumbers every use-domain dimension `i` to `i + shift`, growing the
    /// use domain accordingly.
    pub fn shift_right(&self, shift: usize) -> Mapping {
        let table: Vec<_> = (0..self.use_domain_size)
            .map(|i| MappingExpr::Dim(i + shift))
            .collect();
        Mapping {
            use_domain_size: self.use_domain_size + shift,
            exprs: self.exprs.iter().map(|e| e.substitute_dims(&table)).collect(),
        }
    }

    /// Prepends target dimensions computed by `prefix`, over the same use
    /// domain.
    pub fn add_prefix(&self, prefix: impl IntoIterator<Item = MappingExpr>) -> Mapping {
        let mut exprs: SmallVec<[MappingExpr; 4]> = prefix.into_iter().collect();
        debug_assert!(exprs.iter().all(|e| e.min_domain_size() <= self.use_domain_size));
        exprs.extend(self.exprs.iter().cloned());
        Mapping { use_domain_size: self.use_domain_size, exprs }
    }

    /// Removes the first `n` target dimensions.
    pub fn drop_front(&self, n: usize) -> Mapping {
        Mapping {
            use_domain_size: self.use_domain_size,
            exprs: self.exprs[n..].iter().cloned().collect(),
        }
    }

    /// Bit `i` is set iff some expression reads use-domain dimension `i`.
    pub fn dependency_mask(&self) -> BitVec {
        let mut mask = bitvec![0; self.use_domain_size];
        for expr in &self.exprs {
            expr.collect_dependencies(&mut mask);
        }
        mask
    }

    /// Replaces every top-level `None` by a fresh use-domain dimension, making
    /// the mapping surjective onto its target space.
    pub fn make_surjective(&self) -> Mapping {
        let mut use_domain_size = self.use_domain_size;
        let exprs = self
            .exprs
            .iter()
            .map(|e| {
                if matches!(e, MappingExpr::None) {
                    let dim = MappingExpr::Dim(use_domain_size);
                    use_domain_size += 1;
                    dim
                } else {
                    e.clone()
                }
            })
            .collect();
        Mapping { use_domain_size, exprs }
    }

    pub fn canonicalize(&self) -> Mapping {
        Mapping {
            use_domain_size: self.use_domain_size,
            exprs: self.exprs.iter().map(MappingExpr::canonicalize).collect(),
        }
    }

    /// Pointwise [`MappingExpr::unify`]. Mappings must have the same number of
    /// target dimensions.
    pub fn unify(&self, other: &Mapping) -> Option<Mapping> {
        self.unify_impl(other, true)
    }

    /// Pointwise [`MappingExpr::unify_unknown`].
    pub fn unify_unknown(&self, other: &Mapping) -> Option<Mapping> {
        self.unify_impl(other, false)
    }

    fn unify_impl(&self, other: &Mapping, none_is_bottom: bool) -> Option<Mapping> {
        if self.len() != other.len() {
            return None;
        }
        let mut exprs = SmallVec::with_capacity(self.len());
        for (a, b) in self.exprs.iter().zip(&other.exprs) {
            exprs.push(a.unify_impl(b, none_is_bottom)?);
        }
        Some(Mapping {
            use_domain_size: self.use_domain_size.max(other.use_domain_size),
            exprs,
        })
    }
}

impl Default for Mapping {
    fn default() -> Self {
        Mapping::empty(0)
    }
}

impl fmt::Display for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}) -> [", self.use_domain_size)?;
        for (i, expr) in self.exprs.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{expr}")?;
        }
        f.write_str("]")
    }
}

/// Accumulates into `constraints` what each use-domain dimension of `new` must
/// unify to for `new` to be compatible with `old`. `constraints[i]` constrains
/// dimension `i` of `new`'s use domain, expressed over `old`'s use domain.
///
/// `None` and `Unknown` on either side constrain nothing. Fails on a
/// structural mismatch.
pub fn unification_constraints(
    new: &MappingExpr,
    old: &MappingExpr,
    constraints: &mut [MappingExpr],
) -> Result<(), ()> {
    match (new, old) {
        (_, MappingExpr::None | MappingExpr::Unknown)
        | (MappingExpr::None | MappingExpr::Unknown, _) => Ok(()),
        (MappingExpr::Dim(d), old) => {
            constraints[*d] = constraints[*d].unify(old).ok_or(())?;
            Ok(())
        }
        (
            MappingExpr::Stripe { operand: a, factors: fa },
            MappingExpr::Stripe { operand: b, factors: fb },
        ) if fa == fb => unification_constraints(a, b, constraints),
        (
            MappingExpr::UnStripe { operands: a, factors: fa },
            MappingExpr::UnStripe { operands: b, factors: fb },
        ) if fa == fb => {
            for (x, y) in a.iter().zip(b) {
                unification_constraints(x, y, constraints)?;
            }
            Ok(())
        }
        _ => Err(()),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use smallvec::smallvec;

    use super::*;

    fn dim(d: usize) -> MappingExpr {
        MappingExpr::Dim(d)
    }

    fn stripe(operand: MappingExpr, factors: &[u64]) -> MappingExpr {
        MappingExpr::Stripe {
            operand: Box::new(operand),
            factors: factors.iter().copied().collect(),
        }
    }

    fn unstripe(operands: Vec<MappingExpr>, factors: &[u64]) -> MappingExpr {
        MappingExpr::UnStripe { operands, factors: factors.iter().copied().collect() }
    }

    #[test]
    fn compose_with_identity() {
        let m = Mapping::new(3, [dim(2), dim(0)]);
        assert_eq!(Mapping::identity(3).compose(&m), m);
        assert_eq!(m.compose(&Mapping::identity(2)), m);
    }

    #[test]
    fn compose_substitutes() {
        let a = Mapping::new(2, [dim(1), dim(0)]);
        let b = Mapping::new(2, [stripe(dim(0), &[4]), dim(1)]);
        assert_eq!(a.compose(&b), Mapping::new(2, [stripe(dim(1), &[4]), dim(0)]));
    }

    #[test]
    fn inverse_of_permutation() {
        let m = Mapping::new(2, [dim(1), dim(0)]);
        assert_eq!(m.inverse(), m);
        assert_eq!(m.compose(&m.inverse()), Mapping::identity(2));
    }

    #[test]
    fn inverse_leaves_unmapped_dims_none() {
        let m = Mapping::new(3, [dim(2)]);
        assert_eq!(
            m.inverse(),
            Mapping::new(1, [MappingExpr::None, MappingExpr::None, dim(0)])
        );
    }

    #[test]
    fn inverse_of_stripe_pair() {
        let m = Mapping::new(1, [stripe(dim(0), &[4]), stripe(dim(0), &[4, 1])]);
        let expected = Mapping::new(2, [unstripe(vec![dim(0), dim(1)], &[4, 1])]);
        assert_eq!(m.inverse(), expected);
        // Round trip back through the inverse recombines the stripes.
        assert_eq!(
            m.compose(&m.inverse()).canonicalize(),
            Mapping::new(1, [dim(0)])
        );
    }

    #[test]
    fn canonicalize_collapses_trivial_factors() {
        let m = Mapping::new(1, [stripe(dim(0), &[1])]);
        assert_eq!(m.canonicalize(), Mapping::new(1, [dim(0)]));
        let m = Mapping::new(1, [unstripe(vec![dim(0)], &[1])]);
        assert_eq!(m.canonicalize(), Mapping::new(1, [dim(0)]));
    }

    #[test]
    fn make_surjective_allocates_fresh_dims() {
        let m = Mapping::new(1, [MappingExpr::None, dim(0), MappingExpr::None]);
        let s = m.make_surjective();
        assert_eq!(s, Mapping::new(3, [dim(1), dim(0), dim(2)]));
        assert!(!s.has_none());
    }

    #[test]
    fn resize_use_domain_drops_dependent_exprs() {
        let m = Mapping::new(2, [dim(0), dim(1)]);
        assert_eq!(
            m.resize_use_domain(1),
            Mapping::new(1, [dim(0), MappingExpr::None])
        );
    }

    #[test]
    fn unify_resolves_placeholders() {
        let a = Mapping::new(2, [dim(0), MappingExpr::Unknown]);
        let b = Mapping::new(2, [MappingExpr::None, dim(1)]);
        assert_eq!(a.unify(&b), Some(Mapping::new(2, [dim(0), dim(1)])));
        // Without none-as-bottom, the first dimension conflicts.
        assert_eq!(a.unify_unknown(&b), None);
    }

    #[test]
    fn unify_rejects_mismatched_dims() {
        let a = Mapping::new(2, [dim(0)]);
        let b = Mapping::new(2, [dim(1)]);
        assert_eq!(a.unify(&b), None);
    }

    #[test]
    fn unify_aligns_unstripe_prefixes() {
        let a = unstripe(vec![dim(0)], &[4]);
        let b = unstripe(vec![MappingExpr::Unknown, dim(1)], &[4, 1]);
        assert_eq!(a.unify(&b), Some(unstripe(vec![dim(0), dim(1)], &[4, 1])));
    }

    #[test]
    fn dependency_mask_covers_nested_exprs() {
        let m = Mapping::new(4, [stripe(dim(2), &[8]), unstripe(vec![dim(0)], &[2])]);
        let mask = m.dependency_mask();
        assert_eq!(mask.iter_ones().collect::<Vec<_>>(), vec![0, 2]);
    }

    #[test]
    fn shift_right_renumbers() {
        let m = Mapping::new(2, [dim(1)]);
        assert_eq!(m.shift_right(3), Mapping::new(5, [dim(4)]));
    }

    #[test]
    fn constraints_pin_new_dims_to_old_exprs() {
        let mut constraints: smallvec::SmallVec<[MappingExpr; 4]> =
            smallvec![MappingExpr::None; 2];
        unification_constraints(&dim(1), &stripe(dim(0), &[4]), &mut constraints)
            .expect("compatible");
        assert_eq!(constraints[1], stripe(dim(0), &[4]));
        // A second, conflicting occurrence fails.
        assert!(unification_constraints(&dim(1), &dim(1), &mut constraints).is_err());
    }
}
