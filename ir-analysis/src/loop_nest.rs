//! Loop identity across operations.
//!
//! Loop names are global: two operations naming the same loop are fused into
//! it. This analysis records, for every loop name, which dimension it
//! iterates, at which step, and inside which loop it nests, and rejects
//! programs where two occurrences disagree.

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use weavec_ir::{
    Mapping, MappingExpr, Op, Operation, Program, SmallStr, SourceSpan, Value, ValueAccess,
    attributes::LoopIter,
};

use crate::Report;

#[derive(Debug, thiserror::Error, Diagnostic)]
pub enum FusionError {
    #[error("loop \"{name}\" iterates different dimensions in different operations")]
    DimensionMismatch {
        name: SmallStr,
        #[label("loop reused here")]
        span: SourceSpan,
        #[label("first occurrence")]
        previous: SourceSpan,
    },
    #[error("loop \"{name}\" has step {step} here but step {previous_step} elsewhere")]
    StepMismatch {
        name: SmallStr,
        step: u64,
        previous_step: u64,
        #[label("loop reused here")]
        span: SourceSpan,
        #[label("first occurrence")]
        previous: SourceSpan,
    },
    #[error("loop \"{name}\" is nested in different outer loops in different operations")]
    NestingConflict {
        name: SmallStr,
        #[label("loop reused here")]
        span: SourceSpan,
        #[label("first occurrence")]
        previous: SourceSpan,
    },
}

/// Everything known about one named loop.
#[derive(Clone, Debug)]
struct LoopInfo {
    dimension: Value,
    step: u64,
    outer: Option<SmallStr>,
    span: SourceSpan,
}

/// The iteration domain spanned by a sequence of loops, and how that domain
/// maps to the loops.
#[derive(Clone, Debug, PartialEq)]
pub struct LoopNest {
    /// Dimensions of the domain, each accessed through a mapping from the
    /// loop space to the dimension's own defining domain.
    pub domain: SmallVec<[ValueAccess; 4]>,
    /// From `domain` to the loops, one expression per loop.
    pub domain_to_loops: Mapping,
}

impl LoopNest {
    pub fn num_loops(&self) -> usize {
        self.domain_to_loops.len()
    }
}

/// Per-name loop table for a whole program.
#[derive(Debug)]
pub struct LoopFusionAnalysis {
    loops: FxHashMap<SmallStr, LoopInfo>,
}

impl LoopFusionAnalysis {
    pub fn compute(program: &Program) -> Result<Self, Report> {
        let mut loops: FxHashMap<SmallStr, LoopInfo> = FxHashMap::default();
        for (_, op) in program.ops() {
            let Some(nest) = op.loop_nest.as_deref() else { continue };
            let mut outer: Option<SmallStr> = None;
            for l in nest {
                if let LoopIter::Dimension { dim, step } = l.iter {
                    let dimension = op.domain[dim];
                    match loops.get(&l.name) {
                        Some(info) => {
                            if info.dimension != dimension {
                                return Err(FusionError::DimensionMismatch {
                                    name: l.name.clone(),
                                    span: op.span,
                                    previous: info.span,
                                }
                                .into());
                            }
                            if info.step != step {
                                return Err(FusionError::StepMismatch {
                                    name: l.name.clone(),
                                    step,
                                    previous_step: info.step,
                                    span: op.span,
                                    previous: info.span,
                                }
                                .into());
                            }
                            if info.outer != outer {
                                return Err(FusionError::NestingConflict {
                                    name: l.name.clone(),
                                    span: op.span,
                                    previous: info.span,
                                }
                                .into());
                            }
                        }
                        None => {
                            loops.insert(
                                l.name.clone(),
                                LoopInfo { dimension, step, outer: outer.clone(), span: op.span },
                            );
                        }
                    }
                }
                outer = Some(l.name.clone());
            }
        }
        Ok(Self { loops })
    }

    /// The domain spanned by the given loops, outermost first. Loops that
    /// never iterate a dimension anywhere in the program contribute a `None`
    /// expression and no domain dimension.
    pub fn get_loop_nest(&self, names: &[SmallStr], program: &Program) -> LoopNest {
        let mut domain: SmallVec<[ValueAccess; 4]> = SmallVec::new();
        let mut dim_pos: FxHashMap<Value, usize> = FxHashMap::default();
        let mut exprs = Vec::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            let Some(info) = self.loops.get(name) else {
                exprs.push(MappingExpr::None);
                continue;
            };
            let pos = *dim_pos.entry(info.dimension).or_insert_with(|| {
                domain.push(ValueAccess::new(info.dimension, Mapping::empty(names.len())));
                domain.len() - 1
            });
            // Factor chain: the steps of every loop over the same dimension up
            // to this one, coarsest first.
            let factors: SmallVec<[u64; 2]> = names[..=i]
                .iter()
                .filter_map(|n| self.loops.get(n))
                .filter(|l| l.dimension == info.dimension)
                .map(|l| l.step)
                .collect();
            if factors.len() == 1 && info.step == 1 {
                exprs.push(MappingExpr::Dim(pos));
            } else {
                exprs.push(MappingExpr::Stripe {
                    operand: Box::new(MappingExpr::Dim(pos)),
                    factors,
                });
            }
        }
        for access in &mut domain {
            access.mapping = self.dimension_access(access.value, names, program);
        }
        let domain_to_loops = Mapping::new(domain.len(), exprs);
        LoopNest { domain, domain_to_loops }
    }

    /// Maps the loop space of `names` into the defining domain of dimension
    /// `dimension`. Defining dimensions with no step-1 loop among `names` map
    /// to `None`.
    fn dimension_access(
        &self,
        dimension: Value,
        names: &[SmallStr],
        program: &Program,
    ) -> Mapping {
        let def: &Operation = program.op(program.producer(dimension));
        let exprs = def.domain.iter().map(|&dv| {
            names
                .iter()
                .position(|n| {
                    self.loops
                        .get(n)
                        .is_some_and(|info| info.dimension == dv && info.step == 1)
                })
                .map(MappingExpr::Dim)
                .unwrap_or(MappingExpr::None)
        });
        Mapping::new(names.len(), exprs)
    }

    /// Dimension and step of a named loop, if the name is known.
    pub fn loop_dimension(&self, name: &SmallStr) -> Option<(Value, u64)> {
        self.loops.get(name).map(|info| (info.dimension, info.step))
    }
}

/// Maps an operation's domain to its own loop nest, striping strip-mined
/// dimensions. Rematerialized loops map to `None`. Shared between the fusion
/// and iteration-space analyses.
pub(crate) fn domain_to_loops(op: &Operation) -> Mapping {
    let nest = op.loop_nest.as_deref().unwrap_or(&[]);
    let exprs = nest.iter().enumerate().map(|(i, l)| match l.iter {
        LoopIter::Rematerialize => MappingExpr::None,
        LoopIter::Dimension { dim, step } => {
            let factors: SmallVec<[u64; 2]> = nest[..=i]
                .iter()
                .filter_map(|other| match other.iter {
                    LoopIter::Dimension { dim: d, step: s } if d == dim => Some(s),
                    _ => None,
                })
                .collect();
            if factors.len() == 1 && step == 1 {
                MappingExpr::Dim(dim)
            } else {
                MappingExpr::Stripe { operand: Box::new(MappingExpr::Dim(dim)), factors }
            }
        }
    });
    Mapping::new(op.domain.len(), exprs.collect::<Vec<_>>())
}

/// Like [`domain_to_loops`] but keyed by [`Op`].
pub(crate) fn op_domain_to_loops(program: &Program, op: Op) -> Mapping {
    domain_to_loops(program.op(op))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use weavec_ir::{
        DomainShape, Loop, OpKind, Operation, ScalarType, SourceSpan, ValueType, smallvec,
    };

    use super::*;

    fn range(program: &mut Program) -> Value {
        let op = program.append(
            Operation::new(OpKind::Range, SourceSpan::from(0..0)),
            [ValueType::scalar(ScalarType::Index)],
        );
        program.op(op).results[0]
    }

    fn compute(program: &mut Program, domain: &[Value], loops: Vec<Loop>) -> Op {
        let rank = domain.len();
        program.append(
            Operation::new(OpKind::Compute, SourceSpan::from(0..0))
                .with_domain(domain.iter().copied(), DomainShape::rectangular(rank))
                .with_loop_nest(loops),
            [],
        )
    }

    #[test]
    fn strip_mined_dimension_yields_stripe_chain() {
        let mut program = Program::new();
        let d = range(&mut program);
        compute(
            &mut program,
            &[d],
            vec![Loop::strip_mined("block", 0, 4), Loop::strip_mined("point", 0, 1)],
        );
        let fusion = LoopFusionAnalysis::compute(&program).expect("consistent");
        let names: SmallVec<[SmallStr; 4]> = smallvec!["block".into(), "point".into()];
        let nest = fusion.get_loop_nest(&names, &program);
        assert_eq!(nest.domain.len(), 1);
        assert_eq!(nest.domain[0].value, d);
        assert_eq!(
            nest.domain_to_loops,
            Mapping::new(
                1,
                [
                    MappingExpr::Stripe {
                        operand: Box::new(MappingExpr::Dim(0)),
                        factors: smallvec![4],
                    },
                    MappingExpr::Stripe {
                        operand: Box::new(MappingExpr::Dim(0)),
                        factors: smallvec![4, 1],
                    },
                ]
            )
        );
        // Inverting recombines the levels into the dimension.
        assert!(!nest.domain_to_loops.inverse().has_none());
    }

    #[test]
    fn reusing_a_name_for_another_dimension_fails() {
        let mut program = Program::new();
        let d0 = range(&mut program);
        let d1 = range(&mut program);
        compute(&mut program, &[d0], vec![Loop::new("i", 0)]);
        compute(&mut program, &[d1], vec![Loop::new("i", 0)]);
        let err = LoopFusionAnalysis::compute(&program).unwrap_err();
        assert!(err.to_string().contains("different dimensions"));
    }

    #[test]
    fn nesting_must_agree_across_operations() {
        let mut program = Program::new();
        let d0 = range(&mut program);
        let d1 = range(&mut program);
        compute(&mut program, &[d0, d1], vec![Loop::new("i", 0), Loop::new("j", 1)]);
        compute(&mut program, &[d1], vec![Loop::new("j", 0)]);
        let err = LoopFusionAnalysis::compute(&program).unwrap_err();
        assert!(err.to_string().contains("nested in different outer loops"));
    }
}
