//! Where each operation's iterations are materialized.
//!
//! An operation's iteration space is the sequence of loops its computations
//! run in, together with a mapping from the operation's domain to those
//! loops. Operations with a `loop_nest` attribute state it directly;
//! value-routing operations without one inherit the space of their first
//! operand's producer, translated through the access mapping.

use smallvec::SmallVec;
use weavec_ir::{EntityRef, Mapping, Op, OpKind, Program, SmallStr};

use crate::loop_nest::domain_to_loops;

/// The loops an operation executes in.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IterationSpace {
    loop_names: SmallVec<[SmallStr; 4]>,
    /// From the operation's domain to the loops.
    mapping: Mapping,
    fully_specified: bool,
}

impl IterationSpace {
    fn unspecified(domain_size: usize) -> Self {
        Self {
            loop_names: SmallVec::new(),
            mapping: Mapping::empty(domain_size),
            fully_specified: domain_size == 0,
        }
    }

    pub fn loop_names(&self) -> &[SmallStr] {
        &self.loop_names
    }

    pub fn mapping(&self) -> &Mapping {
        &self.mapping
    }

    pub fn num_loops(&self) -> usize {
        self.mapping.len()
    }

    /// Whether every domain dimension is accounted for by a loop.
    pub fn fully_specified(&self) -> bool {
        self.fully_specified
    }

    /// Length of the common loop prefix with `other`.
    pub fn num_common_loops(&self, other: &[SmallStr]) -> usize {
        self.loop_names
            .iter()
            .zip(other)
            .take_while(|(a, b)| a == b)
            .count()
    }
}

/// Iteration spaces for every operation of a program.
pub struct IterationSpaceAnalysis {
    spaces: Vec<IterationSpace>,
}

impl IterationSpaceAnalysis {
    pub fn compute(program: &Program) -> Self {
        let mut spaces: Vec<IterationSpace> = Vec::with_capacity(program.num_ops());
        for (_, op) in program.ops() {
            let space = if op.loop_nest.is_some() {
                let mapping = domain_to_loops(op);
                // Rematerialized loops map from nowhere; that does not make
                // the space underspecified, uncovered domain dimensions do.
                let fully_specified = !mapping.inverse().has_none();
                IterationSpace { loop_names: op.loop_names(), mapping, fully_specified }
            } else if matches!(
                op.kind,
                OpKind::ProjAny | OpKind::ProjLast | OpKind::Fby | OpKind::FromScalar
            ) && !op.operands.is_empty()
            {
                // Producers precede users, so the producer's space is already
                // computed.
                let access = &op.operands[0];
                let producer = program.producer(access.value);
                let producer_op = program.op(producer);
                let inherited = &spaces[producer.index()];
                let mapping = access
                    .mapping
                    .clone()
                    .resize(producer_op.domain.len())
                    .compose(inherited.mapping())
                    .canonicalize();
                let fully_specified = inherited.fully_specified && !mapping.has_none();
                IterationSpace {
                    loop_names: inherited.loop_names.clone(),
                    mapping,
                    fully_specified,
                }
            } else {
                IterationSpace::unspecified(op.domain.len())
            };
            spaces.push(space);
        }
        Self { spaces }
    }

    pub fn get(&self, op: Op) -> &IterationSpace {
        &self.spaces[op.index()]
    }

    /// Translates `domain_mapping`, a mapping from `to`'s domain to `from`'s
    /// domain, into a mapping from `to`'s loops to `from`'s loops.
    pub fn translate_mapping(
        &self,
        program: &Program,
        to: Op,
        from: Op,
        domain_mapping: &Mapping,
    ) -> Mapping {
        debug_assert_eq!(domain_mapping.use_domain_size(), program.op(to).domain.len());
        debug_assert_eq!(domain_mapping.len(), program.op(from).domain.len());
        self.get(to)
            .mapping()
            .inverse()
            .compose(domain_mapping)
            .compose(self.get(from).mapping())
            .canonicalize()
    }
}
