//! Default lowering attributes.
//!
//! Operations reach the storage analyses with loop-nest and storage
//! attributes fully spelled out. These passes fill in canonical defaults for
//! what the frontend left implicit: one fresh step-1 loop per uncovered
//! domain dimension, and register storage for 0-dimensional compute results.

use log::debug;
use smallvec::SmallVec;
use weavec_ir::{Loop, Op, Program, StorageAttr, attributes::LoopIter};

/// Extends `prefix` with one fresh step-1 loop per domain dimension not
/// already iterated by a prefix loop.
pub fn default_loop_nest(
    program: &mut Program,
    num_dimensions: usize,
    prefix: &[Loop],
) -> SmallVec<[Loop; 4]> {
    let mut nest: SmallVec<[Loop; 4]> = prefix.iter().cloned().collect();
    for dim in 0..num_dimensions {
        let covered = prefix.iter().any(|l| {
            matches!(l.iter, LoopIter::Dimension { dim: d, .. } if d == dim)
        });
        if !covered {
            nest.push(Loop::new(program.gen_loop_name("loop"), dim));
        }
    }
    nest
}

/// Assigns a default loop nest to every compute operation without one.
pub fn assign_default_loop_nests(program: &mut Program) {
    let missing: Vec<Op> = program
        .ops()
        .filter(|(_, op)| op.kind.is_compute() && op.loop_nest.is_none())
        .map(|(id, _)| id)
        .collect();
    for id in missing {
        let num_dimensions = program.op(id).domain.len();
        let nest = default_loop_nest(program, num_dimensions, &[]);
        debug!(target: "storage", "assigned default loop nest to {id:?}");
        program.op_mut(id).loop_nest = Some(nest);
    }
}

/// Assigns register storage to every unannotated 0-dimensional compute
/// result. Higher-dimensional results are left for buffer assignment.
pub fn assign_default_storage(program: &mut Program) {
    let missing: Vec<(Op, usize)> = program
        .ops()
        .filter(|(_, op)| op.kind.is_compute())
        .flat_map(|(id, op)| {
            op.results
                .iter()
                .enumerate()
                .filter(|&(result, &value)| {
                    op.storage(result).is_none() && program.value(value).ty.rank == 0
                })
                .map(move |(result, _)| (id, result))
                .collect::<Vec<_>>()
        })
        .collect();
    for (id, result) in missing {
        program.op_mut(id).storage[result] = Some(StorageAttr::register());
    }
}
