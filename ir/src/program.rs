//! Operations, values and the program that owns them.
//!
//! Programs are append-only: operations are numbered in the order they are
//! added and that order is the program order. Operands must reference values
//! that already exist, so producers always precede their users.

use compact_str::format_compact;
use cranelift_entity::{EntityRef, PrimaryMap, entity_impl};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::{
    Loop, Mapping, SmallStr, SourceSpan, StorageAttr, ValueType, attributes::LoopIter,
};

/// An opaque reference to an operation. Ordering follows program order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Op(u32);
entity_impl!(Op, "op");

/// An opaque reference to a value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Value(u32);
entity_impl!(Value, "v");

/// A use of a value: which value, and how the using operation's domain maps to
/// the value's dimensions.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ValueAccess {
    pub value: Value,
    /// From the user's domain to the value's dimensions.
    pub mapping: Mapping,
}

impl ValueAccess {
    pub fn new(value: Value, mapping: Mapping) -> Self {
        Self { value, mapping }
    }
}

/// Shape of one domain dimension: how the enclosing domain's earlier
/// dimensions map into the dimension's own defining domain. Plain ranges have
/// an empty dependency mapping.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DomainShapeDim {
    pub dependency_mapping: Mapping,
}

/// Shape of an operation's iteration domain.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DomainShape {
    pub dims: SmallVec<[DomainShapeDim; 4]>,
}

impl DomainShape {
    /// A hyper-rectangular domain: no dimension depends on another.
    pub fn rectangular(rank: usize) -> Self {
        Self {
            dims: (0..rank)
                .map(|i| DomainShapeDim { dependency_mapping: Mapping::empty(i) })
                .collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OpKind {
    /// An opaque computation over its domain.
    Compute,
    /// A reduction: the first `num_inits` operands carry values across
    /// reduction iterations into the matching results.
    MapReduce { num_inits: usize },
    /// Projects an arbitrary iteration of its operand along projection
    /// dimensions.
    ProjAny,
    /// Projects the last iteration of its operand.
    ProjLast,
    /// `fby(init, value)`: `init` on the first iteration of the sequential
    /// dimensions, the previous `value` afterwards.
    Fby,
    /// Imports an external memory reference as a value. The first operand is
    /// the memref; the first `parallel_domain` domain dimensions are parallel
    /// and the rest address the memref.
    FromMemory { buffer_name: SmallStr, parallel_domain: usize },
    /// Writes a value back to an external memory reference. Operands are the
    /// memref followed by the stored value.
    ToMemory { buffer_name: SmallStr, parallel_domain: usize },
    /// Wraps a scalar into a 0-dimensional value.
    FromScalar,
    /// Defines an iteration dimension. Results are referenced by other
    /// operations' domains.
    Range,
}

impl OpKind {
    /// Compute operations execute code and may carry storage annotations;
    /// everything else only routes values.
    pub fn is_compute(&self) -> bool {
        matches!(self, Self::Compute | Self::MapReduce { .. })
    }
}

/// One operation of a program. Results and uses are maintained by
/// [`Program::append`].
#[derive(Clone, Debug, PartialEq)]
pub struct Operation {
    pub kind: OpKind,
    pub span: SourceSpan,
    /// Values (produced by `Range` operations) defining the iteration domain.
    pub domain: SmallVec<[Value; 4]>,
    pub shape: DomainShape,
    pub operands: SmallVec<[ValueAccess; 2]>,
    pub results: SmallVec<[Value; 2]>,
    pub loop_nest: Option<SmallVec<[Loop; 4]>>,
    /// One entry per result.
    pub storage: SmallVec<[Option<StorageAttr>; 2]>,
}

impl Operation {
    pub fn new(kind: OpKind, span: SourceSpan) -> Self {
        Self {
            kind,
            span,
            domain: SmallVec::new(),
            shape: DomainShape::default(),
            operands: SmallVec::new(),
            results: SmallVec::new(),
            loop_nest: None,
            storage: SmallVec::new(),
        }
    }

    pub fn with_domain(
        mut self,
        domain: impl IntoIterator<Item = Value>,
        shape: DomainShape,
    ) -> Self {
        self.domain = domain.into_iter().collect();
        debug_assert_eq!(self.domain.len(), shape.dims.len());
        self.shape = shape;
        self
    }

    pub fn with_operands(mut self, operands: impl IntoIterator<Item = ValueAccess>) -> Self {
        self.operands = operands.into_iter().collect();
        self
    }

    pub fn with_loop_nest(mut self, loops: impl IntoIterator<Item = Loop>) -> Self {
        self.loop_nest = Some(loops.into_iter().collect());
        self
    }

    pub fn with_storage(
        mut self,
        storage: impl IntoIterator<Item = Option<StorageAttr>>,
    ) -> Self {
        self.storage = storage.into_iter().collect();
        self
    }

    /// The storage annotation of result `index`, if any.
    pub fn storage(&self, index: usize) -> Option<&StorageAttr> {
        self.storage.get(index).and_then(Option::as_ref)
    }

    /// Names of the loops in the loop-nest attribute, outermost first.
    pub fn loop_names(&self) -> SmallVec<[SmallStr; 4]> {
        self.loop_nest
            .as_deref()
            .unwrap_or(&[])
            .iter()
            .map(|l| l.name.clone())
            .collect()
    }
}

/// Definition site of a value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValueDef {
    pub ty: ValueType,
    pub producer: Op,
    /// Result position within the producer.
    pub index: usize,
}

/// An append-only sequence of operations with value definition and use
/// tables.
#[derive(Clone, Debug, Default)]
pub struct Program {
    ops: PrimaryMap<Op, Operation>,
    values: PrimaryMap<Value, ValueDef>,
    uses: FxHashMap<Value, SmallVec<[(Op, usize); 4]>>,
    next_loop_id: u32,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an operation, creating one value per entry of `result_types`.
    /// `op.results` must be empty; it is filled here. The storage attribute
    /// list is padded with `None` to the number of results.
    pub fn append(
        &mut self,
        mut op: Operation,
        result_types: impl IntoIterator<Item = ValueType>,
    ) -> Op {
        debug_assert!(op.results.is_empty());
        let id = self.ops.next_key();
        for (index, ty) in result_types.into_iter().enumerate() {
            let value = self.values.push(ValueDef { ty, producer: id, index });
            op.results.push(value);
        }
        while op.storage.len() < op.results.len() {
            op.storage.push(None);
        }
        for (pos, operand) in op.operands.iter().enumerate() {
            debug_assert!(operand.value.index() < self.values.len());
            self.uses.entry(operand.value).or_default().push((id, pos));
        }
        self.ops.push(op)
    }

    pub fn op(&self, op: Op) -> &Operation {
        &self.ops[op]
    }

    pub fn op_mut(&mut self, op: Op) -> &mut Operation {
        &mut self.ops[op]
    }

    /// Operations in program order.
    pub fn ops(&self) -> impl Iterator<Item = (Op, &Operation)> {
        self.ops.iter()
    }

    pub fn num_ops(&self) -> usize {
        self.ops.len()
    }

    pub fn value(&self, value: Value) -> &ValueDef {
        &self.values[value]
    }

    pub fn values(&self) -> impl Iterator<Item = (Value, &ValueDef)> {
        self.values.iter()
    }

    pub fn producer(&self, value: Value) -> Op {
        self.values[value].producer
    }

    /// Value-operand uses of `value`, as (user, operand position) pairs in
    /// insertion order. Domain references are not uses.
    pub fn users(&self, value: Value) -> &[(Op, usize)] {
        self.uses.get(&value).map(SmallVec::as_slice).unwrap_or(&[])
    }

    /// A loop name not used by any loop-nest attribute in the program.
    pub fn gen_loop_name(&mut self, prefix: &str) -> SmallStr {
        loop {
            let name: SmallStr = format_compact!("{prefix}_{}", self.next_loop_id);
            self.next_loop_id += 1;
            let used = self.ops.values().any(|op| {
                op.loop_nest
                    .as_deref()
                    .unwrap_or(&[])
                    .iter()
                    .any(|l| l.name == name)
            });
            if !used {
                return name;
            }
        }
    }
}

impl core::ops::Index<Op> for Program {
    type Output = Operation;

    fn index(&self, op: Op) -> &Operation {
        &self.ops[op]
    }
}

/// Convenience used by analyses iterating a loop nest: the dimension and step
/// of a loop, if it carries one.
pub fn loop_dimension(l: &Loop) -> Option<(usize, u64)> {
    match l.iter {
        LoopIter::Dimension { dim, step } => Some((dim, step)),
        LoopIter::Rematerialize => None,
    }
}
