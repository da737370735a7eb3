//! End-to-end storage assignment and verification tests.

use std::collections::BTreeMap;

use pretty_assertions::assert_eq;
use weavec_ir::{
    DomainShape, Loop, Mapping, MappingExpr, MemorySpace, NamedMapping, OpKind, Operation,
    Program, ScalarType, SmallStr, SourceSpan, StorageAttr, Value, ValueAccess, ValueType,
};
use weavec_ir_analysis::{
    Buffer, IterationSpaceAnalysis, LoopFusionAnalysis, Report, StandardPassThrough,
    StorageAnalysis, ValueStorage, verify_storage,
};

fn span() -> SourceSpan {
    SourceSpan::from(0..0)
}

fn range(program: &mut Program) -> Value {
    let op = program.append(
        Operation::new(OpKind::Range, span()),
        [ValueType::scalar(ScalarType::Index)],
    );
    program.op(op).results[0]
}

fn named_identity(names: &[&str]) -> NamedMapping {
    NamedMapping::identity(names.iter().map(|n| SmallStr::from(*n)))
}

fn analyze(program: &Program) -> Result<StorageAnalysis, Report> {
    let fusion = LoopFusionAnalysis::compute(program)?;
    let spaces = IterationSpaceAnalysis::compute(program);
    StorageAnalysis::create(program, &fusion, &spaces, &StandardPassThrough)
}

fn verify(program: &Program) -> Result<StorageAnalysis, Report> {
    let fusion = LoopFusionAnalysis::compute(program)?;
    let spaces = IterationSpaceAnalysis::compute(program);
    verify_storage(program, &fusion, &spaces, &StandardPassThrough)
}

#[test]
fn buffer_unified_across_two_writers() {
    let mut program = Program::new();
    let d = range(&mut program);
    let w1 = program.append(
        Operation::new(OpKind::Compute, span())
            .with_domain([d], DomainShape::rectangular(1))
            .with_loop_nest([Loop::new("i", 0)])
            .with_storage([Some(StorageAttr::memory("b", named_identity(&["i"])))]),
        [ValueType::new(ScalarType::F32, 1)],
    );
    let w2 = program.append(
        Operation::new(OpKind::Compute, span())
            .with_domain([d], DomainShape::rectangular(1))
            .with_loop_nest([Loop::new("j", 0)])
            .with_storage([Some(StorageAttr::memory("b", named_identity(&["j"])))]),
        [ValueType::new(ScalarType::F32, 1)],
    );

    let analysis = verify(&program).expect("consistent program");
    let buffer = analysis.buffer(&"b".into()).expect("declared");
    assert_eq!(buffer.rank(), Some(1));
    // Both occurrences index the buffer, so its allocation cannot be nested
    // in either loop.
    assert_eq!(buffer.loop_nest(), &[] as &[SmallStr]);
    assert_eq!(buffer.domain().len(), 1);
    assert_eq!(buffer.domain()[0].value, d);
    assert_eq!(buffer.layout(), Some(&Mapping::new(1, [MappingExpr::Dim(0)])));
    assert_eq!(buffer.writes().len(), 2);

    for op in [w1, w2] {
        let storage = analysis.storage(program.op(op).results[0]);
        assert_eq!(storage.space(), Some(MemorySpace::Memory));
        assert_eq!(storage.buffer_name(), Some(&"b".into()));
        assert_eq!(storage.layout(), Some(&Mapping::new(1, [MappingExpr::Dim(0)])));
    }
}

#[test]
fn element_types_must_agree_across_occurrences() {
    let mut program = Program::new();
    let d = range(&mut program);
    for ty in [ScalarType::F32, ScalarType::F64] {
        program.append(
            Operation::new(OpKind::Compute, span())
                .with_domain([d], DomainShape::rectangular(1))
                .with_loop_nest([Loop::new("i", 0)])
                .with_storage([Some(StorageAttr::memory("b", named_identity(&["i"])))]),
            [ValueType::new(ty, 1)],
        );
    }
    let err = analyze(&program).unwrap_err();
    assert!(err.to_string().contains("different element type"));
}

#[test]
fn layout_ranks_must_agree_across_occurrences() {
    let mut program = Program::new();
    let d = range(&mut program);
    program.append(
        Operation::new(OpKind::Compute, span())
            .with_domain([d], DomainShape::rectangular(1))
            .with_loop_nest([Loop::new("i", 0)])
            .with_storage([Some(StorageAttr::memory("b", named_identity(&["i"])))]),
        [ValueType::new(ScalarType::F32, 1)],
    );
    // Same loop, but a rank-2 layout replicating the dimension.
    let replicated = NamedMapping {
        names: ["i".into()].into_iter().collect(),
        mapping: Mapping::new(1, [MappingExpr::Dim(0), MappingExpr::Dim(0)]),
    };
    program.append(
        Operation::new(OpKind::Compute, span())
            .with_domain([d], DomainShape::rectangular(1))
            .with_loop_nest([Loop::new("i", 0)])
            .with_storage([Some(StorageAttr::memory("b", replicated))]),
        [ValueType::new(ScalarType::F32, 1)],
    );
    let err = analyze(&program).unwrap_err();
    assert!(err.to_string().contains("rank"));
}

#[test]
fn created_buffers_grow_dimensions_on_demand() {
    let mut program = Program::new();
    let d = range(&mut program);
    let op = program.append(
        Operation::new(OpKind::Compute, span())
            .with_domain([d], DomainShape::rectangular(1))
            .with_loop_nest([Loop::new("i", 0)]),
        [ValueType::new(ScalarType::F32, 1)],
    );
    let value = program.op(op).results[0];

    let fusion = LoopFusionAnalysis::compute(&program).expect("consistent");
    let spaces = IterationSpaceAnalysis::compute(&program);
    let policy = StandardPassThrough;
    let mut analysis =
        StorageAnalysis::create(&program, &fusion, &spaces, &policy).expect("no annotations");

    let names: Vec<SmallStr> = vec!["i".into()];
    let buffer_name = analysis
        .create_buffer(&program, &fusion, &spaces, &policy, value, &names)
        .expect("fresh buffer");
    assert_eq!(buffer_name, "buffer_0");
    assert_eq!(analysis.storage(value).buffer_name(), Some(&buffer_name));
    assert_eq!(analysis.storage(value).space(), Some(MemorySpace::Memory));
    assert_eq!(analysis.buffer(&buffer_name).expect("created").rank(), None);

    // A 0D layout pins the rank to zero.
    analysis
        .merge_storage(
            &program,
            &fusion,
            &spaces,
            &policy,
            value,
            ValueStorage::new(None, Some(buffer_name.clone()), Some(Mapping::empty(1))),
        )
        .expect("rank-0 layout");
    assert_eq!(analysis.buffer(&buffer_name).expect("created").rank(), Some(0));

    // Growing the buffer to rank 1 extends value layouts with unknowns.
    analysis
        .add_dimensions_to_buffer(
            &program,
            &fusion,
            &spaces,
            &buffer_name,
            op,
            &Mapping::new(1, [MappingExpr::Dim(0)]),
        )
        .expect("extended");
    let buffer = analysis.buffer(&buffer_name).expect("created");
    assert_eq!(buffer.rank(), Some(1));
    assert_eq!(buffer.layout(), Some(&Mapping::new(1, [MappingExpr::Dim(0)])));
    assert_eq!(
        analysis.storage(value).layout(),
        Some(&Mapping::new(1, [MappingExpr::Unknown]))
    );
}

#[test]
fn buffer_cannot_be_written_before_an_indexed_dimension_exists() {
    let mut program = Program::new();
    let d0 = range(&mut program);
    program.append(
        Operation::new(OpKind::Compute, span())
            .with_domain([d0], DomainShape::rectangular(1))
            .with_loop_nest([Loop::new("i", 0)])
            .with_storage([Some(StorageAttr {
                space: MemorySpace::Memory,
                buffer_name: Some("b".into()),
                layout: None,
            })]),
        [ValueType::new(ScalarType::F32, 1)],
    );
    // The dimension indexing the buffer is defined after the first write.
    let d1 = range(&mut program);
    program.append(
        Operation::new(OpKind::Compute, span())
            .with_domain([d0, d1], DomainShape::rectangular(2))
            .with_loop_nest([Loop::new("i", 0), Loop::new("k", 1)])
            .with_storage([Some(StorageAttr::memory("b", named_identity(&["k"])))]),
        [ValueType::new(ScalarType::F32, 1)],
    );
    let err = analyze(&program).unwrap_err();
    assert!(err.to_string().contains("before one of its dimensions"));
}

#[test]
fn in_place_updates_must_preserve_the_layout() {
    let mut program = Program::new();
    let d0 = range(&mut program);
    let d1 = range(&mut program);
    let nest = [Loop::new("i", 0), Loop::new("j", 1)];
    let producer = program.append(
        Operation::new(OpKind::Compute, span())
            .with_domain([d0, d1], DomainShape::rectangular(2))
            .with_loop_nest(nest.clone())
            .with_storage([Some(StorageAttr::memory("b", named_identity(&["i", "j"])))]),
        [ValueType::new(ScalarType::F32, 2)],
    );
    let value = program.op(producer).results[0];
    // Reads the value transposed but stores its result at the untransposed
    // position.
    let transposed = Mapping::new(2, [MappingExpr::Dim(1), MappingExpr::Dim(0)]);
    program.append(
        Operation::new(OpKind::Compute, span())
            .with_domain([d0, d1], DomainShape::rectangular(2))
            .with_loop_nest(nest)
            .with_operands([ValueAccess::new(value, transposed)])
            .with_storage([Some(StorageAttr::memory("b", named_identity(&["i", "j"])))]),
        [ValueType::new(ScalarType::F32, 2)],
    );

    assert!(analyze(&program).is_ok(), "assignment alone is consistent");
    let err = verify(&program).unwrap_err();
    assert!(err.to_string().contains("in-place"));
}

#[test]
fn external_buffers_cannot_be_written_before_their_memref() {
    let mut program = Program::new();
    let d = range(&mut program);
    let writer = program.append(
        Operation::new(OpKind::Compute, span())
            .with_domain([d], DomainShape::rectangular(1))
            .with_loop_nest([Loop::new("lm", 0)]),
        [ValueType::new(ScalarType::F32, 1)],
    );
    let value = program.op(writer).results[0];
    // The memref only becomes available after the write.
    let memref_def = program.append(
        Operation::new(OpKind::Compute, span()),
        [ValueType::scalar(ScalarType::MemRef(Box::new(ScalarType::F32)))],
    );
    let memref = program.op(memref_def).results[0];
    program.append(
        Operation::new(
            OpKind::ToMemory { buffer_name: "ext".into(), parallel_domain: 0 },
            span(),
        )
        .with_domain([d], DomainShape::rectangular(1))
        .with_loop_nest([Loop::new("lm", 0)])
        .with_operands([
            ValueAccess::new(memref, Mapping::empty(1)),
            ValueAccess::new(value, Mapping::identity(1)),
        ]),
        [],
    );
    let err = analyze(&program).unwrap_err();
    assert!(err.to_string().contains("used before it is defined"));
}

#[test]
fn external_buffer_shape_follows_the_memref_domain() {
    let mut program = Program::new();
    let memref_def = program.append(
        Operation::new(OpKind::Compute, span()),
        [ValueType::scalar(ScalarType::MemRef(Box::new(ScalarType::F32)))],
    );
    let memref = program.op(memref_def).results[0];
    let d = range(&mut program);
    let import = program.append(
        Operation::new(
            OpKind::FromMemory { buffer_name: "ext".into(), parallel_domain: 0 },
            span(),
        )
        .with_domain([d], DomainShape::rectangular(1))
        .with_loop_nest([Loop::new("lm", 0)])
        .with_operands([ValueAccess::new(memref, Mapping::empty(1))]),
        [ValueType::new(ScalarType::F32, 1)],
    );

    let analysis = verify(&program).expect("consistent program");
    let buffer = analysis.buffer(&"ext".into()).expect("declared");
    assert!(buffer.is_external());
    assert_eq!(buffer.rank(), Some(1));
    assert_eq!(buffer.loop_nest(), &["lm".to_string()] as &[_]);
    let storage = analysis.storage(program.op(import).results[0]);
    assert_eq!(storage.space(), Some(MemorySpace::Memory));
    assert_eq!(storage.buffer_name(), Some(&"ext".into()));
}

#[test]
fn projection_inherits_the_operand_storage() {
    let mut program = Program::new();
    let d = range(&mut program);
    let producer = program.append(
        Operation::new(OpKind::Compute, span())
            .with_domain([d], DomainShape::rectangular(1))
            .with_loop_nest([Loop::new("i", 0)])
            .with_storage([Some(StorageAttr::memory("b", named_identity(&["i"])))]),
        [ValueType::new(ScalarType::F32, 1)],
    );
    let value = program.op(producer).results[0];
    let proj = program.append(
        Operation::new(OpKind::ProjLast, span())
            .with_domain([d], DomainShape::rectangular(1))
            .with_operands([ValueAccess::new(value, Mapping::identity(1))]),
        [ValueType::scalar(ScalarType::F32)],
    );

    let analysis = verify(&program).expect("consistent program");
    let storage = analysis.storage(program.op(proj).results[0]);
    assert_eq!(storage.buffer_name(), Some(&"b".into()));
    assert_eq!(storage.layout(), Some(&Mapping::new(1, [MappingExpr::Dim(0)])));
}

#[test]
fn fby_operands_cannot_name_different_buffers() {
    let mut program = Program::new();
    let d = range(&mut program);
    let mut annotated = |name: &str| {
        let op = program.append(
            Operation::new(OpKind::Compute, span())
                .with_domain([d], DomainShape::rectangular(1))
                .with_loop_nest([Loop::new("i", 0)])
                .with_storage([Some(StorageAttr::memory(name, named_identity(&["i"])))]),
            [ValueType::new(ScalarType::F32, 1)],
        );
        program.op(op).results[0]
    };
    let init = annotated("a");
    let next = annotated("c");
    program.append(
        Operation::new(OpKind::Fby, span())
            .with_domain([d], DomainShape::rectangular(1))
            .with_operands([
                ValueAccess::new(init, Mapping::identity(1)),
                ValueAccess::new(next, Mapping::identity(1)),
            ]),
        [ValueType::new(ScalarType::F32, 1)],
    );
    let err = analyze(&program).unwrap_err();
    assert!(err.to_string().contains("conflicting buffer names"));
}

#[test]
fn cross_loop_uses_need_storage_covering_the_value() {
    let mut program = Program::new();
    let d = range(&mut program);
    // Rank-0 buffer: each iteration overwrites the previous one.
    let zero_d = NamedMapping { names: Default::default(), mapping: Mapping::empty(0) };
    let producer = program.append(
        Operation::new(OpKind::Compute, span())
            .with_domain([d], DomainShape::rectangular(1))
            .with_loop_nest([Loop::new("i", 0)])
            .with_storage([Some(StorageAttr::memory("b", zero_d))]),
        [ValueType::new(ScalarType::F32, 1)],
    );
    let value = program.op(producer).results[0];
    // The user runs in a separate loop over the same dimension, so the whole
    // value must survive the producer loop.
    program.append(
        Operation::new(OpKind::Compute, span())
            .with_domain([d], DomainShape::rectangular(1))
            .with_loop_nest([Loop::new("j", 0)])
            .with_operands([ValueAccess::new(value, Mapping::identity(1))]),
        [],
    );

    assert!(analyze(&program).is_ok(), "assignment alone is consistent");
    let err = verify(&program).unwrap_err();
    assert!(err.to_string().contains("cover all operand dimensions"));
}

#[test]
fn rank_one_storage_covers_cross_loop_uses() {
    let mut program = Program::new();
    let d = range(&mut program);
    let producer = program.append(
        Operation::new(OpKind::Compute, span())
            .with_domain([d], DomainShape::rectangular(1))
            .with_loop_nest([Loop::new("i", 0)])
            .with_storage([Some(StorageAttr::memory("b", named_identity(&["i"])))]),
        [ValueType::new(ScalarType::F32, 1)],
    );
    let value = program.op(producer).results[0];
    let user = program.append(
        Operation::new(OpKind::Compute, span())
            .with_domain([d], DomainShape::rectangular(1))
            .with_loop_nest([Loop::new("j", 0)])
            .with_operands([ValueAccess::new(value, Mapping::identity(1))]),
        [],
    );

    let analysis = verify(&program).expect("rank-1 buffer suffices");
    let buffer = analysis.buffer(&"b".into()).expect("declared");
    assert_eq!(buffer.rank(), Some(1));
    assert_eq!(buffer.writes(), &[(producer, 0)]);
    assert_eq!(buffer.reads(), &[(user, 0)]);
}

#[test]
fn storage_annotations_are_checked_in_isolation() {
    let mut program = Program::new();
    // A register annotation must not name a buffer.
    program.append(
        Operation::new(OpKind::Compute, span()).with_storage([Some(StorageAttr {
            space: MemorySpace::Register,
            buffer_name: Some("b".into()),
            layout: None,
        })]),
        [ValueType::scalar(ScalarType::F32)],
    );
    let err = analyze(&program).unwrap_err();
    assert!(err.to_string().contains("if and only if"));

    // Index values cannot live in memory.
    let mut program = Program::new();
    let d = range(&mut program);
    program.append(
        Operation::new(OpKind::Compute, span())
            .with_domain([d], DomainShape::rectangular(1))
            .with_loop_nest([Loop::new("i", 0)])
            .with_storage([Some(StorageAttr::memory("b", named_identity(&["i"])))]),
        [ValueType::new(ScalarType::Index, 1)],
    );
    let err = analyze(&program).unwrap_err();
    assert!(err.to_string().contains("cannot be allocated in memory"));

    // Layout names must reference loops of the operation.
    let mut program = Program::new();
    let d = range(&mut program);
    program.append(
        Operation::new(OpKind::Compute, span())
            .with_domain([d], DomainShape::rectangular(1))
            .with_loop_nest([Loop::new("i", 0)])
            .with_storage([Some(StorageAttr::memory("b", named_identity(&["z"])))]),
        [ValueType::new(ScalarType::F32, 1)],
    );
    let err = analyze(&program).unwrap_err();
    assert!(err.to_string().contains("unknown loop name"));
}

#[test]
fn stripe_layouts_fail_when_the_outer_loop_is_trimmed_away() {
    let mut program = Program::new();
    let d = range(&mut program);
    let point_layout = NamedMapping {
        names: ["point".into()].into_iter().collect(),
        mapping: Mapping::identity(1),
    };
    let producer = program.append(
        Operation::new(OpKind::Compute, span())
            .with_domain([d], DomainShape::rectangular(1))
            .with_loop_nest([
                Loop::strip_mined("block", 0, 4),
                Loop::strip_mined("point", 0, 1),
            ])
            .with_storage([Some(StorageAttr::memory("b", point_layout))]),
        [ValueType::new(ScalarType::F32, 1)],
    );
    let value = program.op(producer).results[0];
    // A user outside the `block` loop forces the allocation out of it, but
    // then the block-sized buffer cannot hold the whole dimension.
    program.append(
        Operation::new(OpKind::Compute, span())
            .with_domain([d], DomainShape::rectangular(1))
            .with_loop_nest([Loop::new("j", 0)])
            .with_operands([ValueAccess::new(value, Mapping::identity(1))]),
        [],
    );

    let err = analyze(&program).unwrap_err();
    assert!(err.to_string().contains("cannot be nested in"));
}

#[test]
fn reanalyzing_the_same_program_yields_identical_tables() {
    let mut program = Program::new();
    let d = range(&mut program);
    for (name, loop_name) in [("b", "i"), ("b", "j"), ("c", "i")] {
        program.append(
            Operation::new(OpKind::Compute, span())
                .with_domain([d], DomainShape::rectangular(1))
                .with_loop_nest([Loop::new(loop_name, 0)])
                .with_storage([Some(StorageAttr::memory(name, named_identity(&[loop_name])))]),
            [ValueType::new(ScalarType::F32, 1)],
        );
    }

    let first = verify(&program).expect("consistent program");
    let second = verify(&program).expect("consistent program");
    let buffers = |analysis: &StorageAnalysis| -> BTreeMap<SmallStr, Buffer> {
        analysis.buffers().map(|(name, buffer)| (name.clone(), buffer.clone())).collect()
    };
    assert_eq!(buffers(&first), buffers(&second));
    for (value, _) in program.values() {
        assert_eq!(first.storage(value), second.storage(value));
    }
}

#[test]
fn strip_mined_layouts_keep_the_outer_loop_in_the_nest() {
    let mut program = Program::new();
    let d = range(&mut program);
    // `block` carves d into chunks of 4; the layout stores one chunk at a
    // time, indexed by the inner `point` counter.
    let point_layout = NamedMapping {
        names: ["point".into()].into_iter().collect(),
        mapping: Mapping::identity(1),
    };
    let producer = program.append(
        Operation::new(OpKind::Compute, span())
            .with_domain([d], DomainShape::rectangular(1))
            .with_loop_nest([
                Loop::strip_mined("block", 0, 4),
                Loop::strip_mined("point", 0, 1),
            ])
            .with_storage([Some(StorageAttr::memory("b", point_layout))]),
        [ValueType::new(ScalarType::F32, 1)],
    );

    let analysis = verify(&program).expect("consistent program");
    let buffer = analysis.buffer(&"b".into()).expect("declared");
    assert_eq!(buffer.rank(), Some(1));
    // The inner stripe level only addresses points within one block, so the
    // allocation must stay inside the `block` loop.
    assert_eq!(buffer.loop_nest(), &["block".to_string()] as &[_]);
    let storage = analysis.storage(program.op(producer).results[0]);
    assert_eq!(storage.buffer_name(), Some(&"b".into()));
}
