//! Integration tests for building, caching and executing programs
//!
//! These tests build real graphs across the accelerator, GPU-kernel and
//! host-kernel backends, rebuild them from the produced cache, and compare
//! the results byte for byte.

use std::sync::Arc;

use tessera_backends::{PrecisionMode, ReferenceAccelerator};
use tessera_core::{
    Argument, BackendKind, Cache, Context, Error, ErrorCategory, HostBuffer, Program, ProgramConfig, TensorIndex,
};
use tessera_ir::{Graph, OperandType, OperationType, ShapeRange, DYNAMIC_DIM};

fn context(config: ProgramConfig, accelerator: &Arc<ReferenceAccelerator>) -> Arc<Context> {
    Arc::new(Context::new(config).with_accelerator(accelerator.clone()))
}

fn config(gpu: &[OperationType], host: &[OperationType]) -> ProgramConfig {
    ProgramConfig {
        gpu_operations: gpu.to_vec(),
        host_operations: host.to_vec(),
        ..ProgramConfig::default()
    }
}

fn run(program: &mut Program, dims: &[i32], values: &[f32]) -> tessera_core::Result<HostBuffer> {
    let mut input = HostBuffer::from_f32(dims, values);
    let mut output = HostBuffer::output();
    program.execute(&mut [Argument::new(0, &mut input)], &mut [Argument::new(0, &mut output)])?;
    Ok(output)
}

/// x ─► ABS(host) ─► t0 ─► ADD c(accelerator) ─► t1 ─► TANH(gpu) ─► y
fn three_backend_graph() -> tessera_core::Result<Arc<Graph>> {
    let mut graph = Graph::new();
    let x = graph.add_input(OperandType::float32([4]));
    let c = graph.add_f32_constant([4], &[0.5, -0.5, 1.0, -1.0])?;
    let t0 = graph.add_operand(OperandType::float32([4]));
    let t1 = graph.add_operand(OperandType::float32([4]));
    let y = graph.add_operand(OperandType::float32([4]));
    graph.add_operation(OperationType::Abs, [x], [t0])?;
    graph.add_operation(OperationType::Add, [t0, c], [t1])?;
    graph.add_operation(OperationType::Tanh, [t1], [y])?;
    graph.mark_output(y)?;
    Ok(Arc::new(graph))
}

/// x ─► RELU(accelerator) ─► t ─► NEG(host) ─► y, every shape in [1,1]..[1,5]
fn dynamic_graph() -> tessera_core::Result<Arc<Graph>> {
    let ty = OperandType::float32([1, 3]).with_range(ShapeRange::new(vec![1, 3], vec![1, 1], vec![1, 5])?);
    let mut graph = Graph::new();
    let x = graph.add_input(ty.clone());
    let t = graph.add_operand(ty.clone());
    let y = graph.add_operand(ty);
    graph.add_operation(OperationType::Relu, [x], [t])?;
    graph.add_operation(OperationType::Neg, [t], [y])?;
    graph.mark_output(y)?;
    Ok(Arc::new(graph))
}

#[test]
fn test_host_host_accelerator_identity() -> tessera_core::Result<()> {
    let mut graph = Graph::new();
    let x = graph.add_input(OperandType::float32([3]));
    let t0 = graph.add_operand(OperandType::float32([3]));
    let t1 = graph.add_operand(OperandType::float32([3]));
    let y = graph.add_operand(OperandType::float32([3]));
    graph.add_operation(OperationType::Identity, [x], [t0])?;
    graph.add_operation(OperationType::Identity, [t0], [t1])?;
    graph.add_operation(OperationType::Relu, [t1], [y])?;
    graph.mark_output(y)?;

    let accelerator = Arc::new(ReferenceAccelerator::new());
    let mut program = Program::new(context(config(&[], &[OperationType::Identity]), &accelerator));
    program.build(&Arc::new(graph), &mut Cache::new())?;

    let sub_models = program.sub_models();
    assert_eq!(sub_models.len(), 2);
    assert_eq!(sub_models[0].backend, BackendKind::HostKernels);
    assert_eq!(sub_models[1].backend, BackendKind::Accelerator);
    assert_eq!(sub_models[0].outputs, vec![TensorIndex::Internal(0)]);
    assert_eq!(sub_models[1].inputs, vec![TensorIndex::Internal(0)]);

    let output = run(&mut program, &[3], &[0.0, 1.5, 42.0])?;
    assert_eq!(output.dims(), &[3]);
    assert_eq!(output.to_f32_vec()?, vec![0.0, 1.5, 42.0]);
    Ok(())
}

#[test]
fn test_static_rebuild_from_cache_is_byte_identical() -> tessera_core::Result<()> {
    let graph = three_backend_graph()?;
    let accelerator = Arc::new(ReferenceAccelerator::new());
    let config = config(&[OperationType::Tanh], &[OperationType::Abs]);

    let mut cache = Cache::new();
    let mut fresh = Program::new(context(config.clone(), &accelerator));
    fresh.build(&graph, &mut cache)?;
    assert_eq!(fresh.sub_models().len(), 3);
    assert!(!cache.is_empty());
    assert_eq!(accelerator.builds(), 1);

    let mut cached = Program::new(context(config, &accelerator));
    cached.build(&graph, &mut cache)?;
    assert_eq!(accelerator.builds(), 1);
    assert!(cached.sub_models().iter().all(|sub_model| sub_model.from_cache));
    for (a, b) in fresh.sub_models().iter().zip(cached.sub_models()) {
        assert_eq!(a.backend, b.backend);
        assert_eq!(a.inputs, b.inputs);
        assert_eq!(a.outputs, b.outputs);
    }

    let values = [-2.0, -0.25, 0.0, 3.0];
    let expected = run(&mut fresh, &[4], &values)?;
    let actual = run(&mut cached, &[4], &values)?;
    assert_eq!(expected.as_bytes(), actual.as_bytes());

    let reference: Vec<f32> = values
        .iter()
        .zip([0.5f32, -0.5, 1.0, -1.0])
        .map(|(v, c): (&f32, f32)| (v.abs() + c).tanh())
        .collect();
    for (got, want) in actual.to_f32_vec()?.iter().zip(&reference) {
        assert!((got - want).abs() < 1e-6, "{got} != {want}");
    }
    Ok(())
}

#[test]
fn test_dynamic_rebuild_from_cache_is_byte_identical() -> tessera_core::Result<()> {
    let graph = dynamic_graph()?;
    let accelerator = Arc::new(ReferenceAccelerator::new());
    let config = config(&[], &[OperationType::Neg]);

    let mut cache = Cache::new();
    let mut fresh = Program::new(context(config.clone(), &accelerator));
    fresh.build(&graph, &mut cache)?;
    let mut cached = Program::new(context(config, &accelerator));
    cached.build(&graph, &mut cache)?;
    assert_eq!(accelerator.builds(), 1);

    for width in [1, 5, 3] {
        let values: Vec<f32> = (0..width).map(|i| i as f32 - 2.0).collect();
        let expected = run(&mut fresh, &[1, width], &values)?;
        let actual = run(&mut cached, &[1, width], &values)?;
        assert_eq!(actual.dims(), &[1, width]);
        assert_eq!(expected.as_bytes(), actual.as_bytes());

        let reference: Vec<f32> = values.iter().map(|v| -v.max(0.0)).collect();
        assert_eq!(actual.to_f32_vec()?, reference);
    }
    Ok(())
}

#[test]
fn test_shapes_outside_the_declared_range_are_rejected() -> tessera_core::Result<()> {
    let accelerator = Arc::new(ReferenceAccelerator::new());
    let mut program = Program::new(context(config(&[], &[OperationType::Neg]), &accelerator));
    program.build(&dynamic_graph()?, &mut Cache::new())?;

    assert!(run(&mut program, &[1, 3], &[1.0, 2.0, 3.0]).is_ok());

    let err = run(&mut program, &[1, 6], &[0.0; 6]).unwrap_err();
    assert!(matches!(err, Error::InvalidDimensions(_)));
    assert_eq!(err.category(), ErrorCategory::Request);

    let err = run(&mut program, &[1, 3, 3], &[0.0; 9]).unwrap_err();
    assert!(matches!(err, Error::InvalidDimensions(_)));

    let err = run(&mut program, &[1, DYNAMIC_DIM], &[]).unwrap_err();
    assert!(matches!(err, Error::InvalidDimensions(_)));
    assert_eq!(err.category(), ErrorCategory::Request);

    // A rejected request leaves the program usable.
    assert!(program.is_built());
    assert_eq!(run(&mut program, &[1, 2], &[4.0, -4.0])?.to_f32_vec()?, vec![-4.0, 0.0]);
    Ok(())
}

#[test]
fn test_int8_with_dynamic_input_fails_the_build() -> tessera_core::Result<()> {
    let accelerator = Arc::new(ReferenceAccelerator::new());
    let config = ProgramConfig {
        precision: PrecisionMode::Int8,
        calibration_table_path: Some("calibration.table".into()),
        ..config(&[], &[OperationType::Neg])
    };
    let mut program = Program::new(context(config, &accelerator));
    let mut cache = Cache::new();

    let err = program.build(&dynamic_graph()?, &mut cache).unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)));
    assert_eq!(err.category(), ErrorCategory::Fatal);
    assert!(!program.is_built());
    assert!(cache.is_empty());
    assert_eq!(accelerator.builds(), 0);
    Ok(())
}

#[test]
fn test_corrupt_cache_leaves_program_cleared() -> tessera_core::Result<()> {
    let graph = three_backend_graph()?;
    let accelerator = Arc::new(ReferenceAccelerator::new());
    let config = config(&[OperationType::Tanh], &[OperationType::Abs]);

    let mut cache = Cache::new();
    Program::new(context(config.clone(), &accelerator)).build(&graph, &mut cache)?;
    cache.buffer.push(0xff);

    let mut program = Program::new(context(config, &accelerator));
    let err = program.build(&graph, &mut cache).unwrap_err();
    assert!(matches!(err, Error::CorruptCache(_)));
    assert!(!program.is_built());
    assert!(program.sub_models().is_empty());

    let err = run(&mut program, &[4], &[0.0; 4]).unwrap_err();
    assert!(matches!(err, Error::NotBuilt));
    Ok(())
}

#[test]
fn test_cache_file_round_trip_builds_without_compiling() -> tessera_core::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("three_backend.cache");
    let graph = three_backend_graph()?;
    let accelerator = Arc::new(ReferenceAccelerator::new());
    let config = config(&[OperationType::Tanh], &[OperationType::Abs]);

    let mut cache = Cache::new();
    Program::new(context(config.clone(), &accelerator)).build(&graph, &mut cache)?;
    cache.write_to_file(&path)?;

    let mut restored = Cache::read_from_file(&path)?;
    assert_eq!(restored, cache);
    let mut program = Program::new(context(config, &accelerator));
    program.build(&graph, &mut restored)?;
    assert_eq!(accelerator.builds(), 1);
    assert_eq!(program.input_types(), &[OperandType::float32([4])]);
    Ok(())
}

#[test]
fn test_undersized_output_buffer_is_rejected() -> tessera_core::Result<()> {
    let accelerator = Arc::new(ReferenceAccelerator::new());
    let mut program = Program::new(context(config(&[], &[]), &accelerator));
    program.build(&three_backend_graph()?, &mut Cache::new())?;
    assert_eq!(program.sub_models().len(), 1);
    assert!(!program.sub_models()[0].owns_subgraph);

    let mut input = HostBuffer::from_f32([4], &[1.0, 2.0, 3.0, 4.0]);
    let mut output = HostBuffer::output_with_capacity(8);
    let err = program
        .execute(&mut [Argument::new(0, &mut input)], &mut [Argument::new(0, &mut output)])
        .unwrap_err();
    assert!(matches!(err, Error::ArgumentTooSmall { required: 16, actual: 8 }));
    Ok(())
}

#[test]
fn test_int8_build_calibrates_from_dataset() -> tessera_core::Result<()> {
    let dir = tempfile::tempdir()?;
    let dataset = dir.path().join("samples.txt");
    let table = dir.path().join("calibration.table");
    std::fs::write(&dataset, "# x0 x1 x2\n-1.0 2.0 0.5\n3.0 -0.5 1.0\n")?;

    let mut graph = Graph::new();
    let x = graph.add_input(OperandType::float32([3]));
    let y = graph.add_operand(OperandType::float32([3]));
    graph.add_operation(OperationType::Relu, [x], [y])?;
    graph.mark_output(y)?;

    let accelerator = Arc::new(ReferenceAccelerator::new());
    let config = ProgramConfig {
        precision: PrecisionMode::Int8,
        calibration_dataset_path: Some(dataset),
        calibration_table_path: Some(table.clone()),
        ..ProgramConfig::default()
    };
    let mut program = Program::new(context(config, &accelerator));
    program.build(&Arc::new(graph), &mut Cache::new())?;
    assert!(table.exists());

    let output = run(&mut program, &[3], &[-2.0, 1.0, 3.0])?.to_f32_vec()?;
    for (got, want) in output.iter().zip([0.0f32, 1.0, 3.0]) {
        assert!((got - want).abs() < 0.05, "{got} != {want}");
    }
    Ok(())
}

#[test]
fn test_dead_accelerator_operation_still_builds() -> tessera_core::Result<()> {
    // x ─► IDENTITY(host) ─► y (output)
    // x ─► RELU(accelerator) ─► z (never read)
    let mut graph = Graph::new();
    let x = graph.add_input(OperandType::float32([2]));
    let y = graph.add_operand(OperandType::float32([2]));
    let z = graph.add_operand(OperandType::float32([2]));
    graph.add_operation(OperationType::Identity, [x], [y])?;
    graph.add_operation(OperationType::Relu, [x], [z])?;
    graph.mark_output(y)?;

    let accelerator = Arc::new(ReferenceAccelerator::new());
    let mut program = Program::new(context(config(&[], &[OperationType::Identity]), &accelerator));
    let mut cache = Cache::new();
    program.build(&Arc::new(graph), &mut cache)?;

    assert_eq!(program.sub_models().len(), 2);
    assert_eq!(program.sub_models()[1].backend, BackendKind::Accelerator);
    assert_eq!(program.sub_models()[1].outputs, vec![TensorIndex::Internal(0)]);
    assert_eq!(accelerator.builds(), 1);
    assert_eq!(run(&mut program, &[2], &[-3.0, 4.0])?.to_f32_vec()?, vec![-3.0, 4.0]);
    Ok(())
}

#[test]
fn test_rebuild_releases_the_previous_build() -> tessera_core::Result<()> {
    let accelerator = Arc::new(ReferenceAccelerator::new());
    let mut program = Program::new(context(config(&[OperationType::Tanh], &[OperationType::Abs]), &accelerator));

    let mut partitioned = Cache::new();
    program.build(&three_backend_graph()?, &mut partitioned)?;
    assert_eq!(program.sub_models().len(), 3);
    assert_eq!(program.owned_sub_graphs(), 3);

    // x ─► RELU(accelerator) ─► y, one run sharing the caller's graph
    let mut graph = Graph::new();
    let x = graph.add_input(OperandType::float32([4]));
    let y = graph.add_operand(OperandType::float32([4]));
    graph.add_operation(OperationType::Relu, [x], [y])?;
    graph.mark_output(y)?;
    program.build(&Arc::new(graph), &mut Cache::new())?;

    assert_eq!(program.sub_models().len(), 1);
    assert!(!program.sub_models()[0].owns_subgraph);
    assert_eq!(program.owned_sub_graphs(), 0);
    assert_eq!(accelerator.builds(), 2);
    assert_eq!(
        run(&mut program, &[4], &[-2.0, -0.25, 0.0, 3.0])?.to_f32_vec()?,
        vec![0.0, 0.0, 0.0, 3.0]
    );

    program.build(&three_backend_graph()?, &mut partitioned)?;
    assert_eq!(program.sub_models().len(), 3);
    assert!(program.sub_models().iter().all(|sub_model| sub_model.from_cache));
    assert_eq!(program.owned_sub_graphs(), 3);
    assert_eq!(accelerator.builds(), 2);
    assert_eq!(run(&mut program, &[4], &[-2.0, -0.25, 0.0, 3.0])?.dims(), &[4]);
    Ok(())
}
