// Engine tests — per-family entry points, contexts and buffer residency

use std::sync::Arc;

use kestrel::prelude::*;
use kestrel::{EmulatedRuntime, ErrorKind, RandomGenerator};

fn arange(engine: &Engine, dims: &[usize]) -> Operand {
    let n: usize = dims.iter().product();
    let data: Vec<f32> = (0..n).map(|i| i as f32).collect();
    engine.operand_from_slice(&data, dims).unwrap()
}

#[test]
fn test_reduce_middle_axis() {
    let engine = Engine::default();
    let x = arange(&engine, &[3, 4, 5]);
    let z = engine
        .exec_reduce(&LaunchExtras::default(), ReduceOp::Sum.code(), &x, None, &[1], false)
        .unwrap();
    assert_eq!(z.dims(), &[3, 5]);
    let got = z.to_vec::<f32>().unwrap();
    for i in 0..3 {
        for k in 0..5 {
            assert_eq!(got[i * 5 + k], (80 * i + 4 * k + 30) as f32);
        }
    }
}

#[test]
fn test_reduce_keep_dims() {
    let engine = Engine::default();
    let x = arange(&engine, &[2, 3]);
    let z = engine
        .exec_reduce(&LaunchExtras::default(), ReduceOp::Max.code(), &x, None, &[1], true)
        .unwrap();
    assert_eq!(z.dims(), &[2, 1]);
    assert_eq!(z.to_vec::<f32>().unwrap(), vec![2.0, 5.0]);
}

#[test]
fn test_in_place_matches_fresh_output() {
    let engine = Engine::default();
    let x = engine
        .operand_from_slice(&[-1.5f32, 2.0, -3.0, 4.5], &[2, 2])
        .unwrap();
    let fresh = engine
        .exec_transform(&LaunchExtras::default(), TransformOp::Square.code(), &x, None)
        .unwrap();
    let out = engine
        .exec_transform(&LaunchExtras::in_place(), TransformOp::Square.code(), &x, None)
        .unwrap();
    assert!(out.buffer.same_storage(&x.buffer));
    assert_eq!(x.to_vec::<f32>().unwrap(), fresh.to_vec::<f32>().unwrap());
}

#[test]
fn test_aliasing_needs_in_place_flag() {
    let engine = Engine::default();
    let x = arange(&engine, &[4]);
    let err = engine
        .exec_transform(&LaunchExtras::default(), TransformOp::Neg.code(), &x, Some(&x))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Execution);
    assert_eq!(engine.last_error_code(), ErrorKind::Execution.code());
    // untouched
    assert_eq!(x.to_vec::<f32>().unwrap(), vec![0.0, 1.0, 2.0, 3.0]);
}

#[test]
fn test_pairwise_shape_mismatch() {
    let engine = Engine::default();
    let a = arange(&engine, &[3]);
    let b = arange(&engine, &[4]);
    let err = engine
        .exec_pairwise(&LaunchExtras::default(), BinaryOp::Add.code(), &a, &b, None)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Shape);
    assert!(!engine.last_error_message().is_empty());
    engine.clear_last_error();
    assert_eq!(engine.last_error_code(), 0);
}

#[test]
fn test_unknown_op_code() {
    let engine = Engine::default();
    let x = arange(&engine, &[2]);
    let err = engine
        .exec_transform(&LaunchExtras::default(), 999, &x, None)
        .unwrap_err();
    assert!(matches!(err, Error::UnknownOp { code: 999, .. }));
}

#[test]
fn test_broadcast_row_vector() {
    let engine = Engine::default();
    let x = arange(&engine, &[2, 3]);
    let y = engine.operand_from_slice(&[10.0f32, 20.0, 30.0], &[3]).unwrap();
    let z = engine
        .exec_broadcast(&LaunchExtras::default(), BinaryOp::Add.code(), &x, &y, None, &[1])
        .unwrap();
    assert_eq!(
        z.to_vec::<f32>().unwrap(),
        vec![10.0, 21.0, 32.0, 13.0, 24.0, 35.0]
    );
}

#[test]
fn test_scalar_along_dimension_per_row() {
    let engine = Engine::default();
    let x = arange(&engine, &[2, 2]);
    let s = engine.operand_from_slice(&[2.0f32, 3.0], &[2]).unwrap();
    let z = engine
        .exec_scalar_along_dimension(
            &LaunchExtras::default(),
            BinaryOp::Mul.code(),
            &x,
            &s,
            None,
            &[1],
        )
        .unwrap();
    assert_eq!(z.to_vec::<f32>().unwrap(), vec![0.0, 2.0, 6.0, 9.0]);
}

#[test]
fn test_index_reduce_and_reduce3() {
    let engine = Engine::default();
    let x = engine
        .operand_from_slice(&[1.0f64, 7.0, 3.0, 9.0, 2.0, 4.0], &[2, 3])
        .unwrap();
    let idx = engine
        .exec_index_reduce(&LaunchExtras::default(), IndexReduceOp::IndexMax.code(), &x, None, &[1])
        .unwrap();
    assert_eq!(idx.dtype(), DType::I64);
    assert_eq!(idx.to_vec::<i64>().unwrap(), vec![1, 0]);

    let dot = engine
        .exec_reduce3(&LaunchExtras::default(), Reduce3Op::Dot.code(), &x, &x, None, &[])
        .unwrap();
    assert_eq!(dot.to_f64_vec().unwrap(), vec![160.0]);
}

#[test]
fn test_summary_stats_bias() {
    let engine = Engine::default();
    let x = engine
        .operand_from_slice(&[2.0f64, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0], &[8])
        .unwrap();
    let pop = engine
        .exec_summary_stats(
            &LaunchExtras::default(),
            SummaryStatsOp::Variance.code(),
            &x,
            None,
            &[],
            false,
        )
        .unwrap();
    assert_eq!(pop.to_f64_vec().unwrap(), vec![4.0]);
    let sd = engine
        .exec_summary_stats(
            &LaunchExtras::default(),
            SummaryStatsOp::StandardDeviation.code(),
            &x,
            None,
            &[],
            true,
        )
        .unwrap();
    let want = (32.0f64 / 7.0).sqrt();
    assert!((sd.to_f64_vec().unwrap()[0] - want).abs() < 1e-12);
}

#[test]
fn test_random_is_reproducible() {
    let engine = Engine::default();
    let a = engine.allocate_operand(&[16], DType::F32).unwrap();
    let b = engine.allocate_operand(&[16], DType::F32).unwrap();
    let mut rng_a = RandomGenerator::new(42, 7);
    let mut rng_b = RandomGenerator::new(42, 7);
    let extras = LaunchExtras::default();
    let code = RandomOp::Uniform.code();
    engine.exec_random(&extras, code, &mut rng_a, &a, &[-1.0, 1.0]).unwrap();
    engine.exec_random(&extras, code, &mut rng_b, &b, &[-1.0, 1.0]).unwrap();
    let va = a.to_vec::<f32>().unwrap();
    assert_eq!(va, b.to_vec::<f32>().unwrap());
    assert!(va.iter().all(|v| (-1.0..=1.0).contains(v)));

    // the generator moved on, so the next draw differs
    engine.exec_random(&extras, code, &mut rng_a, &a, &[-1.0, 1.0]).unwrap();
    assert_ne!(va, a.to_vec::<f32>().unwrap());
}

#[test]
fn test_context_reuse_after_purge() {
    let engine = Engine::default();
    let mut ctx = engine.context();
    ctx.set_input(0, arange(&engine, &[3]));
    ctx.set_t_args(vec![1.0]);
    ctx.execute(&engine, Op::Scalar(BinaryOp::Add)).unwrap();
    assert_eq!(ctx.output(0).unwrap().to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0]);

    ctx.purge();
    assert!(ctx.output(0).is_none());
    ctx.set_input(0, arange(&engine, &[2]));
    ctx.set_t_args(vec![10.0]);
    ctx.execute(&engine, Op::Scalar(BinaryOp::Mul)).unwrap();
    assert_eq!(ctx.output(0).unwrap().to_vec::<f32>().unwrap(), vec![0.0, 10.0]);
    assert_eq!(engine.stats().dispatches(), 2);
}

#[test]
fn test_stream_keeps_both_sides_current() {
    let engine = Engine::default();
    let stream = engine.create_stream(0).unwrap();
    let x = arange(&engine, &[8]);
    let z = engine
        .exec_scalar(&LaunchExtras::on_stream(stream), BinaryOp::Add.code(), &x, 1.0, None)
        .unwrap();
    assert!(z.buffer.has_secondary());
    assert_eq!(z.to_vec::<f32>().unwrap()[7], 8.0);
    engine.destroy_stream(stream).unwrap();
}

#[test]
fn test_device_residency_is_checked() {
    let runtime = Arc::new(EmulatedRuntime::new(2, 1 << 20));
    let engine = Engine::with_runtime(EngineConfig::default(), runtime);
    let x = arange(&engine, &[4]);
    x.buffer.set_device_id(1).unwrap();
    let bytes: Vec<u8> = [5.0f32, 6.0, 7.0, 8.0]
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect();
    x.buffer.write_secondary(&bytes).unwrap();

    let mut ctx = engine.context();
    ctx.set_device(0);
    ctx.set_input(0, x.clone());
    let err = ctx
        .execute(&engine, Op::Transform(TransformOp::Identity))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Execution);

    // same device is fine, and the data comes back from the device side
    let mut ctx = engine.context();
    ctx.set_device(1);
    ctx.set_input(0, x);
    ctx.execute(&engine, Op::Transform(TransformOp::Identity)).unwrap();
    assert_eq!(
        ctx.output(0).unwrap().to_vec::<f32>().unwrap(),
        vec![5.0, 6.0, 7.0, 8.0]
    );
}

#[test]
fn test_verbose_engine_times_dispatches() {
    let quiet = Engine::default();
    let x = arange(&quiet, &[2, 3]);
    quiet
        .exec_transform(&LaunchExtras::default(), TransformOp::Neg.code(), &x, None)
        .unwrap();
    assert_eq!(quiet.stats().timed_dispatches(), 0);

    let verbose = Engine::new(EngineConfig::default().with_verbose(true));
    let x = arange(&verbose, &[2, 3]);
    verbose
        .exec_transform(&LaunchExtras::default(), TransformOp::Neg.code(), &x, None)
        .unwrap();
    verbose
        .exec_reduce(&LaunchExtras::default(), ReduceOp::Sum.code(), &x, None, &[1], false)
        .unwrap();
    let bad = verbose.exec_reduce(
        &LaunchExtras::default(),
        ReduceOp::Sum.code(),
        &x,
        None,
        &[5],
        false,
    );
    assert!(bad.is_err());
    assert_eq!(verbose.stats().timed_dispatches(), 2);
    assert_eq!(verbose.stats().dispatches(), 3);
}

#[test]
fn test_copy_and_identity_keep_wide_integers() {
    let engine = Engine::default();
    let wide = (1i64 << 53) + 1;
    let x = engine.operand_from_slice(&[0i64, 0], &[2]).unwrap();
    let y = engine.operand_from_slice(&[wide, -wide], &[2]).unwrap();
    let z = engine
        .exec_pairwise(&LaunchExtras::default(), BinaryOp::Copy.code(), &x, &y, None)
        .unwrap();
    assert_eq!(z.to_vec::<i64>().unwrap(), vec![wide, -wide]);

    let t = engine
        .exec_transform(&LaunchExtras::default(), TransformOp::Identity.code(), &y, None)
        .unwrap();
    assert_eq!(t.to_vec::<i64>().unwrap(), vec![wide, -wide]);
}

#[test]
fn test_device_info_reports_runtime() {
    let runtime = Arc::new(EmulatedRuntime::new(2, 4096).with_compute_capability(7, 5));
    let engine = Engine::with_runtime(EngineConfig::default(), runtime);
    let info = engine.device_info(1).unwrap();
    assert_eq!(info.ordinal, 1);
    assert_eq!((info.compute_major, info.compute_minor), (7, 5));
    assert_eq!(info.total_memory, 4096);
    assert_eq!(engine.device_info(2).unwrap_err().kind(), ErrorKind::Device);
}

#[test]
fn test_bool_input_refused_for_arithmetic() {
    let engine = Engine::default();
    let x = arange(&engine, &[3]);
    let mask = engine
        .exec_scalar(&LaunchExtras::default(), BinaryOp::GreaterThan.code(), &x, 0.5, None)
        .unwrap();
    assert_eq!(mask.dtype(), DType::Bool);
    let err = engine
        .exec_transform(&LaunchExtras::default(), TransformOp::Exp.code(), &mask, None)
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedDType { .. }));
}
