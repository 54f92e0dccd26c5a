use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use mindtrain::{DType, GraphBuilder, GraphStore, OpKind, Phase, SessionConfig, ShapeDim, TrainSession};

/// Two-layer perceptron with a train-only MSE head.
fn mlp(width: usize) -> GraphStore {
    let mut b = GraphBuilder::new();
    let x = b.input("x", DType::F32, vec![ShapeDim::Dynamic, ShapeDim::Known(width)]);
    let t = b.input("t", DType::F32, vec![ShapeDim::Dynamic, ShapeDim::Known(1)]);
    let w1 = b.weight("w1", vec![width, width], vec![0.01; width * width]);
    let b1 = b.weight("b1", vec![width], vec![0.0; width]);
    let w2 = b.weight("w2", vec![width, 1], vec![0.01; width]);
    let h = b.node("fc1", OpKind::Linear { bias: true }, &[x, w1, b1], Phase::Always);
    let a = b.node("act", OpKind::Relu, &[h], Phase::Always);
    let d = b.node("drop", OpKind::Dropout { ratio: 0.1 }, &[a], Phase::Always);
    let y = b.node("fc2", OpKind::MatMul, &[d, w2], Phase::Always);
    let l = b.node("mse", OpKind::MseLoss, &[y, t], Phase::TrainOnly);
    b.output(y).output(l).loss(l);
    b.build().unwrap()
}

fn session(width: usize, batch: usize, threads: usize) -> TrainSession {
    let mut s = TrainSession::from_graph(mlp(width), SessionConfig::default().with_threads(threads)).unwrap();
    let inputs = s.get_inputs();
    s.resize(&inputs, &[vec![batch, width], vec![batch, 1]]).unwrap();
    let xs: Vec<f32> = (0..batch * width).map(|i| (i % 7) as f32 * 0.1).collect();
    s.write_f32(inputs[0], &xs).unwrap();
    s.write_f32(inputs[1], &vec![1.0; batch]).unwrap();
    s
}

fn bench_eval(c: &mut Criterion) {
    let mut group = c.benchmark_group("eval");
    for &(width, batch) in &[(16, 8), (64, 32), (256, 64)] {
        let mut s = session(width, batch, 1);
        group.bench_with_input(
            BenchmarkId::new("mlp", format!("{width}x{batch}")),
            &(),
            |b, _| b.iter(|| black_box(s.run_graph().unwrap())),
        );
    }
    group.finish();
}

fn bench_train_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("train_step");
    for &threads in &[1, 4] {
        let mut s = session(256, 64, threads);
        s.train();
        group.bench_with_input(BenchmarkId::new("threads", threads), &(), |b, _| {
            b.iter(|| black_box(s.run_graph().unwrap()))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_eval, bench_train_step);
criterion_main!(benches);
