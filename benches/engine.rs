//! Benchmarks for SAPTA scoring.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use sapta::prelude::*;

/// Deterministic pseudo-random daily bars
fn generate_window(n: usize) -> PriceWindow {
  let mut bars = Vec::with_capacity(n);
  let mut price = 100.0;

  for i in 0..n {
    let change = ((i * 7 + 13) % 100) as f64 / 50.0 - 1.0; // Deterministic "random"
    let volatility = 2.0 + ((i * 3) % 10) as f64 / 5.0;
    let volume = 1_000_000.0 + ((i * 11) % 17) as f64 * 60_000.0;

    let o = price;
    let c = (price + change).max(1.0);
    let h = o.max(c) + volatility * 0.5;
    let l = (o.min(c) - volatility * 0.5).max(0.5);

    bars.push(Bar::new(o, h, l, c, volume));
    price = c;
  }

  PriceWindow::new(bars)
}

fn engine() -> Engine {
  EngineBuilder::new()
    .with_default_modules()
    .model_slot(Arc::new(ModelSlot::new()))
    .build()
    .unwrap()
}

fn bench_single_module(c: &mut Criterion) {
  let window = generate_window(250);

  let module = BuiltinModule::BbSqueeze(BbSqueezeModule::with_defaults());

  c.bench_function("bb_squeeze_250_bars", |b| {
    b.iter(|| {
      let _ = black_box(module.analyze(black_box(&window)));
    })
  });
}

fn bench_full_analysis(c: &mut Criterion) {
  let window = generate_window(250);
  let engine = engine();

  c.bench_function("analyze_all_modules_250_bars", |b| {
    b.iter(|| {
      let _ = black_box(engine.analyze(black_box("BENCH"), black_box(&window)));
    })
  });
}

fn bench_scaling(c: &mut Criterion) {
  let engine = engine();

  let mut group = c.benchmark_group("scaling");

  for size in [120, 250, 500, 1000, 2500].iter() {
    let window = generate_window(*size);

    group.bench_with_input(BenchmarkId::new("analyze", size), size, |b, _| {
      b.iter(|| {
        let _ = black_box(engine.analyze(black_box("BENCH"), black_box(&window)));
      })
    });
  }

  group.finish();
}

fn bench_parallel_analysis(c: &mut Criterion) {
  let engine = engine();
  let windows: Vec<(String, PriceWindow)> =
    (0..32).map(|i| (format!("SYM{i}"), generate_window(250 + i))).collect();
  let input: Vec<(&str, &PriceWindow)> = windows.iter().map(|(t, w)| (t.as_str(), w)).collect();

  c.bench_function("parallel_analyze_32_tickers", |b| {
    b.iter(|| {
      let _ = black_box(engine.analyze_parallel(black_box(input.clone())));
    })
  });
}

fn bench_feature_extraction(c: &mut Criterion) {
  let engine = engine();
  let result = engine.analyze("BENCH", &generate_window(250)).unwrap();

  c.bench_function("extract_features", |b| {
    b.iter(|| {
      let _ = black_box(engine.feature_extractor().extract(black_box(&result)));
    })
  });
}

criterion_group!(
  benches,
  bench_single_module,
  bench_full_analysis,
  bench_scaling,
  bench_parallel_analysis,
  bench_feature_extraction,
);

criterion_main!(benches);
