//! Optimizer benchmarks: window extraction, cold solve, and cached solve.

use criterion::{BatchSize, BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use folio::{OptimizationRequest, Optimizer, PriceHistory, PricePoint, Symbol};

/// Fill a history with `n_bars` 5-minute bars for `n_assets` assets.
///
/// Prices start at 100 and drift using a simple deterministic RNG.
fn generate_history(n_bars: usize, n_assets: usize) -> (PriceHistory, Vec<Symbol>) {
    let symbols: Vec<Symbol> = (0..n_assets)
        .map(|i| Symbol::new(&format!("A{i:03}")))
        .collect();
    let mut history = PriceHistory::new(n_bars);
    let mut prices = vec![100.0f64; n_assets];

    // xorshift32
    let mut rng_state: u32 = 42;

    for bar in 0..n_bars {
        let ts = bar as i64 * 300_000;
        for (sym, price) in symbols.iter().zip(prices.iter_mut()) {
            rng_state ^= rng_state << 13;
            rng_state ^= rng_state >> 17;
            rng_state ^= rng_state << 5;

            // -1% to +1%, slight upward drift
            let ret = (rng_state % 201) as f64 / 10_000.0 - 0.0098;
            *price *= 1.0 + ret;
            history.append(PricePoint::new(ts, *sym, *price).unwrap());
        }
    }

    (history, symbols)
}

fn bench_window(c: &mut Criterion) {
    let mut group = c.benchmark_group("optimizer/window");
    let (history, symbols) = generate_history(2_880, 8);

    for periods in [100, 1_000, 2_880] {
        group.bench_with_input(BenchmarkId::from_parameter(periods), &periods, |b, &p| {
            b.iter(|| black_box(history.window(&symbols, p).unwrap()));
        });
    }

    group.finish();
}

fn bench_cold_solve(c: &mut Criterion) {
    let mut group = c.benchmark_group("optimizer/cold");
    let req = OptimizationRequest::max_sharpe(0.02);

    for n_assets in [2, 4, 8, 16] {
        let (history, symbols) = generate_history(500, n_assets);
        let window = history.window(&symbols, 500).unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(n_assets), &window, |b, w| {
            b.iter_batched(
                Optimizer::new,
                |mut opt| black_box(opt.optimize(w, &req)),
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_cached_solve(c: &mut Criterion) {
    let mut group = c.benchmark_group("optimizer/cached");
    let req = OptimizationRequest::max_sharpe(0.02);
    let (history, symbols) = generate_history(500, 8);
    let window = history.window(&symbols, 500).unwrap();

    let mut opt = Optimizer::new();
    let _ = opt.optimize(&window, &req);

    group.bench_function("8_assets", |b| {
        b.iter(|| black_box(opt.optimize(&window, &req)));
    });

    group.finish();
}

criterion_group!(benches, bench_window, bench_cold_solve, bench_cached_solve);
criterion_main!(benches);
