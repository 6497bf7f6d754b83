//! Benchmark: sgemm vs a naive triple loop, plus the transposed-operand path.

use std::time::Instant;

use tessera_kernels::{sgemm, SimdCapability};

fn naive(a: &[f32], b: &[f32], c: &mut [f32], m: usize, n: usize, k: usize) {
    for i in 0..m {
        for j in 0..n {
            let mut acc = 0.0f32;
            for p in 0..k {
                acc += a[i * k + p] * b[p * n + j];
            }
            c[i * n + j] = acc;
        }
    }
}

fn gflops(m: usize, n: usize, k: usize, secs: f64) -> f64 {
    (2.0 * m as f64 * n as f64 * k as f64) / secs / 1e9
}

fn main() {
    let simd = SimdCapability::detect();
    println!("=== Tessera sgemm Benchmark ===");
    println!("SIMD: {}\n", simd);

    let sizes: &[(usize, usize, usize)] = &[
        (64, 64, 64),
        (128, 128, 128),
        (256, 256, 256),
        (512, 512, 512),
    ];

    println!("{:<12} {:>12} {:>12} {:>10} {:>14} {:>10}",
        "Size", "Naive (ms)", "Tiled (ms)", "Speedup", "Trans-B (ms)", "GF/s");
    println!("{}", "-".repeat(74));

    for &(m, n, k) in sizes {
        let a: Vec<f32> = (0..m * k).map(|i| ((i * 7 + 3) % 13) as f32 * 0.1 - 0.6).collect();
        let b: Vec<f32> = (0..k * n).map(|i| ((i * 11 + 5) % 17) as f32 * 0.1 - 0.8).collect();
        let mut c = vec![0.0f32; m * n];

        let iters = if m <= 128 { 200 } else if m <= 256 { 20 } else { 5 };

        let start = Instant::now();
        for _ in 0..iters {
            naive(&a, &b, &mut c, m, n, k);
        }
        let naive_s = start.elapsed().as_secs_f64() / iters as f64;

        let start = Instant::now();
        for _ in 0..iters {
            sgemm(false, false, m, n, k, 1.0, &a, &b, 0.0, &mut c).unwrap();
        }
        let sgemm_s = start.elapsed().as_secs_f64() / iters as f64;

        let start = Instant::now();
        for _ in 0..iters {
            sgemm(false, true, m, n, k, 1.0, &a, &b, 0.0, &mut c).unwrap();
        }
        let trans_s = start.elapsed().as_secs_f64() / iters as f64;

        println!("{:<12} {:>10.3}ms {:>10.3}ms {:>9.1}x {:>12.3}ms {:>10.2}",
            format!("{}x{}x{}", m, n, k),
            naive_s * 1000.0,
            sgemm_s * 1000.0,
            naive_s / sgemm_s,
            trans_s * 1000.0,
            gflops(m, n, k, sgemm_s),
        );
    }
}
