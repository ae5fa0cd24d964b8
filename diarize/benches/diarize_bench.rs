use criterion::{black_box, criterion_group, criterion_main, Criterion};
use giztoy_diarize::sampling::{normal_matrix, seeded};
use giztoy_diarize::similarity::cosine_similarity;
use giztoy_diarize::stitch::{stitch, Window};
use giztoy_diarize::{nme_spectral_clustering, vb_hmm, EigenvoiceModel, NmeOptions, VbInit, VbOptions};
use ndarray::{Array1, Array2};

/// `speakers` clusters of `per_speaker` noisy points around random centres.
fn clustered(speakers: usize, per_speaker: usize, dim: usize, noise: f64) -> Array2<f64> {
    let mut rng = seeded(7);
    let centres = normal_matrix(&mut rng, speakers, dim, 0.0, 1.0).unwrap();
    let jitter = normal_matrix(&mut rng, speakers * per_speaker, dim, 0.0, noise).unwrap();
    Array2::from_shape_fn((speakers * per_speaker, dim), |(i, d)| {
        centres[[i / per_speaker, d]] + jitter[[i, d]]
    })
}

fn bench_nme(c: &mut Criterion) {
    let x = clustered(4, 50, 32, 0.2);
    let aff = cosine_similarity(x.view());
    let opts = NmeOptions::default();
    c.bench_function("nme_200_windows", |b| {
        b.iter(|| nme_spectral_clustering(black_box(aff.view()), None, &opts).unwrap())
    });
}

fn bench_vb(c: &mut Criterion) {
    let x = clustered(3, 150, 16, 0.3);
    let model = EigenvoiceModel::new(Array1::zeros(16), Array1::ones(16), Array2::eye(16) * 2.0).unwrap();
    let opts = VbOptions {
        max_speakers: 5,
        max_iters: 10,
        ..VbOptions::default()
    };
    c.bench_function("vb_hmm_450_frames_10_iters", |b| {
        b.iter(|| vb_hmm(black_box(x.view()), &model, VbInit::default(), &opts, None).unwrap())
    });
}

fn bench_stitch(c: &mut Criterion) {
    let windows: Vec<Window> = (0..2000)
        .map(|i| {
            let start = 0.75 * i as f64;
            Window::new(i % 2, start, start + 1.5, (i / 40) % 5)
        })
        .collect();
    c.bench_function("stitch_2000_windows", |b| b.iter(|| stitch(black_box(&windows))));
}

criterion_group!(benches, bench_nme, bench_vb, bench_stitch);
criterion_main!(benches);
