// SPDX-License-Identifier: MIT OR Apache-2.0

#![allow(dead_code)]

use burn::backend::{Autodiff, NdArray};
use burn::module::Param;
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use xiangqi_net::{
    construct, DeviceTarget, Disclosure, Exposed, NetworkConfig, NetworkError, NetworkSession,
    TrainingBatch, BOARD_CHANNELS, BOARD_HEIGHT, BOARD_WIDTH,
};

pub type B = Autodiff<NdArray>;

pub const LABELS: usize = 100;

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Small network on `replicas` host devices
pub fn config(replicas: usize, batch_size: usize) -> NetworkConfig {
    NetworkConfig::new(LABELS, vec![DeviceTarget::Host; replicas])
        .with_batch_size(batch_size)
        .with_res_layers(1)
        .with_filters(8)
        .with_disclosure(Disclosure::Extra)
}

pub fn build(config: NetworkConfig) -> (NetworkSession<B>, Exposed<B>) {
    init_logging();
    match construct::<B>(config) {
        Ok(built) => built,
        Err(e) => panic!("construction failed: {e}"),
    }
}

pub fn build_err(config: NetworkConfig) -> NetworkError {
    match construct::<B>(config) {
        Ok(_) => panic!("construction should have failed"),
        Err(e) => e,
    }
}

/// Sparse random boards, one-hot moves and outcomes in {-1, 0, 1}
pub fn random_rows(rows: usize, seed: u64) -> (Vec<f32>, Vec<f32>, Vec<f32>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let boards = (0..rows * BOARD_HEIGHT * BOARD_WIDTH * BOARD_CHANNELS)
        .map(|_| if rng.gen_bool(0.1) { 1.0 } else { 0.0 })
        .collect();

    let mut moves = vec![0.0; rows * LABELS];
    for row in 0..rows {
        moves[row * LABELS + rng.gen_range(0..LABELS)] = 1.0;
    }
    let scores = (0..rows).map(|_| rng.gen_range(-1..=1) as f32).collect();

    (boards, moves, scores)
}

pub fn batch(rows: usize, seed: u64) -> TrainingBatch<B> {
    let (boards, moves, scores) = random_rows(rows, seed);
    TrainingBatch::from_vecs(boards, moves, scores, LABELS, &Default::default()).unwrap()
}

pub fn boards(rows: usize, seed: u64) -> Tensor<B, 4> {
    let (boards, _, _) = random_rows(rows, seed);
    Tensor::from_data(
        TensorData::new(boards, [rows, BOARD_HEIGHT, BOARD_WIDTH, BOARD_CHANNELS]),
        &Default::default(),
    )
}

pub fn values<T: Backend, const D: usize>(tensor: Tensor<T, D>) -> Vec<f32> {
    tensor.into_data().convert::<f32>().to_vec::<f32>().unwrap()
}

pub fn param_values<const D: usize>(param: &Param<Tensor<B, D>>) -> Vec<f32> {
    values(param.val())
}

pub fn assert_close(a: &[f32], b: &[f32], tolerance: f32) {
    assert_eq!(a.len(), b.len());
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        assert!((x - y).abs() <= tolerance, "element {i}: {x} vs {y}");
    }
}
