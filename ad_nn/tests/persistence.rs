//! Saving and loading parameters through files.

use ad_nn::{load, save, Linear, Module, Sequential, Tanh};
use ad_tensor::prelude::*;

fn model(hidden: usize) -> Sequential {
    Sequential::new()
        .with(Linear::new(2, hidden).unwrap())
        .with(Tanh)
        .with(Linear::new(hidden, 1).unwrap())
}

fn snapshot(module: &dyn Module) -> Vec<Vec<f32>> {
    module
        .parameters()
        .iter()
        .map(|p| p.to_vec::<f32>().unwrap())
        .collect()
}

#[test]
fn test_save_load_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("xor.bin");

    let source = model(4);
    save(&source, &path).unwrap();

    let word = std::mem::size_of::<usize>();
    let expected_len = 4 * word + (8 + 4 + 4 + 1) * 4;
    assert_eq!(std::fs::metadata(&path).unwrap().len() as usize, expected_len);

    let mut target = model(4);
    assert_ne!(snapshot(&source), snapshot(&target));
    load(&mut target, &path).unwrap();
    assert_eq!(snapshot(&source), snapshot(&target));

    let x = tensor(&[1.0f32, 0.0], [1, 2], &TensorOptions::default()).unwrap();
    assert_eq!(
        source.forward(&x).unwrap().to_vec::<f32>().unwrap(),
        target.forward(&x).unwrap().to_vec::<f32>().unwrap()
    );
}

#[test]
fn test_double_precision_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("double.bin");
    let opts = TensorOptions::default().dtype(DataType::Float64);

    let source = Linear::with_options(3, 2, &opts).unwrap();
    save(&source, &path).unwrap();
    let word = std::mem::size_of::<usize>();
    assert_eq!(
        std::fs::metadata(&path).unwrap().len() as usize,
        2 * word + (6 + 2) * 8
    );

    let mut target = Linear::with_options(3, 2, &opts).unwrap();
    load(&mut target, &path).unwrap();
    assert_eq!(
        source.weight.to_vec::<f64>().unwrap(),
        target.weight.to_vec::<f64>().unwrap()
    );
}

#[test]
fn test_size_mismatch_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("small.bin");
    save(&model(4), &path).unwrap();

    let mut larger = model(5);
    match load(&mut larger, &path) {
        Err(TensorError::ParameterSize { expected, found }) => {
            assert_eq!(expected, 10);
            assert_eq!(found, 8);
        }
        other => panic!("expected ParameterSize, got {:?}", other),
    }
}

#[test]
fn test_missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut target = model(4);
    assert!(matches!(
        load(&mut target, dir.path().join("absent.bin")),
        Err(TensorError::Io(_))
    ));
}
