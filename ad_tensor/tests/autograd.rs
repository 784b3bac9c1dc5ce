//! Gradient fixtures for the tensor graph, run on the CPU device.

use ad_tensor::prelude::*;
use approx::assert_relative_eq;

fn var(data: &[f32], shape: &[usize]) -> Tensor {
    tensor(data, shape, &TensorOptions::default().requires_grad(true)).unwrap()
}

fn assert_values(name: &str, actual: &[f32], expected: &[f32]) {
    assert_eq!(actual.len(), expected.len(), "{}: length mismatch", name);
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            approx::relative_eq!(*a, *e, epsilon = 1e-5, max_relative = 1e-4),
            "{}: element {} mismatch: got {}, expected {}",
            name,
            i,
            a,
            e
        );
    }
}

fn grad_of(t: &Tensor) -> Vec<f32> {
    t.grad().unwrap().to_vec::<f32>().unwrap()
}

/// z = x*(x+y)/t - tanh(y*y), m = x*z + sin(u)*u
fn composite(x: &Tensor, y: &Tensor, t: &Tensor, u: &Tensor) -> Result<Tensor> {
    let z = ((x * ((x + y)?)) / t - ((y * y)?).tanh()?)?;
    (x * &z)? + ((u.sin()? * u)?)
}

// ============================================================================
// Composite expressions
// ============================================================================

#[test]
fn test_composite_scalar() {
    let x = var(&[2.0], &[]);
    let y = var(&[3.0], &[]);
    let t = var(&[4.0], &[]);
    let u = var(&[5.0], &[]);

    let m = composite(&x, &y, &t, &u).unwrap();
    m.backward().unwrap();

    assert!(x.grad().unwrap().shape().is_scalar());
    assert!(m.shape().is_scalar());
    assert_relative_eq!(x.grad().unwrap().item::<f32>().unwrap(), 5.0, max_relative = 1e-4);
    assert_relative_eq!(y.grad().unwrap().item::<f32>().unwrap(), 0.999999, max_relative = 1e-4);
    assert_relative_eq!(t.grad().unwrap().item::<f32>().unwrap(), -1.25, max_relative = 1e-4);
    assert_relative_eq!(u.grad().unwrap().item::<f32>().unwrap(), 0.459387, max_relative = 1e-4);
    assert_relative_eq!(m.item::<f32>().unwrap(), -1.79462, max_relative = 1e-4);
}

#[test]
fn test_composite_1x2() {
    let shape = [1, 2];
    let x = var(&[1.0, 2.0], &shape);
    let y = var(&[3.0, 4.0], &shape);
    let t = var(&[5.0, 6.0], &shape);
    let u = var(&[7.0, 8.0], &shape);

    let m = composite(&x, &y, &t, &u).unwrap();
    m.backward().unwrap();

    assert_eq!(x.grad().unwrap().shape(), &Shape::from(shape));
    assert_values("x", &grad_of(&x), &[0.8, 3.66667]);
    assert_values("y", &grad_of(&y), &[0.199999, 0.666667]);
    assert_values("t", &grad_of(&t), &[-0.16, -0.666667]);
    assert_values("u", &grad_of(&u), &[5.9343, -0.174642]);
    assert_values("m", &m.to_vec::<f32>().unwrap(), &[4.39891, 9.91487]);
}

#[test]
fn test_composite_with_broadcasting() {
    let x = var(&[1.0, 2.0, 3.0], &[1, 3]);
    let y = var(&[7.0, 8.0, 9.0, 10.0, 11.0, 12.0], &[2, 3]);
    let t = var(&[13.0, 14.0, 15.0], &[1, 3]);
    let u = var(&[19.0, 20.0, 21.0, 22.0, 23.0, 24.0], &[2, 3]);

    let m = composite(&x, &y, &t, &u).unwrap();
    m.backward().unwrap();

    assert_eq!(x.grad().unwrap().shape(), &Shape::from([1, 3]));
    assert_eq!(y.grad().unwrap().shape(), &Shape::from([2, 3]));
    assert_eq!(t.grad().unwrap().shape(), &Shape::from([1, 3]));
    assert_eq!(m.shape(), Shape::from([2, 3]));

    assert_values("x", &grad_of(&x), &[1.07692, 5.14286, 10.0]);
    assert_values(
        "y",
        &grad_of(&y),
        &[0.0769231, 0.285714, 0.6, 0.0769231, 0.285714, 0.6],
    );
    assert_values("t", &grad_of(&t), &[-0.112426, -0.469388, -1.08]);
    assert_values(
        "u",
        &grad_of(&u),
        &[18.9353, 9.07459, -10.6657, -22.008, -13.1014, 9.27472],
    );
    assert_values(
        "m",
        &m.to_vec::<f32>().unwrap(),
        &[2.46305, 19.116, 21.7698, -0.348575, -17.7488, -15.7339],
    );
}

// ============================================================================
// Element-wise primitives
// ============================================================================

#[test]
fn test_log_gradient() {
    let x = var(&[0.1, 0.2, 0.3, 0.4], &[2, 2]);
    x.log().unwrap().backward().unwrap();
    assert_values("log", &grad_of(&x), &[10.0, 5.0, 3.33333, 2.5]);
}

#[test]
fn test_exp_gradient() {
    let x = var(&[0.1, 0.2, 0.3, 0.4], &[2, 2]);
    x.exp().unwrap().backward().unwrap();
    assert_values("exp", &grad_of(&x), &[1.10517, 1.2214, 1.34986, 1.49182]);
}

#[test]
fn test_pow_gradient_flows_to_base_only() {
    let x = var(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
    let e = var(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
    x.pow(&e).unwrap().backward().unwrap();
    assert_values("pow", &grad_of(&x), &[1.0, 4.0, 27.0, 256.0]);
    assert_values("exponent", &grad_of(&e), &[0.0; 4]);
}

#[test]
fn test_sum_gradient() {
    let x = var(&[0.1, 0.2, 0.3, 0.4], &[2, 2]);
    x.sum().unwrap().backward().unwrap();
    assert_values("sum", &grad_of(&x), &[1.0; 4]);
}

#[test]
fn test_sqrt_sin_cos_gradients() {
    let x = var(&[0.25, 1.0], &[2]);
    x.sqrt().unwrap().backward().unwrap();
    assert_values("sqrt", &grad_of(&x), &[1.0, 0.5]);

    x.zero_grad().unwrap();
    x.sin().unwrap().backward().unwrap();
    assert_values("sin", &grad_of(&x), &[0.25f32.cos(), 1.0f32.cos()]);

    x.zero_grad().unwrap();
    x.cos().unwrap().backward().unwrap();
    assert_values("cos", &grad_of(&x), &[-(0.25f32.sin()), -(1.0f32.sin())]);
}

// ============================================================================
// Transpose seeding
// ============================================================================

#[test]
fn test_transpose_backward_with_transposed_seed() {
    let x = var(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[3, 2]);
    let z = x.transpose(0, 1).unwrap();
    z.backward_with_shape(1.0, [2, 3]).unwrap();
    assert_eq!(x.grad().unwrap().shape(), &Shape::from([3, 2]));
    assert_values("transpose", &grad_of(&x), &[1.0; 6]);
}

#[test]
fn test_transpose_backward_rejects_untransposed_seed() {
    let x = var(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[3, 2]);
    let z = x.transpose(0, 1).unwrap();
    assert!(matches!(z.backward(), Err(TensorError::InvalidArgument(_))));
    assert!(matches!(
        z.backward_with_shape(1.0, [3, 2]),
        Err(TensorError::InvalidArgument(_))
    ));
}

// ============================================================================
// Broadcasting [1,3] against [2,3]
// ============================================================================

fn broadcast_pair() -> (Tensor, Tensor) {
    (
        var(&[1.0, 2.0, 3.0], &[1, 3]),
        var(&[7.0, 8.0, 9.0, 10.0, 11.0, 12.0], &[2, 3]),
    )
}

#[test]
fn test_broadcast_add() {
    for swap in [false, true] {
        let (x, y) = broadcast_pair();
        let z = if swap { &y + &x } else { &x + &y }.unwrap();
        z.backward().unwrap();
        assert_eq!(x.grad().unwrap().shape(), &Shape::from([1, 3]));
        assert_values("x", &grad_of(&x), &[2.0, 2.0, 2.0]);
        assert_values("y", &grad_of(&y), &[1.0; 6]);
    }
}

#[test]
fn test_broadcast_sub() {
    let (x, y) = broadcast_pair();
    (&x - &y).unwrap().backward().unwrap();
    assert_values("x", &grad_of(&x), &[2.0, 2.0, 2.0]);
    assert_values("y", &grad_of(&y), &[-1.0; 6]);

    let (x, y) = broadcast_pair();
    (&y - &x).unwrap().backward().unwrap();
    assert_values("x", &grad_of(&x), &[-2.0, -2.0, -2.0]);
    assert_values("y", &grad_of(&y), &[1.0; 6]);
}

#[test]
fn test_broadcast_mul() {
    for swap in [false, true] {
        let (x, y) = broadcast_pair();
        let z = if swap { &y * &x } else { &x * &y }.unwrap();
        z.backward().unwrap();
        assert_values("x", &grad_of(&x), &[17.0, 19.0, 21.0]);
        assert_values("y", &grad_of(&y), &[1.0, 2.0, 3.0, 1.0, 2.0, 3.0]);
    }
}

#[test]
fn test_broadcast_div() {
    let (x, y) = broadcast_pair();
    (&x / &y).unwrap().backward().unwrap();
    assert_values("x", &grad_of(&x), &[0.242857, 0.215909, 0.194444]);
    assert_values(
        "y",
        &grad_of(&y),
        &[-0.0204082, -0.03125, -0.037037, -0.01, -0.0165289, -0.0208333],
    );

    let (x, y) = broadcast_pair();
    (&y / &x).unwrap().backward().unwrap();
    assert_values("x", &grad_of(&x), &[-17.0, -4.75, -2.33333]);
    assert_values("y", &grad_of(&y), &[1.0, 0.5, 0.333333, 1.0, 0.5, 0.333333]);
}

#[test]
fn test_broadcast_from_scalar() {
    let x = var(&[5.0], &[]);
    let y = var(&[7.0, 8.0, 9.0, 10.0, 11.0, 12.0], &[2, 3]);
    (&x + &y).unwrap().backward().unwrap();
    assert!(x.grad().unwrap().shape().is_scalar());
    assert_values("x", &grad_of(&x), &[6.0]);

    let x = var(&[5.0], &[]);
    let y = var(&[7.0, 8.0, 9.0, 10.0, 11.0, 12.0], &[2, 3]);
    (&y / &x).unwrap().backward().unwrap();
    assert_values("x", &grad_of(&x), &[-2.28]);
    assert_values("y", &grad_of(&y), &[0.2; 6]);
}

#[test]
fn test_mixed_dtype_gradients_keep_operand_dtype() {
    let x = var(&[1.0, 2.0], &[2]);
    let y = tensor(
        &[3.0f64, 4.0],
        [2],
        &TensorOptions::default()
            .requires_grad(true)
            .dtype(DataType::Float64),
    )
    .unwrap();
    let z = (&x * &y).unwrap();
    assert_eq!(z.dtype(), DataType::Float64);
    z.backward().unwrap();
    assert_eq!(x.grad().unwrap().dtype(), DataType::Float32);
    assert_eq!(y.grad().unwrap().dtype(), DataType::Float64);
    assert_values("x", &grad_of(&x), &[3.0, 4.0]);
}

// ============================================================================
// Dimensional sums
// ============================================================================

fn cube() -> Tensor {
    let data: Vec<f32> = (1..=24).map(|v| v as f32).collect();
    var(&data, &[3, 4, 2])
}

#[test]
fn test_sum_dim_gradients() {
    let cases: [(usize, bool, &[usize]); 6] = [
        (0, false, &[4, 2]),
        (0, true, &[1, 4, 2]),
        (1, false, &[3, 2]),
        (1, true, &[3, 1, 2]),
        (2, false, &[3, 4]),
        (2, true, &[3, 4, 1]),
    ];
    for (dim, keep_dim, reduced) in cases {
        let t = cube();
        let sum = t.sum_dim(dim, keep_dim).unwrap();
        sum.retain_grad().unwrap();
        sum.backward_with_shape(1.0, sum.shape()).unwrap();

        assert_eq!(t.grad().unwrap().shape(), &t.shape());
        assert_eq!(sum.grad().unwrap().shape(), &Shape::from(reduced));
        assert_values("t", &grad_of(&t), &[1.0; 24]);
        assert_values("sum", &grad_of(&sum), &vec![1.0; sum.numel()]);
    }
}

#[test]
fn test_chained_sum_dim_with_broadcast() {
    let a = cube();
    let b = var(&[1.0, 2.0, 3.0], &[3]);
    let z = a.sum_dim(1, false).unwrap().sum_dim(1, true).unwrap();
    z.retain_grad().unwrap();
    let product = (&z * &b).unwrap();
    product.backward().unwrap();

    assert_eq!(z.shape(), Shape::from([3, 1]));
    assert_values("z", &z.to_vec::<f32>().unwrap(), &[36.0, 100.0, 164.0]);
    assert_values("z.grad", &grad_of(&z), &[6.0; 3]);
    assert_values("a.grad", &grad_of(&a), &[6.0; 24]);
}

// ============================================================================
// Finite differences
// ============================================================================

#[test]
fn test_primitives_match_finite_differences() {
    use ad_tensor::finite_diff::{analytic_gradient, numeric_gradient};

    type Op = fn(&[Tensor]) -> Result<Tensor>;
    let ops: [(&str, Op, f64); 21] = [
        ("add", |t| &t[0] + &t[1], 1e-6),
        ("sub", |t| &t[0] - &t[1], 1e-6),
        ("mul", |t| &t[0] * &t[1], 1e-6),
        ("neg", |t| t[0].neg()? * &t[1], 1e-6),
        ("exp", |t| t[0].exp()? * &t[1], 1e-6),
        ("sin", |t| t[0].sin()? * &t[1], 1e-6),
        ("cos", |t| t[0].cos()? * &t[1], 1e-6),
        ("pow", |t| t[0].pow_scalar(2.5)? * &t[1], 1e-6),
        ("sum", |t| (&t[0] * &t[1])?.sum()?.mul_scalar(3.0), 1e-6),
        ("reshape", |t| t[0].reshape([2, 2])? * &t[1].reshape([2, 2])?, 1e-6),
        ("broadcast_to", |t| t[0].broadcast_to([3, 4])?.exp()? * &t[1], 1e-6),
        ("broadcast_column", |t| t[0].reshape([4, 1])?.broadcast_to([4, 4])? * &t[1], 1e-6),
        // A wide step keeps the f32 rounding of the perturbation negligible.
        ("to_dtype", |t| t[0].to_dtype(DataType::Float32)? * &t[1], 1e-2),
        ("div", |t| &t[0] / &t[1], 1e-6),
        ("tanh", |t| t[0].tanh(), 1e-6),
        ("sqrt", |t| t[0].sqrt(), 1e-6),
        ("log", |t| t[0].log(), 1e-6),
        ("mean", |t| t[0].mean(), 1e-6),
        ("matmul", |t| t[0].reshape([2, 2])?.matmul(&t[1].reshape([2, 2])?), 1e-6),
        ("transpose", |t| (t[0].reshape([2, 2])?.transpose(0, 1)? * &t[1].reshape([2, 2])?), 1e-6),
        ("sum_dim", |t| t[0].reshape([2, 2])?.sum_dim(0, false)? * &t[1].reshape([2, 2])?.sum_dim(1, false)?, 1e-6),
    ];
    let inputs = [
        (vec![0.5, 1.25, 2.0, 0.75], Shape::from([4])),
        (vec![1.5, 0.5, 3.0, 2.5], Shape::from([4])),
    ];

    for (name, op, eps) in ops {
        let analytic = analytic_gradient(op, &inputs).unwrap();
        let numeric = numeric_gradient(op, &inputs, eps).unwrap();
        for (a, n) in analytic.iter().flatten().zip(numeric.iter().flatten()) {
            assert!(
                (a - n).abs() <= 1e-3 * n.abs().max(1.0),
                "{}: analytic {} vs numeric {}",
                name,
                a,
                n
            );
        }
    }
}
