//! Activation functions, as free functions and as parameterless modules.

use std::f64::consts::PI;

use ad_tensor::prelude::*;

use crate::module::Module;

/// Tanh activation: tanh(x)
pub fn tanh(x: &Tensor) -> Result<Tensor> {
    x.tanh()
}

/// Sigmoid activation: 1 / (1 + exp(-x))
pub fn sigmoid(x: &Tensor) -> Result<Tensor> {
    x.neg()?.exp()?.add_scalar(1.0)?.rdiv_scalar(1.0)
}

/// Softmax over every element: exp(x) / sum(exp(x))
pub fn softmax(x: &Tensor) -> Result<Tensor> {
    let e = x.exp()?;
    let total = e.sum()?;
    e / total
}

/// Log-softmax over every element: x - log(sum(exp(x)))
pub fn log_softmax(x: &Tensor) -> Result<Tensor> {
    x - x.exp()?.sum()?.log()?
}

/// GeLU, tanh approximation: 0.5 * x * (1 + tanh(sqrt(2/pi) * (x + 0.044715 * x^3)))
pub fn gelu(x: &Tensor) -> Result<Tensor> {
    let cube = ((x * x)? * x)?;
    let inner = (x + cube.mul_scalar(0.044715)?)?.mul_scalar((2.0 / PI).sqrt())?;
    let gate = inner.tanh()?.add_scalar(1.0)?;
    (x * gate)?.mul_scalar(0.5)
}

macro_rules! activation_module {
    ($(#[$meta:meta])* $name:ident, $func:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default)]
        pub struct $name;

        impl Module for $name {
            fn forward(&self, x: &Tensor) -> Result<Tensor> {
                $func(x)
            }
        }
    };
}

activation_module!(Tanh, tanh);
activation_module!(Sigmoid, sigmoid);
activation_module!(Softmax, softmax);
activation_module!(LogSoftmax, log_softmax);
activation_module!(
    /// Gaussian error linear unit, tanh approximation.
    GeLU,
    gelu
);

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn input(data: &[f32], require_grad: bool) -> Tensor {
        let opts = TensorOptions::default().requires_grad(require_grad);
        tensor(data, [data.len()], &opts).unwrap()
    }

    #[test]
    fn test_sigmoid() {
        let y = sigmoid(&input(&[0.0], false)).unwrap();
        assert_relative_eq!(y.to_vec::<f32>().unwrap()[0], 0.5);
    }

    #[test]
    fn test_sigmoid_gradient() {
        let x = input(&[0.1, 0.2, 0.3, 0.4], true);
        Sigmoid.forward(&x).unwrap().backward().unwrap();
        let expected = [0.249376f32, 0.247517, 0.244458, 0.240261];
        for (g, e) in x.grad().unwrap().to_vec::<f32>().unwrap().iter().zip(expected) {
            assert_relative_eq!(*g, e, max_relative = 1e-4);
        }
    }

    #[test]
    fn test_softmax() {
        let y = Softmax.forward(&input(&[1.0, 2.0, 3.0], false)).unwrap();
        let y = y.to_vec::<f32>().unwrap();

        // Softmax should sum to 1
        assert_relative_eq!(y.iter().sum::<f32>(), 1.0, max_relative = 1e-5);
        assert!(y[2] > y[1]);
        assert!(y[1] > y[0]);
    }

    #[test]
    fn test_log_softmax() {
        let y = LogSoftmax.forward(&input(&[1.0, 2.0, 3.0], false)).unwrap();
        let sum: f32 = y.to_vec::<f32>().unwrap().iter().map(|v| v.exp()).sum();
        assert_relative_eq!(sum, 1.0, max_relative = 1e-5);
    }

    #[test]
    fn test_gelu() {
        let y = GeLU.forward(&input(&[-1.0, 0.0, 1.0, 2.0], false)).unwrap();
        let expected = [-0.158808f32, 0.0, 0.841192, 1.954598];
        for (v, e) in y.to_vec::<f32>().unwrap().iter().zip(expected) {
            assert_relative_eq!(*v, e, epsilon = 1e-5, max_relative = 1e-4);
        }
    }

    #[test]
    fn test_tanh_module() {
        let y = Tanh.forward(&input(&[0.5], false)).unwrap();
        assert_relative_eq!(y.to_vec::<f32>().unwrap()[0], 0.5f32.tanh());
        assert!(Tanh.parameters().is_empty());
    }
}
