//! # ad_nn - Neural Network Layers for ad_tensor
//!
//! This crate provides neural network building blocks on top of the ad_tensor autodiff engine:
//!
//! - **Modules**: the [`Module`] trait and [`Sequential`] composition
//! - **Layers**: Linear (fully connected)
//! - **Activations**: Tanh, Sigmoid, Softmax, Log-Softmax, GeLU
//! - **Losses**: MSE, Binary Cross-Entropy
//! - **Optimizers**: SGD, Adam
//! - **Persistence**: [`save`] and [`load`] for parameter files
//!
//! ## Example: Training a Simple MLP
//!
//! ```
//! use ad_nn::{Adam, Linear, Loss, MSELoss, Module, Optimizer, Sequential, Tanh};
//! use ad_tensor::prelude::*;
//!
//! # fn main() -> ad_tensor::Result<()> {
//! let model = Sequential::new()
//!     .with(Linear::new(2, 4)?)
//!     .with(Tanh)
//!     .with(Linear::new(4, 1)?);
//! let mut opt = Adam::new(model.parameters(), 0.05);
//!
//! let opts = TensorOptions::default();
//! let x = tensor(&[0.0f32, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0], [4, 2], &opts)?;
//! let y = tensor(&[0.0f32, 1.0, 1.0, 0.0], [4, 1], &opts)?;
//!
//! for _ in 0..10 {
//!     opt.zero_grad()?;
//!     let loss = MSELoss.forward(&model.forward(&x)?, &y)?;
//!     loss.backward()?;
//!     opt.step()?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod activations;
pub mod layers;
pub mod loss;
pub mod module;
pub mod optim;
pub mod persist;

// Re-exports for convenience
pub use activations::{gelu, log_softmax, sigmoid, softmax, tanh, GeLU, LogSoftmax, Sigmoid, Softmax, Tanh};
pub use layers::Linear;
pub use loss::{binary_cross_entropy_loss, mse_loss, BinaryCrossEntropyLoss, Loss, MSELoss};
pub use module::{Module, Sequential};
pub use optim::{Adam, Optimizer, SGD};
pub use persist::{load, save};
