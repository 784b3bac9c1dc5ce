//! XOR problem training example.
//!
//! Demonstrates training a simple MLP to learn the XOR function.
//! XOR is a classic non-linearly separable problem that requires hidden layers.

use ad_nn::{Linear, Loss, MSELoss, Module, Optimizer, Sequential, Tanh, SGD};
use ad_tensor::prelude::*;

fn main() -> ad_tensor::Result<()> {
    ad_tensor::manual_seed(7);

    // XOR dataset, one row per sample
    let opts = TensorOptions::default();
    let x = tensor(&[0.0f32, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0], [4, 2], &opts)?;
    let y = tensor(&[0.0f32, 1.0, 1.0, 0.0], [4, 1], &opts)?;

    // 2 -> 8 -> 1 with a tanh hidden layer
    let model = Sequential::new()
        .with(Linear::new(2, 8)?)
        .with(Tanh)
        .with(Linear::new(8, 1)?);
    let mut opt = SGD::new(model.parameters(), 0.1);

    println!("Training XOR network ({} parameters)...\n", model.learnable_parameters());

    for epoch in 0..2000 {
        opt.zero_grad()?;
        let loss = MSELoss.forward(&model.forward(&x)?, &y)?;
        loss.backward()?;
        opt.step()?;

        if epoch % 200 == 0 || epoch == 1999 {
            println!("Epoch {:4}: loss = {:.6}", epoch, loss.item::<f32>()?);
        }
    }

    // Test the trained network
    println!("\nTesting trained network:");
    println!("========================");

    let outputs = model.forward(&x)?.to_vec::<f32>()?;
    let inputs = x.to_vec::<f32>()?;
    let targets = y.to_vec::<f32>()?;

    let mut correct = 0;
    for (i, (&output, &target)) in outputs.iter().zip(&targets).enumerate() {
        println!(
            "Input: [{:.0}, {:.0}] -> Output: {:.4} (target: {:.0})",
            inputs[2 * i],
            inputs[2 * i + 1],
            output,
            target
        );
        // Output > 0.5 means class 1
        let predicted_class = if output > 0.5 { 1.0 } else { 0.0 };
        if (predicted_class - target).abs() < 0.01 {
            correct += 1;
        }
    }

    println!("\nAccuracy: {}/4", correct);
    if correct == 4 {
        println!("Successfully learned XOR!");
    }
    Ok(())
}
