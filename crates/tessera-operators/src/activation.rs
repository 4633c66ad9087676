//! Elementwise activations applied in place on host buffers.

use tessera_core::Activation;

/// Apply `activation` to every element of `data`.
pub fn apply_activation(data: &mut [f32], activation: Activation) {
    match activation {
        Activation::Identity => {}
        Activation::Relu => data.iter_mut().for_each(|x| *x = x.max(0.0)),
        Activation::Tanh => data.iter_mut().for_each(|x| *x = x.tanh()),
        Activation::Sigmoid => data.iter_mut().for_each(|x| *x = 1.0 / (1.0 + (-*x).exp())),
        Activation::Relu6 => data.iter_mut().for_each(|x| *x = x.clamp(0.0, 6.0)),
    }
}
