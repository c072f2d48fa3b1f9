//! Input batches and gradient recording for Trellis models.
//!
//! This crate sits between model code and the differentiable runtime
//! (`candle-core`). It does not implement any tensor math or differentiation
//! itself; it provides the small pieces the training step needs around them:
//!
//! - [`Nested`]: the structured input batch handed to loss functions
//! - [`normalize_inputs`]: unwraps batches that arrive as a one-element sequence
//! - [`GradientTape`]: a scoped recording context that yields [`Gradients`]
//! - [`scalar_value`]: reads a one-element loss tensor as `f64`
//!
//! # Example
//!
//! ```rust
//! use candle_core::{Device, Tensor, Var};
//! use trellis_tensor::{GradientTape, Nested, normalize_inputs};
//!
//! let w = Var::new(&[2.0f32], &Device::Cpu).unwrap();
//! let x = Tensor::new(&[3.0f32], &Device::Cpu).unwrap();
//!
//! let batch = normalize_inputs(Nested::Seq(vec![Nested::from(x)]));
//! let x = batch.as_tensor().unwrap();
//!
//! let mut tape = GradientTape::new();
//! let loss = tape
//!     .record(|| w.as_tensor().mul(x)?.sum_all())
//!     .unwrap();
//! let grads = tape.gradient(&loss, &[w.clone()]).unwrap();
//! let dw = grads.get(&w).unwrap().to_vec1::<f32>().unwrap();
//! assert_eq!(dw, vec![3.0]);
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod error;
pub mod nested;
pub mod tape;

pub use error::{TensorError, TensorResult};
pub use nested::{normalize_inputs, Nested};
pub use tape::{scalar_value, GradientTape, Gradients};

// The runtime types model code works with.
pub use candle_core::{DType, Device, Tensor, Var};
