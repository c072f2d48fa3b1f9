//! Example applications for Trellis.
//!
//! This crate contains example binaries demonstrating the Trellis model base:
//!
//! - `movie_ratings` - Matrix factorization on synthetic user/item ratings
//!
//! # Running Examples
//!
//! ```bash
//! # Train with the defaults (Adam, 10 epochs)
//! cargo run -p trellis-examples --bin movie_ratings
//!
//! # SGD with a trainer config file and early stopping
//! cargo run -p trellis-examples --bin movie_ratings -- \
//!     --optimizer sgd --learning-rate 0.5 \
//!     --config trainer.json --patience 3
//! ```
