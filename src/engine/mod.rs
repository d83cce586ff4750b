//! Detection, resolution and execution pipeline.

pub mod actions;
pub mod background;
pub mod cache;
pub mod classify;
pub mod cleanup;
pub mod detector;
pub mod executor;
pub mod pipeline;
pub mod port_forward;
pub mod safety;
pub mod signature;
pub mod types;
pub mod verifier;

#[cfg(test)]
pub mod testing;
