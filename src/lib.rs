//! kfx-dist - multi-distro package builds for KF/x and Xen
//!
//! Builds the expensive from-source Xen stage once, caches it across runs,
//! builds one final image per distribution and collects the produced
//! packages into a single flat directory.

pub mod artifact;
pub mod builder;
pub mod cache;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod orchestrator;
pub mod pipeline;
pub mod target;
pub mod ui;

pub use error::{DistError, DistResult};
