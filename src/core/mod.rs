pub mod admission;
pub mod classifier;
pub mod collector;
pub mod domain;
pub mod lifecycle;
pub mod orchestrator;
pub mod pipeline;
pub mod service;
pub mod toolchain;
pub mod traits;
