//! An in-process engine behind the `embedinfer_core::Engine` boundary.
//!
//! Models are plain Rust objects; requests are spread round-robin over a
//! fixed set of worker threads and output memory is obtained through the
//! caller's allocator session.

pub mod demo;
pub mod engine;
pub mod model;
pub mod request;
pub mod response;
pub mod scheduler;
pub mod stats;
pub mod worker;

pub use demo::*;
pub use engine::*;
pub use model::*;
pub use request::*;
pub use response::*;
pub use stats::*;
