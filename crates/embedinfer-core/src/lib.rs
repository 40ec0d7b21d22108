//! Engine-independent building blocks for embedding an in-process inference
//! engine: tensor descriptors, the string-tensor codec, the response allocator
//! protocol, model configuration types and the engine boundary traits.

pub mod allocator;
pub mod engine;
pub mod error;
pub mod model;
pub mod options;
pub mod strings;
pub mod tensor;

pub use allocator::*;
pub use engine::*;
pub use error::*;
pub use model::*;
pub use options::*;
pub use strings::*;
pub use tensor::*;
