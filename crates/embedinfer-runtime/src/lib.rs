//! Request/response lifecycle for an embedded inference engine: build a
//! request, submit it, await the completion and read a structured result
//! whose output bytes stay in engine-owned memory.

pub mod completion;
pub mod registry;
pub mod request;
pub mod result;
pub mod server;

pub use completion::*;
pub use registry::*;
pub use request::*;
pub use result::*;
pub use server::*;
