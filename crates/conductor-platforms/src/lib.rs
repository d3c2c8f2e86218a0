pub mod client;
pub mod mapping;
pub mod memory;
pub mod registry;

pub use client::*;
pub use mapping::*;
pub use memory::*;
pub use registry::*;
