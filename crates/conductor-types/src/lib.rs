pub mod decision;
pub mod error;
pub mod event;
pub mod result;
pub mod workflow;

pub use decision::*;
pub use error::*;
pub use event::*;
pub use result::*;
pub use workflow::*;
