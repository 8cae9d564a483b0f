pub mod event;
pub mod plan;

pub use event::*;
pub use plan::*;
