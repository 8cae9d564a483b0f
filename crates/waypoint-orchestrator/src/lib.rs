pub mod collaborators;
pub mod error;
pub mod executor;
pub mod flow;
pub mod prompts;
pub mod task;

pub use collaborators::*;
pub use error::*;
pub use executor::*;
pub use flow::*;
pub use task::*;
