//! Runtime components: event dispatch, process supervision, tree execution

pub mod events;
pub mod executor;
pub mod process;

pub use events::*;
pub use executor::*;
pub use process::*;
