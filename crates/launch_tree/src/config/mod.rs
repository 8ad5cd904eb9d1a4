//! Launch description parsing, substitution and scoping

mod condition;
mod context;
mod launch_file;
mod source;
mod substitution;

pub use condition::*;
pub use context::*;
pub use launch_file::*;
pub use source::*;
pub use substitution::*;
