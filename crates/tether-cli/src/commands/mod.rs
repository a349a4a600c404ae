pub mod common;
pub mod completions;
pub mod conflicts;
pub mod entity;
pub mod sync;
