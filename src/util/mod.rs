//! Small shared utilities.
//!
//! - [`Arena`]: generational slot storage backing permit and task identifiers

mod arena;

pub use arena::{Arena, ArenaIndex};
