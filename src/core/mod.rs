//! Core types shared by every component
//!
//! - `size_class`: size buckets for the byte-buffer pool and block allocator
//! - `events`: typed broadcast streams with per-subscriber FIFO delivery

pub mod events;
pub mod size_class;

pub use events::{EventBus, NamedEvent, Subscription};
pub use size_class::{SizeClass, SizeClassTable};
