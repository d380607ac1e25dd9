//! Infrastructure shared by the components
//!
//! - Configuration loading and projection
//! - File and console logging
//! - Periodic timers with shutdown
//! - Bounded rings and rolling windows

pub mod config;
pub mod logging;
pub mod ring_buffer;
pub mod timer;

pub use ring_buffer::{RingBuffer, RollingWindow};
pub use timer::TimerSet;
