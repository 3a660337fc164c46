//! Services layered over the buffer cache
//!
//! Only the Simple backend routes its writes through the journal; the ext2
//! backend writes home locations directly.

pub mod journaling;

// Re-export journaling types
pub use journaling::{Log, LogHeader, LogStats, Transaction};
