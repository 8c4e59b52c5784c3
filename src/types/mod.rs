//! Core types for Parley.

pub mod audio;
pub mod context;
pub mod generation;
pub mod message;
pub mod stream;
pub mod usage;

pub use audio::*;
pub use context::*;
pub use generation::*;
pub use message::*;
pub use stream::*;
pub use usage::*;
