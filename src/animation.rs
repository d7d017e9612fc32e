//! Buffered frame playback at a fixed frequency

mod buffer;
pub use buffer::*;

mod player;
pub use player::*;

mod sink;
pub use sink::*;
