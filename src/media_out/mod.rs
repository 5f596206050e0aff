//! Media output playback module

pub mod audio;

pub use audio::{PulseOutput, PulseOutputDevice};
