//! Media input capture module

pub mod audio;

pub use audio::PulseMicrophone;
