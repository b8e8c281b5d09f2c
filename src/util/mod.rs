//! Utility Module - shared constants

mod constants;

pub use constants::*;
