//! Filesystem-wide constants.

pub mod fatx;
