//! Platform layer: the only place that talks to the OS directly

mod linux;

pub use linux::*;
