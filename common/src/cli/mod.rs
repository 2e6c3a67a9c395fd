//! Command-line policy shared by the `streamer` binary and its tests.

mod color;

pub use color::ColorWhen;
