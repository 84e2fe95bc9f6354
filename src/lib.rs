//! Live terminal heatmap of block device activity.
//!
//! Block tracepoint records read from ftrace's `trace_pipe` are filtered by
//! device and folded into a [`tracker::Tracker`]. Once per refresh the
//! control loop in [`ui`] projects the tracker onto the terminal grid with a
//! [`heatmap::Projector`] and ages every record by one tick.

pub mod config;
pub mod device;
pub mod error;
pub mod export;
pub mod heatmap;
pub mod monitor;
pub mod tracer;
pub mod tracker;
pub mod ui;
