//! scbench - per-CPU, lock-free system call accounting
//!
//! Counts every distinct system call and its cumulative latency, for the
//! whole system or one process tree, without double counting calls that
//! return twice and without crediting calls the kernel will restart.
//!
//! The [`engine`] holds the hooks and their per-CPU maps, [`source`] feeds
//! it events, and [`controller`] turns counter snapshots into reports.

pub mod cli;
pub mod controller;
pub mod cpu;
pub mod csv_output;
pub mod duration;
pub mod engine;
pub mod json_output;
pub mod privileges;
pub mod report;
pub mod source;
pub mod syscalls;
