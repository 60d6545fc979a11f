//! The datagen synthetic payload generator.
//!
//! This library supports the datagen binary found elsewhere in this
//! project. Random payloads are emitted once per second at an approximate
//! byte rate into stdout or an append-only file, with a human-readable audit
//! trail beside the file and a small Prometheus endpoint reporting what was
//! produced.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

pub mod config;
pub mod emitter;
pub mod httpd;
pub mod lifecycle;
pub mod signal;
pub mod sink;
pub mod telemetry;
