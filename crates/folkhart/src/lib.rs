//! Umbrella crate for Folkhart.
//!
//! Re-exports the engine and protocol crates so downstream code can depend on
//! a single crate name (`folkhart`). The HTTP transport and CLI live in
//! `folkhart-client`.

pub use folkhart_engine as engine;
pub use folkhart_protocol as protocol;

pub use folkhart_engine::{Adventure, RunStore, SlotView};
pub use folkhart_protocol::{RunKind, RunMode};
