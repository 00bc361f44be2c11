//! Library target for the `seghaul` package.
//!
//! The primary deliverable of this package is the `seghaul` CLI binary
//! (`src/main.rs`). This library exists so CI can run `cargo test -p seghaul --doc`
//! for feature/doctype validation.

#[doc(hidden)]
pub use seghaul_engine;
