//! Header staging for the userspace programs.
//!
//! Programs include each other's headers, so those headers have to be in the
//! staged root before any program is configured. The install lists are read
//! straight out of the Meson descriptions:
//!
//! - [`lexer`] and [`parser`] turn a `meson.build` into an AST
//! - [`eval`] partially evaluates it
//! - [`meson`] finds the `install_headers()` directives
//! - [`cache`] remembers which subprojects are unchanged
//! - [`sync`] ties the pass together

pub mod cache;
pub mod eval;
pub mod lexer;
pub mod meson;
pub mod parser;
pub mod sync;

pub use cache::RebuildCache;
pub use meson::{BuildDescription, HeaderInstallMapping, MesonDescription};
pub use sync::{sync_subproject_headers, HeaderSyncReport};
