//! Error handling foundation for colloquy.
//!
//! Only the `Result` alias lives here. Each crate owns its domain error
//! enums and converts lower-layer reports into its own context with
//! `.map_err(...)` as they cross a crate boundary.

use rootcause::Report;

/// A Result type alias using rootcause's Report for error handling.
pub type Result<T, C = ()> = std::result::Result<T, Report<C>>;
