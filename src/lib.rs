//! # clcontext
//!
//! A library for parsing, verifying and encoding Android class loader contexts
//!
mod context_parse;
mod context_verify;
mod context_write;
pub mod dex;
pub mod hierarchy;
mod tests;
pub mod types;
