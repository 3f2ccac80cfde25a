//! Protovalidate support.
//!
//! This module provides:
//! - `ProtovalidateExtractor`, which moves CEL expressions of `.proto` files into virtual documents
//! - the protovalidate CEL environment used to check them

mod builtins;
mod proto_parser;

pub use builtins::{protovalidate_env, protovalidate_functions};
pub use proto_parser::ProtovalidateExtractor;
