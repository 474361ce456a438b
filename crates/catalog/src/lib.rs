//! Keel component catalog.
//!
//! This crate defines the contract every managed component implements and the
//! ordered catalog the engine iterates. The catalog doubles as the dependency
//! graph: it is validated once at construction and queried per dispatch.

#![forbid(unsafe_code)]

mod component;
mod graph;
pub mod mock;

pub use component::{Component, ComponentContext, HookError, Operation};
pub use graph::{Catalog, CatalogDefect};
pub use mock::{Hook, MockComponent};
