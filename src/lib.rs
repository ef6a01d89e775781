// src/lib.rs

//! Treeforge package cache and tree assembly engine
//!
//! Builds immutable filesystem trees in a content-addressed store out of
//! binary packages. Every package is unpacked once into its own cached
//! commit; composing a tree then means checking cached commits out into a
//! scratch root, running install scripts there, and writing the result
//! back as a new commit.
//!
//! # Architecture
//!
//! - [`cache_key`]: injective package identity to cache branch mapping
//! - [`classify`]: which packages need download, import or relabel
//! - [`import`]: package files into cached commits, in one store transaction
//! - [`relabel`]: cached commits brought up to the current label policy
//! - [`assemble`]: the ordered install transaction in a scratch root
//! - [`commit`]: the assembled root back into the store under a ref
//! - [`compose`]: all of the above for one treespec

pub mod assemble;
pub mod cache_key;
pub mod classify;
pub mod commit;
pub mod compose;
pub mod compression;
pub mod db;
pub mod digest;
mod error;
pub mod hash;
pub mod import;
pub mod model;
pub mod packages;
pub mod policy;
pub mod pool;
pub mod relabel;
pub mod repository;
pub mod resolver;
pub mod scriptlet;
pub mod store;
pub mod version;

pub use compose::{ComposePlan, ComposeSummary, Composer};
pub use error::{Error, Result};
pub use model::{ComposeConfig, Treespec};
