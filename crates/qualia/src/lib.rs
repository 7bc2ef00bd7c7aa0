//! # Qualia
//!
//! A single-user, local, content-addressed object and metadata store: a blob store
//! keyed by SHA-512, an append-only journal with checkpointed undo, and a small
//! query language over a schema of typed fields.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use qualia::{Database, ObjectRef};
//! use std::path::Path;
//!
//! # fn example() -> qualia::Result<()> {
//! let mut db = Database::open(Path::new("./mystore"), false)?;
//! let hash = db.add_file(Path::new("photo.jpg"))?;
//! db.set(&ObjectRef::hash(hash.clone()), "tags", "vacation".into())?;
//! db.commit()?;
//!
//! for object in db.select("tags:vacation")? {
//!     println!("{:?}", object.hash);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! The [`facade::Database`] is the only thing most callers touch; it coordinates a
//! [`blob::BlobStore`], an embedded journal (the `qualia-journal` crate), and an
//! [`index::Index`] that doubles as the property store and the search index. Query
//! strings parse to an [`query::ast::Expr`] and compile straight to a SQL
//! filter over that index.

pub mod archive;
pub mod auto_import;
pub mod blob;
pub mod config;
pub mod error;
pub mod facade;
pub mod index;
pub mod query;
pub mod schema;
pub mod store_backend;

pub use error::{QualiaError, Result};
pub use facade::{Database, ObjectRef};
pub use index::Object;
pub use schema::{FieldDescriptor, FieldSchema, FieldType};
