//! # Fabric Core
//!
//! Foundational data types for the Stream Fabric engine.
//!
//! - **Values**: [`Value`], a closed dynamic variant
//!   (`null`/`bool`/`int`/`float`/`str`/`array`/`map`) with numeric coercion,
//!   a total ordering and hashable [`ValueKey`] projections for equality joins
//! - **Records**: [`Record`], an ordered field map that keeps the difference
//!   between a *missing* field and a field explicitly set to *null*
//!
//! ## Quick Start
//!
//! ```rust
//! use fabric_core::{record, Record, Value};
//!
//! let user = record! { "id" => 1i64, "name" => "A" };
//! assert_eq!(user.get("name"), Some(&Value::from("A")));
//! assert!(user.get("email").is_none());
//! ```
//!
//! ## See Also
//!
//! - [`fabric_runtime`](../fabric_runtime): registry, executor, joins,
//!   aggregation, pipelines and monitoring built on these types

pub mod record;
pub mod value;

pub use record::{FxIndexMap, Record};
pub use value::{Value, ValueKey};
