//! Core types and collections for pgharbor.
//!
//! This crate holds the leaves of the dependency graph: the unified error
//! taxonomy, the `Lsn` log-sequence-number type, the tagged [`Value`]
//! container, and the two collections used pervasively by the workflow and
//! engine layers: an insertion-ordered [`Deque`] and an adaptive radix
//! tree ([`Art`]) with ordered key traversal.

pub mod art;
pub mod deque;
pub mod error;
pub mod lsn;
pub mod value;

pub use art::Art;
pub use deque::{Deque, SharedDeque};
pub use error::{Error, ErrorKind, Result};
pub use lsn::Lsn;
pub use value::{ObjectValue, Value, ValueKind};
