//! Remote document store adapter for bizsync
//!
//! The sync engine never talks to a backend directly. It builds
//! [`RemoteWrite`]s against [`DocumentRef`]s and hands them to a
//! [`RemoteStore`], which commits them under a user's scope either one at a
//! time or as an atomic batch.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod memory;
pub mod store;
pub mod types;

pub use memory::{CommittedWrite, MemoryRemote};
#[cfg(any(test, feature = "mock"))]
pub use store::MockRemoteStore;
pub use store::{RemoteError, RemoteStore};
pub use types::{DocumentRef, RefError, RemoteWrite, ServerStamps, WriteKind};
