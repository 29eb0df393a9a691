use gavel_store::StoreError;
use thiserror::Error;

/// Errors that can occur in the memory store.
///
/// The in-process backend has no transport, so none of the store
/// operations can currently fail; the type exists to satisfy the store
/// traits' error contracts.
#[derive(Debug, Error)]
pub enum Error {}

impl StoreError for Error {}
