//! The physical storage backend contract behind a stream.

use flowgen_core::{Envelope, StreamError};

/// Append-only record storage with random-access reads by ordinal.
///
/// Implementations take `&self` and manage their own interior state so a
/// storage can be shared between a writer and a concurrently polling
/// reader.
pub trait RecordStorage: Send + Sync {
    /// Appends a batch of records.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Io`] on physical failure, or
    /// [`StreamError::Sealed`] if the backend refuses writes.
    fn append(&self, batch: &[Envelope]) -> Result<(), StreamError>;

    /// Reads up to `limit` records starting at logical ordinal
    /// `offset`. Returns fewer (possibly zero) records when the backend
    /// holds less data.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Io`] if the payload cannot be scanned.
    fn read(&self, offset: u64, limit: usize) -> Result<Vec<Envelope>, StreamError>;

    /// Total number of records ever appended.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Io`] if the payload cannot be scanned.
    fn len(&self) -> Result<u64, StreamError>;

    /// Returns `true` when no records are stored.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Io`] if the payload cannot be scanned.
    fn is_empty(&self) -> Result<bool, StreamError> {
        Ok(self.len()? == 0)
    }

    /// Deletes the payload and any seal marker.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Io`] on filesystem failure.
    fn clear(&self) -> Result<(), StreamError>;

    /// Records the durable seal marker. `record_count` is written into
    /// the marker for diagnostics.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Io`] on filesystem failure.
    fn seal(&self, record_count: u64) -> Result<(), StreamError>;

    /// Removes the seal marker.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Io`] on filesystem failure.
    fn unseal(&self) -> Result<(), StreamError>;

    /// Returns `true` when the seal marker is present.
    fn is_sealed(&self) -> bool;

    /// Tells the backend its reader is gone for good.
    ///
    /// Bounded backends unblock and fail pending appends so a producer
    /// can never wedge on a consumer that exited. The default is a
    /// no-op.
    fn abandon(&self) {}
}
