use crate::model::{BatchId, DocumentKey};
use crate::mutation::Mutation;

/// The net local effect of all queued batches on one document, condensed to a
/// single mutation. Reads apply the overlay instead of replaying the queue.
#[derive(Clone, Debug, PartialEq)]
pub struct Overlay {
    /// Newest batch contributing to this overlay; the overlay dies with it.
    pub largest_batch_id: BatchId,
    pub mutation: Mutation,
}

impl Overlay {
    pub fn new(largest_batch_id: BatchId, mutation: Mutation) -> Self {
        Self {
            largest_batch_id,
            mutation,
        }
    }

    pub fn key(&self) -> &DocumentKey {
        self.mutation.key()
    }
}
