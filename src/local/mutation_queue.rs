use crate::error::{internal_error, SyncResult};
use crate::model::{BatchId, DocumentKey, DocumentKeySet, Timestamp};
use crate::mutation::{Mutation, MutationBatch, BATCH_ID_UNKNOWN};

/// Ordered queue of mutation batches for a single user, kept until the batch
/// is acknowledged or rejected by the backend.
///
/// Batch ids are assigned in strictly increasing order and batches are removed
/// from the front only, so the queue always holds a contiguous run of
/// unacknowledged writes.
pub trait MutationQueue: Send {
    fn is_empty(&self) -> bool;

    /// Creates a batch with the next batch id and appends it to the queue.
    fn add_mutation_batch(
        &mut self,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> MutationBatch;

    fn lookup_mutation_batch(&self, batch_id: BatchId) -> Option<MutationBatch>;

    /// The first batch with an id strictly greater than `batch_id`. Passing
    /// [`BATCH_ID_UNKNOWN`] returns the front of the queue.
    fn next_mutation_batch_after_batch_id(&self, batch_id: BatchId) -> Option<MutationBatch>;

    /// The id of the most recently enqueued batch, or [`BATCH_ID_UNKNOWN`]
    /// when the queue is empty.
    fn highest_unacknowledged_batch_id(&self) -> BatchId;

    fn all_mutation_batches(&self) -> Vec<MutationBatch>;

    fn all_mutation_batches_affecting_document_key(&self, key: &DocumentKey)
        -> Vec<MutationBatch>;

    /// All batches touching any of `keys`, in batch id order, each batch
    /// listed once.
    fn all_mutation_batches_affecting_document_keys(
        &self,
        keys: &DocumentKeySet,
    ) -> Vec<MutationBatch>;

    /// Removes an acknowledged or rejected batch. Batches resolve in FIFO
    /// order, so `batch_id` must be the front of the queue.
    fn remove_mutation_batch(&mut self, batch_id: BatchId) -> SyncResult<()>;

    /// Whether any queued batch mutates `key`.
    fn contains_key(&self, key: &DocumentKey) -> bool;
}

pub struct MemoryMutationQueue {
    batches: Vec<MutationBatch>,
    next_batch_id: BatchId,
}

impl MemoryMutationQueue {
    pub fn new() -> Self {
        Self {
            batches: Vec::new(),
            next_batch_id: 1,
        }
    }

    fn index_of(&self, batch_id: BatchId) -> Option<usize> {
        self.batches
            .binary_search_by_key(&batch_id, |batch| batch.batch_id)
            .ok()
    }
}

impl Default for MemoryMutationQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MutationQueue for MemoryMutationQueue {
    fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    fn add_mutation_batch(
        &mut self,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> MutationBatch {
        let batch = MutationBatch {
            batch_id: self.next_batch_id,
            local_write_time,
            base_mutations,
            mutations,
        };
        self.next_batch_id += 1;
        self.batches.push(batch.clone());
        batch
    }

    fn lookup_mutation_batch(&self, batch_id: BatchId) -> Option<MutationBatch> {
        self.index_of(batch_id).map(|index| self.batches[index].clone())
    }

    fn next_mutation_batch_after_batch_id(&self, batch_id: BatchId) -> Option<MutationBatch> {
        let index = match self
            .batches
            .binary_search_by_key(&batch_id, |batch| batch.batch_id)
        {
            Ok(index) => index + 1,
            Err(index) => index,
        };
        self.batches.get(index).cloned()
    }

    fn highest_unacknowledged_batch_id(&self) -> BatchId {
        self.batches
            .last()
            .map(|batch| batch.batch_id)
            .unwrap_or(BATCH_ID_UNKNOWN)
    }

    fn all_mutation_batches(&self) -> Vec<MutationBatch> {
        self.batches.clone()
    }

    fn all_mutation_batches_affecting_document_key(
        &self,
        key: &DocumentKey,
    ) -> Vec<MutationBatch> {
        self.batches
            .iter()
            .filter(|batch| batch.mutations.iter().any(|m| m.key() == key))
            .cloned()
            .collect()
    }

    fn all_mutation_batches_affecting_document_keys(
        &self,
        keys: &DocumentKeySet,
    ) -> Vec<MutationBatch> {
        self.batches
            .iter()
            .filter(|batch| batch.mutations.iter().any(|m| keys.contains(m.key())))
            .cloned()
            .collect()
    }

    fn remove_mutation_batch(&mut self, batch_id: BatchId) -> SyncResult<()> {
        let Some(index) = self.index_of(batch_id) else {
            return Err(internal_error(format!(
                "Mutation batch {batch_id} not found in queue"
            )));
        };
        if index != 0 {
            return Err(internal_error(
                "Can only remove the front batch of the mutation queue",
            ));
        }
        self.batches.remove(0);
        Ok(())
    }

    fn contains_key(&self, key: &DocumentKey) -> bool {
        self.batches
            .iter()
            .any(|batch| batch.mutations.iter().any(|m| m.key() == key))
    }
}
