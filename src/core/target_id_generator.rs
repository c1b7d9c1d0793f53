use crate::model::TargetId;

/// Hands out target ids for one of the two independent id spaces: even ids
/// for query targets allocated by the target cache, odd ids for limbo-document
/// targets allocated by the sync engine. Keeping the spaces disjoint lets
/// either side allocate without coordination.
#[derive(Debug)]
pub struct TargetIdGenerator {
    last_id: TargetId,
}

impl TargetIdGenerator {
    /// First id handed out is 2: the wire protocol cannot distinguish target
    /// id 0 from "unset".
    pub fn for_target_cache() -> Self {
        Self { last_id: 0 }
    }

    pub fn for_sync_engine() -> Self {
        Self { last_id: -1 }
    }

    /// Resumes the even sequence after the given already-used id.
    pub fn after(last_id: TargetId) -> Self {
        Self { last_id }
    }

    pub fn next(&mut self) -> TargetId {
        self.last_id += 2;
        self.last_id
    }
}
