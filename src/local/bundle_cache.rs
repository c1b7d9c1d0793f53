use std::collections::HashMap;

use crate::core::Query;
use crate::model::SnapshotVersion;

/// Header of a data bundle the client has loaded.
#[derive(Clone, Debug, PartialEq)]
pub struct BundleMetadata {
    pub bundle_id: String,
    pub create_time: SnapshotVersion,
    pub version: u32,
}

/// A query published under a well-known name, with the snapshot version its
/// bundled results were read at. The read time seeds target resumption so a
/// listen on the named query avoids re-downloading bundled state.
#[derive(Clone, Debug, PartialEq)]
pub struct NamedQuery {
    pub name: String,
    pub query: Query,
    pub read_time: SnapshotVersion,
}

pub trait BundleCache: Send {
    fn get_bundle_metadata(&self, bundle_id: &str) -> Option<BundleMetadata>;

    fn save_bundle_metadata(&mut self, metadata: BundleMetadata);

    fn get_named_query(&self, name: &str) -> Option<NamedQuery>;

    fn save_named_query(&mut self, named_query: NamedQuery);
}

#[derive(Default)]
pub struct MemoryBundleCache {
    bundles: HashMap<String, BundleMetadata>,
    named_queries: HashMap<String, NamedQuery>,
}

impl MemoryBundleCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BundleCache for MemoryBundleCache {
    fn get_bundle_metadata(&self, bundle_id: &str) -> Option<BundleMetadata> {
        self.bundles.get(bundle_id).cloned()
    }

    fn save_bundle_metadata(&mut self, metadata: BundleMetadata) {
        self.bundles.insert(metadata.bundle_id.clone(), metadata);
    }

    fn get_named_query(&self, name: &str) -> Option<NamedQuery> {
        self.named_queries.get(name).cloned()
    }

    fn save_named_query(&mut self, named_query: NamedQuery) {
        self.named_queries.insert(named_query.name.clone(), named_query);
    }
}
