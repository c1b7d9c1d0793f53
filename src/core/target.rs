use crate::core::filter::Filter;
use crate::core::query::{Bound, OrderBy};
use crate::model::ResourcePath;

/// What the backend is asked to watch: a query stripped of client-only
/// concerns (limit direction). Targets with equal canonical ids share one
/// server-side listen.
#[derive(Clone, Debug)]
pub struct Target {
    pub path: ResourcePath,
    pub collection_group: Option<String>,
    pub order_by: Vec<OrderBy>,
    pub filters: Vec<Filter>,
    pub limit: Option<i32>,
    pub start_at: Option<Bound>,
    pub end_at: Option<Bound>,
}

impl Target {
    /// A target that watches exactly one document.
    pub fn is_document_target(&self) -> bool {
        self.path.is_document_path() && self.collection_group.is_none() && self.filters.is_empty()
    }

    pub fn canonical_id(&self) -> String {
        let mut id = self.path.canonical_string();
        if let Some(group) = &self.collection_group {
            id.push_str("|cg:");
            id.push_str(group);
        }
        id.push_str("|f:");
        let filters: Vec<String> = self.filters.iter().map(Filter::canonical_id).collect();
        id.push_str(&filters.join(","));
        id.push_str("|ob:");
        let order_bys: Vec<String> = self.order_by.iter().map(OrderBy::canonical_id).collect();
        id.push_str(&order_bys.join(","));
        if let Some(limit) = self.limit {
            id.push_str("|l:");
            id.push_str(&limit.to_string());
        }
        if let Some(bound) = &self.start_at {
            id.push_str("|lb:");
            id.push_str(&bound.canonical_id());
        }
        if let Some(bound) = &self.end_at {
            id.push_str("|ub:");
            id.push_str(&bound.canonical_id());
        }
        id
    }
}

impl PartialEq for Target {
    fn eq(&self, other: &Self) -> bool {
        self.canonical_id() == other.canonical_id()
    }
}

impl Eq for Target {}
