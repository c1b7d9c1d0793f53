use crate::model::{DocumentKey, FieldMask, FieldPath, MutableDocument, SnapshotVersion, Timestamp};
use crate::mutation::FieldTransform;
use crate::value::{FieldValue, MapValue};

/// Guard a mutation places on the document state it applies to. The backend
/// rejects the mutation when the guard fails; locally a failed guard makes
/// the mutation a no-op.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Precondition {
    update_time: Option<SnapshotVersion>,
    exists: Option<bool>,
}

impl Precondition {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn exists(exists: bool) -> Self {
        Self {
            update_time: None,
            exists: Some(exists),
        }
    }

    pub fn update_time(version: SnapshotVersion) -> Self {
        Self {
            update_time: Some(version),
            exists: None,
        }
    }

    pub fn is_none(&self) -> bool {
        self.update_time.is_none() && self.exists.is_none()
    }

    pub fn update_time_value(&self) -> Option<SnapshotVersion> {
        self.update_time
    }

    pub fn exists_value(&self) -> Option<bool> {
        self.exists
    }

    pub fn is_valid_for_document(&self, document: &MutableDocument) -> bool {
        if let Some(update_time) = self.update_time {
            return document.is_found_document() && document.version() == update_time;
        }
        if let Some(exists) = self.exists {
            return exists == document.is_found_document();
        }
        true
    }
}

/// One entry of a commit response: the version the write landed at plus the
/// server-evaluated transform values, aligned with the mutation's transforms.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationResult {
    pub version: SnapshotVersion,
    pub transform_results: Vec<FieldValue>,
}

impl MutationResult {
    pub fn new(version: SnapshotVersion, transform_results: Vec<FieldValue>) -> Self {
        Self {
            version,
            transform_results,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SetMutation {
    pub key: DocumentKey,
    pub value: MapValue,
    pub precondition: Precondition,
    pub field_transforms: Vec<FieldTransform>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PatchMutation {
    pub key: DocumentKey,
    pub data: MapValue,
    pub field_mask: FieldMask,
    pub precondition: Precondition,
    pub field_transforms: Vec<FieldTransform>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DeleteMutation {
    pub key: DocumentKey,
    pub precondition: Precondition,
}

#[derive(Clone, Debug, PartialEq)]
pub struct VerifyMutation {
    pub key: DocumentKey,
    pub precondition: Precondition,
}

/// A single write. `Set` replaces the document, `Patch` merges masked fields,
/// `Delete` removes the document and `Verify` only asserts a precondition.
#[derive(Clone, Debug, PartialEq)]
pub enum Mutation {
    Set(SetMutation),
    Patch(PatchMutation),
    Delete(DeleteMutation),
    Verify(VerifyMutation),
}

impl Mutation {
    pub fn set(key: DocumentKey, value: MapValue) -> Self {
        Mutation::Set(SetMutation {
            key,
            value,
            precondition: Precondition::none(),
            field_transforms: Vec::new(),
        })
    }

    /// Patches default to requiring the document to exist, matching update
    /// semantics.
    pub fn patch(key: DocumentKey, data: MapValue, field_mask: FieldMask) -> Self {
        Mutation::Patch(PatchMutation {
            key,
            data,
            field_mask,
            precondition: Precondition::exists(true),
            field_transforms: Vec::new(),
        })
    }

    pub fn delete(key: DocumentKey) -> Self {
        Mutation::Delete(DeleteMutation {
            key,
            precondition: Precondition::none(),
        })
    }

    pub fn verify(key: DocumentKey, precondition: Precondition) -> Self {
        Mutation::Verify(VerifyMutation { key, precondition })
    }

    pub fn with_precondition(mut self, precondition: Precondition) -> Self {
        match &mut self {
            Mutation::Set(m) => m.precondition = precondition,
            Mutation::Patch(m) => m.precondition = precondition,
            Mutation::Delete(m) => m.precondition = precondition,
            Mutation::Verify(m) => m.precondition = precondition,
        }
        self
    }

    /// Attaches field transforms; ignored on deletes and verifies.
    pub fn with_field_transforms(mut self, transforms: Vec<FieldTransform>) -> Self {
        match &mut self {
            Mutation::Set(m) => m.field_transforms = transforms,
            Mutation::Patch(m) => m.field_transforms = transforms,
            Mutation::Delete(_) | Mutation::Verify(_) => {}
        }
        self
    }

    pub fn key(&self) -> &DocumentKey {
        match self {
            Mutation::Set(m) => &m.key,
            Mutation::Patch(m) => &m.key,
            Mutation::Delete(m) => &m.key,
            Mutation::Verify(m) => &m.key,
        }
    }

    pub fn precondition(&self) -> &Precondition {
        match self {
            Mutation::Set(m) => &m.precondition,
            Mutation::Patch(m) => &m.precondition,
            Mutation::Delete(m) => &m.precondition,
            Mutation::Verify(m) => &m.precondition,
        }
    }

    pub fn field_transforms(&self) -> &[FieldTransform] {
        match self {
            Mutation::Set(m) => &m.field_transforms,
            Mutation::Patch(m) => &m.field_transforms,
            Mutation::Delete(_) | Mutation::Verify(_) => &[],
        }
    }

    /// The fields this mutation touches, or `None` when it replaces the whole
    /// document.
    pub fn field_mask(&self) -> Option<&FieldMask> {
        match self {
            Mutation::Patch(m) => Some(&m.field_mask),
            _ => None,
        }
    }

    /// Applies an acknowledged mutation to the cached document. The backend
    /// accepted the write, so preconditions are known to have held there;
    /// a locally failing precondition means the cached document is stale and
    /// its post-write state is unknown.
    pub fn apply_to_remote_document(&self, document: &mut MutableDocument, result: &MutationResult) {
        match self {
            Mutation::Set(m) => {
                let transform_results =
                    server_transform_results(&m.field_transforms, document, &result.transform_results);
                let mut new_data = m.value.clone();
                set_all(&mut new_data, transform_results);
                document.convert_to_found_document(result.version, new_data);
                document.set_has_committed_mutations();
            }
            Mutation::Patch(m) => {
                if !m.precondition.is_valid_for_document(document) {
                    document.convert_to_unknown_document(result.version);
                    return;
                }
                let transform_results =
                    server_transform_results(&m.field_transforms, document, &result.transform_results);
                let mut new_data = document.data().clone();
                apply_patch(&mut new_data, m);
                set_all(&mut new_data, transform_results);
                document.convert_to_found_document(result.version, new_data);
                document.set_has_committed_mutations();
            }
            Mutation::Delete(_) => {
                document.convert_to_no_document(result.version);
                document.set_has_committed_mutations();
            }
            Mutation::Verify(_) => {}
        }
    }

    /// Applies this mutation to the local view of the document.
    ///
    /// Returns the accumulated set of fields with pending local changes:
    /// `None` means "all fields" (the document was wholly replaced or
    /// deleted), which downstream overlay computation turns into a set or
    /// delete overlay instead of a patch.
    pub fn apply_to_local_view(
        &self,
        document: &mut MutableDocument,
        previous_mask: Option<FieldMask>,
        local_write_time: Timestamp,
    ) -> Option<FieldMask> {
        if !self.precondition().is_valid_for_document(document) {
            return previous_mask;
        }
        match self {
            Mutation::Set(m) => {
                let transform_results =
                    local_transform_results(&m.field_transforms, local_write_time, document);
                let mut new_data = m.value.clone();
                set_all(&mut new_data, transform_results);
                let version = document.version();
                document.convert_to_found_document(version, new_data);
                document.set_has_local_mutations();
                None
            }
            Mutation::Patch(m) => {
                let transform_results =
                    local_transform_results(&m.field_transforms, local_write_time, document);
                let mut new_data = document.data().clone();
                apply_patch(&mut new_data, m);
                set_all(&mut new_data, transform_results);
                let version = document.version();
                document.convert_to_found_document(version, new_data);
                document.set_has_local_mutations();
                previous_mask.map(|mask| {
                    let mut mask = mask.union_with(&m.field_mask);
                    for transform in &m.field_transforms {
                        mask.insert(transform.field.clone());
                    }
                    mask
                })
            }
            Mutation::Delete(_) => {
                let version = document.version();
                document.convert_to_no_document(version);
                document.set_has_local_mutations();
                None
            }
            Mutation::Verify(_) => previous_mask,
        }
    }

    /// Pins starting values for non-idempotent transforms; `None` when this
    /// mutation can be replayed against any document state.
    pub fn extract_base_value(&self, document: &MutableDocument) -> Option<MapValue> {
        let mut base: Option<MapValue> = None;
        for transform in self.field_transforms() {
            let existing = document.data().field(&transform.field);
            if let Some(coerced) = transform.operation.compute_base_value(existing) {
                base.get_or_insert_with(MapValue::empty)
                    .set_field(&transform.field, coerced);
            }
        }
        base
    }
}

/// Reduces a mutated document to a single equivalent mutation.
///
/// `mask` carries the fields with pending local changes; `None` requests a
/// whole-document overlay. An empty mask or an unmutated document produces no
/// overlay at all.
pub fn calculate_overlay_mutation(
    document: &MutableDocument,
    mask: Option<&FieldMask>,
) -> Option<Mutation> {
    if !document.has_local_mutations() {
        return None;
    }
    match mask {
        None => {
            if document.is_no_document() {
                Some(Mutation::delete(document.key().clone()))
            } else {
                Some(
                    Mutation::set(document.key().clone(), document.data().clone())
                        .with_precondition(Precondition::none()),
                )
            }
        }
        Some(mask) if mask.is_empty() => None,
        Some(mask) => {
            let mut patch_value = MapValue::empty();
            let mut patch_mask = FieldMask::empty();
            for path in mask.fields() {
                if patch_mask.covers(path) {
                    continue;
                }
                let mut path = path.clone();
                let mut value = document.data().field(&path);
                if value.is_none() && path.len() > 1 {
                    // A deleted nested field patches at its immediate parent.
                    path = path.without_last();
                    value = document.data().field(&path);
                }
                if let Some(value) = value {
                    patch_value.set_field(&path, value.clone());
                }
                patch_mask.insert(path);
            }
            Some(Mutation::Patch(PatchMutation {
                key: document.key().clone(),
                data: patch_value,
                field_mask: patch_mask,
                precondition: Precondition::none(),
                field_transforms: Vec::new(),
            }))
        }
    }
}

fn apply_patch(data: &mut MapValue, mutation: &PatchMutation) {
    for path in mutation.field_mask.fields() {
        if path.is_empty() {
            continue;
        }
        match mutation.data.field(path) {
            Some(value) => data.set_field(path, value.clone()),
            None => data.delete_field(path),
        }
    }
}

fn set_all(data: &mut MapValue, entries: Vec<(FieldPath, FieldValue)>) {
    for (path, value) in entries {
        data.set_field(&path, value);
    }
}

fn local_transform_results(
    transforms: &[FieldTransform],
    local_write_time: Timestamp,
    document: &MutableDocument,
) -> Vec<(FieldPath, FieldValue)> {
    transforms
        .iter()
        .map(|transform| {
            let previous = document.data().field(&transform.field);
            (
                transform.field.clone(),
                transform.operation.apply_to_local_view(previous, local_write_time),
            )
        })
        .collect()
}

fn server_transform_results(
    transforms: &[FieldTransform],
    document: &MutableDocument,
    results: &[FieldValue],
) -> Vec<(FieldPath, FieldValue)> {
    transforms
        .iter()
        .enumerate()
        .map(|(index, transform)| {
            let previous = document.data().field(&transform.field);
            let server_value = results.get(index).cloned().unwrap_or_else(FieldValue::null);
            (
                transform.field.clone(),
                transform
                    .operation
                    .apply_to_remote_document(previous, server_value),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Timestamp;
    use crate::mutation::TransformOperation;

    fn key() -> DocumentKey {
        DocumentKey::from_string("rooms/alpha").unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    fn data(entries: &[(&str, FieldValue)]) -> MapValue {
        let mut map = MapValue::empty();
        for (name, value) in entries {
            map.set_field(&field(name), value.clone());
        }
        map
    }

    #[test]
    fn set_replaces_document_locally() {
        let mut doc = MutableDocument::new_found_document(
            key(),
            version(3),
            version(1),
            data(&[("old", FieldValue::from_integer(1))]),
        );
        let mutation = Mutation::set(key(), data(&[("new", FieldValue::from_integer(2))]));
        let mask = mutation.apply_to_local_view(&mut doc, Some(FieldMask::empty()), Timestamp::new(4, 0));

        assert!(mask.is_none());
        assert!(doc.has_local_mutations());
        assert!(doc.data().field(&field("old")).is_none());
        assert_eq!(
            doc.data().field(&field("new")),
            Some(&FieldValue::from_integer(2))
        );
    }

    #[test]
    fn patch_merges_and_deletes_masked_fields() {
        let mut doc = MutableDocument::new_found_document(
            key(),
            version(3),
            version(1),
            data(&[
                ("keep", FieldValue::from_integer(1)),
                ("drop", FieldValue::from_integer(2)),
                ("change", FieldValue::from_integer(3)),
            ]),
        );
        let mutation = Mutation::patch(
            key(),
            data(&[("change", FieldValue::from_integer(30))]),
            FieldMask::new(vec![field("change"), field("drop")]),
        );
        let mask =
            mutation.apply_to_local_view(&mut doc, Some(FieldMask::empty()), Timestamp::new(4, 0));

        assert_eq!(
            doc.data().field(&field("keep")),
            Some(&FieldValue::from_integer(1))
        );
        assert!(doc.data().field(&field("drop")).is_none());
        assert_eq!(
            doc.data().field(&field("change")),
            Some(&FieldValue::from_integer(30))
        );
        let mask = mask.unwrap();
        assert!(mask.covers(&field("change")));
        assert!(mask.covers(&field("drop")));
    }

    #[test]
    fn patch_on_missing_document_is_a_noop() {
        let mut doc = MutableDocument::new_no_document(key(), version(3));
        let mutation = Mutation::patch(
            key(),
            data(&[("a", FieldValue::from_integer(1))]),
            FieldMask::new(vec![field("a")]),
        );
        let mask = mutation.apply_to_local_view(&mut doc, Some(FieldMask::empty()), Timestamp::new(4, 0));

        assert!(doc.is_no_document());
        assert!(!doc.has_local_mutations());
        assert_eq!(mask, Some(FieldMask::empty()));
    }

    #[test]
    fn delete_produces_local_tombstone() {
        let mut doc = MutableDocument::new_found_document(
            key(),
            version(3),
            version(1),
            data(&[("a", FieldValue::from_integer(1))]),
        );
        let mask = Mutation::delete(key()).apply_to_local_view(&mut doc, None, Timestamp::new(4, 0));
        assert!(mask.is_none());
        assert!(doc.is_no_document());
        assert!(doc.has_local_mutations());
    }

    #[test]
    fn acknowledged_set_becomes_committed() {
        let mut doc = MutableDocument::new_invalid(key());
        let mutation = Mutation::set(key(), data(&[("a", FieldValue::from_integer(1))]));
        mutation.apply_to_remote_document(
            &mut doc,
            &MutationResult::new(version(9), Vec::new()),
        );

        assert!(doc.is_found_document());
        assert!(doc.has_committed_mutations());
        assert_eq!(doc.version(), version(9));
    }

    #[test]
    fn acknowledged_patch_with_stale_cache_yields_unknown_document() {
        let mut doc = MutableDocument::new_no_document(key(), version(3));
        let mutation = Mutation::patch(
            key(),
            data(&[("a", FieldValue::from_integer(1))]),
            FieldMask::new(vec![field("a")]),
        );
        mutation.apply_to_remote_document(&mut doc, &MutationResult::new(version(9), Vec::new()));

        assert!(doc.is_unknown_document());
        assert_eq!(doc.version(), version(9));
    }

    #[test]
    fn transform_results_apply_on_ack() {
        let mut doc = MutableDocument::new_found_document(
            key(),
            version(3),
            version(1),
            data(&[("count", FieldValue::from_integer(1))]),
        );
        let mutation = Mutation::patch(
            key(),
            MapValue::empty(),
            FieldMask::empty(),
        )
        .with_field_transforms(vec![FieldTransform::new(
            field("count"),
            TransformOperation::NumericIncrement(FieldValue::from_integer(2)),
        )]);
        mutation.apply_to_remote_document(
            &mut doc,
            &MutationResult::new(version(9), vec![FieldValue::from_integer(3)]),
        );

        assert_eq!(
            doc.data().field(&field("count")),
            Some(&FieldValue::from_integer(3))
        );
    }

    #[test]
    fn base_values_pin_increment_starting_points() {
        let doc = MutableDocument::new_found_document(
            key(),
            version(3),
            version(1),
            data(&[("count", FieldValue::from_integer(5))]),
        );
        let mutation = Mutation::patch(key(), MapValue::empty(), FieldMask::empty())
            .with_field_transforms(vec![
                FieldTransform::new(
                    field("count"),
                    TransformOperation::NumericIncrement(FieldValue::from_integer(1)),
                ),
                FieldTransform::new(field("stamp"), TransformOperation::ServerTimestamp),
            ]);
        let base = mutation.extract_base_value(&doc).unwrap();
        assert_eq!(
            base.field(&field("count")),
            Some(&FieldValue::from_integer(5))
        );
        assert!(base.field(&field("stamp")).is_none());
    }

    #[test]
    fn overlay_for_replaced_document_is_a_set() {
        let mut doc = MutableDocument::new_invalid(key());
        Mutation::set(key(), data(&[("a", FieldValue::from_integer(1))])).apply_to_local_view(
            &mut doc,
            Some(FieldMask::empty()),
            Timestamp::new(4, 0),
        );
        let overlay = calculate_overlay_mutation(&doc, None).unwrap();
        assert!(matches!(overlay, Mutation::Set(_)));
    }

    #[test]
    fn overlay_for_masked_changes_is_a_patch_with_parent_promotion() {
        let mut doc = MutableDocument::new_found_document(
            key(),
            version(3),
            version(1),
            data(&[("nested.kept", FieldValue::from_integer(1))]),
        );
        // Deleting nested.gone leaves no value at that path; the overlay
        // patches the parent map instead.
        let mutation = Mutation::patch(
            key(),
            MapValue::empty(),
            FieldMask::new(vec![field("nested.gone")]),
        );
        let mask = mutation.apply_to_local_view(&mut doc, Some(FieldMask::empty()), Timestamp::new(4, 0));
        let overlay = calculate_overlay_mutation(&doc, mask.as_ref()).unwrap();

        match overlay {
            Mutation::Patch(patch) => {
                assert!(patch.field_mask.covers(&field("nested"))
                    || patch.field_mask.covers(&field("nested.gone")));
            }
            other => panic!("expected patch overlay, got {:?}", other),
        }
    }

    #[test]
    fn no_overlay_for_clean_document() {
        let doc = MutableDocument::new_found_document(key(), version(3), version(1), MapValue::empty());
        assert!(calculate_overlay_mutation(&doc, None).is_none());
    }
}
