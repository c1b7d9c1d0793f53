use std::collections::BTreeMap;

use crate::model::{FieldMask, FieldPath};
use crate::value::{FieldValue, ValueKind};

/// Structured document data: a tree of named values. Field paths address
/// nested entries, with intermediate maps created or overwritten on write the
/// way a merge would.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct MapValue {
    fields: BTreeMap<String, FieldValue>,
}

impl MapValue {
    pub fn new(fields: BTreeMap<String, FieldValue>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    pub fn fields_mut(&mut self) -> &mut BTreeMap<String, FieldValue> {
        &mut self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    pub fn insert(&mut self, field: String, value: FieldValue) {
        self.fields.insert(field, value);
    }

    /// Reads the value at a (possibly nested) field path. Returns `None` when
    /// the path is empty, missing, or crosses a non-map value.
    pub fn field(&self, path: &FieldPath) -> Option<&FieldValue> {
        let (last, parents) = path.segments().split_last()?;
        let mut current = &self.fields;
        for segment in parents {
            match current.get(segment)?.kind() {
                ValueKind::Map(map) => current = map.fields(),
                _ => return None,
            }
        }
        current.get(last)
    }

    /// Writes `value` at `path`, creating intermediate maps and replacing any
    /// non-map value found along the way.
    pub fn set_field(&mut self, path: &FieldPath, value: FieldValue) {
        let Some((last, parents)) = path.segments().split_last() else {
            return;
        };
        let mut current = &mut self.fields;
        for segment in parents {
            let entry = current
                .entry(segment.clone())
                .or_insert_with(FieldValue::empty_map);
            if !matches!(entry.kind(), ValueKind::Map(_)) {
                *entry = FieldValue::empty_map();
            }
            let ValueKind::Map(map) = entry.kind_mut() else {
                return;
            };
            current = map.fields_mut();
        }
        current.insert(last.clone(), value);
    }

    /// Removes the value at `path`. A path through a missing or non-map
    /// parent is a no-op.
    pub fn delete_field(&mut self, path: &FieldPath) {
        let Some((last, parents)) = path.segments().split_last() else {
            return;
        };
        let mut current = &mut self.fields;
        for segment in parents {
            match current.get_mut(segment) {
                Some(entry) => match entry.kind_mut() {
                    ValueKind::Map(map) => current = map.fields_mut(),
                    _ => return,
                },
                None => return,
            }
        }
        current.remove(last);
    }

    /// The set of leaf field paths present in this map. An empty nested map
    /// counts as a leaf.
    pub fn field_mask(&self) -> FieldMask {
        fn collect(fields: &BTreeMap<String, FieldValue>, prefix: &FieldPath, out: &mut Vec<FieldPath>) {
            for (name, value) in fields {
                let current = prefix.child(name.clone());
                match value.kind() {
                    ValueKind::Map(map) if !map.is_empty() => collect(map.fields(), &current, out),
                    _ => out.push(current),
                }
            }
        }

        let mut paths = Vec::new();
        collect(&self.fields, &FieldPath::empty(), &mut paths);
        FieldMask::new(paths)
    }
}
