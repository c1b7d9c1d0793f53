use std::fmt;

use crate::model::{DocumentKey, SnapshotVersion};
use crate::value::MapValue;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DocumentType {
    /// Nothing is known about the document; it carries no data or version.
    Invalid,
    FoundDocument,
    NoDocument,
    /// A document whose mutations were acknowledged but whose resulting state
    /// has not been observed yet.
    UnknownDocument,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DocumentState {
    /// Matches the last state received from the backend.
    Synced,
    /// Mutations were acknowledged but the watch stream has not caught up.
    HasCommittedMutations,
    /// Local mutations are applied on top of the backend state.
    HasLocalMutations,
}

/// A document in the local cache, together with everything the engine knows
/// about it: whether it exists, at which version, and whether local or
/// committed-but-unobserved mutations affect it.
#[derive(Clone, Debug, PartialEq)]
pub struct MutableDocument {
    key: DocumentKey,
    document_type: DocumentType,
    version: SnapshotVersion,
    read_time: SnapshotVersion,
    create_time: SnapshotVersion,
    data: MapValue,
    document_state: DocumentState,
}

impl MutableDocument {
    /// A document for which no state is known. Used as the placeholder before
    /// cache lookups or watch results fill in real state.
    pub fn new_invalid(key: DocumentKey) -> Self {
        Self {
            key,
            document_type: DocumentType::Invalid,
            version: SnapshotVersion::MIN,
            read_time: SnapshotVersion::MIN,
            create_time: SnapshotVersion::MIN,
            data: MapValue::empty(),
            document_state: DocumentState::Synced,
        }
    }

    pub fn new_found_document(
        key: DocumentKey,
        version: SnapshotVersion,
        create_time: SnapshotVersion,
        data: MapValue,
    ) -> Self {
        Self {
            key,
            document_type: DocumentType::FoundDocument,
            version,
            read_time: SnapshotVersion::MIN,
            create_time,
            data,
            document_state: DocumentState::Synced,
        }
    }

    pub fn new_no_document(key: DocumentKey, version: SnapshotVersion) -> Self {
        Self {
            key,
            document_type: DocumentType::NoDocument,
            version,
            read_time: SnapshotVersion::MIN,
            create_time: SnapshotVersion::MIN,
            data: MapValue::empty(),
            document_state: DocumentState::Synced,
        }
    }

    pub fn new_unknown_document(key: DocumentKey, version: SnapshotVersion) -> Self {
        Self {
            key,
            document_type: DocumentType::UnknownDocument,
            version,
            read_time: SnapshotVersion::MIN,
            create_time: SnapshotVersion::MIN,
            data: MapValue::empty(),
            document_state: DocumentState::HasCommittedMutations,
        }
    }

    /// Changes the document into an existing document at `version`. When the
    /// document transitions from missing or invalid to found, the version is
    /// the best available guess for its create time.
    pub fn convert_to_found_document(&mut self, version: SnapshotVersion, data: MapValue) {
        if self.create_time.is_min()
            && matches!(
                self.document_type,
                DocumentType::NoDocument | DocumentType::Invalid
            )
        {
            self.create_time = version;
        }
        self.version = version;
        self.document_type = DocumentType::FoundDocument;
        self.data = data;
        self.document_state = DocumentState::Synced;
    }

    pub fn convert_to_no_document(&mut self, version: SnapshotVersion) {
        self.version = version;
        self.document_type = DocumentType::NoDocument;
        self.data = MapValue::empty();
        self.document_state = DocumentState::Synced;
    }

    pub fn convert_to_unknown_document(&mut self, version: SnapshotVersion) {
        self.version = version;
        self.document_type = DocumentType::UnknownDocument;
        self.data = MapValue::empty();
        self.document_state = DocumentState::HasCommittedMutations;
    }

    pub fn set_has_committed_mutations(&mut self) {
        self.document_state = DocumentState::HasCommittedMutations;
    }

    /// Local mutations hide the backend version: the effective version is
    /// unknown until the write is acknowledged.
    pub fn set_has_local_mutations(&mut self) {
        self.document_state = DocumentState::HasLocalMutations;
        self.version = SnapshotVersion::MIN;
    }

    pub fn set_read_time(&mut self, read_time: SnapshotVersion) {
        self.read_time = read_time;
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    pub fn read_time(&self) -> SnapshotVersion {
        self.read_time
    }

    pub fn create_time(&self) -> SnapshotVersion {
        self.create_time
    }

    pub fn data(&self) -> &MapValue {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut MapValue {
        &mut self.data
    }

    pub fn is_valid_document(&self) -> bool {
        self.document_type != DocumentType::Invalid
    }

    pub fn is_found_document(&self) -> bool {
        self.document_type == DocumentType::FoundDocument
    }

    pub fn is_no_document(&self) -> bool {
        self.document_type == DocumentType::NoDocument
    }

    pub fn is_unknown_document(&self) -> bool {
        self.document_type == DocumentType::UnknownDocument
    }

    pub fn has_local_mutations(&self) -> bool {
        self.document_state == DocumentState::HasLocalMutations
    }

    pub fn has_committed_mutations(&self) -> bool {
        self.document_state == DocumentState::HasCommittedMutations
    }

    pub fn has_pending_writes(&self) -> bool {
        self.has_local_mutations() || self.has_committed_mutations()
    }
}

impl fmt::Display for MutableDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Document({}, {:?}, version={:?}, state={:?})",
            self.key, self.document_type, self.version, self.document_state
        )
    }
}
