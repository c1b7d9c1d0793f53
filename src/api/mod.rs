pub mod client;
pub mod credentials;
pub mod settings;
pub mod snapshot;

pub use client::{QuerySnapshotHandler, SyncClient, WriteAcknowledgment};
pub use credentials::{
    CredentialsProvider, CredentialsProviderArc, EmptyCredentialsProvider,
    StaticCredentialsProvider, User, UserChangeListener,
};
pub use settings::{ClientSettings, DatabaseInfo};
pub use snapshot::{
    DocumentChange, DocumentChangeKind, DocumentSnapshot, QuerySnapshot, SnapshotMetadata,
};
