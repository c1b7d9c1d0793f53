mod batch;
mod mutation;
mod overlay;
mod transform_operation;

pub use batch::{MutationBatch, MutationBatchResult, OverlayedDocument, BATCH_ID_UNKNOWN};
pub use mutation::{
    calculate_overlay_mutation, DeleteMutation, Mutation, MutationResult, PatchMutation,
    Precondition, SetMutation, VerifyMutation,
};
pub use overlay::Overlay;
pub use transform_operation::{FieldTransform, TransformOperation};
