mod auth;
mod client;
pub mod delta;
mod media;
mod retry;

pub use auth::{AuthError, TokenClient};
pub use client::{
    ApiErrorClass, CommitRequest, DEDUP_BATCH_SIZE, PhotosClient, PhotosError, UploadReceipt,
};
pub use delta::DeltaPage;
pub use media::{
    ContentHash, HashFormatError, MediaRecord, MediaType, SHA1_LEN, UnknownProfile, UploadProfile,
    dedup_key_from_bytes,
};
pub use retry::{RetryDecision, RetryPolicy};
