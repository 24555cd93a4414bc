mod disposition;
pub mod hash;
mod pipeline;
mod queue;

pub use disposition::{Disposition, DispositionError, Outcome, Placement};
pub use pipeline::{
    DEFAULT_MAX_FILE_BYTES, UploadCandidate, UploadConfig, UploadError, UploadPipeline,
    UploadReport,
};
