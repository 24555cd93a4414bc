pub mod daemon;
pub mod mirror;
pub mod sync;
pub mod upload;
