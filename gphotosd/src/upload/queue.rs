use std::collections::VecDeque;

use super::pipeline::UploadCandidate;

/// FIFO of candidates shared by the upload workers.
#[derive(Debug, Default)]
pub struct CandidateQueue {
    inner: VecDeque<UploadCandidate>,
}

impl CandidateQueue {
    pub fn dequeue(&mut self) -> Option<UploadCandidate> {
        self.inner.pop_front()
    }

    /// Empties the queue, returning what was never handed to a worker.
    pub fn drain(&mut self) -> Vec<UploadCandidate> {
        self.inner.drain(..).collect()
    }
}

impl FromIterator<UploadCandidate> for CandidateQueue {
    fn from_iter<I: IntoIterator<Item = UploadCandidate>>(iter: I) -> Self {
        Self {
            inner: iter.into_iter().collect(),
        }
    }
}
