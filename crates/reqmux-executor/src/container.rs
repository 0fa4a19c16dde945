//! Unit of work carried through the submission queue.

use reqmux_core::completion::CompletionSlot;
use reqmux_core::request::{RequestData, RequestId, Response};

/// A submitted request paired with the slot its result goes to.
///
/// Built by `Processor::submit`, moved into the queue, consumed once by the
/// worker.
#[derive(Debug)]
pub struct RequestContainer {
    pub id: RequestId,
    pub request: RequestData,
    pub completion: CompletionSlot<Response>,
}

impl RequestContainer {
    pub fn new(id: RequestId, request: RequestData, completion: CompletionSlot<Response>) -> Self {
        Self {
            id,
            request,
            completion,
        }
    }
}
