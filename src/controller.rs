//! Record Access Control Point state machine.
//!
//! Pure and synchronous: the engine feeds it parsed responses and the current
//! store high-water mark, and it answers with the next command to write or
//! the terminal status of the retrieval. Pagination is entirely
//! response-driven; every next page is requested as "everything at or after
//! the highest sequence number already stored, plus one", which makes a
//! resumed or repeated transfer idempotent.

use log::debug;

use crate::error::SessionError;
use crate::models::{RequestStatus, RetrievalRequest};
use crate::wire::racp::{
    abort_operation, report_number_of_stored_records, report_stored_records, OpCode, RacpFilter,
    RacpResponse, ResponseCode,
};

/// What the engine must do after feeding a response to the controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    /// Write these bytes to the control point and await the next indication.
    Send(Vec<u8>),
    /// The retrieval reached this terminal status.
    Complete(RequestStatus),
    /// The response does not belong to an active retrieval; drop it.
    Ignore,
}

#[derive(Clone, Copy, Debug)]
struct ActiveRetrieval {
    request: RetrievalRequest,
    /// Store high-water mark when the current report page was requested.
    /// A page completion that did not move it means the transfer is done.
    page_baseline: Option<u16>,
}

pub struct RacpController {
    status: RequestStatus,
    active: Option<ActiveRetrieval>,
    e2e: bool,
}

impl RacpController {
    pub fn new(e2e: bool) -> Self {
        Self {
            status: RequestStatus::Idle,
            active: None,
            e2e,
        }
    }

    pub fn status(&self) -> RequestStatus {
        self.status
    }

    pub fn is_pending(&self) -> bool {
        self.status == RequestStatus::Pending
    }

    /// Start a retrieval. At most one may be pending; the caller clears the
    /// record store in the same dispatch step, before the returned command is
    /// written.
    pub fn begin(&mut self, request: RetrievalRequest) -> Result<Vec<u8>, SessionError> {
        if self.is_pending() {
            return Err(SessionError::OperationInProgress);
        }
        self.status = RequestStatus::Pending;
        self.active = Some(ActiveRetrieval {
            request,
            page_baseline: None,
        });
        let bytes = match request {
            RetrievalRequest::All => {
                report_number_of_stored_records(RacpFilter::AllRecords, self.e2e)
            }
            RetrievalRequest::GreaterOrEqual(seq) => {
                report_number_of_stored_records(RacpFilter::GreaterOrEqual(seq), self.e2e)
            }
            RetrievalRequest::First => report_stored_records(RacpFilter::First, self.e2e),
            RetrievalRequest::Last => report_stored_records(RacpFilter::Last, self.e2e),
        };
        Ok(bytes)
    }

    /// Command bytes to abort the pending retrieval, if there is one.
    pub fn abort(&self) -> Option<Vec<u8>> {
        if self.is_pending() {
            Some(abort_operation(self.e2e))
        } else {
            None
        }
    }

    /// Classify a control-point response and decide the next step.
    pub fn on_response(&mut self, response: &RacpResponse, store_max: Option<u16>) -> Action {
        if !self.is_pending() {
            return Action::Ignore;
        }
        let (request, baseline) = match self.active {
            Some(active) => (active.request, active.page_baseline),
            None => return Action::Ignore,
        };

        match *response {
            RacpResponse::NumberOfRecords(0) => self.complete(RequestStatus::Success),
            RacpResponse::NumberOfRecords(count) => {
                // The count precedes delivery; ask for the next contiguous
                // page. Anything already stored narrows the request.
                debug!("peripheral reports {count} stored records");
                let filter = match store_max {
                    Some(max) => match max.checked_add(1) {
                        Some(next) => RacpFilter::GreaterOrEqual(next),
                        None => return self.complete(RequestStatus::Success),
                    },
                    None => initial_page_filter(request),
                };
                self.send_page(filter, store_max)
            }
            RacpResponse::ResponseCode {
                request: OpCode::AbortOperation,
                code: ResponseCode::Success,
            } => self.complete(RequestStatus::Aborted),
            RacpResponse::ResponseCode {
                code: ResponseCode::NoRecordsFound,
                ..
            } => self.complete(RequestStatus::Success),
            RacpResponse::ResponseCode {
                code: ResponseCode::OpCodeNotSupported,
                ..
            } => self.complete(RequestStatus::NotSupported),
            RacpResponse::ResponseCode {
                request: OpCode::ReportStoredRecords,
                code: ResponseCode::Success,
            } => match request {
                RetrievalRequest::First | RetrievalRequest::Last => {
                    self.complete(RequestStatus::Success)
                }
                RetrievalRequest::All | RetrievalRequest::GreaterOrEqual(_) => match store_max {
                    Some(max) if baseline != Some(max) => match max.checked_add(1) {
                        Some(next) => {
                            self.send_page(RacpFilter::GreaterOrEqual(next), store_max)
                        }
                        None => self.complete(RequestStatus::Success),
                    },
                    _ => self.complete(RequestStatus::Success),
                },
            },
            RacpResponse::ResponseCode {
                code: ResponseCode::Success,
                ..
            } => self.complete(RequestStatus::Success),
            RacpResponse::ResponseCode { .. } => self.complete(RequestStatus::Failed),
        }
    }

    /// A disconnect cancels the pending retrieval without invalidating
    /// records already stored.
    pub fn on_disconnect(&mut self) {
        if self.is_pending() {
            debug!("disconnected while a retrieval was pending");
            self.status = RequestStatus::Idle;
            self.active = None;
        }
    }

    /// The outstanding write failed (timeout or transport rejection).
    pub fn fail(&mut self) {
        if self.is_pending() {
            self.status = RequestStatus::Failed;
            self.active = None;
        }
    }

    fn send_page(&mut self, filter: RacpFilter, store_max: Option<u16>) -> Action {
        if let Some(active) = self.active.as_mut() {
            active.page_baseline = store_max;
        }
        Action::Send(report_stored_records(filter, self.e2e))
    }

    fn complete(&mut self, status: RequestStatus) -> Action {
        self.status = status;
        self.active = None;
        Action::Complete(status)
    }
}

fn initial_page_filter(request: RetrievalRequest) -> RacpFilter {
    match request {
        RetrievalRequest::All => RacpFilter::AllRecords,
        RetrievalRequest::GreaterOrEqual(seq) => RacpFilter::GreaterOrEqual(seq),
        RetrievalRequest::First => RacpFilter::First,
        RetrievalRequest::Last => RacpFilter::Last,
    }
}
