//! Correlation of outbound calls with their results.
//!
//! Every call gets a request id and a single-use result slot. A slot is
//! removed from [`PendingCalls`] the moment it is claimed, so a second result
//! for the same id finds nothing and is reported as a protocol error.

use std::{
    cell::RefCell,
    collections::HashMap,
    rc::Rc,
    time::{Duration, Instant},
};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use sturdy_common::{
    error::{RemoteFailure, RpcError},
    events::CallResolution,
};

use crate::value::Value;

/// Work a delivery thread keeps doing while a handler it runs waits on an
/// outbound result, so calls that arrive meanwhile (callbacks into the waiting
/// tub included) still execute.
pub(crate) trait Pump {
    /// Returns once `result` is ready or `deadline` has passed, running queued
    /// work in between.
    fn pump_until(&self, result: &Receiver<CallOutcome>, deadline: Option<Instant>);
}

thread_local! {
    static PUMP: RefCell<Option<Rc<dyn Pump>>> = const { RefCell::new(None) };
}

/// Makes `pump` run whenever this thread waits on a [`PendingResult`].
pub(crate) fn install_pump(pump: Rc<dyn Pump>) {
    PUMP.with(|current| *current.borrow_mut() = Some(pump));
}

fn pump_until(result: &Receiver<CallOutcome>, deadline: Option<Instant>) {
    // cloned out so nested waits can borrow it again
    let pump = PUMP.with(|current| current.borrow().clone());
    if let Some(pump) = pump {
        pump.pump_until(result, deadline);
    }
}

/// How an outbound call ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    Fulfilled(Value),
    Rejected(RemoteFailure),
    /// The connection closed before a result arrived.
    Abandoned(String),
}

impl CallOutcome {
    pub fn resolution(&self) -> CallResolution {
        match self {
            CallOutcome::Fulfilled(_) => CallResolution::Fulfilled,
            CallOutcome::Rejected(_) => CallResolution::Rejected,
            CallOutcome::Abandoned(_) => CallResolution::Abandoned,
        }
    }

    pub fn into_result(self) -> Result<Value, RpcError> {
        match self {
            CallOutcome::Fulfilled(value) => Ok(value),
            CallOutcome::Rejected(failure) => Err(RpcError::Remote(failure)),
            CallOutcome::Abandoned(reason) => Err(RpcError::ConnectionLost(reason)),
        }
    }
}

/// Write end of a pending call, claimed from [`PendingCalls`].
pub struct ResultSlot {
    pub request_id: u64,
    pub method:     String,
    sender:         Sender<CallOutcome>,
}

impl ResultSlot {
    /// Hands the outcome to the waiting caller. Returns the outcome back if
    /// the caller already went away, so it can be dropped outside any lock.
    pub fn deliver(self, outcome: CallOutcome) -> Option<CallOutcome> {
        self.sender.send(outcome).err().map(|e| e.into_inner())
    }
}

/// The caller's side of an outbound call.
///
/// Dropping it, or calling [`cancel`](Self::cancel), discards the eventual
/// result locally; nothing is sent to the peer.
#[derive(Debug)]
pub struct PendingResult {
    request_id: u64,
    receiver:   Receiver<CallOutcome>,
}

impl PendingResult {
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Blocks until the call resolves.
    pub fn outcome(self) -> CallOutcome {
        pump_until(&self.receiver, None);
        self.receiver
            .recv()
            .unwrap_or_else(|_| CallOutcome::Abandoned("result slot dropped".into()))
    }

    /// Blocks until the call resolves and converts the outcome.
    pub fn wait(self) -> Result<Value, RpcError> {
        self.outcome().into_result()
    }

    /// Like [`wait`](Self::wait), but gives up after `timeout`. The call stays
    /// pending and may be waited on again.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Value, RpcError> {
        let deadline = Instant::now() + timeout;
        pump_until(&self.receiver, Some(deadline));
        match self.receiver.recv_deadline(deadline) {
            Ok(outcome) => outcome.into_result(),
            Err(RecvTimeoutError::Timeout) => Err(RpcError::Timeout(format!(
                "request {} unresolved after {:?}",
                self.request_id, timeout
            ))),
            Err(RecvTimeoutError::Disconnected) => {
                Err(RpcError::ConnectionLost("result slot dropped".into()))
            }
        }
    }

    /// Returns the outcome if it already arrived.
    pub fn poll(&self) -> Option<CallOutcome> {
        match self.receiver.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                Some(CallOutcome::Abandoned("result slot dropped".into()))
            }
        }
    }

    pub fn cancel(self) {
        tracing::debug!(request_id = self.request_id, "Pending call cancelled locally");
    }
}

/// Outstanding outbound calls of one connection.
#[derive(Debug)]
pub struct PendingCalls {
    next_request: u64,
    slots:        HashMap<u64, (String, Sender<CallOutcome>)>,
}

impl Default for PendingCalls {
    fn default() -> Self {
        Self {
            next_request: 1,
            slots:        HashMap::new(),
        }
    }
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the next request id and its result slot.
    pub fn issue(&mut self, method: &str) -> (u64, PendingResult) {
        let request_id = self.next_request;
        self.next_request += 1;
        let (sender, receiver) = bounded(1);
        self.slots.insert(request_id, (method.to_string(), sender));
        (
            request_id,
            PendingResult {
                request_id,
                receiver,
            },
        )
    }

    /// Claims the slot for an arriving result.
    pub fn claim(&mut self, request_id: u64) -> Result<ResultSlot, RpcError> {
        match self.slots.remove(&request_id) {
            Some((method, sender)) => Ok(ResultSlot {
                request_id,
                method,
                sender,
            }),
            None if request_id > 0 && request_id < self.next_request => Err(RpcError::Protocol(
                format!("duplicate result for request {request_id}"),
            )),
            None => Err(RpcError::Protocol(format!(
                "result for unknown request {request_id}"
            ))),
        }
    }

    /// Claims every remaining slot; each must be delivered as abandoned.
    pub fn drain(&mut self) -> Vec<ResultSlot> {
        let mut slots: Vec<ResultSlot> = self
            .slots
            .drain()
            .map(|(request_id, (method, sender))| ResultSlot {
                request_id,
                method,
                sender,
            })
            .collect();
        slots.sort_by_key(|slot| slot.request_id);
        slots
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
