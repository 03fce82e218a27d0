//! Allocation request intake
//!
//! Validates inbound payloads, assigns identity and places requests on the
//! bounded processing queue. Validation and a full queue are the only errors
//! surfaced synchronously; everything after enqueue is reported through the
//! decision delivered on the ticket.

mod quantity;

pub use quantity::parse_memory;

use crate::error::{FieldError, IntakeError, ValidationError};
use crate::models::{AllocationDecision, AllocationPayload, AllocationRequest, AllocationResponse, Priority};
use crate::observability::EngineMetrics;
use chrono::Utc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

/// A request waiting in the processing queue
#[derive(Debug)]
pub struct QueuedRequest {
    pub request: AllocationRequest,
    /// Number of prior deferrals
    pub attempt: u32,
    /// Delivery channel for the terminal decision; the caller may have gone away
    pub reply: Option<oneshot::Sender<AllocationDecision>>,
}

impl QueuedRequest {
    /// Deliver the terminal decision if anyone is still listening
    pub fn deliver(&mut self, decision: &AllocationDecision) {
        if let Some(reply) = self.reply.take() {
            if reply.send(decision.clone()).is_err() {
                debug!(request_id = %decision.request_id, "Caller disconnected before outcome");
            }
        }
    }
}

/// Handle returned to the submitter
#[derive(Debug)]
pub struct Ticket {
    pub request_id: Uuid,
    decision: oneshot::Receiver<AllocationDecision>,
}

impl Ticket {
    /// Wait for the terminal decision.
    ///
    /// Returns `None` if the engine shut down before deciding.
    pub async fn wait(self) -> Option<AllocationDecision> {
        self.decision.await.ok()
    }

    /// Wait for the terminal outcome in the response shape of the allocation contract
    pub async fn response(self) -> Option<AllocationResponse> {
        self.wait().await.map(|d| AllocationResponse::from(&d))
    }
}

/// Producer side of the processing queue
#[derive(Debug, Clone)]
pub struct Intake {
    sender: mpsc::Sender<QueuedRequest>,
    metrics: EngineMetrics,
}

impl Intake {
    /// Create the intake and the receiving end of its bounded queue
    pub fn channel(capacity: usize, metrics: EngineMetrics) -> (Self, mpsc::Receiver<QueuedRequest>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender, metrics }, receiver)
    }

    /// Validate a payload into an immutable request with fresh identity
    pub fn validate(payload: &AllocationPayload) -> Result<AllocationRequest, ValidationError> {
        let mut errors = Vec::new();

        if !payload.cpu_request.is_finite() || payload.cpu_request <= 0.0 {
            errors.push(FieldError::new("cpu_request", "must be a finite number > 0"));
        }

        let memory_request = match parse_memory(&payload.memory_request) {
            Ok(bytes) => bytes,
            Err(reason) => {
                errors.push(FieldError::new("memory_request", reason));
                0
            }
        };

        let priority = match payload.priority.parse::<Priority>() {
            Ok(p) => p,
            Err(reason) => {
                errors.push(FieldError::new("priority", reason));
                Priority::Normal
            }
        };

        if !payload.max_energy_consumption.is_finite() || payload.max_energy_consumption <= 0.0 {
            errors.push(FieldError::new(
                "max_energy_consumption",
                "must be a finite number > 0",
            ));
        }

        if !errors.is_empty() {
            return Err(ValidationError { errors });
        }

        Ok(AllocationRequest {
            id: Uuid::new_v4(),
            cpu_request: payload.cpu_request,
            memory_request,
            priority,
            max_energy_consumption: payload.max_energy_consumption,
            submitted_at: Utc::now(),
        })
    }

    /// Validate and enqueue. Returns as soon as the request is queued.
    pub fn submit(&self, payload: AllocationPayload) -> Result<Ticket, IntakeError> {
        let request = Self::validate(&payload)?;
        self.enqueue(request)
    }

    /// Enqueue an already validated request
    pub fn enqueue(&self, request: AllocationRequest) -> Result<Ticket, IntakeError> {
        let request_id = request.id;
        let (reply, decision) = oneshot::channel();
        let queued = QueuedRequest {
            request,
            attempt: 0,
            reply: Some(reply),
        };

        self.sender.try_send(queued).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                warn!(request_id = %request_id, "Allocation queue full, request not accepted");
                IntakeError::QueueFull
            }
            mpsc::error::TrySendError::Closed(_) => IntakeError::Closed,
        })?;
        self.metrics.inc_queue_depth();

        debug!(request_id = %request_id, "Allocation request enqueued");
        Ok(Ticket {
            request_id,
            decision,
        })
    }

    /// Put a deferred request back on the queue after `delay`.
    ///
    /// Waits for queue capacity rather than failing: the request already
    /// has an identity and must reach a terminal decision.
    pub fn requeue_after(&self, mut queued: QueuedRequest, delay: Duration) {
        queued.attempt += 1;
        let sender = self.sender.clone();
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let request_id = queued.request.id;
            match sender.send(queued).await {
                Ok(()) => metrics.inc_queue_depth(),
                Err(_) => warn!(request_id = %request_id, "Queue closed, deferred request dropped"),
            }
        });
    }
}
