use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use depotflow_core::{Aggregate, AggregateRoot, DomainError, OrderId, ProductId, ReturnId};
use depotflow_events::{ActivityKind, AuditEvent, AuditRecord, Event};
use depotflow_products::Condition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReturnStatus {
    Pending,
    Approved,
    Rejected,
    Completed,
}

impl ReturnStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReturnStatus::Pending => "pending",
            ReturnStatus::Approved => "approved",
            ReturnStatus::Rejected => "rejected",
            ReturnStatus::Completed => "completed",
        }
    }
}

impl core::fmt::Display for ReturnStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate root: ReturnRequest.
///
/// Eligibility (order shipped or delivered, product part of the order) is
/// checked by the caller against the order; this aggregate owns only the
/// request lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnRequest {
    id: ReturnId,
    order_id: OrderId,
    product_id: ProductId,
    reason: String,
    condition: Option<Condition>,
    refund_amount: Option<u64>,
    status: ReturnStatus,
    resolution_note: Option<String>,
    requested_at: Option<DateTime<Utc>>,
    resolved_at: Option<DateTime<Utc>>,
    version: u64,
    created: bool,
}

impl ReturnRequest {
    pub fn empty(id: ReturnId) -> Self {
        Self {
            id,
            order_id: OrderId::from_uuid(Uuid::nil()),
            product_id: ProductId::from_uuid(Uuid::nil()),
            reason: String::new(),
            condition: None,
            refund_amount: None,
            status: ReturnStatus::Pending,
            resolution_note: None,
            requested_at: None,
            resolved_at: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> ReturnId {
        self.id
    }

    pub fn order_id(&self) -> OrderId {
        self.order_id
    }

    pub fn product_id(&self) -> ProductId {
        self.product_id
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn condition(&self) -> Option<Condition> {
        self.condition
    }

    pub fn refund_amount(&self) -> Option<u64> {
        self.refund_amount
    }

    pub fn status(&self) -> ReturnStatus {
        self.status
    }

    pub fn requested_at(&self) -> Option<DateTime<Utc>> {
        self.requested_at
    }
}

impl AggregateRoot for ReturnRequest {
    type Id = ReturnId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: RequestReturn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestReturn {
    pub return_id: ReturnId,
    pub order_id: OrderId,
    pub product_id: ProductId,
    pub reason: String,
    pub condition: Option<Condition>,
    pub refund_amount: Option<u64>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReturnCommand {
    Request(RequestReturn),
    Approve { occurred_at: DateTime<Utc> },
    Reject { note: String, occurred_at: DateTime<Utc> },
    Complete { occurred_at: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnRequested {
    pub return_id: ReturnId,
    pub order_id: OrderId,
    pub product_id: ProductId,
    pub reason: String,
    pub condition: Option<Condition>,
    pub refund_amount: Option<u64>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnResolved {
    pub return_id: ReturnId,
    pub order_id: OrderId,
    pub product_id: ProductId,
    pub from: ReturnStatus,
    pub to: ReturnStatus,
    pub note: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReturnEvent {
    ReturnRequested(ReturnRequested),
    ReturnResolved(ReturnResolved),
}

impl Event for ReturnEvent {
    fn event_type(&self) -> &'static str {
        match self {
            ReturnEvent::ReturnRequested(_) => "sales.return.requested",
            ReturnEvent::ReturnResolved(_) => "sales.return.resolved",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            ReturnEvent::ReturnRequested(e) => e.occurred_at,
            ReturnEvent::ReturnResolved(e) => e.occurred_at,
        }
    }
}

impl AuditEvent for ReturnEvent {
    fn audit(&self) -> Option<AuditRecord> {
        let record = match self {
            ReturnEvent::ReturnRequested(e) => AuditRecord::new(
                ActivityKind::ReturnRequest,
                format!("Return requested: {}", e.reason),
            )
            .product(e.product_id)
            .order(e.order_id)
            .metadata(json!({
                "returnId": e.return_id,
                "reason": e.reason,
                "condition": e.condition,
                "refundAmount": e.refund_amount,
            })),
            ReturnEvent::ReturnResolved(e) => {
                let kind = match e.to {
                    ReturnStatus::Approved => ActivityKind::ReturnApproved,
                    ReturnStatus::Rejected => ActivityKind::ReturnRejected,
                    _ => ActivityKind::ReturnCompleted,
                };
                AuditRecord::new(kind, format!("Return {}", e.to))
                    .product(e.product_id)
                    .order(e.order_id)
                    .metadata(json!({
                        "returnId": e.return_id,
                        "oldStatus": e.from,
                        "newStatus": e.to,
                        "note": e.note,
                    }))
            }
        };
        Some(record)
    }
}

impl Aggregate for ReturnRequest {
    type Command = ReturnCommand;
    type Event = ReturnEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            ReturnEvent::ReturnRequested(e) => {
                self.id = e.return_id;
                self.order_id = e.order_id;
                self.product_id = e.product_id;
                self.reason = e.reason.clone();
                self.condition = e.condition;
                self.refund_amount = e.refund_amount;
                self.status = ReturnStatus::Pending;
                self.requested_at = Some(e.occurred_at);
                self.created = true;
            }
            ReturnEvent::ReturnResolved(e) => {
                self.status = e.to;
                if e.note.is_some() {
                    self.resolution_note = e.note.clone();
                }
                self.resolved_at = Some(e.occurred_at);
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            ReturnCommand::Request(cmd) => self.handle_request(cmd),
            ReturnCommand::Approve { occurred_at } => {
                self.resolve(ReturnStatus::Pending, ReturnStatus::Approved, None, *occurred_at)
            }
            ReturnCommand::Reject { note, occurred_at } => self.resolve(
                ReturnStatus::Pending,
                ReturnStatus::Rejected,
                Some(note.clone()),
                *occurred_at,
            ),
            ReturnCommand::Complete { occurred_at } => {
                self.resolve(ReturnStatus::Approved, ReturnStatus::Completed, None, *occurred_at)
            }
        }
    }
}

impl ReturnRequest {
    fn handle_request(&self, cmd: &RequestReturn) -> Result<Vec<ReturnEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("return already exists"));
        }
        if cmd.reason.trim().is_empty() {
            return Err(DomainError::validation("return reason must not be empty"));
        }

        Ok(vec![ReturnEvent::ReturnRequested(ReturnRequested {
            return_id: cmd.return_id,
            order_id: cmd.order_id,
            product_id: cmd.product_id,
            reason: cmd.reason.trim().to_string(),
            condition: cmd.condition,
            refund_amount: cmd.refund_amount,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn resolve(
        &self,
        from: ReturnStatus,
        to: ReturnStatus,
        note: Option<String>,
        occurred_at: DateTime<Utc>,
    ) -> Result<Vec<ReturnEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found(format!("return {}", self.id)));
        }
        if self.status != from {
            return Err(DomainError::invalid_transition(format!(
                "return {}: {} -> {}",
                self.id, self.status, to
            )));
        }

        Ok(vec![ReturnEvent::ReturnResolved(ReturnResolved {
            return_id: self.id,
            order_id: self.order_id,
            product_id: self.product_id,
            from,
            to,
            note,
            occurred_at,
        })])
    }
}
