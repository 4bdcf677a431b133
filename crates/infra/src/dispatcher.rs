//! Operation execution pipeline.
//!
//! Every state-changing call of the back office goes through [`Dispatcher::dispatch`]:
//!
//! ```text
//! Operation
//!   ↓
//! 1. Authorize the principal (no IO)
//!   ↓
//! 2. Open a unit of work
//!   ↓
//! 3. Run the operation: load for update, decide, write, record activities
//!   ↓
//! 4. Commit (or roll back on any error)
//!   ↓
//! 5. On an optimistic-concurrency conflict, run the whole thing once more
//! ```
//!
//! Activity rows are written through the same unit of work as the mutation
//! they describe, so a failed audit write rolls the mutation back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use depotflow_auth::{authorize, Permission, Principal};
use depotflow_core::{Aggregate, DomainError, ExpectedVersion};
use depotflow_events::{Activity, AuditEvent, AuditRecord};

use crate::error::DispatchError;
use crate::store::{FulfillmentStore, Stored, UnitOfWork};

/// A unit of business work run inside one transaction.
///
/// `run` may be called twice when the first attempt hits a version conflict,
/// so it must derive everything from `ctx` and `self`.
#[async_trait]
pub trait Operation: Send + Sync {
    type Output: Send;

    /// Stable name for logs (e.g. `shipping.advance`).
    fn name(&self) -> &'static str;

    fn permission(&self) -> Permission;

    async fn run(&self, ctx: &mut OpContext<'_>) -> Result<Self::Output, DispatchError>;
}

/// Transaction-scoped state handed to a running operation.
pub struct OpContext<'a> {
    tx: Box<dyn UnitOfWork>,
    actor: &'a Principal,
    now: DateTime<Utc>,
}

impl<'a> OpContext<'a> {
    pub fn new(tx: Box<dyn UnitOfWork>, actor: &'a Principal, now: DateTime<Utc>) -> Self {
        Self { tx, actor, now }
    }

    pub fn tx(&mut self) -> &mut dyn UnitOfWork {
        self.tx.as_mut()
    }

    pub fn actor(&self) -> &Principal {
        self.actor
    }

    /// Business time shared by every write of this attempt.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Append the activity rows for `events`.
    pub async fn record<E: AuditEvent>(&mut self, events: &[E]) -> Result<(), DispatchError> {
        for event in events {
            if let Some(record) = event.audit() {
                self.record_at(record, event.occurred_at()).await?;
            }
        }
        Ok(())
    }

    /// Append one activity row not tied to an aggregate event.
    pub async fn record_activity(&mut self, record: AuditRecord) -> Result<(), DispatchError> {
        let now = self.now;
        self.record_at(record, now).await
    }

    async fn record_at(
        &mut self,
        record: AuditRecord,
        at: DateTime<Utc>,
    ) -> Result<(), DispatchError> {
        let activity = Activity::from_record(record, self.actor.user_id, at);
        self.tx.insert_activity(&activity).await?;
        Ok(())
    }

    /// Run a command against a loaded aggregate and write it back at the
    /// version it was read at.
    ///
    /// A command that yields no events is a no-op: nothing is written.
    pub async fn execute<A>(
        &mut self,
        aggregate: &mut A,
        command: &A::Command,
    ) -> Result<Vec<A::Event>, DispatchError>
    where
        A: Aggregate<Error = DomainError> + Stored + Send,
        A::Command: Sync,
        A::Event: AuditEvent,
    {
        let expected = ExpectedVersion::Exact(aggregate.version());
        let events = depotflow_events::execute(aggregate, command)?;
        if events.is_empty() {
            return Ok(events);
        }
        aggregate.save(self.tx.as_mut(), expected).await?;
        self.record(&events).await?;
        Ok(events)
    }

    /// Run a creation command against an empty aggregate and insert it.
    pub async fn create<A>(
        &mut self,
        aggregate: &mut A,
        command: &A::Command,
    ) -> Result<Vec<A::Event>, DispatchError>
    where
        A: Aggregate<Error = DomainError> + Stored + Send,
        A::Command: Sync,
        A::Event: AuditEvent,
    {
        let events = depotflow_events::execute(aggregate, command)?;
        aggregate.insert(self.tx.as_mut()).await?;
        self.record(&events).await?;
        Ok(events)
    }

    fn into_tx(self) -> Box<dyn UnitOfWork> {
        self.tx
    }
}

/// Runs operations against a store with authorization, atomicity and a
/// single retry on version conflicts.
#[derive(Debug, Clone)]
pub struct Dispatcher<S> {
    store: S,
}

impl<S> Dispatcher<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S: FulfillmentStore> Dispatcher<S> {
    #[instrument(
        skip(self, actor, op),
        fields(operation = op.name(), actor = %actor.name, role = actor.role.as_str()),
        err
    )]
    pub async fn dispatch<O: Operation>(
        &self,
        actor: &Principal,
        op: &O,
    ) -> Result<O::Output, DispatchError> {
        authorize(actor, op.permission())?;

        match self.attempt(actor, op).await {
            Err(err) if err.is_retryable() => {
                warn!(error = %err, "version conflict, retrying once");
                self.attempt(actor, op).await
            }
            other => other,
        }
    }

    async fn attempt<O: Operation>(
        &self,
        actor: &Principal,
        op: &O,
    ) -> Result<O::Output, DispatchError> {
        let tx = self.store.begin().await?;
        let mut ctx = OpContext::new(tx, actor, Utc::now());

        match op.run(&mut ctx).await {
            Ok(output) => {
                ctx.into_tx().commit().await?;
                info!(operation = op.name(), "operation committed");
                Ok(output)
            }
            Err(err) => {
                if let Err(rollback_err) = ctx.into_tx().rollback().await {
                    warn!(error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        }
    }
}
