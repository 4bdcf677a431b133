//! Domain events and the activity audit log model.

pub mod activity;
pub mod event;
pub mod handler;
pub mod timeline;

pub use activity::{
    Activity, ActivityFilter, ActivityKind, ActivityPage, Pagination, SortOrder,
};
pub use event::{AuditEvent, AuditRecord, Event};
pub use handler::execute;
pub use timeline::{merge_timeline, TimelineEntry, TimelineKind};
