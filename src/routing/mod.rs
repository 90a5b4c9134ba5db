//! Invocation routing: which capability tier handles a task.

pub mod intent;
pub mod router;

pub use router::{route, Delivery, RouteDecision, RouteRule, TaskDescriptor, TaskKind, TaskOrigin};
