//! Engine Event Router & Handlers (spec §4.H).

pub mod handlers;
pub mod order_index;
pub mod router;

pub use order_index::OrderIndex;
pub use router::EventRouter;
