pub mod decision;
pub mod orchestrator;

pub use decision::{RenewalDecision, RenewalReason, evaluate};
pub use orchestrator::{BatchSummary, RenewalOrchestrator, RenewalRequest};
