//! Services module for business logic and integrations

pub mod callback_processor;
pub mod ledger;
pub mod notification;
pub mod payment_orchestrator;
pub mod status_poller;

// Re-export orchestrator types
pub use crate::services::payment_orchestrator::{
    DeferredResolution, InitiatePayment, Initiation, OrchestratorConfig, OrchestratorError,
    OrchestratorResult, PaymentOrchestrator, PaymentRequestView, ResolutionKind,
    ResolutionResult,
};
pub use crate::services::status_poller::{PollOutcome, PollState, PollerConfig, StatusPoller};
