//! Mobile-money payment integration
//!
//! Gateway seam, the Daraja implementation, result code taxonomy and shared
//! payment types.

pub mod error;
pub mod gateway;
pub mod providers;
pub mod taxonomy;
pub mod types;
pub mod utils;

pub use error::{PaymentError, PaymentResult};
pub use gateway::MobileMoneyGateway;
pub use providers::{MpesaConfig, MpesaGateway};
pub use taxonomy::{classify, ErrorClassification, RecommendedAction};
pub use types::{
    GatewayStatus, PaymentOutcome, PaymentStatus, PaymentType, ResolutionSource, StkPushRequest,
    StkPushResponse,
};
