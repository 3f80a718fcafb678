pub mod gate;
pub mod store;

pub use gate::{GateDecision, GateRequest, HitlGate, canonical_input_key};
pub use store::{Approval, ApprovalStatus, ApprovalStore, NewApproval};
