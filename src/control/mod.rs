//! JSON RPC client for the control plane (registration, queue, status, heartbeat).

mod client;
mod error;

pub use client::{
    ControlClient, DynamicPolicyProfile, HeartbeatReport, ItemState, RegisterResponse,
    RegistrationProfile, StatusReport,
};
pub use error::ApiError;
