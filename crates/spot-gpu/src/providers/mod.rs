//! Cloud provisioning API abstractions.
//!
//! This module contains the [`CloudApi`] trait and the EC2-style
//! implementation used against the real provider.

pub mod aws;
pub mod traits;

pub use aws::Ec2Client;
pub use traits::{
    Architecture, CapacityRequest, CapacityRequestState, CapacityRequestStatus, CloudApi,
    CloudApiError, ImageFilter, InstanceDescription, InstanceState, MachineImage, PriceSample,
};
