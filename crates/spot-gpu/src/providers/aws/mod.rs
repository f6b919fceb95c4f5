//! EC2-style cloud provisioning client.
//!
//! Implements the [`CloudApi`](crate::providers::CloudApi) trait for the
//! EC2 spot market.
//!
//! ## Actions used
//!
//! - **DescribeInstanceTypeOfferings** - zone availability per instance type
//! - **DescribeImages** - machine image discovery
//! - **DescribeSpotPriceHistory** - recent spot price samples
//! - **DescribeSubnets** - network placement per zone
//! - **RequestSpotInstances** / **DescribeSpotInstanceRequests** /
//!   **CancelSpotInstanceRequests** - one-time capacity requests
//! - **DescribeInstances** / **CreateTags** - instance state and audit tags

mod client;
mod models;

pub use client::Ec2Client;
pub use models::*;
