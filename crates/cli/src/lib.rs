//! Client library for the gateway HTTP API.

pub mod client;

pub use client::{ClientError, GatewayClient, Identity, KeygenReply, Signature};
