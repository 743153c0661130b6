//! Outbound messages: what each client is told to fetch, and the forwarding rules switches
//! need to carry it.

use std::{net::Ipv4Addr, time::Duration};

use crate::utils;

/// Tells a client where to fetch each layer of a segment.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ClientNotification {
    pub segment: usize,
    pub buffer: u32,
    pub client: Ipv4Addr,
    pub layers: Vec<LayerGrant>,
    /// Set when the cycle fell back to the base layer.
    pub fallback: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LayerGrant {
    pub layer: usize,
    pub port: u16,
    pub server: Ipv4Addr,
}

/// A flow rule for one switch along a forwarding path.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ForwardingRule {
    pub device: String,
    pub output_port: u32,
    pub priority: u32,
    #[serde(with = "utils::millis")]
    pub timeout: Duration,
    pub permanent: bool,
    pub selector: RuleMatch,
}

/// Packet fields a [`ForwardingRule`] matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RuleMatch {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub protocol: u8,
    pub src_port: u16,
}

/// IP protocol number of TCP.
pub const TCP: u8 = 6;
