//! `Layercast` plans layered video delivery over a software-defined network. Every cycle it
//! splits each client-side switch's demand across the server-side switches, then picks which
//! enhancement layers each client gets and from which server, trading quality against
//! long-term fairness. The results are client notifications and per-switch forwarding rules.

#![warn(unreachable_pub, missing_docs)]

pub mod core;
pub mod utils;
