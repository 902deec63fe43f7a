//! Backbone Border Router daemon: CoAP resource engine, ND-Proxy,
//! kernel-assisted multicast routing, NCP integration, and the
//! supervisor tying them together. Domain types and registries live in
//! `bbr-core`; everything here is the socket- and process-facing half.

pub mod coap;
pub mod dad;
pub mod events;
pub mod mcast_router;
pub mod nd_proxy;
pub mod ncp;
pub mod packet_filter;
pub mod state;
pub mod supervisor;
