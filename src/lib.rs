//! Local reconciliation core for a peer-to-peer calendar.
//!
//! - [`core`] - event types, store interface, event processing, access control
//! - [`ds`] - node interface, topics and an in-process transport
//! - [`app`] - the peer context, dispatcher, replay scheduling and invite codes
//! - [`config`] - timing and invite code settings

pub mod app;
pub mod config;
pub mod core;
pub mod ds;
pub mod logging;
