//! Troublemaker BLIP Proxy Library
//!
//! A man-in-the-middle WebSocket proxy that parses BLIP protocol traffic
//! and hands it to fault-injection plugins for tampering, delaying, and
//! disconnecting.

pub mod codec;
pub mod config;
pub mod dist;
pub mod logging;
pub mod message;
pub mod pattern;
pub mod pipeline;
pub mod plugin;
pub mod plugins;
pub mod proxy;
pub mod rules;
