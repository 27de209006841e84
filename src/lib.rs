//! MMBot dispatch gateway.
//!
//! Turns trend signals into risk-gated trade commands for a remote execution
//! agent, tracks the agent's results, and publishes every state change as an event.

pub mod config;
pub mod db;
pub mod domain;
pub mod error;
pub mod events;
pub mod executor;
pub mod logging;
pub mod oauth;
pub mod position;
pub mod store;
pub mod strategy;
pub mod telegram;
pub mod web;

#[cfg(test)]
pub(crate) mod test_support;
