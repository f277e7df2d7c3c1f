// ABOUTME: Root library module exposing all public modules
// ABOUTME: Provides access to the bridge hook, outbound worker, broker supervisor, and config
pub mod breaker;
pub mod broker;
pub mod config;
pub mod delivery;
pub mod hook;
pub mod outbound;
pub mod plugin;
pub mod protocol;
pub mod publisher;
pub mod rate_limit;
pub mod splitter;
pub mod tool;
pub mod transport;
