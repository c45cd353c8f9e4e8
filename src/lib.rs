//! Devgate - a local development gateway
//!
//! This library provides:
//! - Supervision of development services running on pseudo-terminals, with
//!   graceful-then-forceful stop and streamed terminal output
//! - Virtual-host routing of HTTP and WebSocket traffic to static directories
//!   or to backends reached over unix domain sockets or the network
//! - Per-config runtime and state directories that services and routes can
//!   reference through `{xdg_run}` style templates

pub mod client;
pub mod config;
pub mod content_coding;
pub mod dirs;
pub mod error;
pub mod gateway;
pub mod process;
pub mod proxy;
pub mod pty;
pub mod static_files;
pub mod vars;
