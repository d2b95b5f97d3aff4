//! Guvnor - a process supervisor fronted by a host-routing reverse proxy
//!
//! This library provides a single-binary supervisor that:
//! - Spawns and supervises local application processes with restart policies
//! - Recovers supervised processes from PID files across supervisor restarts
//! - Routes HTTP/HTTPS traffic by Host header to the right application
//! - Terminates TLS with on-demand ACME certificate acquisition
//! - Probes application health and restarts apps on sustained failure
//! - Appends a per-hop tracking UUID to a configurable request header
//! - Exposes status, logs and a stop operation on a loopback management API

pub mod api;
pub mod cert;
pub mod config;
pub mod error;
pub mod health;
pub mod logring;
pub mod process;
pub mod proxy;
pub mod server;
pub mod supervisor;
