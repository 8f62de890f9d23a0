//! Multi-tenant container deployment platform.
//!
//! Hoster lets creators register remote Linux hosts, publish
//! deployment templates built around container compositions, and lets
//! customers instantiate those templates as isolated, routable
//! deployments - scheduled onto a suitable host, materialized over
//! SSH, and reachable by hostname through the built-in proxy.
//!
//! # Overview
//!
//! The platform is four tightly-coupled subsystems around one loop:
//!
//! - The [`store`] entity engine: schema-driven CRUD with per-entity
//!   state machines and command dispatch
//! - The [`orchestrator`]: one container-operation surface with a
//!   local Docker transport and an SSH-tunneled agent transport
//! - The [`planner`]: compose parsing and dependency-ordered
//!   materialization of networks, volumes, and containers
//! - The [`proxy`]: hostname-keyed request routing to the backing
//!   container port, locally or through an SSH tunnel
//!
//! Around them sit the [`commands`] bus driving deployment
//! lifecycles, the [`pool`] of cached host connections, the
//! [`workers`] (health, DNS, invoices, billing, provisioning), and
//! the [`api`] serving the JSON:API entity surface.
//!
//! # Deploy path
//!
//! Creating a deployment validates plan quota, pins the template
//! version, and fires the schedule command: an online node with the
//! required capabilities and capacity is picked, a proxy port
//! allocated, and a hostname generated. The start command parses the
//! composition, materializes resources in dependency order on the
//! node, waits for health, and the row lands in `running`. Inbound
//! HTTP at the proxy resolves the hostname back to that deployment
//! and forwards to its port.

// Allow noisy pedantic lints that don't add value for a server
// crate of this shape.
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions
)]

pub mod api;
pub mod auth;
pub mod commands;
pub mod compose;
pub mod config;
pub mod crypto;
pub mod error;
pub mod orchestrator;
pub mod planner;
pub mod pool;
pub mod providers;
pub mod proxy;
pub mod store;
pub mod workers;

pub use auth::AuthContext;
pub use config::Config;
pub use crypto::SecretBox;
pub use error::{HosterError, HosterResult};
pub use orchestrator::Orchestrator;
pub use pool::HostPool;
pub use store::Engine;
