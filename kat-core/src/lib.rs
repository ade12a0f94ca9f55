//! # KAT Core
//!
//! Scan, normalize and derive pipeline over the KAT object graph.
//!
//! ## Overview
//!
//! - **Jobs**: [`job::BoefjeJob`], [`job::NormalizerJob`] and
//!   [`job::DeriveJob`] flow through one queue per kind.
//! - **Runners**: [`runner::BoefjeRunner`] turns scans into raw evidence,
//!   [`runner::NormalizerRunner`] parses evidence into objects.
//! - **Derivation**: [`derive::DerivationEngine`] matches rules to committed
//!   objects, resolves their context through the [`store::GraphStore`] and
//!   caches outputs by fingerprint.
//! - **Clearance**: [`clearance`] propagates and clamps scan levels along
//!   relation bounds.
//! - **Runtime**: [`runtime::PipelineRuntime`] wires the
//!   [`dispatcher::DefaultJobDispatcher`] to worker pools.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use chrono::Utc;
//! use kat_core::{
//!     builtin, config::PipelineConfig, registry::PluginId,
//!     runtime::PipelineRuntime, store::InMemoryGraphStore,
//! };
//! use kat_model::{Hostname, Network, Ooi, OoiObject, ScanLevel};
//!
//! async fn scan_example() -> kat_core::Result<()> {
//!     let store = Arc::new(InMemoryGraphStore::new());
//!     let network = Network::internet().reference();
//!     let host = Ooi::from(Hostname::new(network, "example.com"))
//!         .with_scan_level(ScanLevel::L1);
//!     store.insert(host.clone(), Utc::now()).await?;
//!
//!     let registry = Arc::new(builtin::registry()?);
//!     let runtime = PipelineRuntime::in_memory(
//!         PipelineConfig::default(),
//!         registry,
//!         store,
//!     )?;
//!     let dns = PluginId::from(builtin::DNS_RECORDS);
//!     runtime.submit_boefje(&dns, &host.reference()).await?;
//!     runtime.drain().await?;
//!     Ok(())
//! }
//! ```
#![allow(missing_docs)]

pub mod artifacts;
pub mod builtin;
pub mod clearance;
pub mod config;
pub mod derive;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod job;
pub mod plugin;
pub mod queue;
pub mod registry;
pub mod runner;
pub mod runtime;
pub mod store;

pub use error::{PipelineError, Result};
pub use kat_model;
