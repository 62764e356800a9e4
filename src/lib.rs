//! A stale-while-revalidate proxy for GrowthBook-style feature definitions.
//!
//! # Overview
//!
//! The crate revolves around a [`Client`] with two responsibilities:
//!
//! - [`Client::fetch_or_refresh`] fetches the latest feature payload of an API key from the
//!   upstream feature API, writes it to a [`CacheStore`] and, if enabled, publishes a
//!   [`DiffEvent`] with the previous and the new payload. Concurrent refreshes of the same
//!   upstream URL share a single in-flight fetch.
//! - [`Client::evaluate`] reduces a full payload to what a single visitor is entitled to see:
//!   features that are off and experiments the visitor is not part of are omitted, and
//!   variations the visitor was not assigned are blanked out.
//!
//! Cache backends, the upstream API and change subscribers are pluggable through the
//! [`CacheStore`], [`Upstream`](upstream::Upstream) and [`ChangePublisher`] traits.
//! [`MemoryCacheStore`], [`HttpUpstream`](upstream::HttpUpstream) and [`BroadcastPublisher`] are
//! provided out of the box.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum.
//!
//! Only configuration errors (e.g., missing upstream host) are returned to the caller. Transient
//! upstream and cache failures are logged and reported as "no refresh happened", so the
//! previously cached payload stays authoritative.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate with target
//! `feature_proxy`. Consider integrating a `log`-compatible logger implementation for better
//! visibility into refreshes.

#![warn(rustdoc::missing_crate_level_docs)]

pub mod cache_store;
mod client;
mod conditions;
mod config;
pub mod definitions;
pub mod engine;
mod error;
pub mod eval;
mod hash;
pub mod publisher;
pub mod reducer;
pub mod refresh;
pub mod upstream;

pub use cache_store::{CacheEntry, CacheStore, MemoryCacheStore};
pub use client::Client;
pub use config::{EvaluationOptions, ProxyContext, UpstreamConfig};
pub use definitions::{Attributes, Payload};
pub use error::{Error, Result};
pub use publisher::{BroadcastPublisher, ChangePublisher, DiffEvent, EventKind};
pub use reducer::ReducedDefinitionSet;
pub use refresh::{RefreshCoordinator, RefreshOutcome};
