//! # Catalog Refresh
//!
//! An ingestion and refresh engine for a software catalog.
//!
//! Entity providers push raw entities into a SQLite-backed state store. A
//! bounded task pipeline claims entities that are due, runs them through a
//! pluggable orchestrator, persists the results (including entities
//! discovered while processing) and hands affected entities to a stitcher
//! that produces their final, externally visible form.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌──────────────┐
//! │  Providers  │──▶│ State Store  │◀─▶│    Engine    │
//! │ (files...)  │   │   (SQLite)   │   │  (pipeline)  │
//! └─────────────┘   └──────────────┘   └──────┬───────┘
//!                                             │
//!                          ┌──────────────────┤
//!                          ▼                  ▼
//!                   ┌──────────────┐   ┌──────────────┐
//!                   │ Orchestrator │   │   Stitcher   │
//!                   └──────────────┘   └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! catalog init                  # create database
//! catalog sync                  # run file providers once
//! catalog process --until-idle  # process everything that is due
//! catalog get component:default/billing
//! catalog run                   # providers + engine until Ctrl-C
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Entities, refs and processing results |
//! | [`store`] | Refresh state, discovery graph and garbage collection |
//! | [`pipeline`] | Watermark-bounded task pipeline |
//! | [`engine`] | Processing engine |
//! | [`providers`] | Entity provider bridge |
//! | [`traits`] | Orchestrator, stitcher and provider traits |
//! | [`orchestrator`] | Built-in orchestrators |
//! | [`stitcher`] | SQLite stitcher |
//! | [`connector_fs`] | Filesystem entity provider |
//! | [`events`] | Processing event stream |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod config;
pub mod connector_fs;
pub mod db;
pub mod engine;
pub mod error;
pub mod events;
pub mod get;
pub mod hash;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod orchestrator;
pub mod pipeline;
pub mod providers;
pub mod stats;
pub mod stitcher;
pub mod store;
pub mod traits;
