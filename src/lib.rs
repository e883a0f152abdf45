//! # BGG Harvest
//!
//! Periodically rebuilds a local dataset of BoardGameGeek board games.
//!
//! A harvest scrapes item ids from the public ranking pages, fetches full
//! metadata for each page of ids through the rate-limited XML API, and
//! replaces the live dataset in one atomic step. Readers of the dataset
//! never see a half-written collection.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │   Ranking    │──▶│    Batch     │──▶│   Atomic     │
//! │   scraper    │   │   fetcher    │   │  publisher   │
//! └──────────────┘   └──────┬───────┘   └──────┬───────┘
//!                           │                  │ staging → live
//!                    ┌──────▼───────┐   ┌──────▼───────┐
//!                    │  API client  │   │    SQLite    │
//!                    │ (rate-limit) │   │  collections │
//!                    └──────────────┘   └──────┬───────┘
//!                                              │
//!                                       ┌──────▼───────┐
//!                                       │   Read API   │
//!                                       └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! bgg init                  # create database and collections
//! bgg ids --pages 1         # check the scraper
//! bgg run                   # full harvest
//! bgg serve                 # expose /BGG/game_info
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Ids, pages, records, and page outcomes |
//! | [`rate_limit`] | Per-client request spacing |
//! | [`retry`] | Retry policies and budgets |
//! | [`api`] | Metadata API client and XML parsing |
//! | [`scraper`] | Ranking page scraper |
//! | [`fetcher`] | Per-page fetch loop with backoff |
//! | [`store`] | Document store trait, SQLite and in-memory stores |
//! | [`publisher`] | Staging and atomic promotion |
//! | [`pipeline`] | One harvest run end to end |
//! | [`progress`] | Progress reporting |
//! | [`server`] | Read-only HTTP API |
//! | [`stats`] | Dataset statistics |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema setup |

pub mod api;
pub mod config;
pub mod db;
pub mod fetcher;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod publisher;
pub mod rate_limit;
pub mod retry;
pub mod scraper;
pub mod server;
pub mod stats;
pub mod store;
