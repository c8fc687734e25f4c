//! # Evidence Harness
//!
//! An evidence-grounded clinical reasoning pipeline for pediatric
//! emergency simulation training.
//!
//! Evidence Harness keeps a tutoring model honest: every explanation it
//! returns must cite curated case passages that were actually retrieved
//! for the query, doses and treatment algorithms come from versioned
//! deterministic rules that never touch the model, and any answer that
//! cannot be grounded degrades to an explicit safe fallback instead of
//! an error or a hallucination.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌─────────────────────────┐   ┌──────────┐
//! │ Case bundles │──▶│  Seeder (hash + version) │──▶│  SQLite   │
//! │ (JSON files) │   └─────────────────────────┘   │ passages  │
//! └──────────────┘                                 │ rules     │
//!                                                  │ evidence  │
//!                                                  └────┬─────┘
//!            ┌───────────────┬───────────────┬─────────┤
//!            ▼               ▼               ▼         ▼
//!      ┌──────────┐   ┌──────────┐   ┌──────────┐ ┌──────────┐
//!      │ Retriever │   │  Rules    │   │ Evidence  │ │  Stats    │
//!      │ (scored)  │   │  engine   │   │  client   │ └──────────┘
//!      └────┬─────┘   └──────────┘   └────┬─────┘
//!           │                             │
//!           └────────────┬────────────────┘
//!                        ▼
//!                 ┌─────────────┐    sanitized prompts
//!                 │  Composer    │◀──▶ completion model
//!                 │ (grounding)  │
//!                 └────┬────────┘
//!                      ▼
//!            GroundedBundle (cited) or fallback
//! ```
//!
//! Every endpoint sits behind a per-requester rate limit, a per-endpoint
//! circuit breaker, and a timeout budget; learner input passes through
//! the sanitizer before it reaches a prompt.
//!
//! ## Quick Start
//!
//! ```bash
//! evh init                         # create database
//! evh seed cases/anaphylaxis.json  # load a case bundle
//! evh retrieve "first line drug for anaphylaxis" --case anaphylaxis
//! evh dose epinephrine --weight-kg 18.5
//! evh explain "what do I give first?" --case anaphylaxis --stage 1
//! evh serve                        # start HTTP server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types and wire contracts |
//! | [`store`] | Passage/rule/evidence storage traits, SQLite and memory |
//! | [`seed`] | Case bundle ingestion |
//! | [`retrieve`] | Scored passage retrieval with a session cache |
//! | [`rules`] | Deterministic dosing and algorithm engine |
//! | [`evidence`] | External bibliographic search client |
//! | [`sanitize`] | Input sanitization and prompt hardening |
//! | [`guard`] | Rate limits, circuit breakers, timeout budgets |
//! | [`compose`] | Grounded answer composition |
//! | [`model`] | Completion model providers |
//! | [`pipeline`] | Component wiring |
//! | [`server`] | JSON HTTP server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod cache_cmd;
pub mod compose;
pub mod config;
pub mod db;
pub mod error;
pub mod evidence;
pub mod guard;
pub mod migrate;
pub mod model;
pub mod models;
pub mod pipeline;
pub mod retrieve;
pub mod rules;
pub mod sanitize;
pub mod seed;
pub mod server;
pub mod stats;
pub mod store;
