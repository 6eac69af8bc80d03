//! # Labelforge
//!
//! A pipeline for acquiring regulatory product-label documents from a state
//! pesticide registry, quality-checking their extracted text, and building
//! a canonical vocabulary of crop and target names.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌──────────┐   ┌───────────┐
//! │ Registry │──▶│ Reconcile  │──▶│ Acquire   │──▶│ QA + OCR   │
//! │ snapshot │   │ work queue │   │ sessions  │   │ verdicts   │
//! └──────────┘   └───────────┘   └──────────┘   └────┬──────┘
//!                                                    │
//!                                 ┌──────────────────┤
//!                                 ▼                  ▼
//!                          ┌───────────┐      ┌────────────┐
//!                          │ Relevance  │      │ Canonical   │
//!                          │ gate       │      │ names       │
//!                          └───────────┘      └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! lbf init                          # create database
//! lbf snapshot registry-export.zip  # ingest a registry export
//! lbf reconcile                     # preview the work queue
//! lbf acquire                       # download missing label documents
//! lbf qa                            # extract text and classify quality
//! lbf ocr                           # escalate flagged documents
//! lbf relevance                     # gate on agricultural relevance
//! lbf names import targets.csv      # load raw names
//! lbf names classify                # phase one: categorize
//! lbf names refine                  # phase two: canonicalize
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`snapshot`] | Registry export ingestion |
//! | [`reconcile`] | Work-queue construction and filter audit |
//! | [`catalog`] | Remote catalog session contract |
//! | [`acquire`] | Bounded, throttled acquisition scheduler |
//! | [`cancel`] | Cooperative cancellation token |
//! | [`store`] | Local artifact store |
//! | [`extract`] | Per-page PDF text extraction |
//! | [`qa`] | Quality signals and verdicts |
//! | [`ocr`] | OCR escalation engine |
//! | [`relevance`] | Agricultural-relevance gate |
//! | [`oracle`] | External classification capability |
//! | [`canonical`] | Two-phase name canonicalization |
//! | [`review`] | Manual-review list and purge |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod acquire;
pub mod cancel;
pub mod canonical;
pub mod catalog;
pub mod config;
pub mod db;
pub mod extract;
pub mod migrate;
pub mod models;
pub mod ocr;
pub mod oracle;
pub mod progress;
pub mod qa;
pub mod reconcile;
pub mod relevance;
pub mod review;
pub mod snapshot;
pub mod store;
