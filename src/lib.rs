//! # mapreduce-qa
//!
//! Map-reduce question answering over a corpus of long administrative
//! documents with a large-context model.
//!
//! Every document is given to the model in full (no chunking, no vector
//! search). The map stage asks the question once per document; the reduce
//! stage merges the per-document answers into one consolidated answer.
//! Runs are stored on disk so a reduce pass can be repeated with another
//! template without paying for the map stage again.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────┐   ┌──────────────┐   ┌────────────┐
//! │ Indexer  │──▶│ Dispatcher │──▶│ Run storage  │──▶│ Aggregator │
//! │ corpus/  │   │ N workers  │   │ run/<id>/    │   │ 1 call     │
//! └──────────┘   └─────┬──────┘   └──────────────┘   └─────┬──────┘
//!                      │                                   │
//!                      ▼                                   ▼
//!                ┌──────────────────────────────────────────────┐
//!                │   Model client (Ollama /api/generate)        │
//!                └──────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! mrqa check                                      # endpoint + model present?
//! mrqa stats                                      # what is in the corpus
//! mrqa ask 3 "管理不全空家等の定義は何ですか？"        # one document
//! mrqa run "管理不全空家等の定義は何ですか？" --parallel 4
//! mrqa aggregate 2026-10-19_0001 --template compare
//! mrqa show 2026-10-19_0001
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and `OLLAMA_*` overrides |
//! | [`error`] | Error taxonomy and exit codes |
//! | [`models`] | Documents, records, run metadata, aggregate results |
//! | [`templates`] | Prompt template registry |
//! | [`indexer`] | Corpus walk and document numbering |
//! | [`model_client`] | Blocking text-generation client |
//! | [`worker`] | Single-document QA and interactive sessions |
//! | [`dispatch`] | Bounded-parallel map stage |
//! | [`runs`] | Run allocation and crash-consistent storage |
//! | [`aggregate`] | Reduce stage |
//! | [`pipeline`] | End-to-end orchestration |
//! | [`progress`] | Progress reporting on stderr |
//! | [`stats`] | Read-only listing commands |

pub mod aggregate;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod indexer;
pub mod model_client;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod runs;
pub mod stats;
pub mod templates;
pub mod worker;

pub use error::{QaError, Result};
