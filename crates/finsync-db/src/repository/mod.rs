//! # Repository Module
//!
//! SQL lives here and nowhere else.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  EntityStore<T> / Reconciler                                            │
//! │       │                                                                 │
//! │       │  borrowed connection (pooled, or the reconcile transaction)    │
//! │       ▼                                                                 │
//! │  RecordRepository<'c>        LinkRepository<'c>                        │
//! │  ├── fetch / fetch_one       ├── children / parents                    │
//! │  ├── upsert / delete         ├── replace_children / replace_parents    │
//! │  └── count / fetch_children  └── purge                                 │
//! │                                                                         │
//! │  CredentialRepository (owns a pool clone; one-row table)               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`RecordRepository`](records::RecordRepository) - Entity rows and filtered reads
//! - [`LinkRepository`](links::LinkRepository) - Relationship slots
//! - [`CredentialRepository`](credentials::CredentialRepository) - Persisted credential

pub mod credentials;
pub mod links;
pub mod records;
