// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Knowledge Vault - Multi-tenant Encrypted Vault Backend
//!
//! Each tenant owns an isolated store file and an isolated data encryption
//! key. This crate manages the lifecycle of open stores, the key hierarchy
//! protecting tenant content and the backup pipeline.
//!
//! ## Modules
//!
//! - `background` - Cancellable periodic tasks
//! - `backup` - Snapshots to cold storage, pruning and verified restores
//! - `config` - Environment configuration
//! - `context` - Cached per-request tenant contexts
//! - `crypto` - AES-256-GCM primitives and record field encryption
//! - `error` - Service-level error codes
//! - `keys` - DEK generation, wrapping and resolution (Argon2id)
//! - `state` - Service root wiring everything together
//! - `storage` - Store engine (redb), handle pool and key store

pub mod background;
pub mod backup;
pub mod config;
pub mod context;
pub mod crypto;
pub mod error;
pub mod keys;
pub mod state;
pub mod storage;
