// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker binary checksum.
//!
//! Completion requests carry a checksum identifying the worker binary, and
//! replay matches it against the checksums recorded in
//! workflow-task-completed events. Computed once at first use.

use once_cell::sync::OnceCell;
use sha2::{Digest, Sha256};

static BINARY_CHECKSUM: OnceCell<String> = OnceCell::new();

/// The checksum of the running worker binary.
pub fn binary_checksum() -> String {
    BINARY_CHECKSUM.get_or_init(compute_checksum).clone()
}

fn compute_checksum() -> String {
    if let Ok(path) = std::env::current_exe() {
        if let Ok(contents) = std::fs::read(&path) {
            let digest = Sha256::digest(&contents);
            return format!("{:x}", digest);
        }
    }
    // No readable binary (static analysis, unusual sandboxes): fall back to a
    // stable per-build identifier.
    format!("weft-{}", env!("CARGO_PKG_VERSION"))
}
