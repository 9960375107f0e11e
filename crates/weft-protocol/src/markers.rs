// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Well-known marker names and related constants.
//!
//! Marker events record side effects, versioning decisions, and
//! local-activity results in history. The replay matcher and the history
//! cursor treat these names specially.

/// Marker recorded by `get_version` style workflow versioning.
pub const VERSION_MARKER_NAME: &str = "Version";

/// Marker recorded by mutable side effects.
pub const MUTABLE_SIDE_EFFECT_MARKER_NAME: &str = "MutableSideEffect";

/// Marker recorded by plain side effects.
pub const SIDE_EFFECT_MARKER_NAME: &str = "SideEffect";

/// Marker that records a local activity result. The history cursor applies
/// these after the workflow-task-started event of their batch.
pub const LOCAL_ACTIVITY_MARKER_NAME: &str = "LocalActivity";

/// Search-attribute key upserted together with version markers. The replay
/// matcher skips the marker/upsert pair as a unit.
pub const CHANGE_VERSION_SEARCH_ATTRIBUTE: &str = "WeftChangeVersion";

/// Namespace used by offline replay tooling. Namespace equality checks in
/// the replay matcher ignore this value.
pub const REPLAY_NAMESPACE: &str = "ReplayNamespace";

/// Returns true for the namespace offline replay tooling runs under.
pub fn is_replay_namespace(namespace: &str) -> bool {
    namespace == REPLAY_NAMESPACE
}
