// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Opaque payload containers.
//!
//! The core never interprets payload bytes; encoding and decoding belong to
//! the data converter that sits outside this crate. The JSON helpers here
//! exist for built-in activities and tests, which exchange small JSON values.

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

/// A single opaque payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    /// Raw payload bytes. Interpretation is the data converter's business.
    pub data: Vec<u8>,
}

impl Payload {
    /// Wrap raw bytes in a payload.
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self { data: data.into() }
    }

    /// Encode a serializable value as a JSON payload.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            data: serde_json::to_vec(value)?,
        })
    }

    /// Decode the payload as JSON.
    pub fn from_json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.data)
    }
}

/// An ordered list of payloads, the unit carried by commands and events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payloads {
    pub payloads: Vec<Payload>,
}

impl Payloads {
    /// An empty payload list.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A single-element payload list.
    pub fn single(payload: Payload) -> Self {
        Self {
            payloads: vec![payload],
        }
    }

    /// Encode one serializable value as a single-element payload list.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::single(Payload::json(value)?))
    }

    /// Decode the first payload as JSON.
    pub fn first_json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match self.payloads.first() {
            Some(payload) => payload.from_json(),
            None => serde_json::from_slice(b"null"),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }
}

impl From<Payload> for Payloads {
    fn from(payload: Payload) -> Self {
        Self::single(payload)
    }
}
