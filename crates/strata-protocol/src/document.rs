// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Replicated document model.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub const FIELD_NAME_SELF_LINK: &str = "documentSelfLink";
pub const FIELD_NAME_KIND: &str = "documentKind";
pub const FIELD_NAME_VERSION: &str = "documentVersion";
pub const FIELD_NAME_UPDATE_TIME_MICROS: &str = "documentUpdateTimeMicros";

/// Fields owned by the host, never by a producer.
pub const META_FIELDS: [&str; 4] = [
    FIELD_NAME_SELF_LINK,
    FIELD_NAME_KIND,
    FIELD_NAME_VERSION,
    FIELD_NAME_UPDATE_TIME_MICROS,
];

fn is_zero(value: &u64) -> bool {
    *value == 0
}

/// Metadata common to every document, flattened into the document body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_self_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_kind: Option<String>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub document_version: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub document_update_time_micros: u64,
}

impl DocumentMeta {
    /// Metadata pointing at an explicit self-link, used when POSTing a
    /// document whose link the caller chooses.
    pub fn with_self_link(link: impl Into<String>) -> Self {
        Self {
            document_self_link: Some(link.into()),
            ..Self::default()
        }
    }
}

/// A typed document body.
pub trait ServiceDocument:
    Serialize + DeserializeOwned + Clone + Default + Send + Sync + 'static
{
    /// Kind tag stored in `documentKind`.
    const KIND: &'static str;

    fn meta(&self) -> &DocumentMeta;

    fn meta_mut(&mut self) -> &mut DocumentMeta;

    fn self_link(&self) -> Option<&str> {
        self.meta().document_self_link.as_deref()
    }
}
