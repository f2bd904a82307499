//! Shared content record schema
//!
//! Records travel as JSON documents: clients sign the JSON body they submit,
//! peers exchange the same documents over gossip links, and the store persists
//! them unchanged. Unknown keys are rejected at every nesting level.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix time in seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

// =============================================================================
// SHARED RECORD
// =============================================================================

/// One authenticated, timestamped content-sharing announcement.
///
/// `id` and `created` are optional on a direct submission (the accepting node
/// fills them in) but mandatory on anything received from a peer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SharedRecord {
    /// Globally unique, immutable identifier
    #[serde(default, alias = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Submitter's compressed public key (base64)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    /// Unix seconds, assigned by the accepting node's clock
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<i64>,
    /// Opaque caller reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_ref: Option<String>,
    pub content: Content,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Conditions>,
}

impl SharedRecord {
    /// Minimal record pointing at `url`.
    pub fn new(url: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            id: None,
            public_key: None,
            created: None,
            external_ref: None,
            content: Content {
                url: url.into(),
                mime_type: mime_type.into(),
                width: None,
                width_range: None,
                ratio: None,
                ratio_range: None,
            },
            meta: None,
            conditions: None,
        }
    }

    /// A record is self-describing once it carries both `id` and `created`.
    pub fn is_self_describing(&self) -> bool {
        self.id.is_some() && self.created.is_some()
    }

    /// Tags in `meta`, if any.
    pub fn tags(&self) -> &[String] {
        self.meta
            .as_ref()
            .and_then(|m| m.tags.as_deref())
            .unwrap_or(&[])
    }
}

// =============================================================================
// CONTENT
// =============================================================================

/// The shared resource itself
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Content {
    pub url: String,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width_range: Option<Range<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ratio: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ratio_range: Option<Range<f64>>,
}

/// Bounded interval; at least one bound, at most one bound per side.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Range<T> {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gt: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gte: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lt: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lte: Option<T>,
}

impl<T: Copy + PartialOrd> Range<T> {
    /// Check the bound combination is a usable interval.
    pub fn is_well_formed(&self) -> bool {
        if self.gt.is_some() && self.gte.is_some() {
            return false;
        }
        if self.lt.is_some() && self.lte.is_some() {
            return false;
        }
        let lower = self.gt.or(self.gte);
        let upper = self.lt.or(self.lte);
        match (lower, upper) {
            (None, None) => false,
            (Some(lo), Some(hi)) => lo <= hi,
            _ => true,
        }
    }

    fn bounds(&self) -> impl Iterator<Item = T> {
        [self.gt, self.gte, self.lt, self.lte].into_iter().flatten()
    }
}

impl Range<f64> {
    /// Every bound present is a finite number.
    pub fn is_finite(&self) -> bool {
        self.bounds().all(f64::is_finite)
    }
}

// =============================================================================
// META
// =============================================================================

/// Descriptive metadata
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Meta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<Image>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// ISO 639-3 code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

/// Preview image
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Image {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

/// Geographic scope, either Well-Known Text or a GeoJSON geometry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Location {
    Wkt(String),
    GeoJson(Geometry),
}

/// GeoJSON geometry object
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Geometry {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometries: Option<Vec<Geometry>>,
}

// =============================================================================
// CONDITIONS
// =============================================================================

/// Usage conditions attached to the content
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Conditions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copyright: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<Price>,
    /// Unix seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<i64>,
    /// Unix seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<i64>,
}

/// Price terms
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Price {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub for_consumer: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub for_connector: Option<f64>,
    /// ISO 4217 code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    /// Free-form pricing details (model, platform, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Map<String, serde_json::Value>>,
}
