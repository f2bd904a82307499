//! Field-level validation of shared records
//!
//! `validate` is pure: it returns the ordered list of violations and never
//! touches storage. Callers choose the freshness window through
//! [`ValidateOptions`].

use crate::types::*;

/// Tolerated clock skew for records dated in the future.
pub const MAX_FUTURE_SECS: i64 = 60;
/// Default age limit for direct submissions.
pub const SUBMISSION_MAX_AGE_SECS: i64 = 2 * 60;

const GEOJSON_TYPES: &[&str] = &[
    "Point",
    "LineString",
    "Polygon",
    "MultiPoint",
    "MultiLineString",
    "MultiPolygon",
    "GeometryCollection",
];

const WKT_TYPES: &[&str] = &[
    "POINT",
    "LINESTRING",
    "POLYGON",
    "MULTIPOINT",
    "MULTILINESTRING",
    "MULTIPOLYGON",
    "GEOMETRYCOLLECTION",
    "BBOX",
];

/// Freshness window applied to `created`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ValidateOptions {
    /// Reference time (unix seconds)
    pub now: i64,
    /// Oldest accepted age in seconds
    pub max_age_secs: i64,
    /// Furthest accepted distance into the future in seconds
    pub max_future_secs: i64,
}

impl ValidateOptions {
    /// Tight window for records submitted directly to this node.
    pub fn submission(now: i64, max_age_secs: i64) -> Self {
        Self {
            now,
            max_age_secs,
            max_future_secs: MAX_FUTURE_SECS,
        }
    }

    /// Relaxed window for records replayed during catch-up.
    pub fn catch_up(now: i64, lookback_secs: i64) -> Self {
        Self {
            now,
            max_age_secs: lookback_secs,
            max_future_secs: MAX_FUTURE_SECS,
        }
    }
}

/// Validate a record, returning violations in field order (empty = valid).
pub fn validate(record: &SharedRecord, options: &ValidateOptions) -> Vec<String> {
    let mut errors = Vec::new();

    check_non_empty(&mut errors, "id", record.id.as_deref());
    check_non_empty(&mut errors, "publicKey", record.public_key.as_deref());
    check_non_empty(&mut errors, "externalRef", record.external_ref.as_deref());

    if let Some(created) = record.created {
        // Saturates for timestamps near the i64 range limits
        let age = options.now.saturating_sub(created);
        if age > options.max_age_secs {
            errors.push("\"created\" date is too old".to_string());
        }
        if age < options.max_future_secs.saturating_neg() {
            errors.push("\"created\" date is in the future".to_string());
        }
    }

    validate_content(&mut errors, &record.content);
    if let Some(meta) = &record.meta {
        validate_meta(&mut errors, meta);
    }
    if let Some(conditions) = &record.conditions {
        validate_conditions(&mut errors, conditions);
    }

    errors
}

fn validate_content(errors: &mut Vec<String>, content: &Content) {
    if !is_http_url(&content.url) {
        errors.push(
            "Parameter \"content.url\" is required and should start with \"http://\" or \"https://\""
                .to_string(),
        );
    }
    if !is_mime_type(&content.mime_type) {
        errors.push("Parameter \"content.mimeType\" is required and should be a mime type".to_string());
    }

    if let Some(range) = &content.width_range {
        if !range.is_well_formed() {
            errors.push("Parameter \"content.widthRange\" should be an integer range".to_string());
        }
    }
    if content.width.is_some() && content.width_range.is_some() {
        errors.push(
            "Parameter \"content.width\" and \"content.widthRange\" are incompatible".to_string(),
        );
    }

    if let Some(ratio) = content.ratio {
        if !ratio.is_finite() || ratio <= 0.0 {
            errors.push("Parameter \"content.ratio\" should be a positive number".to_string());
        }
    }
    if let Some(range) = &content.ratio_range {
        if !range.is_finite() || !range.is_well_formed() {
            errors.push("Parameter \"content.ratioRange\" should be a float range".to_string());
        }
    }
    if content.ratio.is_some() && content.ratio_range.is_some() {
        errors.push(
            "Parameter \"content.ratio\" and \"content.ratioRange\" are incompatible".to_string(),
        );
    }
}

fn validate_meta(errors: &mut Vec<String>, meta: &Meta) {
    if let Some(url) = meta.image.as_ref().and_then(|image| image.url.as_deref()) {
        if !is_http_url(url) {
            errors.push(
                "Parameter \"meta.image.url\" should start with \"http://\" or \"https://\""
                    .to_string(),
            );
        }
    }
    if let Some(locale) = &meta.locale {
        if !is_code(locale, |c| c.is_ascii_lowercase()) {
            errors.push("Parameter \"meta.locale\" should be a valid ISO 639-3 locale".to_string());
        }
    }
    if let Some(tags) = &meta.tags {
        if tags.iter().any(|tag| tag.trim().is_empty()) {
            errors.push("Parameter \"meta.tags\" should be an array of non-empty strings".to_string());
        }
    }
    if let Some(location) = &meta.location {
        let valid = match location {
            Location::Wkt(text) => is_wkt(text),
            Location::GeoJson(geometry) => is_geometry(geometry),
        };
        if !valid {
            errors.push(
                "Parameter \"meta.location\" should be a GeoJSON or Well-Known Text (WKT)"
                    .to_string(),
            );
        }
    }
}

fn validate_conditions(errors: &mut Vec<String>, conditions: &Conditions) {
    if let Some(price) = &conditions.price {
        for (name, value) in [
            ("forConsumer", price.for_consumer),
            ("forConnector", price.for_connector),
        ] {
            if value.is_some_and(|v| !v.is_finite()) {
                errors.push(format!(
                    "Parameter \"conditions.price.{name}\" should be a number"
                ));
            }
        }
        if let Some(currency) = &price.currency {
            if !is_code(currency, |c| c.is_ascii_uppercase()) {
                errors.push(
                    "Parameter \"conditions.price.currency\" should be a valid ISO 4217 currency"
                        .to_string(),
                );
            }
        }
    }
    if let (Some(from), Some(until)) = (conditions.valid_from, conditions.valid_until) {
        if from > until {
            errors.push(
                "Parameter \"conditions.validFrom\" should not be after \"conditions.validUntil\""
                    .to_string(),
            );
        }
    }
}

fn check_non_empty(errors: &mut Vec<String>, name: &str, value: Option<&str>) {
    if value.is_some_and(|v| v.trim().is_empty()) {
        errors.push(format!("Parameter \"{name}\" should be a non-empty string"));
    }
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

fn is_mime_type(value: &str) -> bool {
    let is_token = |part: &str| {
        !part.is_empty()
            && part
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "!#$&-^_.+".contains(c))
    };
    match value.split_once('/') {
        Some((kind, subtype)) => is_token(kind) && is_token(subtype),
        None => false,
    }
}

/// Three-letter code in the given letter case (ISO 639-3, ISO 4217 shape).
fn is_code(value: &str, letter: impl Fn(char) -> bool) -> bool {
    value.len() == 3 && value.chars().all(letter)
}

fn is_wkt(text: &str) -> bool {
    let text = text.trim_start();
    let head: String = text
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect();
    let rest = text[head.len()..].trim_start();
    WKT_TYPES.contains(&head.to_ascii_uppercase().as_str())
        && (rest.starts_with('(') || rest.starts_with("EMPTY") || rest.starts_with('Z') || rest.starts_with('M'))
}

fn is_geometry(geometry: &Geometry) -> bool {
    if !GEOJSON_TYPES.contains(&geometry.kind.as_str()) {
        return false;
    }
    if geometry.kind == "GeometryCollection" {
        geometry
            .geometries
            .as_ref()
            .is_some_and(|members| members.iter().all(is_geometry))
    } else {
        geometry
            .coordinates
            .as_ref()
            .is_some_and(serde_json::Value::is_array)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;
    const HOUR: i64 = 60 * 60;

    fn minimal() -> SharedRecord {
        SharedRecord::new("http://...", "text/html")
    }

    fn strict() -> ValidateOptions {
        ValidateOptions::submission(NOW, SUBMISSION_MAX_AGE_SECS)
    }

    #[test]
    fn test_minimal_record_is_valid() {
        assert!(validate(&minimal(), &strict()).is_empty());
    }

    #[test]
    fn test_complete_record_is_valid() {
        let record: SharedRecord = serde_json::from_value(serde_json::json!({
            "externalRef": "my-id",
            "content": {
                "url": "http://...",
                "mimeType": "text/html",
                "widthRange": { "gte": 300, "lte": 600 },
                "ratioRange": { "gte": 0.5, "lte": 0.75 }
            },
            "meta": {
                "title": "my title",
                "description": "my description",
                "image": { "url": "http://...", "width": 600, "height": 400 },
                "locale": "eng",
                "tags": ["here", "you", "go"],
                "location": {
                    "type": "Polygon",
                    "coordinates": [[[-88.7, 49.0], [-126.1, 49.1], [-125.4, 35.5], [-88.7, 49.0]]]
                }
            },
            "conditions": {
                "license": "WTFPL",
                "copyright": "© 2024 - Me",
                "price": {
                    "forConsumer": 0.05,
                    "forConnector": -3,
                    "currency": "USD",
                    "details": { "type": "CPM", "platform": "adcompany" }
                },
                "validFrom": NOW + 2 * HOUR,
                "validUntil": NOW + 72 * HOUR
            }
        }))
        .unwrap();
        assert_eq!(validate(&record, &strict()), Vec::<String>::new());
    }

    #[test]
    fn test_width_and_width_range_are_incompatible() {
        let mut record = minimal();
        record.content.width = Some(300);
        record.content.width_range = Some(Range { lt: Some(2), ..Default::default() });
        assert_eq!(
            validate(&record, &strict()),
            vec!["Parameter \"content.width\" and \"content.widthRange\" are incompatible"]
        );
    }

    #[test]
    fn test_ratio_and_ratio_range_are_incompatible() {
        let mut record = minimal();
        record.content.ratio = Some(0.75);
        record.content.ratio_range = Some(Range { gte: Some(2.0), ..Default::default() });
        assert_eq!(
            validate(&record, &strict()),
            vec!["Parameter \"content.ratio\" and \"content.ratioRange\" are incompatible"]
        );
    }

    #[test]
    fn test_malformed_ranges() {
        let mut record = minimal();
        record.content.width_range = Some(Range { lt: Some(2), lte: Some(2), ..Default::default() });
        record.content.ratio_range = Some(Range { gt: Some(f64::NAN), ..Default::default() });
        assert_eq!(
            validate(&record, &strict()),
            vec![
                "Parameter \"content.widthRange\" should be an integer range",
                "Parameter \"content.ratioRange\" should be a float range",
            ]
        );
    }

    #[test]
    fn test_created_at_range_limits() {
        let mut record = minimal();
        record.created = Some(i64::MIN);
        assert_eq!(validate(&record, &strict()), vec!["\"created\" date is too old"]);

        record.created = Some(i64::MAX);
        assert_eq!(validate(&record, &strict()), vec!["\"created\" date is in the future"]);

        let lax = ValidateOptions {
            now: NOW,
            max_age_secs: i64::MAX,
            max_future_secs: i64::MAX,
        };
        record.created = Some(i64::MIN);
        assert!(validate(&record, &lax).is_empty());
    }

    #[test]
    fn test_created_freshness_window() {
        let mut record = minimal();

        record.created = Some(NOW);
        assert!(validate(&record, &strict()).is_empty());

        record.created = Some(NOW - 3 * 60);
        assert_eq!(validate(&record, &strict()), vec!["\"created\" date is too old"]);

        record.created = Some(NOW + 3 * 60);
        assert_eq!(validate(&record, &strict()), vec!["\"created\" date is in the future"]);
    }

    #[test]
    fn test_catch_up_window_accepts_older_records() {
        let mut record = minimal();
        record.created = Some(NOW - 5 * HOUR);

        assert_eq!(validate(&record, &strict()), vec!["\"created\" date is too old"]);
        assert!(validate(&record, &ValidateOptions::catch_up(NOW, 24 * HOUR)).is_empty());

        record.created = Some(NOW + 3 * 60);
        assert_eq!(
            validate(&record, &ValidateOptions::catch_up(NOW, 24 * HOUR)),
            vec!["\"created\" date is in the future"]
        );
    }

    #[test]
    fn test_content_url_and_mime_type() {
        let mut record = SharedRecord::new("24", "24");
        assert_eq!(validate(&record, &strict()).len(), 2);

        record.content.url = "https://example.org".into();
        record.content.mime_type = "image/png".into();
        assert!(validate(&record, &strict()).is_empty());
    }

    #[test]
    fn test_meta_fields() {
        let mut record = minimal();
        record.meta = Some(Meta {
            image: Some(Image { url: Some("24".into()), ..Default::default() }),
            locale: Some("en-en".into()),
            tags: Some(vec!["ok".into(), " ".into()]),
            location: Some(Location::Wkt("-77.03653 38.897676".into())),
            ..Default::default()
        });
        assert_eq!(
            validate(&record, &strict()),
            vec![
                "Parameter \"meta.image.url\" should start with \"http://\" or \"https://\"",
                "Parameter \"meta.locale\" should be a valid ISO 639-3 locale",
                "Parameter \"meta.tags\" should be an array of non-empty strings",
                "Parameter \"meta.location\" should be a GeoJSON or Well-Known Text (WKT)",
            ]
        );
    }

    #[test]
    fn test_location_formats() {
        let mut record = minimal();
        for (location, valid) in [
            (Location::Wkt("POINT (-77.03653 38.897676)".into()), true),
            (Location::Wkt("polygon ((0 0, 1 1, 1 0, 0 0))".into()), true),
            (Location::Wkt("CIRCLE (1 2)".into()), false),
            (
                Location::GeoJson(Geometry {
                    kind: "Point".into(),
                    coordinates: Some(serde_json::json!([-77.03653, 38.897676])),
                    geometries: None,
                }),
                true,
            ),
            (
                Location::GeoJson(Geometry {
                    kind: "Point".into(),
                    coordinates: None,
                    geometries: None,
                }),
                false,
            ),
        ] {
            record.meta = Some(Meta { location: Some(location), ..Default::default() });
            assert_eq!(validate(&record, &strict()).is_empty(), valid);
        }
    }

    #[test]
    fn test_conditions() {
        let mut record = minimal();
        record.conditions = Some(Conditions {
            price: Some(Price {
                for_consumer: Some(f64::INFINITY),
                currency: Some("$".into()),
                ..Default::default()
            }),
            valid_from: Some(NOW + 72 * HOUR),
            valid_until: Some(NOW + 2 * HOUR),
            ..Default::default()
        });
        assert_eq!(
            validate(&record, &strict()),
            vec![
                "Parameter \"conditions.price.forConsumer\" should be a number",
                "Parameter \"conditions.price.currency\" should be a valid ISO 4217 currency",
                "Parameter \"conditions.validFrom\" should not be after \"conditions.validUntil\"",
            ]
        );

        record.conditions = Some(Conditions {
            price: Some(Price { currency: Some("BTC".into()), ..Default::default() }),
            ..Default::default()
        });
        assert!(validate(&record, &strict()).is_empty());
    }

    #[test]
    fn test_empty_identifiers() {
        let mut record = minimal();
        record.id = Some(String::new());
        record.public_key = Some(" ".into());
        assert_eq!(
            validate(&record, &strict()),
            vec![
                "Parameter \"id\" should be a non-empty string",
                "Parameter \"publicKey\" should be a non-empty string",
            ]
        );
    }
}
