//! Remote feed wire types and the comma-packed payload parser.
//!
//! Every numbered field of a feed entry carries several sensor values packed
//! into one string (`"24.5,6.8,41,312"`).  Devices drop fields while they
//! reboot and the store happily returns `null`, so decoding is total: any
//! position that cannot be read becomes `0.0`.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Highest numbered field the remote store exposes per channel.
pub const MAX_FIELD: u8 = 8;

// ---------------------------------------------------------------------------
// Channel kinds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// Field node: temperature, pH, water level, light.
    Environment,
    /// Soil probe: nitrogen, phosphorus, potassium.
    Nutrient,
}

impl ChannelKind {
    pub fn arity(self) -> usize {
        self.labels().len()
    }

    pub fn labels(self) -> &'static [&'static str] {
        match self {
            Self::Environment => &["temperature", "ph", "water_level", "light"],
            Self::Nutrient => &["nitrogen", "phosphorus", "potassium"],
        }
    }
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Decode a comma-packed payload into exactly `arity` numbers.
///
/// Missing, empty, unparsable and non-finite tokens decode to `0.0`; short
/// payloads are zero-filled and surplus tokens are ignored.
pub fn parse_fields(raw: Option<&str>, arity: usize) -> Vec<f64> {
    let mut values = vec![0.0; arity];
    let Some(raw) = raw else {
        return values;
    };

    for (slot, token) in values.iter_mut().zip(raw.split(',')) {
        *slot = token
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .unwrap_or(0.0);
    }
    values
}

// ---------------------------------------------------------------------------
// Wire types (GET /channels/<id>/feeds.json)
// ---------------------------------------------------------------------------

/// Only the entries are kept; the `channel` metadata block is skipped.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeedPage {
    #[serde(default)]
    pub feeds: Vec<Feed>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Feed {
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub entry_id: Option<u64>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub field1: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub field2: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub field3: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub field4: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub field5: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub field6: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub field7: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub field8: Option<String>,
}

impl Feed {
    /// Raw text of numbered field `n` (1-based). Out-of-range numbers read
    /// as absent.
    pub fn field(&self, n: u8) -> Option<&str> {
        let slot = match n {
            1 => &self.field1,
            2 => &self.field2,
            3 => &self.field3,
            4 => &self.field4,
            5 => &self.field5,
            6 => &self.field6,
            7 => &self.field7,
            8 => &self.field8,
            _ => return None,
        };
        slot.as_deref()
    }

    /// `created_at` as a timestamp, if the store sent a valid RFC 3339 one.
    pub fn created_at(&self) -> Option<OffsetDateTime> {
        self.created_at
            .as_deref()
            .and_then(|s| OffsetDateTime::parse(s, &Rfc3339).ok())
    }

    /// Build a typed reading from numbered field `field` of this entry.
    pub fn reading(&self, channel: &str, kind: ChannelKind, field: u8) -> Reading {
        Reading {
            channel: channel.to_string(),
            kind,
            values: parse_fields(self.field(field), kind.arity()),
            entry_id: self.entry_id,
            recorded_at: self.created_at().unwrap_or_else(OffsetDateTime::now_utc),
        }
    }
}

/// Accept string, number or null for a feed field; numbers become text so
/// the payload parser sees them like any other token.
fn lenient_text<'de, D>(de: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(de)?;
    Ok(match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

// ---------------------------------------------------------------------------
// Readings
// ---------------------------------------------------------------------------

/// One decoded sample of a monitored channel. Replaced wholesale by the next
/// successful poll, never edited.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub channel: String,
    pub kind: ChannelKind,
    pub values: Vec<f64>,
    pub entry_id: Option<u64>,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

/// Nitrogen / phosphorus / potassium triple.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Npk {
    pub n: f64,
    pub p: f64,
    pub k: f64,
}

impl Reading {
    /// The NPK triple of a nutrient reading; `None` for other kinds.
    pub fn npk(&self) -> Option<Npk> {
        match (self.kind, self.values.as_slice()) {
            (ChannelKind::Nutrient, [n, p, k]) => Some(Npk {
                n: *n,
                p: *p,
                k: *k,
            }),
            _ => None,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- parse_fields -------------------------------------------------------

    #[test]
    fn parse_fields_full_payload() {
        assert_eq!(
            parse_fields(Some("24.5,6.8,41,312"), 4),
            vec![24.5, 6.8, 41.0, 312.0]
        );
    }

    #[test]
    fn parse_fields_trims_whitespace() {
        assert_eq!(parse_fields(Some(" 10 , 20 ,30 "), 3), vec![10.0, 20.0, 30.0]);
    }

    #[test]
    fn parse_fields_absent_payload_is_all_zero() {
        assert_eq!(parse_fields(None, 4), vec![0.0; 4]);
    }

    #[test]
    fn parse_fields_empty_payload_is_all_zero() {
        assert_eq!(parse_fields(Some(""), 3), vec![0.0; 3]);
    }

    #[test]
    fn parse_fields_short_payload_zero_fills() {
        assert_eq!(parse_fields(Some("24.5,6.8,41"), 4), vec![24.5, 6.8, 41.0, 0.0]);
    }

    #[test]
    fn parse_fields_garbage_tokens_become_zero() {
        assert_eq!(
            parse_fields(Some("abc,,12x,7"), 4),
            vec![0.0, 0.0, 0.0, 7.0]
        );
    }

    #[test]
    fn parse_fields_non_finite_tokens_become_zero() {
        assert_eq!(parse_fields(Some("NaN,inf,-inf"), 3), vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn parse_fields_surplus_tokens_ignored() {
        assert_eq!(parse_fields(Some("1,2,3,4,5"), 3), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn parse_fields_length_always_matches_arity() {
        let payloads = [
            None,
            Some(""),
            Some(","),
            Some(",,,,,,,,"),
            Some("1"),
            Some("x,y"),
            Some("  "),
            Some("1,2,3,4,5,6"),
        ];
        for raw in payloads {
            for arity in 0..6 {
                let out = parse_fields(raw, arity);
                assert_eq!(out.len(), arity, "payload {raw:?} arity {arity}");
                assert!(out.iter().all(|v| v.is_finite()));
            }
        }
    }

    // -- Feed decoding ------------------------------------------------------

    #[test]
    fn feed_page_decodes_typical_response() {
        let json = r#"{
            "channel": {"id": 3232296, "name": "farm", "last_entry_id": 88},
            "feeds": [{
                "created_at": "2024-05-01T10:00:00Z",
                "entry_id": 88,
                "field1": "24.5,6.8,41,312",
                "field2": null,
                "field3": "45,35,45"
            }]
        }"#;
        let page: FeedPage = serde_json::from_str(json).unwrap();
        assert_eq!(page.feeds.len(), 1);
        let feed = &page.feeds[0];
        assert_eq!(feed.entry_id, Some(88));
        assert_eq!(feed.field(1), Some("24.5,6.8,41,312"));
        assert_eq!(feed.field(2), None);
        assert_eq!(feed.field(3), Some("45,35,45"));
        assert_eq!(feed.field(4), None);
    }

    #[test]
    fn feed_numeric_field_becomes_text() {
        let json = r#"{"feeds":[{"field2": 1, "field3": 0.5}]}"#;
        let page: FeedPage = serde_json::from_str(json).unwrap();
        assert_eq!(page.feeds[0].field(2), Some("1"));
        assert_eq!(page.feeds[0].field(3), Some("0.5"));
    }

    #[test]
    fn feed_page_without_feeds_is_empty() {
        let page: FeedPage = serde_json::from_str("{}").unwrap();
        assert!(page.feeds.is_empty());
    }

    #[test]
    fn feed_field_out_of_range_is_absent() {
        let feed = Feed {
            field1: Some("1".into()),
            ..Feed::default()
        };
        assert_eq!(feed.field(0), None);
        assert_eq!(feed.field(9), None);
    }

    #[test]
    fn feed_reading_uses_created_at() {
        let feed = Feed {
            created_at: Some("2024-05-01T10:00:00Z".into()),
            entry_id: Some(7),
            field3: Some("45,35".into()),
            ..Feed::default()
        };
        let reading = feed.reading("npk", ChannelKind::Nutrient, 3);
        assert_eq!(reading.values, vec![45.0, 35.0, 0.0]);
        assert_eq!(reading.entry_id, Some(7));
        assert_eq!(reading.recorded_at.unix_timestamp(), 1_714_557_600);
    }

    #[test]
    fn feed_reading_bad_timestamp_falls_back_to_now() {
        let feed = Feed {
            created_at: Some("yesterday".into()),
            ..Feed::default()
        };
        let before = OffsetDateTime::now_utc();
        let reading = feed.reading("node1", ChannelKind::Environment, 1);
        assert!(reading.recorded_at >= before);
        assert_eq!(reading.values, vec![0.0; 4]);
    }

    // -- Npk ----------------------------------------------------------------

    #[test]
    fn npk_only_for_nutrient_readings() {
        let feed = Feed {
            field1: Some("1,2,3,4".into()),
            field3: Some("10,20,30".into()),
            ..Feed::default()
        };
        let env = feed.reading("node1", ChannelKind::Environment, 1);
        assert!(env.npk().is_none());

        let npk = feed.reading("npk", ChannelKind::Nutrient, 3).npk().unwrap();
        assert_eq!((npk.n, npk.p, npk.k), (10.0, 20.0, 30.0));
    }
}
