//! Core types for the membership store.

use crate::error::{CohortError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::{Date, Month, OffsetDateTime, Time};

/// Identifier of a subject ("user").
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserId({})", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl UserId {
    /// Broker partition key: the decimal id.
    pub fn key(self) -> String {
        self.0.to_string()
    }
}

/// Internal segment identifier (the join key).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentId(pub i64);

impl fmt::Debug for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SegmentId({})", self.0)
    }
}

/// External segment name, e.g. `DISCOUNT_30`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Slug(String);

impl Slug {
    pub fn new(slug: impl Into<String>) -> Self {
        Slug(slug.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl From<&str> for Slug {
    fn from(s: &str) -> Self {
        Slug(s.to_string())
    }
}

impl From<String> for Slug {
    fn from(s: String) -> Self {
        Slug(s)
    }
}

impl fmt::Debug for Slug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Slug({})", self.0)
    }
}

impl fmt::Display for Slug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Microseconds since Unix epoch, UTC.
///
/// Serialized as an RFC3339 string; stored in the database as the raw
/// microsecond count so ordering comparisons stay in SQL.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        Self::from_datetime(OffsetDateTime::now_utc())
    }

    pub fn from_datetime(dt: OffsetDateTime) -> Self {
        Timestamp((dt.unix_timestamp_nanos() / 1_000) as i64)
    }

    pub fn to_datetime(self) -> Result<OffsetDateTime> {
        OffsetDateTime::from_unix_timestamp_nanos(i128::from(self.0) * 1_000)
            .map_err(|e| CohortError::InvalidTtl(format!("{} out of range: {e}", self.0)))
    }

    /// Parse an RFC3339 timestamp (any offset; normalized to UTC).
    pub fn parse_rfc3339(input: &str) -> Result<Self> {
        OffsetDateTime::parse(input, &Rfc3339)
            .map(Self::from_datetime)
            .map_err(|e| CohortError::InvalidTtl(format!("{input:?}: {e}")))
    }

    pub fn to_rfc3339(self) -> Result<String> {
        self.to_datetime()?
            .format(&Rfc3339)
            .map_err(|e| CohortError::Serialization(e.to_string()))
    }

    pub fn plus(self, d: Duration) -> Self {
        Timestamp(self.0.saturating_add(d.as_micros() as i64))
    }

    pub fn minus(self, d: Duration) -> Self {
        Timestamp(self.0.saturating_sub(d.as_micros() as i64))
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_rfc3339() {
            Ok(s) => f.write_str(&s),
            Err(_) => write!(f, "{}us", self.0),
        }
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let s = self.to_rfc3339().map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&s)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Timestamp::parse_rfc3339(&s).map_err(serde::de::Error::custom)
    }
}

/// Inclusive `[start, end]` range covering one calendar month given as
/// `YYYY-MM`.
pub fn month_range(input: &str) -> Result<(Timestamp, Timestamp)> {
    let invalid = || CohortError::InvalidRequest(format!("invalid month {input:?}, want YYYY-MM"));

    let (year, month) = input.split_once('-').ok_or_else(invalid)?;
    if year.len() != 4 || month.len() != 2 {
        return Err(invalid());
    }
    let year: i32 = year.parse().map_err(|_| invalid())?;
    let month: u8 = month.parse().map_err(|_| invalid())?;
    let month = Month::try_from(month).map_err(|_| invalid())?;

    let first = Date::from_calendar_date(year, month, 1).map_err(|_| invalid())?;
    let (next_year, next_month) = match month {
        Month::December => (year + 1, Month::January),
        m => (year, m.next()),
    };
    let next = Date::from_calendar_date(next_year, next_month, 1).map_err(|_| invalid())?;

    let start = Timestamp::from_datetime(first.with_time(Time::MIDNIGHT).assume_utc());
    let end = Timestamp::from_datetime(next.with_time(Time::MIDNIGHT).assume_utc());
    Ok((start, Timestamp(end.0 - 1)))
}

/// Kind of membership change recorded in history.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Add,
    Delete,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Add => "ADD",
            Operation::Delete => "DELETE",
        }
    }
}

impl FromStr for Operation {
    type Err = CohortError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ADD" => Ok(Operation::Add),
            "DELETE" => Ok(Operation::Delete),
            other => Err(CohortError::InvalidFormat(format!("unknown operation {other:?}"))),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A subject's membership in one segment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub user_id: UserId,
    pub segment_id: SegmentId,
    pub segment: Slug,
    /// `None` means permanent.
    pub ttl: Option<Timestamp>,
}

/// One append-only history row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Row id, assigned on insert.
    pub id: Option<i64>,
    pub user_id: UserId,
    pub segment_slug: Slug,
    pub operation_type: Operation,
    pub operation_date: Timestamp,
}

impl HistoryEntry {
    /// Entry stamped with the current time.
    pub fn now(user_id: UserId, segment_slug: Slug, operation_type: Operation) -> Self {
        Self {
            id: None,
            user_id,
            segment_slug,
            operation_type,
            operation_date: Timestamp::now(),
        }
    }
}

/// Mutation payload as received from the API layer.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChangeRequest {
    pub user_id: i64,
    #[serde(default)]
    pub add_segments: Vec<String>,
    #[serde(default)]
    pub delete_segments: Vec<String>,
    /// RFC3339 expiry for the added segments.
    #[serde(default)]
    pub ttl: Option<String>,
}

impl ChangeRequest {
    /// Validate the payload into a [`MembershipChange`].
    ///
    /// Nothing is looked up here; only the shape of the request is checked.
    pub fn validate(&self) -> Result<MembershipChange> {
        let ttl = self
            .ttl
            .as_deref()
            .map(Timestamp::parse_rfc3339)
            .transpose()?;

        let change = MembershipChange::new(
            UserId(self.user_id),
            self.add_segments.iter().map(|s| Slug::new(s.as_str())),
            self.delete_segments.iter().map(|s| Slug::new(s.as_str())),
            ttl,
        );

        if let Some(blank) = change.add.iter().chain(&change.delete).find(|s| s.is_blank()) {
            return Err(CohortError::InvalidRequest(format!(
                "blank segment slug {:?}",
                blank.as_str()
            )));
        }

        Ok(change)
    }
}

/// A validated mutation: add-set, delete-set and optional expiry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MembershipChange {
    pub user_id: UserId,
    pub add: Vec<Slug>,
    pub delete: Vec<Slug>,
    pub ttl: Option<Timestamp>,
}

impl MembershipChange {
    /// Build a change; duplicate slugs within one side collapse to their
    /// first occurrence.
    pub fn new(
        user_id: UserId,
        add: impl IntoIterator<Item = Slug>,
        delete: impl IntoIterator<Item = Slug>,
        ttl: Option<Timestamp>,
    ) -> Self {
        Self {
            user_id,
            add: dedup(add),
            delete: dedup(delete),
            ttl,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.add.is_empty() && self.delete.is_empty()
    }
}

fn dedup(slugs: impl IntoIterator<Item = Slug>) -> Vec<Slug> {
    let mut out: Vec<Slug> = Vec::new();
    for slug in slugs {
        if !out.contains(&slug) {
            out.push(slug);
        }
    }
    out
}

/// Read-side view: current segments of one subject.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSegments {
    pub user_id: UserId,
    pub segments: Vec<Slug>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_rfc3339_roundtrip_keeps_micros() {
        let ts = Timestamp(1_700_000_000_123_456);
        let s = ts.to_rfc3339().unwrap();
        assert_eq!(Timestamp::parse_rfc3339(&s).unwrap(), ts);
    }

    #[test]
    fn test_timestamp_parse_normalizes_offset() {
        let utc = Timestamp::parse_rfc3339("2024-05-01T10:00:00Z").unwrap();
        let shifted = Timestamp::parse_rfc3339("2024-05-01T13:00:00+03:00").unwrap();
        assert_eq!(utc, shifted);
    }

    #[test]
    fn test_timestamp_rejects_garbage() {
        assert!(matches!(
            Timestamp::parse_rfc3339("tomorrow"),
            Err(CohortError::InvalidTtl(_))
        ));
    }

    #[test]
    fn test_month_range() {
        let (start, end) = month_range("2023-12").unwrap();
        assert_eq!(start, Timestamp::parse_rfc3339("2023-12-01T00:00:00Z").unwrap());
        assert_eq!(
            end.plus(Duration::from_micros(1)),
            Timestamp::parse_rfc3339("2024-01-01T00:00:00Z").unwrap()
        );

        assert!(month_range("2023-13").is_err());
        assert!(month_range("23-01").is_err());
        assert!(month_range("2023/01").is_err());
    }

    #[test]
    fn test_change_request_validation() {
        let req: ChangeRequest = serde_json::from_str(
            r#"{"user_id": 7, "add_segments": ["A", "B", "A"], "ttl": "2030-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        let change = req.validate().unwrap();

        assert_eq!(change.user_id, UserId(7));
        assert_eq!(change.add, vec![Slug::from("A"), Slug::from("B")]);
        assert!(change.delete.is_empty());
        assert!(change.ttl.is_some());
    }

    #[test]
    fn test_change_request_rejects_bad_ttl_and_blank_slug() {
        let bad_ttl = ChangeRequest {
            user_id: 1,
            add_segments: vec!["A".into()],
            ttl: Some("2030-01-01".into()),
            ..Default::default()
        };
        assert!(matches!(bad_ttl.validate(), Err(CohortError::InvalidTtl(_))));

        let blank = ChangeRequest {
            user_id: 1,
            delete_segments: vec!["  ".into()],
            ..Default::default()
        };
        assert!(matches!(blank.validate(), Err(CohortError::InvalidRequest(_))));
    }

    #[test]
    fn test_operation_parse() {
        assert_eq!("ADD".parse::<Operation>().unwrap(), Operation::Add);
        assert_eq!(Operation::Delete.to_string(), "DELETE");
        assert!("add".parse::<Operation>().is_err());
    }
}
