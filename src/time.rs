use chrono::{DateTime, Utc};

/// Milliseconds since the Unix epoch. The engine works internally in millis so that backoff
/// arithmetic and lease-expiry comparisons are plain integer math; the persisted blob still
/// renders timestamps as RFC 3339 strings (§6.1).
pub type TsMillis = i64;

pub fn now_millis() -> TsMillis {
    Utc::now().timestamp_millis()
}

pub fn to_datetime(ts: TsMillis) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ts).unwrap_or_else(Utc::now)
}

pub fn from_datetime(dt: DateTime<Utc>) -> TsMillis {
    dt.timestamp_millis()
}

/// Parses an RFC 3339 / ISO-8601 timestamp (the wire format `until` effects and commands use)
/// into millis.
pub fn parse_iso8601(s: &str) -> anyhow::Result<TsMillis> {
    let dt = DateTime::parse_from_rfc3339(s)?;
    Ok(dt.with_timezone(&Utc).timestamp_millis())
}

pub fn to_iso8601(ts: TsMillis) -> String {
    to_datetime(ts).to_rfc3339()
}

/// `serde(with = "...")` adapter rendering a `TsMillis` field as an RFC 3339 string on the wire
/// (§3 "ISO-8601 timestamps", §6.1), while every in-process comparison/arithmetic site keeps
/// working against the plain millisecond integer.
pub mod ts_format {
    use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};

    use super::TsMillis;

    pub fn serialize<S>(ts: &TsMillis, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        super::to_iso8601(*ts).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<TsMillis, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        super::parse_iso8601(&s).map_err(D::Error::custom)
    }
}

/// As `ts_format`, for `Option<TsMillis>` fields (`next_wake`, `until`, `run_after` overrides).
pub mod opt_ts_format {
    use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};

    use super::TsMillis;

    pub fn serialize<S>(ts: &Option<TsMillis>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        ts.map(super::to_iso8601).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<TsMillis>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt = Option::<String>::deserialize(deserializer)?;
        opt.map(|s| super::parse_iso8601(&s).map_err(D::Error::custom)).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iso8601_round_trips_through_millis() {
        let ts = parse_iso8601("2026-07-29T12:00:00Z").unwrap();
        assert_eq!(to_iso8601(ts), "2026-07-29T12:00:00+00:00");
        assert_eq!(parse_iso8601(&to_iso8601(ts)).unwrap(), ts);
    }
}
