use std::{borrow::Borrow, fmt};

use anyhow::{Context, Result};
use aya::maps::{HashMap as BpfHashMap, MapData, MapError};
use chrono::{DateTime, Utc};
use serde_json::{Map as JsonMap, Number as JsonNumber, Value};

use probe_counter_common::{
    FixedTable, HTTP_METRICS_MAP, HttpCategory, TCP_METRICS_MAP, TcpCategory,
};

/// Point lookups against a counter table. `Ok(None)` is a logical zero.
pub trait CounterSource {
    fn lookup(&self, key: u32) -> Result<Option<u64>>;
}

impl<T: Borrow<MapData>> CounterSource for BpfHashMap<T, u32, u64> {
    fn lookup(&self, key: u32) -> Result<Option<u64>> {
        match self.get(&key, 0) {
            Ok(count) => Ok(Some(count)),
            Err(MapError::KeyNotFound) => Ok(None),
            Err(err) => Err(err).with_context(|| format!("lookup of key {key} failed")),
        }
    }
}

impl<const N: usize> CounterSource for FixedTable<N> {
    fn lookup(&self, key: u32) -> Result<Option<u64>> {
        Ok(self.get(key))
    }
}

/// The recognized counters, read key by key. Two counters may reflect writes
/// from different moments.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct MetricsSnapshot {
    pub tcp_connect: Option<u64>,
    pub tcp_accept: Option<u64>,
    pub http_get: Option<u64>,
}

impl MetricsSnapshot {
    pub fn read<T, H>(tcp: &T, http: &H) -> Result<Self>
    where
        T: CounterSource + ?Sized,
        H: CounterSource + ?Sized,
    {
        Ok(Self {
            tcp_connect: tcp
                .lookup(TcpCategory::Connect.key())
                .with_context(|| format!("reading {TCP_METRICS_MAP}"))?,
            tcp_accept: tcp
                .lookup(TcpCategory::Accept.key())
                .with_context(|| format!("reading {TCP_METRICS_MAP}"))?,
            http_get: http
                .lookup(HttpCategory::Get.key())
                .with_context(|| format!("reading {HTTP_METRICS_MAP}"))?,
        })
    }

    pub fn tcp(&self, category: TcpCategory) -> Option<u64> {
        match category {
            TcpCategory::Connect => self.tcp_connect,
            TcpCategory::Accept => self.tcp_accept,
        }
    }

    pub fn http(&self, category: HttpCategory) -> Option<u64> {
        match category {
            HttpCategory::Get => self.http_get,
        }
    }

    pub fn to_json(&self, collected_at: DateTime<Utc>) -> Value {
        let mut tcp = JsonMap::new();
        for category in TcpCategory::ALL {
            tcp.insert(category.label().to_string(), count_value(self.tcp(category)));
        }
        let mut http = JsonMap::new();
        for category in HttpCategory::ALL {
            http.insert(category.label().to_string(), count_value(self.http(category)));
        }

        let mut obj = JsonMap::new();
        obj.insert(
            "collected_at".to_string(),
            Value::String(collected_at.to_rfc3339()),
        );
        obj.insert(TCP_METRICS_MAP.to_string(), Value::Object(tcp));
        obj.insert(HTTP_METRICS_MAP.to_string(), Value::Object(http));
        Value::Object(obj)
    }
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tcp connect: {} accept: {} http GET: {}",
            self.tcp_connect.unwrap_or(0),
            self.tcp_accept.unwrap_or(0),
            self.http_get.unwrap_or(0)
        )
    }
}

fn count_value(count: Option<u64>) -> Value {
    match count {
        Some(n) => Value::Number(JsonNumber::from(n)),
        None => Value::Null,
    }
}

/// Increase of every counter since the previous report.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct MetricsDelta {
    pub tcp_connect: u64,
    pub tcp_accept: u64,
    pub http_get: u64,
}

impl MetricsDelta {
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

impl fmt::Display for MetricsDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "+{} connect +{} accept +{} GET",
            self.tcp_connect, self.tcp_accept, self.http_get
        )
    }
}

/// Turns successive snapshots into increases. A counter that reads lower than
/// before (or absent) reports no increase and keeps its baseline.
#[derive(Debug, Default)]
pub struct DeltaTracker {
    last: MetricsDelta,
}

impl DeltaTracker {
    pub fn observe(&mut self, snapshot: &MetricsSnapshot) -> MetricsDelta {
        MetricsDelta {
            tcp_connect: advance(&mut self.last.tcp_connect, snapshot.tcp_connect),
            tcp_accept: advance(&mut self.last.tcp_accept, snapshot.tcp_accept),
            http_get: advance(&mut self.last.http_get, snapshot.http_get),
        }
    }
}

fn advance(last: &mut u64, current: Option<u64>) -> u64 {
    match current {
        Some(value) if value > *last => {
            let delta = value - *last;
            *last = value;
            delta
        }
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use probe_counter_common::classify::{on_inbound_accept, on_outbound_connect, on_write_entry};

    #[test]
    fn snapshot_reads_recognized_keys() {
        let tcp: FixedTable = FixedTable::new();
        let http: FixedTable = FixedTable::new();
        for _ in 0..3 {
            on_outbound_connect(&tcp);
        }
        on_inbound_accept(&tcp);
        on_inbound_accept(&tcp);
        on_write_entry(&http, &b"GET /x"[..]);
        on_write_entry(&http, &b"PUT /x"[..]);

        let snapshot = MetricsSnapshot::read(&tcp, &http).unwrap();
        assert_eq!(
            snapshot,
            MetricsSnapshot {
                tcp_connect: Some(3),
                tcp_accept: Some(2),
                http_get: Some(1),
            }
        );
        assert_eq!(snapshot.to_string(), "tcp connect: 3 accept: 2 http GET: 1");
    }

    #[test]
    fn empty_tables_read_as_absent() {
        let tcp: FixedTable = FixedTable::new();
        let http: FixedTable = FixedTable::new();
        let snapshot = MetricsSnapshot::read(&tcp, &http).unwrap();
        assert_eq!(snapshot, MetricsSnapshot::default());
    }

    #[test]
    fn json_uses_table_and_category_names() {
        let snapshot = MetricsSnapshot {
            tcp_connect: Some(7),
            tcp_accept: None,
            http_get: Some(u64::MAX),
        };
        let at = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let json = snapshot.to_json(at);

        assert_eq!(json["collected_at"], Value::String(at.to_rfc3339()));
        assert_eq!(json["tcp_metrics"]["connect"], Value::Number(JsonNumber::from(7)));
        assert_eq!(json["tcp_metrics"]["accept"], Value::Null);
        assert_eq!(
            json["http_metrics"]["GET"],
            Value::Number(JsonNumber::from(u64::MAX))
        );
    }

    #[test]
    fn tracker_reports_increases_only() {
        let mut tracker = DeltaTracker::default();

        let first = tracker.observe(&MetricsSnapshot {
            tcp_connect: Some(3),
            tcp_accept: None,
            http_get: Some(1),
        });
        assert_eq!(
            first,
            MetricsDelta {
                tcp_connect: 3,
                tcp_accept: 0,
                http_get: 1,
            }
        );

        let second = tracker.observe(&MetricsSnapshot {
            tcp_connect: Some(5),
            tcp_accept: Some(2),
            http_get: Some(1),
        });
        assert_eq!(second.to_string(), "+2 connect +2 accept +0 GET");

        let unchanged = tracker.observe(&MetricsSnapshot {
            tcp_connect: Some(5),
            tcp_accept: Some(2),
            http_get: Some(1),
        });
        assert!(unchanged.is_zero());
    }

    #[test]
    fn tracker_keeps_baseline_when_tables_are_recreated() {
        let mut tracker = DeltaTracker::default();
        tracker.observe(&MetricsSnapshot {
            tcp_connect: Some(10),
            ..MetricsSnapshot::default()
        });

        let reset = tracker.observe(&MetricsSnapshot::default());
        assert!(reset.is_zero());

        let lower = tracker.observe(&MetricsSnapshot {
            tcp_connect: Some(4),
            ..MetricsSnapshot::default()
        });
        assert!(lower.is_zero());

        let past = tracker.observe(&MetricsSnapshot {
            tcp_connect: Some(12),
            ..MetricsSnapshot::default()
        });
        assert_eq!(past.tcp_connect, 2);
    }
}
