use derive_more::Display;
use internment::Intern;
use num_enum::{FromPrimitive, IntoPrimitive};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use event::{EventRecord, LogOptions, RequestContext};

pub mod event;

/// Open string-keyed attribute map carried by every event record.
///
/// Keys iterate in sorted order by construction, so the canonical
/// serialization used for dedup hashing never depends on insertion order.
pub type Details = BTreeMap<String, AttrValue>;

/// Number of distinct priority levels.
pub const PRIORITY_LEVELS: usize = 5;

/// Interned event kind tag (e.g. `auth.login`, `payment.declined`).
pub type Kind = Intern<String>;

/// Interned producer identity tag.
pub type Source = Intern<String>;

/// Dispatch priority of an event record, ordered most- to least-urgent.
///
/// The priority selects the batch-size and wait-time thresholds used by the
/// flush scheduler; see [`crate::config::BatchPolicy`].
#[derive(
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Debug,
    Display,
    IntoPrimitive,
    FromPrimitive,
    Serialize,
    Deserialize,
)]
#[repr(u8)]
#[serde(rename_all = "kebab-case")]
pub enum Priority {
    #[display("CRITICAL")]
    Critical = 0,
    #[display("HIGH")]
    High = 1,
    #[display("MEDIUM")]
    Medium = 2,
    #[display("LOW")]
    Low = 3,
    #[display("INFO")]
    #[num_enum(default)]
    Info = 4,
}

impl Priority {
    /// Every priority level, most-urgent first. This is also the strict
    /// drain order used by `flush_all`.
    pub const ALL: [Priority; PRIORITY_LEVELS] = [
        Priority::Critical,
        Priority::High,
        Priority::Medium,
        Priority::Low,
        Priority::Info,
    ];

    pub(crate) fn index(self) -> usize {
        u8::from(self) as usize
    }
}

/// Attribute values supported by [`Details`] maps.
///
/// A closed set of serializable variants: non-serializable values are
/// unrepresentable, so every record admitted into the pipeline has a
/// stable dedup key.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    UnsignedInteger(u64),
    SignedInteger(i64),
    F64(OrderedFloat<f64>),
    String(String),
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}

impl From<u8> for AttrValue {
    fn from(v: u8) -> Self {
        AttrValue::UnsignedInteger(v.into())
    }
}

impl From<u16> for AttrValue {
    fn from(v: u16) -> Self {
        AttrValue::UnsignedInteger(v.into())
    }
}

impl From<u32> for AttrValue {
    fn from(v: u32) -> Self {
        AttrValue::UnsignedInteger(v.into())
    }
}

impl From<u64> for AttrValue {
    fn from(v: u64) -> Self {
        AttrValue::UnsignedInteger(v)
    }
}

impl From<i8> for AttrValue {
    fn from(v: i8) -> Self {
        AttrValue::SignedInteger(v.into())
    }
}

impl From<i16> for AttrValue {
    fn from(v: i16) -> Self {
        AttrValue::SignedInteger(v.into())
    }
}

impl From<i32> for AttrValue {
    fn from(v: i32) -> Self {
        AttrValue::SignedInteger(v.into())
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::SignedInteger(v)
    }
}

impl From<f32> for AttrValue {
    fn from(v: f32) -> Self {
        AttrValue::F64(OrderedFloat(v.into()))
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        AttrValue::F64(OrderedFloat(v))
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::String(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::String(v.to_owned())
    }
}

/// Deduplication key of an event record.
///
/// Two records share a key when they have the same kind, priority, source,
/// and logically-equal details. The details component is an `fxhash` digest
/// of the canonical JSON serialization; [`Details`] keys are already sorted,
/// so key-order differences at the producer never split a key.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Display)]
#[display("{_0}")]
pub struct DedupKey(String);

impl DedupKey {
    pub fn of(event: &EventRecord) -> Self {
        // Infallible for the closed AttrValue set
        let canonical = serde_json::to_string(&event.details).unwrap_or_default();
        let digest = fxhash::hash64(canonical.as_bytes());
        DedupKey(format!(
            "{}:{}:{}:{digest:016x}",
            event.kind, event.priority, event.source
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn record(details: Details) -> EventRecord {
        let mut ev = EventRecord::new("auth.login", "web", details);
        ev.priority = Priority::Medium;
        ev
    }

    #[test]
    fn dedup_key_ignores_insertion_order() {
        let mut a = Details::new();
        a.insert("user".to_owned(), "u-1".into());
        a.insert("attempt".to_owned(), 2_u32.into());

        let mut b = Details::new();
        b.insert("attempt".to_owned(), 2_u32.into());
        b.insert("user".to_owned(), "u-1".into());

        assert_eq!(DedupKey::of(&record(a)), DedupKey::of(&record(b)));
    }

    #[test]
    fn dedup_key_separates_details() {
        let mut a = Details::new();
        a.insert("user".to_owned(), "u-1".into());
        let mut b = Details::new();
        b.insert("user".to_owned(), "u-2".into());

        assert_ne!(DedupKey::of(&record(a)), DedupKey::of(&record(b)));
    }

    #[test]
    fn dedup_key_separates_priority() {
        let mut a = record(Details::new());
        let mut b = record(Details::new());
        a.priority = Priority::High;
        b.priority = Priority::Low;

        assert_ne!(DedupKey::of(&a), DedupKey::of(&b));
    }

    #[test]
    fn priority_from_primitive_falls_back_to_info() {
        assert_eq!(Priority::from(0_u8), Priority::Critical);
        assert_eq!(Priority::from(4_u8), Priority::Info);
        assert_eq!(Priority::from(200_u8), Priority::Info);
    }

    #[test]
    fn priority_order_is_most_urgent_first() {
        assert!(Priority::Critical < Priority::High);
        assert!(Priority::High < Priority::Medium);
        assert!(Priority::Low < Priority::Info);
    }
}
