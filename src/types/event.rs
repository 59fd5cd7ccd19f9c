use crate::types::{AttrValue, Details, Kind, Priority, Source};
use internment::Intern;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

/// A discrete event record flowing through the pipeline.
///
/// `timestamp` is stamped at admission when the producer leaves it unset.
/// `persisted_id` and `processed` are written by the sink once the record
/// has been durably accepted.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: Uuid,
    pub kind: Kind,
    pub priority: Priority,
    pub source: Source,
    pub timestamp: Option<SystemTime>,
    #[serde(default, skip_serializing_if = "Details::is_empty")]
    pub details: Details,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persisted_id: Option<Uuid>,
    #[serde(default)]
    pub processed: bool,
}

impl EventRecord {
    pub fn new<K: AsRef<str>, S: AsRef<str>>(kind: K, source: S, details: Details) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: Intern::new(kind.as_ref().to_owned()),
            priority: Priority::Info,
            source: Intern::new(source.as_ref().to_owned()),
            timestamp: None,
            details,
            correlation_id: None,
            session_id: None,
            persisted_id: None,
            processed: false,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Per-call overrides accepted by `Dispatcher::log`.
#[derive(Copy, Clone, Default, Debug)]
pub struct LogOptions {
    /// Overrides the configured default priority for the event kind.
    pub priority: Option<Priority>,
    pub correlation_id: Option<Uuid>,
    pub session_id: Option<Uuid>,
}

/// Request-scoped producer context merged into event details by
/// `Dispatcher::log_from_context`.
#[derive(Clone, Default, Debug)]
pub struct RequestContext {
    pub actor_id: Option<String>,
    pub origin_addr: Option<String>,
    pub path: Option<String>,
    pub method: Option<String>,
}

impl RequestContext {
    pub(crate) fn merge_into(&self, details: &mut Details) {
        if let Some(actor) = self.actor_id.as_deref() {
            details.insert("actor-id".to_owned(), AttrValue::from(actor));
        }
        if let Some(addr) = self.origin_addr.as_deref() {
            details.insert("origin-addr".to_owned(), AttrValue::from(addr));
        }
        if let Some(path) = self.path.as_deref() {
            details.insert("path".to_owned(), AttrValue::from(path));
        }
        if let Some(method) = self.method.as_deref() {
            details.insert("method".to_owned(), AttrValue::from(method));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn context_merge_skips_absent_fields() {
        let ctx = RequestContext {
            actor_id: Some("u-7".to_owned()),
            origin_addr: None,
            path: Some("/checkout".to_owned()),
            method: Some("POST".to_owned()),
        };

        let mut details = Details::new();
        details.insert("amount".to_owned(), 1200_u32.into());
        ctx.merge_into(&mut details);

        assert_eq!(details.get("actor-id"), Some(&AttrValue::from("u-7")));
        assert_eq!(details.get("path"), Some(&AttrValue::from("/checkout")));
        assert_eq!(details.get("method"), Some(&AttrValue::from("POST")));
        assert!(!details.contains_key("origin-addr"));
        assert_eq!(details.len(), 4);
    }

    #[test]
    fn new_record_is_unprocessed_info() {
        let ev = EventRecord::new("page.view", "web", Details::new());
        assert_eq!(ev.priority, Priority::Info);
        assert!(ev.timestamp.is_none());
        assert!(ev.persisted_id.is_none());
        assert!(!ev.processed);
    }
}
