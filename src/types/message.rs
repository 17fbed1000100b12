//! The announcement flowing through the pump.
//!
//! A [`Message`] is a JSON object. The fields the reliable-delivery core
//! reasons about are typed; every other field (transfer details such as
//! `partstr`, `offset`, `length`, `sumflg`, `partflg`, destination fields set
//! by plugins, ...) is kept verbatim in [`Message::extra`] and written back out
//! unchanged.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use super::integrity::Integrity;
use super::time::{TimeError, timestr_to_flt};

/// Field name of the broker acknowledgement handle.
pub const ACK_ID: &str = "ack_id";

/// Overrides for the fields used to compute a message's dedup identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodupeOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Final disposition attached to a message for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub code: u16,
    pub message: String,
}

/// Returns the standard explanation for a report code, if the code is known.
pub fn known_report_text(code: u16) -> Option<&'static str> {
    let text = match code {
        201 => "Download successful. (variations: Downloaded, Inserted, Published, Copied, or Linked)",
        203 => "Non-Authoritative Information: transformed during download.",
        205 => "Reset Content: checksum recalculated on receipt.",
        304 => "Not modified (Checksum validated, unchanged, so no download resulted.)",
        307 => "Insertion deferred (writing to temporary part file for the moment.)",
        417 => "Expectation Failed: invalid message (corrupt headers)",
        499 => "Failure: Not Copied. SFTP/FTP/HTTP download problem",
        503 => "Unable to process: Service unavailable",
        _ => return None,
    };
    Some(text)
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// One unit of work: an announcement of an item to fetch, transform or post.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "baseUrl")]
    pub base_url: String,

    #[serde(rename = "relPath")]
    pub rel_path: String,

    #[serde(rename = "pubTime")]
    pub pub_time: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<Integrity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtime: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub atime: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parts: Option<String>,

    /// Older announcements carry file metadata in a header map.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,

    /// Broker delivery handle; only present while the transport still owns
    /// the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_id: Option<Value>,

    /// Field names omitted when the message is published.
    #[serde(
        rename = "_deleteOnPost",
        default,
        skip_serializing_if = "BTreeSet::is_empty"
    )]
    pub delete_on_post: BTreeSet<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodupe_override: Option<NodupeOverride>,

    #[serde(rename = "isRetry", default, skip_serializing_if = "is_false")]
    pub is_retry: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<Report>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reject: Option<String>,

    /// Every other field, passed through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Message {
    /// Creates a message for `base_url` + `rel_path` published at `pub_time`.
    pub fn new(
        base_url: impl Into<String>,
        rel_path: impl Into<String>,
        pub_time: impl Into<String>,
    ) -> Self {
        Message {
            base_url: base_url.into(),
            rel_path: rel_path.into(),
            pub_time: pub_time.into(),
            ..Message::default()
        }
    }

    pub fn with_integrity(mut self, integrity: Integrity) -> Self {
        self.integrity = Some(integrity);
        self
    }

    /// Attaches a broker acknowledgement handle. The handle is never published.
    pub fn with_ack_id(mut self, ack_id: impl Into<Value>) -> Self {
        self.ack_id = Some(ack_id.into());
        self.delete_on_post.insert(ACK_ID.to_string());
        self
    }

    /// Full source URL of the announced item.
    pub fn url(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.rel_path.trim_start_matches('/')
        )
    }

    /// The file modification time, from the top level or the header map.
    pub fn mtime(&self) -> Option<&str> {
        self.mtime
            .as_deref()
            .or_else(|| self.headers.get("mtime").map(String::as_str))
    }

    /// Publication time as float epoch seconds.
    pub fn pub_time_flt(&self) -> Result<f64, TimeError> {
        timestr_to_flt(&self.pub_time)
    }

    /// Seconds elapsed between publication and `now`.
    pub fn age_since_pub(&self, now: f64) -> Result<f64, TimeError> {
        Ok(now - self.pub_time_flt()?)
    }

    /// Seconds elapsed between the file's modification time and `now`.
    ///
    /// Returns `Ok(None)` when the message carries no modification time.
    pub fn file_age(&self, now: f64) -> Result<Option<f64>, TimeError> {
        match self.mtime() {
            Some(mtime) => Ok(Some(now - timestr_to_flt(mtime)?)),
            None => Ok(None),
        }
    }

    /// Removes the broker acknowledgement handle.
    ///
    /// Returns the handle if one was present.
    pub fn strip_ack_id(&mut self) -> Option<Value> {
        self.delete_on_post.remove(ACK_ID);
        self.ack_id.take()
    }

    /// Records the final disposition of the message.
    ///
    /// When `text` is `None`, the standard explanation for `code` is used.
    pub fn set_report(&mut self, code: u16, text: Option<&str>) {
        let known = known_report_text(code);
        if known.is_none() {
            warn!(code, text = ?text, "unknown report code supplied");
        }
        let message = text
            .or(known)
            .unwrap_or("unknown disposition")
            .to_string();

        if let Some(previous) = &self.report {
            warn!(
                code = previous.code,
                message = %previous.message,
                "overriding initial report"
            );
        }

        self.delete_on_post.insert("report".to_string());
        self.report = Some(Report { code, message });
    }

    /// Marks the message rejected with a human-readable reason.
    pub fn set_reject(&mut self, reason: impl Into<String>) {
        self.delete_on_post.insert("reject".to_string());
        self.reject = Some(reason.into());
    }

    /// The message as published: all `_deleteOnPost` fields, and the list
    /// itself, are omitted.
    pub fn to_post_value(&self) -> serde_json::Result<Value> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut value {
            for field in &self.delete_on_post {
                map.remove(field);
            }
            map.remove("_deleteOnPost");
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::integrity::IntegrityMethod;
    use serde_json::json;

    fn sample() -> Message {
        let mut msg = Message::new("sftp://host", "/data/f1.txt", "20240101T000000.5")
            .with_integrity(Integrity::new(IntegrityMethod::Md5, "x"))
            .with_ack_id(json!({"delivery_tag": 7}));
        msg.extra.insert("partstr".into(), json!("1,100,1,0,0"));
        msg.extra.insert("offset".into(), json!(0));
        msg
    }

    #[test]
    fn json_roundtrip_keeps_passthrough_fields() {
        let msg = sample();
        let line = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&line).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.extra["partstr"], json!("1,100,1,0,0"));
    }

    #[test]
    fn wire_names_match_announcement_format() {
        let value = serde_json::to_value(sample()).unwrap();
        assert_eq!(value["baseUrl"], json!("sftp://host"));
        assert_eq!(value["relPath"], json!("/data/f1.txt"));
        assert_eq!(value["integrity"]["method"], json!("md5"));
        assert_eq!(value["_deleteOnPost"], json!(["ack_id"]));
        assert!(value.get("isRetry").is_none());
    }

    #[test]
    fn strip_ack_id_clears_delete_on_post() {
        let mut msg = sample();
        assert_eq!(msg.strip_ack_id(), Some(json!({"delivery_tag": 7})));
        assert!(msg.ack_id.is_none());
        assert!(!msg.delete_on_post.contains(ACK_ID));
        assert_eq!(msg.strip_ack_id(), None);
    }

    #[test]
    fn post_value_omits_delete_on_post_fields() {
        let mut msg = sample();
        msg.set_report(304, None);
        let post = msg.to_post_value().unwrap();
        assert!(post.get("ack_id").is_none());
        assert!(post.get("report").is_none());
        assert!(post.get("_deleteOnPost").is_none());
        assert_eq!(post["offset"], json!(0));
    }

    #[test]
    fn set_report_uses_known_text() {
        let mut msg = sample();
        msg.set_report(304, None);
        let report = msg.report.as_ref().unwrap();
        assert_eq!(report.code, 304);
        assert!(report.message.starts_with("Not modified"));

        msg.set_report(999, None);
        assert_eq!(msg.report.unwrap().message, "unknown disposition");
    }

    #[test]
    fn mtime_falls_back_to_headers() {
        let mut msg = sample();
        assert_eq!(msg.mtime(), None);
        msg.headers.insert("mtime".into(), "20240101T000000".into());
        assert_eq!(msg.mtime(), Some("20240101T000000"));
        msg.mtime = Some("20240102T000000".into());
        assert_eq!(msg.mtime(), Some("20240102T000000"));
    }

    #[test]
    fn ages_are_computed_from_timestamps() {
        let msg = sample();
        let pub_time = msg.pub_time_flt().unwrap();
        assert_eq!(msg.age_since_pub(pub_time + 10.0).unwrap(), 10.0);
        assert_eq!(msg.file_age(pub_time).unwrap(), None);
    }
}
