//! Shared test utilities and arbitrary generators for property-based testing.

use proptest::prelude::*;
use serde_json::json;

use crate::types::{Integrity, IntegrityMethod, Message, timeflt_to_str};

/// A fixed instant used by tests that do not care about the wall clock.
pub const T0: f64 = 1_700_000_000.0;

/// A plain message for `rel_path`, published at [`T0`].
pub fn message(rel_path: &str) -> Message {
    Message::new("http://example.org", rel_path, timeflt_to_str(T0))
        .with_integrity(Integrity::new(IntegrityMethod::Md5, format!("sum-{rel_path}")))
}

/// Like [`message`], but published `age` seconds before [`T0`].
pub fn message_aged(rel_path: &str, age: f64) -> Message {
    let mut msg = message(rel_path);
    msg.pub_time = timeflt_to_str(T0 - age);
    msg
}

pub fn arb_integrity_method() -> impl Strategy<Value = IntegrityMethod> {
    prop_oneof![
        Just(IntegrityMethod::Md5),
        Just(IntegrityMethod::Sha512),
        Just(IntegrityMethod::Md5name),
        Just(IntegrityMethod::Arbitrary),
        Just(IntegrityMethod::Cod),
    ]
}

pub fn arb_integrity() -> impl Strategy<Value = Integrity> {
    (arb_integrity_method(), "[A-Za-z0-9+/]{4,12}={0,2}")
        .prop_map(|(method, value)| Integrity::new(method, value))
}

pub fn arb_rel_path() -> impl Strategy<Value = String> {
    "/?[a-z][a-z0-9_]{0,7}(/[a-z0-9_.]{1,8}){0,2}".prop_map(String::from)
}

/// Messages that survive a JSON round trip unchanged: whole-second times,
/// integer or string passthrough fields, no floats.
pub fn arb_message() -> impl Strategy<Value = Message> {
    (
        prop_oneof![Just("http://a.example"), Just("sftp://b.example")],
        arb_rel_path(),
        1_600_000_000i64..1_800_000_000,
        prop::option::of(arb_integrity()),
        prop::option::of(0u64..10_000_000),
        prop::option::of("1,[0-9]{1,4},1,0,0"),
        prop::option::of(any::<u32>()),
        prop::option::of("[a-z]{1,6}"),
    )
        .prop_map(
            |(base, rel, pub_secs, integrity, size, parts, ack, new_dir)| {
                let mut msg = Message::new(base, rel, timeflt_to_str(pub_secs as f64));
                msg.integrity = integrity;
                msg.size = size;
                msg.parts = parts;
                if let Some(tag) = ack {
                    msg = msg.with_ack_id(json!({"delivery_tag": tag}));
                }
                if let Some(dir) = new_dir {
                    msg.extra.insert("new_dir".into(), json!(dir));
                    msg.extra.insert("offset".into(), json!(0));
                }
                msg
            },
        )
}
