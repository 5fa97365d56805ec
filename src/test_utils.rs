//! Shared test utilities and arbitrary generators for property-based testing.

use proptest::prelude::*;
use serde_json::{Map, Value};

use crate::queue::Clock;
use crate::types::{RepoRef, Report, StrongRef, Subject};

/// A clock stuck at one instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub u64);

impl Clock for FixedClock {
    fn now_unix(&self) -> u64 {
        self.0
    }
}

pub fn arb_did() -> impl Strategy<Value = String> {
    "did:(plc|web):[a-z0-9]{4,24}".prop_map(String::from)
}

/// Unknown fields. Keys are prefixed so they never collide with known ones;
/// values avoid floats, which don't survive a JSON round trip exactly.
pub fn arb_extra() -> impl Strategy<Value = Map<String, Value>> {
    let value = prop_oneof![
        "[a-zA-Z0-9 ]{0,20}".prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        any::<bool>().prop_map(Value::from),
    ];
    prop::collection::btree_map("x_[a-z]{1,8}", value, 0..4)
        .prop_map(|m| m.into_iter().collect())
}

pub fn arb_subject() -> impl Strategy<Value = Subject> {
    prop_oneof![
        (arb_did(), "[a-z0-9]{10,20}", arb_extra()).prop_map(|(did, rkey, extra)| {
            Subject::StrongRef(StrongRef {
                uri: format!("at://{did}/app.bsky.feed.post/{rkey}"),
                cid: format!("bafy{rkey}"),
                extra,
            })
        }),
        (arb_did(), arb_extra()).prop_map(|(did, extra)| Subject::RepoRef(RepoRef { did, extra })),
        ("com\\.example\\.[a-z]{1,8}#[a-z]{1,8}", arb_extra()).prop_map(|(kind, mut extra)| {
            extra.insert("$type".to_string(), Value::from(kind));
            Subject::Other(Value::Object(extra))
        }),
    ]
}

pub fn arb_report() -> impl Strategy<Value = Report> {
    (
        proptest::option::of("com\\.atproto\\.moderation\\.defs#reason[A-Z][a-z]{2,10}"),
        proptest::option::of("[a-zA-Z0-9 .,!?]{0,80}"),
        proptest::option::of(arb_subject()),
        arb_extra(),
    )
        .prop_map(|(reason_type, reason, subject, extra)| Report {
            reason_type,
            reason,
            subject,
            extra,
        })
}
