#![no_main]

use std::collections::BTreeSet;

use libfuzzer_sys::fuzz_target;
use relay_contract::InboundMessage;
use relay_gate::{
    assess_message_risk, message_signals, MessageRiskPolicy, MAX_RISK_LEVEL, MIN_RISK_LEVEL,
};

fuzz_target!(|data: &[u8]| {
    let raw = String::from_utf8_lossy(data);
    let (from, body) = raw.split_once('\n').unwrap_or(("fuzz-identity", raw.as_ref()));
    let message = InboundMessage::new(from, body);

    let permissive = MessageRiskPolicy {
        block_links: false,
        block_spam: false,
        blocked_identities: BTreeSet::new(),
    };
    let strict = MessageRiskPolicy {
        block_links: true,
        block_spam: true,
        blocked_identities: BTreeSet::from([from.to_string()]),
    };

    let relaxed_level = assess_message_risk(&permissive, &message);
    let strict_level = assess_message_risk(&strict, &message);
    assert!((MIN_RISK_LEVEL..=MAX_RISK_LEVEL).contains(&relaxed_level));
    assert_eq!(strict_level, MAX_RISK_LEVEL);
    assert!(relaxed_level <= strict_level);

    let signals = message_signals(body);
    assert_eq!(signals, message_signals(body));
});
