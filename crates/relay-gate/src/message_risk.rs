use std::collections::BTreeSet;

use relay_contract::InboundMessage;

pub const MIN_RISK_LEVEL: u8 = 1;
pub const MAX_RISK_LEVEL: u8 = 5;

const SPAM_REPEATED_RUN_THRESHOLD: usize = 12;
const SPAM_MAX_BODY_CHARS: usize = 2_000;
const SHOUTING_MIN_LETTERS: usize = 24;
const SHOUTING_UPPERCASE_PERCENT: usize = 85;
const MASS_MENTION_THRESHOLD: usize = 5;
const LINK_MARKERS: [&str; 3] = ["http://", "https://", "www."];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// Heuristic switches for inbound message scoring.
pub struct MessageRiskPolicy {
    pub block_links: bool,
    pub block_spam: bool,
    pub blocked_identities: BTreeSet<String>,
}

impl MessageRiskPolicy {
    pub fn is_blocked_identity(&self, identity: &str) -> bool {
        self.blocked_identities.contains(identity)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// Which heuristics fired for a message body.
pub struct MessageSignals {
    pub link: bool,
    pub spam: bool,
    pub mass_mentions: bool,
}

pub fn contains_link(body: &str) -> bool {
    let lowered = body.to_ascii_lowercase();
    LINK_MARKERS.iter().any(|marker| lowered.contains(marker))
}

fn longest_repeated_run(body: &str) -> usize {
    let mut longest = 0usize;
    let mut current = 0usize;
    let mut previous: Option<char> = None;
    for ch in body.chars() {
        if ch.is_whitespace() {
            previous = None;
            current = 0;
            continue;
        }
        if previous == Some(ch) {
            current += 1;
        } else {
            previous = Some(ch);
            current = 1;
        }
        longest = longest.max(current);
    }
    longest
}

fn is_shouting(body: &str) -> bool {
    let (letters, uppercase) = body
        .chars()
        .filter(|ch| ch.is_alphabetic())
        .fold((0usize, 0usize), |(letters, uppercase), ch| {
            (letters + 1, uppercase + usize::from(ch.is_uppercase()))
        });
    letters >= SHOUTING_MIN_LETTERS && uppercase * 100 >= letters * SHOUTING_UPPERCASE_PERCENT
}

pub fn looks_like_spam(body: &str) -> bool {
    body.chars().count() > SPAM_MAX_BODY_CHARS
        || longest_repeated_run(body) >= SPAM_REPEATED_RUN_THRESHOLD
        || is_shouting(body)
}

pub fn mention_count(body: &str) -> usize {
    body.split_whitespace()
        .filter(|token| token.len() > 1 && token.starts_with('@'))
        .count()
}

pub fn message_signals(body: &str) -> MessageSignals {
    MessageSignals {
        link: contains_link(body),
        spam: looks_like_spam(body),
        mass_mentions: mention_count(body) >= MASS_MENTION_THRESHOLD,
    }
}

/// Scores a message 1..=5. Pure: depends only on the policy and the message.
pub fn assess_message_risk(policy: &MessageRiskPolicy, message: &InboundMessage) -> u8 {
    if policy.is_blocked_identity(&message.from) {
        return MAX_RISK_LEVEL;
    }
    let signals = message_signals(&message.body);
    let mut level = MIN_RISK_LEVEL;
    if signals.link && policy.block_links {
        level += 1;
    }
    if signals.spam && policy.block_spam {
        level += 1;
    }
    if signals.mass_mentions {
        level += 1;
    }
    level.clamp(MIN_RISK_LEVEL, MAX_RISK_LEVEL)
}
