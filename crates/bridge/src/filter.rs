use std::collections::HashSet;

use {deskbridge_matrix::TimelineEvent, regex::Regex};

use crate::error::{Error, Result};

/// Bodies the bridge itself posts into rooms.
pub const DEFAULT_SYSTEM_NOTICE_PATTERNS: &[&str] = &[
    r"^New (Telegram|website) conversation started with ",
    r"^\[Telegram User: ",
];

/// Why the relay did not forward an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skip {
    NotMessage,
    /// Sent before the relay started.
    Backlog,
    /// Sent by the bridge account.
    OwnEcho,
    /// Sent by an admin or system account.
    IgnoredSender,
    SystemNotice,
    Duplicate,
    /// The room has no bot conversation.
    Unmapped,
    /// The transport rejected the message for good.
    Undeliverable,
}

/// Decides which timeline events are agent replies worth forwarding.
pub struct SystemNoticeFilter {
    own_user_id: String,
    ignored_senders: HashSet<String>,
    patterns: Vec<Regex>,
}

impl SystemNoticeFilter {
    /// Built-in patterns plus `extra_patterns`.
    pub fn new(
        own_user_id: impl Into<String>,
        ignored_senders: impl IntoIterator<Item = String>,
        extra_patterns: &[String],
    ) -> Result<Self> {
        let patterns = DEFAULT_SYSTEM_NOTICE_PATTERNS
            .iter()
            .map(|p| (*p).to_string())
            .chain(extra_patterns.iter().cloned())
            .map(|pattern| {
                Regex::new(&pattern).map_err(|source| Error::Pattern { pattern, source })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            own_user_id: own_user_id.into(),
            ignored_senders: ignored_senders.into_iter().collect(),
            patterns,
        })
    }

    pub fn is_system_notice(&self, body: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(body))
    }

    /// `Some(reason)` if the event must not be relayed. Duplicate and
    /// mapping checks are left to the caller.
    pub fn check(&self, event: &TimelineEvent, started_at: u64) -> Option<Skip> {
        if !event.is_message() {
            return Some(Skip::NotMessage);
        }
        if event.origin_server_ts < started_at {
            return Some(Skip::Backlog);
        }
        if event.sender == self.own_user_id {
            return Some(Skip::OwnEcho);
        }
        if self.ignored_senders.contains(&event.sender) {
            return Some(Skip::IgnoredSender);
        }
        if event.msgtype() == Some("m.notice") {
            return Some(Skip::SystemNotice);
        }
        match event.body() {
            Some(body) if !self.is_system_notice(body) => None,
            _ => Some(Skip::SystemNotice),
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest, serde_json::json};

    fn event(sender: &str, msgtype: &str, body: &str, ts: u64) -> TimelineEvent {
        TimelineEvent {
            event_id: "$1".into(),
            sender: sender.into(),
            event_type: "m.room.message".into(),
            origin_server_ts: ts,
            content: json!({ "msgtype": msgtype, "body": body }),
            state_key: None,
        }
    }

    fn filter() -> SystemNoticeFilter {
        SystemNoticeFilter::new(
            "@bridge:hs",
            ["@admin:hs".to_string()],
            &["^\\[bot\\]".to_string()],
        )
        .unwrap()
    }

    #[rstest]
    #[case(event("@agent:hs", "m.text", "Hello!", 200), None)]
    #[case(event("@agent:hs", "m.text", "Hello!", 50), Some(Skip::Backlog))]
    #[case(event("@bridge:hs", "m.text", "Hello!", 200), Some(Skip::OwnEcho))]
    #[case(event("@admin:hs", "m.text", "Hello!", 200), Some(Skip::IgnoredSender))]
    #[case(event("@agent:hs", "m.notice", "Hello!", 200), Some(Skip::SystemNotice))]
    #[case(
        event("@agent:hs", "m.text", "New Telegram conversation started with Bob", 200),
        Some(Skip::SystemNotice)
    )]
    #[case(event("@agent:hs", "m.text", "**Note** (billing):\nrefund sent", 200), None)]
    #[case(event("@bridge:hs", "m.text", "**Bob** (@bob):\nhi", 200), Some(Skip::OwnEcho))]
    #[case(event("@agent:hs", "m.text", "[bot] restarting", 200), Some(Skip::SystemNotice))]
    fn classifies(#[case] event: TimelineEvent, #[case] expected: Option<Skip>) {
        assert_eq!(filter().check(&event, 100), expected);
    }

    #[test]
    fn state_events_are_not_messages() {
        let mut e = event("@agent:hs", "m.text", "x", 200);
        e.event_type = "m.room.member".into();
        assert_eq!(filter().check(&e, 100), Some(Skip::NotMessage));
    }

    #[test]
    fn invalid_pattern_is_reported() {
        let err = SystemNoticeFilter::new("@b:hs", [], &["(".to_string()]).err().unwrap();
        assert!(matches!(err, Error::Pattern { .. }));
    }
}
