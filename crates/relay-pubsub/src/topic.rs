use relay_core::ids::ChannelId;

/// Broker topics are `channel:{channel_id}`.
pub const TOPIC_PREFIX: &str = "channel:";

/// Pattern covering every channel topic.
pub const TOPIC_PATTERN: &str = "channel:*";

pub fn topic_for(channel_id: &ChannelId) -> String {
    format!("{TOPIC_PREFIX}{channel_id}")
}

/// Recover the channel id from a topic; `None` for foreign or empty topics.
pub fn channel_from_topic(topic: &str) -> Option<ChannelId> {
    topic
        .strip_prefix(TOPIC_PREFIX)
        .filter(|rest| !rest.is_empty())
        .map(ChannelId::from)
}

/// Glob match restricted to what the relay uses: exact topics and a
/// trailing `*`.
pub fn pattern_matches(pattern: &str, topic: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => topic.starts_with(prefix),
        None => pattern == topic,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_roundtrip() {
        let channel = ChannelId::from("course:7");
        let topic = topic_for(&channel);
        assert_eq!(topic, "channel:course:7");
        assert_eq!(channel_from_topic(&topic), Some(channel));
    }

    #[test]
    fn foreign_topics_have_no_channel() {
        assert_eq!(channel_from_topic("room:42"), None);
        assert_eq!(channel_from_topic("channel:"), None);
    }

    #[test]
    fn patterns() {
        assert!(pattern_matches(TOPIC_PATTERN, "channel:42"));
        assert!(!pattern_matches(TOPIC_PATTERN, "presence:42"));
        assert!(pattern_matches("channel:42", "channel:42"));
        assert!(!pattern_matches("channel:42", "channel:43"));
    }
}
