//! Conversation assembly: dedupe, ordering, media normalization, truncation.

use chrono::{DateTime, Duration, Utc};
use murmur_config::{DiscordLimitsConfig, InputMediaConfig};
use murmur_schema::{ChatMessage, Content, ContentPart, CoreError, MessageMeta, Role};
use std::collections::HashSet;

/// One attachment on the current message. Animated sources arrive as a
/// pre-decoded frame list and are sub-sampled here.
#[derive(Debug, Clone)]
pub struct MediaAttachment {
    pub mime: String,
    pub data_b64: String,
    pub frames: Vec<String>,
}

impl MediaAttachment {
    pub fn is_animated(&self) -> bool {
        !self.frames.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CollectRequest {
    pub text: String,
    pub attachments: Vec<MediaAttachment>,
    pub origin_id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    /// Transport-supplied history window, oldest first.
    pub history: Vec<ChatMessage>,
    pub history_limit: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct CollectSummary {
    pub message_count: usize,
    pub dropped_messages: usize,
    pub dropped_attachments: usize,
    pub images: usize,
    pub animations: usize,
    pub media_marker: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Collector {
    limits: DiscordLimitsConfig,
    media: InputMediaConfig,
}

impl Collector {
    pub fn new(limits: DiscordLimitsConfig, media: InputMediaConfig) -> Self {
        Self { limits, media }
    }

    /// Assemble the message window for one invocation.
    pub fn collect(&self, request: CollectRequest) -> Result<(Vec<ChatMessage>, CollectSummary), CoreError> {
        let mut summary = CollectSummary::default();

        if request.text.chars().count() > self.limits.max_text {
            return Err(CoreError::InputTooLarge(format!(
                "message text exceeds {} characters",
                self.limits.max_text
            )));
        }

        let mut messages = request.history.clone();
        if let Some(limit) = request.history_limit {
            while messages.len() > limit {
                messages.remove(0);
                summary.dropped_messages += 1;
            }
        }
        let current = self.build_current_message(&request, &mut summary);
        messages.push(current);

        dedupe_by_origin(&mut messages, &mut summary);
        backfill_timestamps(&mut messages);
        messages.sort_by_key(|m| m.metadata.timestamp);

        self.truncate(&mut messages, &mut summary);
        summary.message_count = messages.len();
        Ok((messages, summary))
    }

    fn build_current_message(&self, request: &CollectRequest, summary: &mut CollectSummary) -> ChatMessage {
        let mut parts: Vec<ContentPart> = Vec::new();
        let mut text = request.text.clone();

        let mut kept = 0usize;
        for attachment in &request.attachments {
            if kept >= self.limits.max_images {
                summary.dropped_attachments += 1;
                continue;
            }
            kept += 1;
            if attachment.is_animated() {
                summary.animations += 1;
                for frame in subsample(&attachment.frames, self.media.max_animation_frames) {
                    parts.push(ContentPart::InlineImage {
                        mime: "image/png".into(),
                        data_b64: frame.clone(),
                    });
                }
            } else {
                summary.images += 1;
                parts.push(ContentPart::InlineImage {
                    mime: attachment.mime.clone(),
                    data_b64: attachment.data_b64.clone(),
                });
            }
        }

        if summary.images > 0 || summary.animations > 0 {
            let marker = media_marker(summary.images, summary.animations);
            text.push_str(&marker);
            summary.media_marker = Some(marker);
        }

        let content = if parts.is_empty() {
            Content::Text(text)
        } else {
            let mut all = vec![ContentPart::Text { text }];
            all.extend(parts);
            Content::Parts(all)
        };

        ChatMessage {
            role: Role::User,
            content,
            metadata: MessageMeta {
                origin_id: request.origin_id.clone(),
                timestamp: request.timestamp,
            },
        }
    }

    fn truncate(&self, messages: &mut Vec<ChatMessage>, summary: &mut CollectSummary) {
        let max_messages = self.limits.max_messages.max(1);
        while messages.len() > max_messages {
            messages.remove(0);
            summary.dropped_messages += 1;
        }

        // Oldest-first drops until the text budget fits; the current
        // message itself was bounds-checked up front.
        loop {
            let total: usize = messages.iter().map(|m| m.text().chars().count()).sum();
            if total <= self.limits.max_text || messages.len() <= 1 {
                break;
            }
            messages.remove(0);
            summary.dropped_messages += 1;
        }
    }
}

fn media_marker(images: usize, animations: usize) -> String {
    let mut parts = Vec::new();
    if images > 0 {
        parts.push(format!("{images}圖片"));
    }
    if animations > 0 {
        parts.push(format!("{animations}動畫"));
    }
    format!(" [包含: {}]", parts.join(", "))
}

/// Keep the first occurrence of each originator-assigned id.
fn dedupe_by_origin(messages: &mut Vec<ChatMessage>, summary: &mut CollectSummary) {
    let mut seen: HashSet<String> = HashSet::new();
    let before = messages.len();
    messages.retain(|m| match &m.metadata.origin_id {
        Some(id) => seen.insert(id.clone()),
        None => true,
    });
    summary.dropped_messages += before - messages.len();
}

/// Missing timestamps default to receive order: each gets the previous
/// message's timestamp plus a millisecond, so the stable sort keeps them
/// exactly where they arrived.
fn backfill_timestamps(messages: &mut [ChatMessage]) {
    let mut cursor = messages
        .iter()
        .filter_map(|m| m.metadata.timestamp)
        .min()
        .unwrap_or_else(Utc::now);
    for message in messages.iter_mut() {
        match message.metadata.timestamp {
            Some(ts) => cursor = cursor.max(ts),
            None => {
                cursor += Duration::milliseconds(1);
                message.metadata.timestamp = Some(cursor);
            }
        }
    }
}

fn subsample(frames: &[String], max: usize) -> Vec<&String> {
    if frames.len() <= max || max == 0 {
        return frames.iter().collect();
    }
    let last = frames.len() - 1;
    (0..max)
        .map(|i| &frames[i * last / (max - 1).max(1)])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector() -> Collector {
        Collector::new(
            DiscordLimitsConfig {
                max_text: 1000,
                max_images: 2,
                max_messages: 5,
            },
            InputMediaConfig {
                max_animation_frames: 4,
            },
        )
    }

    fn message_at(text: &str, origin: &str, secs: i64) -> ChatMessage {
        ChatMessage {
            role: Role::User,
            content: Content::Text(text.into()),
            metadata: MessageMeta {
                origin_id: Some(origin.into()),
                timestamp: Some(DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()),
            },
        }
    }

    #[test]
    fn duplicates_by_origin_id_are_dropped() {
        let (messages, summary) = collector()
            .collect(CollectRequest {
                text: "hi".into(),
                history: vec![
                    message_at("a", "m1", 0),
                    message_at("a again", "m1", 1),
                    message_at("b", "m2", 2),
                ],
                ..CollectRequest::default()
            })
            .unwrap();
        assert_eq!(messages.len(), 3); // m1, m2, current
        assert_eq!(summary.dropped_messages, 1);
    }

    #[test]
    fn messages_sort_by_timestamp_ascending() {
        let (messages, _) = collector()
            .collect(CollectRequest {
                text: "now".into(),
                timestamp: Some(DateTime::from_timestamp(1_700_000_100, 0).unwrap()),
                history: vec![message_at("late", "m2", 50), message_at("early", "m1", 10)],
                ..CollectRequest::default()
            })
            .unwrap();
        let texts: Vec<String> = messages.iter().map(|m| m.text()).collect();
        assert_eq!(texts, vec!["early", "late", "now"]);
    }

    #[test]
    fn missing_timestamps_keep_receive_order() {
        let mut history = vec![message_at("first", "m1", 0)];
        history.push(ChatMessage::user("second"));
        history.push(ChatMessage::user("third"));

        let (messages, _) = collector()
            .collect(CollectRequest {
                text: "current".into(),
                history,
                ..CollectRequest::default()
            })
            .unwrap();
        let texts: Vec<String> = messages.iter().map(|m| m.text()).collect();
        assert_eq!(texts, vec!["first", "second", "third", "current"]);
        assert!(messages.iter().all(|m| m.metadata.timestamp.is_some()));
    }

    #[test]
    fn media_marker_is_appended() {
        let (messages, summary) = collector()
            .collect(CollectRequest {
                text: "看看這些".into(),
                attachments: vec![
                    MediaAttachment {
                        mime: "image/png".into(),
                        data_b64: "aaaa".into(),
                        frames: vec![],
                    },
                    MediaAttachment {
                        mime: "image/gif".into(),
                        data_b64: String::new(),
                        frames: vec!["f1".into(), "f2".into()],
                    },
                ],
                ..CollectRequest::default()
            })
            .unwrap();
        let last = messages.last().unwrap();
        assert!(last.text().contains("[包含: 1圖片, 1動畫]"));
        assert_eq!(summary.images, 1);
        assert_eq!(summary.animations, 1);
    }

    #[test]
    fn animated_frames_are_subsampled() {
        let frames: Vec<String> = (0..12).map(|i| format!("f{i}")).collect();
        let (messages, _) = collector()
            .collect(CollectRequest {
                text: "gif".into(),
                attachments: vec![MediaAttachment {
                    mime: "image/gif".into(),
                    data_b64: String::new(),
                    frames,
                }],
                ..CollectRequest::default()
            })
            .unwrap();
        let images = messages.last().unwrap().content.image_count();
        assert_eq!(images, 4);
    }

    #[test]
    fn excess_attachments_are_dropped() {
        let attachment = |data: &str| MediaAttachment {
            mime: "image/png".into(),
            data_b64: data.into(),
            frames: vec![],
        };
        let (_, summary) = collector()
            .collect(CollectRequest {
                text: "imgs".into(),
                attachments: vec![attachment("a"), attachment("b"), attachment("c")],
                ..CollectRequest::default()
            })
            .unwrap();
        assert_eq!(summary.images, 2);
        assert_eq!(summary.dropped_attachments, 1);
    }

    #[test]
    fn history_is_truncated_oldest_first() {
        let history: Vec<ChatMessage> = (0..10)
            .map(|i| message_at(&format!("msg{i}"), &format!("m{i}"), i))
            .collect();
        let (messages, summary) = collector()
            .collect(CollectRequest {
                text: "current".into(),
                history,
                ..CollectRequest::default()
            })
            .unwrap();
        assert_eq!(messages.len(), 5);
        assert_eq!(summary.dropped_messages, 6);
        assert_eq!(messages.last().unwrap().text(), "current");
        assert_eq!(messages[0].text(), "msg6");
    }

    #[test]
    fn oversized_current_message_is_rejected() {
        let err = collector()
            .collect(CollectRequest {
                text: "x".repeat(2000),
                ..CollectRequest::default()
            })
            .unwrap_err();
        assert!(matches!(err, CoreError::InputTooLarge(_)));
    }

    #[test]
    fn text_budget_drops_old_messages() {
        let big = "字".repeat(400);
        let history = vec![
            message_at(&big, "m1", 0),
            message_at(&big, "m2", 1),
            message_at(&big, "m3", 2),
        ];
        let (messages, _) = collector()
            .collect(CollectRequest {
                text: "small".into(),
                history,
                ..CollectRequest::default()
            })
            .unwrap();
        let total: usize = messages.iter().map(|m| m.text().chars().count()).sum();
        assert!(total <= 1000);
        assert_eq!(messages.last().unwrap().text(), "small");
    }
}
