//! Pure helpers a chat UI composes its bubbles from.

use chrono::{FixedOffset, NaiveDate};

use theralink_types::api::MessageResponse;
use theralink_types::models::{DeliveryStatus, Message, MessageKind, ReactionGroup, UserId};

/// Tick shown on the viewer's own messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusIcon {
    SingleCheck,
    DoubleCheck,
    HighlightedDoubleCheck,
}

/// Incoming messages carry no status icon.
pub fn status_icon(message: &Message, viewer: UserId) -> Option<StatusIcon> {
    if message.sender_id != viewer {
        return None;
    }
    Some(match message.status() {
        DeliveryStatus::Sent => StatusIcon::SingleCheck,
        DeliveryStatus::Delivered => StatusIcon::DoubleCheck,
        DeliveryStatus::Read => StatusIcon::HighlightedDoubleCheck,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentPreview {
    Inline { url: String, filename: String },
    FileIcon {
        filename: String,
        /// Lowercased extension, used to pick the file-type icon.
        extension: Option<String>,
    },
}

pub fn attachment_preview(message: &Message) -> Option<AttachmentPreview> {
    let attachment = message.attachment.as_ref()?;
    if message.kind == MessageKind::Image && attachment.is_image() {
        return Some(AttachmentPreview::Inline {
            url: attachment.url.clone(),
            filename: attachment.filename.clone(),
        });
    }

    let extension = attachment
        .filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty());
    Some(AttachmentPreview::FileIcon {
        filename: attachment.filename.clone(),
        extension,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionSummary {
    pub emoji: String,
    pub count: usize,
    pub user_reacted: bool,
}

pub fn reaction_summaries(groups: &[ReactionGroup], viewer: UserId) -> Vec<ReactionSummary> {
    groups
        .iter()
        .filter(|g| g.count > 0)
        .map(|g| ReactionSummary {
            emoji: g.emoji.clone(),
            count: g.count,
            user_reacted: g.contains(viewer),
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimelineItem<'a> {
    DateSeparator(NaiveDate),
    Message(&'a MessageResponse),
}

/// Interleave a separator before the first message of each calendar day,
/// as seen at `offset`.
pub fn timeline(messages: &[MessageResponse], offset: FixedOffset) -> Vec<TimelineItem<'_>> {
    let mut items = Vec::with_capacity(messages.len() + 1);
    let mut current: Option<NaiveDate> = None;

    for message in messages {
        let day = message.message.created_at.with_timezone(&offset).date_naive();
        if current != Some(day) {
            items.push(TimelineItem::DateSeparator(day));
            current = Some(day);
        }
        items.push(TimelineItem::Message(message));
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::tests::message;
    use theralink_types::models::Attachment;
    use uuid::Uuid;

    #[test]
    fn own_message_ticks_follow_status() {
        let me = Uuid::new_v4();
        let mut own = message(Uuid::new_v4(), me, "hi", 0).message;
        assert_eq!(status_icon(&own, me), Some(StatusIcon::SingleCheck));

        own.advance_status(DeliveryStatus::Delivered);
        assert_eq!(status_icon(&own, me), Some(StatusIcon::DoubleCheck));

        own.advance_status(DeliveryStatus::Read);
        assert_eq!(status_icon(&own, me), Some(StatusIcon::HighlightedDoubleCheck));

        assert_eq!(status_icon(&own, Uuid::new_v4()), None);
    }

    #[test]
    fn pdf_gets_a_file_icon() {
        let mut msg = message(Uuid::new_v4(), Uuid::new_v4(), "", 0).message;
        msg.kind = MessageKind::File;
        msg.body = None;
        msg.attachment = Some(Attachment {
            url: "https://storage.example/report.pdf".into(),
            filename: "report.PDF".into(),
            mime_type: "application/pdf".into(),
        });

        assert_eq!(
            attachment_preview(&msg),
            Some(AttachmentPreview::FileIcon {
                filename: "report.PDF".into(),
                extension: Some("pdf".into()),
            })
        );
    }

    #[test]
    fn images_preview_inline() {
        let mut msg = message(Uuid::new_v4(), Uuid::new_v4(), "", 0).message;
        msg.kind = MessageKind::Image;
        msg.attachment = Some(Attachment {
            url: "https://storage.example/scan.png".into(),
            filename: "scan.png".into(),
            mime_type: "image/png".into(),
        });
        assert!(matches!(
            attachment_preview(&msg),
            Some(AttachmentPreview::Inline { .. })
        ));

        let text = message(Uuid::new_v4(), Uuid::new_v4(), "hi", 0).message;
        assert_eq!(attachment_preview(&text), None);
    }

    #[test]
    fn summaries_flag_viewer_reactions() {
        let (me, them) = (Uuid::new_v4(), Uuid::new_v4());
        let groups = vec![
            ReactionGroup {
                emoji: "❤️".into(),
                count: 2,
                user_ids: vec![me, them],
            },
            ReactionGroup {
                emoji: "👍".into(),
                count: 1,
                user_ids: vec![them],
            },
        ];

        let summaries = reaction_summaries(&groups, me);
        assert_eq!(
            summaries,
            vec![
                ReactionSummary {
                    emoji: "❤️".into(),
                    count: 2,
                    user_reacted: true
                },
                ReactionSummary {
                    emoji: "👍".into(),
                    count: 1,
                    user_reacted: false
                },
            ]
        );
    }

    #[test]
    fn separators_split_by_local_day() {
        let conv = Uuid::new_v4();
        let sender = Uuid::new_v4();
        // 11:00 and 11:01 on 1 March UTC, then 01:00 on 2 March UTC
        let first = message(conv, sender, "a", 2 * 3600);
        let second = message(conv, sender, "b", 2 * 3600 + 60);
        let third = message(conv, sender, "c", 16 * 3600);
        let messages = vec![first, second, third];

        let utc = FixedOffset::east_opt(0).unwrap();
        let separators = |items: &[TimelineItem<'_>]| {
            items
                .iter()
                .filter(|i| matches!(i, TimelineItem::DateSeparator(_)))
                .count()
        };
        assert_eq!(separators(&timeline(&messages, utc)), 2);

        let honolulu = FixedOffset::west_opt(10 * 3600).unwrap();
        let items = timeline(&messages, honolulu);
        assert_eq!(separators(&items), 1);
        assert_eq!(
            items[0],
            TimelineItem::DateSeparator(NaiveDate::from_ymd_opt(2025, 3, 1).unwrap())
        );
    }
}
