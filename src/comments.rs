//! Comments on a canvas and their `@[display](userId)` mention markup.

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

use crate::ids::{generate_id, now_ms, ReplicaId};

/// Author id used when no user is signed in
pub const GUEST_AUTHOR: &str = "guest";

/// One comment in the shared log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: String,
    pub author_id: String,
    /// Milliseconds since the Unix epoch; display order
    pub timestamp: u64,
    pub text: String,
}

impl Comment {
    /// Build a comment authored on `origin`. The text is trimmed and must not
    /// be empty.
    pub fn new(origin: ReplicaId, author_id: Option<&str>, text: &str) -> Result<Self> {
        Self::at(origin, author_id, text, now_ms())
    }

    pub fn at(origin: ReplicaId, author_id: Option<&str>, text: &str, timestamp: u64) -> Result<Self> {
        let text = text.trim();
        ensure!(!text.is_empty(), "comment text is empty");
        Ok(Self {
            id: generate_id(origin),
            author_id: author_id.unwrap_or(GUEST_AUTHOR).to_string(),
            timestamp,
            text: text.to_string(),
        })
    }

    pub fn segments(&self) -> Vec<Segment<'_>> {
        parse_mentions(&self.text)
    }

    pub fn mentioned_user_ids(&self) -> Vec<&str> {
        mentioned_user_ids(&self.text)
    }
}

/// Piece of comment text: plain text or a mention chip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment<'a> {
    Text(&'a str),
    Mention { display: &'a str, user_id: &'a str },
}

/// Split text into plain runs and `@[display](userId)` mentions.
/// Malformed markup is left as plain text.
pub fn parse_mentions(text: &str) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    let mut plain_start = 0;
    let mut cursor = 0;

    while let Some(offset) = text[cursor..].find("@[") {
        let at = cursor + offset;
        match parse_mention_at(&text[at..]) {
            Some((display, user_id, len)) => {
                if at > plain_start {
                    segments.push(Segment::Text(&text[plain_start..at]));
                }
                segments.push(Segment::Mention { display, user_id });
                cursor = at + len;
                plain_start = cursor;
            }
            None => cursor = at + 2,
        }
    }
    if plain_start < text.len() {
        segments.push(Segment::Text(&text[plain_start..]));
    }
    segments
}

/// Parse one mention at the start of `s`, returning (display, id, byte length)
fn parse_mention_at(s: &str) -> Option<(&str, &str, usize)> {
    let rest = s.strip_prefix("@[")?;
    let close = rest.find(']')?;
    let display = &rest[..close];
    let after = rest[close + 1..].strip_prefix('(')?;
    let end = after.find(')')?;
    let user_id = &after[..end];
    if display.is_empty() || user_id.is_empty() {
        return None;
    }
    // "@[" + display + "](" + id + ")"
    let len = 2 + display.len() + 2 + user_id.len() + 1;
    Some((display, user_id, len))
}

/// Ids of every user mentioned in `text`, in order of appearance, without
/// duplicates
pub fn mentioned_user_ids(text: &str) -> Vec<&str> {
    let mut ids: Vec<&str> = Vec::new();
    for segment in parse_mentions(text) {
        if let Segment::Mention { user_id, .. } = segment {
            if !ids.contains(&user_id) {
                ids.push(user_id);
            }
        }
    }
    ids
}

/// Render mention markup as `@display`
pub fn render_plain(text: &str) -> String {
    parse_mentions(text)
        .into_iter()
        .map(|segment| match segment {
            Segment::Text(t) => t.to_string(),
            Segment::Mention { display, .. } => format!("@{display}"),
        })
        .collect()
}

/// Order comments for display: oldest first, ties broken by id so every
/// replica shows the same order
pub fn sort_for_display(comments: &mut [Comment]) {
    comments.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_trims_and_rejects_blank_text() {
        let origin = ReplicaId(7);
        let comment = Comment::new(origin, Some("u1"), "  looks good \n").unwrap();
        assert_eq!(comment.text, "looks good");
        assert_eq!(comment.author_id, "u1");
        assert!(comment.id.starts_with("7-"));

        assert!(Comment::new(origin, None, "   ").is_err());
        let guest = Comment::new(origin, None, "hi").unwrap();
        assert_eq!(guest.author_id, GUEST_AUTHOR);
    }

    #[test]
    fn mentions_are_split_from_plain_text() {
        let segments = parse_mentions("hey @[Ann Lee](u42), see @[Bob](u7)!");
        assert_eq!(
            segments,
            [
                Segment::Text("hey "),
                Segment::Mention { display: "Ann Lee", user_id: "u42" },
                Segment::Text(", see "),
                Segment::Mention { display: "Bob", user_id: "u7" },
                Segment::Text("!"),
            ]
        );
        assert_eq!(render_plain("hey @[Ann Lee](u42)"), "hey @Ann Lee");
    }

    #[test]
    fn malformed_markup_stays_plain() {
        assert_eq!(parse_mentions("mail me @[x"), [Segment::Text("mail me @[x")]);
        assert_eq!(parse_mentions("@[](id) ok"), [Segment::Text("@[](id) ok")]);
        assert!(mentioned_user_ids("@[name] (id)").is_empty());
    }

    #[test]
    fn mentioned_ids_are_deduplicated() {
        let ids = mentioned_user_ids("@[A](1) @[B](2) @[A again](1)");
        assert_eq!(ids, ["1", "2"]);
    }

    #[test]
    fn display_order_is_by_timestamp_then_id() {
        let origin = ReplicaId(1);
        let mut comments = vec![
            Comment::at(origin, None, "late", 30).unwrap(),
            Comment::at(origin, None, "early", 10).unwrap(),
            Comment::at(origin, None, "middle", 20).unwrap(),
        ];
        sort_for_display(&mut comments);
        let texts: Vec<&str> = comments.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, ["early", "middle", "late"]);
    }
}
