use std::cmp::Ordering;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ParseError;
use crate::identity::record_identity;

/// A single announcement, immutable once admitted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AnnouncementRecord {
    pub identifier: String,
    /// Timestamp attributed by the source feed. `None` when the raw value
    /// could not be normalised; such records sort as the oldest.
    pub observed_at: Option<DateTime<Utc>>,
    /// Raw timestamp text as published by the feed.
    #[serde(default)]
    pub published: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub link: String,
}

impl AnnouncementRecord {
    /// Ordering used everywhere records are ranked: newest `observed_at`
    /// first, identifier as the tie-break so ranking is total.
    pub fn cmp_newest_first(a: &Self, b: &Self) -> Ordering {
        b.observed_at
            .cmp(&a.observed_at)
            .then_with(|| a.identifier.cmp(&b.identifier))
    }
}

/// Sorts newest first and truncates to `cap`.
pub fn rank_and_truncate(records: &mut Vec<AnnouncementRecord>, cap: usize) {
    records.sort_by(AnnouncementRecord::cmp_newest_first);
    records.truncate(cap);
}

/// A parsed feed item before identity is derived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedCandidate {
    pub published: String,
    pub title: String,
    pub description: String,
    pub link: String,
}

impl FeedCandidate {
    pub fn into_record(self) -> AnnouncementRecord {
        let identifier = record_identity(&self.published, &self.title, &self.description, &self.link);
        AnnouncementRecord {
            identifier,
            observed_at: normalize_timestamp(&self.published),
            published: self.published,
            title: self.title,
            description: self.description,
            link: self.link,
        }
    }

    fn from_parts(
        title: Option<&str>,
        description: Option<&str>,
        link: Option<&str>,
        published: Option<String>,
    ) -> Option<Self> {
        let title = title.map(str::trim).filter(|t| !t.is_empty());
        let description = description.map(str::trim).filter(|d| !d.is_empty());
        if title.is_none() && description.is_none() {
            return None;
        }
        Some(Self {
            published: published.map(|p| p.trim().to_owned()).unwrap_or_default(),
            title: title.unwrap_or("No Title").to_owned(),
            description: description.unwrap_or("No Description").to_owned(),
            link: link.map(str::trim).unwrap_or_default().to_owned(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedFeed {
    /// Candidates in document order (feeds usually list newest first).
    pub candidates: Vec<FeedCandidate>,
    /// Items dropped because they carried neither title nor description.
    pub skipped: usize,
}

/// Reads RSS 2.0, falling back to Atom. Malformed items are skipped one by
/// one; only an unreadable document fails the whole call.
pub fn parse_feed(content: &str) -> Result<ParsedFeed, ParseError> {
    let rss_err = match content.parse::<rss::Channel>() {
        Ok(channel) => return Ok(parse_rss(&channel)),
        Err(err) => err.to_string(),
    };
    match content.parse::<atom_syndication::Feed>() {
        Ok(feed) => Ok(parse_atom(&feed)),
        Err(atom_err) => Err(ParseError::UnknownFormat {
            rss: rss_err,
            atom: atom_err.to_string(),
        }),
    }
}

fn parse_rss(channel: &rss::Channel) -> ParsedFeed {
    let mut parsed = ParsedFeed::default();
    for item in channel.items() {
        match FeedCandidate::from_parts(
            item.title(),
            item.description(),
            item.link(),
            item.pub_date().map(ToOwned::to_owned),
        ) {
            Some(candidate) => parsed.candidates.push(candidate),
            None => {
                parsed.skipped += 1;
                warn!(guid = ?item.guid().map(|g| g.value()), "skipping feed item without title or description");
            }
        }
    }
    debug!(items = parsed.candidates.len(), skipped = parsed.skipped, "parsed rss channel");
    parsed
}

fn parse_atom(feed: &atom_syndication::Feed) -> ParsedFeed {
    let mut parsed = ParsedFeed::default();
    for entry in feed.entries() {
        let summary = entry
            .summary()
            .map(|text| text.value.as_str())
            .or_else(|| entry.content().and_then(|content| content.value()));
        let published = entry
            .published()
            .unwrap_or_else(|| entry.updated())
            .to_rfc3339();
        match FeedCandidate::from_parts(
            Some(entry.title().value.as_str()),
            summary,
            entry.links().first().map(|link| link.href()),
            Some(published),
        ) {
            Some(candidate) => parsed.candidates.push(candidate),
            None => {
                parsed.skipped += 1;
                warn!(id = %entry.id(), "skipping atom entry without title or summary");
            }
        }
    }
    debug!(items = parsed.candidates.len(), skipped = parsed.skipped, "parsed atom feed");
    parsed
}

// Exchange feeds mix RFC 2822 with their own day-month-name layouts.
const NAIVE_FORMATS: &[&str] = &[
    "%d-%b-%Y %H:%M:%S",
    "%d-%b-%Y %H:%M",
    "%d %b %Y %H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%d-%m-%Y %H:%M:%S",
];

/// Normalises a feed timestamp to UTC. Naive values are taken as UTC.
/// Returns `None` when nothing matches, which ranks the record as oldest.
pub fn normalize_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Announcements</title>
    <link>http://example.com/</link>
    <description>Test</description>
    <item>
      <title>Board Meeting</title>
      <link>http://example.com/a.pdf</link>
      <description>Outcome of board meeting</description>
      <pubDate>18-Oct-2026 14:05:33</pubDate>
    </item>
    <item>
      <link>http://example.com/broken</link>
    </item>
    <item>
      <description>Only a description</description>
      <pubDate>Mon, 19 Oct 2026 08:00:00 GMT</pubDate>
    </item>
  </channel>
</rss>"#;

    #[test]
    fn rss_items_are_parsed_and_malformed_ones_skipped() {
        let parsed = parse_feed(RSS).unwrap();
        assert_eq!(parsed.skipped, 1);
        assert_eq!(parsed.candidates.len(), 2);
        assert_eq!(parsed.candidates[0].title, "Board Meeting");
        assert_eq!(parsed.candidates[0].published, "18-Oct-2026 14:05:33");
        assert_eq!(parsed.candidates[1].title, "No Title");
        assert_eq!(parsed.candidates[1].link, "");
    }

    #[test]
    fn atom_is_used_when_document_is_not_rss() {
        let atom = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Example</title>
  <id>urn:feed</id>
  <updated>2026-10-18T10:00:00Z</updated>
  <entry>
    <title>Dividend</title>
    <id>urn:1</id>
    <updated>2026-10-18T09:00:00Z</updated>
    <link href="http://example.com/1"/>
    <summary>Interim dividend declared</summary>
  </entry>
</feed>"#;
        let parsed = parse_feed(atom).unwrap();
        assert_eq!(parsed.candidates.len(), 1);
        assert_eq!(parsed.candidates[0].link, "http://example.com/1");
        let record = parsed.candidates[0].clone().into_record();
        assert_eq!(
            record.observed_at,
            Some(Utc.with_ymd_and_hms(2026, 10, 18, 9, 0, 0).unwrap())
        );
    }

    #[test]
    fn garbage_document_is_an_error() {
        assert!(parse_feed("<html><body>Just a moment...</body></html>").is_err());
    }

    #[test]
    fn timestamps_normalize_across_formats() {
        let expected = Utc.with_ymd_and_hms(2026, 10, 18, 14, 5, 33).unwrap();
        assert_eq!(normalize_timestamp("18-Oct-2026 14:05:33"), Some(expected));
        assert_eq!(normalize_timestamp("Sun, 18 Oct 2026 14:05:33 GMT"), Some(expected));
        assert_eq!(normalize_timestamp("2026-10-18T16:05:33+02:00"), Some(expected));
        assert_eq!(normalize_timestamp(" 2026-10-18 14:05:33 "), Some(expected));
        assert_eq!(normalize_timestamp("yesterday"), None);
        assert_eq!(normalize_timestamp(""), None);
    }

    #[test]
    fn unparseable_timestamps_rank_last() {
        let dated = FeedCandidate {
            published: "18-Oct-2026 14:05:33".into(),
            title: "a".into(),
            description: "d".into(),
            link: String::new(),
        }
        .into_record();
        let undated = FeedCandidate {
            published: "soon".into(),
            title: "b".into(),
            description: "d".into(),
            link: String::new(),
        }
        .into_record();
        let mut records = vec![undated.clone(), dated.clone()];
        rank_and_truncate(&mut records, 10);
        assert_eq!(records, vec![dated, undated]);
    }
}
