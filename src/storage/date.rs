//! Date normalisation (§4.2).
//!
//! All timestamps stored are UTC, canonical format `YYYY-MM-DD HH:MM:SS`.
//! Real-world NNTP `Date:` headers show up in RFC 2822, RFC 3339, and a
//! handful of legacy variants; unparseable values are kept verbatim in
//! `date_string` and flagged for the date-repair admin operation.

use chrono::{DateTime, NaiveDateTime, Utc};

pub const CANONICAL_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub struct ParsedDate {
    pub utc: Option<DateTime<Utc>>,
    pub date_string: String,
}

/// Parse a raw `Date:` header value, trying the formats real Usenet feeds
/// actually send, widest (RFC 2822) first.
pub fn parse_date_header(raw: &str) -> ParsedDate {
    let trimmed = raw.trim();

    if let Ok(dt) = DateTime::parse_from_rfc2822(trimmed) {
        return ParsedDate {
            utc: Some(dt.with_timezone(&Utc)),
            date_string: trimmed.to_string(),
        };
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return ParsedDate {
            utc: Some(dt.with_timezone(&Utc)),
            date_string: trimmed.to_string(),
        };
    }
    // Legacy "YYYY-MM-DD HH:MM:SS" with no timezone, assume UTC.
    if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, CANONICAL_FORMAT) {
        return ParsedDate {
            utc: Some(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc)),
            date_string: trimmed.to_string(),
        };
    }

    ParsedDate {
        utc: None,
        date_string: trimmed.to_string(),
    }
}

pub fn format_canonical(dt: &DateTime<Utc>) -> String {
    dt.format(CANONICAL_FORMAT).to_string()
}

/// §9 open question: a repair re-parse only overwrites the stored value when
/// it differs by more than this many seconds, avoiding churn from formatting
/// noise (e.g. dropped sub-second precision).
pub fn should_apply_repair(
    stored: &DateTime<Utc>,
    reparsed: &DateTime<Utc>,
    threshold_secs: i64,
) -> bool {
    (reparsed.timestamp() - stored.timestamp()).abs() > threshold_secs
}

/// Date-repair admin operation (§6, §9): re-parse every article's raw
/// `date_string` and overwrite the stored `date_sent` when the re-parsed
/// value disagrees by more than `threshold_secs`. Returns the number of
/// rows actually rewritten.
pub fn repair_shard_dates(
    shard: &crate::storage::shard::GroupShard,
    threshold_secs: i64,
) -> Result<usize, crate::error::StorageError> {
    use chrono::{DateTime, NaiveDateTime, Utc};

    let mut repaired = 0;
    for (article_num, stored_raw, date_string) in shard.date_candidates()? {
        let reparsed = parse_date_header(&date_string);
        let Some(reparsed_utc) = reparsed.utc else {
            continue;
        };

        let stored_utc: Option<DateTime<Utc>> = stored_raw
            .as_deref()
            .and_then(|s| NaiveDateTime::parse_from_str(s, CANONICAL_FORMAT).ok())
            .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc));

        let needs_repair = match stored_utc {
            Some(stored) => should_apply_repair(&stored, &reparsed_utc, threshold_secs),
            None => true,
        };

        if needs_repair {
            shard.update_date_sent(article_num, &format_canonical(&reparsed_utc))?;
            repaired += 1;
        }
    }
    Ok(repaired)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rfc2822() {
        let parsed = parse_date_header("Tue, 1 Jul 2025 10:00:00 +0000");
        assert!(parsed.utc.is_some());
    }

    #[test]
    fn falls_back_to_verbatim_on_garbage() {
        let parsed = parse_date_header("not a date at all");
        assert!(parsed.utc.is_none());
        assert_eq!(parsed.date_string, "not a date at all");
    }

    #[test]
    fn repair_threshold_ignores_sub_second_noise() {
        let stored = DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let reparsed = stored;
        assert!(!should_apply_repair(&stored, &reparsed, 1));
    }

    #[test]
    fn repair_rewrites_only_rows_that_disagree() {
        use crate::storage::shard::{GroupShard, NewArticle};

        let dir = tempfile::tempdir().unwrap();
        let shard = GroupShard::open(dir.path(), "comp.lang.rust").unwrap();
        shard
            .insert_article(&NewArticle {
                message_id: "<a@x>".into(),
                subject: "s".into(),
                from_header: "f".into(),
                date_sent: Some("2020-01-01 00:00:00".into()),
                date_string: "Tue, 1 Jul 2025 10:00:00 +0000".into(),
                references_text: String::new(),
                headers_json: "{}".into(),
                body_text: "body".into(),
                bytes: 4,
                lines: 1,
                path: String::new(),
            })
            .unwrap();
        shard
            .insert_article(&NewArticle {
                message_id: "<b@x>".into(),
                subject: "s".into(),
                from_header: "f".into(),
                date_sent: Some("2025-07-01 10:00:00".into()),
                date_string: "Tue, 1 Jul 2025 10:00:00 +0000".into(),
                references_text: String::new(),
                headers_json: "{}".into(),
                body_text: "body".into(),
                bytes: 4,
                lines: 1,
                path: String::new(),
            })
            .unwrap();

        let repaired = repair_shard_dates(&shard, 1).unwrap();
        assert_eq!(repaired, 1);

        let fixed = shard.get_article_by_num(1).unwrap().unwrap();
        assert_eq!(fixed.date_sent.as_deref(), Some("2025-07-01 10:00:00"));
        let untouched = shard.get_article_by_num(2).unwrap().unwrap();
        assert_eq!(untouched.date_sent.as_deref(), Some("2025-07-01 10:00:00"));
    }
}
