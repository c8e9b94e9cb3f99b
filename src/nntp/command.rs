//! Command parsing (§4.4). Textual, CRLF-terminated, case-insensitive verbs.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArticleRef {
    Number(i64),
    MessageId(String),
    Current,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Range {
    pub low: i64,
    pub high: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Capabilities,
    ModeReader,
    Quit,
    AuthInfoUser(String),
    AuthInfoPass(String),
    ListActive(Option<String>),
    ListNewsgroups(Option<String>),
    Group(String),
    ListGroup(Option<String>),
    Stat(ArticleRef),
    Head(ArticleRef),
    Body(ArticleRef),
    Article(ArticleRef),
    Next,
    Last,
    Over(Option<Range>),
    Xover(Option<Range>),
    Hdr(String, Option<ArticleRef>),
    Xhdr(String, Option<ArticleRef>),
    NewNews { wildmat: String, group: String },
    NewGroups { date: String, time: String },
    Date,
    Post,
    Ihave(String),
    Check(String),
    Takethis(String),
    Unknown(String),
}

fn parse_article_ref(token: Option<&str>) -> ArticleRef {
    match token {
        None => ArticleRef::Current,
        Some(t) if t.starts_with('<') => ArticleRef::MessageId(t.to_string()),
        Some(t) => t.parse().map(ArticleRef::Number).unwrap_or(ArticleRef::Current),
    }
}

fn parse_range(token: Option<&str>) -> Option<Range> {
    let t = token?;
    if let Some((low, high)) = t.split_once('-') {
        Some(Range {
            low: low.parse().ok()?,
            high: if high.is_empty() { None } else { high.parse().ok() },
        })
    } else {
        let n: i64 = t.parse().ok()?;
        Some(Range { low: n, high: Some(n) })
    }
}

/// Parse one command line. Unrecognised verbs become [`Command::Unknown`] so
/// the session can reply `500` without tearing down the connection.
pub fn parse(line: &str) -> Command {
    let mut parts = line.split_whitespace();
    let verb = parts.next().unwrap_or("").to_ascii_uppercase();
    let rest: Vec<&str> = parts.collect();

    match verb.as_str() {
        "CAPABILITIES" => Command::Capabilities,
        "MODE" if rest.first().map(|s| s.eq_ignore_ascii_case("reader")).unwrap_or(false) => {
            Command::ModeReader
        }
        "QUIT" => Command::Quit,
        "AUTHINFO" => match rest.first().map(|s| s.to_ascii_uppercase()) {
            Some(ref s) if s == "USER" => {
                Command::AuthInfoUser(rest.get(1).unwrap_or(&"").to_string())
            }
            Some(ref s) if s == "PASS" => {
                Command::AuthInfoPass(rest.get(1).unwrap_or(&"").to_string())
            }
            _ => Command::Unknown(line.to_string()),
        },
        "LIST" => match rest.first().map(|s| s.to_ascii_uppercase()) {
            Some(ref s) if s == "ACTIVE" => Command::ListActive(rest.get(1).map(|s| s.to_string())),
            Some(ref s) if s == "NEWSGROUPS" => {
                Command::ListNewsgroups(rest.get(1).map(|s| s.to_string()))
            }
            None => Command::ListActive(None),
            _ => Command::Unknown(line.to_string()),
        },
        "GROUP" => Command::Group(rest.first().unwrap_or(&"").to_string()),
        "LISTGROUP" => Command::ListGroup(rest.first().map(|s| s.to_string())),
        "STAT" => Command::Stat(parse_article_ref(rest.first().copied())),
        "HEAD" => Command::Head(parse_article_ref(rest.first().copied())),
        "BODY" => Command::Body(parse_article_ref(rest.first().copied())),
        "ARTICLE" => Command::Article(parse_article_ref(rest.first().copied())),
        "NEXT" => Command::Next,
        "LAST" => Command::Last,
        "OVER" => Command::Over(parse_range(rest.first().copied())),
        "XOVER" => Command::Xover(parse_range(rest.first().copied())),
        "HDR" => Command::Hdr(
            rest.first().unwrap_or(&"").to_string(),
            rest.get(1).map(|t| parse_article_ref(Some(t))),
        ),
        "XHDR" => Command::Xhdr(
            rest.first().unwrap_or(&"").to_string(),
            rest.get(1).map(|t| parse_article_ref(Some(t))),
        ),
        "NEWNEWS" => Command::NewNews {
            wildmat: rest.first().unwrap_or(&"*").to_string(),
            group: rest.get(1).unwrap_or(&"").to_string(),
        },
        "NEWGROUPS" => Command::NewGroups {
            date: rest.first().unwrap_or(&"").to_string(),
            time: rest.get(1).unwrap_or(&"").to_string(),
        },
        "DATE" => Command::Date,
        "POST" => Command::Post,
        "IHAVE" => Command::Ihave(rest.first().unwrap_or(&"").to_string()),
        "CHECK" => Command::Check(rest.first().unwrap_or(&"").to_string()),
        "TAKETHIS" => Command::Takethis(rest.first().unwrap_or(&"").to_string()),
        _ => Command::Unknown(line.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_case_insensitively() {
        assert_eq!(parse("quit"), Command::Quit);
        assert_eq!(parse("QUIT"), Command::Quit);
    }

    #[test]
    fn parses_group() {
        assert_eq!(parse("GROUP comp.lang.rust"), Command::Group("comp.lang.rust".into()));
    }

    #[test]
    fn parses_stat_with_message_id() {
        assert_eq!(
            parse("STAT <a@x>"),
            Command::Stat(ArticleRef::MessageId("<a@x>".into()))
        );
    }

    #[test]
    fn parses_xover_range() {
        assert_eq!(
            parse("XOVER 1-100"),
            Command::Xover(Some(Range { low: 1, high: Some(100) }))
        );
    }

    #[test]
    fn unknown_verb_is_preserved() {
        assert_eq!(parse("BOGUS foo"), Command::Unknown("BOGUS foo".into()));
    }
}
