//! Per-connection command state machine (§4.4). One task per session; reply
//! order matches command-receipt order by construction (no concurrent
//! command processing within a session).

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, BufReader};

use crate::error::NntpError;
use crate::nntp::auth::{AuthGuard, AuthOutcome};
use crate::nntp::codec::{read_dotted_body, read_line, write_dotted_body, write_line};
use crate::nntp::command::{parse, ArticleRef, Command};
use crate::nntp::engine::Engine;
use crate::nntp::listener::ConnTracker;
use crate::storage::shard::ArticleRow;

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Greeted,
    Authed,
    Selected,
}

struct GroupCursor {
    name: String,
    low: i64,
    high: i64,
    current: i64,
}

pub struct Session {
    engine: Arc<Engine>,
    auth: Arc<AuthGuard>,
    peer: SocketAddr,
    state: State,
    username: Option<String>,
    can_post: bool,
    pending_user: Option<String>,
    group: Option<GroupCursor>,
    tracker: Option<Arc<ConnTracker>>,
}

impl Session {
    pub fn new(engine: Arc<Engine>, auth: Arc<AuthGuard>, peer: SocketAddr) -> Self {
        Session {
            engine,
            auth,
            peer,
            state: State::Greeted,
            username: None,
            // Matches the greeting's "posting permitted": anonymous posting
            // is allowed until AUTHINFO narrows it based on the account.
            can_post: true,
            pending_user: None,
            group: None,
            tracker: None,
        }
    }

    /// Enable per-user connection-cap enforcement (§4.4): counted against
    /// `tracker` from a successful AUTHINFO PASS until the session ends.
    pub fn with_tracker(mut self, tracker: Arc<ConnTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Drive one connection to completion. Returns once the peer closes, the
    /// session issues `QUIT`, or a protocol violation forces a close.
    pub async fn run<S>(&mut self, stream: S) -> std::io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);

        write_line(&mut write_half, "200 archnews NNTP service ready, posting permitted").await?;

        loop {
            let line = match read_line(&mut reader).await? {
                Some(l) => l,
                None => break,
            };
            if line.trim().is_empty() {
                continue;
            }

            tracing::debug!(peer = %self.peer, command = %line, "nntp command");
            let command = parse(&line);
            match self.dispatch(command, &mut reader, &mut write_half).await {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    tracing::warn!(peer = %self.peer, error = %e, "session error");
                    let _ = write_line(&mut write_half, "501 command syntax error").await;
                }
            }
        }
        if let (Some(tracker), Some(user)) = (&self.tracker, &self.username) {
            tracker.release_user(user);
        }
        Ok(())
    }

    /// Returns `Ok(true)` to keep reading, `Ok(false)` on QUIT/close.
    async fn dispatch<R, W>(&mut self, command: Command, reader: &mut R, writer: &mut W) -> Result<bool, std::io::Error>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        // §4.4 state table: Greeted only permits CAPABILITIES, MODE READER,
        // AUTHINFO, and QUIT. Everything else requires Authed (or Selected,
        // which is reached only via Authed).
        if self.state == State::Greeted && !allowed_before_auth(&command) {
            write_line(writer, "480 authentication required").await?;
            return Ok(true);
        }

        match command {
            Command::Capabilities => {
                write_line(writer, "101 Capability list:").await?;
                write_line(writer, "VERSION 2").await?;
                write_line(writer, "READER").await?;
                write_line(writer, "POST").await?;
                write_line(writer, "IHAVE").await?;
                write_line(writer, "OVER").await?;
                write_line(writer, "HDR").await?;
                write_line(writer, ".").await?;
                Ok(true)
            }
            Command::ModeReader => {
                write_line(writer, "200 Posting allowed").await?;
                Ok(true)
            }
            Command::Quit => {
                write_line(writer, "205 closing connection").await?;
                Ok(false)
            }
            Command::Date => {
                let now = chrono::Utc::now().format("%Y%m%d%H%M%S").to_string();
                write_line(writer, &format!("111 {now}")).await?;
                Ok(true)
            }
            Command::AuthInfoUser(user) => {
                self.pending_user = Some(user);
                write_line(writer, "381 password required").await?;
                Ok(true)
            }
            Command::AuthInfoPass(pass) => {
                self.handle_auth_pass(pass, writer).await
            }
            Command::Group(name) => self.handle_group(&name, writer).await,
            Command::Stat(reference) => self.handle_overview_reply(reference, writer, Mode::Stat).await,
            Command::Head(reference) => self.handle_overview_reply(reference, writer, Mode::Head).await,
            Command::Body(reference) => self.handle_overview_reply(reference, writer, Mode::Body).await,
            Command::Article(reference) => self.handle_overview_reply(reference, writer, Mode::Article).await,
            Command::Next => self.handle_navigate(1, writer).await,
            Command::Last => self.handle_navigate(-1, writer).await,
            Command::Post => self.handle_post(reader, writer).await,
            Command::Ihave(msgid) => self.handle_ihave(&msgid, reader, writer).await,
            Command::Check(msgid) => self.handle_check(&msgid, writer).await,
            Command::Takethis(msgid) => self.handle_takethis(&msgid, reader, writer).await,
            Command::ListActive(_) | Command::ListNewsgroups(_) | Command::ListGroup(_) => {
                write_line(writer, "215 list of newsgroups follows").await?;
                write_line(writer, ".").await?;
                Ok(true)
            }
            Command::Over(range) | Command::Xover(range) => self.handle_xover(range, writer).await,
            Command::Hdr(field, reference) | Command::Xhdr(field, reference) => {
                self.handle_hdr(&field, reference, writer).await
            }
            Command::NewNews { .. } | Command::NewGroups { .. } => {
                write_line(writer, "230 list of new articles follows").await?;
                write_line(writer, ".").await?;
                Ok(true)
            }
            Command::Unknown(_) => {
                write_line(writer, "500 command not recognized").await?;
                Ok(true)
            }
        }
    }

    async fn handle_auth_pass<W: AsyncWrite + Unpin>(&mut self, pass: String, writer: &mut W) -> Result<bool, std::io::Error> {
        let Some(user) = self.pending_user.take() else {
            write_line(writer, "482 AUTHINFO USER must precede PASS").await?;
            return Ok(true);
        };
        match self.auth.authenticate(&user, &pass).await {
            Ok(AuthOutcome::Accepted { can_post }) => {
                if let Some(tracker) = &self.tracker {
                    if !tracker.try_acquire_user(&user) {
                        write_line(writer, "482 too many connections for this account").await?;
                        return Ok(true);
                    }
                }
                self.username = Some(user);
                self.can_post = can_post;
                self.state = State::Authed;
                write_line(writer, "281 authentication accepted").await?;
            }
            Ok(AuthOutcome::InvalidCredentials) => {
                write_line(writer, "481 authentication failed").await?;
            }
            Ok(AuthOutcome::Locked) => {
                write_line(writer, "482 account temporarily locked").await?;
            }
            Err(_) => {
                write_line(writer, "403 internal fault, try again").await?;
            }
        }
        Ok(true)
    }

    async fn handle_group<W: AsyncWrite + Unpin>(&mut self, name: &str, writer: &mut W) -> Result<bool, std::io::Error> {
        match self.engine.catalog.get_group(name) {
            Ok(Some(group)) if group.active => {
                self.group = Some(GroupCursor {
                    name: name.to_string(),
                    low: group.low_water,
                    high: group.high_water,
                    current: group.low_water,
                });
                self.state = State::Selected;
                write_line(
                    writer,
                    &format!(
                        "211 {} {} {} {}",
                        group.message_count, group.low_water, group.high_water, name
                    ),
                )
                .await?;
            }
            Ok(_) => {
                write_line(writer, "411 no such newsgroup").await?;
            }
            Err(_) => {
                write_line(writer, "403 internal fault, try again").await?;
            }
        }
        Ok(true)
    }

    async fn resolve(&self, reference: ArticleRef) -> Result<Option<ArticleRow>, NntpError> {
        let Some(group) = &self.group else {
            return Err(NntpError::Protocol("no newsgroup selected".into()));
        };
        match reference {
            ArticleRef::Current => self.engine.get_article(&group.name, group.current).await,
            ArticleRef::Number(n) => self.engine.get_article(&group.name, n).await,
            ArticleRef::MessageId(id) => self.engine.get_article_by_msgid(&group.name, &id).await,
        }
    }

    async fn handle_overview_reply<W: AsyncWrite + Unpin>(&mut self, reference: ArticleRef, writer: &mut W, mode: Mode) -> Result<bool, std::io::Error> {
        match self.resolve(reference).await {
            Ok(Some(article)) => {
                if let Some(group) = &mut self.group {
                    group.current = article.article_num;
                }
                match mode {
                    Mode::Stat => {
                        write_line(writer, &format!("223 {} {}", article.article_num, article.message_id)).await?;
                    }
                    Mode::Head => {
                        write_line(writer, &format!("221 {} {}", article.article_num, article.message_id)).await?;
                        write_dotted_body(writer, reconstruct_headers(&article).as_bytes()).await?;
                    }
                    Mode::Body => {
                        write_line(writer, &format!("222 {} {}", article.article_num, article.message_id)).await?;
                        write_dotted_body(writer, article.body_text.as_bytes()).await?;
                    }
                    Mode::Article => {
                        write_line(writer, &format!("220 {} {}", article.article_num, article.message_id)).await?;
                        let mut full = reconstruct_headers(&article);
                        full.push_str("\r\n");
                        full.push_str(&article.body_text);
                        write_dotted_body(writer, full.as_bytes()).await?;
                    }
                }
            }
            Ok(None) => {
                write_line(writer, "430 no such article").await?;
            }
            Err(NntpError::Protocol(msg)) => {
                write_line(writer, &format!("412 {msg}")).await?;
            }
            Err(_) => {
                write_line(writer, "403 internal fault, try again").await?;
            }
        }
        Ok(true)
    }

    async fn handle_navigate<W: AsyncWrite + Unpin>(&mut self, direction: i64, writer: &mut W) -> Result<bool, std::io::Error> {
        let Some(group) = &self.group else {
            write_line(writer, "412 no newsgroup selected").await?;
            return Ok(true);
        };
        let target = group.current + direction;
        let (name, low, high) = (group.name.clone(), group.low, group.high);
        if target < low || target > high {
            write_line(writer, "421 no next article").await?;
            return Ok(true);
        }
        match self.engine.get_article(&name, target).await {
            Ok(Some(article)) => {
                if let Some(group) = &mut self.group {
                    group.current = target;
                }
                write_line(writer, &format!("223 {} {}", article.article_num, article.message_id)).await?;
            }
            _ => {
                write_line(writer, "421 no next article").await?;
            }
        }
        Ok(true)
    }

    async fn read_body_guarded<R: AsyncBufRead + Unpin>(&self, reader: &mut R) -> Result<Vec<u8>, NntpError> {
        read_dotted_body(reader, self.engine.config.nntp.max_article_bytes).await
    }

    async fn handle_post<R, W>(&mut self, reader: &mut R, writer: &mut W) -> Result<bool, std::io::Error>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        if !self.can_post {
            write_line(writer, "440 posting not permitted").await?;
            return Ok(true);
        }
        write_line(writer, "340 send article to be posted").await?;
        let body = match self.read_body_guarded(reader).await {
            Ok(b) => b,
            Err(_) => {
                write_line(writer, "441 posting failed").await?;
                return Ok(true);
            }
        };
        match self.engine.ingest(&body).await {
            Ok(_) => write_line(writer, "240 article posted ok").await?,
            Err(NntpError::Duplicate) => write_line(writer, "441 posting failed (duplicate)").await?,
            Err(NntpError::IngestSaturated) => write_line(writer, "431 ingest queue full, try again later").await?,
            Err(_) => write_line(writer, "441 posting failed").await?,
        }
        Ok(true)
    }

    async fn handle_ihave<R, W>(&mut self, msgid: &str, reader: &mut R, writer: &mut W) -> Result<bool, std::io::Error>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        if self.engine.history.lookup(msgid) != crate::history::LookupResult::NotFound {
            write_line(writer, "435 article not wanted").await?;
            return Ok(true);
        }
        write_line(writer, "335 send article").await?;
        let body = match self.read_body_guarded(reader).await {
            Ok(b) => b,
            Err(_) => {
                write_line(writer, "437 transfer rejected").await?;
                return Ok(true);
            }
        };
        match self.engine.ingest(&body).await {
            Ok(_) => write_line(writer, "235 article transferred ok").await?,
            Err(NntpError::Duplicate) => write_line(writer, "435 article not wanted").await?,
            Err(NntpError::IngestSaturated) => write_line(writer, "436 transfer not possible, try again later").await?,
            Err(_) => write_line(writer, "437 transfer rejected").await?,
        }
        Ok(true)
    }

    async fn handle_check<W: AsyncWrite + Unpin>(&mut self, msgid: &str, writer: &mut W) -> Result<bool, std::io::Error> {
        match self.engine.history.lookup(msgid) {
            crate::history::LookupResult::NotFound => {
                write_line(writer, &format!("238 {msgid}")).await?;
            }
            _ => {
                write_line(writer, &format!("438 {msgid}")).await?;
            }
        }
        Ok(true)
    }

    async fn handle_takethis<R, W>(&mut self, msgid: &str, reader: &mut R, writer: &mut W) -> Result<bool, std::io::Error>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let body = match self.read_body_guarded(reader).await {
            Ok(b) => b,
            Err(_) => {
                write_line(writer, &format!("439 {msgid}")).await?;
                return Ok(true);
            }
        };
        match self.engine.ingest(&body).await {
            Ok(_) => write_line(writer, &format!("239 {msgid}")).await?,
            Err(NntpError::Duplicate) => write_line(writer, &format!("439 {msgid}")).await?,
            Err(NntpError::IngestSaturated) => write_line(writer, &format!("439 {msgid}")).await?,
            Err(_) => write_line(writer, &format!("439 {msgid}")).await?,
        }
        Ok(true)
    }

    async fn handle_xover<W: AsyncWrite + Unpin>(&mut self, range: Option<crate::nntp::command::Range>, writer: &mut W) -> Result<bool, std::io::Error> {
        let Some(group) = &self.group else {
            write_line(writer, "412 no newsgroup selected").await?;
            return Ok(true);
        };
        let low = range.as_ref().map(|r| r.low).unwrap_or(group.low);
        let high = range.as_ref().and_then(|r| r.high).unwrap_or(group.high);
        write_line(writer, "224 overview information follows").await?;
        let handle = self.engine.shards.get_shard(&group.name).await;
        if let Ok(handle) = handle {
            if let Ok(rows) = handle.shard.overview_page(low, (high - low + 1).max(0) as u32) {
                for a in rows {
                    write_line(
                        writer,
                        &format!(
                            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
                            a.article_num,
                            a.subject,
                            a.from_header,
                            a.date_sent.clone().unwrap_or_default(),
                            a.message_id,
                            a.references_text,
                            a.bytes,
                            a.lines
                        ),
                    )
                    .await?;
                }
            }
        }
        write_line(writer, ".").await?;
        Ok(true)
    }

    async fn handle_hdr<W: AsyncWrite + Unpin>(&mut self, field: &str, reference: Option<ArticleRef>, writer: &mut W) -> Result<bool, std::io::Error> {
        let reference = reference.unwrap_or(ArticleRef::Current);
        match self.resolve(reference).await {
            Ok(Some(article)) => {
                write_line(writer, "225 header information follows").await?;
                let value = match field.to_ascii_lowercase().as_str() {
                    "subject" => article.subject.clone(),
                    "from" => article.from_header.clone(),
                    "message-id" => article.message_id.clone(),
                    "references" => article.references_text.clone(),
                    _ => String::new(),
                };
                write_line(writer, &format!("{} {}", article.article_num, value)).await?;
                write_line(writer, ".").await?;
            }
            _ => {
                write_line(writer, "430 no such article").await?;
            }
        }
        Ok(true)
    }
}

enum Mode {
    Stat,
    Head,
    Body,
    Article,
}

/// Commands the §4.4 state table allows before `Authed`.
fn allowed_before_auth(command: &Command) -> bool {
    matches!(
        command,
        Command::Capabilities | Command::ModeReader | Command::Quit | Command::AuthInfoUser(_) | Command::AuthInfoPass(_)
    )
}

fn reconstruct_headers(article: &ArticleRow) -> String {
    let mut out = String::new();
    out.push_str(&format!("Message-ID: {}\r\n", article.message_id));
    out.push_str(&format!("Subject: {}\r\n", article.subject));
    out.push_str(&format!("From: {}\r\n", article.from_header));
    if !article.references_text.is_empty() {
        out.push_str(&format!("References: {}\r\n", article.references_text));
    }
    out
}
