//! End-to-end NNTP wire protocol tests against an in-process server bound to
//! an ephemeral port, covering the cold-start POST, duplicate POST,
//! cross-post, threading, and concurrent TAKETHIS scenarios.

use std::sync::Arc;

use archnews::config::{AppConfig, EngineConfig, HistoryConfig, LoggingConfig, NntpServerSettings, StorageConfig};
use archnews::history::HistoryStore;
use archnews::nntp::auth::AuthGuard;
use archnews::nntp::engine::Engine;
use archnews::nntp::session::Session;
use archnews::storage::catalog::Catalog;
use archnews::storage::pool::ShardPool;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// Seed an `nntp_users` row directly via a raw connection: the catalog
/// deliberately exposes no user-creation API (that's an admin collaborator
/// concern), so tests that need an authenticated session open the same
/// sqlite file rather than growing the production surface.
fn seed_user(data_dir: &std::path::Path, username: &str, password: &str) {
    let conn = rusqlite::Connection::open(data_dir.join("catalog.db")).unwrap();
    conn.execute(
        "INSERT INTO nntp_users(username, password_hash, max_connections, can_post, active)
         VALUES (?1, ?2, 8, 1, 1)",
        rusqlite::params![username, archnews::nntp::auth::hash_password(password)],
    )
    .unwrap();
}

async fn authed_client(addr: std::net::SocketAddr, username: &str, password: &str) -> Client {
    let mut client = Client::connect(addr).await;
    client.send(&format!("AUTHINFO USER {username}")).await;
    assert_eq!(client.read_line().await, "381 password required");
    client.send(&format!("AUTHINFO PASS {password}")).await;
    assert_eq!(client.read_line().await, "281 authentication accepted");
    client
}

async fn spawn_server(data_dir: &std::path::Path, group: &str) -> std::net::SocketAddr {
    let config = Arc::new(AppConfig {
        engine: EngineConfig {
            hostname: Some("news.test".into()),
            data_dir: data_dir.display().to_string(),
        },
        history: HistoryConfig { short_hash_width: 5 },
        storage: StorageConfig::default(),
        nntp: NntpServerSettings {
            bind_host: "127.0.0.1".into(),
            port: 0,
            tls_port: None,
            tls_cert_path: None,
            tls_key_path: None,
            max_connections: 64,
            max_connections_per_user: 8,
            max_article_bytes: 1 << 20,
        },
        provider: vec![],
        logging: LoggingConfig::default(),
    });

    let catalog = Arc::new(Catalog::open(data_dir).unwrap());
    catalog.ensure_group(group, "").unwrap();
    let shards = ShardPool::new(data_dir.join("shards"), 8, 16);
    let history = HistoryStore::open(&data_dir.join("history"), 5).await.unwrap();
    let engine = Engine::new(config, catalog, shards, history);
    let auth = Arc::new(AuthGuard::new(engine.catalog.clone()));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, peer)) = listener.accept().await else { break };
            let engine = Arc::clone(&engine);
            let auth = Arc::clone(&auth);
            tokio::spawn(async move {
                let mut session = Session::new(engine, auth, peer);
                let _ = session.run(stream).await;
            });
        }
    });

    addr
}

struct Client {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, writer) = stream.into_split();
        let mut client = Client { reader: BufReader::new(read_half), writer };
        client.read_line().await; // greeting
        client
    }

    async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\r\n").await.unwrap();
    }

    async fn read_line(&mut self) -> String {
        let mut buf = String::new();
        self.reader.read_line(&mut buf).await.unwrap();
        buf.trim_end().to_string()
    }

    async fn send_article(&mut self, raw: &str) {
        for line in raw.lines() {
            self.send(line).await;
        }
        self.send(".").await;
    }
}

#[tokio::test]
async fn cold_start_post_then_stat_and_body() {
    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_server(dir.path(), "comp.lang.rust").await;
    seed_user(dir.path(), "tester", "hunter2");
    let mut client = authed_client(addr, "tester", "hunter2").await;

    client.send("POST").await;
    assert_eq!(client.read_line().await, "340 send article to be posted");
    client
        .send_article("Message-ID: <a@x>\r\nNewsgroups: comp.lang.rust\r\nSubject: hi\r\nFrom: a@b\r\n\r\nhello")
        .await;
    assert_eq!(client.read_line().await, "240 article posted ok");

    client.send("GROUP comp.lang.rust").await;
    assert_eq!(client.read_line().await, "211 1 1 1 comp.lang.rust");

    client.send("STAT 1").await;
    assert_eq!(client.read_line().await, "223 1 <a@x>");

    client.send("BODY 1").await;
    assert_eq!(client.read_line().await, "222 1 <a@x>");
    assert_eq!(client.read_line().await, "hello");
    assert_eq!(client.read_line().await, ".");
}

#[tokio::test]
async fn duplicate_post_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_server(dir.path(), "comp.lang.rust").await;
    seed_user(dir.path(), "tester", "hunter2");
    let mut client = authed_client(addr, "tester", "hunter2").await;

    for expected in ["240 article posted ok", "441 posting failed (duplicate)"] {
        client.send("POST").await;
        assert_eq!(client.read_line().await, "340 send article to be posted");
        client
            .send_article("Message-ID: <dup@x>\r\nNewsgroups: comp.lang.rust\r\n\r\nbody")
            .await;
        assert_eq!(client.read_line().await, expected);
    }
}

#[tokio::test]
async fn crosspost_lands_in_both_groups() {
    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_server(dir.path(), "comp.lang.rust").await;

    // ensure the second group exists before the connection accepts the post
    let catalog = Catalog::open(dir.path()).unwrap();
    catalog.ensure_group("comp.lang.go", "").unwrap();
    drop(catalog);
    seed_user(dir.path(), "tester", "hunter2");

    let mut client = authed_client(addr, "tester", "hunter2").await;
    client.send("POST").await;
    assert_eq!(client.read_line().await, "340 send article to be posted");
    client
        .send_article("Message-ID: <cross@x>\r\nNewsgroups: comp.lang.rust, comp.lang.go\r\n\r\nhi")
        .await;
    assert_eq!(client.read_line().await, "240 article posted ok");

    client.send("GROUP comp.lang.go").await;
    assert_eq!(client.read_line().await, "211 1 1 1 comp.lang.go");
    client.send("STAT 1").await;
    assert_eq!(client.read_line().await, "223 1 <cross@x>");
}

#[tokio::test]
async fn reply_is_threaded_under_its_reference() {
    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_server(dir.path(), "comp.lang.rust").await;
    seed_user(dir.path(), "tester", "hunter2");
    let mut client = authed_client(addr, "tester", "hunter2").await;

    client.send("POST").await;
    assert_eq!(client.read_line().await, "340 send article to be posted");
    client
        .send_article("Message-ID: <r@x>\r\nNewsgroups: comp.lang.rust\r\n\r\nroot")
        .await;
    assert_eq!(client.read_line().await, "240 article posted ok");

    client.send("POST").await;
    assert_eq!(client.read_line().await, "340 send article to be posted");
    client
        .send_article("Message-ID: <c@x>\r\nNewsgroups: comp.lang.rust\r\nReferences: <r@x>\r\n\r\nreply")
        .await;
    assert_eq!(client.read_line().await, "240 article posted ok");

    let shards = ShardPool::new(dir.path().join("shards"), 8, 16);
    let handle = shards.get_shard("comp.lang.rust").await.unwrap();
    let root_row = handle.shard.thread_row_for_child(1).unwrap().unwrap();
    assert_eq!(root_row.root_article, 1);
    assert_eq!(root_row.parent_article, None);
    assert_eq!(root_row.depth, 0);

    let child_row = handle.shard.thread_row_for_child(2).unwrap().unwrap();
    assert_eq!(child_row.root_article, 1);
    assert_eq!(child_row.parent_article, Some(1));
    assert_eq!(child_row.depth, 1);
}

#[tokio::test]
async fn concurrent_takethis_storm_dedupes_to_one_per_message_id() {
    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_server(dir.path(), "comp.lang.rust").await;
    seed_user(dir.path(), "tester", "hunter2");

    let mut handles = Vec::new();
    for worker in 0..10u32 {
        handles.push(tokio::spawn(async move {
            let mut client = authed_client(addr, "tester", "hunter2").await;
            let mut ids: Vec<u32> = (0..20).collect();
            if worker % 2 == 0 {
                ids.reverse();
            }
            for i in ids {
                let msgid = format!("<storm{i}@x>");
                client.send(&format!("TAKETHIS {msgid}")).await;
                client
                    .send_article(&format!("Message-ID: {msgid}\r\nNewsgroups: comp.lang.rust\r\n\r\nbody{i}"))
                    .await;
                let reply = client.read_line().await;
                assert!(reply.starts_with("239") || reply.starts_with("439"), "unexpected reply: {reply}");
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let catalog = Catalog::open(dir.path()).unwrap();
    let group = catalog.get_group("comp.lang.rust").unwrap().unwrap();
    assert_eq!(group.message_count, 20);
}
