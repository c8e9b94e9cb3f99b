//! Accept loop (§4.4): plain and optional TLS listeners, connection
//! admission control, and signal-driven graceful shutdown.

use std::io::BufReader as StdBufReader;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rustls::ServerConfig;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::error::ConfigError;
use crate::nntp::auth::AuthGuard;
use crate::nntp::engine::Engine;
use crate::nntp::session::Session;

/// Tracks connection counts for admission control (§4.4: global and
/// per-user caps). Per-user accounting starts once a session authenticates;
/// anonymous connections only count against the global cap.
pub struct ConnTracker {
    total: AtomicUsize,
    max_total: usize,
    max_per_user: usize,
    per_user: Mutex<std::collections::HashMap<String, usize>>,
}

impl ConnTracker {
    pub fn new(max_total: usize, max_per_user: usize) -> Arc<Self> {
        Arc::new(ConnTracker {
            total: AtomicUsize::new(0),
            max_total,
            max_per_user,
            per_user: Mutex::new(std::collections::HashMap::new()),
        })
    }

    fn try_acquire_global(&self) -> bool {
        loop {
            let current = self.total.load(Ordering::SeqCst);
            if current >= self.max_total {
                return false;
            }
            if self
                .total
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }

    fn release_global(&self) {
        self.total.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn try_acquire_user(&self, username: &str) -> bool {
        let mut map = self.per_user.lock().unwrap();
        let count = map.entry(username.to_string()).or_insert(0);
        if *count >= self.max_per_user {
            return false;
        }
        *count += 1;
        true
    }

    pub fn release_user(&self, username: &str) {
        let mut map = self.per_user.lock().unwrap();
        if let Some(count) = map.get_mut(username) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                map.remove(username);
            }
        }
    }
}

fn load_tls_config(cert_path: &str, key_path: &str) -> Result<ServerConfig, ConfigError> {
    let cert_file = std::fs::File::open(cert_path)
        .map_err(|e| ConfigError::Invalid(format!("opening TLS cert {cert_path}: {e}")))?;
    let key_file = std::fs::File::open(key_path)
        .map_err(|e| ConfigError::Invalid(format!("opening TLS key {key_path}: {e}")))?;

    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut StdBufReader::new(cert_file))
            .collect::<Result<_, _>>()
            .map_err(|e| ConfigError::Invalid(format!("parsing TLS cert {cert_path}: {e}")))?;

    let key: PrivateKeyDer<'static> =
        rustls_pemfile::private_key(&mut StdBufReader::new(key_file))
            .map_err(|e| ConfigError::Invalid(format!("parsing TLS key {key_path}: {e}")))?
            .ok_or_else(|| ConfigError::Invalid(format!("no private key found in {key_path}")))?;

    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ConfigError::Invalid(format!("building TLS server config: {e}")))
}

/// Run the plain-TCP and (if configured) TLS accept loops until `shutdown`
/// fires. Returns once both listeners have stopped accepting and all spawned
/// sessions have been given the chance to drain.
pub async fn serve(
    config: Arc<AppConfig>,
    engine: Arc<Engine>,
    auth: Arc<AuthGuard>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let tracker = ConnTracker::new(
        config.nntp.max_connections as usize,
        config.nntp.max_connections_per_user as usize,
    );

    let plain_addr: SocketAddr = format!("{}:{}", config.nntp.bind_host, config.nntp.port)
        .parse()
        .expect("invalid bind_host/port in configuration");
    let plain_listener = TcpListener::bind(plain_addr).await?;
    tracing::info!(addr = %plain_addr, "nntp listener ready");

    let tls_acceptor = match (&config.nntp.tls_port, &config.nntp.tls_cert_path, &config.nntp.tls_key_path) {
        (Some(port), Some(cert), Some(key)) => {
            let tls_config = load_tls_config(cert, key)
                .unwrap_or_else(|e| panic!("fatal: invalid TLS configuration: {e}"));
            Some((*port, TlsAcceptor::from(Arc::new(tls_config))))
        }
        _ => None,
    };

    let plain_task = {
        let engine = Arc::clone(&engine);
        let auth = Arc::clone(&auth);
        let tracker = Arc::clone(&tracker);
        let shutdown = shutdown.clone();
        tokio::spawn(accept_plain(plain_listener, engine, auth, tracker, shutdown))
    };

    let tls_task = if let Some((port, acceptor)) = tls_acceptor {
        let addr: SocketAddr = format!("{}:{}", config.nntp.bind_host, port)
            .parse()
            .expect("invalid bind_host/tls_port in configuration");
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(addr = %addr, "nntp-over-tls listener ready");
        let engine = Arc::clone(&engine);
        let auth = Arc::clone(&auth);
        let tracker = Arc::clone(&tracker);
        let shutdown = shutdown.clone();
        Some(tokio::spawn(accept_tls(listener, acceptor, engine, auth, tracker, shutdown)))
    } else {
        None
    };

    let _ = plain_task.await;
    if let Some(t) = tls_task {
        let _ = t.await;
    }
    Ok(())
}

async fn accept_plain(
    listener: TcpListener,
    engine: Arc<Engine>,
    auth: Arc<AuthGuard>,
    tracker: Arc<ConnTracker>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => spawn_session(stream, peer, Arc::clone(&engine), Arc::clone(&auth), Arc::clone(&tracker)),
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                }
            }
        }
    }
}

async fn accept_tls(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    engine: Arc<Engine>,
    auth: Arc<AuthGuard>,
    tracker: Arc<ConnTracker>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let acceptor = acceptor.clone();
                        let engine = Arc::clone(&engine);
                        let auth = Arc::clone(&auth);
                        let tracker = Arc::clone(&tracker);
                        tokio::spawn(async move {
                            match acceptor.accept(stream).await {
                                Ok(tls_stream) => run_session(tls_stream, peer, engine, auth, tracker).await,
                                Err(e) => tracing::warn!(error = %e, %peer, "tls handshake failed"),
                            }
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                }
            }
        }
    }
}

fn spawn_session(
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
    engine: Arc<Engine>,
    auth: Arc<AuthGuard>,
    tracker: Arc<ConnTracker>,
) {
    tokio::spawn(run_session(stream, peer, engine, auth, tracker));
}

async fn run_session<S>(stream: S, peer: SocketAddr, engine: Arc<Engine>, auth: Arc<AuthGuard>, tracker: Arc<ConnTracker>)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    if !tracker.try_acquire_global() {
        tracing::warn!(%peer, "rejecting connection: global connection cap reached");
        return;
    }
    tracing::info!(%peer, "nntp connection accepted");
    let mut session = Session::new(engine, auth, peer).with_tracker(Arc::clone(&tracker));
    if let Err(e) = session.run(stream).await {
        tracing::debug!(%peer, error = %e, "session ended with I/O error");
    }
    tracker.release_global();
    tracing::info!(%peer, "nntp connection closed");
}

/// Install SIGINT/SIGTERM handling that cancels `token` once, mirroring the
/// signal-handling shape used for the HTTP listener's shutdown.
pub fn install_signal_handlers(token: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            tokio::signal::ctrl_c().await.expect("failed to install ctrl-c handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler")
                .recv()
                .await;
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => tracing::info!("received ctrl-c, shutting down"),
            _ = terminate => tracing::info!("received SIGTERM, shutting down"),
        }
        token.cancel();
    });
}
