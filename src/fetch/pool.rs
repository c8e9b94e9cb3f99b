//! Bounded pool of authenticated connections to one upstream provider
//! (§4.5). RAII-returning pool borrowed from the teacher's
//! [`crate::nntp::client::NntpPool`]/`PooledClient` shape, generalised to
//! connect/authenticate/`MODE READER` once per connection instead of once
//! per pool.

use std::sync::Arc;
use std::time::Duration;

use async_channel::{bounded, Receiver, Sender};
use nntp_rs::net_client::NntpClient;
use tokio::time::timeout;

use crate::config::ProviderConfig;
use crate::error::FetchError;
use crate::nntp::tls::{set_tls_required, NntpStream};

pub struct ProviderPool {
    pub config: ProviderConfig,
    tx: Sender<NntpClient<NntpStream>>,
    rx: Receiver<NntpClient<NntpStream>>,
}

impl ProviderPool {
    pub fn new(config: ProviderConfig) -> Arc<Self> {
        let (tx, rx) = bounded(config.pool_size);
        Arc::new(ProviderPool { config, tx, rx })
    }

    pub async fn get(&self) -> Result<PooledProvider<'_>, FetchError> {
        let client = match self.rx.try_recv() {
            Ok(client) => client,
            Err(_) => self.connect().await?,
        };
        Ok(PooledProvider { client: Some(client), tx: self.tx.clone(), pool: self })
    }

    async fn connect(&self) -> Result<NntpClient<NntpStream>, FetchError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        set_tls_required(self.config.requires_tls_for_credentials());

        let connect_timeout = Duration::from_secs(self.config.timeout_seconds);
        let mut client = timeout(connect_timeout, NntpClient::<NntpStream>::connect(&addr))
            .await
            .map_err(|_| FetchError::Connect(format!("timed out connecting to {addr}")))?
            .map_err(|e| FetchError::Connect(e.to_string()))?;

        if let (Some(user), Some(pass)) = (&self.config.username, &self.config.password) {
            client.authenticate(user, pass).await?;
        }
        client.mode_reader().await?;
        Ok(client)
    }
}

pub struct PooledProvider<'a> {
    client: Option<NntpClient<NntpStream>>,
    tx: Sender<NntpClient<NntpStream>>,
    pool: &'a ProviderPool,
}

impl<'a> PooledProvider<'a> {
    pub fn client(&mut self) -> &mut NntpClient<NntpStream> {
        self.client.as_mut().expect("pooled client taken twice")
    }

    pub fn provider_id(&self) -> &str {
        &self.pool.config.name
    }
}

impl Drop for PooledProvider<'_> {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            let _ = self.tx.try_send(client);
        }
    }
}
