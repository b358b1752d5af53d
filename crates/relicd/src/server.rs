//! relicd server - accept loop and session wiring

use crate::config::Config;
use crate::crosslink::Crosslinker;
use crate::storage::{StorageError, UserRecord};
use crate::store::{Repository, StoreError};
use crate::sync;
use parking_lot::Mutex;
use reliquary_core::hash::shared_secret;
use reliquary_net::transport;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Server state
pub struct Server {
    config: Config,
    link: Arc<Crosslinker>,
    /// Sessions own the store for their whole transaction; one at a time
    session_lock: Arc<Mutex<()>>,
    /// Shutdown signal
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Result<Self, ServerError> {
        let repo = Repository::open(&config.data_dir)?;
        let storage = repo.storage();

        if storage.get_user("anonymous")?.is_none() {
            storage.put_user(&UserRecord {
                login: "anonymous".into(),
                pw: String::new(),
                caps: config.anonymous_caps.clone(),
            })?;
        }
        if let Some(login) = &config.admin_user {
            let project = repo.project_code()?;
            storage.put_user(&UserRecord {
                login: login.clone(),
                pw: shared_secret(&project, login, &config.admin_password),
                caps: "s".into(),
            })?;
            info!(user = %login, "admin account ready");
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            config,
            link: Arc::new(Crosslinker::new(repo)),
            session_lock: Arc::new(Mutex::new(())),
            shutdown_tx,
        })
    }

    /// Repository handle (for tooling and tests)
    pub fn repo(&self) -> &Repository {
        self.link.repo()
    }

    /// Run the server
    pub async fn run(&self) -> Result<(), ServerError> {
        let repo = self.link.repo();
        info!(
            "Starting relicd on {} (project: {}...)",
            self.config.listen,
            &repo.project_code()?[..8]
        );

        let listener = TcpListener::bind(&self.config.listen).await?;
        info!("Listening on {}", self.config.listen);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            debug!("Accepted connection from {}", addr);
                            let link = self.link.clone();
                            let lock = self.session_lock.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, link, lock).await {
                                    warn!("Connection error from {}: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutting down...");
                    break;
                }
            }
        }

        self.link.repo().flush()?;
        Ok(())
    }

    /// Shutdown the server
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get server statistics
    pub fn stats(&self) -> ServerStats {
        let repo = self.link.repo();
        ServerStats {
            artifact_count: repo.storage().blob_count(),
            phantom_count: repo.iter_phantoms().map(|p| p.len()).unwrap_or(0),
            private_count: repo.iter_private().map(|p| p.len()).unwrap_or(0),
        }
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    addr: SocketAddr,
    link: Arc<Crosslinker>,
    lock: Arc<Mutex<()>>,
) -> Result<(), transport::TransportError> {
    let ip = addr.ip().to_string();
    transport::serve(stream, move |request| {
        // the store is single-writer: sessions take turns
        let _guard = lock.lock();
        sync::handle_request(&link, &request, &ip)
    })
    .await
}

/// Server statistics
#[derive(Debug, Clone)]
pub struct ServerStats {
    pub artifact_count: usize,
    pub phantom_count: usize,
    pub private_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_config(dir: &std::path::Path) -> Config {
        Config {
            listen: "127.0.0.1:0".parse().unwrap(),
            data_dir: dir.to_path_buf(),
            admin_user: None,
            admin_password: String::new(),
            anonymous_caps: "s".into(),
            verbose: false,
            log_format: "pretty".into(),
        }
    }

    #[test]
    fn test_server_creation_seeds_users() {
        let dir = tempdir().unwrap();
        let server = Server::new(test_config(dir.path())).unwrap();

        assert_eq!(server.stats().artifact_count, 0);
        let anon = server.repo().storage().get_user("anonymous").unwrap();
        assert_eq!(anon.unwrap().caps, "s");
    }

    #[tokio::test]
    async fn test_sync_over_tcp() {
        use crate::sync::{sync_with, SyncOptions};
        use reliquary_net::transport::TcpPeer;

        let dir = tempdir().unwrap();
        let server = Arc::new(Server::new(test_config(dir.path())).unwrap());
        server
            .repo()
            .put(b"served over tcp", None, None, false)
            .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept_server = server.clone();
        tokio::spawn(async move {
            let (stream, peer_addr) = listener.accept().await.unwrap();
            let _ = handle_connection(
                stream,
                peer_addr,
                accept_server.link.clone(),
                accept_server.session_lock.clone(),
            )
            .await;
        });

        let client_dir = tempdir().unwrap();
        let client_repo = Repository::open(client_dir.path()).unwrap();
        client_repo
            .set_project_code(&server.repo().project_code().unwrap())
            .unwrap();
        let client = Crosslinker::new(client_repo);

        let mut peer = TcpPeer::connect(addr).await.unwrap();
        let outcome = sync_with(&client, &mut peer, &SyncOptions::pull_only())
            .await
            .unwrap();
        assert_eq!(outcome.received, 1);
    }
}
