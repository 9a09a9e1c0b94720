//! Listeners that hand each accepted connection to [`serve_connection`].

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::service::AgentService;
use crate::session::serve_connection;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("bind {path:?}: {source}")]
    Bind { path: PathBuf, source: io::Error },

    #[error("chmod 0600 {path:?}: {source}")]
    Permissions { path: PathBuf, source: io::Error },

    #[error("transport I/O: {0}")]
    Io(#[from] io::Error),
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn id(&self) -> &str;

    /// Accept connections until a fatal error.  Each connection runs on its
    /// own task; a failing connection never stops the listener.
    async fn serve(&self, service: AgentService) -> Result<(), TransportError>;
}

/// Unix domain socket, readable by the owner only.
#[cfg(unix)]
#[derive(Debug)]
pub struct UnixSocketTransport {
    path: PathBuf,
    listener: tokio::net::UnixListener,
}

#[cfg(unix)]
impl UnixSocketTransport {
    /// Bind now so the socket exists before its path is announced.
    pub fn bind(path: impl Into<PathBuf>) -> Result<Self, TransportError> {
        use std::os::unix::fs::PermissionsExt as _;

        let path = path.into();
        let listener = tokio::net::UnixListener::bind(&path).map_err(|source| {
            TransportError::Bind {
                path: path.clone(),
                source,
            }
        })?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).map_err(
            |source| TransportError::Permissions {
                path: path.clone(),
                source,
            },
        )?;
        info!(path = %path.display(), "agent socket bound");
        Ok(Self { path, listener })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
#[async_trait]
impl Transport for UnixSocketTransport {
    fn id(&self) -> &str {
        "unix"
    }

    async fn serve(&self, service: AgentService) -> Result<(), TransportError> {
        loop {
            match self.listener.accept().await {
                Ok((stream, _)) => {
                    let service = service.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, service).await {
                            debug!(error = %e, "agent connection closed with error");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed, retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}

/// Well-known pipe used by the Windows OpenSSH client.
#[cfg(windows)]
pub const OPENSSH_PIPE: &str = r"\\.\pipe\openssh-ssh-agent";

#[cfg(windows)]
#[derive(Debug)]
pub struct NamedPipeTransport {
    name: String,
}

#[cfg(windows)]
impl NamedPipeTransport {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(windows)]
#[async_trait]
impl Transport for NamedPipeTransport {
    fn id(&self) -> &str {
        "named-pipe"
    }

    async fn serve(&self, service: AgentService) -> Result<(), TransportError> {
        use tokio::net::windows::named_pipe::ServerOptions;

        let mut server = ServerOptions::new()
            .first_pipe_instance(true)
            .create(&self.name)?;
        info!(pipe = %self.name, "agent pipe created");
        loop {
            server.connect().await?;
            let connected = server;
            server = ServerOptions::new().create(&self.name)?;
            let service = service.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_connection(connected, service).await {
                    debug!(error = %e, "agent connection closed with error");
                }
            });
        }
    }
}

/// Run every transport concurrently.  A transport that fails is reported on
/// its own; the others keep serving.  Returns once all have stopped.
pub async fn serve_all(transports: Vec<Box<dyn Transport>>, service: AgentService) {
    let mut tasks = JoinSet::new();
    for transport in transports {
        let service = service.clone();
        tasks.spawn(async move {
            let id = transport.id().to_string();
            let result = transport.serve(service).await;
            (id, result)
        });
    }
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((id, Ok(()))) => info!(transport = %id, "transport stopped"),
            Ok((id, Err(e))) => error!(transport = %id, error = %e, "transport failed"),
            Err(e) => error!(error = %e, "transport task panicked"),
        }
    }
}
