mod bootstrap;
mod extensions;
mod hardware;
mod watcher;

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use agentx_core::Config;
use agentx_gpg::IdentityManager;
use agentx_ssh_agent::{AgentService, ExtensionRegistry, KeyAgent, KeyRing, Transport, serve_all};
use anyhow::{Context as _, Result};
use tracing_subscriber::EnvFilter;

use crate::extensions::GpgObserver;
use crate::watcher::LiveSettings;

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the shell snippet meant for `eval`, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    bootstrap::secure_bootstrap();

    let explicit = match parse_args(std::env::args().skip(1))? {
        Cli::Help => {
            eprintln!("{USAGE}");
            return Ok(());
        }
        Cli::Run { config } => config,
    };
    let (config, config_path) = load_config(explicit)?;

    let gpg = Arc::new(IdentityManager::new(config.identity_rules()));
    let mut registry = ExtensionRegistry::new();
    extensions::register_gpg(&mut registry, Arc::clone(&gpg));
    let hardware = if config.yubikey.enable {
        let signer = hardware::start(&config.yubikey)?;
        extensions::register_hardware(&mut registry, Arc::clone(&signer));
        Some(signer)
    } else {
        None
    };
    registry.set_verbose(config.yubikey.enablelog);
    let registry = Arc::new(registry);

    let keys: Arc<dyn KeyAgent> = Arc::new(RwLock::new(KeyRing::new()));
    let service = AgentService::new(keys, Arc::clone(&registry))
        .with_observer(Arc::new(GpgObserver::new(Arc::clone(&gpg))));

    if let Some(path) = config_path {
        let settings = LiveSettings::from(&config);
        let (gpg, registry) = (Arc::clone(&gpg), Arc::clone(&registry));
        tokio::spawn(async move {
            if let Err(e) = watcher::config_watcher(path, settings, gpg, registry).await {
                tracing::warn!("config watcher exited: {e}");
            }
        });
    }

    let mut signals = ShutdownSignals::install()?;
    let mut endpoint = Endpoint::open(config.socketdir.as_deref())?;
    let transports = endpoint.transports()?;
    for line in endpoint.shell_lines(std::process::id()) {
        println!("{line}");
    }

    tokio::select! {
        _ = serve_all(transports, service) => {
            tracing::warn!("all agent transports stopped");
        }
        signal = signals.recv() => {
            tracing::info!(?signal, "shutting down");
        }
    }

    endpoint.cleanup();
    drop(hardware);
    Ok(())
}

/// Where clients reach the agent.
#[cfg(unix)]
struct Endpoint {
    transport: Option<agentx_ssh_agent::UnixSocketTransport>,
    socket: PathBuf,
    dir: PathBuf,
    // Removed with its contents on drop.
    temp: Option<tempfile::TempDir>,
}

#[cfg(unix)]
impl Endpoint {
    fn open(socketdir: Option<&Path>) -> Result<Self> {
        let (dir, temp) = match socketdir {
            Some(dir) => (dir.to_path_buf(), None),
            None => {
                let temp = tempfile::Builder::new()
                    .prefix("ssh-agentx")
                    .tempdir()
                    .context("create socket directory")?;
                (temp.path().to_path_buf(), Some(temp))
            }
        };
        let socket = dir.join("agent.sock");
        let transport = agentx_ssh_agent::UnixSocketTransport::bind(&socket)
            .context("failed to listen on UNIX socket")?;
        Ok(Self {
            transport: Some(transport),
            socket,
            dir,
            temp,
        })
    }

    fn shell_lines(&self, pid: u32) -> Vec<String> {
        unix_shell_lines(&self.socket, pid)
    }

    fn transports(&mut self) -> Result<Vec<Box<dyn Transport>>> {
        let transport = self
            .transport
            .take()
            .context("agent socket already in use")?;
        Ok(vec![Box::new(transport)])
    }

    /// Remove the socket and, if it is empty, its directory.
    fn cleanup(self) {
        if let Err(e) = std::fs::remove_file(&self.socket) {
            tracing::debug!(path = %self.socket.display(), "could not remove socket: {e}");
        }
        if self.temp.is_none() {
            let _ = std::fs::remove_dir(&self.dir);
        }
    }
}

#[cfg(unix)]
fn unix_shell_lines(socket: &Path, pid: u32) -> Vec<String> {
    vec![
        format!("SSH_AUTH_SOCK={}; export SSH_AUTH_SOCK;", socket.display()),
        format!("SSH_AGENT_PID={pid}; export SSH_AGENT_PID;"),
        format!("echo Agent pid {pid};"),
    ]
}

#[cfg(windows)]
struct Endpoint;

#[cfg(windows)]
impl Endpoint {
    fn open(_socketdir: Option<&Path>) -> Result<Self> {
        Ok(Self)
    }

    fn shell_lines(&self, _pid: u32) -> Vec<String> {
        vec![format!("set SSH_AUTH_SOCK={}", agentx_ssh_agent::OPENSSH_PIPE)]
    }

    fn transports(&mut self) -> Result<Vec<Box<dyn Transport>>> {
        Ok(vec![Box::new(agentx_ssh_agent::NamedPipeTransport::new(
            agentx_ssh_agent::OPENSSH_PIPE,
        ))])
    }

    fn cleanup(self) {}
}

/// Why the agent was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shutdown {
    Interrupt,
    Terminate,
}

/// Stop signals, registered before the socket is announced so an early
/// signal still removes it.
#[cfg(unix)]
struct ShutdownSignals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl ShutdownSignals {
    fn install() -> Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};
        Ok(Self {
            interrupt: signal(SignalKind::interrupt()).context("install SIGINT handler")?,
            terminate: signal(SignalKind::terminate()).context("install SIGTERM handler")?,
        })
    }

    async fn recv(&mut self) -> Shutdown {
        tokio::select! {
            _ = self.interrupt.recv() => Shutdown::Interrupt,
            _ = self.terminate.recv() => Shutdown::Terminate,
        }
    }
}

#[cfg(windows)]
struct ShutdownSignals(tokio::signal::windows::CtrlC);

#[cfg(windows)]
impl ShutdownSignals {
    fn install() -> Result<Self> {
        Ok(Self(
            tokio::signal::windows::ctrl_c().context("install ctrl-c handler")?,
        ))
    }

    async fn recv(&mut self) -> Shutdown {
        self.0.recv().await;
        Shutdown::Interrupt
    }
}

const USAGE: &str = "\
Usage: eval $(ssh-agentx [--config <path>])

Options:
  -c, --config <path>  Config file (default: ./ssh-agentx.toml, then
                       $XDG_CONFIG_HOME/ssh-agentx/ssh-agentx.toml)
  -h, --help           Show this help message";

#[derive(Debug, PartialEq, Eq)]
enum Cli {
    Run { config: Option<PathBuf> },
    Help,
}

/// Command line, without the program name.  `config: None` means search
/// the default locations.
fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Cli> {
    let mut config = None;
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(Cli::Help),
            "-c" | "--config" => {
                let path = args.next().context("--config needs a path")?;
                config = Some(PathBuf::from(path));
            }
            other => match other.strip_prefix("--config=") {
                Some(path) => config = Some(PathBuf::from(path)),
                None => anyhow::bail!("unexpected argument {other:?}\n\n{USAGE}"),
            },
        }
    }
    Ok(Cli::Run { config })
}

/// Mode bits of a config file that group or others can access, if any.
#[cfg(unix)]
fn exposed_mode(path: &Path) -> std::io::Result<Option<u32>> {
    use std::os::unix::fs::PermissionsExt as _;
    let mode = std::fs::metadata(path)?.permissions().mode() & 0o777;
    Ok((mode & 0o077 != 0).then_some(mode))
}

/// Load the config, or run as a plain SSH agent when there is none.
/// Returns the path that was loaded so it can be watched.
fn load_config(explicit: Option<PathBuf>) -> Result<(Config, Option<PathBuf>)> {
    let Some(path) = explicit
        .or_else(agentx_core::config::find_config)
        .filter(|p| p.exists())
    else {
        println!("# config file not found, continuing as normal ssh-agent");
        return Ok((Config::default(), None));
    };

    #[cfg(unix)]
    {
        match exposed_mode(&path) {
            Ok(Some(mode)) => tracing::warn!(
                path = %path.display(),
                mode = %format!("{mode:o}"),
                "identity rules are visible to other users, chmod 600 the config file"
            ),
            Ok(None) => {}
            Err(e) => tracing::debug!(path = %path.display(), "could not stat config: {e}"),
        }
    }

    let config = Config::load(&path)?;
    tracing::info!(
        path = %path.display(),
        rules = config.gpg.len(),
        yubikey = config.yubikey.enable,
        "loaded config"
    );
    Ok((config, Some(path)))
}
