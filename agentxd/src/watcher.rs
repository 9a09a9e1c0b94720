use std::path::PathBuf;
use std::sync::Arc;

use agentx_core::{Config, IdentityRule};
use agentx_gpg::IdentityManager;
use agentx_ssh_agent::ExtensionRegistry;
use notify::Watcher as _;
use tracing::{debug, info, warn};

/// The parts of the config that can change while running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveSettings {
    pub rules: Vec<IdentityRule>,
    pub enablelog: bool,
}

impl From<&Config> for LiveSettings {
    fn from(config: &Config) -> Self {
        Self {
            rules: config.identity_rules(),
            enablelog: config.yubikey.enablelog,
        }
    }
}

/// Push live settings into the running components.
pub fn apply(
    settings: &LiveSettings,
    gpg: &IdentityManager,
    extensions: &ExtensionRegistry,
) -> anyhow::Result<()> {
    gpg.set_rules(settings.rules.clone())?;
    extensions.set_verbose(settings.enablelog);
    Ok(())
}

/// Watch the config file and reload identity rules and `enablelog`.
///
/// The parent directory is watched so editor rename-saves are seen; bursts of
/// events are coalesced by a capacity-1 channel plus a 500 ms quiet period.
/// Parse errors keep the running settings.  Socket and hardware settings
/// need a restart.
pub async fn config_watcher(
    config_path: PathBuf,
    initial: LiveSettings,
    gpg: Arc<IdentityManager>,
    extensions: Arc<ExtensionRegistry>,
) -> anyhow::Result<()> {
    use tokio::sync::mpsc;

    let (tx, mut rx) = mpsc::channel::<()>(1);
    let file_name = config_path.file_name().map(|n| n.to_os_string());

    let mut watcher = notify::RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| match res {
            Ok(event) => {
                use notify::EventKind::*;
                let ours = event
                    .paths
                    .iter()
                    .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                if ours && matches!(event.kind, Modify(_) | Create(_) | Remove(_)) {
                    let _ = tx.try_send(());
                }
            }
            Err(e) => warn!("config watcher notify error: {e}"),
        },
        notify::Config::default(),
    )?;

    let watch_dir = match config_path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    watcher.watch(&watch_dir, notify::RecursiveMode::NonRecursive)?;
    info!(path = %config_path.display(), "config watcher started");

    let mut known = initial;
    while rx.recv().await.is_some() {
        while let Ok(Some(())) =
            tokio::time::timeout(tokio::time::Duration::from_millis(500), rx.recv()).await
        {}

        if !config_path.exists() {
            debug!("config file removed, keeping current settings");
            continue;
        }

        let settings = match Config::load(&config_path) {
            Ok(config) => LiveSettings::from(&config),
            Err(e) => {
                warn!(path = %config_path.display(), error = %e, "config reload failed, keeping current settings");
                continue;
            }
        };
        if settings == known {
            debug!("config unchanged");
            continue;
        }

        apply(&settings, &gpg, &extensions)?;
        info!(
            rules = settings.rules.len(),
            enablelog = settings.enablelog,
            "config reloaded"
        );
        known = settings;
    }
    Ok(())
}
