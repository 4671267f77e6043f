use std::fs::OpenOptions;
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cache::{CachedMailbox, FetchOptions};
use crate::config::AppConfig;
use crate::ingest::AttachmentIngestor;
use crate::orchestrator::{CycleReport, ReplyOrchestrator};
use crate::providers::{select_provider, ProviderEvent};
use crate::services::completion::{CompletionProvider, FallbackCompletion};
use crate::services::connectivity::{ConnectivityMonitor, DnsConnectivity};
use crate::services::credentials::{CredentialProvider, StoredCredentials};
use crate::services::license::{HttpLicenseService, LicenseService, NoopLicenseService};
use crate::services::openai::OPENAI_KEY_SECRET;
use crate::services::{OllamaBackend, OpenAiBackend};
use crate::store::token_cache::TokenCache;
use crate::store::StateStores;

pub const LOCK_FILE: &str = "aimail.lock";

/// Owns the stores, collaborators and, once logged in, the orchestrator.
pub struct AppContext {
    pub config: AppConfig,
    pub stores: Arc<StateStores>,
    pub completion: Arc<dyn CompletionProvider>,
    orchestrator: Option<Arc<ReplyOrchestrator>>,
}

impl AppContext {
    pub fn open(config: AppConfig) -> Result<Self> {
        let stores = Arc::new(
            StateStores::open(config.data_dir())
                .with_context(|| format!("open data directory {}", config.data_dir().display()))?,
        );
        let auth = stores.auth.load();

        let token_cache = TokenCache::from_env(stores.token_path()).context("load gmail token cache key")?;
        let credentials: Arc<dyn CredentialProvider> =
            Arc::new(StoredCredentials::new(auth.clone(), Some(token_cache)));

        let local = Arc::new(OllamaBackend::new(
            &config.ollama_url,
            &config.ollama_model,
            &config.ollama_embed_model,
            &config.ollama_vision_model,
        ));
        let remote = Arc::new(OpenAiBackend::new(
            &config.openai_url,
            credentials.secret(OPENAI_KEY_SECRET),
            &config.openai_model,
            &config.openai_embed_model,
        ));
        let completion: Arc<dyn CompletionProvider> = Arc::new(FallbackCompletion::new(
            local,
            remote,
            config.local_timeout,
            config.remote_timeout,
        ));

        let license: Arc<dyn LicenseService> = match config.license_url.as_deref() {
            Some(url) => Arc::new(HttpLicenseService::new(url)),
            None => Arc::new(NoopLicenseService),
        };
        let connectivity: Arc<dyn ConnectivityMonitor> = Arc::new(DnsConnectivity::default());

        let orchestrator = select_provider(&auth, credentials).map(|provider| {
            debug!("using {} provider", provider.name());
            let mailbox = Arc::new(CachedMailbox::new(provider, config.cache));
            Arc::new(ReplyOrchestrator::new(
                config.clone(),
                stores.clone(),
                mailbox,
                completion.clone(),
                license,
                connectivity,
            ))
        });

        Ok(Self {
            config,
            stores,
            completion,
            orchestrator,
        })
    }

    pub fn orchestrator(&self) -> Option<&Arc<ReplyOrchestrator>> {
        self.orchestrator.as_ref()
    }

    pub fn require_orchestrator(&self) -> Result<&Arc<ReplyOrchestrator>> {
        self.orchestrator
            .as_ref()
            .ok_or_else(|| anyhow!("not logged in; run 'aimail login gmail' or 'aimail login imap' first"))
    }

    pub fn ingestor(&self) -> AttachmentIngestor {
        AttachmentIngestor::new(self.completion.clone(), self.stores.clone())
    }
}

/// Single-instance guard backed by a `create_new` lock file holding our PID.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
}

impl InstanceLock {
    pub fn acquire(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("create data directory {}", data_dir.display()))?;
        let path = data_dir.join(LOCK_FILE);

        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    writeln!(file, "{}", std::process::id())
                        .with_context(|| format!("write lock file {}", path.display()))?;
                    return Ok(Self { path });
                }
                Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => {
                    if !lock_is_stale(&path) {
                        bail!("another aimail instance is running (lock {})", path.display());
                    }
                    warn!("removing stale lock {}", path.display());
                    std::fs::remove_file(&path)
                        .with_context(|| format!("remove stale lock {}", path.display()))?;
                }
                Err(error) => {
                    return Err(error).with_context(|| format!("create lock file {}", path.display()));
                }
            }
        }
        bail!("could not acquire lock {}", path.display())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(error) = std::fs::remove_file(&self.path) {
            warn!("failed to remove lock {}: {}", self.path.display(), error);
        }
    }
}

fn lock_is_stale(path: &Path) -> bool {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return false;
    };
    match raw.trim().parse::<u32>() {
        Ok(pid) => !process_alive(pid),
        Err(_) => true,
    }
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

/// Runs cycles on every tick and on provider push events until `shutdown`
/// resolves. Overlapping triggers are dropped by the orchestrator.
pub async fn run_scheduler<F>(orchestrator: Arc<ReplyOrchestrator>, poll_interval: Duration, shutdown: F)
where
    F: Future<Output = ()>,
{
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let watcher = orchestrator.mailbox().provider().watch(events_tx);
    if watcher.is_some() {
        info!("push notifications enabled");
    }

    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tokio::pin!(shutdown);

    info!("checking mail every {:?}", poll_interval);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutting down");
                break;
            }
            _ = ticker.tick() => {
                log_cycle(&orchestrator.run_cycle().await);
            }
            Some(event) = events.recv() => match event {
                ProviderEvent::NewMail => {
                    debug!("new mail pushed, checking now");
                    let options = FetchOptions {
                        force: true,
                        ..FetchOptions::default()
                    };
                    log_cycle(&orchestrator.run_cycle_with(options).await);
                }
                ProviderEvent::Disconnected => warn!("push watcher disconnected"),
                ProviderEvent::Reconnected => info!("push watcher reconnected"),
            },
        }
    }

    // The watcher exits once its receiver is gone.
    drop(events);
    if let Some(handle) = watcher {
        handle.abort();
    }
}

fn log_cycle(report: &CycleReport) {
    match &report.skipped {
        Some(reason) => debug!("cycle skipped: {:?}", reason),
        None => info!(
            "cycle: {} fetched, {} candidate(s), {} replied",
            report.fetched,
            report.candidates,
            report.replied()
        ),
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::{InstanceLock, LOCK_FILE};

    fn scratch() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("aimail-app-{}", Uuid::new_v4()))
    }

    #[test]
    fn lock_is_exclusive_and_released_on_drop() {
        let dir = scratch();
        let lock = InstanceLock::acquire(&dir).expect("first lock");
        assert!(lock.path().exists());
        assert!(InstanceLock::acquire(&dir).is_err());

        drop(lock);
        assert!(!dir.join(LOCK_FILE).exists());
        let _again = InstanceLock::acquire(&dir).expect("relock after drop");
    }

    #[test]
    fn garbage_lock_is_treated_as_stale() {
        let dir = scratch();
        std::fs::create_dir_all(&dir).expect("create dir");
        std::fs::write(dir.join(LOCK_FILE), "not a pid").expect("write lock");

        let lock = InstanceLock::acquire(&dir).expect("replace stale lock");
        let pid = std::fs::read_to_string(lock.path()).expect("read lock");
        assert_eq!(pid.trim(), std::process::id().to_string());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn dead_pid_lock_is_replaced() {
        let dir = scratch();
        std::fs::create_dir_all(&dir).expect("create dir");
        std::fs::write(dir.join(LOCK_FILE), format!("{}\n", u32::MAX)).expect("write lock");
        assert!(InstanceLock::acquire(&dir).is_ok());
    }
}
