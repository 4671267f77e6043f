use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Debug, Parser)]
#[command(name = "aimail", version, about = "AI email auto-reply engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output structured JSON
    #[arg(long, global = true)]
    json: bool,

    /// State directory (defaults to ~/.aimail)
    #[arg(long, global = true, env = "AIMAIL_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll the mailbox and reply until interrupted
    Run,
    /// Run a single fetch-and-reply cycle
    Cycle,
    /// List unread emails
    Unread {
        /// Fetch from the provider instead of reading the snapshot
        #[arg(long, default_value_t = false)]
        fetch: bool,
    },
    /// Show one email by ID
    Show { id: String },
    /// Generate staged drafts (all pending, or one email)
    Generate {
        #[arg(long)]
        id: Option<String>,
    },
    /// List staged drafts
    Drafts,
    /// Send staged drafts
    Send(SendArgs),
    /// Show the sent log
    Sent,
    /// Replies per day for the last week
    Stats,
    /// Store mailbox credentials
    Login {
        #[command(subcommand)]
        command: LoginCommands,
    },
    /// Forget mailbox credentials
    Logout,
    /// Show account, mode and state counts
    Status,
    /// Show or change settings
    Settings {
        #[command(subcommand)]
        command: SettingsCommands,
    },
    /// Add a local file to the knowledge store
    Ingest { path: PathBuf },
    /// Look up a workbook cell, e.g. `Prices!B2`
    Lookup { reference: String },
}

#[derive(Debug, Args)]
struct SendArgs {
    id: Option<String>,
    #[arg(long, default_value_t = false, conflicts_with = "id")]
    all: bool,
}

#[derive(Debug, Subcommand)]
enum LoginCommands {
    /// Gmail API with an OAuth refresh token
    Gmail {
        #[arg(long)]
        email: String,
        #[arg(long, env = "AIMAIL_GMAIL_CLIENT_ID")]
        client_id: Option<String>,
        #[arg(long, env = "AIMAIL_GMAIL_CLIENT_SECRET", hide_env_values = true)]
        client_secret: Option<String>,
        #[arg(long, env = "AIMAIL_GMAIL_REFRESH_TOKEN", hide_env_values = true)]
        refresh_token: Option<String>,
    },
    /// Any IMAP mailbox with SMTP delivery
    Imap {
        #[arg(long)]
        email: String,
        #[arg(long, env = "AIMAIL_IMAP_PASSWORD", hide_env_values = true)]
        password: String,
        #[arg(long)]
        imap_host: String,
        #[arg(long)]
        imap_port: Option<u16>,
        #[arg(long)]
        smtp_host: Option<String>,
        #[arg(long)]
        smtp_port: Option<u16>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

impl Toggle {
    fn enabled(self) -> bool {
        matches!(self, Self::On)
    }
}

#[derive(Debug, Subcommand)]
enum SettingsCommands {
    /// Print every setting
    Show,
    /// Set one setting by its settings.json key
    Set { key: String, value: String },
    /// Toggle unattended sending (turns half-auto off)
    AutoSend { state: Toggle },
    /// Toggle draft staging (turns auto-send off)
    HalfAuto { state: Toggle },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    commands::dispatch(cli).await
}

mod commands {
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use anyhow::{anyhow, bail, Context, Result};
    use tracing::info;

    use aimail::app::{run_scheduler, AppContext, InstanceLock};
    use aimail::cache::FetchOptions;
    use aimail::config::AppConfig;
    use aimail::output::{self, draft_items, DraftItem, OutputFormat, StatusSummary};
    use aimail::providers::MessageId;
    use aimail::store::knowledge::parse_cell_reference;
    use aimail::store::models::AccountCredentials;
    use aimail::store::token_cache::TokenCache;
    use aimail::store::StateStores;

    use super::{Cli, Commands, LoginCommands, SendArgs, SettingsCommands};

    pub async fn dispatch(cli: Cli) -> Result<()> {
        let config = AppConfig::from_env(cli.data_dir).context("resolve aimail configuration")?;
        let format = OutputFormat::from_json_flag(cli.json);

        match cli.command {
            Commands::Run => handle_run(config).await,
            Commands::Cycle => handle_cycle(config, format).await,
            Commands::Unread { fetch } => handle_unread(config, fetch, format).await,
            Commands::Show { id } => handle_show(config, &id, format).await,
            Commands::Generate { id } => handle_generate(config, id, format).await,
            Commands::Drafts => handle_drafts(config, format),
            Commands::Send(args) => handle_send(config, args, format).await,
            Commands::Sent => handle_sent(config, format),
            Commands::Stats => handle_stats(config, format),
            Commands::Login { command } => handle_login(config, command),
            Commands::Logout => handle_logout(config),
            Commands::Status => handle_status(config, format).await,
            Commands::Settings { command } => handle_settings(config, command, format),
            Commands::Ingest { path } => handle_ingest(config, &path).await,
            Commands::Lookup { reference } => handle_lookup(config, &reference, format),
        }
    }

    fn open_stores(config: &AppConfig) -> Result<StateStores> {
        StateStores::open(config.data_dir())
            .with_context(|| format!("open data directory {}", config.data_dir().display()))
    }

    async fn handle_run(config: AppConfig) -> Result<()> {
        let lock = InstanceLock::acquire(config.data_dir())?;
        let context = AppContext::open(config)?;
        let orchestrator = context.require_orchestrator()?.clone();
        let poll_interval = context.stores.settings.load().poll_interval();

        info!("aimail running; lock at {}", lock.path().display());
        eprintln!("Watching mailbox every {}s. Press Ctrl-C to stop.", poll_interval.as_secs());
        run_scheduler(orchestrator, poll_interval, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;
        Ok(())
    }

    async fn handle_cycle(config: AppConfig, format: OutputFormat) -> Result<()> {
        let _lock = InstanceLock::acquire(config.data_dir())?;
        let context = AppContext::open(config)?;
        let report = context.require_orchestrator()?.run_cycle().await;
        println!("{}", output::format_cycle(format, &report)?);
        Ok(())
    }

    async fn handle_unread(config: AppConfig, fetch: bool, format: OutputFormat) -> Result<()> {
        let context = AppContext::open(config)?;
        let messages = if fetch {
            let orchestrator = context.require_orchestrator()?;
            let options = FetchOptions {
                force: true,
                ..FetchOptions::default()
            };
            let messages = orchestrator
                .mailbox()
                .unread(options)
                .await
                .context("fetch unread emails")?;
            context
                .stores
                .snapshot
                .replace(&messages)
                .context("write unread snapshot")?;
            messages
        } else {
            context.stores.snapshot.read()
        };
        println!("{}", output::format_messages(format, &messages)?);
        Ok(())
    }

    async fn handle_show(config: AppConfig, id: &str, format: OutputFormat) -> Result<()> {
        let context = AppContext::open(config)?;
        let id = MessageId::from(id);
        let message = match context.orchestrator() {
            Some(orchestrator) => orchestrator
                .load_message(&id)
                .await
                .with_context(|| format!("load email {id}"))?,
            None => context
                .stores
                .snapshot
                .find(&id)
                .ok_or_else(|| anyhow!("email not found: {id}"))?,
        };
        println!("{}", output::format_message(format, &message)?);
        Ok(())
    }

    async fn handle_generate(config: AppConfig, id: Option<String>, format: OutputFormat) -> Result<()> {
        let context = AppContext::open(config)?;
        let orchestrator = context.require_orchestrator()?;

        if let Some(id) = id {
            let id = MessageId::from(id);
            let reply = orchestrator
                .regenerate(&id)
                .await
                .with_context(|| format!("generate draft for {id}"))?;
            let draft = DraftItem {
                id: id.to_string(),
                subject: reply.subject,
                body: reply.body,
            };
            println!("{}", output::format_draft(format, &draft)?);
            return Ok(());
        }

        let cancel = Arc::new(AtomicBool::new(false));
        let watcher = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.store(true, Ordering::SeqCst);
                }
            })
        };
        let report = orchestrator.generate_batch(&cancel).await;
        watcher.abort();

        println!("{}", output::format_batch(format, &report.context("generate drafts")?)?);
        Ok(())
    }

    fn handle_drafts(config: AppConfig, format: OutputFormat) -> Result<()> {
        let stores = open_stores(&config)?;
        let drafts = draft_items(&stores.drafts.all());
        println!("{}", output::format_drafts(format, &drafts)?);
        Ok(())
    }

    async fn handle_send(config: AppConfig, args: SendArgs, format: OutputFormat) -> Result<()> {
        let context = AppContext::open(config)?;
        let orchestrator = context.require_orchestrator()?;

        if args.all {
            let outcomes = orchestrator.send_all_staged().await;
            println!("{}", output::format_outcomes(format, &outcomes)?);
            return Ok(());
        }

        let Some(id) = args.id else {
            bail!("pass an email id or --all");
        };
        let id = MessageId::from(id);
        orchestrator
            .send_staged(&id)
            .await
            .with_context(|| format!("send draft for {id}"))?;
        println!("Sent reply to {id}.");
        Ok(())
    }

    fn handle_sent(config: AppConfig, format: OutputFormat) -> Result<()> {
        let stores = open_stores(&config)?;
        println!("{}", output::format_sent_log(format, &stores.sent_log.entries())?);
        Ok(())
    }

    fn handle_stats(config: AppConfig, format: OutputFormat) -> Result<()> {
        let stores = open_stores(&config)?;
        let counts = stores.sent_log.daily_counts(StateStores::today());
        println!("{}", output::format_reply_stats(format, &counts)?);
        Ok(())
    }

    fn handle_login(config: AppConfig, command: LoginCommands) -> Result<()> {
        let stores = open_stores(&config)?;
        let state = match command {
            LoginCommands::Gmail {
                email,
                client_id,
                client_secret,
                refresh_token,
            } => stores.auth.set_gmail(AccountCredentials {
                email,
                client_id,
                client_secret,
                refresh_token,
                ..AccountCredentials::default()
            }),
            LoginCommands::Imap {
                email,
                password,
                imap_host,
                imap_port,
                smtp_host,
                smtp_port,
            } => stores.auth.set_imap(AccountCredentials {
                email,
                password: Some(password),
                imap_host: Some(imap_host),
                imap_port,
                smtp_host,
                smtp_port,
                ..AccountCredentials::default()
            }),
        }
        .context("save login")?;

        // A cached token belongs to the previous account.
        TokenCache::from_env(stores.token_path())?
            .clear()
            .context("clear cached gmail token")?;

        println!(
            "Logged in as {} ({}).",
            state.account_email().unwrap_or("(unknown)"),
            state.provider.map(|kind| kind.as_str()).unwrap_or("-")
        );
        Ok(())
    }

    fn handle_logout(config: AppConfig) -> Result<()> {
        let stores = open_stores(&config)?;
        stores.auth.logout().context("clear login")?;
        TokenCache::from_env(stores.token_path())?
            .clear()
            .context("clear cached gmail token")?;
        println!("Logged out.");
        Ok(())
    }

    async fn handle_status(config: AppConfig, format: OutputFormat) -> Result<()> {
        let context = AppContext::open(config)?;
        let stores = &context.stores;
        let auth = stores.auth.load();
        let settings = stores.settings.load();

        let mode = if settings.auto_send {
            "auto-send"
        } else if settings.half_auto {
            "half-auto"
        } else {
            "manual"
        };
        let demo_over = match context.orchestrator() {
            Some(orchestrator) => orchestrator.is_demo_over().await,
            None => false,
        };

        let status = StatusSummary {
            data_dir: context.config.data_dir().display().to_string(),
            authenticated: auth.is_authenticated,
            provider: auth.provider.map(|kind| kind.to_string()),
            account: auth.account_email().map(str::to_string),
            mode: mode.to_string(),
            send_window: format!("{}-{}", settings.auto_send_start_time, settings.auto_send_end_time),
            replied: stores.replied.len(),
            drafts: stores.drafts.all().len(),
            sent: stores.sent_log.len(),
            snapshot: stores.snapshot.read().len(),
            knowledge_chunks: stores.knowledge.chunks().len(),
            demo_over,
        };
        println!("{}", output::format_status(format, &status)?);
        Ok(())
    }

    fn handle_settings(config: AppConfig, command: SettingsCommands, format: OutputFormat) -> Result<()> {
        let stores = open_stores(&config)?;
        let settings = match command {
            SettingsCommands::Show => stores.settings.load(),
            SettingsCommands::Set { key, value } => stores
                .settings
                .update(|settings| settings.set_value(&key, &value))
                .with_context(|| format!("set {key}"))?,
            SettingsCommands::AutoSend { state } => stores
                .settings
                .update(|settings| {
                    settings.set_auto_send(state.enabled());
                    Ok(())
                })
                .context("update auto-send")?,
            SettingsCommands::HalfAuto { state } => stores
                .settings
                .update(|settings| {
                    settings.set_half_auto(state.enabled());
                    Ok(())
                })
                .context("update half-auto")?,
        };
        println!("{}", output::format_settings(format, &settings)?);
        Ok(())
    }

    async fn handle_ingest(config: AppConfig, path: &Path) -> Result<()> {
        let context = AppContext::open(config)?;
        let report = context
            .ingestor()
            .ingest_file(path)
            .await
            .with_context(|| format!("ingest {}", path.display()))?;
        println!(
            "Ingested {}: {} chunk(s), {} cell(s).",
            path.display(),
            report.chunks_written,
            report.cells_written
        );
        Ok(())
    }

    fn handle_lookup(config: AppConfig, reference: &str, format: OutputFormat) -> Result<()> {
        let query = parse_cell_reference(reference)
            .ok_or_else(|| anyhow!("not a cell reference: {reference} (expected Sheet!A1)"))?;
        let stores = open_stores(&config)?;
        let found = stores
            .knowledge
            .lookup_reference(&query)
            .ok_or_else(|| anyhow!("no stored cell at {}", query.address()))?;

        match format {
            OutputFormat::Json => println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "address": found.address,
                    "text": found.text,
                }))?
            ),
            OutputFormat::Table => println!("{} => {}", found.address, found.text),
        }
        Ok(())
    }
}
