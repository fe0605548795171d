use anyhow::{Context, Result};
use chrono::{Local, TimeZone};
use clap::{Parser, Subcommand};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use feedline::config::Config;
use feedline::feed::policy::resolve_item_action;
use feedline::feed::{parse_feed, parse_url, Fetcher};
use feedline::schedule::{
    export_channels, import_channels, validate_schedule, AlarmFired, ExclusiveAccess,
    ScheduledUpdateController, SystemClock, TokioAlarm,
};
use feedline::storage::{Database, DatabaseError};
use feedline::task::{
    ChannelListener, DownloadItemJob, Job, LockManager, NoticeKind, OwnerKey, TaskKey,
    TaskRegistry, UpdateChannelJob, UpdateChannelJobFactory,
};

/// How often the daemon checks for clock jumps and schedule edits made by
/// other processes.
const DAEMON_TICK: Duration = Duration::from_secs(60);

/// Wall-clock drift beyond this between two ticks counts as a clock change.
const CLOCK_JUMP_THRESHOLD: Duration = Duration::from_secs(5);

/// Get the config directory path (~/.config/feedline/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("feedline"))
}

#[derive(Parser, Debug)]
#[command(
    name = "feedline",
    version,
    about = "RSS/Atom reader core with scheduled background updates"
)]
struct Args {
    /// Config file (default: ~/.config/feedline/config.toml)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Parse a feed file or http(s) URL and print it as JSON
    Parse { source: String },
    /// Subscribe to a channel
    Add {
        url: String,
        /// Daily update times in seconds since midnight, e.g. 3600/43200
        #[arg(long)]
        schedule: Option<String>,
    },
    /// Unsubscribe from a channel and drop its items
    Remove { channel_id: i64 },
    /// Set a channel's daily update times; omit to clear
    Schedule { channel_id: i64, schedule: Option<String> },
    /// List subscribed channels
    List,
    /// List a channel's items and what opening them does
    Items { channel_id: i64 },
    /// Update channels now (all when no id is given)
    Update { channel_ids: Vec<i64> },
    /// Download an item's enclosure
    Download { item_id: i64 },
    /// Run scheduled updates until interrupted
    Daemon,
    /// Export subscriptions to OPML
    Export { file: PathBuf },
    /// Import subscriptions from OPML
    Import { file: PathBuf },
    /// Manage channel categories
    Category {
        #[command(subcommand)]
        action: CategoryAction,
    },
}

#[derive(Subcommand, Debug)]
enum CategoryAction {
    /// Create a category, or return the id of an existing one
    Add { name: String },
    /// List categories
    List,
    /// Move a channel into a category; omit the category to clear it
    Set {
        channel_id: i64,
        category_id: Option<i64>,
    },
}

/// Services shared by every command.
struct Services {
    config: Config,
    db: Database,
    fetcher: Fetcher,
    registry: TaskRegistry,
    download_dir: PathBuf,
}

impl Services {
    fn update_factory(&self) -> UpdateChannelJobFactory {
        UpdateChannelJobFactory::new(
            self.db.clone(),
            self.fetcher.clone(),
            self.config.old_items_keep_percent,
        )
    }

    fn controller(&self, alarm: TokioAlarm) -> ScheduledUpdateController {
        ScheduledUpdateController::new(
            Arc::new(self.db.clone()),
            self.registry.clone(),
            Arc::new(self.update_factory()),
            Arc::new(alarm),
            Arc::new(SystemClock),
            self.config.schedule_settings(),
        )
    }
}

fn prepare_config_dir(config_dir: &Path) -> Result<()> {
    if !config_dir.exists() {
        std::fs::create_dir_all(config_dir).context("Failed to create config directory")?;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) =
            std::fs::set_permissions(config_dir, std::fs::Permissions::from_mode(0o700))
        {
            tracing::warn!(
                path = %config_dir.display(),
                error = %e,
                "Failed to set config directory permissions to 0700"
            );
        }
    }
    Ok(())
}

async fn open_services(config: Config, config_dir: &Path) -> Result<Services> {
    prepare_config_dir(config_dir)?;
    let db_path = config.database_path_in(config_dir);
    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = match Database::open(db_path_str).await {
        Ok(db) => db,
        Err(DatabaseError::InstanceLocked) => {
            eprintln!("Error: {}", DatabaseError::InstanceLocked);
            std::process::exit(1);
        }
        Err(e) => return Err(anyhow::anyhow!("Failed to open database: {}", e)),
    };
    let fetcher = Fetcher::new(
        config.http_timeout(),
        &config.user_agent,
        config.max_feed_bytes,
        config.host_policy(),
    )
    .context("Failed to build HTTP client")?;
    let registry = TaskRegistry::spawn(Arc::new(LockManager::logging()));
    let download_dir = config.download_dir_in(config_dir);
    Ok(Services {
        config,
        db,
        fetcher,
        registry,
        download_dir,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_dir = get_config_dir()?;
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::Parse { source } => parse_command(&config, &source).await,
        command => {
            let services = open_services(config, &config_dir).await?;
            run_command(&services, command).await
        }
    }
}

async fn run_command(services: &Services, command: Command) -> Result<()> {
    match command {
        Command::Parse { source } => parse_command(&services.config, &source).await,
        Command::Add { url, schedule } => add_command(services, &url, schedule.as_deref()).await,
        Command::Remove { channel_id } => remove_command(services, channel_id).await,
        Command::Schedule {
            channel_id,
            schedule,
        } => schedule_command(services, channel_id, schedule.as_deref()).await,
        Command::List => list_command(services).await,
        Command::Items { channel_id } => items_command(services, channel_id).await,
        Command::Update { channel_ids } => update_command(services, channel_ids).await,
        Command::Download { item_id } => download_command(services, item_id).await,
        Command::Daemon => daemon_command(services).await,
        Command::Export { file } => export_command(services, &file).await,
        Command::Import { file } => import_command(services, &file).await,
        Command::Category { action } => category_command(services, action).await,
    }
}

async fn parse_command(config: &Config, source: &str) -> Result<()> {
    let result = if source.starts_with("http://") || source.starts_with("https://") {
        let fetcher = Fetcher::new(
            config.http_timeout(),
            &config.user_agent,
            config.max_feed_bytes,
            config.host_policy(),
        )
        .context("Failed to build HTTP client")?;
        parse_url(&fetcher, source, &CancellationToken::new())
            .await
            .with_context(|| format!("Failed to parse feed at {}", source))?
    } else {
        let bytes = tokio::fs::read(source)
            .await
            .with_context(|| format!("Failed to read {}", source))?;
        parse_feed(&bytes, None).with_context(|| format!("Failed to parse feed in {}", source))?
    };
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn checked_schedule(schedule: Option<&str>) -> Result<Option<&str>> {
    match schedule {
        Some(s) => {
            validate_schedule(s).map_err(|e| anyhow::anyhow!("Invalid schedule: {}", e))?;
            Ok(Some(s))
        }
        None => Ok(None),
    }
}

async fn add_command(services: &Services, url: &str, schedule: Option<&str>) -> Result<()> {
    services
        .config
        .host_policy()
        .parse(url)
        .with_context(|| format!("Refusing to subscribe to {}", url))?;
    let schedule = checked_schedule(schedule)?;
    let id = services
        .db
        .add_channel(url, "", schedule)
        .await
        .context("Failed to add channel")?;
    println!("Channel {} subscribed: {}", id, url);
    Ok(())
}

async fn remove_command(services: &Services, channel_id: i64) -> Result<()> {
    let key = TaskKey::update(channel_id);
    if services.registry.state(key).await?.is_active() {
        anyhow::bail!("Channel {} is being updated, try again later", channel_id);
    }
    if !services.db.delete_channel(channel_id).await? {
        anyhow::bail!("Channel {} not found", channel_id);
    }
    println!("Channel {} removed", channel_id);
    Ok(())
}

async fn schedule_command(
    services: &Services,
    channel_id: i64,
    schedule: Option<&str>,
) -> Result<()> {
    let schedule = checked_schedule(schedule)?;
    services
        .db
        .set_update_time(channel_id, schedule)
        .await
        .context("Failed to set schedule")?;
    match schedule {
        Some(s) => println!("Channel {} updates daily at {}", channel_id, s),
        None => println!("Channel {} schedule cleared", channel_id),
    }
    Ok(())
}

async fn list_command(services: &Services) -> Result<()> {
    let channels = services
        .db
        .list_channels()
        .await
        .context("Failed to list channels")?;
    for channel in channels {
        let updated = channel
            .last_update
            .and_then(|ts| Local.timestamp_opt(ts, 0).single())
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{:>4}  {:<40}  {}  [{}] updated {}",
            channel.id,
            channel.title,
            channel.url,
            channel.update_time.as_deref().unwrap_or("-"),
            updated
        );
    }
    Ok(())
}

async fn category_command(services: &Services, action: CategoryAction) -> Result<()> {
    match action {
        CategoryAction::Add { name } => {
            let id = services
                .db
                .create_category(&name)
                .await
                .context("Failed to create category")?;
            println!("Category {}: {}", id, name.trim());
        }
        CategoryAction::List => {
            for category in services.db.list_categories().await? {
                println!("{:>4}  {}", category.id, category.name);
            }
        }
        CategoryAction::Set {
            channel_id,
            category_id,
        } => {
            services
                .db
                .set_channel_category(channel_id, category_id)
                .await
                .with_context(|| format!("Failed to set category of channel {}", channel_id))?;
            match category_id {
                Some(id) => println!("Channel {} moved to category {}", channel_id, id),
                None => println!("Channel {} removed from its category", channel_id),
            }
        }
    }
    Ok(())
}

async fn items_command(services: &Services, channel_id: i64) -> Result<()> {
    let channel = services
        .db
        .get_channel(channel_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Channel {} not found", channel_id))?;
    let items = services.db.get_items(channel_id).await?;
    for item in items {
        let action = channel
            .action
            .and_then(|flags| resolve_item_action(flags, &item.link, &item.enclosure));
        let action = match action {
            Some(action) => serde_json::to_string(&action)?,
            None => "-".to_string(),
        };
        let downloaded = if item.downloaded_path.is_some() { "*" } else { " " };
        println!("{:>6} {} {}  {}", item.id, downloaded, item.title, action);
    }
    Ok(())
}

/// Registers and starts `jobs`, then reports their progress until all of
/// them end. Ctrl-C cancels everything. Returns the number of failures.
async fn run_jobs(registry: &TaskRegistry, jobs: Vec<(TaskKey, Arc<dyn Job>)>) -> Result<usize> {
    let (listener, mut notices) = ChannelListener::new();
    let owner = OwnerKey::new("cli");
    let mut pending = HashSet::new();

    for (key, job) in jobs {
        if pending.contains(&key) {
            continue;
        }
        match registry
            .launch(key, job, owner.clone(), listener.clone(), false)
            .await?
        {
            Some(subscription) => {
                subscription.detach();
                pending.insert(key);
            }
            None => eprintln!("{}: already running, skipped", key),
        }
    }

    let mut failures = 0;
    let mut cancelling = false;
    while !pending.is_empty() {
        tokio::select! {
            notice = notices.recv() => {
                let Some(notice) = notice else { break };
                let key = notice.key;
                match notice.kind {
                    NoticeKind::PreRun => tracing::debug!(task = %key, "Started"),
                    NoticeKind::Progress(p) => match p.total {
                        Some(total) if total > 0 => {
                            eprint!("\r{}: {}%", key, p.current * 100 / total)
                        }
                        _ => eprint!("\r{}: {} bytes", key, p.current),
                    },
                    NoticeKind::PostRun(Ok(())) => {
                        println!("{}: done", key);
                        pending.remove(&key);
                    }
                    NoticeKind::PostRun(Err(code)) => {
                        let code = registry.consume_result(key).await?.unwrap_or(code);
                        eprintln!("{}: failed: {}", key, code);
                        failures += 1;
                        pending.remove(&key);
                    }
                    NoticeKind::Cancelled => {
                        println!("{}: cancelled", key);
                        pending.remove(&key);
                    }
                }
            }
            _ = tokio::signal::ctrl_c(), if !cancelling => {
                eprintln!("Cancelling...");
                cancelling = true;
                registry.cancel_all().await?;
            }
        }
    }
    Ok(failures)
}

async fn update_command(services: &Services, channel_ids: Vec<i64>) -> Result<()> {
    let channel_ids = if channel_ids.is_empty() {
        services
            .db
            .list_channels()
            .await?
            .into_iter()
            .map(|c| c.id)
            .collect()
    } else {
        channel_ids
    };
    let jobs = channel_ids
        .into_iter()
        .map(|id| {
            let job: Arc<dyn Job> = Arc::new(UpdateChannelJob::new(
                id,
                services.db.clone(),
                services.fetcher.clone(),
                services.config.old_items_keep_percent,
            ));
            (TaskKey::update(id), job)
        })
        .collect();
    let failures = run_jobs(&services.registry, jobs).await?;
    if failures > 0 {
        anyhow::bail!("{} channel update(s) failed", failures);
    }
    Ok(())
}

async fn download_command(services: &Services, item_id: i64) -> Result<()> {
    let job: Arc<dyn Job> = Arc::new(DownloadItemJob::new(
        item_id,
        services.db.clone(),
        services.fetcher.clone(),
        services.download_dir.clone(),
    ));
    let failures = run_jobs(&services.registry, vec![(TaskKey::download(item_id), job)]).await?;
    if failures > 0 {
        anyhow::bail!("Download of item {} failed", item_id);
    }
    Ok(())
}

async fn export_command(services: &Services, file: &Path) -> Result<()> {
    let (alarm, _fired) = TokioAlarm::new();
    let controller = services.controller(alarm);
    let access = ExclusiveAccess::acquire(&controller).await?;
    let count = export_channels(&services.db, &access, file)
        .await
        .with_context(|| format!("Failed to export to {}", file.display()))?;
    println!("Exported {} channels to {}", count, file.display());
    Ok(())
}

async fn import_command(services: &Services, file: &Path) -> Result<()> {
    let (alarm, _fired) = TokioAlarm::new();
    let controller = services.controller(alarm);
    let access = ExclusiveAccess::acquire(&controller).await?;
    let count = import_channels(&services.db, &access, file, services.config.host_policy())
        .await
        .with_context(|| format!("Failed to import {}", file.display()))?;
    println!("Imported {} new channels from {}", count, file.display());
    Ok(())
}

async fn daemon_command(services: &Services) -> Result<()> {
    let (alarm, mut fired) = TokioAlarm::new();
    let controller = services.controller(alarm);
    let mut changes = services.db.subscribe();
    let mut queue = services.registry.subscribe_queue();

    let mut known_schedules = services.db.channel_schedules().await?;
    controller.reschedule().await;
    tracing::info!(channels = known_schedules.len(), "Scheduled update daemon running");

    let mut tick = tokio::time::interval(DAEMON_TICK);
    tick.tick().await;
    let mut last_wall = Local::now();
    let mut last_mono = Instant::now();

    loop {
        tokio::select! {
            Some(AlarmFired { scheduled_ms }) = fired.recv() => {
                controller.handle_alarm(scheduled_ms).await;
            }
            change = changes.recv() => match change {
                Ok(_) | Err(RecvError::Lagged(_)) => {
                    let schedules = services.db.channel_schedules().await?;
                    if schedules != known_schedules {
                        known_schedules = schedules;
                        controller.reschedule().await;
                    }
                }
                Err(RecvError::Closed) => break,
            },
            event = queue.recv() => {
                if let Ok(event) = event {
                    tracing::debug!(action = ?event.action, change = ?event.change, outstanding = event.outstanding, "Task queue changed");
                }
            }
            _ = tick.tick() => {
                let wall = Local::now();
                let mono = Instant::now();
                let wall_elapsed = (wall - last_wall).num_milliseconds();
                let mono_elapsed = mono.duration_since(last_mono).as_millis() as i64;
                let jumped = (wall_elapsed - mono_elapsed).unsigned_abs()
                    > CLOCK_JUMP_THRESHOLD.as_millis() as u64
                    || wall.offset() != last_wall.offset();
                last_wall = wall;
                last_mono = mono;

                let schedules = services.db.channel_schedules().await?;
                if jumped {
                    known_schedules = schedules;
                    controller.on_time_changed().await;
                } else if schedules != known_schedules {
                    known_schedules = schedules;
                    controller.reschedule().await;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, stopping daemon");
                break;
            }
        }
    }

    services.registry.cancel_all().await?;
    Ok(())
}
