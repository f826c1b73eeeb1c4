//! Cadence CLI - operator surface for the posting decision core

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use cadence_core::arms::DimensionHistory;
use cadence_core::bandit::{ArmPosterior, BanditStore};
use cadence_core::config::{Config, ConfigHandle};
use cadence_core::goals::GoalMode;
use cadence_core::health::{self, HealthStatus};
use cadence_core::scheduler::{ActionScheduler, ArmLogEntry, ArmLogStore, Collaborators};
use cadence_core::sim::{self, SimulatedPlatform, SimulationConfig};
use cadence_core::storage::Database;
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "cadence")]
#[command(author, version, about = "Autonomous posting decision core", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to <config dir>/cadence/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Switch {
    On,
    Off,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler daemon against the simulated platform
    Run,

    /// Show decision log and posterior counts
    Status,

    /// Show or switch the active goal mode
    Mode {
        #[command(subcommand)]
        action: ModeAction,
    },

    /// Turn new selections on or off
    Live {
        #[arg(value_enum)]
        state: Switch,
    },

    /// Inspect learned arms
    Arms {
        #[command(subcommand)]
        action: ArmsAction,
    },

    /// Show recent decision log entries
    Log {
        /// Number of entries
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Run health check
    Doctor,

    /// Run an offline simulation on an in-memory store
    Simulate {
        /// Simulated hours
        #[arg(short, long, default_value = "500")]
        ticks: u32,
        /// RNG seed
        #[arg(short, long, default_value = "42")]
        seed: u64,
        /// Exploration floor
        #[arg(short, long, default_value = "0.1")]
        epsilon: f64,
        /// Goal mode
        #[arg(short, long, default_value = "IMPACT")]
        mode: String,
        /// Share of publish attempts the platform rejects
        #[arg(long, default_value = "0.0")]
        failure_rate: f64,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ModeAction {
    /// Show the active mode and its weights
    Show,
    /// Switch to another mode
    Set { mode: String },
}

#[derive(Subcommand)]
enum ArmsAction {
    /// Arms by posterior mean
    Top {
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
    /// Best value per dimension
    Recommend {
        #[arg(long, default_value = "3")]
        min_samples: f64,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a configuration value
    Get { key: String },
    /// Set a configuration value
    Set { key: String, value: String },
    /// List all configuration values
    List,
    /// Show config file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let level = if cli.quiet { "cadence=warn" } else { "cadence=info" };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.parse()?))
        .with_writer(std::io::stderr)
        .init();

    let config_path = match cli.config {
        Some(path) => path,
        None => Config::config_path()?,
    };
    let ctx = Ctx {
        config_path,
        format: cli.format,
        quiet: cli.quiet,
    };

    match cli.command {
        Commands::Run => cmd_run(&ctx).await,
        Commands::Status => cmd_status(&ctx).await,
        Commands::Mode { action } => cmd_mode(&ctx, action),
        Commands::Live { state } => cmd_live(&ctx, state),
        Commands::Arms { action } => cmd_arms(&ctx, action).await,
        Commands::Log { limit } => cmd_log(&ctx, limit).await,
        Commands::Doctor => cmd_doctor(&ctx).await,
        Commands::Simulate {
            ticks,
            seed,
            epsilon,
            mode,
            failure_rate,
        } => {
            let sim = SimulationConfig {
                ticks,
                seed,
                epsilon,
                goal_mode: mode.parse()?,
                failure_rate,
                ..Default::default()
            };
            cmd_simulate(&ctx, &sim).await
        }
        Commands::Config { action } => cmd_config(&ctx, action),
    }
}

struct Ctx {
    config_path: PathBuf,
    format: OutputFormat,
    quiet: bool,
}

impl Ctx {
    fn load_config(&self) -> anyhow::Result<Config> {
        Config::load_from(&self.config_path)
    }

    async fn open_database(&self, config: &Config) -> anyhow::Result<Database> {
        Database::open(&config.storage.database_path)
            .await
            .with_context(|| format!("Failed to open {}", config.storage.database_path.display()))
    }

    fn json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    fn say(&self, line: impl AsRef<str>) {
        if !self.quiet {
            println!("{}", line.as_ref());
        }
    }
}

async fn cmd_run(ctx: &Ctx) -> anyhow::Result<()> {
    // Polled even before the file exists, so `cadence live on` reaches the daemon
    let handle = ConfigHandle::from_file(&ctx.config_path)?;
    let config = handle.snapshot();
    let db = ctx.open_database(&config).await?;
    if !config.scheduler.live {
        warn!("Live is off; the scheduler will idle until `cadence live on`");
    }

    let seed = config.bandit.seed.unwrap_or(0);
    let platform = Arc::new(SimulatedPlatform::new(&config.arms.domains, seed, 0.05)?);
    let scheduler = Arc::new(
        ActionScheduler::new(&db, Arc::new(handle), Collaborators::from_platform(platform)).await?,
    );

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            signal.cancel();
        }
    });

    ctx.say(format!(
        "Scheduler running (mode {}, live {}). Press Ctrl-C to stop.",
        config.goal.mode,
        if config.scheduler.live { "on" } else { "off" }
    ));
    let result = scheduler.run(shutdown).await;
    db.close().await;
    result.context("Scheduler halted")?;
    Ok(())
}

async fn cmd_status(ctx: &Ctx) -> anyhow::Result<()> {
    let config = ctx.load_config()?;
    let db = ctx.open_database(&config).await?;
    let log = ArmLogStore::new(&db);
    let store = BanditStore::new(&db);

    let summary = log.summary(None).await?;
    let arms = store.count().await?;
    let pending = log.pending_count().await?;

    if ctx.json() {
        let value = serde_json::json!({
            "goal_mode": config.goal.mode,
            "live": config.scheduler.live,
            "epsilon": config.bandit.epsilon,
            "arms": arms,
            "pending": pending,
            "summary": summary,
            "exploration_ratio": summary.exploration_ratio(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("Goal mode:   {}", config.goal.mode);
    println!("Live:        {}", if config.scheduler.live { "on" } else { "off" });
    println!("Epsilon:     {:.2}", config.bandit.epsilon);
    println!("Arms stored: {}", arms);
    println!();
    println!("Decisions:   {}", summary.total);
    println!("  awaiting:  {}", pending);
    println!("  resolved:  {}", summary.resolved);
    println!("  timed out: {} (degraded)", summary.timed_out);
    println!("  failed:    {}", summary.failed);
    match summary.mean_reward {
        Some(mean) => println!("Mean reward: {:.3}", mean),
        None => println!("Mean reward: n/a"),
    }
    if let Some(ratio) = summary.exploration_ratio() {
        println!("Explored:    {:.1}%", ratio * 100.0);
    }
    Ok(())
}

fn cmd_mode(ctx: &Ctx, action: ModeAction) -> anyhow::Result<()> {
    let mut config = ctx.load_config()?;
    match action {
        ModeAction::Show => {
            let mode = config.goal.mode;
            let weights = config.goal.weights.get(mode);
            if ctx.json() {
                let value = serde_json::json!({ "mode": mode, "weights": weights });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                println!("{}", mode);
                if let Some(w) = weights {
                    println!(
                        "  fame={:.2} revenue={:.2} authority={:.2} penalty={:.2}",
                        w.fame, w.revenue, w.authority, w.penalty
                    );
                }
            }
        }
        ModeAction::Set { mode } => {
            let mode: GoalMode = mode.parse()?;
            config.goal.mode = mode;
            config.save_to(&ctx.config_path)?;
            ctx.say(format!("Goal mode set to {}", mode));
        }
    }
    Ok(())
}

fn cmd_live(ctx: &Ctx, state: Switch) -> anyhow::Result<()> {
    let mut config = ctx.load_config()?;
    config.scheduler.live = state == Switch::On;
    config.save_to(&ctx.config_path)?;
    ctx.say(format!(
        "Live {}",
        if config.scheduler.live { "on" } else { "off" }
    ));
    Ok(())
}

async fn cmd_arms(ctx: &Ctx, action: ArmsAction) -> anyhow::Result<()> {
    let config = ctx.load_config()?;
    let db = ctx.open_database(&config).await?;
    let store = BanditStore::new(&db);

    match action {
        ArmsAction::Top { limit } => {
            let top = store.top_arms(limit).await?;
            if ctx.json() {
                println!("{}", serde_json::to_string_pretty(&top)?);
            } else if top.is_empty() {
                println!("No arms stored yet.");
            } else {
                for entry in &top {
                    print_arm(entry);
                }
            }
        }
        ArmsAction::Recommend { min_samples } => {
            let history = DimensionHistory::from_posteriors(&store.observed().await?);
            let recommendations = history.recommendations(min_samples);
            if ctx.json() {
                println!("{}", serde_json::to_string_pretty(&recommendations)?);
            } else if recommendations.is_empty() {
                println!("No observations yet.");
            } else {
                for r in &recommendations {
                    println!("{}", r);
                }
            }
        }
    }
    Ok(())
}

fn print_arm(entry: &ArmPosterior) {
    let p = entry.posterior;
    println!(
        "{:<48} mean={:.3} alpha={:.2} beta={:.2} n={:.1}",
        entry.arm.to_string(),
        p.mean(),
        p.alpha,
        p.beta,
        p.observations()
    );
}

async fn cmd_log(ctx: &Ctx, limit: usize) -> anyhow::Result<()> {
    let config = ctx.load_config()?;
    let db = ctx.open_database(&config).await?;
    let entries = ArmLogStore::new(&db).recent(limit).await?;

    if ctx.json() {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("No decisions logged yet.");
    }
    for entry in &entries {
        print_entry(entry);
    }
    Ok(())
}

fn print_entry(entry: &ArmLogEntry) {
    let reward = entry
        .reward_j
        .map(|r| format!("{:.3}", r))
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{} {:<10} {:<8} {:<44} theta={:.3}{} J={} {}",
        entry.created_at.format("%Y-%m-%d %H:%M"),
        entry.status,
        entry.action_kind,
        entry.arm.to_string(),
        entry.sampled_prob,
        if entry.explored { "*" } else { "" },
        reward,
        entry.error.as_deref().unwrap_or_default()
    );
}

async fn cmd_doctor(ctx: &Ctx) -> anyhow::Result<()> {
    let config = ctx.load_config()?;
    let db = ctx.open_database(&config).await?;
    let report = health::doctor(
        &db,
        &config,
        Some(ctx.config_path.as_path()),
        None,
        chrono::Utc::now(),
    )
    .await;

    if ctx.json() {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        ctx.say("Cadence Health Check");
        ctx.say("====================");
        ctx.say("");
        for check in &report.checks {
            let tag = match check.status {
                HealthStatus::Ok => "[OK]",
                HealthStatus::Warning => "[??]",
                HealthStatus::Error => "[!!]",
            };
            ctx.say(format!(
                "{} {}: {}",
                tag,
                check.name,
                check.message.as_deref().unwrap_or_default()
            ));
        }
        ctx.say("");
        if report.overall_status == HealthStatus::Ok {
            ctx.say("All checks passed.");
        }
    }

    if report.is_critical() {
        anyhow::bail!("health check failed");
    }
    Ok(())
}

async fn cmd_simulate(ctx: &Ctx, sim: &SimulationConfig) -> anyhow::Result<()> {
    let report = sim::run_simulation(sim).await?;

    if ctx.json() {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    println!("Simulated {} ticks (seed {}, epsilon {:.2}, {})", report.ticks, sim.seed, sim.epsilon, sim.goal_mode);
    println!("  dispatched:        {}", report.dispatched);
    println!("  failed:            {}", report.failed);
    println!("  resolved:          {}", report.resolved);
    if let Some(mean) = report.mean_reward {
        println!("  mean reward J:     {:.3}", mean);
    }
    println!("  mean true reward:  {:.3}", report.mean_true_reward);
    println!("  mean regret:       {:.3}", report.mean_regret);
    if let Some(ratio) = report.exploration_ratio {
        println!("  exploration ratio: {:.3}", ratio);
    }
    if let (Some(arm), Some(mean)) = (&report.best_arm, report.best_arm_mean) {
        println!("  best arm:          {} (mean {:.3})", arm, mean);
    }
    Ok(())
}

fn cmd_config(ctx: &Ctx, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => {
            let config = ctx.load_config()?;
            println!("{}", config.get(&key)?);
        }
        ConfigAction::Set { key, value } => {
            let mut config = ctx.load_config()?;
            config.set(&key, &value)?;
            config.save_to(&ctx.config_path)?;
            ctx.say(format!("Set {} = {}", key, value));
        }
        ConfigAction::List => {
            let config = ctx.load_config()?;
            for (key, value) in config.list()? {
                println!("{} = {}", key, value);
            }
        }
        ConfigAction::Path => {
            println!("{}", ctx.config_path.display());
        }
    }
    Ok(())
}
