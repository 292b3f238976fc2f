use std::{env, io::Read, path::PathBuf, sync::Arc};

use clap::{Args, Parser, Subcommand};
use serde_json::{Value, json};
use tally::{
    accumulator::{self, Accumulator},
    charger::{self, Charger},
    config::{self, Config},
    ledger::{InMemoryLedger, Submission},
    plan::{PlanLookup, StaticPlans},
    rating::{self, Rater},
    report::Report,
    usage::MeteredUsage,
};
use tally_formula::FunctionCache;
use tokio::{
    fs::File,
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader},
    runtime::Builder,
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Failed to load tally config: {0}")]
    Config(#[from] config::Error),
    #[error("Failed to (de)serialize JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Charging failed: {0}")]
    Charge(#[from] charger::Error),
}

fn default_config_path() -> String {
    "/etc/tally/tally.yaml".to_string()
}

#[derive(Parser)]
#[clap(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accumulate metered usage read as JSON lines
    Accumulate(AccumulateCommand),
    /// Charge a rated usage report
    Charge(ChargeCommand),
    /// Validate configuration file and exit
    ConfigCheck(ConfigCheckCommand),
}

#[derive(Args)]
struct AccumulateCommand {
    /// path on disk to the configuration file
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
    /// file of metered usage, one JSON document per line, stdin when absent
    #[clap(long)]
    input: Option<PathBuf>,
    /// rate every accumulated document before printing it
    #[clap(long)]
    rate: bool,
}

#[derive(Args)]
struct ChargeCommand {
    /// path on disk to the configuration file
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
    /// path on disk to the rated usage report
    #[clap(long)]
    report: PathBuf,
    /// time to charge at in epoch milliseconds, now when absent
    #[clap(long)]
    time: Option<i64>,
}

#[derive(Args)]
struct ConfigCheckCommand {
    /// path on disk to the configuration file
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
}

fn load_config_contents(config_path: &str) -> Result<String, Error> {
    if let Ok(env_var_value) = env::var("TALLY_CONFIG") {
        debug!("Using config from env var 'TALLY_CONFIG'");
        Ok(env_var_value)
    } else {
        debug!("Attempting to open configuration file at: {}", config_path);
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .open(config_path)
            .map_err(|err| {
                error!("Could not read config file '{}': {}", config_path, err);
                err
            })?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        Ok(contents)
    }
}

fn parse_config(contents: &str) -> Result<Config, Error> {
    let config = Config::from_yaml(contents).map_err(|err| {
        error!("Configuration validation failed: {}", err);
        err
    })?;
    Ok(config.apply_env(|key| env::var(key).ok())?)
}

fn validate_config(config_path: &str) -> Result<Config, Error> {
    let contents = load_config_contents(config_path)?;
    let config = parse_config(&contents)?;
    info!("Configuration file is valid");
    Ok(config)
}

fn failure(status: u16, code: &str, reason: &str, noretry: bool) -> Value {
    json!({
        "status": status,
        "body": { "error": code, "reason": reason, "noretry": noretry },
    })
}

async fn respond(
    ledger: &InMemoryLedger<Arc<StaticPlans>>,
    rater: Option<&Rater<Arc<StaticPlans>>>,
    line: &str,
) -> Result<Value, Error> {
    let usage: MeteredUsage = match serde_json::from_str(line) {
        Ok(usage) => usage,
        Err(err) => {
            warn!(%err, "malformed usage");
            return Ok(failure(400, "einput", &err.to_string(), true));
        }
    };
    let submission = match ledger.submit(&usage, None).await {
        Ok(submission) => submission,
        Err(err) => {
            if matches!(err, accumulator::Error::Provider(_)) {
                warn!(%err, "usage not accumulated, may be retried");
            }
            return Ok(failure(err.status(), err.code(), &err.to_string(), err.noretry()));
        }
    };
    let status = submission.status();
    let response = match submission {
        Submission::Created { location, doc } => {
            let body = match rater {
                None => serde_json::to_value(&doc)?,
                Some(rater) => match rater.rate(&doc, None).await {
                    Ok(PlanLookup::Found(rated)) => serde_json::to_value(&rated)?,
                    Ok(PlanLookup::Rejected(err)) => serde_json::to_value(&err)?,
                    Err(rating::Error::Provider(err)) => {
                        return Ok(failure(502, "eprovider", &err.to_string(), false));
                    }
                    Err(err) => return Ok(failure(422, "eformula", &err.to_string(), true)),
                },
            };
            json!({ "status": status, "location": location, "body": body })
        }
        Submission::Duplicate { id } => failure(
            status,
            "eduplicate",
            &format!("usage {id} was already accumulated"),
            true,
        ),
        Submission::Rejected(rejected) => json!({
            "status": status,
            "body": serde_json::to_value(&rejected)?,
        }),
    };
    Ok(response)
}

async fn accumulate(config: Config, input: Option<PathBuf>, rate: bool) -> Result<(), Error> {
    let plans = Arc::new(config.plans());
    let cache = Arc::new(FunctionCache::new(
        config.accumulate_cache(),
        config.accumulate_cache(),
    ));
    let ledger = InMemoryLedger::new(Accumulator::new(
        Arc::clone(&plans),
        config.window_sizes(),
        cache,
    ));
    let rater = rate.then(|| Rater::new(Arc::clone(&plans), config.pricing_country.clone()));

    let reader: Box<dyn AsyncBufRead + Unpin + Send> = match input {
        Some(path) => Box::new(BufReader::new(File::open(path).await?)),
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };
    let mut lines = reader.lines();
    let mut stdout = tokio::io::stdout();
    let mut processed = 0_u64;
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = respond(&ledger, rater.as_ref(), &line).await?;
        let mut out = serde_json::to_vec(&response)?;
        out.push(b'\n');
        stdout.write_all(&out).await?;
        processed += 1;
    }
    stdout.flush().await?;
    info!(processed, "accumulation complete");
    Ok(())
}

async fn charged_report(
    charger: &Charger<StaticPlans>,
    time: i64,
    report: Report,
) -> Result<Value, Error> {
    match charger.charge_report(time, report, None).await {
        Ok(charged) => Ok(serde_json::to_value(&charged)?),
        Err(charger::Error::RatingPlan {
            plan_id,
            error,
            reason,
        }) => {
            info!(%plan_id, %error, "rating plan rejected the report");
            Ok(json!({
                "status": 200,
                "body": { "error": error, "reason": reason },
            }))
        }
        Err(err) => Err(err.into()),
    }
}

async fn charge(config: Config, report: PathBuf, time: Option<i64>) -> Result<(), Error> {
    let contents = tokio::fs::read(&report).await?;
    let report: Report = serde_json::from_slice(&contents)?;
    let time = time.unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
    let cache = Arc::new(FunctionCache::new(config.charge_cache(), config.charge_cache()));
    let charger = Charger::new(config.plans(), cache);
    let charged = charged_report(&charger, time, report).await?;

    let mut out = serde_json::to_vec_pretty(&charged)?;
    out.push(b'\n');
    let mut stdout = tokio::io::stdout();
    stdout.write_all(&out).await?;
    stdout.flush().await?;
    Ok(())
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .finish()
        .init();

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting tally {version}.");

    let cli = Cli::parse();
    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    match cli.command {
        Commands::ConfigCheck(cmd) => match validate_config(&cmd.config_path) {
            Ok(_) => std::process::exit(0),
            Err(_) => std::process::exit(1),
        },
        Commands::Accumulate(cmd) => {
            let config = validate_config(&cmd.config_path)?;
            runtime.block_on(accumulate(config, cmd.input, cmd.rate))
        }
        Commands::Charge(cmd) => {
            let config = validate_config(&cmd.config_path)?;
            runtime.block_on(charge(config, cmd.report, cmd.time))
        }
    }
}
