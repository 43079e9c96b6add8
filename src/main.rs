use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing::info;

use tollgate::config::TollgateConfig;
use tollgate::ratelimit::{RateLimiter, RequestContext, RuleSet, TracingReporter};
use tollgate::store::MemoryStore;
use tollgate::telemetry;

/// Multi-tenant rate limiting engine.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Cli {
    /// Configuration file (YAML); TOLLGATE_* environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Rules file (YAML); overrides `rules_path` from the configuration
    #[arg(long, global = true)]
    rules: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load and validate a rules file
    Validate,
    /// Run simulated requests against the rules using an in-memory store
    Check(CheckArgs),
}

#[derive(Debug, Args)]
struct CheckArgs {
    #[arg(long)]
    tenant: Option<String>,
    #[arg(long)]
    user: Option<String>,
    #[arg(long, default_value = "127.0.0.1")]
    ip: String,
    #[arg(long, default_value = "/")]
    endpoint: String,
    #[arg(long, default_value = "GET")]
    method: String,
    /// Number of requests to send
    #[arg(long, default_value_t = 1)]
    count: u32,
    /// Pause between requests, in milliseconds
    #[arg(long, default_value_t = 0)]
    interval_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = TollgateConfig::load(cli.config.as_deref()).context("loading configuration")?;
    telemetry::init(&config.logging)?;
    info!(version = env!("CARGO_PKG_VERSION"), "Starting Tollgate");

    let rules_path = cli
        .rules
        .clone()
        .or_else(|| config.rules_path.as_ref().map(PathBuf::from))
        .context("no rules file given; pass --rules or set rules_path")?;
    let rules = load_rules(&rules_path)?;

    match cli.command {
        Command::Validate => validate(&rules),
        Command::Check(args) => check(config, rules, args).await,
    }
}

fn load_rules(path: &Path) -> anyhow::Result<RuleSet> {
    RuleSet::from_file(path).with_context(|| format!("loading rules from {}", path.display()))
}

fn validate(rules: &RuleSet) -> anyhow::Result<()> {
    for rule in rules.rules() {
        println!(
            "{:<24} {:<9} {:<15} {:>6}/{:<6}s priority={} {}",
            rule.id,
            rule.scope.as_str(),
            format!("{:?}", rule.algorithm),
            rule.max_requests,
            rule.window_seconds,
            rule.priority,
            if rule.enabled { "" } else { "(disabled)" },
        );
    }
    println!("{} rule(s) valid", rules.len());
    Ok(())
}

async fn check(config: TollgateConfig, rules: RuleSet, args: CheckArgs) -> anyhow::Result<()> {
    let default_message = config.engine.default_message.clone();
    let limiter = RateLimiter::new(Arc::new(MemoryStore::new()), config.engine)
        .with_reporter(Arc::new(TracingReporter));

    let mut ctx = RequestContext::new(args.ip, args.endpoint, args.method);
    ctx.tenant_id = args.tenant;
    ctx.user_id = args.user;

    for request in 1..=args.count {
        let result = limiter.check_and_commit(&rules, &ctx).await;
        let headers: serde_json::Map<String, serde_json::Value> = result
            .headers()
            .into_iter()
            .map(|(name, value)| (name.to_string(), json!(value)))
            .collect();

        let line = json!({
            "request": request,
            "allowed": result.allowed,
            "rule": result.rule_id(),
            "headers": headers,
            "error": result.quota_exceeded(&default_message),
        });
        println!("{line}");

        if args.interval_ms > 0 && request < args.count {
            tokio::time::sleep(Duration::from_millis(args.interval_ms)).await;
        }
    }

    if limiter.store_failures() > 0 {
        info!(failures = limiter.store_failures(), "Counter store failures were absorbed");
    }
    Ok(())
}
