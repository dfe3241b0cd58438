//! gatewayctl - Operator CLI for the LLM gateway routing core
//!
//! Validates configuration, lists the model catalog, and dry-runs routing
//! for a request without contacting any provider.
//!
//! # Usage
//!
//! ```bash
//! # Validate the default config file (~/.config/llm-gateway/gateway.toml)
//! gatewayctl check
//!
//! # Validate a specific file
//! gatewayctl --config ./gateway.toml check
//!
//! # Show the candidate list for an explicit model
//! gatewayctl route --model gpt-4 --prompt "hello"
//!
//! # Run the full pipeline against offline echo providers
//! gatewayctl route --strategy cost-optimized --execute --json
//!
//! # Same, followed by the metrics registry in Prometheus format
//! gatewayctl route --model gpt-4 --execute --metrics
//!
//! # Verbose logging
//! RUST_LOG=debug gatewayctl check
//! ```

mod echo;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use tracing::info;

use echo::EchoAdapter;
use gateway_core::config::{load_config_from_path, ConfigOverrides, LoadedConfig};
use gateway_core::{
    GatewayConfig, GatewayRequest, ProviderAdapter, ProviderKind, QueryRouter, RoutingStrategy,
};

/// gatewayctl - Inspect and dry-run LLM gateway routing
#[derive(Parser, Debug)]
#[command(name = "gatewayctl")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "LLM_GATEWAY_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "LLM_GATEWAY_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Override the default strategy
    #[arg(long, value_name = "STRATEGY")]
    default_strategy: Option<RoutingStrategy>,

    /// Override the default model
    #[arg(long, value_name = "MODEL")]
    default_model: Option<String>,

    /// Disable smart routing (default strategy only)
    #[arg(long)]
    no_smart_routing: bool,

    /// Disable fallback
    #[arg(long)]
    no_fallback: bool,

    /// Disable rate limiting
    #[arg(long)]
    no_rate_limit: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate the configuration and report warnings
    Check,

    /// List configured models
    Models,

    /// Show how a request would be routed
    Route(RouteArgs),
}

#[derive(ClapArgs, Debug)]
struct RouteArgs {
    /// Requested model id or alias (omit for automatic routing)
    #[arg(short = 'm', long)]
    model: Option<String>,

    /// Strategy requested by the caller
    #[arg(short = 's', long)]
    strategy: Option<RoutingStrategy>,

    #[arg(short = 'u', long)]
    user: Option<String>,

    #[arg(short = 'k', long)]
    api_key: Option<String>,

    #[arg(short = 'p', long, default_value = "Hello")]
    prompt: String,

    #[arg(long)]
    max_tokens: Option<u32>,

    /// Route an embedding request instead of a completion
    #[arg(long)]
    embedding: bool,

    #[arg(long)]
    stream: bool,

    #[arg(long)]
    function_calling: bool,

    #[arg(long)]
    vision: bool,

    /// Dispatch through offline echo providers and report the decision
    #[arg(long)]
    execute: bool,

    /// Emit JSON instead of text
    #[arg(long)]
    json: bool,

    /// After --execute, print the metrics registry in Prometheus text format
    #[arg(long, requires = "execute")]
    metrics: bool,
}

impl RouteArgs {
    fn request(&self) -> GatewayRequest {
        let mut request = if self.embedding {
            GatewayRequest::embedding(self.prompt.clone())
        } else {
            GatewayRequest::completion(self.prompt.clone())
        };
        if let Some(model) = &self.model {
            request = request.with_model(model.clone());
        }
        if let Some(strategy) = self.strategy {
            request = request.with_strategy(strategy);
        }
        if let Some(user) = &self.user {
            request = request.with_user(user.clone());
        }
        if let Some(key) = &self.api_key {
            request = request.with_api_key(key.clone());
        }
        if let Some(max_tokens) = self.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }
        if self.stream {
            request = request.streaming();
        }
        if self.function_calling {
            request = request.with_function_calling();
        }
        if self.vision {
            request = request.with_vision();
        }
        request
    }
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(strategy) = self.default_strategy {
            overrides = overrides.with_default_strategy(strategy);
        }
        if let Some(model) = &self.default_model {
            overrides = overrides.with_default_model(model.clone());
        }
        if self.no_smart_routing {
            overrides = overrides.with_smart_routing(false);
        }
        if self.no_fallback {
            overrides = overrides.with_fallback(false);
        }
        if self.no_rate_limit {
            overrides = overrides.with_rate_limit(false);
        }
        overrides
    }
}

fn load(args: &Args) -> Result<LoadedConfig> {
    let mut loaded =
        load_config_from_path(args.config.as_deref()).context("Failed to load configuration")?;
    args.overrides()
        .apply(&mut loaded)
        .context("Invalid command-line override")?;
    info!(
        source = %loaded.source,
        path = ?loaded.path,
        "Configuration loaded"
    );
    Ok(loaded)
}

/// Echo adapters for every provider the configuration routes to
fn echo_router(config: &GatewayConfig) -> Result<QueryRouter> {
    let mut kinds: BTreeMap<String, ProviderKind> = config
        .models
        .iter()
        .map(|m| (m.provider.clone(), ProviderKind::Custom))
        .collect();
    for provider in &config.providers {
        kinds.insert(provider.name.clone(), provider.kind);
    }

    let default_tokens = config.routing.default_completion_tokens;
    let builder = kinds.into_iter().fold(
        QueryRouter::builder(config.clone()),
        |builder, (name, kind)| {
            let adapter = EchoAdapter::new(name, kind, default_tokens);
            builder.provider(Arc::new(adapter) as Arc<dyn ProviderAdapter>)
        },
    );
    builder.build().context("Failed to build router")
}

fn run_check(loaded: &LoadedConfig) {
    let config = &loaded.config;
    match &loaded.path {
        Some(path) => println!("Configuration OK: {} ({})", path.display(), loaded.source),
        None => println!("Configuration OK: built-in defaults ({})", loaded.source),
    }
    println!(
        "  {} model(s), {} provider(s), {} fallback rule(s), default strategy {}",
        config.models.len(),
        config.providers.len(),
        config.fallback.rules.len(),
        config.routing.default_strategy
    );
    for warning in config.fallback.lint() {
        println!("  warning: {warning}");
    }
    if config.models.is_empty() {
        println!("  warning: no models configured; every request will fail routing");
    }
}

fn run_models(config: &GatewayConfig) {
    println!(
        "{:<24} {:<12} {:>10} {:>10} {:>9}  {}",
        "MODEL", "PROVIDER", "PROMPT/1K", "COMPL/1K", "CONTEXT", "CAPABILITIES"
    );
    for model in &config.models {
        let caps = model.capabilities;
        let flags: Vec<&str> = [
            (caps.completions, "completions"),
            (caps.embeddings, "embeddings"),
            (caps.streaming, "streaming"),
            (caps.function_calling, "functions"),
            (caps.vision, "vision"),
        ]
        .into_iter()
        .filter_map(|(on, name)| on.then_some(name))
        .collect();
        let name = if model.is_active {
            model.model_id.clone()
        } else {
            format!("{} (inactive)", model.model_id)
        };
        println!(
            "{:<24} {:<12} {:>10.4} {:>10.4} {:>9}  {}",
            name,
            model.provider,
            model.prompt_cost_per_1k,
            model.completion_cost_per_1k,
            model.context_window,
            flags.join(",")
        );
    }

    if !config.routing.model_mappings.is_empty() {
        println!();
        println!("ALIASES");
        for mapping in &config.routing.model_mappings {
            println!("  {} -> {}", mapping.model_id, mapping.target_model_id);
        }
    }

    if !config.fallback.rules.is_empty() {
        println!();
        println!(
            "FALLBACK RULES (enabled: {}, max attempts: {})",
            config.fallback.enabled, config.fallback.max_fallback_attempts
        );
        for rule in config.fallback.rules.iter() {
            let codes: Vec<&str> = rule.error_codes.iter().map(|c| c.as_str()).collect();
            println!(
                "  {} -> [{}] on [{}]",
                rule.model_id,
                rule.fallback_models.join(", "),
                codes.join(", ")
            );
        }
    }
}

async fn run_route(config: &GatewayConfig, route: &RouteArgs) -> Result<()> {
    let router = echo_router(config)?;
    let request = route.request();

    if route.execute {
        let outcome = router.execute(request).await;
        let decision = match &outcome {
            Ok(served) => served.decision.clone(),
            Err(_) => router
                .decisions(gateway_core::TimeRange::all())
                .await?
                .pop()
                .context("No routing decision recorded")?,
        };
        if route.json {
            println!("{}", serde_json::to_string_pretty(&decision)?);
        } else {
            println!(
                "{} -> {} via {} ({} attempt(s), {}ms)",
                decision.requested_model,
                decision.selected_model.as_deref().unwrap_or("-"),
                decision.strategy,
                decision.attempt_count,
                decision.response_time_ms
            );
        }
        if route.metrics {
            println!();
            print!("{}", router.metrics().to_prometheus());
        }
        outcome.map(|_| ()).map_err(anyhow::Error::from)
    } else {
        let list = router.preview(&request)?;
        if route.json {
            let value = serde_json::json!({
                "requested_model": list.requested_model,
                "resolved_model": list.resolved_model,
                "rule_key": list.rule_key,
                "strategy": list.strategy,
                "candidates": list.model_ids(),
                "excluded_open": list.excluded_open,
            });
            println!("{}", serde_json::to_string_pretty(&value)?);
        } else {
            println!(
                "requested {} (rule key {}, strategy {})",
                list.requested_model, list.rule_key, list.strategy
            );
            for (i, candidate) in list.iter().enumerate() {
                let marker = if candidate.last_resort { " [last resort]" } else { "" };
                println!(
                    "  {}. {}/{}{}",
                    i + 1,
                    candidate.model.provider,
                    candidate.model.model_id,
                    marker
                );
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("gatewayctl={}", args.log_level).parse()?)
                .add_directive(format!("gateway_core={}", args.log_level).parse()?),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let loaded = load(&args)?;

    match &args.command {
        Command::Check => run_check(&loaded),
        Command::Models => run_models(&loaded.config),
        Command::Route(route) => run_route(&loaded.config, route).await?,
    }

    Ok(())
}
