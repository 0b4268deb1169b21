use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use servprobe_common::MatchResult;
use servprobe_engine::{parse_transports, Config, ConfigOption, Matcher, RuleSource};
use servprobe_pool::{Pool, Task};
use servprobe_target_resolver::expand_targets;

use crate::args::MatchArgs;
use crate::output::print_results;

pub async fn run_match(args: MatchArgs) -> Result<()> {
    info!("Starting match...");
    info!("Targets: {}", args.targets);
    info!("Ports: {}", args.ports);

    let hosts = expand_targets(&args.targets)?;
    let ports = parse_port_list(&args.ports)?;
    info!("Total requests: {} ({} hosts × {} ports)", hosts.len() * ports.len(), hosts.len(), ports.len());

    let config = build_config(&args)?;
    let matcher = Arc::new(Matcher::new(config).context("Invalid match configuration")?);
    let pool = Pool::with_rate_limit(Arc::clone(&matcher), args.concurrency, args.rate_limit);

    let results: Arc<Mutex<Vec<MatchResult>>> = Arc::default();
    let sink = Arc::clone(&results);
    pool.add_callback(move |task, outcome| match outcome {
        Ok(result) => sink.lock().push(result.clone()),
        Err(e) => warn!("{}:{} failed: {}", task.host, task.port, e),
    });

    let started = Instant::now();
    for host in &hosts {
        for port in &ports {
            pool.submit(Task::new(host.clone(), *port))?;
        }
    }
    pool.close_and_wait().await;
    let elapsed = started.elapsed();

    let results = std::mem::take(&mut *results.lock());
    print_results(&results, &args.output_format, elapsed)?;
    Ok(())
}

fn build_config(args: &MatchArgs) -> Result<Config> {
    let transports = parse_transports(args.transports.as_slice()).context("Invalid --transports")?;
    let mut config = Config::default()
        .with_transports(transports)
        .with_active_mode(!args.passive)
        .with_rarity_max(args.rarity_max)
        .with_probes_max(args.probes_max)
        .with_probes_concurrent_max(args.probes_concurrency)
        .with_proxies(args.proxies.clone())
        .with_cache(args.cache)
        .with_runtime_id(Uuid::new_v4().to_string());
    if let Some(path) = &args.rules {
        config = config.with_rules(RuleSource::FilePath(path.clone()));
    }

    let mut options = vec![
        ConfigOption::ProbeTimeoutSecs(args.timeout),
        ConfigOption::DebugLog(args.debug_log),
    ];
    if let Some(hosts) = &args.exclude_hosts {
        options.push(ConfigOption::ExcludeHosts(hosts.clone()));
    }
    if let Some(ports) = &args.exclude_ports {
        options.push(ConfigOption::ExcludePorts(ports.clone()));
    }
    for option in &options {
        config.apply_option(option)?;
    }
    Ok(config)
}

/// Parses a port string like "80,443,1000-1010" into a sorted, de-duplicated list.
fn parse_port_list(ports: &str) -> Result<Vec<u16>> {
    let list = servprobe_rules::parse_ports(&format!("ports {ports}"))
        .with_context(|| format!("Invalid port list: {ports}"))?;
    if list.is_empty() {
        anyhow::bail!("No ports specified");
    }
    Ok(list)
}
