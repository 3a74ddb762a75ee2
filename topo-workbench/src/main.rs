use crate::commands::{Cli, PROMPT, read_lines};
use crate::config::cli::CliOpt;
use crate::config::load_topology;
use crate::util::{describe_link_loss, print_link_stats};
use anyhow::{Context, bail};
use clap::Parser;
use emulated_network::network::event::NetworkEvents;
use emulated_network::network::spec::LinkClass;
use emulated_network::{Network, NetworkConfig, async_rt};
use fastrand::Rng;
use std::io::{BufRead, Write};
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod util;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let options = CliOpt::parse();
    let rt = async_rt::new_rt().context("failed to initialize tokio")?;
    rt.block_on(run(options))
}

async fn run(options: CliOpt) -> anyhow::Result<()> {
    if let Some(loss) = options.link_loss {
        if !(0.0..=100.0).contains(&loss) {
            bail!("--link_loss must be between 0 and 100 (got {loss})");
        }
    }

    let topology = load_topology(&options.config)?;
    let network_rng_seed = if options.non_deterministic {
        Rng::new().u64(..)
    } else {
        options.network_rng_seed
    };
    let link_class = options
        .link_class
        .or(topology.link_class)
        .unwrap_or_default();

    println!("--- Params ---");
    println!("* Network seed: {network_rng_seed}");
    println!("* Topology path: {}", options.config.display());
    println!("* Link class: {link_class}");
    println!("* Congestion control: {}", options.control_algo);
    println!("* Core link loss: {}", describe_link_loss(options.link_loss, link_class));

    std::fs::create_dir_all(&options.workdir)
        .with_context(|| format!("failed to create `{}`", options.workdir.display()))?;
    let config = NetworkConfig {
        link_class,
        rng_seed: network_rng_seed,
        default_congestion: options.control_algo,
        workdir: options.workdir.clone(),
        record_steps: options.replay_log.is_some(),
    };
    let network = Network::initialize(topology.spec, NetworkEvents::new(topology.events), config)
        .context("failed to create the network")?;
    if let (Some(loss), LinkClass::Tc) = (options.link_loss, link_class) {
        network.set_core_link_loss(loss);
    }
    network.start();

    println!("--- Running ---");
    match &options.script {
        Some(script) => {
            let lines = read_lines(script)?;
            Cli::new(network.clone(), true).run(lines.into_iter()).await;
        }
        None => Cli::new(network.clone(), false).run(StdinLines).await,
    }

    network.stop().await;
    print_link_stats(&network);

    if let Some(path) = &options.replay_log {
        println!("--- Replay log ---");
        network.tracer().write_replay_log(path)?;
        println!("* Replay log available at {}", path.display());
    }

    Ok(())
}

/// Lines typed at the prompt
struct StdinLines;

impl Iterator for StdinLines {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        print!("{PROMPT}");
        std::io::stdout().flush().ok()?;

        let mut line = String::new();
        match std::io::stdin().lock().read_line(&mut line) {
            Ok(0) | Err(_) => {
                println!();
                None
            }
            Ok(_) => Some(line),
        }
    }
}
