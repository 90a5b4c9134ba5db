//! propintel: feed a JSONL event file through the pipeline, run a batch
//! analysis cycle and print the portfolio, worst sentiment first.
//!
//! Usage: `propintel [--config <path>] <events.jsonl>`
//!
//! Each line is either `{"register": <EntityProfile>}` or `{"event": <DomainEvent>}`.

use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use chrono::Utc;
use serde::Deserialize;

use propintel_lib::analysis::AnalysisMethod;
use propintel_lib::entity::EntityProfile;
use propintel_lib::signals::bus::DomainEvent;
use propintel_lib::store::portfolio::{PortfolioScope, PortfolioSort};
use propintel_lib::types::Config;
use propintel_lib::SignalPipeline;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
enum InputLine {
    Register(EntityProfile),
    Event(DomainEvent),
}

fn parse_args() -> anyhow::Result<(Option<PathBuf>, PathBuf)> {
    let mut config = None;
    let mut input = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let path = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--config needs a path"))?;
                config = Some(PathBuf::from(path));
            }
            _ => input = Some(PathBuf::from(arg)),
        }
    }
    let input = input.ok_or_else(|| anyhow::anyhow!("usage: propintel [--config <path>] <events.jsonl>"))?;
    Ok((config, input))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let (config_path, input) = parse_args()?;
    let config = match config_path {
        Some(path) => Config::from_path(&path),
        None => Config::load(),
    }
    .map_err(|e| anyhow::anyhow!("Failed to load config: {e}"))?;

    let pipeline =
        SignalPipeline::open(config).map_err(|e| anyhow::anyhow!("Failed to open pipeline: {e}"))?;

    let file = std::fs::File::open(&input)?;
    let (mut applied, mut rejected) = (0usize, 0usize);
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let parsed: InputLine = match serde_json::from_str(&line) {
            Ok(p) => p,
            Err(e) => {
                log::warn!("line {}: unreadable: {}", n + 1, e);
                rejected += 1;
                continue;
            }
        };
        let result = match parsed {
            InputLine::Register(profile) => pipeline.register_entity(profile),
            InputLine::Event(event) => pipeline.ingest(&event).map(|_| ()),
        };
        match result {
            Ok(()) => applied += 1,
            Err(e) => {
                log::warn!("line {}: {} ({})", n + 1, e, e.recovery_suggestion());
                rejected += 1;
            }
        }
    }
    log::info!("{} lines applied, {} rejected", applied, rejected);

    let report = pipeline.run_analysis(&AnalysisMethod::ALL, Utc::now()).await;
    for method in &report.methods {
        log::info!(
            "{}: {} processed, {} written, {} withheld, {} failed",
            method.method,
            method.processed,
            method.written,
            method.withheld,
            method.failed
        );
    }

    let portfolio = pipeline.get_portfolio_signals(&PortfolioScope::All, PortfolioSort::SentimentAscending);
    let summaries: Vec<_> = portfolio.iter().map(|s| s.as_ref()).collect();
    println!("{}", serde_json::to_string_pretty(&summaries)?);
    Ok(())
}
