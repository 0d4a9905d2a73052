#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use spindle_planner::{PlanSummary, Planner};
use spindle_proto::{Session, TokenScanner, read_header};
use spindle_types::{SimConfig, Tag};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "spindle", about = "Spindle — replicated block-storage simulator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Drive a full protocol session on stdin/stdout.
    Run,
    /// Read a capture's configuration header and print the placement plan.
    Plan {
        /// Path to a protocol capture; only the header is consumed.
        input: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    // Diagnostics go to stderr; stdout carries the protocol.
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run => {
            let stdin = io::stdin();
            let stdout = io::stdout();
            Session::new(stdin.lock(), stdout.lock()).run()?;
            Ok(())
        }
        Command::Plan { input, json } => {
            let file =
                File::open(&input).with_context(|| format!("open {}", input.display()))?;
            let mut scanner = TokenScanner::new(BufReader::new(file));
            let (cfg, tables) =
                read_header(&mut scanner).context("parse configuration header")?;
            let planner = Planner::preprocess(cfg, &tables);
            let summary = planner.summary();
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_summary(&cfg, &summary);
            }
            Ok(())
        }
    }
}

fn print_summary(cfg: &SimConfig, summary: &PlanSummary) {
    println!(
        "{} disks x {} units, {} categories, {} steps (+extra)",
        cfg.disks, cfg.units_per_disk, cfg.categories, cfg.steps
    );
    println!(
        "page size {} units, {} pages per disk",
        summary.page_unit, summary.pages_per_disk
    );
    println!();

    for (i, (peak, pages)) in summary.peaks.iter().zip(&summary.page_budget).enumerate() {
        let related: Vec<String> = summary.related[i]
            .iter()
            .take(3)
            .map(Tag::to_string)
            .collect();
        println!(
            "category {:>3}: peak {:>8} units, {:>5} pages, nearest {}",
            i + 1,
            peak,
            pages,
            related.join(" ")
        );
    }
    println!();

    for (d, ranges) in summary.disks.iter().enumerate() {
        println!("disk {}:", d + 1);
        for r in ranges {
            println!(
                "  [{:>6}..{:>6}]  category {:>3}  ({} units)",
                r.start,
                r.end,
                r.tag,
                r.len()
            );
        }
    }
}
