//! taskstore - ad hoc inspection of a store directory from the command line.
//!
//! `Store` is generic over `Record`, so a standalone binary with no compiled-in
//! domain types can only work with the JSONL files directly; it cannot run
//! `Store::list`/`compare_and_set` against an arbitrary collection name. This
//! covers the common ad hoc need: "what's actually on disk for this collection".

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use colored::Colorize;
use serde_json::Value;

/// Inspect a taskstore directory's JSONL collections
#[derive(Parser)]
#[command(name = "taskstore", about = "Inspect taskstore collections on disk")]
struct Cli {
    /// Path to the store directory
    #[arg(short, long, default_value = ".taskstore")]
    dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the collection files present in the store directory
    Collections,
    /// Print every row of a collection, pretty-printed, in append order
    Dump {
        /// Collection name (the JSONL file stem)
        collection: String,
    },
    /// Replay a collection and print the live (non-tombstoned) row count
    Count {
        /// Collection name (the JSONL file stem)
        collection: String,
    },
}

fn main() -> eyre::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Collections => {
            let mut names: Vec<String> = std::fs::read_dir(&cli.dir)
                .map(|entries| {
                    entries
                        .filter_map(|e| e.ok())
                        .filter_map(|e| e.path().file_stem().map(|s| s.to_string_lossy().into_owned()))
                        .collect()
                })
                .unwrap_or_default();
            names.sort();
            for name in names {
                println!("{name}");
            }
        }
        Command::Dump { collection } => {
            for line in read_jsonl(&cli.dir, &collection)? {
                match serde_json::from_str::<Value>(&line) {
                    Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                    Err(_) => println!("{}", line.dimmed()),
                }
            }
        }
        Command::Count { collection } => {
            let mut latest: std::collections::HashMap<String, (i64, bool)> = std::collections::HashMap::new();
            for line in read_jsonl(&cli.dir, &collection)? {
                let Ok(row) = serde_json::from_str::<Value>(&line) else {
                    continue;
                };
                let id = row["id"].as_str().unwrap_or_default().to_string();
                let updated_at = row["updated_at"].as_i64().unwrap_or(0);
                let deleted = row["deleted"].as_bool().unwrap_or(false);
                latest
                    .entry(id)
                    .and_modify(|(u, d)| {
                        if updated_at >= *u {
                            *u = updated_at;
                            *d = deleted;
                        }
                    })
                    .or_insert((updated_at, deleted));
            }
            let live = latest.values().filter(|(_, deleted)| !deleted).count();
            println!("{collection}: {live} live records");
        }
    }

    Ok(())
}

fn read_jsonl(dir: &std::path::Path, collection: &str) -> eyre::Result<Vec<String>> {
    let path = dir.join(format!("{collection}.jsonl"));
    if !path.exists() {
        println!("{}", format!("no such collection: {collection}").red());
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(&path)?;
    Ok(content.lines().filter(|l| !l.trim().is_empty()).map(String::from).collect())
}
