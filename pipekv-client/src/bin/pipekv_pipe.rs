//! # Pipeline Command-Line Tool
//!
//! Purpose: Read one command per stdin line, send them all as a single
//! pipeline, and print the replies in order.
//!
//! ```text
//! printf 'SET k 1\nINCR k\nGET k\n' | pipekv-pipe 127.0.0.1:6379
//! pipekv-pipe --config client.json < commands.txt
//! ```
//!
//! Set `RUST_LOG=pipekv_client=debug` to see pool and retry activity.

use std::env;
use std::fs;
use std::io::{self, BufRead};

use anyhow::{bail, Context, Result};
use pipekv_client::{ClientConfig, Command, KVClient, RespValue};
use tracing_subscriber::EnvFilter;

fn main() {
    if let Err(err) = run() {
        eprintln!("pipekv-pipe failed: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let config = config_from_args()?;
    let client = KVClient::with_config(config);
    let mut pipeline = client.pipeline();

    for line in io::stdin().lock().lines() {
        let line = line.context("reading stdin")?;
        let mut words = line.split_whitespace();
        let Some(name) = words.next() else {
            continue;
        };
        let command = words.fold(Command::new(name), |command, word| command.arg(word));
        pipeline.cmd(command);
    }

    for reply in pipeline.execute().context("executing pipeline")? {
        match reply {
            Ok(value) => println!("{}", render(&value, 0)),
            Err(err) => println!("(protocol error) {err}"),
        }
    }
    Ok(())
}

fn config_from_args() -> Result<ClientConfig> {
    let mut args = env::args().skip(1);
    let mut config = ClientConfig::default();
    while let Some(arg) = args.next() {
        if arg == "--config" {
            let Some(path) = args.next() else {
                bail!("--config needs a file path");
            };
            let raw = fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
            config = ClientConfig::from_json(&raw).with_context(|| format!("parsing {path}"))?;
        } else {
            config.addr = arg;
        }
    }
    Ok(config)
}

/// Formats a reply the way redis-cli does.
fn render(value: &RespValue, depth: usize) -> String {
    match value {
        RespValue::Simple(text) => String::from_utf8_lossy(text).into_owned(),
        RespValue::Error(message) => format!("(error) {}", String::from_utf8_lossy(message)),
        RespValue::Integer(value) => format!("(integer) {value}"),
        RespValue::Bulk(Some(data)) => format!("{:?}", String::from_utf8_lossy(data)),
        RespValue::Bulk(None) | RespValue::Array(None) => "(nil)".to_string(),
        RespValue::Array(Some(items)) if items.is_empty() => "(empty array)".to_string(),
        RespValue::Array(Some(items)) => {
            let indent = " ".repeat(depth * 3);
            items
                .iter()
                .enumerate()
                .map(|(idx, item)| {
                    let prefix = if idx == 0 { String::new() } else { indent.clone() };
                    format!("{prefix}{}) {}", idx + 1, render(item, depth + 1))
                })
                .collect::<Vec<_>>()
                .join("\n")
        }
    }
}
