use std::env;
use std::path::PathBuf;

use lumen_cli::{build, load_corpus};
use lumen_core::config::Config;
use lumen_core::types::Query;
use tracing_subscriber::EnvFilter;

fn usage(prog: &str) -> ! {
    eprintln!("Usage: {} <query|stats|health> [args...]", prog);
    eprintln!("  {} query <docs.jsonl> \"<query>\"   index the documents, then answer the query", prog);
    eprintln!("  {} stats <docs.jsonl>             index the documents, then print engine stats", prog);
    eprintln!("  {} health                         check the configured backend", prog);
    std::process::exit(1)
}

fn parse_args() -> (String, String, Vec<String>) {
    let mut args: Vec<String> = env::args().collect();
    let prog = args.remove(0);
    if args.is_empty() {
        usage(&prog);
    }
    let cmd = args.remove(0);
    (prog, cmd, args)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load().map_err(|e| {
        eprintln!("Error loading config: {}", e);
        e
    })?;
    let app = config.app()?;
    let (prog, cmd, args) = parse_args();
    let runtime = build(&app).await?;

    match cmd.as_str() {
        "query" => {
            let (Some(docs), Some(_)) = (args.first(), args.get(1)) else { usage(&prog) };
            let corpus = load_corpus(&PathBuf::from(docs))?;
            runtime.ingest(&corpus).await?;
            let result = runtime.processor.process(Query::new(args[1..].join(" "))).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        "stats" => {
            let Some(docs) = args.first() else { usage(&prog) };
            runtime.ingest(&load_corpus(&PathBuf::from(docs))?).await?;
            println!("{}", serde_json::to_string_pretty(&runtime.engine.stats().await?)?);
        }
        "health" => {
            let health = runtime.processor.health().await;
            println!("{}", serde_json::to_string_pretty(&health)?);
            if !health.backend.healthy {
                std::process::exit(2);
            }
        }
        _ => {
            eprintln!("Unknown command: {}", cmd);
            usage(&prog);
        }
    }
    Ok(())
}
