use clap::Parser;
use nexus_rag::{
    DataDir,
    IndexConfig,
    IndexStatus,
    LoadRequest,
    RetrievalService,
    TokenizerKind,
    error::{self, Error},
};
use serde_json::json;
use tracing_subscriber::EnvFilter;

pub mod cli;

use cli::{Cli, Command, IndexArgs, SearchArgs, StatusArgs, TokenizeArgs};

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("NEXUS_RAG_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() -> error::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);
    run(cli)
}

fn run(cli: Cli) -> error::Result<()> {
    if let Command::Completions(args) = &cli.command {
        args.generate();
        return Ok(());
    }

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;

    match cli.command {
        Command::Search(args) => block_on(cmd_search(&data_dir, &args))??,
        Command::Status(args) => block_on(cmd_status(&data_dir, &args))??,
        Command::Tokenize(args) => block_on(cmd_tokenize(&data_dir, &args))??,
        Command::Completions(_) => {}
    }

    Ok(())
}

fn block_on<F: std::future::Future>(future: F) -> error::Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| {
            Error::Config(format!("failed to start tokio runtime: {e}"))
        })?;
    Ok(runtime.block_on(future))
}

fn read_index_config(data_dir: &DataDir) -> error::Result<Option<IndexConfig>> {
    let path = data_dir.index_config();
    if !path.exists() {
        return Ok(None);
    }
    IndexConfig::open(&path).map(Some)
}

/// Data-dir defaults, then `rag_config.json`, then explicit flags.
fn load_request(
    data_dir: &DataDir,
    args: &IndexArgs,
) -> error::Result<LoadRequest> {
    let config = read_index_config(data_dir)?;
    let mut request = LoadRequest::from_data_dir(data_dir, config.as_ref());

    if let Some(index) = &args.index {
        request.index_path = index.clone();
    }
    if let Some(tokenizer) = &args.tokenizer {
        request.tokenizer_path = Some(tokenizer.clone());
    }
    if let Some(encoder) = &args.encoder {
        request.encoder_path = Some(encoder.clone());
    }
    if let Some(dim) = args.dim {
        request.embedding_dim = dim;
    }
    if let Some(prefix) = &args.query_prefix {
        request.query_prefix = Some(prefix.clone());
    }

    Ok(request)
}

async fn cmd_search(data_dir: &DataDir, args: &SearchArgs) -> error::Result<()> {
    let service = RetrievalService::new()?;
    service.load_index(load_request(data_dir, &args.index)?).await?;

    let result = service.search(&args.query, args.count).await;
    service.shutdown().await?;
    let ids = result?;

    if args.json {
        println!(
            "{}",
            json!({
                "query": args.query,
                "result_count": ids.len(),
                "ids": ids,
            })
        );
    } else if ids.is_empty() {
        println!("No results found.");
    } else {
        for (rank, id) in ids.iter().enumerate() {
            println!("{:>3}. document {id}", rank + 1);
        }
        println!("\n{} result(s)", ids.len());
    }
    Ok(())
}

async fn cmd_status(data_dir: &DataDir, args: &StatusArgs) -> error::Result<()> {
    let service = RetrievalService::new()?;
    let loaded = service.load_index(load_request(data_dir, &args.index)?).await;
    let status = service.status().await?;
    service.shutdown().await?;

    if let Err(e) = &loaded {
        tracing::warn!(error = %e, "index did not load");
    }
    print_status(data_dir, &status, args.json);
    loaded.map(|_| ())
}

fn print_status(data_dir: &DataDir, status: &IndexStatus, json: bool) {
    let tokenizer = status.tokenizer.map(|k| k.to_string());
    if json {
        println!(
            "{}",
            json!({
                "data_dir": data_dir.root().display().to_string(),
                "state": status.state.to_string(),
                "num_vectors": status.num_vectors,
                "dimension": status.dimension,
                "tokenizer": tokenizer,
                "encoder": status.has_encoder,
                "query_prefix": status.query_prefix,
            })
        );
    } else {
        println!("Data dir:     {}", data_dir.root().display());
        println!("State:        {}", status.state);
        println!("Vectors:      {}", status.num_vectors);
        println!("Dimension:    {}", status.dimension);
        println!("Tokenizer:    {}", tokenizer.as_deref().unwrap_or("-"));
        println!(
            "Encoder:      {}",
            if status.has_encoder { "loaded" } else { "unavailable" }
        );
        if let Some(prefix) = &status.query_prefix {
            println!("Query prefix: {prefix:?}");
        }
    }
}

async fn cmd_tokenize(
    data_dir: &DataDir,
    args: &TokenizeArgs,
) -> error::Result<()> {
    let service = RetrievalService::new()?;
    let loaded = service.load_index(load_request(data_dir, &args.index)?).await;
    let ids = service.tokenize(&args.text).await;
    service.shutdown().await?;

    let kind = loaded?.tokenizer.unwrap_or(TokenizerKind::Fallback);
    let ids = ids?;

    if args.json {
        println!(
            "{}",
            json!({
                "text": args.text,
                "tokenizer": kind.to_string(),
                "ids": ids,
            })
        );
    } else {
        let ids: Vec<String> = ids.iter().map(u32::to_string).collect();
        println!("[{kind}] {}", ids.join(" "));
    }
    Ok(())
}
