use anyhow::{bail, Context, Result};
use std::env;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use txn_categorizer::{
    load_default_backend, CategorizationEngine, CategorizeRequest, EngineConfig, ManualOverride,
    Store,
};

const USAGE: &str = "\
Usage: txn-categorizer <command> [args]

Commands:
  categorize <description> [--amount N] [--merchant M] [--account-type T] [--no-ai] [--no-semantic]
  override <transaction-id> <category> <subcategory> <description> [--merchant M] [--amount N] [--no-train]
  import-samples <file.csv>
  retrain [--if-needed]
  stats
  audit
  categories [<category>]

Environment:
  CATEGORIZER_CONFIG  config file (default config/categorizer.json)
  CATEGORIZER_DB      SQLite database (default categorizer.db)
  RUST_LOG            log filter (default info)";

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let Some(command) = args.first() else {
        println!("{}", USAGE);
        return Ok(());
    };
    let rest = &args[1..];

    match command.as_str() {
        "categorize" => run_categorize(rest),
        "override" => run_override(rest),
        "import-samples" => run_import(rest),
        "retrain" => run_retrain(rest),
        "stats" => run_stats(),
        "audit" => run_audit(),
        "categories" => run_categories(rest),
        "help" | "--help" | "-h" => {
            println!("{}", USAGE);
            Ok(())
        }
        other => bail!("unknown command '{}'\n\n{}", other, USAGE),
    }
}

// ============================================================================
// Setup
// ============================================================================

fn config_path() -> PathBuf {
    env::var("CATEGORIZER_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config/categorizer.json"))
}

fn db_path() -> PathBuf {
    env::var("CATEGORIZER_DB")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("categorizer.db"))
}

fn open_engine() -> Result<CategorizationEngine> {
    let config_path = config_path();
    let config = EngineConfig::from_file(&config_path)
        .with_context(|| format!("loading config from {:?}", config_path))?;

    let db_path = db_path();
    let store = Store::open(&db_path).with_context(|| format!("opening database {:?}", db_path))?;

    let backend = load_default_backend(&config.embedding_model);
    CategorizationEngine::new(config, store, backend).context("building categorization engine")
}

// ============================================================================
// Argument helpers
// ============================================================================

/// Value following `flag`, if present
fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

/// Arguments that are neither flags nor flag values
fn positional(args: &[String]) -> Vec<&str> {
    const VALUED: [&str; 3] = ["--amount", "--merchant", "--account-type"];
    let mut out = Vec::new();
    let mut skip_next = false;
    for arg in args {
        if skip_next {
            skip_next = false;
        } else if VALUED.contains(&arg.as_str()) {
            skip_next = true;
        } else if !arg.starts_with("--") {
            out.push(arg.as_str());
        }
    }
    out
}

fn parse_amount(args: &[String]) -> Result<Option<f64>> {
    flag_value(args, "--amount")
        .map(|v| {
            v.parse::<f64>()
                .with_context(|| format!("invalid --amount '{}'", v))
        })
        .transpose()
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ============================================================================
// Commands
// ============================================================================

fn run_categorize(args: &[String]) -> Result<()> {
    let description = positional(args).join(" ");
    if description.is_empty() {
        bail!("categorize needs a description\n\n{}", USAGE);
    }

    let mut request = CategorizeRequest::new(description)
        .use_ai(!has_flag(args, "--no-ai"))
        .use_semantic(!has_flag(args, "--no-semantic"));
    request.amount = parse_amount(args)?;
    request.merchant = flag_value(args, "--merchant").map(str::to_string);
    request.account_type = flag_value(args, "--account-type").map(str::to_string);

    let engine = open_engine()?;
    print_json(&engine.categorize(&request))
}

fn run_override(args: &[String]) -> Result<()> {
    let pos = positional(args);
    if pos.len() < 4 {
        bail!(
            "override needs <transaction-id> <category> <subcategory> <description>\n\n{}",
            USAGE
        );
    }

    let mut correction = ManualOverride::new(pos[0], pos[1], pos[2], pos[3..].join(" "));
    correction.merchant = flag_value(args, "--merchant").map(str::to_string);
    correction.amount = parse_amount(args)?;
    if has_flag(args, "--no-train") {
        correction = correction.without_training();
    }

    let engine = open_engine()?;
    let outcome = engine.register_manual_override(&correction)?;

    // Background retraining would die with the process; wait for it
    if outcome.retrain_scheduled {
        if let Some(handle) = engine.spawn_retraining() {
            let result = handle
                .join()
                .map_err(|_| anyhow::anyhow!("retraining worker panicked"))?;
            return print_json(&serde_json::json!({
                "override": outcome,
                "retrain": result,
            }));
        }
    }
    print_json(&outcome)
}

fn run_import(args: &[String]) -> Result<()> {
    let Some(path) = positional(args).first().copied() else {
        bail!("import-samples needs a CSV path\n\n{}", USAGE);
    };

    let engine = open_engine()?;
    let report = engine
        .import_training_csv(path)
        .with_context(|| format!("importing {}", path))?;

    println!("📂 Imported {} samples ({} skipped)", report.imported, report.skipped);
    Ok(())
}

fn run_retrain(args: &[String]) -> Result<()> {
    let engine = open_engine()?;

    let result = if has_flag(args, "--if-needed") {
        match engine.retrain_if_needed() {
            Some(result) => result,
            None => {
                println!("✓ No retraining needed");
                return Ok(());
            }
        }
    } else {
        engine.trigger_retraining_now()
    };

    print_json(&result)?;
    if !result.success {
        std::process::exit(2);
    }
    Ok(())
}

fn run_stats() -> Result<()> {
    let engine = open_engine()?;
    print_json(&serde_json::json!({
        "engine": engine.get_stats(),
        "pipeline": engine.pipeline_stats(),
        "semantic": engine.semantic_stats(),
    }))
}

fn run_audit() -> Result<()> {
    let engine = open_engine()?;
    print_json(&engine.audit_log()?)
}

fn run_categories(args: &[String]) -> Result<()> {
    let engine = open_engine()?;
    match positional(args).first() {
        Some(category) => print_json(&engine.get_subcategories(category)),
        None => print_json(&engine.get_categories()),
    }
}
