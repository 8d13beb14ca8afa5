use kelpdb::config::{KelpConfig, RuntimeConfig};
use kelpdb::engine::StoreEngine;
use kelpdb::engine::file::FileEngine;
use kelpdb::registry::Registry;
use std::path::Path;

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        return Err("missing command".into());
    }
    match args[1].as_str() {
        "inspect" => cmd_inspect(&args[2..]),
        "check" => match args.get(2).map(String::as_str) {
            Some("schema") => cmd_check_schema(&args[3..]),
            Some(other) => Err(format!("unknown check command: {other}")),
            None => Err("missing check subcommand".into()),
        },
        other => {
            print_usage();
            Err(format!("unknown top-level command: {other}"))
        }
    }
}

fn cmd_inspect(args: &[String]) -> Result<(), String> {
    let store = parse_flag_value(args, "--store").ok_or("--store is required")?;
    let path = existing_store(&store)?;
    let config = KelpConfig::new(path).map_err(|e| format!("config: {e}"))?;
    let engine = FileEngine::new(1);
    let mut connection = engine
        .connect(&config)
        .map_err(|e| format!("open {}: {e}", config.path().display()))?;
    let snapshot = connection.snapshot();
    println!(
        "{}\t{}\t{}",
        config.path().display(),
        snapshot.version(),
        snapshot
            .schema_version()
            .map(|v| v.to_string())
            .unwrap_or_else(|| "unversioned".into())
    );
    for name in snapshot.table_names() {
        let table = snapshot.table(name).map_err(|e| e.to_string())?;
        println!("table\t{name}\t{}\t{}", table.len(), table.next_id());
    }
    connection.close().map_err(|e| format!("close: {e}"))?;
    Ok(())
}

fn cmd_check_schema(args: &[String]) -> Result<(), String> {
    let store = parse_flag_value(args, "--store").ok_or("--store is required")?;
    let version = parse_flag_value(args, "--schema-version")
        .ok_or("--schema-version is required")?
        .parse::<u64>()
        .map_err(|e| format!("invalid --schema-version: {e}"))?;
    let path = existing_store(&store)?;
    let mut config = KelpConfig::new(path)
        .map_err(|e| format!("config: {e}"))?
        .with_schema_version(version);
    for table in parse_flag_values(args, "--table") {
        config = config.with_table(table);
    }
    let registry = Registry::with_file_engine(RuntimeConfig::single_worker())
        .map_err(|e| format!("registry: {e}"))?;
    match registry.open(config) {
        Ok(handle) => {
            println!("ok\t{}", version);
            handle.close().map_err(|e| format!("close: {e}"))
        }
        Err(e) => {
            println!("{}\t{e}", e.code_str());
            Err("schema check failed".into())
        }
    }
}

fn existing_store(store: &str) -> Result<&Path, String> {
    let path = Path::new(store);
    if !path.is_file() {
        return Err(format!("store file not found: {store}"));
    }
    Ok(path)
}

fn parse_flag_value(args: &[String], flag: &str) -> Option<String> {
    for idx in 0..args.len() {
        if args[idx] == flag {
            return args.get(idx + 1).cloned();
        }
    }
    None
}

fn parse_flag_values(args: &[String], flag: &str) -> Vec<String> {
    args.windows(2)
        .filter(|pair| pair[0] == flag)
        .map(|pair| pair[1].clone())
        .collect()
}

fn print_usage() {
    eprintln!("usage:");
    eprintln!("  kelp inspect --store <file.kelp>");
    eprintln!(
        "  kelp check schema --store <file.kelp> --schema-version <n> [--table <name>]..."
    );
}
