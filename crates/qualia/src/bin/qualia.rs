//! Qualia CLI - local content-addressed object and metadata store.
//!
//! Command surface kept stable for existing users; this binary is a thin
//! wrapper over [`qualia::Database`] plus terminal-facing formatting.

use clap::{Parser, Subcommand};
use colored::Colorize;
use qualia::{config, Database, FieldType, Object, ObjectRef, QualiaError};
use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "qualia")]
#[command(about = "Local content-addressed object and metadata store", long_about = None)]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Path to the store (directory layout, or a `.qualia` file for single-file mode)
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Path to a YAML config file, overriding `$XDG_CONFIG_HOME/qualia.yaml`
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy one or more files into the store
    Add { files: Vec<PathBuf> },

    /// Move one or more files into the store, removing the source on success
    Take {
        /// Copy instead of moving, same as `add`
        #[arg(long)]
        restore: bool,
        files: Vec<PathBuf>,
    },

    /// Delete one or more objects by hash
    #[command(alias = "rm")]
    Delete { hashes: Vec<String> },

    /// Edit an object's metadata in $EDITOR/$VISUAL
    Edit {
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        verbose: bool,
        hash: String,
    },

    /// Exit 0 iff HASH resolves uniquely
    Exists { hash: String },

    /// Write an export archive
    Export {
        #[arg(long)]
        all: bool,
        #[arg(long)]
        metadata_only: bool,
        #[arg(short, long)]
        output: Option<PathBuf>,
        hashes: Vec<String>,
    },

    /// Read an export archive
    Import {
        #[arg(long = "rename", value_parser = parse_rename)]
        renames: Vec<(String, String)>,
        file: PathBuf,
    },

    /// List hashes with the given prefix
    FindHashes { prefix: String },

    /// Run a query against the store
    Search {
        #[arg(short = 'f', long, default_value = "short_hash")]
        format: String,
        #[arg(short = 'l', long)]
        long: bool,
        #[arg(short = 'n', long)]
        limit: Option<usize>,
        query: Vec<String>,
    },

    /// Set a single field on an object
    Set { hash: String, field: String, value: String },

    /// Print one or more objects
    Show {
        #[arg(short = 'f', long, default_value = "short_hash")]
        format: String,
        #[arg(short = 'l', long)]
        long: bool,
        hashes: Vec<String>,
    },

    /// Shorthand for adding a value to the `tags` field
    Tag { hash: String, tag: String },

    /// Revert the most recent checkpoint, or a specific one
    Undo { checkpoint_id: Option<i64> },

    /// Show checkpoint history
    Log,

    /// Dump raw internal state
    Dump {
        #[command(subcommand)]
        what: DumpWhat,
    },

    /// Inspect the declared field schema
    Field {
        #[command(subcommand)]
        what: FieldWhat,
    },
}

#[derive(Subcommand)]
enum DumpWhat {
    Journal,
    Metadata,
}

#[derive(Subcommand)]
enum FieldWhat {
    List,
}

fn parse_rename(s: &str) -> Result<(String, String), String> {
    let (from, to) = s.split_once('=').ok_or_else(|| format!("expected FROM=TO, got {s:?}"))?;
    Ok((from.to_string(), to.to_string()))
}

fn default_db_path() -> PathBuf {
    let data_home = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs::home_dir().unwrap_or_default().join(".local").join("share"));
    data_home.join("qualia")
}

/// Resolve the store path to open: `--db-path` wins outright; otherwise fall back to
/// `database_path` in the config file (`--config`, or `$XDG_CONFIG_HOME/qualia.yaml`),
/// and finally to the XDG data directory.
fn resolve_db_path(cli_db_path: Option<PathBuf>, config_path: Option<PathBuf>) -> Result<PathBuf, QualiaError> {
    if let Some(path) = cli_db_path {
        return Ok(path);
    }

    let config_path = config_path.unwrap_or_else(config::default_config_path);
    let merged = config::load_merged(&config_path, &config::schema())?;
    if let Some(configured) = merged.get("database_path").and_then(|v| v.as_str()) {
        if !configured.is_empty() {
            return Ok(PathBuf::from(configured));
        }
    }

    Ok(default_db_path())
}

fn render_object(db: &Database, object: &Object, format: &str) -> Result<String, QualiaError> {
    let hash_display = object.hash.as_deref().unwrap_or("-");
    Ok(match format {
        "filename" => object
            .properties
            .get("filename")
            .and_then(|v| v.as_str())
            .unwrap_or(hash_display)
            .to_string(),
        "hash" => hash_display.to_string(),
        "long" => format!("{hash_display}  {}", serde_json::to_string(&object.properties).unwrap_or_default()),
        _ => match &object.hash {
            Some(hash) => db.shortest_hash(hash)?,
            None => hash_display.to_string(),
        },
    })
}

fn print_error(err: &QualiaError) {
    let line = format!("qualia: {err}");
    if std::io::stderr().is_terminal() {
        eprintln!("{}", line.red());
    } else {
        eprintln!("{line}");
    }
}

fn run(cli: Cli) -> Result<ExitCode, QualiaError> {
    let db_path = resolve_db_path(cli.db_path, cli.config)?;

    match cli.command {
        Commands::Add { files } => {
            let mut db = Database::open(&db_path, false)?;
            for file in &files {
                let hash = db.add_file(file)?;
                println!("{}", db.shortest_hash(&hash)?);
            }
            db.commit()?;
        }

        Commands::Take { restore, files } => {
            let mut db = Database::open(&db_path, false)?;
            for file in &files {
                let hash = if restore { db.add_file(file)? } else { db.take_file(file)? };
                println!("{}", db.shortest_hash(&hash)?);
            }
            db.commit()?;
        }

        Commands::Delete { hashes } => {
            let mut db = Database::open(&db_path, false)?;
            for hash in &hashes {
                db.delete(&ObjectRef::hash(hash.clone()))?;
            }
            db.commit()?;
        }

        Commands::Edit { dry_run, verbose, hash } => {
            let mut db = Database::open(&db_path, false)?;
            let object = db.get(&ObjectRef::hash(hash))?;
            let yaml = serde_yaml::to_string(&object.properties).unwrap_or_default();

            let editor = std::env::var("VISUAL").or_else(|_| std::env::var("EDITOR")).unwrap_or_else(|_| "vi".to_string());
            let tmp = std::env::temp_dir().join(format!("qualia-edit-{}.yaml", object.object_id));
            std::fs::write(&tmp, &yaml)?;

            let status = std::process::Command::new(&editor).arg(&tmp).status();
            let edited = std::fs::read_to_string(&tmp).unwrap_or(yaml);
            let _ = std::fs::remove_file(&tmp);

            if status.map(|s| s.success()).unwrap_or(false) {
                let patch: serde_json::Value =
                    serde_yaml::from_str(&edited).map_err(|e| QualiaError::Config(e.to_string()))?;
                if verbose {
                    eprintln!("applying patch: {patch}");
                }
                if dry_run {
                    println!("{patch}");
                } else {
                    db.update(&ObjectRef::Id(object.object_id), &patch)?;
                    db.commit()?;
                }
            }
        }

        Commands::Exists { hash } => {
            let db = Database::open(&db_path, true)?;
            return Ok(match db.get(&ObjectRef::hash(hash)) {
                Ok(_) => ExitCode::SUCCESS,
                Err(_) => ExitCode::FAILURE,
            });
        }

        Commands::Export { all, metadata_only, output, hashes } => {
            let db = Database::open(&db_path, true)?;
            let selected = if all || hashes.is_empty() { None } else { Some(hashes.as_slice()) };
            match output {
                Some(path) => db.export(selected, metadata_only, std::fs::File::create(path)?)?,
                None => db.export(selected, metadata_only, std::io::stdout())?,
            }
        }

        Commands::Import { renames, file } => {
            let mut db = Database::open(&db_path, false)?;
            let rename_map: BTreeMap<String, String> = renames.into_iter().collect();
            let summary = db.import(std::fs::File::open(file)?, &rename_map)?;
            println!("added {}, already present {}", summary.added, summary.already_present);
        }

        Commands::FindHashes { prefix } => {
            let db = Database::open(&db_path, true)?;
            for hash in db.find_hashes(&prefix)? {
                println!("{hash}");
            }
        }

        Commands::Search { format, long, limit, query } => {
            let db = Database::open(&db_path, true)?;
            let format = if long { "long" } else { format.as_str() };
            let query_str = query.join(", ");
            let mut results = db.select(&query_str)?;
            if let Some(limit) = limit {
                results.truncate(limit);
            }
            for object in &results {
                println!("{}", render_object(&db, object, format)?);
            }
        }

        Commands::Set { hash, field, value } => {
            let mut db = Database::open(&db_path, false)?;
            let parsed = parse_field_value(&db, &field, &value)?;
            db.set(&ObjectRef::hash(hash), &field, parsed)?;
            db.commit()?;
        }

        Commands::Show { format, long, hashes } => {
            let db = Database::open(&db_path, true)?;
            let format = if long { "long" } else { format.as_str() };
            for hash in &hashes {
                let object = db.get(&ObjectRef::hash(hash.clone()))?;
                println!("{}", render_object(&db, &object, format)?);
            }
        }

        Commands::Tag { hash, tag } => {
            let mut db = Database::open(&db_path, false)?;
            let object = db.get(&ObjectRef::hash(hash.clone()))?;
            let mut tags: Vec<&str> = object
                .properties
                .get("tags")
                .and_then(|v| v.as_str())
                .map(|s| s.split_whitespace().collect())
                .unwrap_or_default();
            if !tags.contains(&tag.as_str()) {
                tags.push(&tag);
            }
            db.set(&ObjectRef::hash(hash), "tags", serde_json::Value::String(tags.join(" ")))?;
            db.commit()?;
        }

        Commands::Undo { checkpoint_id } => {
            let mut db = Database::open(&db_path, false)?;
            match db.undo(checkpoint_id)? {
                Some(id) => println!("reverted checkpoint {id}"),
                None => println!("nothing to undo"),
            }
        }

        Commands::Log => {
            let db = Database::open(&db_path, true)?;
            for change in db.dump_journal(qualia_journal::Order::Descending)? {
                println!("{} {} {:?} {}", change.serial, change.timestamp.to_rfc3339(), change.action, change.object_key);
            }
        }

        Commands::Dump { what } => {
            let db = Database::open(&db_path, true)?;
            match what {
                DumpWhat::Journal => {
                    for change in db.dump_journal(qualia_journal::Order::Ascending)? {
                        println!("{}", serde_yaml::to_string(&change).unwrap_or_default());
                    }
                }
                DumpWhat::Metadata => {
                    for object in db.dump_metadata()? {
                        let mut map = match object.properties {
                            serde_json::Value::Object(map) => map,
                            _ => serde_json::Map::new(),
                        };
                        map.insert("object_id".to_string(), serde_json::json!(object.object_id));
                        if let Some(hash) = &object.hash {
                            map.insert("hash".to_string(), serde_json::json!(hash));
                        }
                        println!("{}", serde_yaml::to_string(&map).unwrap_or_default());
                    }
                }
            }
        }

        Commands::Field { what } => match what {
            FieldWhat::List => {
                let db = Database::open(&db_path, true)?;
                for field in db.fields() {
                    println!(
                        "{}\t{}\t{}",
                        field.name,
                        field.field_type.as_str(),
                        if field.read_only { "read-only" } else { "writable" }
                    );
                }
            }
        },
    }

    Ok(ExitCode::SUCCESS)
}

fn parse_field_value(db: &Database, field: &str, raw: &str) -> Result<serde_json::Value, QualiaError> {
    let descriptor = db.fields().find(|f| f.name == field || f.aliases.iter().any(|a| a == field));
    let field_type = descriptor.map(|d| d.field_type).unwrap_or(FieldType::Text);
    Ok(match field_type {
        FieldType::Number => serde_json::Value::from(raw.parse::<f64>().map_err(|_| QualiaError::InvalidFieldValue {
            field: field.to_string(),
            message: "not a number".to_string(),
        })?),
        _ => serde_json::Value::String(raw.to_string()),
    })
}

fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("qualia=info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            print_error(&err);
            ExitCode::FAILURE
        }
    }
}
