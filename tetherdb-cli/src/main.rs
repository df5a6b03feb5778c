use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process;
use tetherdb::schema::parse_schema;
use tetherdb::{build_graph, Graph, Selector};

/// tetherdb CLI: inspect schemas and selector expressions
#[derive(Parser)]
#[command(name = "tetherdb", version, about)]
struct Cli {
    /// Output format
    #[arg(long, default_value = "yaml")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Yaml,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Print the compiled dependency graph of a schema
    Graph {
        /// Schema file (YAML or JSON)
        schema: PathBuf,
    },

    /// Check that a schema compiles
    Check {
        /// Schema file (YAML or JSON)
        schema: PathBuf,
    },

    /// List the foreign keys pointing at a collection, with their delete policies
    References {
        /// Schema file (YAML or JSON)
        schema: PathBuf,
        /// Referenced collection
        collection: String,
    },

    /// Parse a selector expression and print it back in canonical form
    Selector {
        /// Selector expression (e.g. "favoriteBooks $ {title, author name}")
        expr: String,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("ERROR:{e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Graph { schema } => {
            let graph = load_graph(&schema)?;
            print_output(&serde_json::to_value(&graph)?, &cli.format)?;
        }

        Command::Check { schema } => {
            let graph = load_graph(&schema)?;
            let foreign_keys: usize = graph
                .collections()
                .map(|(_, config)| config.foreign_keys.len())
                .sum();
            print_output(
                &json!({
                    "ok": true,
                    "collections": graph.len(),
                    "foreignKeys": foreign_keys,
                }),
                &cli.format,
            )?;
        }

        Command::References { schema, collection } => {
            let graph = load_graph(&schema)?;
            let Some(config) = graph.get(&collection) else {
                return Err(format!("Collection '{collection}' not found in schema").into());
            };
            let references: Vec<serde_json::Value> = config
                .references
                .iter()
                .flat_map(|(owner, foreign_keys)| {
                    foreign_keys.iter().map(move |(key, fk)| {
                        json!({
                            "collection": owner,
                            "foreignKey": key,
                            "onDelete": fk.on_delete.as_str(),
                            "nullable": fk.nullable,
                            "optional": fk.optional,
                        })
                    })
                })
                .collect();
            print_output(&serde_json::Value::Array(references), &cli.format)?;
        }

        Command::Selector { expr } => {
            let selector: Selector = expr.parse()?;
            print_output(
                &json!({
                    "selector": selector.to_string(),
                    "tree": format!("{selector:#?}"),
                }),
                &cli.format,
            )?;
        }
    }

    Ok(())
}

fn load_graph(path: &Path) -> Result<Graph, Box<dyn std::error::Error>> {
    let schema = parse_schema(path)
        .map_err(|e| format!("Failed to load schema '{}': {e}", path.display()))?;
    log::debug!("Loaded {} collections from {}", schema.len(), path.display());
    Ok(build_graph(&schema)?)
}

fn print_output(
    value: &serde_json::Value,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(value)?);
        }
        OutputFormat::Yaml => {
            print!("{}", serde_yaml::to_string(value)?);
        }
    }
    Ok(())
}
