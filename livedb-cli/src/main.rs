use clap::{Parser, Subcommand, ValueEnum};
use livedb::schema::parse_schema;
use livedb::{
    Database, DatabaseConfig, Direction, LiveDbError, Matcher, Model, ModelSchema, QueryBuilder,
    SchemaRegistry, SortOrder,
};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

/// livedb CLI: inspect and edit a livedb cache from the command line
#[derive(Parser)]
#[command(name = "livedb", version, about)]
struct Cli {
    /// Database config file (YAML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// SQLite file, overrides the config's `path`
    #[arg(long)]
    database: Option<PathBuf>,

    /// Model schema file (YAML)
    #[arg(long)]
    schema: Option<PathBuf>,

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
    /// Create tables for every model and stamp the schema version
    Setup,

    /// Get a single model by ID
    Find {
        /// Model class
        class: String,
        /// Model ID
        id: String,
    },

    /// List models of a class
    List {
        /// Model class
        class: String,
        /// Equality filters (e.g. --where accountId=a)
        #[arg(long = "where", value_parser = parse_key_value)]
        filters: Vec<(String, String)>,
        /// Sort orders (e.g. --order ts:desc)
        #[arg(long = "order")]
        orders: Vec<String>,
        #[arg(long)]
        limit: Option<u64>,
        #[arg(long)]
        offset: Option<u64>,
    },

    /// Count models of a class
    Count {
        /// Model class
        class: String,
        /// Equality filters (e.g. --where accountId=a)
        #[arg(long = "where", value_parser = parse_key_value)]
        filters: Vec<(String, String)>,
    },

    /// Insert or replace a model
    Put {
        /// Model class
        class: String,
        /// Model ID (a temporary one is generated if omitted)
        #[arg(long)]
        id: Option<String>,
        /// Field values by JSON key (e.g. --field subject="Hello")
        #[arg(long = "field", value_parser = parse_key_value)]
        fields: Vec<(String, String)>,
    },

    /// Delete a model
    Delete {
        /// Model class
        class: String,
        /// Model ID
        id: String,
    },

    /// Print a query's results every time they change, until interrupted
    Watch {
        /// Model class
        class: String,
        #[arg(long = "where", value_parser = parse_key_value)]
        filters: Vec<(String, String)>,
        #[arg(long = "order")]
        orders: Vec<String>,
        #[arg(long)]
        limit: Option<u64>,
        #[arg(long)]
        offset: Option<u64>,
    },

    /// Refresh SQLite statistics for every model table
    Analyze,

    /// Delete the database file and its WAL companions
    Reset,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let pos = s.find('=').ok_or_else(|| {
        format!("Invalid key=value pair: no '=' found in '{s}'")
    })?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("ERROR:{e}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => DatabaseConfig::load(path)?,
        None => DatabaseConfig::default(),
    };
    if let Some(path) = cli.database {
        config.path = Some(path);
    }

    if let Command::Reset = cli.command {
        let path = config
            .path
            .ok_or("reset needs a file-backed database (--database or config path)")?;
        livedb::delete_database_files(&path)?;
        print_output(&serde_json::json!({ "ok": true, "deleted": path.display().to_string() }), &cli.format)?;
        return Ok(());
    }

    let mut registry = SchemaRegistry::builder();
    if let Some(path) = &cli.schema {
        registry = registry.definition(&parse_schema(path)?)?;
    }
    let db = Database::open(config, registry.build()?).await?;

    match cli.command {
        Command::Setup => {
            let classes: Vec<&str> = db.registry().classes().collect();
            print_output(
                &serde_json::json!({ "ok": true, "version": db.config().version, "classes": classes }),
                &cli.format,
            )?;
        }

        Command::Find { class, id } => {
            let model = db.find(&class, &id).await?;
            print_output(&model.map(|m| m.to_json(true)).unwrap_or_default(), &cli.format)?;
        }

        Command::List {
            class,
            filters,
            orders,
            limit,
            offset,
        } => {
            let schema = db.schema(&class)?;
            let query = list_query(&schema, &filters, &orders, limit, offset)?.build()?;
            let models = db.find_all(&query).await?;
            print_output(&models_json(models.iter()), &cli.format)?;
        }

        Command::Count { class, filters } => {
            let schema = db.schema(&class)?;
            let query = QueryBuilder::count(schema.clone())
                .where_all(matchers(&schema, &filters)?)
                .build()?;
            let count = db.count(&query).await?;
            print_output(&serde_json::json!({ "count": count }), &cli.format)?;
        }

        Command::Put { class, id, fields } => {
            let schema = db.schema(&class)?;
            let mut data = fields_to_value(&fields);
            if let (Some(id), serde_json::Value::Object(map)) = (id, &mut data) {
                map.insert("id".to_string(), serde_json::Value::String(id));
            }
            let model = Model::from_json(schema, &data)?;
            let saved = model.clone();
            db.in_transaction(|t| async move { t.persist_model(saved).await })
                .await?;
            print_output(&model.to_json(true), &cli.format)?;
        }

        Command::Delete { class, id } => {
            let model = db
                .find(&class, &id)
                .await?
                .ok_or_else(|| format!("{class} {id} not found"))?;
            db.in_transaction(|t| async move { t.unpersist_model(model).await })
                .await?;
            print_output(&serde_json::json!({ "ok": true, "deleted": id }), &cli.format)?;
        }

        Command::Watch {
            class,
            filters,
            orders,
            limit,
            offset,
        } => {
            let schema = db.schema(&class)?;
            let query = list_query(&schema, &filters, &orders, limit, offset)?.build()?;
            let mut live = db.subscribe(query)?;
            loop {
                tokio::select! {
                    next = live.recv() => match next {
                        Some(Ok(set)) => {
                            print_output(&models_json(set.models().into_iter()), &cli.format)?;
                            if matches!(cli.format, OutputFormat::Yaml) {
                                println!("---");
                            }
                        }
                        Some(Err(e)) => log::error!("Live query failed: {e}"),
                        None => break,
                    },
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }

        Command::Analyze => {
            db.analyze().await?;
            print_output(&serde_json::json!({ "ok": true, "analyzed": true }), &cli.format)?;
        }

        Command::Reset => {}
    }

    db.close();
    Ok(())
}

fn list_query(
    schema: &Arc<ModelSchema>,
    filters: &[(String, String)],
    orders: &[String],
    limit: Option<u64>,
    offset: Option<u64>,
) -> livedb::Result<QueryBuilder> {
    let mut builder = QueryBuilder::find_all(schema.clone()).where_all(matchers(schema, filters)?);
    for order in orders {
        builder = builder.order(sort_order(schema, order)?);
    }
    if let Some(limit) = limit {
        builder = builder.limit(limit);
    }
    if let Some(offset) = offset {
        builder = builder.offset(offset);
    }
    Ok(builder)
}

fn matchers(schema: &ModelSchema, filters: &[(String, String)]) -> livedb::Result<Vec<Matcher>> {
    filters
        .iter()
        .map(|(key, value)| {
            let attribute = schema
                .attribute(key)
                .or_else(|| schema.attribute_by_json_key(key))
                .ok_or_else(|| LiveDbError::InvalidQuery(format!("{} has no attribute {key}", schema.class())))?;
            attribute.equal(parse_value(value))
        })
        .collect()
}

fn sort_order(schema: &ModelSchema, flag: &str) -> livedb::Result<SortOrder> {
    let (key, direction) = match flag.split_once(':') {
        Some((key, "asc")) => (key, Direction::Asc),
        Some((key, "desc")) => (key, Direction::Desc),
        Some((_, other)) => {
            return Err(LiveDbError::InvalidQuery(format!(
                "Unknown sort direction '{other}', expected asc or desc"
            )))
        }
        None => (flag, Direction::Asc),
    };
    let attribute = schema
        .attribute(key)
        .ok_or_else(|| LiveDbError::InvalidQuery(format!("{} has no attribute {key}", schema.class())))?;
    Ok(match direction {
        Direction::Asc => attribute.ascending(),
        Direction::Desc => attribute.descending(),
    })
}

fn models_json<'a>(models: impl Iterator<Item = &'a Model>) -> serde_json::Value {
    serde_json::Value::Array(models.map(|m| m.to_json(true)).collect())
}

fn print_output(value: &serde_json::Value, format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
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

fn parse_value(raw: &str) -> serde_json::Value {
    // numbers, booleans, arrays and objects parse as JSON; anything else is a string
    serde_json::from_str(raw).unwrap_or(serde_json::Value::String(raw.to_string()))
}

fn fields_to_value(fields: &[(String, String)]) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (key, val) in fields {
        map.insert(key.clone(), parse_value(val));
    }
    serde_json::Value::Object(map)
}
