use anyhow::{bail, Context, Result};
use board_core::StageRegistry;
use clap::{Parser, Subcommand};
use shared::{
    domain::{RecordId, Stage, StageId},
    protocol::StageUpdateRequest,
};
use storage::Storage;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/board.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Writes the stages of a built-in preset (`prospects`, `deals`).
    SeedStages { preset: String },
    UpsertStage {
        id: String,
        display_name: String,
        sort_order: i32,
    },
    /// Creates a record; `--field key=value` may repeat.
    CreateRecord {
        #[arg(long)]
        stage: Option<String>,
        #[arg(long = "field")]
        fields: Vec<String>,
    },
    /// Out-of-band stage write, bypassing any board.
    SetStage {
        record_id: String,
        stage_id: String,
        /// RFC 3339 timestamp stored as the last contact date.
        #[arg(long)]
        contacted_at: Option<String>,
    },
    DeleteRecord { record_id: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::SeedStages { preset } => {
            let registry = StageRegistry::preset(&preset)
                .with_context(|| format!("unknown preset '{preset}'"))?;
            for stage in registry.iter() {
                storage.upsert_stage(stage).await?;
            }
            println!("seeded {} stages", registry.len());
        }
        Command::UpsertStage {
            id,
            display_name,
            sort_order,
        } => {
            storage
                .upsert_stage(&Stage::new(id.as_str(), display_name.as_str(), sort_order))
                .await?;
            println!("saved stage {id}");
        }
        Command::CreateRecord { stage, fields } => {
            let mut map = serde_json::Map::new();
            for field in fields {
                let Some((key, value)) = field.split_once('=') else {
                    bail!("field '{field}' is not key=value");
                };
                map.insert(key.to_string(), value.into());
            }
            let record_id = storage.create_record(stage.map(StageId::new), map).await?;
            println!("created record_id={record_id}");
        }
        Command::SetStage {
            record_id,
            stage_id,
            contacted_at,
        } => {
            let last_contact_at = contacted_at
                .map(|raw| {
                    chrono::DateTime::parse_from_rfc3339(&raw)
                        .map(|at| at.with_timezone(&chrono::Utc))
                        .with_context(|| format!("invalid timestamp '{raw}'"))
                })
                .transpose()?;
            storage
                .set_record_stage(
                    &RecordId::new(record_id.as_str()),
                    &StageUpdateRequest {
                        stage_id: StageId::new(stage_id),
                        last_contact_at,
                    },
                )
                .await?;
            println!("moved {record_id}");
        }
        Command::DeleteRecord { record_id } => {
            if storage.delete_record(&RecordId::new(record_id.as_str())).await? {
                println!("deleted {record_id}");
            } else {
                println!("no record {record_id}");
            }
        }
        Command::List => {
            for stage in storage.list_stages().await? {
                println!("stage {} {:?} order={}", stage.id, stage.display_name, stage.sort_order);
            }
            for record in storage.list_records().await? {
                let stage = record
                    .stage_id
                    .as_ref()
                    .map(StageId::as_str)
                    .unwrap_or("-");
                println!("record {} stage={stage} label={:?}", record.id, record.label());
            }
        }
    }

    Ok(())
}
