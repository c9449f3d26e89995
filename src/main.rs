use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use chrono::{Local, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

mod compose;
mod config;
mod db;
mod dispatch;
mod error;
mod ingest;
mod mapping;
mod models;
mod provider;
mod report;

use config::Config;
use db::{PgSettingsStore, SettingsStore};
use dispatch::{DispatchJob, Paced, Progress};
use error::NotifyError;
use models::{Dataset, FieldKey, FieldMapping, FreeTextParams, Mode, SendResult, Settings};
use provider::WhatsAppClient;

#[derive(Parser)]
#[command(name = "edualert")]
#[command(about = "Fee reminders and grade reports to parents over WhatsApp", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Show or save the messaging provider settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
    /// Check the saved credentials against the provider
    TestConnection,
    /// Propose a column mapping for an uploaded sheet
    Map {
        #[command(flatten)]
        upload: UploadArgs,
    },
    /// Render the message the first rows would receive
    Preview {
        #[command(flatten)]
        upload: UploadArgs,
        #[command(flatten)]
        campaign: CampaignArgs,
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },
    /// Send one notification per row
    Send {
        #[command(flatten)]
        upload: UploadArgs,
        #[command(flatten)]
        campaign: CampaignArgs,
        /// Pause between consecutive messages
        #[arg(long, default_value_t = 0)]
        delay_ms: u64,
        /// Write a markdown report of the run
        #[arg(long)]
        report: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum SettingsAction {
    /// Print the saved settings with secrets masked
    Show,
    /// Overwrite the saved settings
    Set {
        #[arg(long)]
        phone_number_id: String,
        #[arg(long)]
        waba_id: String,
        #[arg(long)]
        access_token: String,
        #[arg(long, default_value = models::DEFAULT_ENDPOINT)]
        endpoint: String,
        #[arg(long)]
        fees_template: String,
        #[arg(long)]
        marks_template: String,
        #[arg(long)]
        lock_password: Option<String>,
    },
}

#[derive(Args)]
struct UploadArgs {
    /// Spreadsheet (xlsx, xls, ods; first sheet is read), CSV, or a JSON array of rows
    #[arg(long)]
    file: PathBuf,
    #[arg(long, value_enum)]
    mode: Mode,
    /// Override a proposed column, e.g. --map "studentName=Full Name"
    #[arg(long = "map", value_name = "FIELD=HEADER", value_parser = parse_override)]
    overrides: Vec<(FieldKey, String)>,
}

#[derive(Args)]
struct CampaignArgs {
    #[arg(long, default_value = "Monthly Tuition Fee")]
    fee_name: String,
    /// Defaults to today
    #[arg(long)]
    due_date: Option<NaiveDate>,
    #[arg(long, default_value = "Final Term Examination")]
    exam_name: String,
}

impl CampaignArgs {
    fn params(&self) -> FreeTextParams {
        FreeTextParams {
            fee_name: Some(self.fee_name.clone()),
            due_date: Some(self.due_date.unwrap_or_else(|| Local::now().date_naive())),
            exam_name: Some(self.exam_name.clone()),
        }
    }
}

fn parse_override(raw: &str) -> Result<(FieldKey, String), String> {
    let (field, header) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected FIELD=HEADER, got `{raw}`"))?;
    let field: FieldKey = field.trim().parse()?;
    Ok((field, header.trim().to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    config::init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::InitDb => {
            let pool = connect(&Config::from_env()?).await?;
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Settings { action } => {
            let store = PgSettingsStore::new(connect(&Config::from_env()?).await?);
            match action {
                SettingsAction::Show => match store.load().await? {
                    Some(settings) => print_settings(&settings),
                    None => println!("Settings are not configured yet."),
                },
                SettingsAction::Set {
                    phone_number_id,
                    waba_id,
                    access_token,
                    endpoint,
                    fees_template,
                    marks_template,
                    lock_password,
                } => {
                    let settings = Settings {
                        phone_number_id,
                        waba_id,
                        access_token,
                        endpoint,
                        fees_template_name: fees_template,
                        marks_template_name: marks_template,
                        lock_password: lock_password.filter(|password| !password.is_empty()),
                    };
                    db::save_settings(&store, &settings).await?;
                    println!("Settings saved.");
                }
            }
        }
        Commands::TestConnection => {
            let config = Config::from_env()?;
            let store = PgSettingsStore::new(connect(&config).await?);
            let client = WhatsAppClient::new(store, config.http_timeout)?;
            let business = client.check_connection().await?;
            println!("Connected to {business}.");
        }
        Commands::Map { upload } => {
            let dataset = ingest::load_dataset(&upload.file)?;
            let proposal = mapping::propose_mapping(&dataset.headers, upload.mode);
            let mut field_mapping = proposal.mapping;
            mapping::apply_overrides(&mut field_mapping, &upload.overrides);

            println!("Columns: {}", dataset.headers.join(", "));
            print_mapping(&field_mapping, upload.mode);
            for conflict in &proposal.conflicts {
                println!(
                    "Note: `{}` also looks like {}, kept `{}`.",
                    conflict.header, conflict.field, conflict.kept
                );
            }
            if upload.mode == Mode::Grades {
                let subjects: Vec<&str> = dataset
                    .headers
                    .iter()
                    .map(String::as_str)
                    .filter(|header| !field_mapping.uses_header(header))
                    .collect();
                println!("Subject columns: {}", subjects.join(", "));
            }

            if mapping::is_complete(&field_mapping, &dataset.headers, upload.mode) {
                println!("Mapping complete for {} rows.", dataset.records.len());
            } else {
                let missing =
                    mapping::missing_fields(&field_mapping, &dataset.headers, upload.mode);
                let names: Vec<&str> = missing.iter().map(|field| field.label()).collect();
                println!("Mapping incomplete, map: {}.", names.join(", "));
            }
        }
        Commands::Preview {
            upload,
            campaign,
            limit,
        } => {
            let (dataset, field_mapping) = prepare(&upload)?;
            let params = campaign.params();
            let rows = mapping::map_rows(&dataset, &field_mapping, upload.mode);

            print_mapping(&field_mapping, upload.mode);
            if let Some(first) = rows.first() {
                println!();
                println!("Example message:");
                println!(
                    "{}",
                    compose::render_preview(first, &field_mapping, upload.mode, &params)
                );
            }
            println!();
            println!("Recipients ({} total):", rows.len());
            for row in rows.iter().take(limit) {
                match &row.fee_amount {
                    Some(amount) => println!(
                        "- {} ({}) -> {} due {}",
                        row.student_name, row.class_name, row.phone_number, amount
                    ),
                    None => println!(
                        "- {} ({}) -> {}",
                        row.student_name, row.class_name, row.phone_number
                    ),
                }
            }
        }
        Commands::Send {
            upload,
            campaign,
            delay_ms,
            report,
        } => {
            let config = Config::from_env()?;
            let store = PgSettingsStore::new(connect(&config).await?);
            let settings = store.load().await?.ok_or(NotifyError::SettingsUnavailable)?;
            let template_name = settings
                .template_for(upload.mode)
                .ok_or_else(|| NotifyError::MissingTemplateConfiguration {
                    mode: upload.mode.to_string(),
                })?
                .to_string();

            let (dataset, field_mapping) = prepare(&upload)?;
            let rows = mapping::map_rows(&dataset, &field_mapping, upload.mode);
            let params = campaign.params();
            let client = WhatsAppClient::new(store, config.http_timeout)?;

            let run_id = Uuid::new_v4();
            let job = DispatchJob {
                run_id,
                mode: upload.mode,
                template_name: &template_name,
                mapping: &field_mapping,
                params: &params,
            };
            let mut hooks = Paced::new(
                Duration::from_millis(delay_ms),
                |progress: Progress, result: &SendResult| {
                    println!(
                        "[{}/{} {:>3.0}%] {} {}: {}",
                        progress.attempted,
                        progress.total,
                        progress.fraction() * 100.0,
                        result.status,
                        result.student_name,
                        result.message
                    );
                },
            );

            let results = dispatch::dispatch(&client, &rows, &job, &mut hooks).await?;
            let summary = report::summarize(&results);
            println!(
                "Finished: {} sent, {} failed of {}.",
                summary.sent, summary.failed, summary.total
            );

            if let Some(out) = report {
                let contents =
                    report::build_report(run_id, upload.mode, &template_name, Utc::now(), &results);
                std::fs::write(&out, contents)
                    .with_context(|| format!("failed to write report to {}", out.display()))?;
                println!("Report written to {}.", out.display());
            }
        }
    }

    Ok(())
}

async fn connect(config: &Config) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .context("failed to connect to Postgres")
}

/// Loads the sheet and resolves a mapping that covers every required field.
fn prepare(upload: &UploadArgs) -> anyhow::Result<(Dataset, FieldMapping)> {
    let dataset = ingest::load_dataset(&upload.file)?;
    let mut field_mapping = mapping::propose_mapping(&dataset.headers, upload.mode).mapping;
    mapping::apply_overrides(&mut field_mapping, &upload.overrides);
    mapping::ensure_complete(&field_mapping, &dataset.headers, upload.mode)?;
    Ok((dataset, field_mapping))
}

fn print_mapping(field_mapping: &FieldMapping, mode: Mode) {
    println!("Mapping ({mode} mode):");
    for field in mode.fields() {
        let header = field_mapping.get(*field).unwrap_or("(unmapped)");
        println!("  {:<20} <- {}", field.label(), header);
    }
}

fn print_settings(settings: &Settings) {
    println!("Phone number ID:   {}", settings.phone_number_id);
    println!("WABA ID:           {}", settings.waba_id);
    println!("Access token:      {}", mask(&settings.access_token));
    println!("Endpoint:          {}", settings.endpoint);
    println!("Fees template:     {}", settings.fees_template_name);
    println!("Marks template:    {}", settings.marks_template_name);
    println!(
        "Lock password:     {}",
        if settings.lock_password.is_some() { "set" } else { "not set" }
    );
}

fn mask(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "********".to_string();
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("****{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_parses_field_and_header() {
        assert_eq!(
            parse_override("studentName = Full Name"),
            Ok((FieldKey::StudentName, "Full Name".to_string()))
        );
        assert!(parse_override("studentName").is_err());
        assert!(parse_override("roll=Roll No").is_err());
    }

    #[test]
    fn mask_keeps_only_a_short_tail() {
        assert_eq!(mask("EAAG1234567890abcd"), "****abcd");
        assert_eq!(mask("short"), "********");
    }

    #[test]
    fn cli_accepts_marks_alias_and_repeated_overrides() {
        let cli = Cli::try_parse_from([
            "edualert",
            "preview",
            "--file",
            "students.csv",
            "--mode",
            "marks",
            "--map",
            "studentName=Pupil",
            "--map",
            "phoneNumber=Guardian",
        ])
        .expect("parse");
        match cli.command {
            Commands::Preview { upload, .. } => {
                assert_eq!(upload.mode, Mode::Grades);
                assert_eq!(upload.overrides.len(), 2);
            }
            _ => panic!("expected preview"),
        }
    }
}
