use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::FixedOffset;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::warn;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use rfid_attendance_engine::db::{self, PgBackend};
use rfid_attendance_engine::models::ScanEvent;
use rfid_attendance_engine::pipeline::{AbsenceAlertPipeline, PipelineConfig};
use rfid_attendance_engine::processor::AttendanceProcessor;
use rfid_attendance_engine::sources::{AttendanceStore, LogAlertSender, StudentDirectory};

#[derive(Parser)]
#[command(name = "rfid-attendance")]
#[command(about = "RFID attendance matching and absence alerting engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load realistic seed data
    Seed,
    /// Import scan events from a CSV file and process each one
    Import {
        #[arg(long)]
        csv: PathBuf,
        #[arg(long, default_value = "+00:00")]
        utc_offset: String,
        #[arg(long, default_value_t = 3)]
        threshold: u32,
    },
    /// Process a single ad-hoc scan
    Process {
        #[arg(long)]
        rfid: String,
        /// Scan timestamp, epoch milliseconds
        #[arg(long)]
        at: i64,
        #[arg(long, default_value = "+00:00")]
        utc_offset: String,
        #[arg(long, default_value_t = 3)]
        threshold: u32,
    },
    /// Force one absence-alert evaluation pass
    Recheck {
        #[arg(long)]
        student: Option<String>,
        #[arg(long, default_value_t = 3)]
        threshold: u32,
    },
    /// Poll for unprocessed scans and run the live alert pipeline
    Watch {
        #[arg(long, default_value_t = 1000)]
        poll_ms: u64,
        #[arg(long, default_value = "+00:00")]
        utc_offset: String,
        #[arg(long, default_value_t = 3)]
        threshold: u32,
        #[arg(long, default_value_t = 2000)]
        debounce_ms: u64,
    },
    /// Print the stored day record for one student and date
    Status {
        #[arg(long)]
        student: String,
        /// Date key, YYYY-MM-DD
        #[arg(long)]
        date: String,
    },
}

fn parse_offset(raw: &str) -> anyhow::Result<FixedOffset> {
    raw.parse::<FixedOffset>()
        .map_err(|_| anyhow::anyhow!("utc offset must look like +08:00, got {raw:?}"))
}

fn pipeline_config(threshold: u32, debounce_ms: u64) -> PipelineConfig {
    PipelineConfig {
        absence_threshold: threshold,
        debounce: Duration::from_millis(debounce_ms),
        ..PipelineConfig::default()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a production Postgres instance")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(&pool).await?;
            println!("Seed data inserted.");
        }
        Commands::Import {
            csv,
            utc_offset,
            threshold,
        } => {
            let offset = parse_offset(&utc_offset)?;
            let backend = Arc::new(PgBackend::new(pool.clone()));
            let processor = AttendanceProcessor::new(
                backend.clone(),
                backend.clone(),
                backend.clone(),
                None,
                offset,
            );

            let processed = import_csv(&pool, backend.clone(), &processor, &csv).await?;
            println!("Processed {processed} scans from {}.", csv.display());

            // Batch ingestion skips the debounce loop and evaluates once at
            // the end instead.
            let pipeline = AbsenceAlertPipeline::new(
                backend.clone(),
                backend.clone(),
                backend.clone(),
                Arc::new(LogAlertSender),
                pipeline_config(threshold, 0),
            );
            pipeline.run_once().await?;
            println!("Absence alert pass complete.");
        }
        Commands::Process {
            rfid,
            at,
            utc_offset,
            threshold,
        } => {
            let offset = parse_offset(&utc_offset)?;
            let backend = Arc::new(PgBackend::new(pool.clone()));

            let Some(student) = backend.find_by_rfid(&rfid).await? else {
                anyhow::bail!("no student registered for tag {rfid}");
            };

            let source_key = format!("manual-{}", Uuid::new_v4());
            db::insert_scan(&pool, &source_key, &rfid, at).await?;

            let processor = AttendanceProcessor::new(
                backend.clone(),
                backend.clone(),
                backend.clone(),
                None,
                offset,
            );
            let scan = ScanEvent {
                student_id: student.id.clone(),
                rfid,
                timestamp_ms: at,
                source_key,
            };
            let outcome = processor.process(&scan).await?;
            println!("{} -> {:?}", student.name, outcome);

            let pipeline = AbsenceAlertPipeline::new(
                backend.clone(),
                backend.clone(),
                backend.clone(),
                Arc::new(LogAlertSender),
                pipeline_config(threshold, 0),
            );
            pipeline.run_once().await?;
        }
        Commands::Recheck { student, threshold } => {
            let backend = Arc::new(PgBackend::new(pool.clone()));
            let pipeline = AbsenceAlertPipeline::new(
                backend.clone(),
                backend.clone(),
                backend.clone(),
                Arc::new(LogAlertSender),
                pipeline_config(threshold, 0),
            );
            match student {
                Some(student_id) => pipeline.evaluate_student(&student_id).await?,
                None => pipeline.run_once().await?,
            }
            println!("Recheck complete.");
        }
        Commands::Watch {
            poll_ms,
            utc_offset,
            threshold,
            debounce_ms,
        } => {
            let offset = parse_offset(&utc_offset)?;
            let backend = Arc::new(PgBackend::new(pool.clone()));

            let pipeline = Arc::new(AbsenceAlertPipeline::new(
                backend.clone(),
                backend.clone(),
                backend.clone(),
                Arc::new(LogAlertSender),
                pipeline_config(threshold, debounce_ms),
            ));
            let handle = pipeline.spawn();

            let processor = AttendanceProcessor::new(
                backend.clone(),
                backend.clone(),
                backend.clone(),
                Some(handle.notifier()),
                offset,
            );

            println!("Watching for scans (ctrl-c to stop).");
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    _ = tokio::time::sleep(Duration::from_millis(poll_ms)) => {
                        // Poll errors must not take the watch loop down;
                        // unfetched scans stay pending for the next tick.
                        if let Err(error) = drain_pending_scans(&pool, backend.clone(), &processor).await {
                            warn!(%error, "scan poll failed");
                        }
                    }
                }
            }
            handle.shutdown().await;
            println!("Stopped.");
        }
        Commands::Status { student, date } => {
            let backend = PgBackend::new(pool.clone());
            let day = backend.get_day(&student, &date).await?;
            if day.is_empty() {
                println!("No attendance records for {student} on {date}.");
            } else {
                println!("{}", serde_json::to_string_pretty(&day)?);
            }
        }
    }

    Ok(())
}

async fn import_csv(
    pool: &PgPool,
    backend: Arc<PgBackend>,
    processor: &AttendanceProcessor,
    csv_path: &std::path::Path,
) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct ScanRow {
        rfid: String,
        timestamp_ms: i64,
        source_key: Option<String>,
    }

    let mut reader = csv::Reader::from_path(csv_path)?;
    let mut processed = 0usize;

    for result in reader.deserialize::<ScanRow>() {
        let row = result?;
        let source_key = row
            .source_key
            .unwrap_or_else(|| format!("import-{}", Uuid::new_v4()));

        if !db::insert_scan(pool, &source_key, &row.rfid, row.timestamp_ms).await? {
            // Already ingested on a previous run.
            continue;
        }

        let Some(student) = backend.find_by_rfid(&row.rfid).await? else {
            warn!(rfid = %row.rfid, "scan from unregistered tag; skipping");
            continue;
        };

        let scan = ScanEvent {
            student_id: student.id,
            rfid: row.rfid,
            timestamp_ms: row.timestamp_ms,
            source_key,
        };
        processor.process(&scan).await?;
        processed += 1;
    }

    Ok(processed)
}

async fn drain_pending_scans(
    pool: &PgPool,
    backend: Arc<PgBackend>,
    processor: &AttendanceProcessor,
) -> anyhow::Result<()> {
    use rfid_attendance_engine::sources::ScanMarker;

    let mut batch = Vec::new();
    for (source_key, rfid, timestamp_ms) in db::fetch_unprocessed_scans(pool, 100).await? {
        let Some(student) = backend.find_by_rfid(&rfid).await? else {
            // Mark unknown tags processed so the poll loop does not spin on them.
            warn!(%rfid, "scan from unregistered tag; marking processed");
            backend.mark_processed(&source_key).await?;
            continue;
        };
        batch.push(ScanEvent {
            student_id: student.id,
            rfid,
            timestamp_ms,
            source_key,
        });
    }
    // Per-scan failures are logged inside process_all and retried on the
    // next poll; they never abort the batch.
    processor.process_all(&batch).await;
    Ok(())
}
