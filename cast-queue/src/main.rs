//! cast-queue - Inspect and repair the cast schedule
//!
//! Unix-style operator tool for the Castline queue.

use chrono::Utc;
use clap::{Parser, Subcommand};
use libcastline::logging::{LogFormat, LoggingConfig};
use libcastline::scheduling::parse_schedule;
use libcastline::sweep::reconcile_interrupted;
use libcastline::{Cast, CastStatus, CastlineError, Config, Database, Result};

#[derive(Parser, Debug)]
#[command(name = "cast-queue")]
#[command(version)]
#[command(about = "Inspect and repair scheduled casts")]
#[command(long_about = "\
cast-queue - Inspect and repair scheduled casts

DESCRIPTION:
    cast-queue is a Unix-style tool for operating the Castline queue.
    Use it to list casts, view counts per status, move failed casts back
    onto the schedule, and recover casts left in 'publishing' by a crash.

COMMANDS:
    list        List casts, optionally filtered by status
    stats       Count casts per status
    reschedule  Move a scheduled or failed cast to a new time
    retry       Put a failed cast back on the schedule, due now
    reconcile   Mark casts stuck in 'publishing' as failed

USAGE EXAMPLES:
    # List failed casts as JSON
    cast-queue list --status failed --format json

    # Reschedule a cast
    cast-queue reschedule <CAST_ID> \"tomorrow 3pm\"
    cast-queue reschedule <CAST_ID> 2h

    # Retry a failed cast on the next sweep
    cast-queue retry <CAST_ID>

    # Recover casts claimed more than 10 minutes ago
    cast-queue reconcile --older-than 600

CONFIGURATION:
    Configuration file: ~/.config/castline/config.toml

    Override with environment variables:
        CASTLINE_CONFIG    - Path to config file
        CASTLINE_DB_PATH   - Path to database file

EXIT CODES:
    0 - Success
    1 - Operation failed
    2 - Database or configuration error
    3 - Invalid input (bad cast ID, time format, illegal transition)
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List casts
    List {
        /// Only casts in this status (draft, scheduled, publishing, published, failed)
        #[arg(short, long)]
        status: Option<String>,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,

        /// Maximum number of casts to show
        #[arg(short, long, default_value_t = 100)]
        limit: usize,
    },

    /// Count casts per status
    Stats {
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Move a scheduled or failed cast to a new time (resets its retry count)
    Reschedule {
        cast_id: String,

        /// New time (e.g. "tomorrow 3pm", "2h", RFC 3339)
        time: String,
    },

    /// Put a failed cast back on the schedule for the next sweep
    Retry { cast_id: String },

    /// Mark casts stuck in 'publishing' as failed
    Reconcile {
        /// Only casts claimed at least this many seconds ago (default from config)
        #[arg(long, value_name = "SECONDS")]
        older_than: Option<u64>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    LoggingConfig::new(LogFormat::Text, "error".to_string(), cli.verbose).init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let db = Database::new(&config.database.path).await?;

    match cli.command {
        Commands::List {
            status,
            format,
            limit,
        } => cmd_list(&db, status.as_deref(), &format, limit).await,
        Commands::Stats { format } => cmd_stats(&db, &format).await,
        Commands::Reschedule { cast_id, time } => cmd_reschedule(&db, &cast_id, &time).await,
        Commands::Retry { cast_id } => cmd_retry(&db, &cast_id).await,
        Commands::Reconcile { older_than } => {
            cmd_reconcile(&db, older_than.unwrap_or(config.sweep.stale_publishing_after)).await
        }
    }
}

fn validate_format(format: &str) -> Result<()> {
    if format != "text" && format != "json" {
        return Err(CastlineError::InvalidInput(format!(
            "Invalid format '{}'. Must be 'text' or 'json'",
            format
        )));
    }
    Ok(())
}

fn validate_cast_id(cast_id: &str) -> Result<()> {
    uuid::Uuid::parse_str(cast_id)
        .map(|_| ())
        .map_err(|_| CastlineError::InvalidInput(format!("Invalid cast ID: {}", cast_id)))
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| CastlineError::InvalidInput(format!("Failed to encode output: {}", e)))?;
    println!("{}", text);
    Ok(())
}

/// List casts
async fn cmd_list(db: &Database, status: Option<&str>, format: &str, limit: usize) -> Result<()> {
    validate_format(format)?;
    let status = status
        .map(|s| s.parse::<CastStatus>().map_err(CastlineError::InvalidInput))
        .transpose()?;

    let casts = db.list_casts(status, limit).await?;

    if format == "json" {
        let json: Vec<serde_json::Value> = casts.iter().map(cast_json).collect();
        print_json(&serde_json::Value::Array(json))
    } else {
        output_list_text(&casts);
        Ok(())
    }
}

fn cast_json(cast: &Cast) -> serde_json::Value {
    serde_json::json!({
        "id": cast.id,
        "account_id": cast.account_id,
        "content": cast.content,
        "status": cast.status.as_str(),
        "scheduled_at": cast.scheduled_at,
        "thread_id": cast.thread_id,
        "thread_order": cast.thread_order,
        "cast_hash": cast.cast_hash,
        "error_message": cast.error_message,
        "retry_count": cast.retry_count,
    })
}

fn output_list_text(casts: &[Cast]) {
    let now = Utc::now().timestamp();

    for cast in casts {
        let when = match cast.status {
            CastStatus::Scheduled => format_time_until(now, cast.scheduled_at),
            CastStatus::Published => cast.cast_hash.clone().unwrap_or_default(),
            CastStatus::Failed => format!(
                "{} (retries: {})",
                cast.error_message.as_deref().unwrap_or("unknown error"),
                cast.retry_count
            ),
            _ => String::new(),
        };

        println!(
            "{} | {} | {} | {}",
            cast.id,
            cast.status,
            truncate_content(&cast.content, 50),
            when
        );
    }
}

/// Truncate content to max characters with ellipsis
fn truncate_content(content: &str, max_chars: usize) -> String {
    let single_line = content.replace('\n', " ");
    if single_line.chars().count() <= max_chars {
        single_line
    } else {
        let head: String = single_line.chars().take(max_chars).collect();
        format!("{}...", head)
    }
}

/// Format time until scheduled time in human-readable format
fn format_time_until(now: i64, scheduled_at: i64) -> String {
    let diff = scheduled_at - now;

    if diff < 0 {
        return "overdue".to_string();
    }

    let minutes = diff / 60;
    let hours = minutes / 60;
    let days = hours / 24;

    if days > 0 {
        format!("in {} day{}", days, if days == 1 { "" } else { "s" })
    } else if hours > 0 {
        format!("in {} hour{}", hours, if hours == 1 { "" } else { "s" })
    } else if minutes > 0 {
        format!("in {} minute{}", minutes, if minutes == 1 { "" } else { "s" })
    } else {
        "in <1 minute".to_string()
    }
}

/// Count casts per status
async fn cmd_stats(db: &Database, format: &str) -> Result<()> {
    validate_format(format)?;
    let counts = db.count_by_status().await?;
    let total: i64 = counts.iter().map(|(_, n)| n).sum();

    if format == "json" {
        let mut map = serde_json::Map::new();
        for (status, count) in &counts {
            map.insert(status.as_str().to_string(), serde_json::json!(count));
        }
        map.insert("total".to_string(), serde_json::json!(total));
        print_json(&serde_json::Value::Object(map))
    } else {
        for (status, count) in &counts {
            println!("{:<11} {}", status.as_str(), count);
        }
        println!("{:<11} {}", "total", total);
        Ok(())
    }
}

/// Reschedule a cast
async fn cmd_reschedule(db: &Database, cast_id: &str, time: &str) -> Result<()> {
    validate_cast_id(cast_id)?;
    let now = Utc::now();
    let at = parse_schedule(time, now)?;

    db.reschedule_cast(cast_id, at.timestamp(), now.timestamp())
        .await?;
    println!("Rescheduled {} for {}", cast_id, at.to_rfc3339());
    Ok(())
}

/// Retry a failed cast on the next sweep
async fn cmd_retry(db: &Database, cast_id: &str) -> Result<()> {
    validate_cast_id(cast_id)?;
    let now = Utc::now().timestamp();

    db.retry_cast(cast_id, now + 1, now).await?;
    println!("Queued {} for retry", cast_id);
    Ok(())
}

/// Mark casts stuck in publishing as failed
async fn cmd_reconcile(db: &Database, older_than: u64) -> Result<()> {
    let moved = reconcile_interrupted(db, Utc::now(), older_than).await?;
    for cast in &moved {
        println!("{}", cast.id);
    }
    eprintln!("Marked {} interrupted cast(s) as failed", moved.len());
    Ok(())
}
