//! outbox-queue - Manage the scheduled post queue
//!
//! Unix-style tool for inspecting and managing scheduled posts.

use clap::{Parser, Subcommand};
use liboutbox::{Config, Database, OutboxError, PostStatus, Result, ScheduledPost};

#[derive(Parser, Debug)]
#[command(name = "outbox-queue")]
#[command(version)]
#[command(about = "Inspect and manage the scheduled post queue")]
#[command(long_about = "\
outbox-queue - Manage the scheduled post queue

DESCRIPTION:
    outbox-queue is a Unix-style tool for inspecting and managing
    scheduled posts in the Outbox queue. Use it to schedule posts, list
    them, cancel pending ones, or view queue statistics.

COMMANDS:
    add     Schedule a post
    list    List scheduled posts
    cancel  Cancel a pending post
    stats   Show queue statistics

USAGE EXAMPLES:
    # Schedule a post for a tenant (time is a unix timestamp)
    outbox-queue add --tenant acme --at 1756300000 \"Release day!\"

    # List all posts
    outbox-queue list

    # List a tenant's failed posts as JSON
    outbox-queue list --tenant acme --status failed --format json

    # Cancel a pending post
    outbox-queue cancel 42 --tenant acme

    # View queue statistics
    outbox-queue stats

CONFIGURATION:
    Configuration file: ~/.config/outbox/config.toml
    Database location: ~/.local/share/outbox/outbox.db

    Override with environment variables:
        OUTBOX_CONFIG - Path to config file

EXIT CODES:
    0 - Success
    1 - Operation failed
    2 - Database or configuration error
    3 - Invalid input (bad post id, status, or time)

For more information, visit: https://github.com/outbox/outbox
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    #[arg(help = "Enable verbose logging to stderr (useful for debugging)")]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Schedule a post
    Add {
        /// Post content
        content: String,

        /// Tenant the post belongs to
        #[arg(long)]
        tenant: String,

        /// Scheduled time as a unix timestamp
        #[arg(long, value_name = "TIMESTAMP")]
        at: i64,

        /// Optional image URL to attach
        #[arg(long)]
        image: Option<String>,
    },

    /// List scheduled posts
    List {
        /// Filter by tenant
        #[arg(long)]
        tenant: Option<String>,

        /// Filter by status: pending, published, or failed
        #[arg(long)]
        status: Option<String>,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,

        /// Maximum number of posts to show
        #[arg(long, default_value_t = 100)]
        limit: i64,
    },

    /// Cancel a pending post
    Cancel {
        /// Post id to cancel
        post_id: i64,

        /// Tenant the post belongs to
        #[arg(long)]
        tenant: String,
    },

    /// Show queue statistics
    Stats {
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("error")
            .with_writer(std::io::stderr)
            .init();
    }

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let db = Database::new(&config.database.path).await?;

    match cli.command {
        Commands::Add {
            content,
            tenant,
            at,
            image,
        } => {
            cmd_add(&db, &tenant, &content, image.as_deref(), at).await?;
        }
        Commands::List {
            tenant,
            status,
            format,
            limit,
        } => {
            cmd_list(&db, tenant.as_deref(), status.as_deref(), &format, limit).await?;
        }
        Commands::Cancel { post_id, tenant } => {
            cmd_cancel(&db, post_id, &tenant).await?;
        }
        Commands::Stats { format } => {
            cmd_stats(&db, &format).await?;
        }
    }

    Ok(())
}

/// Schedule a post
async fn cmd_add(
    db: &Database,
    tenant: &str,
    content: &str,
    image: Option<&str>,
    at: i64,
) -> Result<()> {
    if content.trim().is_empty() {
        return Err(OutboxError::InvalidInput("Empty post content".to_string()));
    }

    let id = db.create_scheduled_post(tenant, content, image, at).await?;
    println!("{}", id);
    Ok(())
}

/// List scheduled posts
async fn cmd_list(
    db: &Database,
    tenant: Option<&str>,
    status: Option<&str>,
    format: &str,
    limit: i64,
) -> Result<()> {
    validate_format(format)?;

    let status = match status {
        Some(s) => Some(PostStatus::parse(s).ok_or_else(|| {
            OutboxError::InvalidInput(format!(
                "Invalid status '{}'. Must be pending, published, or failed",
                s
            ))
        })?),
        None => None,
    };

    let posts = db.list_posts(tenant, status, limit).await?;

    if format == "json" {
        output_list_json(&posts);
    } else {
        output_list_text(&posts);
    }

    Ok(())
}

/// Output posts as JSON
fn output_list_json(posts: &[ScheduledPost]) {
    let json: Vec<serde_json::Value> = posts
        .iter()
        .map(|p| {
            serde_json::json!({
                "id": p.id,
                "tenant_id": p.tenant_id,
                "content": p.content,
                "scheduled_time": p.scheduled_time,
                "status": p.status.as_str(),
                "error_message": p.error_message,
                "provider_post_id": p.provider_post_id,
                "published_at": p.published_at,
            })
        })
        .collect();

    match serde_json::to_string_pretty(&json) {
        Ok(out) => println!("{}", out),
        Err(e) => eprintln!("Error: failed to serialize posts: {}", e),
    }
}

/// Output posts as human-readable text
fn output_list_text(posts: &[ScheduledPost]) {
    if posts.is_empty() {
        return;
    }

    let now = chrono::Utc::now().timestamp();

    for post in posts {
        let content_preview = truncate_content(&post.content, 50);
        let when = match post.status {
            PostStatus::Pending => format_time_until(now, post.scheduled_time),
            PostStatus::Published => "published".to_string(),
            PostStatus::Failed => post
                .error_message
                .clone()
                .unwrap_or_else(|| "failed".to_string()),
        };

        println!(
            "{} | {} | {} | {}",
            post.id, post.tenant_id, content_preview, when
        );
    }
}

/// Truncate content to max length with ellipsis
fn truncate_content(content: &str, max_len: usize) -> String {
    if content.chars().count() <= max_len {
        content.to_string()
    } else {
        let truncated: String = content.chars().take(max_len).collect();
        format!("{}...", truncated)
    }
}

/// Format time until scheduled time in human-readable format
fn format_time_until(now: i64, scheduled_time: i64) -> String {
    let diff = scheduled_time - now;

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

/// Cancel a pending post
async fn cmd_cancel(db: &Database, post_id: i64, tenant: &str) -> Result<()> {
    let cancelled = db.delete_scheduled_post(post_id, tenant).await?;

    if cancelled {
        println!("Cancelled post {}", post_id);
        Ok(())
    } else {
        Err(OutboxError::InvalidInput(format!(
            "Post {} not found for tenant '{}' or not pending",
            post_id, tenant
        )))
    }
}

/// Show queue statistics
async fn cmd_stats(db: &Database, format: &str) -> Result<()> {
    validate_format(format)?;

    let counts = db.count_by_status().await?;
    let total: i64 = counts.iter().map(|(_, n)| n).sum();

    if format == "json" {
        let mut obj = serde_json::Map::new();
        for (status, n) in &counts {
            obj.insert(status.as_str().to_string(), serde_json::json!(n));
        }
        obj.insert("total".to_string(), serde_json::json!(total));
        println!("{}", serde_json::Value::Object(obj));
    } else {
        for (status, n) in &counts {
            println!("{:<10} {}", status.as_str(), n);
        }
        println!("{:<10} {}", "total", total);
    }

    Ok(())
}

fn validate_format(format: &str) -> Result<()> {
    if format != "text" && format != "json" {
        return Err(OutboxError::InvalidInput(format!(
            "Invalid format '{}'. Must be 'text' or 'json'",
            format
        )));
    }
    Ok(())
}
