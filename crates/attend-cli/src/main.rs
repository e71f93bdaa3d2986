use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use serde_json::Value;
use std::path::PathBuf;

#[zbus::proxy(
    interface = "org.attend.Daemon1",
    default_service = "org.attend.Daemon1",
    default_path = "/org/attend/Daemon1"
)]
trait Attend {
    async fn enroll(
        &self,
        identity_id: &str,
        display_name: &str,
        code: &str,
        label: &str,
        image: &[u8],
    ) -> zbus::Result<String>;
    async fn remove_identity(&self, identity_id: &str) -> zbus::Result<u32>;
    async fn list_identities(&self) -> zbus::Result<String>;
    async fn set_active(&self, identity_id: &str, active: bool) -> zbus::Result<bool>;
    async fn recent_logs(&self, limit: u32) -> zbus::Result<String>;
    async fn query_logs(
        &self,
        identity_id: &str,
        camera_id: &str,
        event_type: &str,
        since: &str,
        until: &str,
        limit: u32,
    ) -> zbus::Result<String>;
    async fn list_cameras(&self) -> zbus::Result<String>;
    async fn set_policy(&self, policy: &str) -> zbus::Result<String>;
    async fn reset_counter(&self) -> zbus::Result<()>;
    async fn status(&self) -> zbus::Result<String>;

    #[zbus(signal)]
    fn state_changed(&self, snapshot_json: &str) -> zbus::Result<()>;
}

#[derive(Parser)]
#[command(name = "attend", about = "Face-recognition attendance CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a reference image for an identity
    Enroll {
        /// Identity id (e.g. an employee number)
        identity: String,
        /// Image file containing one face
        #[arg(short, long)]
        image: PathBuf,
        /// Display name; defaults to the identity id
        #[arg(short, long, default_value = "")]
        name: String,
        /// Optional employee/student code
        #[arg(short, long, default_value = "")]
        code: String,
        /// Reference label (e.g. "default", "glasses")
        #[arg(short, long, default_value = "default")]
        label: String,
    },
    /// Remove an identity and all its references
    Remove { identity: String },
    /// Let an identity be recognized again
    Activate { identity: String },
    /// Stop recognizing an identity without deleting it
    Deactivate { identity: String },
    /// List enrolled identities
    List,
    /// Show attendance events, newest first
    Logs {
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: u32,
        /// Only this identity
        #[arg(long)]
        identity: Option<String>,
        /// Only this camera
        #[arg(long)]
        camera: Option<String>,
        /// Only check-in or check-out events
        #[arg(long = "type")]
        event_type: Option<String>,
        /// Events at or after this time (RFC 3339 or YYYY-MM-DD)
        #[arg(long)]
        since: Option<String>,
        /// Events before this time (RFC 3339 or YYYY-MM-DD)
        #[arg(long)]
        until: Option<String>,
    },
    /// List registered cameras
    Cameras,
    /// Set the commit policy: check-in, check-out or alternate
    Mode { policy: String },
    /// Reset the alternating commit counter
    Reset,
    /// Show daemon status
    Status,
    /// Print state changes as they happen
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("connecting to D-Bus")?;
    let proxy = AttendProxy::new(&conn)
        .await
        .context("attendd is not reachable")?;

    match cli.command {
        Commands::Enroll {
            identity,
            image,
            name,
            code,
            label,
        } => {
            let bytes = std::fs::read(&image)
                .with_context(|| format!("reading {}", image.display()))?;
            let decoded = image::load_from_memory(&bytes)
                .with_context(|| format!("{} is not a readable image", image.display()))?;
            tracing::debug!(width = decoded.width(), height = decoded.height(), "image loaded");

            let outcome = proxy.enroll(&identity, &name, &code, &label, &bytes).await?;
            let outcome: Value = serde_json::from_str(&outcome)?;
            println!(
                "Enrolled {} ({}), {}-d embedding",
                identity,
                label,
                outcome["dimension"]
            );
        }
        Commands::Remove { identity } => {
            let removed = proxy.remove_identity(&identity).await?;
            if removed == 0 {
                println!("No references found for {identity}");
            } else {
                println!("Removed {identity} ({removed} reference(s))");
            }
        }
        Commands::Activate { identity } => {
            if proxy.set_active(&identity, true).await? {
                println!("Activated {identity}");
            } else {
                println!("No identity {identity}");
            }
        }
        Commands::Deactivate { identity } => {
            if proxy.set_active(&identity, false).await? {
                println!("Deactivated {identity}");
            } else {
                println!("No identity {identity}");
            }
        }
        Commands::List => {
            let rows: Vec<Value> = serde_json::from_str(&proxy.list_identities().await?)?;
            if rows.is_empty() {
                println!("No identities enrolled");
            }
            for row in &rows {
                println!("{}", format_identity(row));
            }
        }
        Commands::Logs {
            limit,
            identity,
            camera,
            event_type,
            since,
            until,
        } => {
            let filters = [identity, camera, event_type, since, until];
            let json = if filters.iter().all(Option::is_none) {
                proxy.recent_logs(limit).await?
            } else {
                let [identity, camera, event_type, since, until] =
                    filters.map(Option::unwrap_or_default);
                proxy
                    .query_logs(&identity, &camera, &event_type, &since, &until, limit)
                    .await?
            };
            let rows: Vec<Value> = serde_json::from_str(&json)?;
            if rows.is_empty() {
                println!("No attendance events");
            }
            for row in &rows {
                println!("{}", format_log(row));
            }
        }
        Commands::Cameras => {
            let rows: Vec<Value> = serde_json::from_str(&proxy.list_cameras().await?)?;
            if rows.is_empty() {
                println!("No cameras registered");
            }
            for row in &rows {
                println!("{}", format_camera(row));
            }
        }
        Commands::Mode { policy } => {
            let active = proxy.set_policy(&policy).await?;
            println!("Commit policy: {active}");
        }
        Commands::Reset => {
            proxy.reset_counter().await?;
            println!("Commit counter reset");
        }
        Commands::Status => {
            let status: Value = serde_json::from_str(&proxy.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Watch => {
            let mut changes = proxy.receive_state_changed().await?;
            println!("Watching for state changes (Ctrl-C to stop)");
            while let Some(signal) = changes.next().await {
                let args = signal.args()?;
                let status: Value = serde_json::from_str(args.snapshot_json())?;
                println!("{}", format_state(&status));
            }
        }
    }

    Ok(())
}

fn text(value: &Value) -> &str {
    value.as_str().unwrap_or("-")
}

fn format_identity(row: &Value) -> String {
    let active = if row["is_active"].as_bool().unwrap_or(false) {
        ""
    } else {
        " [inactive]"
    };
    format!(
        "{:<16} {:<24} {:<10} refs={}{}",
        text(&row["identity_id"]),
        text(&row["display_name"]),
        text(&row["code"]),
        row["references"],
        active
    )
}

fn format_log(row: &Value) -> String {
    format!(
        "{} {:<9} {:<12} {:<16} {:<24} {:.3}",
        text(&row["event_time"]),
        text(&row["event_type"]),
        text(&row["camera_id"]),
        text(&row["identity_id"]),
        text(&row["display_name"]),
        row["confidence"].as_f64().unwrap_or(0.0)
    )
}

fn format_camera(row: &Value) -> String {
    let active = if row["is_active"].as_bool().unwrap_or(false) {
        ""
    } else {
        " [inactive]"
    };
    format!(
        "{:<12} {:<24} {:<24} since {}{}",
        text(&row["camera_id"]),
        text(&row["label"]),
        text(&row["location"]),
        text(&row["created_at"]),
        active
    )
}

fn format_state(status: &Value) -> String {
    let locked = text(&status["locked_identity"]);
    let last = match status["last_match"].as_object() {
        Some(m) if m.get("matched").and_then(Value::as_bool).unwrap_or(false) => format!(
            "match {} ({:.3})",
            m.get("identity_id").map(text).unwrap_or("-"),
            m.get("score").and_then(Value::as_f64).unwrap_or(0.0)
        ),
        Some(_) => "unknown face".to_string(),
        None => "no face".to_string(),
    };
    let mut line = format!(
        "locked={locked} commits={} {last}",
        status["commit_count"]
    );
    if let Some(err) = status["last_log_error"].as_str() {
        line.push_str(&format!(" log_error=\"{err}\""));
    }
    line
}
