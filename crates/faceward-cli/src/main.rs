use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "faceward", about = "Faceward face verification CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start continuous recognition (restarts it if already running)
    Start,
    /// Stop continuous recognition
    Stop,
    /// Show daemon status
    Status,
    /// Verify the face in an image file
    Verify {
        /// JPEG or PNG image to check
        image: PathBuf,
        /// Identity recorded on the access event
        #[arg(short, long, default_value = "faceward-cli")]
        requester: String,
    },
    /// Re-read the dataset directory and rebuild the encoding cache if needed
    Reload,
    /// List V4L2 capture devices (does not need the daemon)
    Devices,
}

#[zbus::proxy(
    interface = "org.faceward.Faceward1",
    default_service = "org.faceward.Faceward1",
    default_path = "/org/faceward/Faceward1"
)]
trait Faceward {
    async fn start_recognition(&self) -> zbus::Result<String>;
    async fn stop_recognition(&self) -> zbus::Result<String>;
    async fn verify(&self, image_path: &str, requester: &str) -> zbus::Result<String>;
    async fn reload_dataset(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

/// Print the daemon's JSON reply, one `key: value` per line.
fn print_reply(raw: &str) {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Object(fields)) => {
            for (key, value) in fields {
                match value {
                    serde_json::Value::String(s) => println!("{key}: {s}"),
                    other => println!("{key}: {other}"),
                }
            }
        }
        _ => println!("{raw}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Commands::Devices = cli.command {
        let devices = faceward_hw::Camera::list_devices();
        if devices.is_empty() {
            println!("No capture devices found");
        }
        for d in devices {
            println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
        }
        return Ok(());
    }

    let conn = zbus::Connection::session()
        .await
        .context("connecting to the D-Bus session bus")?;
    let proxy = FacewardProxy::new(&conn)
        .await
        .context("facewardd is not reachable")?;

    let reply = match cli.command {
        Commands::Start => proxy.start_recognition().await?,
        Commands::Stop => proxy.stop_recognition().await?,
        Commands::Status => proxy.status().await?,
        Commands::Verify { image, requester } => {
            // The daemon resolves the path itself.
            let image = std::fs::canonicalize(&image)
                .with_context(|| format!("cannot read {}", image.display()))?;
            proxy
                .verify(&image.to_string_lossy(), &requester)
                .await?
        }
        Commands::Reload => proxy.reload_dataset().await?,
        Commands::Devices => return Ok(()),
    };
    print_reply(&reply);

    Ok(())
}
