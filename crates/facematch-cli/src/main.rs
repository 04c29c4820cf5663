use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "org.facematch.FaceMatch1",
    default_service = "org.facematch.FaceMatch1",
    default_path = "/org/facematch/FaceMatch1"
)]
trait FaceMatch {
    fn enroll(&self, name: &str, image: &[u8]) -> zbus::Result<String>;
    fn identify(&self, image: &[u8]) -> zbus::Result<String>;
    fn rank(&self, image: &[u8], k: u32) -> zbus::Result<String>;
    fn list_identities(&self) -> zbus::Result<String>;
    fn remove(&self, name: &str) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "facematch", about = "Enroll and identify faces via facematchd")]
struct Cli {
    /// Talk to the daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a face image under a name
    Enroll {
        /// Identity name (e.g., "alice")
        #[arg(short, long)]
        name: String,
        /// Image file (JPEG, PNG, ...)
        image: PathBuf,
    },
    /// Identify the face in an image
    Identify {
        image: PathBuf,
    },
    /// Show the closest enrolled identities for an image
    Rank {
        image: PathBuf,
        /// Number of identities to show
        #[arg(short, default_value_t = 5)]
        k: u32,
    },
    /// List enrolled identities
    List,
    /// Remove an identity and all of its embeddings
    Remove {
        name: String,
    },
    /// Show daemon status
    Status,
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

/// Pretty-print a JSON reply; fall back to the raw string.
fn print_reply(reply: &str) {
    match serde_json::from_str::<serde_json::Value>(reply) {
        Ok(v) => println!("{}", serde_json::to_string_pretty(&v).unwrap_or_else(|_| reply.to_string())),
        Err(_) => println!("{reply}"),
    }
}

/// Render daemon-side failures as `Kind: message`.
fn describe_error(err: zbus::Error) -> anyhow::Error {
    match err {
        zbus::Error::MethodError(name, msg, _) => {
            let kind = name.as_str().rsplit('.').next().unwrap_or("Error").to_string();
            anyhow::anyhow!("{kind}: {}", msg.unwrap_or_default())
        }
        other => anyhow::Error::new(other).context("calling facematchd"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("connecting to D-Bus")?;
    let proxy = FaceMatchProxy::new(&conn).await?;
    tracing::debug!(system = cli.system, "connected to facematchd");

    let reply = match cli.command {
        Commands::Enroll { name, image } => {
            let bytes = read_image(&image)?;
            proxy.enroll(&name, &bytes).await
        }
        Commands::Identify { image } => {
            let bytes = read_image(&image)?;
            proxy.identify(&bytes).await
        }
        Commands::Rank { image, k } => {
            let bytes = read_image(&image)?;
            proxy.rank(&bytes, k).await
        }
        Commands::List => proxy.list_identities().await,
        Commands::Remove { name } => proxy.remove(&name).await,
        Commands::Status => proxy.status().await,
    }
    .map_err(describe_error)?;

    print_reply(&reply);
    Ok(())
}
