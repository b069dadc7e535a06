use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use garrison_hw::Camera;
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "io.garrison.Kiosk1",
    default_service = "io.garrison.Kiosk1",
    default_path = "/io/garrison/Kiosk1"
)]
trait Kiosk {
    fn status(&self) -> zbus::Result<String>;
    fn reload_enrollment(&self) -> zbus::Result<bool>;
    fn recent_punches(&self, limit: u32) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "garrison", about = "Garrison attendance kiosk CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon status
    Status,
    /// Rebuild the enrolled face set from the photo directory
    Reload,
    /// List the most recent punches
    Punches {
        /// Number of punches to show
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },
    /// List V4L2 capture devices
    Cameras,
    /// Capture one frame directly from a camera (bypasses the daemon)
    Test {
        /// Camera device path
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        /// Where to write the captured frame
        #[arg(short, long, default_value = "garrison-test.jpg")]
        output: PathBuf,
        #[arg(long, default_value_t = 640)]
        width: u32,
        #[arg(long, default_value_t = 480)]
        height: u32,
    },
}

async fn connect(session: bool) -> Result<KioskProxy<'static>> {
    let conn = if session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("cannot connect to D-Bus")?;
    KioskProxy::new(&conn)
        .await
        .context("garrisond is not reachable on D-Bus")
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw).context("daemon sent invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn run_camera_test(device: &str, output: &Path, width: u32, height: u32) -> Result<()> {
    let camera = Camera::open(device, width, height)?;
    println!(
        "{}: {}x{} {:?}",
        camera.device_path,
        camera.width,
        camera.height,
        camera.pixel_format()
    );

    let frame = camera.capture_frame()?;
    let (w, h) = frame.dimensions();
    let rgb: Vec<u8> = frame
        .data()
        .chunks_exact(3)
        .flat_map(|px| [px[2], px[1], px[0]])
        .collect();
    let Some(image) = image::RgbImage::from_raw(w, h, rgb) else {
        bail!("captured frame has inconsistent size {w}x{h}");
    };
    image
        .save(output)
        .with_context(|| format!("cannot write {}", output.display()))?;

    let blank = frame.is_blank();
    println!("Captured {w}x{h} frame -> {}", output.display());
    if blank {
        println!("Warning: frame is completely black (lens covered or camera not ready?)");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Status => {
            let proxy = connect(cli.session).await?;
            print_json(&proxy.status().await?)?;
        }
        Commands::Reload => {
            let proxy = connect(cli.session).await?;
            if proxy.reload_enrollment().await? {
                println!("Enrollment rebuild started");
            } else {
                println!("Enrollment rebuild already running; try again shortly");
            }
        }
        Commands::Punches { limit } => {
            let proxy = connect(cli.session).await?;
            let raw = proxy.recent_punches(limit).await?;
            let punches: Vec<serde_json::Value> =
                serde_json::from_str(&raw).context("daemon sent invalid JSON")?;
            if punches.is_empty() {
                println!("No punches recorded");
            }
            for p in punches {
                println!(
                    "{:>6}  {}  user {:<6} {:<3}  {}",
                    p["event_id"].to_string(),
                    p["date_time_event"].as_str().unwrap_or("?"),
                    p["user_id"].to_string(),
                    p["punch_type"].as_str().unwrap_or("?"),
                    p["photo_url"].as_str().unwrap_or(""),
                );
            }
        }
        Commands::Cameras => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for d in devices {
                println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
            }
        }
        Commands::Test {
            device,
            output,
            width,
            height,
        } => {
            tracing::debug!(%device, "running camera test");
            run_camera_test(&device, &output, width, height)?;
        }
    }

    Ok(())
}
