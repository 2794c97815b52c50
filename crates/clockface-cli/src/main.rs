use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use clockface_core::liveness::{SignalScores, DEFAULT_LIVENESS_THRESHOLD};
use clockface_core::types::fit_within;
use clockface_core::{LivenessConfig, LivenessScorer, OnnxLivenessClassifier};
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "org.clockface.Clockface1",
    default_service = "org.clockface.Clockface1",
    default_path = "/org/clockface/Clockface1"
)]
trait Clockface {
    async fn enroll(
        &self,
        employee_id: &str,
        name: &str,
        department: &str,
        image: &[u8],
    ) -> zbus::Result<f64>;
    async fn mark_attendance(&self, image: &[u8]) -> zbus::Result<String>;
    async fn verify(&self, employee_id: &str, image: &[u8]) -> zbus::Result<(bool, f64)>;
    async fn score_liveness(&self, image: &[u8]) -> zbus::Result<(bool, f64)>;
    async fn day_record(&self, employee_id: &str, date: &str) -> zbus::Result<String>;
    async fn report(&self, from: &str, to: &str) -> zbus::Result<String>;
    async fn list_employees(&self) -> zbus::Result<String>;
    async fn deactivate(&self, employee_id: &str) -> zbus::Result<bool>;
    async fn set_liveness_threshold(&self, threshold: f64) -> zbus::Result<()>;
    async fn set_liveness_enabled(&self, enabled: bool) -> zbus::Result<()>;
    async fn set_match_threshold(&self, threshold: f64) -> zbus::Result<()>;
    async fn recommend_threshold(&self) -> zbus::Result<f64>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "clockface", about = "Clockface face-recognition attendance CLI")]
struct Cli {
    /// Talk to a daemon on the session bus (development)
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ThresholdKind {
    Liveness,
    Match,
}

#[derive(Clone, Copy, ValueEnum)]
enum Switch {
    On,
    Off,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll an employee from a face image
    Enroll {
        /// Employee id (3-20 characters of A-Z, a-z, 0-9, _ or -)
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        department: String,
        image: PathBuf,
    },
    /// Recognize a face and record the next in/out event
    Mark { image: PathBuf },
    /// Check a face image against one employee
    Verify { id: String, image: PathBuf },
    /// Score liveness of a face image
    Liveness {
        image: PathBuf,
        /// Score locally without the daemon and show per-signal scores
        #[arg(long)]
        offline: bool,
        /// Trained liveness model for offline scoring
        #[arg(long, requires = "offline")]
        model: Option<PathBuf>,
        #[arg(long, default_value_t = DEFAULT_LIVENESS_THRESHOLD)]
        threshold: f32,
    },
    /// Show one employee's events for a day
    Day {
        id: String,
        /// Date as YYYY-MM-DD (default: today)
        #[arg(long)]
        date: Option<String>,
    },
    /// Show all events in a date range (default: the last 30 days)
    Report {
        /// First day, YYYY-MM-DD
        #[arg(long)]
        from: Option<String>,
        /// Last day, YYYY-MM-DD (default: today)
        #[arg(long)]
        to: Option<String>,
    },
    /// List enrolled employees
    List,
    /// Deactivate an employee (history is kept)
    Deactivate { id: String },
    /// Update a threshold on the running daemon
    Threshold { kind: ThresholdKind, value: f64 },
    /// Turn the daemon's liveness check on or off
    LivenessGate { state: Switch },
    /// Suggest a match threshold from recent attendance scores
    Recommend,
    /// Show daemon status
    Status,
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw).context("daemon returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

async fn connect(session: bool) -> Result<ClockfaceProxy<'static>> {
    let conn = if session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("failed to connect to D-Bus")?;
    ClockfaceProxy::new(&conn)
        .await
        .context("clockfaced is not reachable")
}

/// Score liveness locally, bypassing the daemon.
fn liveness_offline(path: &Path, model: Option<&Path>, threshold: f32) -> Result<()> {
    let img = image::open(path).with_context(|| format!("failed to decode {}", path.display()))?;
    let img = fit_within(img, 640);

    let config = LivenessConfig {
        enabled: true,
        threshold,
    };
    let mut scorer = match model {
        Some(path) => {
            let classifier = OnnxLivenessClassifier::load(path)?;
            LivenessScorer::with_classifier(Box::new(classifier), config)?
        }
        None => LivenessScorer::heuristic(config)?,
    };

    let signals = SignalScores::compute(&img);
    println!("color:      {:.3}", signals.color);
    println!("texture:    {:.3}", signals.texture);
    println!("frequency:  {:.3}", signals.frequency);
    println!("reflection: {:.3}", signals.reflection);

    let verdict = scorer.score(&img);
    println!(
        "{} ({}): score {:.3}",
        if verdict.is_real { "REAL" } else { "SPOOF" },
        scorer.estimator_name(),
        verdict.score
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Commands::Liveness {
        image,
        offline: true,
        model,
        threshold,
    } = &cli.command
    {
        return liveness_offline(image, model.as_deref(), *threshold);
    }

    let proxy = connect(cli.session).await?;

    match cli.command {
        Commands::Enroll {
            id,
            name,
            department,
            image,
        } => {
            let bytes = read_image(&image)?;
            let quality = proxy.enroll(&id, &name, &department, &bytes).await?;
            println!("Enrolled {id} (quality {quality:.2})");
            if quality < 0.5 {
                println!("warning: low image quality; consider re-enrolling with a sharper, well-lit photo");
            }
        }
        Commands::Mark { image } => {
            let raw = proxy.mark_attendance(&read_image(&image)?).await?;
            print_json(&raw)?;
        }
        Commands::Verify { id, image } => {
            let (matched, score) = proxy.verify(&id, &read_image(&image)?).await?;
            println!("{} (score {score:.3})", if matched { "MATCH" } else { "NO MATCH" });
        }
        Commands::Liveness { image, .. } => {
            let (is_real, score) = proxy.score_liveness(&read_image(&image)?).await?;
            println!("{} (score {score:.3})", if is_real { "REAL" } else { "SPOOF" });
        }
        Commands::Day { id, date } => {
            let raw = proxy.day_record(&id, date.as_deref().unwrap_or("")).await?;
            print_json(&raw)?;
        }
        Commands::Report { from, to } => {
            let raw = proxy
                .report(from.as_deref().unwrap_or(""), to.as_deref().unwrap_or(""))
                .await?;
            print_json(&raw)?;
        }
        Commands::List => print_json(&proxy.list_employees().await?)?,
        Commands::Deactivate { id } => {
            if !proxy.deactivate(&id).await? {
                bail!("no active employee '{id}'");
            }
            println!("Deactivated {id}");
        }
        Commands::Threshold { kind, value } => {
            match kind {
                ThresholdKind::Liveness => proxy.set_liveness_threshold(value).await?,
                ThresholdKind::Match => proxy.set_match_threshold(value).await?,
            }
            println!("Threshold updated to {value}");
        }
        Commands::LivenessGate { state } => {
            let enabled = matches!(state, Switch::On);
            proxy.set_liveness_enabled(enabled).await?;
            if enabled {
                println!("Liveness check enabled");
            } else {
                println!("Liveness check disabled; spoofed captures will be accepted");
            }
        }
        Commands::Recommend => {
            println!("{:.3}", proxy.recommend_threshold().await?);
        }
        Commands::Status => print_json(&proxy.status().await?)?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_range_is_optional() {
        let cli = Cli::try_parse_from(["clockface", "report", "--from", "2024-03-01"]).unwrap();
        match cli.command {
            Commands::Report { from, to } => {
                assert_eq!(from.as_deref(), Some("2024-03-01"));
                assert!(to.is_none());
            }
            _ => panic!("expected report"),
        }
    }

    #[test]
    fn test_liveness_gate_takes_on_or_off() {
        let cli = Cli::try_parse_from(["clockface", "--session", "liveness-gate", "off"]).unwrap();
        assert!(cli.session);
        assert!(matches!(cli.command, Commands::LivenessGate { state: Switch::Off }));
        assert!(Cli::try_parse_from(["clockface", "liveness-gate", "maybe"]).is_err());
    }

    #[test]
    fn test_model_requires_offline() {
        assert!(Cli::try_parse_from(["clockface", "liveness", "face.png", "--model", "m.onnx"]).is_err());
        assert!(Cli::try_parse_from(["clockface", "liveness", "face.png", "--offline", "--model", "m.onnx"]).is_ok());
    }
}
