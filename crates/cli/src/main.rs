use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use veo_client::api::{LoginRequest, RegisterRequest, StatusSource, VideoApi, VideoService};
use veo_client::config::ClientConfig;
use veo_client::orchestrator::{GenerateOptions, GenerationError, GenerationOrchestrator};
use veo_client::store::ClientStateStore;
use veo_client::tracker::JobTracker;
use veo_client::transport::TransportClient;
use veo_core::generation::{AspectRatio, GenerationRequest, ReferenceImage};
use veo_core::job::{GenerationJob, JobStatus};

#[derive(Parser, Debug)]
#[command(name = "veo", about = "Generate videos with the Veo service", version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sign in and store the session credential.
    Login {
        #[arg(long)]
        email: String,
        #[arg(long, env = "VEO_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Create an account and sign in.
    Register {
        #[arg(long)]
        email: String,
        #[arg(long, env = "VEO_PASSWORD", hide_env_values = true)]
        password: String,
        #[arg(long)]
        name: Option<String>,
    },
    /// Forget the stored credential.
    Logout,
    /// Submit a generation and follow it to completion.
    Generate {
        #[arg(long)]
        prompt: String,
        /// Length in seconds.
        #[arg(long, default_value_t = 5)]
        duration: u32,
        /// One of 16:9, 9:16, 1:1.
        #[arg(long, default_value = "16:9")]
        aspect_ratio: AspectRatio,
        /// Reference image (PNG, JPEG or WebP).
        #[arg(long)]
        image: Option<PathBuf>,
        /// Give up tracking after this many seconds.
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Show the current status of a job.
    Status { id: String },
    /// Cancel a job.
    Cancel { id: String },
    /// Download a finished video.
    Download {
        id: String,
        #[arg(long, short)]
        output: PathBuf,
    },
}

struct Client {
    api: Arc<VideoApi>,
    orchestrator: GenerationOrchestrator,
}

fn connect(config: &ClientConfig) -> Result<Client> {
    let transport = Arc::new(TransportClient::from_config(config)?);
    let api = Arc::new(
        VideoApi::new(transport)
            .with_transfer_timeout(config.transfer_timeout)
            .with_batch_submit(config.batch_submit),
    );
    let tracker = JobTracker::new(
        Arc::clone(&api) as Arc<dyn StatusSource>,
        config.tracker_config(),
    );
    let orchestrator = GenerationOrchestrator::new(
        Arc::clone(&api) as Arc<dyn VideoService>,
        tracker,
        Arc::new(ClientStateStore::new()),
    );
    Ok(Client { api, orchestrator })
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    init_tracing();

    let args = Args::parse();
    let config = ClientConfig::from_env()?;
    let client = connect(&config)?;

    match args.command {
        Command::Login { email, password } => {
            client
                .api
                .login(&LoginRequest { email, password })
                .await
                .context("Login failed")?;
            println!("Logged in.");
        }
        Command::Register {
            email,
            password,
            name,
        } => {
            client
                .api
                .register(&RegisterRequest {
                    email,
                    password,
                    full_name: name,
                })
                .await
                .context("Registration failed")?;
            println!("Account created, logged in.");
        }
        Command::Logout => {
            client.api.logout();
            println!("Logged out.");
        }
        Command::Generate {
            prompt,
            duration,
            aspect_ratio,
            image,
            timeout_secs,
        } => {
            let request = GenerationRequest::new(prompt, duration, aspect_ratio);
            let mut options = GenerateOptions::default().on_progress(print_progress);
            if let Some(secs) = timeout_secs {
                options = options.with_timeout(Duration::from_secs(secs));
            }
            generate(&client, request, image, options).await?;
        }
        Command::Status { id } => {
            let job = client.api.status(&id).await?;
            print_job(&job);
        }
        Command::Cancel { id } => {
            let outcome = client.orchestrator.cancel(Some(id.as_str())).await?;
            if outcome.remote_acknowledged {
                println!("Cancelled {}.", outcome.job_id);
            } else {
                println!(
                    "Stopped following {}; the service did not confirm the cancellation.",
                    outcome.job_id
                );
            }
        }
        Command::Download { id, output } => {
            let bytes = client.api.download(&id).await?;
            tokio::fs::write(&output, &bytes)
                .await
                .with_context(|| format!("Failed to write {}", output.display()))?;
            println!("Saved {} bytes to {}.", bytes.len(), output.display());
        }
    }

    Ok(())
}

/// Logs go to stderr so command output stays pipeable. Set
/// `VEO_LOG_FORMAT=json` for one JSON object per line.
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "veo_cli=info,veo_client=info".into());
    let fmt = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry().with(filter);

    if std::env::var("VEO_LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        registry.with(fmt.json()).init();
    } else {
        registry.with(fmt).init();
    }
}

async fn generate(
    client: &Client,
    request: GenerationRequest,
    image: Option<PathBuf>,
    options: GenerateOptions,
) -> Result<()> {
    let result = tokio::select! {
        result = submit_and_follow(client, request, image, options) => result?,
        _ = tokio::signal::ctrl_c() => {
            let outcome = client.orchestrator.cancel(None).await?;
            bail!("Interrupted; cancelled {}", outcome.job_id);
        }
    };

    match result {
        Ok(job) => {
            print_job(&job);
            Ok(())
        }
        Err(e) => report(e),
    }
}

async fn submit_and_follow(
    client: &Client,
    request: GenerationRequest,
    image: Option<PathBuf>,
    options: GenerateOptions,
) -> Result<Result<GenerationJob, GenerationError>> {
    let Some(path) = image else {
        return Ok(client.orchestrator.generate(request, options).await);
    };

    let reference = read_image(&path).await?;
    let options = options.on_encode_progress(|percent| {
        eprintln!("encoding reference image: {percent}%");
    });
    Ok(client
        .orchestrator
        .generate_with_image(request, reference, options)
        .await)
}

async fn read_image(path: &Path) -> Result<ReferenceImage> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let Some(mime_type) = ReferenceImage::mime_type_for(&file_name) else {
        bail!("{} is not a PNG, JPEG or WebP image", path.display());
    };
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(ReferenceImage::new(file_name, mime_type, bytes))
}

fn report(err: GenerationError) -> Result<()> {
    tracing::debug!(error = ?err, "Generation did not complete");
    if err.is_tracking_timeout() {
        // Not a failure: the job may still finish.
        println!("{}", err.user_message());
        return Ok(());
    }
    bail!("{}", err.user_message())
}

fn print_progress(job: &GenerationJob) {
    eprintln!("[{}] {:>5.1}% {}", job.status, job.progress, job.message);
}

fn print_job(job: &GenerationJob) {
    println!("id:       {}", job.generation_id);
    println!("status:   {}", job.status);
    println!("progress: {:.0}%", job.progress);
    if !job.message.is_empty() {
        println!("message:  {}", job.message);
    }
    match job.status {
        JobStatus::Completed => {
            if let Some(url) = &job.video_url {
                println!("video:    {url}");
            }
        }
        JobStatus::Failed => {
            if let Some(details) = &job.error_details {
                println!("error:    {details}");
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn generate_arguments_parse() {
        let args = Args::try_parse_from([
            "veo",
            "generate",
            "--prompt",
            "A calm lake at sunrise",
            "--aspect-ratio",
            "9:16",
            "--timeout-secs",
            "120",
        ])
        .unwrap();

        match args.command {
            Command::Generate {
                prompt,
                duration,
                aspect_ratio,
                image,
                timeout_secs,
            } => {
                assert_eq!(prompt, "A calm lake at sunrise");
                assert_eq!(duration, 5);
                assert_eq!(aspect_ratio, AspectRatio::Portrait);
                assert!(image.is_none());
                assert_eq!(timeout_secs, Some(120));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn unknown_aspect_ratio_is_rejected() {
        let result = Args::try_parse_from(["veo", "generate", "--prompt", "x", "--aspect-ratio", "4:3"]);
        assert!(result.is_err());
    }
}
