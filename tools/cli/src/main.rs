//! Lectern CLI - Command line client for the Lectern backend.
//!
//! Every command goes through a sync client, so reads are cached and
//! de-duplicated and writes invalidate what they touch.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use lectern_api::{
    default_config, Catalog, DocumentUpdate, DocumentUpload, LectureRequest, Service,
    DEFAULT_SIMILAR_LIMIT,
};
use lectern_sync::{EntryStatus, PollConfig, SyncClient, SyncConfig};
use lectern_transport::{HttpConfig, HttpTransport, SharedTransport};

const DEFAULT_BASE_URL: &str = "http://localhost:8080";

#[derive(Parser)]
#[command(name = "lectern")]
#[command(about = "Lectern - Lecture documents, quizzes and summaries")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Backend base URL.
    #[arg(long, env = "LECTERN_BASE_URL", default_value = DEFAULT_BASE_URL)]
    base_url: String,

    /// Sync configuration file (JSON). Defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Request timeout in seconds.
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check service health.
    Health {
        /// Only check this service.
        #[arg(short, long)]
        service: Option<Service>,

        /// Keep polling until interrupted.
        #[arg(short, long)]
        watch: bool,

        /// Poll interval in milliseconds (with --watch).
        #[arg(short, long)]
        interval: Option<u64>,
    },

    /// List services registered at the gateway.
    Services,

    /// List documents.
    Documents {
        /// Only documents of this lecture.
        #[arg(short, long)]
        lecture: Option<String>,

        /// Full-text search.
        #[arg(short, long, conflicts_with = "lecture")]
        search: Option<String>,

        /// Similarity search.
        #[arg(long, conflicts_with_all = ["lecture", "search"])]
        similar: Option<String>,

        /// Result count of a similarity search.
        #[arg(long, default_value_t = DEFAULT_SIMILAR_LIMIT)]
        limit: u32,
    },

    /// Show one document.
    Document {
        id: i64,
    },

    /// Download the file of a document.
    Download {
        id: i64,

        /// Output path (default: the original file name).
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Upload a document into a lecture.
    Upload {
        /// Lecture to upload into.
        #[arg(short, long)]
        lecture: String,

        /// File to upload.
        #[arg(short, long)]
        file: PathBuf,

        /// Document name (default: file name).
        #[arg(short, long)]
        name: Option<String>,

        /// Document description.
        #[arg(short, long)]
        description: Option<String>,
    },

    /// Rename a document.
    Rename {
        id: i64,

        /// Lecture the document belongs to.
        #[arg(short, long)]
        lecture: String,

        /// New name.
        #[arg(short, long)]
        name: String,

        /// New description.
        #[arg(short, long)]
        description: Option<String>,
    },

    /// Delete a document.
    Delete {
        id: i64,

        /// Lecture the document belongs to.
        #[arg(short, long)]
        lecture: String,
    },

    /// Show the chat conversation of a document.
    Conversation {
        id: i64,

        /// Clear the conversation instead.
        #[arg(long)]
        clear: bool,
    },

    /// Ask a question about a document.
    Chat {
        id: i64,
        message: String,
    },

    /// Generate quiz questions for a document.
    Quiz {
        id: i64,
    },

    /// Show the summary of a document.
    Summary {
        id: i64,

        /// Generate a new summary.
        #[arg(short, long)]
        regenerate: bool,
    },

    /// List lectures.
    Lectures {
        /// Only lectures of this user.
        #[arg(short, long)]
        user: Option<String>,
    },

    /// Create a lecture.
    CreateLecture {
        #[arg(short, long)]
        user: String,

        #[arg(short, long)]
        name: String,
    },

    /// Rename a lecture.
    RenameLecture {
        id: i64,

        #[arg(short, long)]
        user: String,

        #[arg(short, long)]
        name: String,
    },

    /// Delete a lecture and its documents.
    DeleteLecture {
        id: i64,

        #[arg(short, long)]
        user: String,
    },

    /// Print the effective sync configuration.
    Config,
}

/// Sync client plus the catalog bound to its transport.
struct App {
    client: SyncClient,
    catalog: Catalog,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(cli.config.as_deref())?;
    if let Commands::Config = cli.command {
        println!("{}", config.to_json_pretty()?);
        return Ok(());
    }

    let app = connect(&cli.base_url, Duration::from_secs(cli.timeout), config)?;

    match cli.command {
        Commands::Health {
            service,
            watch,
            interval,
        } => cmd_health(&app, service, watch, interval).await,

        Commands::Services => cmd_services(&app).await,

        Commands::Documents {
            lecture,
            search,
            similar,
            limit,
        } => cmd_documents(&app, lecture, search, similar, limit).await,

        Commands::Document { id } => cmd_document(&app, id).await,

        Commands::Download { id, output } => cmd_download(&app, id, output).await,

        Commands::Upload {
            lecture,
            file,
            name,
            description,
        } => cmd_upload(&app, &lecture, &file, name, description).await,

        Commands::Rename {
            id,
            lecture,
            name,
            description,
        } => cmd_rename(&app, id, &lecture, name, description).await,

        Commands::Delete { id, lecture } => cmd_delete(&app, id, &lecture).await,

        Commands::Conversation { id, clear } => cmd_conversation(&app, id, clear).await,

        Commands::Chat { id, message } => cmd_chat(&app, id, &message).await,

        Commands::Quiz { id } => cmd_quiz(&app, id).await,

        Commands::Summary { id, regenerate } => cmd_summary(&app, id, regenerate).await,

        Commands::Lectures { user } => cmd_lectures(&app, user).await,

        Commands::CreateLecture { user, name } => cmd_create_lecture(&app, &user, &name).await,

        Commands::RenameLecture { id, user, name } => {
            cmd_rename_lecture(&app, id, &user, &name).await
        }

        Commands::DeleteLecture { id, user } => cmd_delete_lecture(&app, id, &user).await,

        Commands::Config => Ok(()),
    }
}

fn load_config(path: Option<&Path>) -> Result<SyncConfig> {
    match path {
        Some(path) => SyncConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(default_config()),
    }
}

fn connect(base_url: &str, timeout: Duration, config: SyncConfig) -> Result<App> {
    let http = HttpTransport::with_config(HttpConfig::new(base_url).with_timeout(timeout))
        .context("Failed to create HTTP transport")?;
    info!("Using backend at {}", http.base_url());

    let transport: SharedTransport = Arc::new(http);
    Ok(App {
        client: SyncClient::new(config),
        catalog: Catalog::new(transport),
    })
}

/// Check service health, once or continuously.
async fn cmd_health(
    app: &App,
    service: Option<Service>,
    watch: bool,
    interval: Option<u64>,
) -> Result<()> {
    let services: Vec<Service> = match service {
        Some(service) => vec![service],
        None => Service::ALL.to_vec(),
    };

    if !watch {
        for service in services {
            match app.client.fetch(&app.catalog.health(service)).await {
                Ok(health) => println!("  {:<10} {}", service, health.status),
                Err(e) => println!("  {:<10} unreachable ({})", service, e),
            }
        }
        return Ok(());
    }

    let mut poll = app.client.config().poll.clone();
    if let Some(interval) = interval {
        poll.interval = Duration::from_millis(interval);
    }

    let mut subscriptions = Vec::new();
    for service in services {
        let accessor = app.catalog.health(service);
        subscriptions.push(app.client.store().subscribers().subscribe(
            accessor.key().clone(),
            move |event| match event.status {
                EntryStatus::Success => {
                    let status = event
                        .value
                        .as_ref()
                        .and_then(|value| value.get("status").and_then(|s| s.as_str()))
                        .unwrap_or("unknown");
                    println!("  {:<10} {}", service, status);
                }
                EntryStatus::Error => println!("  {:<10} unreachable", service),
                _ => {}
            },
        ));
        app.client.start_polling_with(&accessor, poll.clone());
    }

    println!("Watching health every {:?}. Press Ctrl-C to stop.", poll.interval);
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    for service in Service::ALL {
        let key = app.catalog.health(service).key().clone();
        if let Some(status) = app.client.poll_status(&key) {
            if status.persistent_error {
                warn!("{} failed {} times in a row", service, status.consecutive_failures);
            }
        }
    }
    app.client.shutdown();
    drop(subscriptions);
    Ok(())
}

async fn cmd_services(app: &App) -> Result<()> {
    let services = app
        .client
        .read(&app.catalog.gateway_services())
        .await
        .context("Failed to list services")?;

    if services.services.is_empty() {
        println!("No services registered.");
    } else {
        println!("Registered services:");
        for name in services.services {
            let instances = services.instances.get(&name).map_or(0, Vec::len);
            println!("  {} ({} instances)", name, instances);
        }
    }
    Ok(())
}

async fn cmd_documents(
    app: &App,
    lecture: Option<String>,
    search: Option<String>,
    similar: Option<String>,
    limit: u32,
) -> Result<()> {
    let accessor = match (lecture, search, similar) {
        (Some(lecture), _, _) => app.catalog.lecture_documents(&lecture),
        (_, Some(query), _) => app.catalog.search(&query)?,
        (_, _, Some(query)) => app.catalog.similar(&query, limit)?,
        _ => app.catalog.documents(),
    };

    let documents = app
        .client
        .read(&accessor)
        .await
        .context("Failed to list documents")?;

    if documents.is_empty() {
        println!("No documents.");
    } else {
        for document in documents {
            let filename = document.original_filename.unwrap_or_default();
            println!("  [{}] {} ({})", document.id, document.name, filename);
        }
    }
    Ok(())
}

async fn cmd_download(app: &App, id: i64, output: Option<PathBuf>) -> Result<()> {
    let output = match output {
        Some(path) => path,
        None => {
            let document = app
                .client
                .read(&app.catalog.document(id))
                .await
                .context("Failed to read document")?;
            download_path(id, document.original_filename.as_deref())
        }
    };

    let data = app
        .catalog
        .download(id)
        .await
        .context("Failed to download document")?;
    tokio::fs::write(&output, &data)
        .await
        .with_context(|| format!("Failed to write {}", output.display()))?;

    info!(id, path = %output.display(), bytes = data.len(), "Downloaded document");
    println!("Saved {} bytes to {}", data.len(), output.display());
    Ok(())
}

/// Local file name for a download; server names are reduced to their last component.
fn download_path(id: i64, original: Option<&str>) -> PathBuf {
    original
        .and_then(|name| Path::new(name).file_name())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(format!("document-{}", id)))
}

async fn cmd_document(app: &App, id: i64) -> Result<()> {
    let document = app
        .client
        .read(&app.catalog.document(id))
        .await
        .context("Failed to read document")?;

    println!("Document {}:", document.id);
    println!("  Name: {}", document.name);
    if let Some(description) = &document.description {
        println!("  Description: {}", description);
    }
    if let Some(filename) = &document.original_filename {
        println!("  File: {}", filename);
    }
    if let Some(size) = document.file_size {
        println!("  Size: {} bytes", size);
    }
    if let Some(lecture) = &document.lecture_id {
        println!("  Lecture: {}", lecture);
    }
    if let Some(created) = document.created_at {
        println!("  Created: {}", created);
    }
    println!("  Chunks: {}", document.chunk_count);
    Ok(())
}

fn guess_content_type(path: &Path) -> Option<String> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    let content_type = match extension.as_str() {
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "md" => "text/markdown",
        "ppt" => "application/vnd.ms-powerpoint",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        _ => return None,
    };
    Some(content_type.to_string())
}

async fn cmd_upload(
    app: &App,
    lecture: &str,
    file: &Path,
    name: Option<String>,
    description: Option<String>,
) -> Result<()> {
    info!("Uploading {} to lecture {}", file.display(), lecture);

    let data = tokio::fs::read(file)
        .await
        .context("Failed to read source file")?;
    let filename = file
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .context("Source path has no file name")?;

    let mut metadata = DocumentUpdate::new(name.unwrap_or_else(|| filename.clone()));
    metadata.description = description;
    let upload = DocumentUpload {
        lecture_id: lecture.to_string(),
        metadata,
        filename,
        content_type: guess_content_type(file),
        data,
    };

    let outcome = app
        .client
        .mutate(app.catalog.upload_document(upload))
        .await
        .context("Failed to upload document")?;

    println!(
        "Document uploaded: {} (id {})",
        outcome.value["name"].as_str().unwrap_or("?"),
        outcome.value["id"]
    );
    Ok(())
}

async fn cmd_rename(
    app: &App,
    id: i64,
    lecture: &str,
    name: String,
    description: Option<String>,
) -> Result<()> {
    let mut update = DocumentUpdate::new(name);
    update.description = description;

    app.client
        .mutate(app.catalog.update_document(id, lecture, update))
        .await
        .context("Failed to rename document")?;

    println!("Document {} renamed.", id);
    Ok(())
}

async fn cmd_delete(app: &App, id: i64, lecture: &str) -> Result<()> {
    info!("Deleting document {}", id);

    app.client
        .mutate(app.catalog.delete_document(id, lecture))
        .await
        .context("Failed to delete document")?;

    println!("Document {} deleted.", id);
    Ok(())
}

async fn cmd_conversation(app: &App, id: i64, clear: bool) -> Result<()> {
    if clear {
        app.client
            .mutate(app.catalog.clear_conversation(id))
            .await
            .context("Failed to clear conversation")?;
        println!("Conversation cleared.");
        return Ok(());
    }

    let messages = app
        .client
        .read(&app.catalog.conversation(id))
        .await
        .context("Failed to read conversation")?;

    if messages.is_empty() {
        println!("No messages yet.");
    }
    for message in messages {
        println!("[{:?}] {}", message.message_type, message.content);
    }
    Ok(())
}

async fn cmd_chat(app: &App, id: i64, message: &str) -> Result<()> {
    let outcome = app
        .client
        .mutate(app.catalog.send_chat(id, message))
        .await
        .context("Chat service error")?;

    let response: lectern_api::ChatResponse = serde_json::from_value((*outcome.value).clone())
        .context("Unexpected chat response")?;
    println!("{}", response.response);
    if !response.sources.is_empty() {
        println!("\nSources: {}", response.sources.join(", "));
    }
    Ok(())
}

async fn cmd_quiz(app: &App, id: i64) -> Result<()> {
    let questions = app
        .client
        .read(&app.catalog.quiz(id))
        .await
        .context("Failed to generate quiz")?;

    for (index, question) in questions.iter().enumerate() {
        println!("{}. {}", index + 1, question.question);
        for (option_index, option) in question.options.iter().enumerate() {
            let marker = if option_index == question.correct_answer {
                "*"
            } else {
                " "
            };
            println!("   {} {}", marker, option);
        }
        if !question.explanation.is_empty() {
            println!("   {}", question.explanation);
        }
    }
    Ok(())
}

async fn cmd_summary(app: &App, id: i64, regenerate: bool) -> Result<()> {
    let summary = if regenerate {
        let outcome = app
            .client
            .mutate(app.catalog.generate_summary(id))
            .await
            .context("Failed to generate summary")?;
        serde_json::from_value::<lectern_api::Summary>((*outcome.value).clone())
            .context("Unexpected summary response")?
    } else {
        app.client
            .read(&app.catalog.summary(id))
            .await
            .context("Failed to read summary")?
    };

    println!("{}", summary.summary);
    Ok(())
}

async fn cmd_lectures(app: &App, user: Option<String>) -> Result<()> {
    let accessor = match &user {
        Some(user) => app.catalog.user_lectures(user),
        None => app.catalog.lectures(),
    };
    let lectures = app
        .client
        .read(&accessor)
        .await
        .context("Failed to list lectures")?;

    if lectures.is_empty() {
        println!("No lectures.");
    }
    for lecture in lectures {
        println!("  [{}] {}", lecture.id, lecture.name);
    }
    Ok(())
}

async fn cmd_create_lecture(app: &App, user: &str, name: &str) -> Result<()> {
    let outcome = app
        .client
        .mutate(app.catalog.create_lecture(LectureRequest::new(name, user)))
        .await
        .context("Failed to create lecture")?;

    println!("Lecture created (id {}).", outcome.value["id"]);
    Ok(())
}

async fn cmd_rename_lecture(app: &App, id: i64, user: &str, name: &str) -> Result<()> {
    app.client
        .mutate(app.catalog.update_lecture(id, LectureRequest::new(name, user)))
        .await
        .context("Failed to rename lecture")?;

    println!("Lecture {} renamed.", id);
    Ok(())
}

async fn cmd_delete_lecture(app: &App, id: i64, user: &str) -> Result<()> {
    info!("Deleting lecture {}", id);

    app.client
        .mutate(app.catalog.delete_lecture(id, user))
        .await
        .context("Failed to delete lecture")?;

    println!("Lecture {} deleted.", id);
    Ok(())
}
