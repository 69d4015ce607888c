use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use deck::{DocumentId, NoopUndo, SlideId};
use deck_sync::{
    AssetUpload, DocumentHandle, FileTransport, MutationCoordinator, NewObject, NewSlide,
    ProgressFn, RecordTransport, SyncConfig,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "deck")]
#[command(about = "Deck CLI - Manage slide decks in a local record store")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true)]
    verbose: bool,

    /// Record store file (defaults to the user data directory)
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Engine settings (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new document
    NewDocument {
        /// Document title
        title: String,
    },

    /// List documents in the store
    Documents,

    /// List the slides of a document
    Slides {
        /// Document id
        document: Uuid,

        /// Include trashed slides
        #[arg(long)]
        all: bool,
    },

    /// Add a slide
    Add {
        /// Document id
        document: Uuid,

        /// Slide title
        #[arg(short, long)]
        title: Option<String>,

        /// Insert after this slide instead of at the end
        #[arg(long)]
        after: Option<Uuid>,

        /// Files to attach as slide content
        #[arg(short, long)]
        file: Vec<PathBuf>,

        /// Speaker notes
        #[arg(long)]
        notes: Option<String>,
    },

    /// Move a slide between two others
    Move {
        /// Document id
        document: Uuid,

        /// Slide to move
        slide: Uuid,

        /// Slide that should come right before it
        #[arg(long)]
        after: Option<Uuid>,

        /// Slide that should come right after it
        #[arg(long)]
        before: Option<Uuid>,
    },

    /// Move slides to the trash
    Delete {
        /// Document id
        document: Uuid,

        /// Slides to trash
        #[arg(required = true)]
        slides: Vec<Uuid>,
    },

    /// Restore trashed slides
    Restore {
        /// Document id
        document: Uuid,

        /// Slides to restore
        #[arg(required = true)]
        slides: Vec<Uuid>,
    },

    /// Duplicate slides, optionally into another document
    Duplicate {
        /// Source document id
        document: Uuid,

        /// Slides to duplicate
        #[arg(required = true)]
        slides: Vec<Uuid>,

        /// Destination document (defaults to the source)
        #[arg(long)]
        to: Option<Uuid>,

        /// Place the copies after this slide of the destination
        #[arg(long)]
        after: Option<Uuid>,
    },
}

struct Session {
    transport: Arc<dyn RecordTransport>,
    config: SyncConfig,
}

impl Session {
    async fn open(store: Option<PathBuf>, config: Option<PathBuf>) -> Result<Self> {
        let path = store.unwrap_or_else(default_store_path);
        let transport = FileTransport::open(&path)
            .await
            .with_context(|| format!("failed to open store {}", path.display()))?;
        let config = match config {
            Some(path) => SyncConfig::load(&path)
                .await
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => SyncConfig::default(),
        };
        Ok(Self {
            transport: Arc::new(transport),
            config,
        })
    }

    async fn document(&self, id: Uuid) -> Result<DocumentHandle> {
        let known = self
            .transport
            .list_documents()
            .await?
            .iter()
            .any(|record| record.id == id);
        if !known {
            bail!("no document {} in the store", id);
        }
        let handle = DocumentHandle::open(DocumentId(id), self.transport.clone(), &self.config)
            .await
            .with_context(|| format!("failed to load document {}", id))?;
        handle.set_active(true);
        Ok(handle)
    }

    fn coordinator(&self) -> MutationCoordinator {
        MutationCoordinator::new(
            self.transport.clone(),
            Arc::new(NoopUndo::default()),
            self.config.clone(),
        )
    }
}

fn default_store_path() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(std::env::temp_dir);
    base.join("deck").join("store.json")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let session = Session::open(cli.store, cli.config).await?;

    match cli.command {
        Commands::NewDocument { title } => new_document_command(&session, title).await,
        Commands::Documents => documents_command(&session).await,
        Commands::Slides { document, all } => slides_command(&session, document, all).await,
        Commands::Add {
            document,
            title,
            after,
            file,
            notes,
        } => add_command(&session, document, title, after, file, notes).await,
        Commands::Move {
            document,
            slide,
            after,
            before,
        } => move_command(&session, document, slide, after, before).await,
        Commands::Delete { document, slides } => {
            trash_command(&session, document, slides, true).await
        }
        Commands::Restore { document, slides } => {
            trash_command(&session, document, slides, false).await
        }
        Commands::Duplicate {
            document,
            slides,
            to,
            after,
        } => duplicate_command(&session, document, slides, to, after).await,
    }
}

async fn new_document_command(session: &Session, title: String) -> Result<()> {
    let handle = DocumentHandle::create(&title, session.transport.clone(), &session.config).await?;
    info!("Created document: {}", handle.id());
    println!("{}", handle.id());
    Ok(())
}

async fn documents_command(session: &Session) -> Result<()> {
    let documents = session.transport.list_documents().await?;
    if documents.is_empty() {
        info!("No documents in the store");
        return Ok(());
    }

    for record in documents {
        let Some(fields) = record.presentation_fields() else {
            continue;
        };
        let hidden = if fields.hidden { " (hidden)" } else { "" };
        println!("{}  {}{}", record.id, fields.name, hidden);
    }
    Ok(())
}

async fn slides_command(session: &Session, document: Uuid, all: bool) -> Result<()> {
    let handle = session.document(document).await?;
    let document = handle.lock();
    println!("{} ({} slides)", document.title(), document.slide_count(all));

    for (position, slide) in document
        .slides()
        .filter(|slide| all || !slide.trashed)
        .enumerate()
    {
        let title = slide.title.as_deref().unwrap_or("(untitled)");
        let trashed = if slide.trashed { "  [trashed]" } else { "" };
        println!(
            "{:>3}. {}  {}  {}  {} objects{}",
            position + 1,
            slide.id,
            slide.sort_index,
            title,
            slide.objects.len(),
            trashed
        );
    }
    Ok(())
}

fn object_kind(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match extension.as_deref() {
        Some("png" | "jpg" | "jpeg" | "gif" | "webp" | "svg") => "image",
        Some("mp4" | "mov" | "webm" | "mkv") => "video",
        Some("mp3" | "wav" | "ogg" | "m4a") => "audio",
        Some("pdf") => "document",
        _ => "file",
    }
}

async fn add_command(
    session: &Session,
    document: Uuid,
    title: Option<String>,
    after: Option<Uuid>,
    files: Vec<PathBuf>,
    notes: Option<String>,
) -> Result<()> {
    let handle = session.document(document).await?;

    let mut objects = Vec::new();
    for file in &files {
        let bytes = tokio::fs::read(file)
            .await
            .with_context(|| format!("failed to read {}", file.display()))?;
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut object =
            NewObject::new(object_kind(file)).with_content(AssetUpload::from_bytes(bytes));
        object.properties = serde_json::json!({ "file_name": name });
        objects.push(object);
    }

    let new = NewSlide {
        title,
        speaker_notes: notes,
        objects,
        after: after.map(SlideId),
        ..Default::default()
    };

    let progress_bar = if files.is_empty() {
        None
    } else {
        let bar = ProgressBar::new(1000);
        bar.set_style(
            ProgressStyle::with_template("{spinner} uploading [{bar:40}] {percent}%")?
                .progress_chars("=> "),
        );
        Some(bar)
    };
    let on_progress: Option<ProgressFn> = progress_bar.clone().map(|bar| {
        Arc::new(move |fraction: f64| bar.set_position((fraction * 1000.0) as u64)) as ProgressFn
    });

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; cancelling upload");
            on_interrupt.cancel();
        }
    });

    let result = session
        .coordinator()
        .create_slide(&handle, new, on_progress, cancel)
        .await;
    interrupt.abort();
    if let Some(bar) = progress_bar {
        bar.finish_and_clear();
    }

    let slide = result.context("failed to add slide")?;
    handle.flush().await?;
    info!("Added slide {} at {}", slide.id, slide.sort_index);
    println!("{}", slide.id);
    Ok(())
}

async fn move_command(
    session: &Session,
    document: Uuid,
    slide: Uuid,
    after: Option<Uuid>,
    before: Option<Uuid>,
) -> Result<()> {
    let handle = session.document(document).await?;
    let moved = session
        .coordinator()
        .move_slide(
            &handle,
            SlideId(slide),
            after.map(SlideId),
            before.map(SlideId),
        )
        .await?;
    handle.flush().await?;

    if moved {
        info!("Moved slide {}", slide);
    } else {
        info!("Slide {} is already there", slide);
    }
    Ok(())
}

async fn trash_command(
    session: &Session,
    document: Uuid,
    slides: Vec<Uuid>,
    trashed: bool,
) -> Result<()> {
    let handle = session.document(document).await?;
    let slides: Vec<SlideId> = slides.into_iter().map(SlideId).collect();
    let coordinator = session.coordinator();
    if trashed {
        coordinator.delete_slides(&handle, &slides).await?;
        info!("Trashed {} slides", slides.len());
    } else {
        coordinator.undelete_slides(&handle, &slides).await?;
        info!("Restored {} slides", slides.len());
    }
    handle.flush().await?;
    Ok(())
}

async fn duplicate_command(
    session: &Session,
    document: Uuid,
    slides: Vec<Uuid>,
    to: Option<Uuid>,
    after: Option<Uuid>,
) -> Result<()> {
    let source = session.document(document).await?;
    let destination = match to {
        Some(id) if id != document => session.document(id).await?,
        _ => source.clone(),
    };
    let slides: Vec<SlideId> = slides.into_iter().map(SlideId).collect();

    let copies = session
        .coordinator()
        .copy_slides(&source, &slides, &destination, after.map(SlideId))
        .await
        .context("failed to duplicate slides")?;
    destination.flush().await?;

    info!(
        "Duplicated {} slides into {}",
        copies.len(),
        destination.id()
    );
    for id in copies {
        println!("{}", id);
    }
    Ok(())
}
