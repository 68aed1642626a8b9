//! sfbox: SecureFileBox storage CLI
//!
//! Commands:
//!   keygen                          - print a fresh master key
//!   config show                     - display current configuration (key redacted)
//!   put <file> --owner <id>         - encrypt and store a file
//!   info <id>                       - show decrypted metadata
//!   get <id> [<out>]                - decrypt content to a file or stdout
//!   ls [--page N --size N]          - list entries, newest first
//!   replace <id> [--content F] ...  - replace content and/or metadata
//!   rm <id>                         - delete blob and record
//!   avatar set|get|rm               - manage a user's avatar

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use sfbox_core::config::{expand_tilde, is_loosely_readable, SfboxConfig};
use sfbox_crypto::{generate_master_secret, CipherSuite};
use sfbox_store::{BlobDir, FileEntry, FileStore, JsonRepository, Limits, Replacement};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "sfbox",
    version,
    about = "SecureFileBox encrypted file store",
    long_about = "sfbox: store, read, replace and delete files encrypted at rest"
)]
struct Cli {
    /// Path to sfbox.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "SFBOX_CONFIG",
        default_value = "~/.config/sfbox/config.toml"
    )]
    config: PathBuf,

    /// Log level filter (overrides [log].level; RUST_LOG wins over both)
    #[arg(long, env = "SFBOX_LOG")]
    log: Option<String>,

    /// Log format (overrides [log].format)
    #[arg(long, env = "SFBOX_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, ValueEnum, PartialEq)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a new master key (base64url, 256-bit)
    Keygen,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Encrypt a local file into the store
    Put {
        /// Local file to store
        file: PathBuf,
        /// Owning user id
        #[arg(long)]
        owner: u64,
        /// Free-form description
        #[arg(long, short = 'd', default_value = "")]
        description: String,
        /// Stored filename (default: the local file name)
        #[arg(long)]
        name: Option<String>,
    },

    /// Show the decrypted metadata of an entry
    Info {
        id: u64,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Decrypt an entry's content
    ///
    /// Without an output path the plaintext goes to stdout. With one, the
    /// file only appears once the whole blob has been verified.
    Get {
        id: u64,
        out: Option<PathBuf>,
    },

    /// List entries, newest first
    Ls {
        #[arg(long, default_value_t = 1)]
        page: usize,
        #[arg(long, default_value_t = 20)]
        size: usize,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Replace an entry's content and/or metadata
    Replace {
        id: u64,
        /// New content
        #[arg(long)]
        content: Option<PathBuf>,
        /// New filename
        #[arg(long)]
        name: Option<String>,
        /// New description
        #[arg(long, short = 'd')]
        description: Option<String>,
    },

    /// Delete an entry and its blob
    Rm { id: u64 },

    /// Avatar management
    Avatar {
        #[command(subcommand)]
        action: AvatarAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

#[derive(Subcommand, Debug)]
enum AvatarAction {
    /// Set a user's avatar from an image file
    Set {
        owner: u64,
        file: PathBuf,
        /// Declared MIME type, must be image/*
        #[arg(long)]
        content_type: String,
    },
    /// Decrypt a user's avatar to a file
    Get { owner: u64, out: PathBuf },
    /// Remove a user's avatar
    Rm { owner: u64 },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = expand_tilde(&cli.config);
    let config = load_config(&config_path)?;

    let level = cli.log.clone().unwrap_or_else(|| config.log.level.clone());
    let format = cli
        .log_format
        .clone()
        .unwrap_or_else(|| parse_log_format(&config.log.format));
    init_logging(&level, &format);

    if config.config_file_mode_check {
        check_config_mode(&config_path);
    }

    match cli.command {
        Commands::Keygen => cmd_keygen(),
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &config_path),
        Commands::Put {
            file,
            owner,
            description,
            name,
        } => cmd_put(&config, &file, owner, &description, name.as_deref()),
        Commands::Info { id, json } => cmd_info(&config, id, json),
        Commands::Get { id, out } => cmd_get(&config, id, out.as_deref()),
        Commands::Ls { page, size, json } => cmd_ls(&config, page, size, json),
        Commands::Replace {
            id,
            content,
            name,
            description,
        } => cmd_replace(&config, id, content.as_deref(), name, description),
        Commands::Rm { id } => cmd_rm(&config, id),
        Commands::Avatar { action } => match action {
            AvatarAction::Set {
                owner,
                file,
                content_type,
            } => cmd_avatar_set(&config, owner, &file, &content_type),
            AvatarAction::Get { owner, out } => cmd_avatar_get(&config, owner, &out),
            AvatarAction::Rm { owner } => cmd_avatar_rm(&config, owner),
        },
    }
}

// ── Config + logging bootstrap ────────────────────────────────────────────────

fn load_config(path: &Path) -> Result<SfboxConfig> {
    if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        SfboxConfig::from_toml_str(&content)
            .with_context(|| format!("parsing config: {}", path.display()))
    } else {
        Ok(SfboxConfig::default())
    }
}

fn parse_log_format(text: &str) -> LogFormat {
    if text.eq_ignore_ascii_case("json") {
        LogFormat::Json
    } else {
        LogFormat::Text
    }
}

/// Logs go to stderr so `get` can stream plaintext on stdout.
fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(io::stderr))
                .init();
        }
    }
}

fn check_config_mode(path: &Path) {
    match is_loosely_readable(path) {
        Ok(true) => warn!(
            "config file {} is readable by group/others and may hold the master key (chmod 600)",
            path.display()
        ),
        Ok(false) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => debug!("could not stat config {}: {e}", path.display()),
    }
}

// ── Store construction ────────────────────────────────────────────────────────

fn open_store(config: &SfboxConfig) -> Result<FileStore<JsonRepository>> {
    let records = expand_tilde(&config.storage.records_path);
    let repo = JsonRepository::open(&records)
        .with_context(|| format!("opening record store: {}", records.display()))?;

    // A configured but unusable key is an error; no key at all still allows
    // reading legacy plaintext metadata
    let crypto = match config.crypto.resolve_master_key() {
        Some(key) => CipherSuite::from_master_secret(&key).context("loading master key")?,
        None => CipherSuite::from_master_secret_lenient(None),
    };

    let blob_dir = expand_tilde(&config.storage.blob_dir);
    let store = FileStore::new(repo, &blob_dir, crypto)
        .with_context(|| format!("opening blob dir: {}", blob_dir.display()))?;

    Ok(store.with_limits(Limits {
        max_file_size: config.storage.max_file_size,
        max_avatar_size: config.storage.max_avatar_size,
    }))
}

fn open_input(path: &Path) -> Result<BufReader<File>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    Ok(BufReader::new(file))
}

/// Write through `fill` into a temp file beside `out`, renaming it into place
/// only on success.
fn write_output_atomically<T>(
    out: &Path,
    fill: impl FnOnce(&mut BufWriter<File>) -> Result<T>,
) -> Result<T> {
    let tmp = BlobDir::temp_path_beside(out);
    let written: Result<T> = (|| {
        let file =
            File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;
        let mut writer = BufWriter::new(file);
        let value = fill(&mut writer)?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(value)
    })();

    match written {
        Ok(value) => {
            BlobDir::commit(&tmp, out)
                .with_context(|| format!("writing {}", out.display()))?;
            Ok(value)
        }
        Err(e) => {
            let _ = std::fs::remove_file(&tmp);
            Err(e)
        }
    }
}

// ── Commands ──────────────────────────────────────────────────────────────────

fn cmd_keygen() -> Result<()> {
    println!("{}", generate_master_secret());
    eprintln!("Store this as SFBOX_MASTER_KEY or [crypto].master_key. It cannot be recovered.");
    Ok(())
}

fn cmd_config_show(config: &SfboxConfig, path: &Path) -> Result<()> {
    let shown = toml::to_string_pretty(&config.redacted()).context("serializing config")?;
    println!("# {}", path.display());
    print!("{shown}");
    Ok(())
}

fn cmd_put(
    config: &SfboxConfig,
    file: &Path,
    owner: u64,
    description: &str,
    name: Option<&str>,
) -> Result<()> {
    let filename = match name {
        Some(n) => n.to_string(),
        None => file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .with_context(|| format!("no file name in {}", file.display()))?,
    };

    let store = open_store(config)?;
    let stored = store
        .store_new(open_input(file)?, &filename, owner, description)
        .with_context(|| format!("storing {}", file.display()))?;

    println!("stored {} as id {} ({})", filename, stored.id, fmt_bytes(stored.size));
    Ok(())
}

fn cmd_info(config: &SfboxConfig, id: u64, json: bool) -> Result<()> {
    let store = open_store(config)?;
    let entry = store.fetch_metadata(id).with_context(|| format!("file {id}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entry_json(&entry))?);
        return Ok(());
    }

    let f = &entry.fields;
    println!("id:           {}", entry.id);
    println!("filename:     {}", f.filename);
    println!("size:         {} ({})", f.size, fmt_bytes(f.size));
    println!("description:  {}", f.description);
    println!("owner:        {}", f.uploader_id);
    println!("blob:         {}", f.storage_path);
    println!("created:      {}", entry.created_at);
    println!("updated:      {}", entry.updated_at);
    if entry.legacy {
        println!("metadata:     plaintext (legacy)");
    }
    Ok(())
}

fn cmd_get(config: &SfboxConfig, id: u64, out: Option<&Path>) -> Result<()> {
    let store = open_store(config)?;

    match out {
        Some(out) => {
            let bytes = write_output_atomically(out, |w| {
                store.fetch_content(id, w).map_err(anyhow::Error::from)
            })
            .with_context(|| format!("reading file {id}"))?;
            eprintln!("wrote {} to {}", fmt_bytes(bytes), out.display());
        }
        None => {
            let stdout = io::stdout();
            let mut lock = stdout.lock();
            store
                .fetch_content(id, &mut lock)
                .with_context(|| format!("reading file {id}"))?;
            lock.flush()?;
        }
    }
    Ok(())
}

fn cmd_ls(config: &SfboxConfig, page: usize, size: usize, json: bool) -> Result<()> {
    let store = open_store(config)?;
    let listing = store.list(page, size).context("listing files")?;

    if json {
        let items: Vec<_> = listing.items.iter().map(entry_json).collect();
        let body = serde_json::json!({
            "total": listing.total,
            "page": listing.page,
            "size": listing.size,
            "items": items,
        });
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    println!("{:>8}  {:>10}  {:>12}  NAME", "ID", "SIZE", "CREATED");
    for entry in &listing.items {
        let marker = if entry.legacy { " *" } else { "" };
        println!(
            "{:>8}  {:>10}  {:>12}  {}{}",
            entry.id,
            fmt_bytes(entry.fields.size),
            entry.created_at,
            entry.fields.filename,
            marker
        );
    }
    println!(
        "page {} ({} per page), {} total{}",
        listing.page,
        listing.size,
        listing.total,
        if listing.items.iter().any(|e| e.legacy) {
            "; * = legacy plaintext metadata"
        } else {
            ""
        }
    );
    Ok(())
}

fn cmd_replace(
    config: &SfboxConfig,
    id: u64,
    content: Option<&Path>,
    name: Option<String>,
    description: Option<String>,
) -> Result<()> {
    if content.is_none() && name.is_none() && description.is_none() {
        bail!("nothing to replace: pass --content, --name or --description");
    }

    let store = open_store(config)?;
    let mut change = Replacement::new();
    if let Some(path) = content {
        change = change.content(open_input(path)?);
    }
    if let Some(name) = name {
        change = change.filename(name);
    }
    if let Some(text) = description {
        change = change.description(text);
    }

    let entry = store
        .replace(id, change)
        .with_context(|| format!("replacing file {id}"))?;
    println!(
        "replaced {} ({}, {})",
        entry.id,
        entry.fields.filename,
        fmt_bytes(entry.fields.size)
    );
    Ok(())
}

fn cmd_rm(config: &SfboxConfig, id: u64) -> Result<()> {
    let store = open_store(config)?;
    store.delete(id).with_context(|| format!("deleting file {id}"))?;
    println!("deleted {id}");
    Ok(())
}

fn cmd_avatar_set(
    config: &SfboxConfig,
    owner: u64,
    file: &Path,
    content_type: &str,
) -> Result<()> {
    let store = open_store(config)?;
    store
        .repository()
        .ensure_user(owner)
        .with_context(|| format!("user {owner}"))?;

    let avatar = store
        .attach_avatar(owner, open_input(file)?, content_type)
        .with_context(|| format!("setting avatar for user {owner}"))?;
    println!("avatar for user {owner} set ({})", avatar.content_type);
    Ok(())
}

fn cmd_avatar_get(config: &SfboxConfig, owner: u64, out: &Path) -> Result<()> {
    let store = open_store(config)?;
    let avatar = write_output_atomically(out, |w| {
        store.fetch_avatar(owner, w).map_err(anyhow::Error::from)
    })
    .with_context(|| format!("reading avatar for user {owner}"))?;
    eprintln!("wrote {} ({})", out.display(), avatar.content_type);
    Ok(())
}

fn cmd_avatar_rm(config: &SfboxConfig, owner: u64) -> Result<()> {
    let store = open_store(config)?;
    if store.remove_avatar(owner)? {
        println!("avatar for user {owner} removed");
    } else {
        println!("user {owner} has no avatar");
    }
    Ok(())
}

// ── Output helpers ────────────────────────────────────────────────────────────

fn entry_json(entry: &FileEntry) -> serde_json::Value {
    serde_json::json!({
        "id": entry.id,
        "filename": entry.fields.filename,
        "size": entry.fields.size,
        "description": entry.fields.description,
        "owner": entry.fields.uploader_id,
        "created_at": entry.created_at,
        "updated_at": entry.updated_at,
        "legacy": entry.legacy,
    })
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
