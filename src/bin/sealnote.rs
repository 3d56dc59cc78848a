//! Sealnote CLI - end-to-end encrypted notes
//!
//! Keeps a local replica of sealed notes in a store directory and
//! synchronizes it with a remote note store over HTTPS.

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use sealnote::passphrase::{LinePassphraseReader, PassphraseReader, TerminalPassphraseReader};
use sealnote::store::{LocalStore, write_file_atomic};
use sealnote::sync::RetryPolicy;
use sealnote::{
    Config, ErrorCategory, ErrorKind, HttpTransport, KeyStore, Method, NetworkError, Note, NoteId,
    Result, SealnoteError, Session, SyncEngine, TransportClient, TransportResponse,
};

#[derive(Parser)]
#[command(name = "sealnote")]
#[command(version)]
#[command(about = "End-to-end encrypted notes.", long_about = None)]
struct Cli {
    /// Read passphrase from stdin instead of from terminal
    #[arg(long, global = true)]
    passphrase_stdin: bool,

    /// Directory holding the key store and the local replica
    #[arg(long, global = true, env = "SEALNOTE_STORE", default_value = ".sealnote")]
    store: PathBuf,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new store protected by a passphrase
    Init,

    /// Add a note from a file
    #[command(alias = "a")]
    Add {
        /// Path to the file holding the note's content
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,

        /// Id for the new note (generated when omitted)
        #[arg(long)]
        id: Option<String>,
    },

    /// Replace a note's content with the contents of a file
    #[command(alias = "e")]
    Edit {
        #[arg(long)]
        id: String,

        /// Path to the file holding the note's new content
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,
    },

    /// Decrypt a note
    Show {
        #[arg(long)]
        id: String,

        /// Path to write the plaintext to (stdout when omitted)
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// List notes with their version and sync status
    #[command(alias = "ls")]
    List,

    /// Delete a note locally and, with a server, remotely
    Rm {
        #[arg(long)]
        id: String,

        #[command(flatten)]
        remote: RemoteArgs,
    },

    /// Push local edits and pull remote changes
    Sync {
        #[command(flatten)]
        remote: RemoteArgs,
    },
}

#[derive(clap::Args)]
struct RemoteArgs {
    /// Base URL of the note server (overrides `server_url` in config.toml)
    #[arg(long)]
    url: Option<String>,

    /// Bearer token for the note server
    #[arg(long, env = "SEALNOTE_TOKEN", hide_env_values = true)]
    token: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        let mut source = e.source_error().map(|s| s as &dyn std::error::Error);
        while let Some(cause) = source {
            eprintln!("  caused by: {}", cause);
            source = cause.source();
        }
        process::exit(1);
    }
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let store = LocalStore::new(cli.store);

    match cli.command {
        Commands::Init => {
            let mut reader = passphrase_reader(cli.passphrase_stdin, true);
            init(&store, &mut *reader)
        }
        Commands::Add { input, id } => {
            let plaintext = read_input(&input)?;
            let id = match id {
                Some(id) => NoteId::new(id)?,
                None => NoteId::generate(),
            };
            let replica = Replica::open(store, cli.passphrase_stdin, None)?.restore().await?;
            replica.engine.insert(Note::new(id.clone(), plaintext)).await?;
            replica.save().await?;
            println!("{}", id);
            Ok(())
        }
        Commands::Edit { id, input } => {
            let id = NoteId::new(id)?;
            let plaintext = read_input(&input)?;
            let replica = Replica::open(store, cli.passphrase_stdin, None)?.restore().await?;
            replica.engine.edit(&id, plaintext).await?;
            replica.save().await
        }
        Commands::Show { id, output } => {
            let id = NoteId::new(id)?;
            let replica = Replica::open(store, cli.passphrase_stdin, None)?.restore().await?;
            let note = replica.engine.note(&id).await?;
            let plaintext = note.plaintext().ok_or_else(|| {
                SealnoteError::new(ErrorCategory::Internal, "note opened without plaintext")
            })?;
            match output {
                Some(path) => write_file_atomic(&path, plaintext)
                    .map_err(|e| e.with_context(format!("failed to write to {}", path.display()))),
                None => io::stdout()
                    .write_all(plaintext)
                    .map_err(|e| SealnoteError::io("failed to write to stdout", e)),
            }
        }
        Commands::List => {
            let replica = Replica::open(store, cli.passphrase_stdin, None)?.restore().await?;
            for id in replica.engine.ids().await {
                if let Some(state) = replica.engine.state(&id).await {
                    println!("{}\tv{}\t{:?}", id, state.local_version, state.status);
                }
            }
            Ok(())
        }
        Commands::Rm { id, remote } => {
            let id = NoteId::new(id)?;
            let replica = Replica::open(store, cli.passphrase_stdin, Some(&remote))?
                .restore()
                .await?;
            let result = replica.engine.delete(&replica.session, &id).await;
            replica.save().await?;
            result
        }
        Commands::Sync { remote } => {
            let replica = Replica::open(store, cli.passphrase_stdin, Some(&remote))?
                .restore()
                .await?;
            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_interrupt.cancel();
                }
            });

            let result = replica.engine.sync(&replica.session, &cancel).await;
            // Whatever finished before a failure is kept.
            replica.save().await?;
            let report = result?;
            eprintln!(
                "pushed {}, pulled {}, conflicts resolved {}",
                report.pushed, report.pulled, report.conflicts_resolved
            );
            if report.skipped > 0 {
                eprintln!("skipped {} unusable remote records", report.skipped);
            }
            Ok(())
        }
    }
}

fn init(store: &LocalStore, reader: &mut dyn PassphraseReader) -> Result<()> {
    let keystore_path = store.keystore_path();
    if keystore_path.exists() {
        return Err(SealnoteError::new(
            ErrorCategory::User,
            format!("a store already exists at {}", store.dir().display()),
        ));
    }
    store.create_dir()?;
    let config = Config::load(&store.config_path())?;
    let mut keystore = KeyStore::create(config.kdf)?;
    let passphrase = reader.read_passphrase()?;
    keystore.unlock(&passphrase)?;
    keystore.save(&keystore_path)?;
    store.save_notes(Vec::new())
}

/// An unlocked store with an engine loaded from it.
struct Replica {
    store: LocalStore,
    engine: SyncEngine,
    session: Session,
    /// Set when the key store had no check value yet; written back once the
    /// passphrase is known to open the existing notes.
    newly_bound: Option<KeyStore>,
}

impl Replica {
    fn open(store: LocalStore, passphrase_stdin: bool, remote: Option<&RemoteArgs>) -> Result<Self> {
        let mut config = Config::load(&store.config_path())?;
        let mut keystore = KeyStore::load(&store.keystore_path())
            .map_err(|e| e.with_context(format!("no usable store at {}", store.dir().display())))?;
        let mut reader = passphrase_reader(passphrase_stdin, false);
        let passphrase = reader.read_passphrase()?;
        let was_bound = keystore.has_key_check();
        let key = keystore.unlock(&passphrase)?;

        let url = remote
            .and_then(|r| r.url.clone())
            .or_else(|| config.server_url.clone());
        let (transport, session): (Arc<dyn TransportClient>, Session) = match (remote, url) {
            (Some(remote), Some(url)) => {
                let token = remote.token.clone().ok_or_else(|| {
                    SealnoteError::with_kind(
                        ErrorCategory::User,
                        ErrorKind::Auth,
                        "a token is required (--token or SEALNOTE_TOKEN)",
                    )
                })?;
                let transport = HttpTransport::new(&url, config.request_timeout()).map_err(|e| {
                    SealnoteError::with_kind_and_source(
                        ErrorCategory::Internal,
                        ErrorKind::Transport,
                        "failed to set up HTTP transport",
                        e,
                    )
                })?;
                (Arc::new(transport), Session::new(token))
            }
            _ => {
                config.retry = RetryPolicy::no_retry();
                (Arc::new(OfflineTransport), Session::new(""))
            }
        };

        Ok(Self {
            engine: SyncEngine::new(transport, key, config),
            store,
            session,
            newly_bound: (!was_bound).then_some(keystore),
        })
    }

    /// Load the persisted notes and make sure the passphrase opens them.
    async fn restore(self) -> Result<Self> {
        self.engine.restore(self.store.load_notes()?).await?;
        self.engine.verify_key().await?;
        if let Some(keystore) = &self.newly_bound {
            keystore.save(&self.store.keystore_path())?;
        }
        Ok(self)
    }

    async fn save(&self) -> Result<()> {
        self.store.save_notes(self.engine.snapshot().await?)
    }
}

/// Stands in for the network when no server is configured.
struct OfflineTransport;

#[async_trait]
impl TransportClient for OfflineTransport {
    async fn send(
        &self,
        method: Method,
        path: &str,
        _session: &Session,
        _body: Option<&[u8]>,
    ) -> std::result::Result<TransportResponse, NetworkError> {
        Err(NetworkError::new(format!(
            "cannot {} {}: no server URL configured (use --url)",
            method, path
        )))
    }
}

fn passphrase_reader(use_stdin: bool, confirm: bool) -> Box<dyn PassphraseReader> {
    if use_stdin {
        Box::new(LinePassphraseReader::new(BufReader::new(io::stdin())))
    } else if confirm {
        Box::new(TerminalPassphraseReader::confirming())
    } else {
        Box::new(TerminalPassphraseReader::new())
    }
}

fn read_input(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| SealnoteError::io(format!("failed to read from {}", path.display()), e))
}
