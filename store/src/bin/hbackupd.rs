use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio_listener::{Listener, ListenerAddress, SystemOptions, UserOptions};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use hbackup_io::HashAlgo;
use hbackup_store::daemon::client::{Collector, RemoteAddr, RemoteStore};
use hbackup_store::daemon::Daemon;
use hbackup_store::{CompressionCase, Store};

const DEFAULT_ENDPOINT: &str = "data/.socket";

#[derive(Parser)]
#[command(author, version, about = "hbackup data store daemon and client", long_about = None)]
struct Cli {
    /// A global log level to use when printing logs.
    /// It's also possible to set `RUST_LOG` according to
    /// `tracing_subscriber::filter::EnvFilter`, which will always have
    /// priority.
    #[arg(long)]
    log_level: Option<Level>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Runs the data store daemon.
    Daemon {
        /// UNIX socket path, @abstract name or host:port to listen on.
        #[arg(long, short = 'l', default_value = DEFAULT_ENDPOINT)]
        listen_address: String,

        /// Store root directory.
        #[arg(long, env = "HBACKUP_STORE", default_value = "data")]
        store_path: PathBuf,

        /// Digest algorithm keying new entries.
        #[arg(long, default_value = "md5")]
        hash: HashAlgo,

        /// Create the store if it does not exist yet.
        #[arg(long)]
        create: bool,
    },
    /// Resolves a content id to its payload path in the store.
    Name {
        #[arg(long, short = 'a', default_value = DEFAULT_ENDPOINT)]
        addr: RemoteAddr,

        /// Content id, `<digest>[-<index>]`.
        hash: String,
    },
    /// Extracts an entry to a file (a path on the server side).
    Read {
        #[arg(long, short = 'a', default_value = DEFAULT_ENDPOINT)]
        addr: RemoteAddr,

        hash: String,

        target: String,
    },
    /// Stores a file (a path on the server side).
    Write {
        #[arg(long, short = 'a', default_value = DEFAULT_ENDPOINT)]
        addr: RemoteAddr,

        source: String,

        /// gzip level for the compressing modes.
        #[arg(long, default_value_t = hbackup_io::DEFAULT_GZIP_LEVEL as i64)]
        level: i64,

        #[arg(long, value_enum, default_value = "auto")]
        mode: WriteMode,
    },
    /// Removes an entry.
    Remove {
        #[arg(long, short = 'a', default_value = DEFAULT_ENDPOINT)]
        addr: RemoteAddr,

        hash: String,
    },
    /// Sweeps the store, listing the valid entries.
    Crawl {
        #[arg(long, short = 'a', default_value = DEFAULT_ENDPOINT)]
        addr: RemoteAddr,

        /// Verify payload digests instead of just the entry shape.
        #[arg(long)]
        thorough: bool,

        /// Delete entries that fail verification.
        #[arg(long)]
        repair: bool,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum WriteMode {
    /// Store whichever representation turns out smaller.
    Auto,
    /// Store uncompressed now, let a later sweep decide.
    Later,
    /// Always compress.
    Yes,
    /// Never compress.
    No,
}

impl WriteMode {
    fn case(self) -> CompressionCase {
        match self {
            WriteMode::Auto => CompressionCase::AutoNow,
            WriteMode::Later => CompressionCase::AutoLater,
            WriteMode::Yes => CompressionCase::ForcedYes,
            WriteMode::No => CompressionCase::ForcedNo,
        }
    }
}

struct PrintingCollector {
    count: usize,
}

impl Collector for PrintingCollector {
    fn add(&mut self, hash: &str, data_size: i64, file_size: i64) {
        println!("{}\t{}\t{}", hash, data_size, file_size);
        self.count += 1;
    }
}

/// `tokio-listener` wants relative socket paths to look like paths.
fn normalize_listen(addr: &str) -> String {
    if addr.contains('/') && !addr.starts_with('/') && !addr.starts_with("./") {
        format!("./{}", addr)
    } else {
        addr.to_string()
    }
}

const EXIT_USAGE: u8 = 1;
const EXIT_OPEN: u8 = 2;
const EXIT_OPERATION: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => {
                    ExitCode::SUCCESS
                }
                _ => ExitCode::from(EXIT_USAGE),
            };
        }
    };

    let level = cli.log_level.unwrap_or(Level::INFO);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(
                    EnvFilter::builder()
                        .with_default_directive(LevelFilter::from_level(level).into())
                        .from_env_lossy(),
                ),
        )
        .init();

    match cli.command {
        Commands::Daemon {
            listen_address,
            store_path,
            hash,
            create,
        } => {
            let store = match Store::open(&store_path, hash, create).await {
                Ok(store) => store,
                Err(e) => {
                    error!(error = %e, "cannot open store");
                    return ExitCode::from(EXIT_OPEN);
                }
            };
            let daemon = match Daemon::new(store).await {
                Ok(daemon) => daemon,
                Err(e) => {
                    error!(error = %e, "cannot set up daemon");
                    return ExitCode::from(EXIT_OPEN);
                }
            };
            let addr: ListenerAddress = match normalize_listen(&listen_address).parse() {
                Ok(addr) => addr,
                Err(e) => {
                    error!(error = %e, address = %listen_address, "bad listen address");
                    return ExitCode::from(EXIT_USAGE);
                }
            };
            let listener = match Listener::bind(
                &addr,
                &SystemOptions::default(),
                &UserOptions::default(),
            )
            .await
            {
                Ok(listener) => listener,
                Err(e) => {
                    error!(error = %e, address = %listen_address, "cannot bind");
                    return ExitCode::from(EXIT_OPEN);
                }
            };
            info!(address = %listen_address, "listening");

            let shutdown = CancellationToken::new();
            {
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        info!("shutting down");
                        shutdown.cancel();
                    }
                });
            }
            match Arc::new(daemon).serve(listener, shutdown).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!(error = %e, "server failed");
                    ExitCode::from(EXIT_OPERATION)
                }
            }
        }
        Commands::Name { addr, hash } => {
            let mut remote = RemoteStore::new(addr);
            if let Err(e) = remote.open().await {
                error!(error = %e, "cannot connect");
                return ExitCode::from(EXIT_OPEN);
            }
            match remote.name(&hash, true).await {
                Ok(reply) if reply.status == 0 => {
                    println!("{}{}", reply.path, reply.extension.unwrap_or_default());
                    ExitCode::SUCCESS
                }
                Ok(reply) => {
                    error!(status = reply.status, %hash, "name failed");
                    ExitCode::from(EXIT_OPERATION)
                }
                Err(e) => {
                    error!(error = %e, %hash, "request failed");
                    ExitCode::from(EXIT_OPERATION)
                }
            }
        }
        Commands::Read { addr, hash, target } => {
            let mut remote = RemoteStore::new(addr);
            if let Err(e) = remote.open().await {
                error!(error = %e, "cannot connect");
                return ExitCode::from(EXIT_OPEN);
            }
            match remote.read(&target, &hash).await {
                Ok(0) => ExitCode::SUCCESS,
                Ok(status) => {
                    error!(status, %hash, "read failed");
                    ExitCode::from(EXIT_OPERATION)
                }
                Err(e) => {
                    error!(error = %e, %hash, "request failed");
                    ExitCode::from(EXIT_OPERATION)
                }
            }
        }
        Commands::Write {
            addr,
            source,
            level,
            mode,
        } => {
            let mut remote = RemoteStore::new(addr);
            if let Err(e) = remote.open().await {
                error!(error = %e, "cannot connect");
                return ExitCode::from(EXIT_OPEN);
            }
            match remote.write(&source, level, mode.case(), false).await {
                Ok(reply) if reply.status >= 0 => {
                    println!("{}", reply.hash);
                    ExitCode::SUCCESS
                }
                Ok(_) => {
                    error!(%source, "write failed");
                    ExitCode::from(EXIT_OPERATION)
                }
                Err(e) => {
                    error!(error = %e, %source, "request failed");
                    ExitCode::from(EXIT_OPERATION)
                }
            }
        }
        Commands::Remove { addr, hash } => {
            let mut remote = RemoteStore::new(addr);
            if let Err(e) = remote.open().await {
                error!(error = %e, "cannot connect");
                return ExitCode::from(EXIT_OPEN);
            }
            match remote.remove(&hash).await {
                Ok(status) if status >= 0 => ExitCode::SUCCESS,
                Ok(status) => {
                    error!(status, %hash, "remove failed");
                    ExitCode::from(EXIT_OPERATION)
                }
                Err(e) => {
                    error!(error = %e, %hash, "request failed");
                    ExitCode::from(EXIT_OPERATION)
                }
            }
        }
        Commands::Crawl {
            addr,
            thorough,
            repair,
        } => {
            let mut remote = RemoteStore::new(addr);
            if let Err(e) = remote.open().await {
                error!(error = %e, "cannot connect");
                return ExitCode::from(EXIT_OPEN);
            }
            let mut collector = PrintingCollector { count: 0 };
            match remote.crawl(thorough, repair, Some(&mut collector), None).await {
                Ok(0) => {
                    info!(valid = collector.count, "crawl done");
                    ExitCode::SUCCESS
                }
                Ok(status) => {
                    error!(status, "crawl failed");
                    ExitCode::from(EXIT_OPERATION)
                }
                Err(e) => {
                    error!(error = %e, "request failed");
                    ExitCode::from(EXIT_OPERATION)
                }
            }
        }
    }
}
