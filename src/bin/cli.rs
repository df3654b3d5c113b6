use clap::{Parser, Subcommand};
use feox_client::{Client, Command, Config, ExpectTag};
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server endpoint (host:port)
    #[arg(short, long, default_value = "127.0.0.1:6379")]
    endpoint: String,

    /// Database index
    #[arg(short = 'n', long, default_value_t = 0)]
    db: u32,

    /// Config file path (overrides --endpoint)
    #[arg(short, long)]
    config: Option<String>,

    /// Password for AUTH
    #[arg(short = 'a', long)]
    password: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Send one command and print the projected reply
    Send {
        /// Result shape, e.g. BulkString, Integer, Ok, Array
        #[arg(short = 'x', long, default_value = "MultiDataStrings")]
        expect: String,

        /// Command name followed by its arguments
        #[arg(required = true, num_args = 1..)]
        words: Vec<String>,
    },

    /// Print messages published to channels (or patterns with --pattern)
    Subscribe {
        #[arg(short, long)]
        pattern: bool,

        #[arg(required = true, num_args = 1..)]
        names: Vec<String>,
    },

    /// Stream every command the server processes
    Monitor,

    /// Round-trip PING a number of times
    Ping {
        #[arg(short = 'c', long, default_value_t = 1)]
        count: u32,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose {
        "debug"
    } else {
        &args.log_level
    };
    tracing_subscriber::fmt()
        .with_env_filter(format!("feox_client={},feox_cli={}", log_level, log_level))
        .init();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::with_endpoint(args.endpoint.clone()),
    };
    if let Some(password) = args.password.clone() {
        if password.is_empty() {
            warn!("Empty password provided, AUTH disabled");
        } else {
            config.password = Some(password);
        }
    }
    // Streaming modes hold a socket open for as long as they run
    config.heartbeat_enabled = matches!(args.action, Action::Subscribe { .. } | Action::Monitor);

    info!(
        "FeOx client v{} connecting to {}",
        env!("CARGO_PKG_VERSION"),
        config.endpoints.join(",")
    );
    let client = Client::new(config)?;

    match args.action {
        Action::Send { expect, words } => {
            let tag = ExpectTag::from_name(&expect)?;
            let cmd = Command::parse(args.db, &words.join(" "))?;
            let result = client.execute_tagged(tag, cmd)?;
            println!("{:?}", result);
        }
        Action::Subscribe { pattern, names } => {
            let channel = client.pubsub()?;
            let print = |message: &feox_client::Message| match &message.pattern {
                Some(pattern) => println!(
                    "[{}] {}: {}",
                    String::from_utf8_lossy(pattern),
                    message.channel_str(),
                    message.payload_str()
                ),
                None => println!("{}: {}", message.channel_str(), message.payload_str()),
            };
            if pattern {
                channel.psubscribe(print, names)?;
            } else {
                channel.subscribe(print, names)?;
            }
            wait_for_interrupt()?;
            channel.dispose();
        }
        Action::Monitor => {
            let monitor = client.monitor(|message| println!("{}", message.raw))?;
            wait_for_interrupt()?;
            info!("Monitor received {} lines", monitor.received());
            monitor.dispose();
        }
        Action::Ping { count } => {
            for seq in 0..count {
                let started = Instant::now();
                let reply = client.expect_simple_string(Command::new(args.db, "PING"))?;
                println!("{} seq={} time={:?}", reply, seq, started.elapsed());
                if seq + 1 < count {
                    std::thread::sleep(Duration::from_secs(1));
                }
            }
        }
    }

    client.dispose();
    Ok(())
}

fn wait_for_interrupt() -> anyhow::Result<()> {
    let (tx, rx) = crossbeam_channel::bounded(1);
    ctrlc::set_handler(move || {
        let _ = tx.try_send(());
    })?;
    rx.recv()?;
    info!("Received interrupt, shutting down");
    Ok(())
}
