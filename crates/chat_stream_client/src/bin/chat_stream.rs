//! chat-stream: command-line chat client.
//! Reads config, connects to the chat server, sends one prompt (argument or
//! stdin), and prints the streamed reply to stdout.

use chat_stream_client::{config, Client, EnvCredential, StaticCredential};
use clap::Parser;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;

const TOKEN_ENV: &str = "CHAT_STREAM_TOKEN";

#[derive(Parser, Debug)]
#[command(name = "chat-stream")]
#[command(about = "Send a prompt to the chat server and stream the reply")]
struct Args {
    /// Config file (defaults to $CHAT_STREAM_CONFIG, then ~/.chat-stream/config.yaml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Continue an existing conversation
    #[arg(long)]
    conversation: Option<i64>,

    /// Access token (overrides $CHAT_STREAM_TOKEN and auth.token)
    #[arg(long)]
    token: Option<String>,

    /// Enable debug logging on stderr
    #[arg(short, long)]
    verbose: bool,

    /// Prompt text; read from stdin when omitted
    prompt: Option<String>,
}

fn resolve_config_path(args: &Args) -> PathBuf {
    // 1. --config <path> flag
    if let Some(path) = &args.config {
        return path.clone();
    }
    // 2. CHAT_STREAM_CONFIG env var
    if let Ok(val) = std::env::var("CHAT_STREAM_CONFIG") {
        return PathBuf::from(val);
    }
    // 3. Default path (~/.chat-stream/config.yaml)
    config::default_config_path().unwrap_or_else(|| {
        eprintln!("Error: unable to determine config path (set --config or CHAT_STREAM_CONFIG)");
        process::exit(1);
    })
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .compact()
        .init();
}

/// Print only what a cumulative chunk adds to what is already on screen.
fn print_update(out: &mut impl Write, printed: &mut String, content: &str) {
    if let Some(suffix) = content.strip_prefix(printed.as_str()) {
        let _ = write!(out, "{}", suffix);
    } else {
        // Server rewrote earlier text; start a fresh line.
        let _ = write!(out, "\n{}", content);
    }
    let _ = out.flush();
    printed.clear();
    printed.push_str(content);
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    let config_path = resolve_config_path(&args);
    let cfg = match config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: failed to load config from {}: {}", config_path.display(), e);
            process::exit(1);
        }
    };
    let settings = match cfg.client_settings() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    };

    // --token, then $CHAT_STREAM_TOKEN (re-read on every connect), then auth.token.
    let env_token = std::env::var(TOKEN_ENV).is_ok_and(|t| !t.is_empty());
    let fixed_token = match args.token.clone() {
        Some(token) => Some(token),
        None if env_token => None,
        None => Some(cfg.auth.token.clone().unwrap_or_else(|| {
            eprintln!("Error: no access token (use --token, {} or auth.token)", TOKEN_ENV);
            process::exit(1);
        })),
    };

    // Prompt from the positional argument, else the first line of stdin.
    let prompt = match &args.prompt {
        Some(p) => p.trim().to_string(),
        None => {
            let mut line = String::new();
            io::stdin().lock().read_line(&mut line).unwrap_or(0);
            line.trim().to_string()
        }
    };
    if prompt.is_empty() {
        eprintln!("Error: no prompt provided");
        process::exit(1);
    }

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|e| {
            eprintln!("Error: failed to create runtime: {}", e);
            process::exit(1);
        });

    rt.block_on(async {
        let client = match fixed_token {
            Some(token) => Client::new(settings, StaticCredential::new(token)),
            None => Client::new(settings, EnvCredential::new(TOKEN_ENV)),
        };

        let mut printed = String::new();
        let result = client
            .submit_with_updates(&prompt, args.conversation, move |content, _| {
                let stdout = io::stdout();
                let mut out = stdout.lock();
                print_update(&mut out, &mut printed, content);
            })
            .await;

        match result {
            Ok(reply) => {
                println!();
                if let Some(id) = reply.conversation_id {
                    eprintln!("conversation: {}", id);
                }
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                process::exit(1);
            }
        }

        client.disconnect().await;
    });
}
