use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;

use chat_relay::config::{AppConfig, Overrides};
use chat_relay::{logging, server, storage, title};

#[derive(Parser)]
#[command(name = "chat-relay")]
#[command(about = "Chat backend with transactional history reconciliation and resumable model streams", version)]
#[command(after_help = "Configuration is read from defaults, an optional TOML file, the environment
(including a .env file) and finally command-line flags.

Common environment variables:
   PORT, DATABASE_PATH, RESUME_GRACE_WINDOW_SECS, STREAM_REPLAY_RETENTION_SECS,
   AUTH_USER_HEADER, OPENAI_BASE_URL, OPENAI_API_KEY, OPENAI_MODELS,
   AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY, AWS_ENDPOINT_URL_S3, AWS_REGION,
   AWS_BUCKET_NAME, AWS_BUCKET_URL")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true, env = "CHAT_RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database file
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Create the database schema
    Init,

    /// List a user's most recent chats
    Chats {
        #[arg(short, long)]
        user: String,

        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Print the messages of a chat
    History {
        #[arg(short, long)]
        user: String,

        #[arg(long)]
        chat: String,
    },

    /// Show the title generated for a first message
    Title { text: String },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut overrides = Overrides {
        config_file: cli.config,
        database_path: cli.database,
        ..Overrides::default()
    };

    match cli.command {
        Commands::Serve { port } => {
            overrides.port = port;
            let config = AppConfig::load(&overrides)?;
            let _guard = logging::init(&config.log_filter, config.log_dir.as_deref())?;
            server::start(config).await?;
        }

        Commands::Init => {
            let config = AppConfig::load(&overrides)?;
            println!("{}", "🚀 Initializing chat database...".cyan().bold());
            storage::init(&config.database_path)?;
            println!(
                "{} Database ready at {}",
                "✓".green(),
                config.database_path.display().to_string().bright_white()
            );
            println!("\n{}", "Next steps:".yellow());
            println!("  1. {} - Start the server", "chat-relay serve".bright_white());
            println!(
                "  2. {} - Inspect chats",
                "chat-relay chats --user <id>".bright_white()
            );
        }

        Commands::Chats { user, limit } => {
            let config = AppConfig::load(&overrides)?;
            storage::show_chats(&config.database_path, &user, limit)?;
        }

        Commands::History { user, chat } => {
            let config = AppConfig::load(&overrides)?;
            storage::show_history(&config.database_path, &user, &chat)?;
        }

        Commands::Title { text } => {
            println!("{}", title::title_from_text(&text).bright_white().bold());
        }
    }

    Ok(())
}
