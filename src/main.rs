//! # chat-recall CLI (`recall`)
//!
//! Indexes a chat export and answers questions about it.
//!
//! ## Usage
//!
//! ```bash
//! recall --config ./config/recall.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `recall init` | Create the SQLite database and schema |
//! | `recall index [export.json]` | Incremental index of new/changed messages |
//! | `recall reindex [export.json]` | Drop all chunks and vectors and rebuild |
//! | `recall stats` | Corpus counts |
//! | `recall ask "<question>"` | Answer one question |
//! | `recall chat` | Interactive session with reply chains |
//! | `recall search "<query>"` | Ranked quotes with filters |
//! | `recall flip <who> <topic>` | Stance change detection |
//! | `recall context <id>` | A message and its neighbours |
//! | `recall alias add\|remove\|list\|seed` | Nickname management |
//! | `recall embed pending` | Retry chunks whose embedding failed |
//!
//! ## Examples
//!
//! ```bash
//! recall index ./export/result.json
//! recall ask "що гусь казав про крипту до 2022?"
//! recall ask "покажи ще" --reply-to 3f2a9c01
//! recall alias add user123 гусь
//! ```

use chat_recall::config;
use chat_recall::index_lock::LockMode;
use chat_recall::progress::ProgressMode;
use chat_recall::{commands, embed_cmd, ingest, logging, migrate, stats};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// chat-recall: question answering over an exported group chat.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file.
#[derive(Parser)]
#[command(
    name = "recall",
    about = "chat-recall: find who said what in a group chat, and when they changed their mind",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/recall.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Index new and changed messages.
    ///
    /// With an export path, the export is parsed and upserted first;
    /// without one, the stored messages are re-chunked from the watermark.
    /// Unchanged chunks are never re-embedded.
    Index {
        /// Chat export (JSON).
        export: Option<PathBuf>,

        /// Progress on stderr: off, human, or json.
        #[arg(long, value_enum)]
        progress: Option<ProgressArg>,
    },

    /// Delete every chunk and vector, then index from scratch.
    ///
    /// Questions asked while a reindex runs are answered with "busy".
    Reindex {
        /// Chat export (JSON).
        export: Option<PathBuf>,

        #[arg(long, value_enum)]
        progress: Option<ProgressArg>,
    },

    /// Show corpus statistics.
    Stats,

    /// Answer one question, as if it arrived in a chat.
    Ask {
        text: String,

        /// Reference of the earlier answer this one replies to.
        #[arg(long)]
        reply_to: Option<String>,

        /// Chat id for reply-chain scoping.
        #[arg(long)]
        chat: Option<String>,
    },

    /// Interactive session. Reply to an answer with `#REF text`.
    Chat,

    /// Ranked quotes for a query.
    Search {
        query: String,

        /// Only chunks this person contributed (name, nickname, or id).
        #[arg(long)]
        author: Option<String>,

        /// From this day (YYYY-MM-DD).
        #[arg(long)]
        since: Option<String>,

        /// Up to and including this day (YYYY-MM-DD).
        #[arg(long)]
        until: Option<String>,

        /// Continue from a cursor printed by an earlier page (`rank:N`).
        #[arg(long)]
        cursor: Option<String>,
    },

    /// Check whether someone's stance on a topic changed over time.
    Flip { who: String, topic: String },

    /// Show a message with the messages around it.
    Context { message_id: i64 },

    /// Who writes the most.
    Top {
        /// From this day (YYYY-MM-DD).
        #[arg(long)]
        since: Option<String>,

        /// Up to and including this day (YYYY-MM-DD).
        #[arg(long)]
        until: Option<String>,
    },

    /// Who mentions a word or a person, and how often.
    Mentions {
        term: String,

        /// Count only this person's messages.
        #[arg(long)]
        author: Option<String>,

        #[arg(long)]
        since: Option<String>,

        #[arg(long)]
        until: Option<String>,
    },

    /// Manage nicknames.
    Alias {
        #[command(subcommand)]
        action: AliasAction,
    },

    /// Manage embedding vectors.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },
}

#[derive(Subcommand)]
enum AliasAction {
    /// Bind a nickname to a person (identity id, name, or existing nickname).
    Add { who: String, nickname: String },
    /// Unbind a nickname.
    Remove { nickname: String },
    /// List all nicknames.
    List,
    /// Apply the `[aliases.seed]` table from config.
    Seed,
}

#[derive(Subcommand)]
enum EmbedAction {
    /// Retry chunks left pending by provider failures.
    Pending {
        /// Show counts without embedding anything.
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Off,
    Human,
    Json,
}

impl ProgressArg {
    fn mode(arg: Option<Self>) -> ProgressMode {
        match arg {
            Some(ProgressArg::Off) => ProgressMode::Off,
            Some(ProgressArg::Human) => ProgressMode::Human,
            Some(ProgressArg::Json) => ProgressMode::Json,
            None => ProgressMode::default_for_tty(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Index { export, progress } => {
            let reporter = ProgressArg::mode(progress).reporter();
            ingest::run_index(&cfg, export.as_deref(), LockMode::Index, reporter.as_ref()).await?;
        }
        Commands::Reindex { export, progress } => {
            let reporter = ProgressArg::mode(progress).reporter();
            ingest::run_index(&cfg, export.as_deref(), LockMode::Reindex, reporter.as_ref())
                .await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Ask {
            text,
            reply_to,
            chat,
        } => {
            commands::run_ask(&cfg, &text, reply_to.as_deref(), chat.as_deref()).await?;
        }
        Commands::Chat => {
            commands::run_chat(&cfg).await?;
        }
        Commands::Search {
            query,
            author,
            since,
            until,
            cursor,
        } => {
            commands::run_search(
                &cfg,
                &query,
                author.as_deref(),
                since.as_deref(),
                until.as_deref(),
                cursor.as_deref(),
            )
            .await?;
        }
        Commands::Flip { who, topic } => {
            commands::run_flip(&cfg, &who, &topic).await?;
        }
        Commands::Context { message_id } => {
            commands::run_context(&cfg, message_id).await?;
        }
        Commands::Top { since, until } => {
            commands::run_top(&cfg, since.as_deref(), until.as_deref()).await?;
        }
        Commands::Mentions {
            term,
            author,
            since,
            until,
        } => {
            commands::run_mentions(
                &cfg,
                &term,
                author.as_deref(),
                since.as_deref(),
                until.as_deref(),
            )
            .await?;
        }
        Commands::Alias { action } => match action {
            AliasAction::Add { who, nickname } => {
                commands::run_alias_add(&cfg, &who, &nickname).await?;
            }
            AliasAction::Remove { nickname } => {
                commands::run_alias_remove(&cfg, &nickname).await?;
            }
            AliasAction::List => {
                commands::run_alias_list(&cfg).await?;
            }
            AliasAction::Seed => {
                commands::run_alias_seed(&cfg).await?;
            }
        },
        Commands::Embed { action } => match action {
            EmbedAction::Pending { dry_run } => {
                let reporter = ProgressMode::default_for_tty().reporter();
                embed_cmd::run_embed_pending(&cfg, dry_run, reporter.as_ref()).await?;
            }
        },
    }

    Ok(())
}
