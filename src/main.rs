//! # Evidence Harness CLI (`evh`)
//!
//! The `evh` binary is the primary interface for Evidence Harness. It
//! provides commands for database initialization, case-bundle seeding,
//! passage retrieval, grounded composition, deterministic dosing and
//! algorithm lookups, external literature search, and the HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! evh --config ./config/evh.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `evh init` | Create the SQLite database and run schema migrations |
//! | `evh seed <file>` | Load a case bundle (passages + rule records) |
//! | `evh retrieve "<query>"` | Rank case passages for a query |
//! | `evh explain "<question>"` | Compose a grounded answer bundle |
//! | `evh dose <drug> --weight-kg <kg>` | Weight-based dose calculation |
//! | `evh algo <case> --stage <n>` | Algorithm steps and stage gate |
//! | `evh evidence <term> --case-type <t>` | External literature search |
//! | `evh cache stats` | Session-cache statistics (via the server) |
//! | `evh stats` | Database statistics |
//! | `evh serve` | Start the HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! evh init --config ./config/evh.toml
//!
//! # Seed the anaphylaxis case bundle
//! evh seed cases/anaphylaxis.json
//!
//! # Rank passages for a learner query
//! evh retrieve "first line drug for anaphylaxis" --case anaphylaxis --stage 1
//!
//! # Compose a grounded answer (JSON bundle on stdout)
//! evh explain "what do I give first?" --case anaphylaxis --stage 1
//!
//! # Deterministic dose lookup
//! evh dose epinephrine --weight-kg 18.5 --case anaphylaxis
//!
//! # Algorithm steps filtered by current vitals
//! evh algo anaphylaxis --stage 1 --vital hr=142 --vital spo2=91 --done epi-im
//!
//! # Start the HTTP server
//! evh serve --config ./config/evh.toml
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use evidence_harness::{
    cache_cmd, compose, config, evidence, migrate, retrieve, rules, seed, server, stats,
};

/// Evidence Harness CLI — an evidence-grounded clinical reasoning pipeline
/// for pediatric emergency simulation training.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/evh.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "evh",
    about = "Evidence Harness — an evidence-grounded clinical reasoning pipeline for pediatric emergency simulation",
    version,
    long_about = "Evidence Harness grounds a training simulator's explanations in curated case \
    passages: it retrieves and ranks passages, composes model answers that must cite them, \
    validates those citations, computes weight-based doses and algorithm steps from versioned \
    rule records, and degrades to safe fallback bundles whenever grounding fails."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/evh.toml`. Database, retrieval, security,
    /// model, evidence, and server settings are read from this file.
    #[arg(long, global = true, default_value = "./config/evh.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables (passages,
    /// rules, evidence_cache). This command is idempotent — running it
    /// multiple times is safe.
    Init,

    /// Seed a case bundle from a JSON file.
    ///
    /// Inserts curated passages (deduplicated on a content hash) and
    /// upserts versioned rule records. Re-seeding the same bundle is a
    /// no-op for passages.
    Seed {
        /// Path to the case bundle JSON file.
        file: PathBuf,
    },

    /// Rank case passages for a query.
    ///
    /// Scores candidate passages by term occurrences and tag priority and
    /// prints the ranked list with scores and excerpts.
    Retrieve {
        /// The query text.
        query: String,

        /// Restrict to one case.
        #[arg(long)]
        case: Option<String>,

        /// Restrict to one scenario stage.
        #[arg(long)]
        stage: Option<u32>,

        /// Restrict to one section: background, objectives,
        /// critical_actions, contraindications, debrief, actor_prompts,
        /// or pitfalls.
        #[arg(long)]
        section: Option<String>,

        /// Require a tag (repeatable; all given tags must be present).
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Maximum number of results.
        #[arg(long)]
        limit: Option<usize>,

        /// Session id for the retrieval cache.
        #[arg(long, default_value = "cli")]
        session: String,
    },

    /// Compose a grounded answer for a learner question.
    ///
    /// Retrieves passages, optionally gathers external literature, calls
    /// the configured model, validates its citations, and prints the
    /// resulting bundle as JSON. With the model provider disabled this
    /// still returns a well-formed fallback bundle.
    Explain {
        /// The learner question.
        question: String,

        /// Restrict retrieval to one case.
        #[arg(long)]
        case: Option<String>,

        /// Restrict retrieval to one scenario stage.
        #[arg(long)]
        stage: Option<u32>,

        /// Restrict retrieval to one section.
        #[arg(long)]
        section: Option<String>,

        /// Require a tag (repeatable).
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Intervention term for the external literature lookup.
        /// Literature is skipped when absent.
        #[arg(long)]
        intervention: Option<String>,

        /// Age group term for literature relevance (e.g. "infant").
        #[arg(long)]
        age_group: Option<String>,

        /// Session id for the retrieval cache.
        #[arg(long)]
        session: Option<String>,
    },

    /// Calculate a weight-based drug dose.
    ///
    /// Uses the newest matching dosing rule: a covering weight band wins,
    /// otherwise the per-kilogram formula clamped to the absolute maximum.
    Dose {
        /// Drug name (case-insensitive).
        drug: String,

        /// Patient weight in kilograms.
        #[arg(long)]
        weight_kg: f64,

        /// Patient age in months.
        #[arg(long)]
        age_months: Option<u32>,

        /// Prefer rules for this case before the shared defaults.
        #[arg(long)]
        case: Option<String>,
    },

    /// Show algorithm steps and the stage gate for a case.
    ///
    /// Prints the applicable steps for the observed vitals, the critical
    /// actions for the stage, and whether the scenario advances.
    Algo {
        /// Case id.
        case: String,

        /// Current scenario stage.
        #[arg(long)]
        stage: u32,

        /// Observed vital as NAME=VALUE (repeatable), e.g. --vital hr=142.
        #[arg(long = "vital", value_parser = parse_vital)]
        vitals: Vec<(String, f64)>,

        /// Critical action id already completed (repeatable).
        #[arg(long = "done")]
        done: Vec<String>,
    },

    /// Search external literature for an intervention.
    ///
    /// Cache-first: repeated queries are served from the durable evidence
    /// cache without a network call. Requires `[evidence] enabled = true`
    /// for live lookups.
    Evidence {
        /// Intervention term, e.g. "epinephrine".
        intervention: String,

        /// Case type term, e.g. "anaphylaxis".
        #[arg(long)]
        case_type: String,

        /// Age group term.
        #[arg(long)]
        age_group: Option<String>,

        /// Maximum number of articles.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Inspect or clear the running server's session cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Print database statistics.
    ///
    /// Shows passage, rule, and cached-evidence counts with a per-case
    /// breakdown.
    Stats,

    /// Start the HTTP server.
    ///
    /// Binds to the address configured in `[server].bind` and serves the
    /// retrieval, explain, rules, evidence, and cache endpoints.
    Serve,
}

/// Session-cache subcommands. These talk to the running server.
#[derive(Subcommand)]
enum CacheAction {
    /// Show entry and session counts.
    Stats,

    /// Clear cached retrievals.
    Clear {
        /// Only clear this session's entries.
        #[arg(long)]
        session: Option<String>,
    },
}

/// Parse a `NAME=VALUE` pair for `--vital` arguments.
fn parse_vital(s: &str) -> Result<(String, f64), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid NAME=VALUE: no '=' found in '{}'", s))?;
    let value = s[pos + 1..]
        .parse::<f64>()
        .map_err(|e| format!("invalid vital value in '{}': {}", s, e))?;
    Ok((s[..pos].to_string(), value))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout is reserved for command output
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Seed { file } => {
            seed::run_seed(&cfg, &file).await?;
        }
        Commands::Retrieve {
            query,
            case,
            stage,
            section,
            tags,
            limit,
            session,
        } => {
            retrieve::run_retrieve(&cfg, &query, case, stage, section, tags, limit, &session)
                .await?;
        }
        Commands::Explain {
            question,
            case,
            stage,
            section,
            tags,
            intervention,
            age_group,
            session,
        } => {
            compose::run_explain(
                &cfg,
                &question,
                case,
                stage,
                section,
                tags,
                intervention,
                age_group,
                session,
            )
            .await?;
        }
        Commands::Dose {
            drug,
            weight_kg,
            age_months,
            case,
        } => {
            rules::run_dose(&cfg, &drug, weight_kg, age_months, case).await?;
        }
        Commands::Algo {
            case,
            stage,
            vitals,
            done,
        } => {
            rules::run_algo(&cfg, &case, stage, vitals, done).await?;
        }
        Commands::Evidence {
            intervention,
            case_type,
            age_group,
            limit,
        } => {
            evidence::run_evidence(&cfg, &intervention, &case_type, age_group, limit).await?;
        }
        Commands::Cache { action } => match action {
            CacheAction::Stats => {
                cache_cmd::run_cache_stats(&cfg).await?;
            }
            CacheAction::Clear { session } => {
                cache_cmd::run_cache_clear(&cfg, session).await?;
            }
        },
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
