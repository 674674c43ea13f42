use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use reqwest::Url;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

mod crawler;
mod db;
mod error;
mod models;
mod parser;
mod query;
mod report;
mod scrape;
mod summary;

use crawler::{Credentials, CrawlerConfig, PageSource, SessionCrawler};
use models::RunSummary;

#[derive(Parser)]
#[command(name = "course-evals")]
#[command(about = "Scrapes course evaluations into Postgres and queries the class summaries", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum AdlnScope {
    Both,
    Adln,
    Regular,
}

impl AdlnScope {
    fn flags(self) -> &'static [bool] {
        match self {
            AdlnScope::Both => &[true, false],
            AdlnScope::Adln => &[true],
            AdlnScope::Regular => &[false],
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Drop and recreate every table, discarding all scraped data
    Reset {
        /// Question catalog to load after the reset
        #[arg(long)]
        questions: Option<PathBuf>,
    },
    /// Load question short keys from a Num,ShortString,FullString CSV file
    ImportQuestions {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Scrape evaluations for academic years (all listed years by default)
    Scrape {
        #[arg(long = "year")]
        years: Vec<i32>,
        #[arg(long, value_enum, default_value_t = AdlnScope::Both)]
        adln: AdlnScope,
        /// Only scrape these CRNs
        #[arg(long = "crn", value_delimiter = ',')]
        crns: Vec<i32>,
    },
    /// Retry every recorded failed scrape
    RetryFailed,
    /// List failed scrapes whose class is still missing
    Failures,
    /// Find listed classes that are neither stored nor recorded as failed
    Reconcile {
        #[arg(long = "year")]
        years: Vec<i32>,
        /// Report only, do not scrape the missing classes
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Rebuild the class summary table
    BuildSummaries,
    /// Print the column layout of the class summary table as JSON
    Columns {
        #[arg(long = "visible", value_delimiter = ',')]
        visible: Vec<String>,
    },
    /// Answer a table query read from a JSON file, or stdin with "-"
    Query {
        #[arg(long, default_value = "-")]
        request: PathBuf,
    },
    /// Parse a saved evaluation page and print it as JSON
    Parse {
        #[arg(long)]
        file: PathBuf,
    },
    /// Show row counts per table
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing()?;
    let cli = Cli::parse();

    match cli.command {
        Commands::InitDb => {
            let pool = connect().await?;
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Reset { questions } => {
            let pool = connect().await?;
            db::reset(&pool).await?;
            if let Some(csv) = questions {
                let imported = db::import_questions(&pool, &csv).await?;
                println!("Loaded {imported} questions from {}.", csv.display());
            }
            summary::rebuild(&pool).await?;
            println!("Database reset.");
        }
        Commands::ImportQuestions { csv } => {
            let pool = connect().await?;
            let imported = db::import_questions(&pool, &csv).await?;
            println!("Loaded {imported} questions from {}.", csv.display());
        }
        Commands::Scrape { years, adln, crns } => {
            let pool = connect().await?;
            let mut crawler = crawler_from_env()?;
            crawler.login().await.context("login failed")?;

            let years = if years.is_empty() {
                crawler.discover_years().await?
            } else {
                years
            };

            let mut total = RunSummary::default();
            for year in years {
                for &flag in adln.flags() {
                    total.absorb(scrape::process_listing(&mut crawler, &pool, year, flag, &crns).await?);
                }
            }
            print_run(&total);
            rebuild_summaries(&pool).await?;
        }
        Commands::RetryFailed => {
            let pool = connect().await?;
            let mut crawler = crawler_from_env()?;
            crawler.login().await.context("login failed")?;

            let total = scrape::retry_failed(&mut crawler, &pool).await?;
            print_run(&total);
            let outstanding = scrape::outstanding_failures(&pool).await?;
            println!("{} failures still outstanding.", outstanding.len());
            rebuild_summaries(&pool).await?;
        }
        Commands::Failures => {
            let pool = connect().await?;
            let outstanding = scrape::outstanding_failures(&pool).await?;
            print!("{}", report::format_failures(&outstanding));
        }
        Commands::Reconcile {
            years,
            dry_run,
            out,
        } => {
            let pool = connect().await?;
            let mut crawler = crawler_from_env()?;
            crawler.login().await.context("login failed")?;

            let reconciliation = scrape::reconcile(&mut crawler, &pool, &years, !dry_run).await?;
            let text = report::build_reconciliation_report(&reconciliation, chrono::Utc::now());
            match out {
                Some(path) => {
                    std::fs::write(&path, text)?;
                    println!("Report written to {}.", path.display());
                }
                None => print!("{text}"),
            }
            if reconciliation.fixed.is_some() {
                rebuild_summaries(&pool).await?;
            }
        }
        Commands::BuildSummaries => {
            let pool = connect().await?;
            rebuild_summaries(&pool).await?;
        }
        Commands::Columns { visible } => {
            let pool = connect().await?;
            let names = summary::summary_columns(&pool).await?;
            if names.is_empty() {
                anyhow::bail!("class summaries have not been built; run build-summaries first");
            }
            let layout = query::column_layout(&names, &visible);
            println!("{}", serde_json::to_string_pretty(&layout)?);
        }
        Commands::Query { request } => {
            let pool = connect().await?;
            let text = read_request(&request)?;
            let request: query::QueryRequest =
                serde_json::from_str(&text).context("malformed query request")?;
            let response = query::execute(&pool, &request).await?;
            println!("{}", serde_json::to_string(&response)?);
        }
        Commands::Status => {
            let pool = connect().await?;
            for (table, count) in db::table_counts(&pool).await? {
                println!("{:<16} {count}", table.name());
            }
        }
        Commands::Parse { file } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let evaluation = parser::parse_evaluation(&text)?;
            println!("{}", serde_json::to_string_pretty(&evaluation)?);
        }
    }

    Ok(())
}

async fn connect() -> anyhow::Result<PgPool> {
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to the evaluations Postgres instance")?;

    PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")
}

fn init_tracing() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_env("EVALS_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|error| anyhow::anyhow!("failed to initialize tracing subscriber: {error}"))?;

    Ok(())
}

fn crawler_from_env() -> anyhow::Result<SessionCrawler> {
    let username = std::env::var("EVALS_USERNAME").context("EVALS_USERNAME must be set to crawl")?;
    let password = std::env::var("EVALS_PASSWORD").context("EVALS_PASSWORD must be set to crawl")?;
    let base_url = std::env::var("EVALS_BASE_URL")
        .unwrap_or_else(|_| crawler::DEFAULT_BASE_URL.to_string());
    let base_url = Url::parse(&base_url).with_context(|| format!("invalid EVALS_BASE_URL {base_url}"))?;

    Ok(SessionCrawler::new(CrawlerConfig {
        base_url,
        credentials: Credentials { username, password },
    }))
}

fn read_request(path: &Path) -> anyhow::Result<String> {
    if path == Path::new("-") {
        std::io::read_to_string(std::io::stdin()).context("failed to read request from stdin")
    } else {
        std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
    }
}

async fn rebuild_summaries(pool: &PgPool) -> anyhow::Result<()> {
    let stats = summary::rebuild(pool).await?;
    println!(
        "Class summaries rebuilt: {} rows, {} question columns.",
        stats.rows, stats.question_keys
    );
    Ok(())
}

fn print_run(summary: &RunSummary) {
    println!(
        "Stored {} classes, {} failed, {} duplicates.",
        summary.stored, summary.failed, summary.duplicates
    );
}
