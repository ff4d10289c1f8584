#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use referral_ledger::store;
use referral_ledger::{
    EngagementEvent, LanguageResolver, LedgerConfig, LedgerError, MessageId,
    ReferralLedger, RegisterRequest, TextCatalog,
};
use serde_json::{Value, json};

const DEFAULT_REPORT_TOP: usize = 10;

#[derive(Parser, Debug)]
#[command(name = "referral-ops")]
#[command(about = "Operate the referral ledger store from the command line")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Claim a spot for a user, optionally linking a referral code.
    Register(RegisterArgs),
    /// Attach a referral code to an already registered user.
    Link { user_id: String, code: String },
    Delete { user_id: String },
    Stats,
    FirstContact(FirstContactArgs),
    Engaged { user_id: String },
    User { user_id: String },
    LinkUrl { user_id: String },
    Report {
        #[arg(long, default_value_t = DEFAULT_REPORT_TOP)]
        top: usize,
    },
    ClearStats,
    ResolveLanguage { hint: Option<String> },
    Text {
        message_id: String,
        #[arg(long)]
        language: Option<String>,
    },
}

#[derive(Args, Debug)]
struct RegisterArgs {
    user_id: String,
    #[arg(long)]
    username: Option<String>,
    #[arg(long)]
    language: Option<String>,
    #[arg(long)]
    referral_code: Option<String>,
}

#[derive(Args, Debug)]
struct FirstContactArgs {
    user_id: String,
    #[arg(long)]
    language: Option<String>,
    #[arg(long)]
    country: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(output) => match serde_json::to_string_pretty(&output) {
            Ok(rendered) => {
                println!("{rendered}");
                ExitCode::SUCCESS
            }
            Err(error) => {
                eprintln!("error: {error}");
                ExitCode::FAILURE
            }
        },
        Err(error) => {
            eprintln!("{}", error_body(&error));
            ExitCode::FAILURE
        }
    }
}

fn error_body(error: &anyhow::Error) -> Value {
    match error.downcast_ref::<LedgerError>() {
        Some(ledger_error) => json!({
            "error": ledger_error.code(),
            "message": ledger_error.to_string(),
        }),
        None => json!({
            "error": "internal",
            "message": format!("{error:#}"),
        }),
    }
}

fn init_tracing(filter: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<Value> {
    let config = LedgerConfig::from_env().context("load configuration")?;
    init_tracing(&config.log_filter);

    let languages = Arc::new(LanguageResolver::default());

    // Commands that never touch the store.
    match &cli.command {
        Commands::ResolveLanguage { hint } => {
            let language = languages.resolve(hint.as_deref());
            return Ok(json!({
                "hint": hint,
                "language": language,
                "supported": languages.supported_languages(),
            }));
        }
        Commands::Text {
            message_id,
            language,
        } => {
            let id = MessageId::parse(message_id)
                .ok_or_else(|| anyhow!("unknown message id '{message_id}'"))?;
            let language = languages.resolve(language.as_deref());
            let catalog = TextCatalog::load(&config.texts_dir, config.texts_reload_interval)
                .with_context(|| format!("load texts from {}", config.texts_dir.display()))?;
            return Ok(json!({
                "message_id": id.as_str(),
                "language": language,
                "text": catalog.text(id, language),
            }));
        }
        _ => {}
    }

    let ledger = ReferralLedger::new(
        store::json_file(&config.store_path, config.total_spots),
        languages,
        config.policy(),
    );
    tracing::debug!(store = %config.store_path.display(), "opened ledger store");

    let output = match cli.command {
        Commands::Register(args) => {
            let result = ledger
                .register(RegisterRequest {
                    user_id: args.user_id,
                    username: args.username,
                    language_hint: args.language,
                    referral_code: args.referral_code,
                })
                .await?;
            serde_json::to_value(result)?
        }
        Commands::Link { user_id, code } => {
            serde_json::to_value(ledger.link_referral(&user_id, &code).await?)?
        }
        Commands::Delete { user_id } => serde_json::to_value(ledger.delete_user(&user_id).await?)?,
        Commands::Stats => serde_json::to_value(ledger.compute_statistics().await?)?,
        Commands::FirstContact(args) => {
            let outcome = ledger
                .record_event(
                    &args.user_id,
                    EngagementEvent::FirstContact {
                        language: args.language,
                        country: args.country,
                    },
                )
                .await?;
            json!({ "user_id": args.user_id, "outcome": outcome })
        }
        Commands::Engaged { user_id } => {
            let outcome = ledger
                .record_event(&user_id, EngagementEvent::Engaged)
                .await?;
            json!({ "user_id": user_id, "outcome": outcome })
        }
        Commands::User { user_id } => {
            let summary = ledger
                .user_summary(&user_id)
                .await?
                .ok_or_else(|| LedgerError::NotFound {
                    user_id: user_id.clone(),
                })?;
            serde_json::to_value(summary)?
        }
        Commands::LinkUrl { user_id } => {
            let link = ledger
                .referral_link(&user_id, &config.invite_link_base)
                .await?
                .ok_or_else(|| LedgerError::NotFound {
                    user_id: user_id.clone(),
                })?;
            json!({ "user_id": user_id, "link": link })
        }
        Commands::Report { top } => serde_json::to_value(ledger.referral_report(top).await?)?,
        Commands::ClearStats => {
            ledger.clear_statistics().await?;
            json!({ "cleared": true })
        }
        Commands::ResolveLanguage { .. } | Commands::Text { .. } => {
            return Err(anyhow!("command does not use the ledger store"));
        }
    };
    Ok(output)
}
