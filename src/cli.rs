use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use token_ledger::config::Config;
use token_ledger::error::{Error, Result};
use token_ledger::logger;
use token_ledger::purchase::SandboxReceiptVerifier;
use token_ledger::service::{
    Caller, Collaborators, ConsumeRequest, TokenService, VerifyPurchaseRequest,
};
use token_ledger::storage::FileStore;

/// Identity the CLI acts under for operator commands
const OPERATOR: &str = "cli-operator";

#[derive(Parser)]
#[command(name = "token-ledger")]
#[command(about = "Token Ledger CLI - Prepaid token balances backed by an append-only ledger")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output format: "human" or "json"
    #[arg(short, long, default_value = "human")]
    pub format: String,

    /// Data directory path
    #[arg(short, long)]
    pub data_dir: Option<String>,

    /// TOML config file
    #[arg(short, long)]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize the data directory
    Init,

    /// Spend tokens on an action
    Consume {
        #[arg(short, long)]
        user: String,

        /// generate, regenerate, reorganize or video_import
        #[arg(short, long)]
        action: String,

        /// Idempotency key; repeating it never charges twice
        #[arg(short, long)]
        request_id: String,

        /// Action details as a JSON object
        #[arg(long, default_value = "{}")]
        details: String,
    },

    /// Verify a store purchase and credit its tokens
    VerifyPurchase {
        #[arg(short, long)]
        user: String,

        #[arg(short, long)]
        product: String,

        #[arg(short, long)]
        transaction: String,

        #[arg(short, long)]
        receipt: String,

        /// ios or android
        #[arg(long, default_value = "ios")]
        platform: String,
    },

    /// Show account balances
    Account {
        user: String,
    },

    /// Show the most recent ledger entries, newest first
    Ledger {
        user: String,

        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Return the tokens of a failed action
    Refund {
        #[arg(short, long)]
        user: String,

        /// Request id of the original spend
        #[arg(short, long)]
        request_id: String,
    },

    /// Operator balance correction
    Adjust {
        #[arg(short, long)]
        user: String,

        #[arg(long, allow_hyphen_values = true)]
        delta: i64,

        #[arg(short, long)]
        request_id: String,

        /// Reason recorded on the ledger entry
        #[arg(short, long)]
        note: String,
    },

    /// Apply the monthly reset to every account
    ResetMonthly,

    /// Compare every ledger with its account and report drift
    Reconcile {
        /// List stored drift results instead of running a new pass
        #[arg(long)]
        results: bool,

        /// Restrict stored results to one user
        #[arg(short, long)]
        user: Option<String>,
    },

    /// Prune expired guard state and old reconciliation results
    Cleanup,
}

/// Build config: file or env first, then command-line overrides
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(std::path::Path::new(path))?,
        None => Config::from_env()?,
    };
    if let Some(dir) = &cli.data_dir {
        config.set_data_dir(PathBuf::from(dir));
    }
    if cli.format == "json" {
        config.set_output_format("json".to_string());
    }
    Ok(config)
}

/// Parse `--details`; it must be a JSON object
fn parse_details(json: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(json)
        .map_err(|e| Error::InvalidArgument(format!("Failed to parse details JSON: {}", e)))?;
    if !value.is_object() {
        return Err(Error::InvalidArgument(
            "details must be a JSON object".to_string(),
        ));
    }
    Ok(value)
}

/// Format output based on format type
fn format_output<T: serde::Serialize + std::fmt::Debug>(data: &T, format: &str) -> Result<String> {
    match format {
        "json" => serde_json::to_string_pretty(data)
            .map_err(|e| Error::Internal(format!("Failed to serialize JSON: {}", e))),
        _ => Ok(format!("{:#?}", data)),
    }
}

pub fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    logger::init_logging(config.get_log_level(), config.json_logs);

    let format = config.get_output_format().to_string();
    let store = FileStore::new(&config);

    if let Commands::Init = cli.command {
        store.ensure_dirs()?;
        println!("Initialized data directory at: {}", config.get_data_dir().display());
        return Ok(());
    }

    let store = Arc::new(store);
    let collaborators = Collaborators::new(&config, Arc::new(SandboxReceiptVerifier));
    let service = TokenService::new(store, config, collaborators)?;
    let operator = Caller::admin(OPERATOR);
    let now = Utc::now();

    match cli.command {
        Commands::Init => Ok(()),

        Commands::Consume {
            user,
            action,
            request_id,
            details,
        } => {
            let request = ConsumeRequest {
                action_type: action,
                request_id,
                details: parse_details(&details)?,
            };
            let response = service.consume_tokens(Some(&Caller::user(user)), &request, now)?;
            println!("{}", format_output(&response, &format)?);
            Ok(())
        }

        Commands::VerifyPurchase {
            user,
            product,
            transaction,
            receipt,
            platform,
        } => {
            let request = VerifyPurchaseRequest {
                product_id: product,
                transaction_id: transaction,
                receipt,
                platform,
            };
            let outcome = service.verify_purchase(Some(&Caller::user(user)), &request, now)?;
            println!("{}", format_output(&outcome, &format)?);
            Ok(())
        }

        Commands::Account { user } => match service.get_account(Some(&operator), &user)? {
            Some(account) => {
                let output = AccountOutput {
                    total_available: account.total_available(),
                    user_id: account.user_id,
                    tier: account.tier,
                    free_actions: account.free_actions,
                    welcome_bonus: account.welcome_bonus,
                    monthly_tokens: account.monthly_tokens,
                    last_reset: account.last_reset.map(|p| p.to_string()),
                };
                println!("{}", format_output(&output, &format)?);
                Ok(())
            }
            None => Err(Error::InvalidArgument(format!("Account {} not found", user))),
        },

        Commands::Ledger { user, limit } => {
            let entries = service.get_ledger_entries(Some(&operator), &user, limit)?;
            let output = LedgerOutput {
                user_id: user,
                entries: entries
                    .into_iter()
                    .map(|e| EntryOutput {
                        timestamp: e.timestamp.to_rfc3339(),
                        action: e.action.as_str().to_string(),
                        source: e.source.as_str().to_string(),
                        token_delta: e.token_delta,
                        request_id: e.request_id,
                    })
                    .collect(),
            };
            println!("{}", format_output(&output, &format)?);
            Ok(())
        }

        Commands::Refund { user, request_id } => {
            let outcome = service.refund_failed_action(&user, &request_id, now)?;
            let output = RefundOutput {
                user_id: user,
                credited: outcome.credited,
                new_balance: outcome.new_balance,
                replay: outcome.replay,
            };
            println!("{}", format_output(&output, &format)?);
            Ok(())
        }

        Commands::Adjust {
            user,
            delta,
            request_id,
            note,
        } => {
            let outcome =
                service.adjust_balance(Some(&operator), &user, delta, &request_id, &note, now)?;
            if outcome.replay {
                println!("Adjustment {} was already applied ({:+})", request_id, outcome.delta);
            } else {
                println!("✓ Adjusted {} by {:+}", user, outcome.delta);
            }
            println!("  Balance: {}", outcome.new_balance);
            Ok(())
        }

        Commands::ResetMonthly => {
            let report = service.run_monthly_resets(now)?;
            println!("{}", format_output(&report, &format)?);
            Ok(())
        }

        Commands::Reconcile { results, user } => {
            if results {
                let stored = service.reconciliation_results(user.as_deref())?;
                println!("{}", format_output(&stored, &format)?);
            } else {
                let report = service.run_reconciliation(now)?;
                println!("{}", format_output(&report, &format)?);
            }
            Ok(())
        }

        Commands::Cleanup => {
            let report = service.run_cleanup(now)?;
            println!("{}", format_output(&report, &format)?);
            Ok(())
        }
    }
}

#[derive(Debug, serde::Serialize)]
struct AccountOutput {
    user_id: String,
    tier: String,
    free_actions: u64,
    welcome_bonus: u64,
    monthly_tokens: u64,
    total_available: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_reset: Option<String>,
}

#[derive(Debug, serde::Serialize)]
struct EntryOutput {
    timestamp: String,
    action: String,
    source: String,
    token_delta: i64,
    request_id: String,
}

#[derive(Debug, serde::Serialize)]
struct LedgerOutput {
    user_id: String,
    entries: Vec<EntryOutput>,
}

#[derive(Debug, serde::Serialize)]
struct RefundOutput {
    user_id: String,
    credited: u64,
    new_balance: u64,
    replay: bool,
}
