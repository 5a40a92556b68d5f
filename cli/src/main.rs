//! Dominion protector CLI.
//!
//! Runs a page, its content script, the background and the review popups in-process,
//! with a demo sui wallet installed in the page. Signing calls go through the protected
//! wallet and each review popup is answered from the command line.
//!
//! # Usage
//!
//! ```bash
//! # Interactive session
//! dominion_cli
//!
//! # One signing attempt, answered with `fix`
//! dominion_cli sign --transaction '{"amount":100}' --decision fix --fix_transaction '{"amount":1}'
//!
//! # Review popups closed after 30 seconds without a decision
//! dominion_cli --review_timeout_secs 30
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::debug;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use sdk::abort::AbortController;
use sdk::config::ProtectorConfig;
use sdk::notification::Notification;
use sdk::popup::{ReviewDecision, ReviewPopup};
use sdk::sandbox::{demo_account, demo_wallet, ExtensionHarness, RecordingSigner, TabSetup};
use sdk::wallet::{
    ExecutedTransaction, SerializedTransaction, SignTransactionInput, SignedTransaction, Wallet,
    WalletError,
};

const DEMO_TAB: u32 = 1;
const DEMO_WALLET: &str = "Suiet";
const ABORT_REASON: &str = "aborted from the command line";

#[derive(Parser)]
#[command(
    name = "dominion_cli",
    about = "Sign transactions through the Dominion wallet protector"
)]
#[clap(rename_all = "snake_case")]
struct Args {
    /// Path to a JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Cancel reviews left undecided for that many seconds
    #[arg(long)]
    review_timeout_secs: Option<u64>,

    #[arg(long)]
    popup_width: Option<u32>,

    #[arg(long)]
    popup_height: Option<u32>,

    /// Run a single command instead of an interactive session
    #[clap(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Parser, Debug)]
#[command(name = "dominion")]
struct Cli {
    #[clap(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
#[clap(rename_all = "snake_case")]
enum CliCommand {
    /// Sign a transaction with the protected demo wallet
    Sign {
        /// The serialized transaction
        #[clap(long)]
        transaction: String,
        #[clap(long, default_value = "sui:devnet")]
        chain: String,
        /// Execute the transaction once signed
        #[clap(long)]
        execute: bool,
        /// Answer to the review popup; asked for when missing
        #[clap(long, value_enum)]
        decision: Option<Decision>,
        /// Replacement transaction for the `fix` decision
        #[clap(long)]
        fix_transaction: Option<String>,
        /// Abort the signing call while its review is open
        #[clap(long)]
        abort: bool,
    },
    /// List the wallets of the page, and the ones reported to the background
    Wallets,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Decision {
    Fix,
    Cancel,
    Proceed,
    /// Close the popup without deciding
    Close,
}

struct SignArgs {
    transaction: String,
    chain: String,
    execute: bool,
    decision: Option<Decision>,
    fix_transaction: Option<String>,
    abort: bool,
}

enum Signature {
    Signed(SignedTransaction),
    Executed(ExecutedTransaction),
}

struct Session {
    harness: ExtensionHarness,
    tab: TabSetup,
    wallet: Arc<Wallet>,
}

impl Session {
    fn new(config: ProtectorConfig) -> Result<Self> {
        let harness = ExtensionHarness::new(config);
        let tab = harness.open_tab(DEMO_TAB);
        tab.announce_wallet(demo_wallet(DEMO_WALLET, RecordingSigner::new()));
        let wallet = tab
            .protected_wallet(DEMO_WALLET)
            .ok_or_else(|| anyhow!("the demo wallet was not protected"))?;
        Ok(Self {
            harness,
            tab,
            wallet,
        })
    }
}

fn load_config(args: &Args) -> Result<ProtectorConfig> {
    let mut config = match &args.config {
        Some(path) => ProtectorConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ProtectorConfig::default(),
    };
    if let Some(secs) = args.review_timeout_secs {
        config.review_timeout_secs = Some(secs);
    }
    if let Some(width) = args.popup_width {
        config.popup_width = width;
    }
    if let Some(height) = args.popup_height {
        config.popup_height = height;
    }
    config.validate()?;
    Ok(config)
}

fn network(chain: &str) -> &str {
    chain.split_once(':').map_or(chain, |(_, network)| network)
}

fn notification(result: Result<Signature, WalletError>, chain: &str) -> Notification {
    match result {
        Ok(Signature::Signed(signed)) => Notification::TransactionSigned {
            signature: signed.signature,
        },
        Ok(Signature::Executed(executed)) => Notification::TransactionSuccess {
            digest: executed.digest,
            network: network(chain).to_string(),
            user: demo_account().address,
        },
        Err(e) => Notification::error(&e),
    }
}

fn show(popup: &ReviewPopup) {
    let request = popup.request();
    println!("Review {} from tab {}", request.id, request.origin);
    println!("  account: {}", request.account);
    println!("  chain:   {}", request.chain);
    match popup
        .transaction_json()
        .and_then(|tx| Ok(serde_json::to_string_pretty(&tx)?))
    {
        Ok(pretty) => println!("  transaction:\n{pretty}"),
        Err(_) => println!("  transaction: {}", request.transaction),
    }
}

fn review_decision(decision: Decision, fix: Option<String>) -> Result<Option<ReviewDecision>> {
    Ok(match decision {
        Decision::Fix => Some(ReviewDecision::Fix {
            transaction: fix.ok_or_else(|| anyhow!("fix needs --fix_transaction"))?,
        }),
        Decision::Cancel => Some(ReviewDecision::Cancel),
        Decision::Proceed => Some(ReviewDecision::Proceed),
        Decision::Close => None,
    })
}

/// Asks for a decision on the open review. `None` closes the popup.
fn prompt_decision(editor: &mut DefaultEditor) -> Result<Option<ReviewDecision>> {
    loop {
        let line = match editor.readline("review (fix <transaction> | cancel | proceed | close)> ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let words = match shellwords::split(&line) {
            Ok(words) => words,
            Err(e) => {
                println!("Error: {e}");
                continue;
            }
        };
        let Some((first, rest)) = words.split_first() else {
            continue;
        };
        let Some(decision) = Decision::from_str(first, true).ok() else {
            println!("Unknown decision: {first}");
            continue;
        };
        let fix = (!rest.is_empty()).then(|| rest.join(" "));
        match review_decision(decision, fix) {
            Ok(decision) => return Ok(decision),
            Err(e) => println!("Error: {e}"),
        }
    }
}

async fn sign(session: &Session, editor: &mut DefaultEditor, args: SignArgs) -> Result<Notification> {
    let controller = AbortController::new();
    let input = SignTransactionInput {
        transaction: Arc::new(SerializedTransaction::new(args.transaction)),
        account: demo_account(),
        chain: args.chain.clone(),
        signal: Some(controller.signal()),
    };
    let wallet = session.wallet.clone();
    let execute = args.execute;
    let mut signing = tokio::spawn(async move {
        if execute {
            wallet
                .sign_and_execute_transaction(input)
                .await
                .map(Signature::Executed)
        } else {
            wallet.sign_transaction(input).await.map(Signature::Signed)
        }
    });

    // Signing may end before any popup opens, when the review cannot be shown.
    let popup = tokio::select! {
        biased;
        finished = &mut signing => return Ok(notification(finished?, &args.chain)),
        popup = session.harness.next_popup() => popup?,
    };
    show(&popup);

    if args.abort {
        controller.abort(ABORT_REASON);
    }
    let decision = match args.decision {
        Some(decision) => review_decision(decision, args.fix_transaction)?,
        None => prompt_decision(editor)?,
    };
    match decision {
        Some(decision) => popup.decide(decision).await?,
        None => popup.close().await?,
    }

    let finished = signing.await?;
    Ok(notification(finished, &args.chain))
}

async fn wallets(session: &Session) {
    for wallet in session.tab.registry.get().iter() {
        let kind = if wallet.is_protected() { "protected" } else { "original" };
        println!(
            "{:<10} {:<20} {}",
            kind,
            wallet.id().unwrap_or("-"),
            wallet.name()
        );
    }

    // Reports reach the background asynchronously.
    let mut reported = session.harness.background.tab_wallets(DEMO_TAB);
    for _ in 0..20 {
        if !reported.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
        reported = session.harness.background.tab_wallets(DEMO_TAB);
    }
    println!("Reported to the background:");
    for wallet in reported {
        println!(
            "  {} ({}) on {}",
            wallet.name,
            wallet.id.as_deref().unwrap_or("-"),
            wallet.chains.join(", ")
        );
    }
}

async fn handle_cli_command(
    session: &Session,
    editor: &mut DefaultEditor,
    command: CliCommand,
) -> Result<()> {
    match command {
        CliCommand::Sign {
            transaction,
            chain,
            execute,
            decision,
            fix_transaction,
            abort,
        } => {
            let args = SignArgs {
                transaction,
                chain,
                execute,
                decision,
                fix_transaction,
                abort,
            };
            let notification = sign(session, editor, args).await?;
            println!("{}", notification.render());
        }
        CliCommand::Wallets => wallets(session).await,
    }
    Ok(())
}

fn prepare_prompt_for_clap(line: &str) -> Result<Vec<String>> {
    let args = shellwords::split(line).context("failed to parse input")?;
    let Some((command, rest)) = args.split_first() else {
        bail!("empty input");
    };

    let mut clap_args = vec!["dominion".to_string(), command.clone()];
    for arg in rest {
        clap_args.push(format!("--{arg}"));
    }
    Ok(clap_args)
}

async fn repl(session: &Session, editor: &mut DefaultEditor) -> Result<()> {
    println!("Protected wallet: {}", session.wallet.unique_id());
    loop {
        let line = match editor.readline("DOMINION> ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => {
                println!("Interrupted");
                continue;
            }
            Err(ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "exit" {
            break;
        }
        editor.add_history_entry(line)?;

        let clap_args = match prepare_prompt_for_clap(line) {
            Ok(args) => args,
            Err(e) => {
                println!("Error: {e}");
                continue;
            }
        };
        match Cli::try_parse_from(clap_args) {
            Ok(cli) => {
                if let Err(e) = handle_cli_command(session, editor, cli.command).await {
                    println!("Error: {e:#}");
                }
            }
            Err(e) => println!("Invalid command: {e}"),
        }
    }
    println!("Exiting");
    Ok(())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = Args::parse();
    let config = load_config(&args)?;
    debug!("configuration: {config:?}");

    let session = Session::new(config)?;
    let mut editor = DefaultEditor::new()?;
    match args.command {
        Some(command) => handle_cli_command(&session, &mut editor, command).await,
        None => repl(&session, &mut editor).await,
    }
}
