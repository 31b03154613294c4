#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! CLI for managing code mailboxes and polling them for verification codes

use clap::{Parser, Subcommand};
use mailcode_linker::batch::{MailboxResolution, PlannedJob, plan_run};
use mailcode_linker::jobs::{import_mailboxes, load_mailboxes};
use mailcode_linker::{
    CredentialRepository, DEFAULT_IMAP_PORT, JsonCredentialStore, MailAccount, MailCodeFetcher,
    RunSources, SecretCipher, Settings, seal_optional,
};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mailcode-cli")]
#[command(about = "Manage code mailboxes and fetch verification codes")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Manage stored mailboxes
    Mailboxes {
        #[command(subcommand)]
        action: MailboxAction,
    },

    /// Import `address:secret[:host[:port]]` lines into the store
    Import {
        /// Mailbox descriptor file
        file: PathBuf,
    },

    /// Poll a stored mailbox for a verification code
    Fetch {
        /// Mailbox address
        address: String,

        /// Seconds to wait for the code (default: MAILCODE_CODE_TIMEOUT_SECS)
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Show which mailbox each account of a batch would use
    Plan {
        /// Accounts file (`login:password` lines)
        accounts: PathBuf,

        /// Mailboxes file (`address:secret[:host[:port]]` lines)
        #[arg(long)]
        mailboxes: Option<PathBuf>,

        /// Mapping file (`login:address` lines)
        #[arg(long)]
        mapping: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum MailboxAction {
    /// List stored mailboxes
    List,

    /// Add a mailbox
    Add {
        /// Mailbox address
        address: String,

        /// App password or IMAP secret
        #[arg(long)]
        secret: String,

        /// IMAP server (default: MAILCODE_DEFAULT_HOST)
        #[arg(long)]
        host: Option<String>,

        /// IMAP port
        #[arg(long, default_value_t = DEFAULT_IMAP_PORT)]
        port: u16,

        /// Connect without TLS
        #[arg(long)]
        no_tls: bool,

        /// Display label
        #[arg(long)]
        label: Option<String>,
    },

    /// Change fields of a stored mailbox
    Update {
        /// Mailbox address
        address: String,

        /// New app password or IMAP secret
        #[arg(long)]
        secret: Option<String>,

        /// New IMAP server
        #[arg(long)]
        host: Option<String>,

        /// New IMAP port
        #[arg(long)]
        port: Option<u16>,

        /// Connect with TLS
        #[arg(long, conflicts_with = "no_tls")]
        tls: bool,

        /// Connect without TLS
        #[arg(long)]
        no_tls: bool,

        /// New display label (empty clears it)
        #[arg(long)]
        label: Option<String>,
    },

    /// Remove a mailbox
    Remove {
        /// Mailbox address
        address: String,
    },
}

/// A stored mailbox without its secret.
#[derive(Serialize)]
struct MailboxView<'a> {
    address: &'a str,
    label: &'a str,
    host: &'a str,
    port: u16,
    tls: bool,
}

impl<'a> From<&'a MailAccount> for MailboxView<'a> {
    fn from(account: &'a MailAccount) -> Self {
        Self {
            address: &account.address,
            label: account.display_name_or_address(),
            host: &account.host,
            port: account.port,
            tls: account.use_tls,
        }
    }
}

#[derive(Serialize)]
struct FetchedCode<'a> {
    address: &'a str,
    code: &'a str,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let settings = Settings::from_env()?;
    let cipher = settings.cipher()?;
    let mut store = JsonCredentialStore::load(&settings.store_path);

    match &args.command {
        Command::Mailboxes { action } => match action {
            MailboxAction::List => cmd_list(&store, &args)?,
            MailboxAction::Add {
                address,
                secret,
                host,
                port,
                no_tls,
                label,
            } => {
                let mut account = MailAccount::new(
                    address.clone(),
                    seal_optional(cipher.as_ref(), secret)?,
                );
                account.host = host.clone().unwrap_or_else(|| settings.default_host.clone());
                account.port = *port;
                account.use_tls = !no_tls;
                account.display_label.clone_from(label);
                store.add(account)?;
                println!("Added {address}");
            }
            MailboxAction::Update {
                address,
                secret,
                host,
                port,
                tls,
                no_tls,
                label,
            } => {
                let Some(mut account) = store.get(address).cloned() else {
                    anyhow::bail!("Mailbox {address} not found");
                };
                if let Some(secret) = secret {
                    account.secret = seal_optional(cipher.as_ref(), secret)?;
                }
                if let Some(host) = host {
                    account.host.clone_from(host);
                }
                if let Some(port) = port {
                    account.port = *port;
                }
                if *tls || *no_tls {
                    account.use_tls = *tls;
                }
                if let Some(label) = label {
                    account.display_label = Some(label.clone()).filter(|l| !l.trim().is_empty());
                }
                store.update(account)?;
                println!("Updated {address}");
            }
            MailboxAction::Remove { address } => {
                if store.remove(address)?.is_some() {
                    println!("Removed {address}");
                } else {
                    anyhow::bail!("Mailbox {address} not found");
                }
            }
        },
        Command::Import { file } => {
            let lines = load_mailboxes(file, &settings.default_host)?;
            let live = import_mailboxes(&lines, &mut store, cipher.as_ref())?;
            println!("Imported {} mailbox(es)", live.len());
        }
        Command::Fetch { address, timeout } => {
            let timeout = timeout.map_or(settings.code_timeout, Duration::from_secs);
            cmd_fetch(&store, &settings, cipher.as_ref(), &args, address, timeout).await?;
        }
        Command::Plan {
            accounts,
            mailboxes,
            mapping,
        } => {
            let sources = RunSources {
                accounts: accounts.clone(),
                mailboxes: mailboxes.clone(),
                mapping: mapping.clone(),
            };
            let plan = plan_run(&sources, &store, &settings.default_host)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&plan)?);
            } else {
                print_plan(&plan);
            }
        }
    }

    Ok(())
}

fn cmd_list(store: &JsonCredentialStore, args: &Args) -> anyhow::Result<()> {
    let views: Vec<MailboxView<'_>> = store.accounts().iter().map(MailboxView::from).collect();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&views)?);
        return Ok(());
    }

    if views.is_empty() {
        println!("No mailboxes stored.");
        return Ok(());
    }

    println!("{:<32} {:<24} {:<24} {:<6} TLS", "Address", "Label", "Server", "Port");
    println!("{}", "-".repeat(94));
    for view in &views {
        println!(
            "{:<32} {:<24} {:<24} {:<6} {}",
            truncate(view.address, 30),
            truncate(view.label, 22),
            truncate(view.host, 22),
            view.port,
            if view.tls { "yes" } else { "no" },
        );
    }
    println!("\n{} mailbox(es)", views.len());
    Ok(())
}

async fn cmd_fetch(
    store: &JsonCredentialStore,
    settings: &Settings,
    cipher: Option<&SecretCipher>,
    args: &Args,
    address: &str,
    timeout: Duration,
) -> anyhow::Result<()> {
    let account = store
        .get(address)
        .ok_or_else(|| anyhow::anyhow!("Mailbox {address} not found"))?;
    let credentials = account.credentials(cipher)?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let fetcher = MailCodeFetcher::new(settings.fetch.clone());
    let Some(code) = fetcher.fetch_code(&credentials, timeout, &cancel).await else {
        anyhow::bail!("No verification code received for {address}");
    };

    if args.json {
        let out = FetchedCode {
            address: &account.address,
            code: code.as_str(),
        };
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("{code}");
    }
    Ok(())
}

fn print_plan(plan: &[PlannedJob]) {
    if plan.is_empty() {
        println!("No accounts found.");
        return;
    }

    println!("{:<24} {:<32} Source", "Login", "Mailbox");
    println!("{}", "-".repeat(72));
    for job in plan {
        let source = match job.resolution {
            MailboxResolution::RunFile => "mailbox file",
            MailboxResolution::Store => "store",
            MailboxResolution::Unknown => "unknown mailbox",
            MailboxResolution::Unmapped => "no mapping",
        };
        println!(
            "{:<24} {:<32} {}",
            truncate(&job.login, 22),
            truncate(job.mailbox.as_deref().unwrap_or("-"), 30),
            source,
        );
    }
    println!("\n{} account(s)", plan.len());
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{truncated}...")
    }
}
