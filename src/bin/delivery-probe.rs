#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! CLI for measuring SMTP-to-IMAP delivery time

use clap::Parser;
use delivery_probe::{
    Credentials, DEFAULT_MAILBOX, DEFAULT_SUBJECT, Endpoint, ImapConfig, PollBudget,
    ProbeConfig, ProbeOutcome, ProbeStatus, Prober, SecurityMode, SmtpAuth, SmtpConfig,
    TrustPolicy, Verbosity,
};
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "delivery-probe")]
#[command(
    about = "Send a tagged message via SMTP and time its arrival in an IMAP mailbox"
)]
#[allow(clippy::struct_excessive_bools)]
struct Args {
    /// SMTP server host
    #[arg(long, env = "SMTP_SERVER")]
    smtp_server: String,

    /// SMTP server port
    #[arg(long, env = "SMTP_SERVER_PORT", default_value = "25")]
    smtp_server_port: u16,

    /// Hostname sent in EHLO/HELO
    #[arg(long, env = "HOSTNAME", default_value = "localhost")]
    smtp_hello_name: String,

    /// SMTP username; no authentication if omitted
    #[arg(long, env = "SMTP_USERNAME")]
    smtp_username: Option<String>,

    /// SMTP password, required with --smtp-username
    #[arg(long, env = "SMTP_PASSWORD", requires = "smtp_username")]
    smtp_password: Option<String>,

    /// Authenticate with CRAM-MD5 instead of PLAIN
    #[arg(long, env = "SMTP_CRAM", requires = "smtp_username")]
    smtp_cram: bool,

    /// Upgrade the SMTP session with STARTTLS
    #[arg(long, env = "SMTP_STARTTLS", conflicts_with = "ssl_on_connect")]
    smtp_starttls: bool,

    /// Use TLS from the start of the SMTP connection
    #[arg(long, env = "SSL_ON_CONNECT")]
    ssl_on_connect: bool,

    /// Envelope and header sender address
    #[arg(long, env = "SMTP_MAIL_FROM")]
    smtp_mail_from: String,

    /// Envelope and header recipient address
    #[arg(long, env = "SMTP_RCPT")]
    smtp_rcpt: String,

    /// Subject text appended to the timestamp tag
    #[arg(long, env = "SMTP_SUBJECT", default_value = DEFAULT_SUBJECT)]
    smtp_subject: String,

    /// IMAP server host
    #[arg(long, env = "IMAP_SERVER")]
    imap_server: String,

    /// IMAP server port
    #[arg(long, env = "IMAP_SERVER_PORT", default_value = "143")]
    imap_server_port: u16,

    /// IMAP username
    #[arg(long, env = "IMAP_USERNAME")]
    imap_username: String,

    /// IMAP password
    #[arg(long, env = "IMAP_PASSWORD")]
    imap_password: String,

    /// Use TLS from the start of the IMAP connection
    #[arg(long, env = "IMAP_TLS", conflicts_with = "imap_starttls")]
    imap_tls: bool,

    /// Upgrade the IMAP session with STARTTLS
    #[arg(long, env = "IMAP_STARTTLS")]
    imap_starttls: bool,

    /// Mailbox to search for the probe message
    #[arg(long, env = "IMAP_MAILBOX", default_value = DEFAULT_MAILBOX)]
    imap_mailbox: String,

    /// Maximum number of IMAP searches
    #[arg(long, env = "MAX_ATTEMPTS", default_value = "200")]
    max_attempts: u32,

    /// Pause between IMAP searches, in milliseconds
    #[arg(long, env = "POLL_INTERVAL_MS", default_value = "1000")]
    poll_interval_ms: u64,

    /// Verify server certificates against the system roots
    #[arg(long, env = "VERIFY_CERTS")]
    verify_certs: bool,

    /// Show submission time and per-attempt search results
    #[arg(long)]
    debug: bool,

    /// Print only the delivery time in seconds
    #[arg(long)]
    silent: bool,

    /// Output the outcome as JSON
    #[arg(long)]
    json: bool,
}

impl Args {
    fn into_config(self) -> ProbeConfig {
        let smtp_auth = match self.smtp_username {
            None => SmtpAuth::None,
            Some(username) => {
                let creds = Credentials::new(username, self.smtp_password.unwrap_or_default());
                if self.smtp_cram {
                    SmtpAuth::CramMd5(creds)
                } else {
                    SmtpAuth::Plain(creds)
                }
            }
        };

        let smtp_security = if self.ssl_on_connect {
            SecurityMode::Implicit
        } else if self.smtp_starttls {
            SecurityMode::StartTls
        } else {
            SecurityMode::None
        };

        let imap_security = if self.imap_tls {
            SecurityMode::Implicit
        } else if self.imap_starttls {
            SecurityMode::StartTls
        } else {
            SecurityMode::None
        };

        ProbeConfig {
            smtp: SmtpConfig {
                endpoint: Endpoint::new(self.smtp_server, self.smtp_server_port),
                hello_name: self.smtp_hello_name,
                auth: smtp_auth,
                security: smtp_security,
                mail_from: self.smtp_mail_from,
                rcpt_to: self.smtp_rcpt,
                subject: self.smtp_subject,
            },
            imap: ImapConfig {
                endpoint: Endpoint::new(self.imap_server, self.imap_server_port),
                credentials: Credentials::new(self.imap_username, self.imap_password),
                security: imap_security,
                mailbox: self.imap_mailbox,
            },
            trust: if self.verify_certs {
                TrustPolicy::SystemRoots
            } else {
                TrustPolicy::AcceptInvalidCerts
            },
            budget: PollBudget {
                max_attempts: self.max_attempts,
                interval: Duration::from_millis(self.poll_interval_ms),
            },
            verbosity: Verbosity {
                debug: self.debug,
                silent: self.silent,
            },
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let json = args.json;
    let prober = Prober::new(args.into_config())?;
    let verbosity = prober.config().verbosity;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let outcome = match prober.run(&cancel).await {
        Ok(outcome) => outcome,
        Err(e) => {
            eprintln!("Error: {e}");
            if e.stage().is_some_and(|stage| !stage.is_smtp()) {
                eprintln!("Note: the probe message was already submitted and may remain in the mailbox");
            }
            return Ok(ExitCode::FAILURE);
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        print!("{}", outcome.report(verbosity));
    }

    for warning in outcome.cleanup_warnings() {
        eprintln!("Warning: {}: {}", warning.stage, warning.message);
    }

    Ok(exit_code(&outcome))
}

fn exit_code(outcome: &ProbeOutcome) -> ExitCode {
    match outcome.status {
        ProbeStatus::Delivered => ExitCode::SUCCESS,
        ProbeStatus::TimedOut => ExitCode::from(2),
        ProbeStatus::Cancelled => ExitCode::from(130),
    }
}
