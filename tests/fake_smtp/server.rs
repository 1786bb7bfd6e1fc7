//! In-process fake SMTP server
//!
//! ```text
//!   Client connects via TCP
//!       |
//!   [Implicit] TLS handshake
//!       |
//!   Server sends banner: "220 fake.smtp ESMTP ready"
//!       |
//!   EHLO (or HELO), [STARTTLS -> TLS -> EHLO], [AUTH]
//!       |
//!   MAIL FROM, RCPT TO, DATA ... "."
//!       |
//!   QUIT
//! ```

use super::session::{SessionEnd, run_session};
use crate::common::{TlsMode, tls_acceptor};
use crate::fake_imap::SharedMailbox;
use std::sync::{Arc, Mutex};
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

/// How the fake SMTP server behaves.
#[derive(Debug, Clone)]
pub struct SmtpOptions {
    pub tls: TlsMode,
    /// Answer STARTTLS with `454` even though it is advertised.
    pub reject_starttls: bool,
    /// Refuse EHLO with `502` so the client must fall back to HELO.
    pub refuse_ehlo: bool,
    /// Require AUTH with these credentials before MAIL.
    pub credentials: Option<(String, String)>,
    /// A verb (`MAIL`, `RCPT` or `DATA`) answered with a 5xx.
    pub reject_verb: Option<&'static str>,
    /// Folder delivered messages land in.
    pub folder: String,
    /// First IMAP search ordinal that sees a delivered message.
    pub visible_from: u32,
}

impl Default for SmtpOptions {
    fn default() -> Self {
        Self {
            tls: TlsMode::Plain,
            reject_starttls: false,
            refuse_ehlo: false,
            credentials: None,
            reject_verb: None,
            folder: "INBOX".to_string(),
            visible_from: 1,
        }
    }
}

/// What the server saw, for assertions.
#[derive(Debug, Default)]
pub struct SmtpLog {
    /// Command verbs in arrival order, e.g. `["EHLO", "MAIL", ...]`.
    pub commands: Vec<String>,
    /// Raw messages after un-dot-stuffing.
    pub messages: Vec<String>,
}

/// A fake SMTP server on localhost with an OS-assigned port.
pub struct FakeSmtpServer {
    port: u16,
    log: Arc<Mutex<SmtpLog>>,
    handle: tokio::task::JoinHandle<()>,
}

impl FakeSmtpServer {
    /// Start a server that delivers into `mailbox`.
    pub async fn start(options: SmtpOptions, mailbox: SharedMailbox) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind to ephemeral port");
        let port = listener.local_addr().unwrap().port();
        let acceptor = tls_acceptor();
        let log = Arc::new(Mutex::new(SmtpLog::default()));

        let shared_log = log.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _addr)) = listener.accept().await else {
                    break;
                };
                let ctx = Context {
                    options: options.clone(),
                    mailbox: mailbox.clone(),
                    log: shared_log.clone(),
                };
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    handle_connection(stream, acceptor, &ctx).await;
                });
            }
        });

        Self { port, log, handle }
    }

    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Command verbs received so far, across all connections.
    pub fn commands(&self) -> Vec<String> {
        self.log.lock().unwrap().commands.clone()
    }

    /// Messages accepted so far.
    pub fn messages(&self) -> Vec<String> {
        self.log.lock().unwrap().messages.clone()
    }
}

impl Drop for FakeSmtpServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Per-connection view of the server state.
pub struct Context {
    pub options: SmtpOptions,
    pub mailbox: SharedMailbox,
    pub log: Arc<Mutex<SmtpLog>>,
}

async fn handle_connection(stream: TcpStream, acceptor: TlsAcceptor, ctx: &Context) {
    if ctx.options.tls == TlsMode::Implicit {
        let Ok(tls_stream) = acceptor.accept(stream).await else {
            return;
        };
        run_session(BufReader::new(tls_stream), ctx, true, true).await;
        return;
    }

    let reader = BufReader::new(stream);
    if let SessionEnd::StartTls(reader) = run_session(reader, ctx, false, true).await {
        let Ok(tls_stream) = acceptor.accept(reader.into_inner()).await else {
            return;
        };
        run_session(BufReader::new(tls_stream), ctx, true, false).await;
    }
}
