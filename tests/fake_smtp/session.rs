//! Per-connection SMTP state machine for the fake server.
//!
//! Replies follow RFC 5321: multi-line replies use `code-text` on
//! every line but the last, which uses `code text`.

use super::server::Context;
use crate::common::TlsMode;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use md5::Md5;
use std::fmt::Write as _;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// How a session ended.
pub enum SessionEnd<S> {
    /// QUIT, EOF or an I/O error.
    Closed,
    /// STARTTLS was accepted; the caller must run the TLS handshake on
    /// the returned stream and start a fresh session over it.
    StartTls(BufReader<S>),
}

const CHALLENGE: &str = "<1896.697170952@fake.smtp>";

/// Serve one SMTP session over `reader`.
///
/// `secure` is whether the stream is already TLS; `banner` whether to
/// send the `220` greeting (not repeated after STARTTLS).
pub async fn run_session<S: AsyncRead + AsyncWrite + Unpin>(
    mut reader: BufReader<S>,
    ctx: &Context,
    secure: bool,
    banner: bool,
) -> SessionEnd<S> {
    let options = &ctx.options;
    let mut authenticated = options.credentials.is_none();

    if banner && reply(&mut reader, "220 fake.smtp ESMTP ready").await.is_err() {
        return SessionEnd::Closed;
    }

    loop {
        let Some(line) = read_line(&mut reader).await else {
            return SessionEnd::Closed;
        };
        let (verb, rest) = line
            .split_once(' ')
            .map_or((line.as_str(), ""), |(v, r)| (v, r));
        let verb = verb.to_uppercase();
        ctx.log.lock().unwrap().commands.push(verb.clone());

        let rejected = options.reject_verb == Some(verb.as_str());
        let response = match verb.as_str() {
            "EHLO" if options.refuse_ehlo => "502 5.5.2 EHLO not supported".to_string(),
            "EHLO" => ehlo_reply(ctx, rest, secure),
            "HELO" => format!("250 fake.smtp greets {rest}"),
            "STARTTLS" => {
                if secure || options.tls != TlsMode::StartTls {
                    "502 5.5.1 STARTTLS not available".to_string()
                } else if options.reject_starttls {
                    "454 4.7.0 TLS not available due to temporary reason".to_string()
                } else {
                    if reply(&mut reader, "220 2.0.0 Ready to start TLS").await.is_err() {
                        return SessionEnd::Closed;
                    }
                    return SessionEnd::StartTls(reader);
                }
            }
            "AUTH" => {
                let Some(accepted) = authenticate(&mut reader, ctx, rest).await else {
                    return SessionEnd::Closed;
                };
                authenticated |= accepted;
                if accepted {
                    "235 2.7.0 Authentication successful".to_string()
                } else {
                    "535 5.7.8 Authentication credentials invalid".to_string()
                }
            }
            "MAIL" | "RCPT" | "DATA" if !authenticated => {
                "530 5.7.0 Authentication required".to_string()
            }
            "MAIL" if rejected => "550 5.7.1 Sender address rejected".to_string(),
            "MAIL" => "250 2.1.0 Sender OK".to_string(),
            "RCPT" if rejected => "550 5.1.1 Mailbox unavailable".to_string(),
            "RCPT" => "250 2.1.5 Recipient OK".to_string(),
            "DATA" if rejected => "554 5.3.0 Transaction failed".to_string(),
            "DATA" => {
                if reply(&mut reader, "354 End data with <CR><LF>.<CR><LF>")
                    .await
                    .is_err()
                {
                    return SessionEnd::Closed;
                }
                let Some(message) = read_message(&mut reader).await else {
                    return SessionEnd::Closed;
                };
                let uid = deliver(ctx, &message);
                format!("250 2.0.0 OK queued as {uid}")
            }
            "RSET" | "NOOP" => "250 2.0.0 OK".to_string(),
            "QUIT" => {
                let _ = reply(&mut reader, "221 2.0.0 Bye").await;
                return SessionEnd::Closed;
            }
            _ => "500 5.5.2 Command not recognized".to_string(),
        };

        if reply(&mut reader, &response).await.is_err() {
            return SessionEnd::Closed;
        }
    }
}

fn ehlo_reply(ctx: &Context, name: &str, secure: bool) -> String {
    let mut lines = vec![format!("fake.smtp greets {name}"), "8BITMIME".to_string()];
    if ctx.options.tls == TlsMode::StartTls && !secure {
        lines.push("STARTTLS".to_string());
    }
    if ctx.options.credentials.is_some() {
        lines.push("AUTH PLAIN CRAM-MD5".to_string());
    }
    lines.push("HELP".to_string());

    let last = lines.len() - 1;
    lines
        .iter()
        .enumerate()
        .map(|(i, l)| format!("250{}{l}", if i == last { ' ' } else { '-' }))
        .collect::<Vec<_>>()
        .join("\r\n")
}

/// Run an AUTH exchange. `None` means the connection dropped.
async fn authenticate<S: AsyncRead + AsyncWrite + Unpin>(
    reader: &mut BufReader<S>,
    ctx: &Context,
    args: &str,
) -> Option<bool> {
    let Some((user, pass)) = ctx.options.credentials.as_ref() else {
        return Some(false);
    };
    let (mechanism, initial) = args
        .split_once(' ')
        .map_or((args, None), |(m, i)| (m, Some(i.to_string())));

    match mechanism.to_uppercase().as_str() {
        "PLAIN" => {
            let response = match initial {
                Some(initial) => initial,
                None => {
                    reply(reader, "334 ").await.ok()?;
                    read_line(reader).await?
                }
            };
            let decoded = STANDARD.decode(response.trim()).unwrap_or_default();
            let expected = format!("\0{user}\0{pass}");
            Some(decoded == expected.as_bytes())
        }
        "CRAM-MD5" => {
            let challenge = STANDARD.encode(CHALLENGE);
            reply(reader, &format!("334 {challenge}")).await.ok()?;
            let response = read_line(reader).await?;
            let decoded = STANDARD.decode(response.trim()).unwrap_or_default();
            let decoded = String::from_utf8_lossy(&decoded).into_owned();
            let expected = format!("{user} {}", hmac_md5_hex(pass, CHALLENGE));
            Some(decoded == expected)
        }
        _ => Some(false),
    }
}

fn hmac_md5_hex(key: &str, data: &str) -> String {
    let mut mac = Hmac::<Md5>::new_from_slice(key.as_bytes()).unwrap();
    mac.update(data.as_bytes());
    let mut hex = String::new();
    for byte in mac.finalize().into_bytes() {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

/// Read DATA lines up to the lone dot, undoing dot-stuffing.
async fn read_message<S: AsyncRead + AsyncWrite + Unpin>(
    reader: &mut BufReader<S>,
) -> Option<String> {
    let mut message = String::new();
    loop {
        let line = read_line(reader).await?;
        if line == "." {
            return Some(message);
        }
        let line = line.strip_prefix('.').unwrap_or(&line);
        message.push_str(line);
        message.push_str("\r\n");
    }
}

fn deliver(ctx: &Context, message: &str) -> u32 {
    ctx.log.lock().unwrap().messages.push(message.to_string());
    ctx.mailbox
        .lock()
        .unwrap()
        .deliver(
            &ctx.options.folder,
            message.as_bytes(),
            ctx.options.visible_from,
        )
        .unwrap_or(0)
}

/// One line without its CRLF. `None` on EOF or error.
async fn read_line<S: AsyncRead + AsyncWrite + Unpin>(reader: &mut BufReader<S>) -> Option<String> {
    let mut line = String::new();
    match reader.read_line(&mut line).await {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line.trim_end_matches(['\r', '\n']).to_string()),
    }
}

async fn reply<S: AsyncRead + AsyncWrite + Unpin>(
    reader: &mut BufReader<S>,
    text: &str,
) -> std::io::Result<()> {
    let stream = reader.get_mut();
    stream.write_all(text.as_bytes()).await?;
    stream.write_all(b"\r\n").await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cram_md5_matches_rfc2195() {
        assert_eq!(
            hmac_md5_hex("tanstaaftanstaaf", "<1896.697170952@postoffice.reston.mci.net>"),
            "b913a602c7eda7a495b4e6e7334d3890"
        );
    }
}
