//! Minimal ESMTP command loop.
//!
//! Owns the wire syntax and nothing else: commands are decoded, bounds from
//! the configuration are applied, and every decision that matters is
//! delegated to the [`Session`] behind the capability contract. Works over
//! any byte stream so tests can drive it through an in-memory duplex.

use std::time::Duration;

use anyhow::{ anyhow, Result };
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use tokio::io::{ AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter };
use tokio::time::timeout;
use tracing::warn;

use super::{ Backend, Credentials, Mechanism, Session };

#[derive(Debug, Clone)]
pub struct WireConfig {
    pub hostname: String,
    pub max_message_bytes: usize,
    pub max_recipients: usize,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

enum AuthOutcome {
    Accepted,
    Rejected(String),
}

enum DataOutcome {
    Complete(Vec<u8>),
    TooLarge,
}

pub async fn serve_connection<S, B>(stream: S, backend: &B, cfg: &WireConfig) -> Result<()>
where S: AsyncRead + AsyncWrite + Unpin + Send, B: Backend {
    let mut session = backend.new_session();
    let mut authenticated = false;
    let mut sender_ok = false;
    let mut rcpt_count: usize = 0;

    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    let mut writer = BufWriter::new(write_half);

    // Greeting
    send_line(&mut writer, cfg, format!("220 {} ESMTP MailGate", cfg.hostname)).await?;

    let mut line = String::new();
    loop {
        line.clear();
        let n = read_cmd(&mut reader, cfg, &mut line).await?;
        if n == 0 {
            break;
        }

        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            continue;
        }

        let upper = trimmed.to_ascii_uppercase();

        if upper.starts_with("EHLO") {
            send_line(&mut writer, cfg, format!("250-{}", cfg.hostname)).await?;
            send_line(&mut writer, cfg, format!("250-SIZE {}", cfg.max_message_bytes)).await?;
            let mechanisms = session
                .mechanisms()
                .iter()
                .map(|m| m.as_str())
                .collect::<Vec<_>>()
                .join(" ");
            send_line(&mut writer, cfg, format!("250-AUTH {}", mechanisms)).await?;
            send_line(&mut writer, cfg, "250 OK".to_string()).await?;
            continue;
        }

        if upper.starts_with("HELO") {
            send_line(&mut writer, cfg, format!("250 {}", cfg.hostname)).await?;
            continue;
        }

        if upper == "NOOP" {
            send_line(&mut writer, cfg, "250 2.0.0 OK".to_string()).await?;
            continue;
        }

        if upper == "RSET" {
            session.reset().await;
            sender_ok = false;
            rcpt_count = 0;
            send_line(&mut writer, cfg, "250 2.0.0 OK".to_string()).await?;
            continue;
        }

        if upper == "QUIT" {
            send_line(&mut writer, cfg, "221 2.0.0 Bye".to_string()).await?;
            break;
        }

        if upper.starts_with("VRFY") {
            send_line(&mut writer, cfg, "252 2.1.5 Cannot VRFY user".to_string()).await?;
            continue;
        }

        if upper.starts_with("AUTH ") {
            match handle_auth(&mut session, &mut reader, &mut writer, cfg, trimmed).await? {
                AuthOutcome::Accepted => {
                    authenticated = true;
                    send_line(
                        &mut writer,
                        cfg,
                        "235 2.7.0 Authentication successful".to_string()
                    ).await?;
                }
                AuthOutcome::Rejected(reply) => {
                    send_line(&mut writer, cfg, reply).await?;
                }
            }
            continue;
        }

        if upper.starts_with("MAIL FROM:") {
            if !authenticated {
                // ask the backend whether unauthenticated use is allowed
                match backend.anonymous_session() {
                    Ok(anon) => {
                        session = anon;
                        authenticated = true;
                    }
                    Err(e) => {
                        send_line(&mut writer, cfg, e.reply()).await?;
                        continue;
                    }
                }
            }

            let (sender, declared_size) = match parse_mail_from(trimmed) {
                Ok(parsed) => parsed,
                Err(_) => {
                    send_line(&mut writer, cfg, "501 5.5.2 Invalid MAIL syntax".to_string()).await?;
                    continue;
                }
            };

            if let Some(size) = declared_size {
                if size > cfg.max_message_bytes {
                    send_line(
                        &mut writer,
                        cfg,
                        "552 5.3.4 Message size exceeds fixed maximum".to_string()
                    ).await?;
                    continue;
                }
            }

            match session.set_sender(&sender).await {
                Ok(()) => {
                    sender_ok = true;
                    rcpt_count = 0;
                    send_line(&mut writer, cfg, "250 2.1.0 Sender OK".to_string()).await?;
                }
                Err(e) => {
                    send_line(&mut writer, cfg, e.reply()).await?;
                }
            }
            continue;
        }

        if upper.starts_with("RCPT TO:") {
            if !sender_ok {
                send_line(&mut writer, cfg, "503 5.5.1 Need MAIL command".to_string()).await?;
                continue;
            }
            if rcpt_count >= cfg.max_recipients {
                send_line(&mut writer, cfg, "452 4.5.3 Too many recipients".to_string()).await?;
                continue;
            }

            let recipient = extract_email_address(&trimmed[8..]);
            match session.add_recipient(&recipient).await {
                Ok(()) => {
                    rcpt_count += 1;
                    send_line(&mut writer, cfg, "250 2.1.5 Recipient OK".to_string()).await?;
                }
                Err(e) => {
                    send_line(&mut writer, cfg, e.reply()).await?;
                }
            }
            continue;
        }

        if upper == "DATA" {
            if !sender_ok {
                send_line(&mut writer, cfg, "503 5.5.1 Need MAIL command".to_string()).await?;
                continue;
            }
            if rcpt_count == 0 {
                send_line(&mut writer, cfg, "503 5.5.1 Need RCPT command".to_string()).await?;
                continue;
            }

            send_line(&mut writer, cfg, "354 End data with <CRLF>.<CRLF>".to_string()).await?;

            match read_data(&mut reader, cfg).await? {
                DataOutcome::Complete(bytes) => {
                    match session.deliver(&bytes).await {
                        Ok(()) => {
                            send_line(&mut writer, cfg, "250 2.0.0 OK".to_string()).await?;
                        }
                        Err(e) => {
                            warn!("Delivery rejected: {}", e);
                            send_line(&mut writer, cfg, e.reply()).await?;
                        }
                    }
                }
                DataOutcome::TooLarge => {
                    send_line(
                        &mut writer,
                        cfg,
                        "552 5.3.4 Message size exceeds fixed maximum".to_string()
                    ).await?;
                }
            }

            // the transaction is finished either way
            session.reset().await;
            sender_ok = false;
            rcpt_count = 0;
            continue;
        }

        send_line(&mut writer, cfg, "500 5.5.2 Syntax error, command unrecognized".to_string()).await?;
    }

    session.close().await;
    Ok(())
}

async fn handle_auth<S, R, W>(
    session: &mut S,
    reader: &mut BufReader<R>,
    writer: &mut BufWriter<W>,
    cfg: &WireConfig,
    line: &str
) -> Result<AuthOutcome>
where S: Session, R: AsyncRead + Unpin, W: AsyncWrite + Unpin {
    // AUTH <mechanism> [initial-response]
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 2 {
        return Ok(AuthOutcome::Rejected("501 5.5.4 AUTH requires a mechanism".to_string()));
    }

    let wanted = parts[1].to_ascii_uppercase();
    let mechanism = match
        session
            .mechanisms()
            .iter()
            .copied()
            .find(|m| m.as_str() == wanted)
    {
        Some(m) => m,
        None => {
            return Ok(
                AuthOutcome::Rejected("504 5.5.4 Unrecognized authentication type".to_string())
            );
        }
    };

    let credentials = match mechanism {
        Mechanism::Plain => {
            let b64 = if parts.len() >= 3 {
                parts[2].to_string()
            } else {
                send_line(writer, cfg, "334 ".to_string()).await?;
                read_challenge(reader, cfg).await?
            };

            let decoded = match B64.decode(b64.as_bytes()) {
                Ok(d) => d,
                Err(_) => {
                    return Ok(
                        AuthOutcome::Rejected("501 5.5.2 Invalid base64 payload".to_string())
                    );
                }
            };
            let decoded = String::from_utf8_lossy(&decoded);

            // format: \0user\0pass (or authzid\0user\0pass)
            let fields: Vec<&str> = decoded.split('\u{0}').collect();
            if fields.len() < 3 {
                return Ok(AuthOutcome::Rejected("501 5.5.2 Invalid AUTH PLAIN payload".to_string()));
            }
            Credentials {
                username: fields[1].to_string(),
                password: fields[2].to_string(),
            }
        }
        Mechanism::Login => {
            // AUTH LOGIN [initial-response]; initial response is the username
            let username = if parts.len() >= 3 {
                match B64.decode(parts[2].as_bytes()) {
                    Ok(u) => String::from_utf8_lossy(&u).to_string(),
                    Err(_) => {
                        return Ok(
                            AuthOutcome::Rejected("501 5.5.2 Invalid base64 payload".to_string())
                        );
                    }
                }
            } else {
                send_line(writer, cfg, "334 VXNlcm5hbWU6".to_string()).await?; // "Username:"
                let resp = read_challenge(reader, cfg).await?;
                match B64.decode(resp.as_bytes()) {
                    Ok(u) => String::from_utf8_lossy(&u).to_string(),
                    Err(_) => {
                        return Ok(
                            AuthOutcome::Rejected("501 5.5.2 Invalid base64 payload".to_string())
                        );
                    }
                }
            };

            send_line(writer, cfg, "334 UGFzc3dvcmQ6".to_string()).await?; // "Password:"
            let resp = read_challenge(reader, cfg).await?;
            let password = match B64.decode(resp.as_bytes()) {
                Ok(p) => String::from_utf8_lossy(&p).to_string(),
                Err(_) => {
                    return Ok(
                        AuthOutcome::Rejected("501 5.5.2 Invalid base64 payload".to_string())
                    );
                }
            };

            Credentials { username, password }
        }
    };

    match session.authenticate(mechanism, credentials).await {
        Ok(()) => Ok(AuthOutcome::Accepted),
        Err(e) => {
            warn!("Authentication failed: {}", e);
            Ok(AuthOutcome::Rejected(e.reply()))
        }
    }
}

async fn read_data<R>(reader: &mut BufReader<R>, cfg: &WireConfig) -> Result<DataOutcome>
where R: AsyncRead + Unpin {
    let mut data: Vec<u8> = Vec::new();
    let mut oversize = false;

    let mut line = String::new();
    loop {
        line.clear();
        let n = read_cmd(reader, cfg, &mut line).await?;
        if n == 0 {
            return Err(anyhow!("connection closed during DATA"));
        }

        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed == "." {
            break;
        }

        // Dot unstuffing
        let content = if let Some(rest) = trimmed.strip_prefix("..") { rest } else { trimmed };

        if data.len() + content.len() + 2 > cfg.max_message_bytes {
            // drain the rest of the message so the reply lands after the
            // terminator instead of mid-stream
            oversize = true;
            continue;
        }
        if !oversize {
            data.extend_from_slice(content.as_bytes());
            data.extend_from_slice(b"\r\n");
        }
    }

    if oversize {
        Ok(DataOutcome::TooLarge)
    } else {
        Ok(DataOutcome::Complete(data))
    }
}

fn parse_mail_from(line: &str) -> Result<(String, Option<usize>)> {
    // MAIL FROM:<addr> [SIZE=n]
    let after = line
        .get(10..)
        .ok_or_else(|| anyhow!("MAIL FROM missing"))?
        .trim();

    let mut parts = after.split_whitespace();
    let addr_part = parts.next().unwrap_or("");
    if addr_part.is_empty() {
        return Err(anyhow!("MAIL FROM missing address"));
    }
    let sender = extract_email_address(addr_part);

    let mut declared_size: Option<usize> = None;
    for p in parts {
        let up = p.to_ascii_uppercase();
        if let Some(sz) = up.strip_prefix("SIZE=") {
            if let Ok(n) = sz.parse::<usize>() {
                declared_size = Some(n);
            }
        }
    }

    Ok((sender, declared_size))
}

fn extract_email_address(param: &str) -> String {
    let param = param.trim();
    if param.starts_with('<') && param.ends_with('>') && param.len() >= 2 {
        param[1..param.len() - 1].trim().to_string()
    } else {
        param.to_string()
    }
}

async fn read_cmd<R>(reader: &mut BufReader<R>, cfg: &WireConfig, buf: &mut String) -> Result<usize>
where R: AsyncRead + Unpin {
    match timeout(cfg.read_timeout, reader.read_line(buf)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(anyhow!("client read timed out")),
    }
}

async fn read_challenge<R>(reader: &mut BufReader<R>, cfg: &WireConfig) -> Result<String>
where R: AsyncRead + Unpin {
    let mut buf = String::new();
    let n = read_cmd(reader, cfg, &mut buf).await?;
    if n == 0 {
        return Err(anyhow!("connection closed during AUTH"));
    }
    Ok(buf.trim_end_matches(['\r', '\n']).to_string())
}

async fn send_line<W>(writer: &mut BufWriter<W>, cfg: &WireConfig, line: String) -> Result<()>
where W: AsyncWrite + Unpin {
    let io = async {
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\r\n").await?;
        writer.flush().await?;
        Ok::<_, std::io::Error>(())
    };
    match timeout(cfg.write_timeout, io).await {
        Ok(result) => {
            result?;
            Ok(())
        }
        Err(_) => Err(anyhow!("client write timed out")),
    }
}
