use anyhow::{ anyhow, Result };
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use chrono::Utc;
use thiserror::Error;
use tokio::io::{ AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter };
use tokio::net::TcpStream;
use tracing::debug;

use crate::storage::models::tenant::state::Upstream;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("could not reach upstream relay: {0}")]
    DialFailed(String),

    #[error("upstream TLS negotiation failed: {0}")]
    TlsNegotiationFailed(String),

    #[error("upstream rejected relay credentials: {0}")]
    UpstreamAuthFailed(String),

    #[error("upstream rejected envelope: {0}")]
    EnvelopeRejected(String),

    #[error("message body transfer failed: {0}")]
    BodyTransferFailed(String),
}

/// Outbound message assembled at delivery time from session state. Lives
/// only for the duration of one dispatch; nothing is persisted.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// Bare address used for the upstream MAIL FROM.
    pub envelope_from: String,
    /// From header value; may carry a display name.
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
}

/// Sends accepted messages to a tenant's upstream relay. One TCP connection
/// per message; any stage failure aborts the whole message. The recipient
/// policy is fixed at construction time.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    helo_name: String,
    single_recipient: bool,
}

impl Dispatcher {
    pub fn new(helo_name: String, single_recipient: bool) -> Self {
        Self { helo_name, single_recipient }
    }

    /// Truncates the recipient list to its first entry when the gateway is
    /// configured for single-recipient delivery. Applied once per message,
    /// before header composition, so the To header and the envelope always
    /// agree.
    pub fn apply_recipient_policy(&self, message: &mut OutboundMessage) {
        if self.single_recipient && message.to.len() > 1 {
            message.to.truncate(1);
        }
    }

    pub async fn send(
        &self,
        mut message: OutboundMessage,
        upstream: &Upstream
    ) -> Result<(), RelayError> {
        self.apply_recipient_policy(&mut message);

        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S %z").to_string();
        let id = message_id(&upstream.host);
        let payload = compose(&message, &id, &date);

        debug!(
            "Relaying message for {} to {} recipient(s) via {}:{}",
            message.envelope_from,
            message.to.len(),
            upstream.host,
            upstream.port
        );

        transmit(&self.helo_name, &payload, &message, upstream).await
    }
}

/// Generates a Message-ID of the form `<nanos.random@host>`. The random
/// component comes from the process RNG; uniqueness is probabilistic, not
/// guaranteed.
pub fn message_id(host: &str) -> String {
    let timestamp = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let random: u64 = rand::random();
    format!("<{}.{}@{}>", timestamp, random, host)
}

/// Renders the full outbound payload. The header block is deterministic:
/// same message, id and date always produce identical bytes, in a fixed
/// header order.
pub fn compose(message: &OutboundMessage, message_id: &str, date: &str) -> String {
    let mut out = String::with_capacity(message.body.len() + 256);

    out.push_str(&format!("From: {}\r\n", message.from));
    out.push_str(&format!("To: {}\r\n", message.to.join(",")));
    out.push_str(&format!("Subject: {}\r\n", message.subject));
    out.push_str("MIME-Version: 1.0\r\n");
    out.push_str("Content-Type: text/html; charset=\"UTF-8\"\r\n");
    out.push_str(&format!("Date: {}\r\n", date));
    out.push_str(&format!("Message-ID: {}\r\n", message_id));
    out.push_str("\r\n");
    out.push_str(&normalize_crlf(&message.body));

    out
}

async fn transmit(
    helo_name: &str,
    payload: &str,
    message: &OutboundMessage,
    upstream: &Upstream
) -> Result<(), RelayError> {
    let addr = format!("{}:{}", upstream.host, upstream.port);

    let tcp = TcpStream::connect(&addr).await
        .map_err(|e| RelayError::DialFailed(e.to_string()))?;
    let (r, w) = tokio::io::split(tcp);
    let mut plain_reader = BufReader::new(r);
    let mut plain_writer = BufWriter::new(w);

    read_expect(&mut plain_reader, 220).await
        .map_err(|e| RelayError::DialFailed(e.to_string()))?;
    let capabilities = ehlo(&mut plain_writer, &mut plain_reader, helo_name).await
        .map_err(|e| RelayError::DialFailed(e.to_string()))?;

    let mut reader: BufReader<Box<dyn AsyncRead + Unpin + Send>>;
    let mut writer: BufWriter<Box<dyn AsyncWrite + Unpin + Send>>;

    if capabilities.iter().any(|c| c == "STARTTLS") {
        // The upstream offers TLS: take it, without certificate
        // verification. Tenant-configured relays routinely present
        // self-signed or mismatched certificates.
        let tls_failed = |e: anyhow::Error| RelayError::TlsNegotiationFailed(e.to_string());

        write_line(&mut plain_writer, "STARTTLS".to_string()).await.map_err(tls_failed)?;
        read_expect(&mut plain_reader, 220).await.map_err(tls_failed)?;

        let cx = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .map_err(|e| RelayError::TlsNegotiationFailed(e.to_string()))?;
        let connector = tokio_native_tls::TlsConnector::from(cx);

        let stream = plain_reader.into_inner().unsplit(plain_writer.into_inner());
        let tls_stream = connector.connect(&upstream.host, stream).await
            .map_err(|e| RelayError::TlsNegotiationFailed(e.to_string()))?;

        let (r2, w2) = tokio::io::split(tls_stream);
        reader = BufReader::new(Box::new(r2));
        writer = BufWriter::new(Box::new(w2));

        ehlo(&mut writer, &mut reader, helo_name).await.map_err(tls_failed)?;
    } else {
        reader = BufReader::new(Box::new(plain_reader.into_inner()));
        writer = BufWriter::new(Box::new(plain_writer.into_inner()));
    }

    // AUTH PLAIN with the tenant's relay credentials
    let auth_payload = format!("\u{0}{}\u{0}{}", upstream.username, upstream.password);
    write_line(&mut writer, format!("AUTH PLAIN {}", B64.encode(auth_payload))).await
        .map_err(|e| RelayError::UpstreamAuthFailed(e.to_string()))?;
    read_expect(&mut reader, 235).await
        .map_err(|e| RelayError::UpstreamAuthFailed(e.to_string()))?;

    write_line(&mut writer, format!("MAIL FROM:<{}>", message.envelope_from)).await
        .map_err(|e| RelayError::EnvelopeRejected(e.to_string()))?;
    read_expect(&mut reader, 250).await
        .map_err(|e| RelayError::EnvelopeRejected(e.to_string()))?;

    for rcpt in &message.to {
        write_line(&mut writer, format!("RCPT TO:<{}>", rcpt)).await
            .map_err(|e| RelayError::EnvelopeRejected(e.to_string()))?;
        read_expect(&mut reader, 250).await
            .map_err(|e| RelayError::EnvelopeRejected(e.to_string()))?;
    }

    let body_failed = |e: anyhow::Error| RelayError::BodyTransferFailed(e.to_string());

    write_line(&mut writer, "DATA".to_string()).await.map_err(body_failed)?;
    read_expect(&mut reader, 354).await.map_err(body_failed)?;

    write_raw(&mut writer, dot_stuff(payload).as_bytes()).await.map_err(body_failed)?;
    write_line(&mut writer, ".".to_string()).await.map_err(body_failed)?;
    read_expect(&mut reader, 250).await.map_err(body_failed)?;

    // message is accepted at this point; QUIT is best effort
    let _ = write_line(&mut writer, "QUIT".to_string()).await;
    let _ = read_any(&mut reader).await;

    Ok(())
}

async fn ehlo<W, R>(
    writer: &mut BufWriter<W>,
    reader: &mut BufReader<R>,
    helo_name: &str
) -> Result<Vec<String>>
where W: AsyncWrite + Unpin, R: AsyncRead + Unpin {
    write_line(writer, format!("EHLO {}", helo_name)).await?;

    // Read multiline 250 responses, collecting advertised capabilities
    let mut capabilities = Vec::new();
    loop {
        let line = read_line(reader).await?;
        if !line.starts_with("250") {
            return Err(anyhow!("Unexpected EHLO response: {}", line));
        }
        if line.len() > 4 {
            capabilities.push(line[4..].trim().to_ascii_uppercase());
        }
        if !line.starts_with("250-") {
            break;
        }
    }
    Ok(capabilities)
}

fn normalize_crlf(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 4);
    for line in s.split('\n') {
        let l = line.trim_end_matches('\r');
        out.push_str(l);
        out.push_str("\r\n");
    }
    out
}

fn dot_stuff(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for line in s.split("\r\n") {
        if line.starts_with('.') {
            out.push('.');
        }
        out.push_str(line);
        out.push_str("\r\n");
    }
    out
}

async fn write_line<W>(writer: &mut BufWriter<W>, line: String) -> Result<()>
where W: AsyncWrite + Unpin {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;
    writer.flush().await?;
    Ok(())
}

async fn write_raw<W>(writer: &mut BufWriter<W>, bytes: &[u8]) -> Result<()>
where W: AsyncWrite + Unpin {
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_line<R>(reader: &mut BufReader<R>) -> Result<String>
where R: AsyncRead + Unpin {
    let mut buf = String::new();
    let n = reader.read_line(&mut buf).await?;
    if n == 0 {
        return Err(anyhow!("upstream closed the connection"));
    }
    Ok(buf.trim_end_matches("\r\n").to_string())
}

async fn read_expect<R>(reader: &mut BufReader<R>, code: u16) -> Result<String>
where R: AsyncRead + Unpin {
    let line = read_line(reader).await?;
    let ok = line.starts_with(&code.to_string());
    if !ok {
        return Err(anyhow!("upstream expected {} got: {}", code, line));
    }
    Ok(line)
}

async fn read_any<R>(reader: &mut BufReader<R>) -> Result<String>
where R: AsyncRead + Unpin {
    read_line(reader).await
}
