use std::{ net::SocketAddr, sync::Arc, task::{ Context, Poll } };

use anyhow::{ anyhow, Result };
use tokio::{
    io::{ AsyncRead, AsyncWrite, ReadBuf },
    net::{ TcpListener, TcpStream },
    sync::Semaphore,
    task::JoinHandle,
};
use tokio_rustls::{
    rustls::{ self, pki_types::{ CertificateDer, PrivateKeyDer } },
    TlsAcceptor,
};
use tracing::{ debug, info, warn };

use crate::gateway::Gateway;
use crate::protocol::engine;

/// Binds the plaintext and implicit-TLS listeners and spawns their accept
/// loops. Returns the listener tasks; any bind or certificate failure is
/// surfaced to the caller, which treats it as fatal.
pub async fn serve(gateway: Arc<Gateway>) -> Result<Vec<JoinHandle<()>>> {
    // Ensure rustls has an active crypto provider (required by rustls 0.23+).
    // Ignore errors if already installed.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let settings = gateway.settings().clone();
    let tls_acceptor = create_tls_acceptor(&settings.tls_cert, &settings.tls_key)?;

    let semaphore = Arc::new(Semaphore::new(settings.max_connections));
    let mut tasks = Vec::new();

    // Plaintext listener
    {
        let listener = TcpListener::bind(&settings.addr).await?;
        info!("SMTP listening on {}", settings.addr);

        let gateway = gateway.clone();
        let semaphore = semaphore.clone();
        tasks.push(
            tokio::spawn(async move {
                accept_loop(listener, gateway, semaphore, None).await;
            })
        );
    }

    // Implicit TLS listener
    {
        let listener = TcpListener::bind(&settings.tls_addr).await?;
        info!("SMTPS (implicit TLS) listening on {}", settings.tls_addr);

        tasks.push(
            tokio::spawn(async move {
                accept_loop(listener, gateway, semaphore, Some(tls_acceptor)).await;
            })
        );
    }

    Ok(tasks)
}

async fn accept_loop(
    listener: TcpListener,
    gateway: Arc<Gateway>,
    semaphore: Arc<Semaphore>,
    tls_acceptor: Option<TlsAcceptor>
) {
    loop {
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => {
                break;
            }
        };

        match listener.accept().await {
            Ok((stream, peer)) => {
                let gateway = gateway.clone();
                let tls_acceptor = tls_acceptor.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = handle_connection(stream, peer, gateway, tls_acceptor).await {
                        warn!("SMTP session ended with error: {}", e);
                    }
                });
            }
            Err(e) => {
                warn!("SMTP accept failed: {}", e);
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    gateway: Arc<Gateway>,
    tls_acceptor: Option<TlsAcceptor>
) -> Result<()> {
    debug!("Connection from {}", peer);

    let stream = match tls_acceptor {
        Some(acceptor) => AnyStream::Tls(acceptor.accept(stream).await?),
        None => AnyStream::Plain(stream),
    };

    let wire = gateway.settings().wire_config();
    engine::serve_connection(stream, gateway.as_ref(), &wire).await
}

enum AnyStream {
    Plain(TcpStream),
    Tls(tokio_rustls::server::TlsStream<TcpStream>),
}

impl Unpin for AnyStream {}

impl AsyncRead for AnyStream {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            AnyStream::Plain(s) => std::pin::Pin::new(s).poll_read(cx, buf),
            AnyStream::Tls(s) => std::pin::Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for AnyStream {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8]
    ) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            AnyStream::Plain(s) => std::pin::Pin::new(s).poll_write(cx, data),
            AnyStream::Tls(s) => std::pin::Pin::new(s).poll_write(cx, data),
        }
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut Context<'_>
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            AnyStream::Plain(s) => std::pin::Pin::new(s).poll_flush(cx),
            AnyStream::Tls(s) => std::pin::Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut Context<'_>
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            AnyStream::Plain(s) => std::pin::Pin::new(s).poll_shutdown(cx),
            AnyStream::Tls(s) => std::pin::Pin::new(s).poll_shutdown(cx),
        }
    }
}

fn create_tls_acceptor(cert_path: &str, key_path: &str) -> Result<TlsAcceptor> {
    use std::{ fs::File, io::BufReader as StdBufReader };

    let cert_file = File::open(cert_path)?;
    let mut cert_reader = StdBufReader::new(cert_file);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile
        ::certs(&mut cert_reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| anyhow!("invalid cert: {}", e))?;

    let key_file = File::open(key_path)?;
    let mut key_reader = StdBufReader::new(key_file);

    let mut key: Option<PrivateKeyDer<'static>> = None;
    for item in rustls_pemfile::read_all(&mut key_reader) {
        let item = item.map_err(|e| anyhow!("invalid key: {}", e))?;
        match item {
            rustls_pemfile::Item::Pkcs1Key(k) => {
                key = Some(PrivateKeyDer::Pkcs1(k));
                break;
            }
            rustls_pemfile::Item::Pkcs8Key(k) => {
                key = Some(PrivateKeyDer::Pkcs8(k));
                break;
            }
            rustls_pemfile::Item::Sec1Key(k) => {
                key = Some(PrivateKeyDer::Sec1(k));
                break;
            }
            _ => {}
        }
    }
    let key = key.ok_or_else(|| anyhow!("no private key found"))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| anyhow!("tls config: {}", e))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}
