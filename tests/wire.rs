mod support;

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use tokio::io::{ duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf };

use mailgate::gateway::{ Gateway, GatewaySettings };
use mailgate::protocol::engine::serve_connection;

use support::{ start_upstream, tenant, MemoryStore };

fn settings(max_message_bytes: usize, max_recipients: usize) -> GatewaySettings {
    GatewaySettings {
        hostname: "gw.test".to_string(),
        addr: String::new(),
        tls_addr: String::new(),
        tls_cert: String::new(),
        tls_key: String::new(),
        max_connections: 8,
        max_message_bytes,
        max_recipients,
        read_timeout: Duration::from_secs(5),
        write_timeout: Duration::from_secs(5),
        single_recipient_only: false,
    }
}

struct Client {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

impl Client {
    async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\r\n").await.unwrap();
    }

    async fn expect(&mut self, prefix: &str) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).await.unwrap();
        let line = line.trim_end_matches(['\r', '\n']).to_string();
        assert!(
            line.starts_with(prefix),
            "expected reply starting with {:?}, got {:?}",
            prefix,
            line
        );
        line
    }
}

async fn connect(
    gateway: Arc<Gateway>
) -> (Client, tokio::task::JoinHandle<anyhow::Result<()>>) {
    let (client_side, server_side) = duplex(16 * 1024);

    let task = tokio::spawn(async move {
        let wire = gateway.settings().wire_config();
        serve_connection(server_side, gateway.as_ref(), &wire).await
    });

    let (read_half, write_half) = tokio::io::split(client_side);
    let mut client = Client {
        reader: BufReader::new(read_half),
        writer: write_half,
    };
    client.expect("220 gw.test").await;
    (client, task)
}

fn auth_plain(username: &str, password: &str) -> String {
    format!("AUTH PLAIN {}", B64.encode(format!("\u{0}{}\u{0}{}", username, password)))
}

#[tokio::test]
async fn test_full_wire_session() {
    let upstream = start_upstream(false).await;
    let store = Arc::new(MemoryStore::new());
    store.add_tenant(
        "acme",
        "pw",
        tenant(1, upstream.addr, (100, 100, 100), (0, 0, 0), &["example.com"])
    );
    let gateway = Arc::new(Gateway::new(settings(16 * 1024, 2), store.clone()));

    let (mut client, task) = connect(gateway).await;

    client.send("EHLO client.test").await;
    client.expect("250-gw.test").await;
    client.expect("250-SIZE 16384").await;
    client.expect("250-AUTH LOGIN PLAIN").await;
    client.expect("250 OK").await;

    // anonymous submission is refused
    client.send("MAIL FROM:<a@example.com>").await;
    client.expect("530 5.7.0").await;

    client.send(&auth_plain("acme", "pw")).await;
    client.expect("235 2.7.0").await;

    // unauthorized and malformed senders get distinct codes
    client.send("MAIL FROM:<a@elsewhere.net>").await;
    client.expect("550 5.7.1").await;
    client.send("MAIL FROM:<busted>").await;
    client.expect("501 5.1.7").await;

    client.send("MAIL FROM:<a@example.com>").await;
    client.expect("250 2.1.0").await;

    client.send("RCPT TO:<one@remote.net>").await;
    client.expect("250 2.1.5").await;
    client.send("RCPT TO:<two@remote.net>").await;
    client.expect("250 2.1.5").await;
    // recipient cap reached
    client.send("RCPT TO:<three@remote.net>").await;
    client.expect("452 4.5.3").await;

    client.send("DATA").await;
    client.expect("354").await;
    client.send("From: Alice <a@example.com>").await;
    client.send("Subject: over the wire").await;
    client.send("").await;
    client.send("..leading dot line").await;
    client.send("regular line").await;
    client.send(".").await;
    client.expect("250 2.0.0").await;

    client.send("QUIT").await;
    client.expect("221").await;

    task.await.unwrap().unwrap();

    assert_eq!(store.usage(1), Some((2, 2, 2)));
    assert_eq!(upstream.lines_starting_with("RCPT TO").len(), 2);
    // dot unstuffing happened before relay, stuffing again on the way out
    assert_eq!(upstream.lines_starting_with("DATA>..leading dot line").len(), 1);
    assert_eq!(upstream.lines_starting_with("DATA>regular line").len(), 1);
}

#[tokio::test]
async fn test_auth_login_challenge_flow() {
    let upstream = start_upstream(false).await;
    let store = Arc::new(MemoryStore::new());
    store.add_tenant(
        "acme",
        "pw",
        tenant(1, upstream.addr, (10, 10, 10), (0, 0, 0), &["example.com"])
    );
    let gateway = Arc::new(Gateway::new(settings(4096, 10), store));

    let (mut client, task) = connect(gateway).await;

    client.send("AUTH LOGIN").await;
    client.expect("334 VXNlcm5hbWU6").await;
    client.send(&B64.encode("acme")).await;
    client.expect("334 UGFzc3dvcmQ6").await;
    client.send(&B64.encode("pw")).await;
    client.expect("235 2.7.0").await;

    // a second AUTH on the same session is a sequencing error
    client.send(&auth_plain("acme", "pw")).await;
    client.expect("503 5.5.1").await;

    client.send("QUIT").await;
    client.expect("221").await;
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_wrong_password_rejected_on_the_wire() {
    let upstream = start_upstream(false).await;
    let store = Arc::new(MemoryStore::new());
    store.add_tenant(
        "acme",
        "pw",
        tenant(1, upstream.addr, (10, 10, 10), (0, 0, 0), &["example.com"])
    );
    let gateway = Arc::new(Gateway::new(settings(4096, 10), store));

    let (mut client, task) = connect(gateway).await;

    client.send(&auth_plain("acme", "nope")).await;
    client.expect("535 5.7.8").await;

    // still unauthenticated
    client.send("MAIL FROM:<a@example.com>").await;
    client.expect("530 5.7.0").await;

    client.send("QUIT").await;
    client.expect("221").await;
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_data_size_cap() {
    let upstream = start_upstream(false).await;
    let store = Arc::new(MemoryStore::new());
    store.add_tenant(
        "acme",
        "pw",
        tenant(1, upstream.addr, (10, 10, 10), (0, 0, 0), &["example.com"])
    );
    let gateway = Arc::new(Gateway::new(settings(64, 10), store.clone()));

    let (mut client, task) = connect(gateway).await;

    client.send(&auth_plain("acme", "pw")).await;
    client.expect("235").await;

    // SIZE declared over the cap is refused up front
    client.send("MAIL FROM:<a@example.com> SIZE=4096").await;
    client.expect("552 5.3.4").await;

    client.send("MAIL FROM:<a@example.com>").await;
    client.expect("250 2.1.0").await;
    client.send("RCPT TO:<one@remote.net>").await;
    client.expect("250 2.1.5").await;

    client.send("DATA").await;
    client.expect("354").await;
    for _ in 0..8 {
        client.send("0123456789012345678901234567890123456789").await;
    }
    client.send(".").await;
    client.expect("552 5.3.4").await;

    // nothing was relayed or charged
    assert_eq!(store.usage(1), Some((0, 0, 0)));
    assert!(upstream.lines_starting_with("MAIL FROM").is_empty());

    client.send("QUIT").await;
    client.expect("221").await;
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_commands_out_of_sequence() {
    let upstream = start_upstream(false).await;
    let store = Arc::new(MemoryStore::new());
    store.add_tenant(
        "acme",
        "pw",
        tenant(1, upstream.addr, (10, 10, 10), (0, 0, 0), &["example.com"])
    );
    let gateway = Arc::new(Gateway::new(settings(4096, 10), store));

    let (mut client, task) = connect(gateway).await;

    client.send("RCPT TO:<one@remote.net>").await;
    client.expect("503 5.5.1").await;
    client.send("DATA").await;
    client.expect("503 5.5.1").await;

    client.send(&auth_plain("acme", "pw")).await;
    client.expect("235").await;
    client.send("DATA").await;
    client.expect("503 5.5.1").await;

    client.send("NOOP").await;
    client.expect("250 2.0.0").await;
    client.send("BOGUS").await;
    client.expect("500 5.5.2").await;

    client.send("QUIT").await;
    client.expect("221").await;
    task.await.unwrap().unwrap();
}
