#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{ Arc, Mutex };

use async_trait::async_trait;
use tokio::io::{ AsyncBufReadExt, AsyncWriteExt, BufReader };
use tokio::net::{ TcpListener, TcpStream };

use mailgate::storage::AccountStore;
use mailgate::storage::models::tenant::state::{ StoreError, TenantAccount, Upstream };

/// In-memory account store. The mutex plays the role of the database's row
/// atomicity: commit_usage checks headroom and increments under one lock.
pub struct MemoryStore {
    inner: Mutex<Vec<StoredTenant>>,
}

struct StoredTenant {
    username: String,
    password: String,
    account: TenantAccount,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Vec::new()) }
    }

    pub fn add_tenant(&self, username: &str, password: &str, account: TenantAccount) {
        self.inner.lock().unwrap().push(StoredTenant {
            username: username.to_string(),
            password: password.to_string(),
            account,
        });
    }

    /// (used_hour, used_day, used_total) for a plan.
    pub fn usage(&self, plan_id: i64) -> Option<(i64, i64, i64)> {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.account.plan_id == plan_id)
            .map(|t| (t.account.used_hour, t.account.used_day, t.account.used_total))
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn lookup_tenant(
        &self,
        username: &str,
        password: &str
    ) -> Result<Option<TenantAccount>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(
            inner
                .iter()
                .find(
                    |t|
                        t.username == username &&
                        t.password == password &&
                        t.account.status == 1
                )
                .map(|t| t.account.clone())
        )
    }

    async fn commit_usage(&self, plan_id: i64, recipients: i64) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        for stored in inner.iter_mut() {
            if stored.account.plan_id != plan_id {
                continue;
            }
            let account = &mut stored.account;
            if
                account.used_total + recipients <= account.total_limit &&
                account.used_day + recipients <= account.day_limit &&
                account.used_hour + recipients <= account.hour_limit
            {
                account.used_total += recipients;
                account.used_day += recipients;
                account.used_hour += recipients;
                return Ok(true);
            }
            return Ok(false);
        }
        Ok(false)
    }
}

pub fn tenant(
    plan_id: i64,
    upstream_addr: SocketAddr,
    limits: (i64, i64, i64),
    used: (i64, i64, i64),
    domains: &[&str]
) -> TenantAccount {
    TenantAccount {
        plan_id,
        status: 1,
        hour_limit: limits.0,
        day_limit: limits.1,
        total_limit: limits.2,
        used_hour: used.0,
        used_day: used.1,
        used_total: used.2,
        domains: domains
            .iter()
            .map(|d| d.to_string())
            .collect(),
        upstream: Upstream {
            host: "127.0.0.1".to_string(),
            port: upstream_addr.port(),
            username: "relayuser".to_string(),
            password: "relaypass".to_string(),
        },
    }
}

/// Scripted upstream SMTP server on an ephemeral port. Accepts AUTH PLAIN,
/// records envelope commands and data lines, and can be told to reject
/// MAIL FROM.
pub struct FakeUpstream {
    pub addr: SocketAddr,
    pub transcript: Arc<Mutex<Vec<String>>>,
}

impl FakeUpstream {
    pub fn lines_starting_with(&self, prefix: &str) -> Vec<String> {
        self.transcript
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.starts_with(prefix))
            .cloned()
            .collect()
    }
}

pub async fn start_upstream(reject_mail: bool) -> FakeUpstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let transcript = Arc::new(Mutex::new(Vec::new()));

    let recorded = transcript.clone();
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => {
                    break;
                }
            };
            let recorded = recorded.clone();
            tokio::spawn(async move {
                let _ = serve_one(stream, recorded, reject_mail).await;
            });
        }
    });

    FakeUpstream { addr, transcript }
}

async fn serve_one(
    stream: TcpStream,
    transcript: Arc<Mutex<Vec<String>>>,
    reject_mail: bool
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    write_half.write_all(b"220 upstream ESMTP\r\n").await?;

    let mut in_data = false;
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            break;
        }
        let cmd = line.trim_end_matches(['\r', '\n']).to_string();

        if in_data {
            if cmd == "." {
                in_data = false;
                write_half.write_all(b"250 2.0.0 OK\r\n").await?;
            } else {
                transcript.lock().unwrap().push(format!("DATA>{}", cmd));
            }
            continue;
        }

        let upper = cmd.to_ascii_uppercase();
        if upper.starts_with("EHLO") {
            write_half.write_all(b"250-upstream\r\n250-AUTH PLAIN LOGIN\r\n250 OK\r\n").await?;
        } else if upper.starts_with("AUTH PLAIN") {
            transcript.lock().unwrap().push(cmd);
            write_half.write_all(b"235 2.7.0 Authentication successful\r\n").await?;
        } else if upper.starts_with("MAIL FROM") {
            transcript.lock().unwrap().push(cmd);
            if reject_mail {
                write_half.write_all(b"550 5.7.1 Sender refused\r\n").await?;
            } else {
                write_half.write_all(b"250 2.1.0 OK\r\n").await?;
            }
        } else if upper.starts_with("RCPT TO") {
            transcript.lock().unwrap().push(cmd);
            write_half.write_all(b"250 2.1.5 OK\r\n").await?;
        } else if upper == "DATA" {
            in_data = true;
            write_half.write_all(b"354 End data with <CRLF>.<CRLF>\r\n").await?;
        } else if upper == "QUIT" {
            write_half.write_all(b"221 2.0.0 Bye\r\n").await?;
            break;
        } else {
            write_half.write_all(b"250 2.0.0 OK\r\n").await?;
        }
    }
    Ok(())
}
