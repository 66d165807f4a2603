//! In-process server harness and a raw SMTP test client.

use smtpd_rs::config::{Config, ListenerConfig};
use smtpd_rs::queue::store::SqliteQueueStore;
use smtpd_rs::queue::QueueStore;
use smtpd_rs::security::auth::{AuthProvider, StaticAuthProvider};
use smtpd_rs::security::rate_limit::RateLimiter;
use smtpd_rs::smtp::SmtpServer;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

pub const TEST_USER: &str = "alice@test.example";
pub const TEST_PASSWORD: &str = "s3cret";

pub struct TestServer {
    pub addr: SocketAddr,
    pub store: Arc<SqliteQueueStore>,
    pub shutdown: CancellationToken,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Boot a server on an ephemeral port with an in-memory queue store.
pub async fn start_server(configure: impl FnOnce(&mut Config)) -> TestServer {
    let mut config = Config::default();
    config.server.hostname = "mx.test.example".to_string();
    config.server.listen = vec![ListenerConfig {
        addr: "127.0.0.1:0".to_string(),
        implicit_tls: false,
        submission: false,
    }];
    config.server.shutdown_grace_s = 1;
    configure(&mut config);
    let config = Arc::new(config);

    let store = Arc::new(
        SqliteQueueStore::connect("sqlite::memory:", config.queue.retry_policy())
            .await
            .expect("queue store"),
    );
    let limiter = Arc::new(RateLimiter::new(config.rate_limit.window()));
    let auth: Option<Arc<dyn AuthProvider>> = Some(Arc::new(
        StaticAuthProvider::new()
            .with_user(TEST_USER, TEST_PASSWORD)
            .expect("test user"),
    ));
    let shutdown = CancellationToken::new();

    let server = SmtpServer::bind(
        Arc::clone(&config),
        store.clone() as Arc<dyn QueueStore>,
        limiter,
        auth,
        None,
        shutdown.clone(),
    )
    .await
    .expect("bind server");
    let addr = server.local_addrs()[0];
    tokio::spawn(server.run());

    TestServer {
        addr,
        store,
        shutdown,
    }
}

pub struct SmtpTestClient {
    stream: BufReader<TcpStream>,
}

impl SmtpTestClient {
    /// Connect and read the greeting banner.
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let mut client = Self {
            stream: BufReader::new(stream),
        };
        let greeting = client.read_response().await;
        assert!(
            greeting.starts_with("220 "),
            "unexpected greeting: {greeting}"
        );
        client
    }

    /// Connect without asserting on the banner (admission tests).
    pub async fn connect_raw(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        Self {
            stream: BufReader::new(stream),
        }
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.get_mut().write_all(bytes).await.expect("write");
        self.stream.get_mut().flush().await.expect("flush");
    }

    /// Send one command line and read its (possibly multi-line) response.
    pub async fn command(&mut self, line: &str) -> String {
        self.send_raw(format!("{line}\r\n").as_bytes()).await;
        self.read_response().await
    }

    /// Read one reply; multi-line replies are joined with `\r\n`.
    pub async fn read_response(&mut self) -> String {
        let mut response = String::new();
        loop {
            let mut line = String::new();
            let n = self.stream.read_line(&mut line).await.expect("read");
            if n == 0 {
                break;
            }
            response.push_str(&line);
            // The last reply line has a space after the 3-digit code
            let bytes = line.as_bytes();
            if bytes.len() >= 4
                && bytes[..3].iter().all(|b| b.is_ascii_digit())
                && bytes[3] == b' '
            {
                break;
            }
        }
        response
    }

    /// After a 354 response: send the body followed by the terminator.
    pub async fn send_data(&mut self, body: &str) -> String {
        self.send_raw(body.as_bytes()).await;
        self.send_raw(b".\r\n").await;
        self.read_response().await
    }

    /// True once the server has closed the connection.
    pub async fn is_closed(&mut self) -> bool {
        let mut line = String::new();
        matches!(self.stream.read_line(&mut line).await, Ok(0))
    }
}
