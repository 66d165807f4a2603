//! The per-connection protocol engine.
//!
//! A session owns its transaction until commit, then moves it into the queue
//! store by value. Responses go out in the exact order commands arrive, which
//! together with the buffered codec gives PIPELINING for free.
//!
//! Four deadlines bound the session: greeting (accept to first command line),
//! command (reset after each response), data (inside DATA/BDAT) and a global
//! wall-clock budget. Expiry answers `421 4.4.2` (`451` inside DATA) and
//! closes the connection.

use crate::config::Config;
use crate::error::{Result, SmtpError, TimeoutKind};
use crate::queue::{NewQueueMessage, QueueStore};
use crate::security::auth::{self, AuthMechanism, AuthProvider};
use crate::security::rate_limit::{LimitKey, RateLimiter};
use crate::security::tls::TlsSettings;
use crate::smtp::codec::{DataLine, Reply, SmtpConnection, SmtpStream};
use crate::smtp::command::{Address, Command, MailParams, ReversePath};
use crate::smtp::extensions::{self, SessionCapabilities};
use crate::smtp::transaction::Transaction;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Protocol errors tolerated before the session is dropped.
const MAX_PROTOCOL_ERRORS: usize = 10;

/// Consecutive AUTH failures before 535-and-close.
const MAX_AUTH_FAILURES: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Greeting,
    Hello,
    Mail,
    Rcpt,
    Data,
    Quit,
}

#[derive(Debug, Default)]
struct SessionStats {
    commands: u64,
    committed: u64,
    body_bytes: u64,
}

/// Shared handles every session needs; all thread-safe by contract.
#[derive(Clone)]
pub struct SessionHandles {
    pub config: Arc<Config>,
    pub queue: Arc<dyn QueueStore>,
    pub limiter: Arc<RateLimiter>,
    pub auth: Option<Arc<dyn AuthProvider>>,
    pub tls: Option<Arc<TlsSettings>>,
}

pub struct Session {
    id: u64,
    remote: SocketAddr,
    /// Client-submission endpoint (authentication may be mandatory).
    submission: bool,
    handles: SessionHandles,
    state: State,
    hello_name: Option<String>,
    esmtp: bool,
    authenticated: Option<String>,
    auth_failures: u8,
    error_count: usize,
    transaction: Option<Transaction>,
    global_deadline: Instant,
    awaiting_first_command: bool,
    stats: SessionStats,
    shutdown: CancellationToken,
}

impl Session {
    pub fn new(
        id: u64,
        remote: SocketAddr,
        submission: bool,
        handles: SessionHandles,
        shutdown: CancellationToken,
    ) -> Self {
        let global_deadline = Instant::now() + handles.config.server.global_timeout();
        Self {
            id,
            remote,
            submission,
            handles,
            state: State::Greeting,
            hello_name: None,
            esmtp: false,
            authenticated: None,
            auth_failures: 0,
            error_count: 0,
            transaction: None,
            global_deadline,
            awaiting_first_command: true,
            stats: SessionStats::default(),
            shutdown,
        }
    }

    fn hostname(&self) -> &str {
        &self.handles.config.server.hostname
    }

    /// Drive the session to completion. The stream may already be TLS for
    /// implicit-TLS listeners.
    pub async fn run(mut self, stream: SmtpStream) {
        let mut conn = SmtpConnection::new(stream);
        debug!("session {} from {} started", self.id, self.remote);

        let banner = Reply::new(220, format!("{} ESMTP smtpd-rs", self.hostname()));
        if let Err(e) = conn.write_reply(&banner).await {
            debug!("session {}: failed to write banner: {}", self.id, e);
            return;
        }
        self.state = State::Hello;

        if let Err(e) = self.command_loop(&mut conn).await {
            // Fatal transport error; the mapped reply was already attempted.
            debug!("session {} closed on error: {}", self.id, e);
        }

        conn.shutdown().await.ok();
        info!(
            "session {} from {} finished: {} command(s), {} message(s), {} body byte(s)",
            self.id, self.remote, self.stats.commands, self.stats.committed, self.stats.body_bytes
        );
    }

    async fn command_loop(&mut self, conn: &mut SmtpConnection<SmtpStream>) -> Result<()> {
        loop {
            if self.state == State::Quit {
                return Ok(());
            }
            if self.error_count >= MAX_PROTOCOL_ERRORS {
                warn!("session {}: too many protocol errors", self.id);
                conn.write_reply(&Reply::new(421, "4.7.0 Too many errors, closing connection"))
                    .await
                    .ok();
                return Ok(());
            }

            let (limit, kind) = if self.awaiting_first_command {
                (
                    self.handles.config.server.greeting_timeout(),
                    TimeoutKind::Greeting,
                )
            } else {
                (
                    self.handles.config.server.command_timeout(),
                    TimeoutKind::Command,
                )
            };

            let read = tokio::select! {
                _ = self.shutdown.cancelled() => None,
                r = self.timed(kind, limit, conn.read_line()) => Some(r),
            };
            let Some(read) = read else {
                conn.write_reply(&Reply::new(421, "4.3.0 Service shutting down"))
                    .await
                    .ok();
                return Ok(());
            };

            let line = match read {
                Ok(line) => line,
                Err(SmtpError::UnexpectedEof) => {
                    debug!("session {}: client disconnected", self.id);
                    return Ok(());
                }
                Err(e) => return self.close_on_fatal(conn, e).await,
            };
            self.awaiting_first_command = false;
            self.stats.commands += 1;

            let text = String::from_utf8_lossy(&line).into_owned();
            debug!("session {} <- {}", self.id, text);

            match Command::parse(&text) {
                Ok(command) => self.dispatch(conn, command).await?,
                Err(e) => {
                    self.error_count += 1;
                    self.reply_error(conn, &e).await?;
                }
            }
        }
    }

    /// Bound a read by the given timer and the global deadline.
    async fn timed<T>(
        &self,
        kind: TimeoutKind,
        limit: Duration,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let now = Instant::now();
        let Some(global_left) = self.global_deadline.checked_duration_since(now).filter(|d| !d.is_zero())
        else {
            return Err(SmtpError::Timeout(TimeoutKind::Global));
        };

        let effective = limit.min(global_left);
        match timeout(effective, fut).await {
            Ok(result) => result,
            Err(_) if global_left <= limit => Err(SmtpError::Timeout(TimeoutKind::Global)),
            Err(_) => Err(SmtpError::Timeout(kind)),
        }
    }

    /// Map an error to its wire reply. This is the single point where
    /// protocol errors are logged.
    fn reply_for_error(err: &SmtpError) -> Option<Reply> {
        let reply = match err {
            SmtpError::Syntax(_) => Reply::new(500, "5.5.2 Syntax error, command unrecognized"),
            SmtpError::Parameter(_) => Reply::new(501, "5.5.4 Syntax error in parameters"),
            SmtpError::Sequence => Reply::new(503, "5.5.1 Bad sequence of commands"),
            SmtpError::SizeExceeded => {
                Reply::new(552, "5.3.4 Message size exceeds fixed maximum")
            }
            SmtpError::TooManyRecipients => Reply::new(452, "4.5.3 Too many recipients"),
            SmtpError::Policy(text) => Reply::new(550, format!("5.7.1 {text}")),
            SmtpError::RateLimited => {
                Reply::new(451, "4.7.1 Rate limit exceeded, try again later")
            }
            SmtpError::AuthenticationFailed => Reply::new(535, "5.7.8 Authentication failed"),
            SmtpError::LineTooLong => Reply::new(500, "5.5.2 Line too long"),
            SmtpError::Timeout(TimeoutKind::Data) => {
                Reply::new(451, "4.4.2 Timeout, closing connection")
            }
            SmtpError::Timeout(_) => Reply::new(421, "4.4.2 Timeout, closing connection"),
            SmtpError::QueueTemp(_) | SmtpError::Database(_) => {
                Reply::new(451, "4.3.0 Temporary failure, try again")
            }
            SmtpError::QueuePerm(_) => Reply::new(554, "5.6.0 Message rejected"),
            SmtpError::UnexpectedEof | SmtpError::Io(_) | SmtpError::Tls(_) => return None,
            SmtpError::Config(_) => Reply::new(451, "4.3.0 Temporary failure, try again"),
        };
        Some(reply)
    }

    async fn reply_error(
        &mut self,
        conn: &mut SmtpConnection<SmtpStream>,
        err: &SmtpError,
    ) -> Result<()> {
        warn!("session {}: {}", self.id, err);
        if let Some(reply) = Self::reply_for_error(err) {
            conn.write_reply(&reply).await?;
        }
        Ok(())
    }

    /// Best-effort reply for a fatal error, then end the session.
    async fn close_on_fatal(
        &mut self,
        conn: &mut SmtpConnection<SmtpStream>,
        err: SmtpError,
    ) -> Result<()> {
        error!("session {}: fatal: {}", self.id, err);
        if let Some(reply) = Self::reply_for_error(&err) {
            conn.write_reply(&reply).await.ok();
        }
        self.state = State::Quit;
        Ok(())
    }

    async fn dispatch(
        &mut self,
        conn: &mut SmtpConnection<SmtpStream>,
        command: Command,
    ) -> Result<()> {
        match command {
            Command::Helo(name) => self.handle_hello(conn, name, false).await,
            Command::Ehlo(name) => self.handle_hello(conn, name, true).await,
            Command::Mail { reverse_path, params } => {
                self.handle_mail(conn, reverse_path, params).await
            }
            Command::Rcpt { forward_path, .. } => self.handle_rcpt(conn, forward_path).await,
            Command::Data => self.handle_data(conn).await,
            Command::Bdat { size, last } => self.handle_bdat(conn, size, last).await,
            Command::Rset => {
                self.transaction = None;
                self.state = State::Hello;
                conn.write_reply(&Reply::new(250, "2.0.0 Ok")).await
            }
            Command::Noop => conn.write_reply(&Reply::new(250, "2.0.0 Ok")).await,
            Command::Quit => {
                self.state = State::Quit;
                conn.write_reply(&Reply::new(221, "2.0.0 Bye")).await
            }
            Command::Vrfy(_) => {
                // Never confirms or denies a mailbox
                conn.write_reply(&Reply::new(
                    252,
                    "2.0.0 Cannot VRFY user, but will accept message and attempt delivery",
                ))
                .await
            }
            Command::Expn(_) => {
                conn.write_reply(&Reply::new(252, "2.0.0 Cannot EXPN list")).await
            }
            Command::Help => {
                conn.write_reply(&Reply::new(
                    214,
                    "2.0.0 Commands: HELO EHLO MAIL RCPT DATA BDAT RSET NOOP QUIT VRFY STARTTLS AUTH",
                ))
                .await
            }
            Command::Starttls => self.handle_starttls(conn).await,
            Command::Auth { mechanism, initial } => {
                self.handle_auth(conn, mechanism, initial).await
            }
            Command::Unknown(keyword) => {
                self.error_count += 1;
                self.reply_error(conn, &SmtpError::Syntax(format!("unknown command {keyword}")))
                    .await
            }
        }
    }

    async fn handle_hello(
        &mut self,
        conn: &mut SmtpConnection<SmtpStream>,
        name: String,
        esmtp: bool,
    ) -> Result<()> {
        if !matches!(self.state, State::Hello | State::Mail | State::Rcpt) {
            self.error_count += 1;
            return self.reply_error(conn, &SmtpError::Sequence).await;
        }

        info!("session {}: {} from {}", self.id, if esmtp { "EHLO" } else { "HELO" }, name);
        self.hello_name = Some(name);
        self.esmtp = esmtp;
        self.transaction = None;
        self.state = State::Hello;

        if !esmtp {
            return conn
                .write_reply(&Reply::new(250, self.hostname().to_string()))
                .await;
        }

        let caps = SessionCapabilities {
            tls_available: self.handles.tls.is_some(),
            tls_active: conn.is_tls(),
            auth_available: self.handles.auth.is_some(),
            authenticated: self.authenticated.is_some(),
        };
        let mut lines = vec![self.hostname().to_string()];
        lines.extend(extensions::advertised(&self.handles.config.smtp, caps));
        conn.write_reply(&Reply::multi(250, lines)).await
    }

    async fn handle_mail(
        &mut self,
        conn: &mut SmtpConnection<SmtpStream>,
        reverse_path: ReversePath,
        params: MailParams,
    ) -> Result<()> {
        if self.state != State::Hello || self.hello_name.is_none() {
            self.error_count += 1;
            return self.reply_error(conn, &SmtpError::Sequence).await;
        }

        let config = Arc::clone(&self.handles.config);

        if self.submission
            && config.smtp.require_auth_on_submission
            && self.authenticated.is_none()
        {
            warn!("session {}: MAIL rejected, authentication required", self.id);
            return conn
                .write_reply(&Reply::new(530, "5.7.0 Authentication required"))
                .await;
        }

        if !params.smtputf8 && !reverse_path.is_ascii() {
            return conn
                .write_reply(&Reply::new(553, "5.6.7 Non-ASCII address requires SMTPUTF8"))
                .await;
        }

        if let Some(declared) = params.size {
            if declared > config.smtp.max_message_size {
                self.error_count += 1;
                return self.reply_error(conn, &SmtpError::SizeExceeded).await;
            }
        }

        // IP limits for anonymous submitters, the (typically higher) user
        // limit for authenticated ones.
        let (key, limit) = match &self.authenticated {
            Some(user) => (LimitKey::User(user.clone()), config.rate_limit.user_per_hour),
            None => (LimitKey::Ip(self.remote.ip()), config.rate_limit.ip_per_hour),
        };
        if !self.handles.limiter.check_and_increment(key, limit) {
            return self.reply_error(conn, &SmtpError::RateLimited).await;
        }

        debug!("session {}: MAIL FROM:<{}>", self.id, reverse_path);
        self.transaction = Some(Transaction::open(
            reverse_path,
            &params,
            config.smtp.spool_threshold,
        ));
        self.state = State::Mail;
        conn.write_reply(&Reply::new(250, "2.1.0 Ok")).await
    }

    async fn handle_rcpt(
        &mut self,
        conn: &mut SmtpConnection<SmtpStream>,
        forward_path: Address,
    ) -> Result<()> {
        if !matches!(self.state, State::Mail | State::Rcpt) {
            self.error_count += 1;
            return self.reply_error(conn, &SmtpError::Sequence).await;
        }
        let max_recipients = self.handles.config.smtp.max_recipients;
        let Some(tx) = self.transaction.as_mut() else {
            self.error_count += 1;
            return self.reply_error(conn, &SmtpError::Sequence).await;
        };

        if !tx.flags.smtputf8 && !forward_path.is_ascii() {
            return conn
                .write_reply(&Reply::new(553, "5.6.7 Non-ASCII address requires SMTPUTF8"))
                .await;
        }

        if tx.recipient_count() >= max_recipients {
            return self.reply_error(conn, &SmtpError::TooManyRecipients).await;
        }

        debug!("session {}: RCPT TO:<{}>", self.id, forward_path);
        tx.add_recipient(forward_path);
        self.state = State::Rcpt;
        conn.write_reply(&Reply::new(250, "2.1.5 Ok")).await
    }

    async fn handle_data(&mut self, conn: &mut SmtpConnection<SmtpStream>) -> Result<()> {
        let chunking = self
            .transaction
            .as_ref()
            .map(|tx| tx.flags.chunking)
            .unwrap_or(false);
        if self.state != State::Rcpt || chunking {
            self.error_count += 1;
            return self.reply_error(conn, &SmtpError::Sequence).await;
        }

        self.state = State::Data;
        conn.write_reply(&Reply::new(354, "Start mail input, end with <CRLF>.<CRLF>"))
            .await?;

        self.receive_data_lines(conn).await
    }

    async fn receive_data_lines(
        &mut self,
        conn: &mut SmtpConnection<SmtpStream>,
    ) -> Result<()> {
        let config = Arc::clone(&self.handles.config);
        let data_timeout = config.server.data_timeout();
        let limit = self
            .transaction
            .as_ref()
            .map(|tx| tx.effective_limit(config.smtp.max_message_size))
            .unwrap_or(config.smtp.max_message_size);
        let mut oversize = false;

        loop {
            let line = self
                .timed(TimeoutKind::Data, data_timeout, conn.read_data_line())
                .await;
            match line {
                Ok(DataLine::EndOfData) => break,
                Ok(DataLine::Line(content)) => {
                    if oversize {
                        // Keep consuming to the terminator so the stream
                        // stays in sync, but stop buffering.
                        continue;
                    }
                    let Some(tx) = self.transaction.as_mut() else {
                        return self.close_on_fatal(conn, SmtpError::Sequence).await;
                    };
                    tx.write_line(&content).await?;
                    if tx.body_len() > limit {
                        oversize = true;
                    }
                }
                Err(e) => return self.close_on_fatal(conn, e).await,
            }
        }

        if oversize {
            self.transaction = None;
            self.state = State::Hello;
            self.error_count += 1;
            return self.reply_error(conn, &SmtpError::SizeExceeded).await;
        }

        self.commit_transaction(conn).await
    }

    async fn handle_bdat(
        &mut self,
        conn: &mut SmtpConnection<SmtpStream>,
        size: u64,
        last: bool,
    ) -> Result<()> {
        // CHUNKING is negotiated via EHLO; HELO clients never saw it.
        let valid = self.esmtp
            && match self.state {
                State::Rcpt => true,
                State::Data => self
                    .transaction
                    .as_ref()
                    .map(|tx| tx.flags.chunking)
                    .unwrap_or(false),
                _ => false,
            };
        if !valid {
            // The chunk bytes are already in flight; consume them so the
            // command stream stays framed.
            if let Err(e) = self.discard_chunk(conn, size).await {
                return self.close_on_fatal(conn, e).await;
            }
            self.error_count += 1;
            return self.reply_error(conn, &SmtpError::Sequence).await;
        }

        let config = Arc::clone(&self.handles.config);
        let data_timeout = config.server.data_timeout();
        let limit = self
            .transaction
            .as_ref()
            .map(|tx| tx.effective_limit(config.smtp.max_message_size))
            .unwrap_or(config.smtp.max_message_size);

        if let Some(tx) = self.transaction.as_mut() {
            tx.flags.chunking = true;
        }
        self.state = State::Data;

        let mut remaining = size;
        let mut oversize = false;
        while remaining > 0 {
            let take = remaining.min(64 * 1024) as usize;
            let chunk = self
                .timed(TimeoutKind::Data, data_timeout, async {
                    conn.fill_chunk(take).await.map(|c| c.to_vec())
                })
                .await;
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => return self.close_on_fatal(conn, e).await,
            };
            conn.consume(chunk.len());
            remaining -= chunk.len() as u64;

            if oversize {
                continue;
            }
            let Some(tx) = self.transaction.as_mut() else {
                return self.close_on_fatal(conn, SmtpError::Sequence).await;
            };
            tx.write_chunk(&chunk).await?;
            if tx.body_len() > limit {
                oversize = true;
            }
        }

        if oversize {
            self.transaction = None;
            self.state = State::Hello;
            self.error_count += 1;
            return self.reply_error(conn, &SmtpError::SizeExceeded).await;
        }

        if last {
            self.commit_transaction(conn).await
        } else {
            conn.write_reply(&Reply::new(250, format!("2.0.0 {size} octets received")))
                .await
        }
    }

    async fn discard_chunk(
        &mut self,
        conn: &mut SmtpConnection<SmtpStream>,
        size: u64,
    ) -> Result<()> {
        let data_timeout = self.handles.config.server.data_timeout();
        let mut remaining = size;
        while remaining > 0 {
            let take = remaining.min(64 * 1024) as usize;
            let taken = self
                .timed(TimeoutKind::Data, data_timeout, async {
                    conn.fill_chunk(take).await.map(|c| c.len())
                })
                .await?;
            conn.consume(taken);
            remaining -= taken as u64;
        }
        Ok(())
    }

    async fn commit_transaction(
        &mut self,
        conn: &mut SmtpConnection<SmtpStream>,
    ) -> Result<()> {
        let Some(tx) = self.transaction.take() else {
            self.error_count += 1;
            return self.reply_error(conn, &SmtpError::Sequence).await;
        };
        self.state = State::Hello;

        let committed = match tx.commit().await {
            Ok(committed) => committed,
            Err(e) => return self.close_on_fatal(conn, e).await,
        };

        let message_id = committed.message_id.clone();
        let recipients = committed.forward_paths.len();
        let body_bytes = committed.body.len() as u64;

        let enqueue = self
            .handles
            .queue
            .enqueue(NewQueueMessage {
                message_id: committed.message_id,
                reverse_path: committed.reverse_path,
                forward_paths: committed.forward_paths,
                declared_size: committed.declared_size.map(|s| s as i64),
                priority: 0,
                body_ref: committed.body_ref,
                body: committed.body,
            })
            .await;

        match enqueue {
            Ok(ids) => {
                self.stats.committed += 1;
                self.stats.body_bytes += body_bytes;
                info!(
                    "session {}: queued message {} ({} bytes, {} recipient(s), {} row(s))",
                    self.id,
                    message_id,
                    body_bytes,
                    recipients,
                    ids.len()
                );
                conn.write_reply(&Reply::new(250, format!("2.0.0 Ok: queued as {message_id}")))
                    .await
            }
            Err(e) => {
                // The transaction is gone; the client may retry from MAIL.
                self.reply_error(conn, &SmtpError::QueueTemp(e.to_string())).await
            }
        }
    }

    async fn handle_starttls(&mut self, conn: &mut SmtpConnection<SmtpStream>) -> Result<()> {
        let Some(tls) = self.handles.tls.clone() else {
            self.error_count += 1;
            return conn
                .write_reply(&Reply::new(502, "5.5.1 STARTTLS not available"))
                .await;
        };
        if conn.is_tls() {
            self.error_count += 1;
            return self.reply_error(conn, &SmtpError::Sequence).await;
        }
        if self.state != State::Hello {
            self.error_count += 1;
            return self.reply_error(conn, &SmtpError::Sequence).await;
        }

        conn.write_reply(&Reply::new(220, "2.0.0 Ready to start TLS")).await?;

        let tcp = match conn.take_stream() {
            SmtpStream::Plain(tcp) => tcp,
            other => {
                conn.set_stream(other);
                return self
                    .close_on_fatal(conn, SmtpError::Tls("stream state mismatch".to_string()))
                    .await;
            }
        };

        debug!("session {}: starting TLS handshake", self.id);
        let tls_stream = match tls.acceptor().accept(tcp).await {
            Ok(stream) => stream,
            Err(e) => {
                // Handshake failed with the transport consumed; nothing more
                // to say to the client.
                error!("session {}: TLS handshake failed: {}", self.id, e);
                self.state = State::Quit;
                return Ok(());
            }
        };
        conn.set_stream(SmtpStream::Tls(tls_stream));

        // RFC 3207: forget everything learned on the plaintext channel.
        self.hello_name = None;
        self.esmtp = false;
        self.authenticated = None;
        self.auth_failures = 0;
        self.transaction = None;
        self.state = State::Hello;
        info!("session {}: TLS established", self.id);
        Ok(())
    }

    async fn handle_auth(
        &mut self,
        conn: &mut SmtpConnection<SmtpStream>,
        mechanism: String,
        initial: Option<String>,
    ) -> Result<()> {
        let Some(provider) = self.handles.auth.clone() else {
            self.error_count += 1;
            return conn
                .write_reply(&Reply::new(502, "5.5.1 AUTH not available"))
                .await;
        };
        if self.state != State::Hello
            || self.hello_name.is_none()
            || self.transaction.is_some()
            || self.authenticated.is_some()
        {
            self.error_count += 1;
            return self.reply_error(conn, &SmtpError::Sequence).await;
        }
        if self.handles.config.smtp.require_tls_for_auth && !conn.is_tls() {
            return conn
                .write_reply(&Reply::new(530, "5.7.0 Must issue STARTTLS first"))
                .await;
        }

        let Some(mechanism) = AuthMechanism::parse(&mechanism) else {
            self.error_count += 1;
            return conn
                .write_reply(&Reply::new(504, "5.5.4 Unrecognized authentication type"))
                .await;
        };

        let credentials = match mechanism {
            AuthMechanism::Plain => {
                let response = match initial {
                    Some(response) => response,
                    None => match self.auth_challenge(conn, "").await? {
                        Some(response) => response,
                        None => return Ok(()),
                    },
                };
                auth::decode_plain_auth(&response)
            }
            AuthMechanism::Login => {
                // Base64 "Username:" / "Password:" prompts
                let Some(username) = self.auth_challenge(conn, "VXNlcm5hbWU6").await? else {
                    return Ok(());
                };
                let Some(password) = self.auth_challenge(conn, "UGFzc3dvcmQ6").await? else {
                    return Ok(());
                };
                auth::decode_login_credential(&username)
                    .and_then(|u| auth::decode_login_credential(&password).map(|p| (u, p)))
            }
        };

        let (username, password) = match credentials {
            Ok(credentials) => credentials,
            Err(e) => {
                self.error_count += 1;
                return self.reply_error(conn, &e).await;
            }
        };

        match provider.verify(&username, &password).await {
            Ok(Some(user)) => {
                info!("session {}: authenticated as {}", self.id, user);
                self.authenticated = Some(user);
                self.auth_failures = 0;
                conn.write_reply(&Reply::new(235, "2.7.0 Authentication successful"))
                    .await
            }
            Ok(None) => {
                self.auth_failures += 1;
                warn!(
                    "session {}: authentication failure {}/{} for {}",
                    self.id, self.auth_failures, MAX_AUTH_FAILURES, username
                );
                conn.write_reply(&Reply::new(535, "5.7.8 Authentication failed"))
                    .await?;
                if self.auth_failures >= MAX_AUTH_FAILURES {
                    self.state = State::Quit;
                }
                Ok(())
            }
            Err(e) => {
                error!("session {}: auth backend failure: {}", self.id, e);
                conn.write_reply(&Reply::new(454, "4.7.0 Temporary authentication failure"))
                    .await
            }
        }
    }

    /// Issue a `334` challenge and read the client's response line.
    /// Returns `None` when the client cancelled with `*`.
    async fn auth_challenge(
        &mut self,
        conn: &mut SmtpConnection<SmtpStream>,
        prompt: &str,
    ) -> Result<Option<String>> {
        conn.write_reply(&Reply::new(334, prompt)).await?;
        let command_timeout = self.handles.config.server.command_timeout();
        let line = match self
            .timed(TimeoutKind::Command, command_timeout, conn.read_line())
            .await
        {
            Ok(line) => line,
            Err(e) if e.is_fatal() => {
                self.close_on_fatal(conn, e).await?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let text = String::from_utf8_lossy(&line).trim().to_string();
        if text == "*" {
            conn.write_reply(&Reply::new(501, "5.5.4 Authentication cancelled"))
                .await?;
            return Ok(None);
        }
        Ok(Some(text))
    }
}
