//! TCP client for the PostgreSQL replication protocol.
//!
//! A connection opened with `replication=database` only accepts the simple
//! query protocol, replication commands (`CREATE_REPLICATION_SLOT`,
//! `START_REPLICATION`, ...) and `COPY`. This client covers exactly that
//! surface: startup and authentication (cleartext, MD5, SCRAM-SHA-256),
//! simple queries, binary copy-out and the CopyBoth streaming mode with
//! standby status updates.
//!
//! Frames are reassembled through an internal buffer, so a receive deadline
//! can fire mid-frame without corrupting the stream.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{TimeZone, Utc};
use md5::{Digest, Md5};
use postgres_protocol::message::{backend, frontend};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::lsn::Lsn;
use crate::protocol::scram::ScramSha256;

const APPLICATION_NAME: &str = "pg2search";

/// Connection parameters for both Postgres connections.
#[derive(Clone)]
pub struct PgConnectOptions {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: Option<String>,
}

impl std::fmt::Debug for PgConnectOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgConnectOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field(
                "password",
                &self.password.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

/// Rejects strings that can not be spliced into replication commands.
/// Postgres limits identifiers to 63 bytes.
pub fn validate_identifier(s: &str) -> Result<()> {
    let ok = !s.is_empty()
        && s.len() <= 63
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if ok {
        Ok(())
    } else {
        Err(Error::config(format!("invalid identifier: {:?}", s)))
    }
}

/// One backend frame: tag byte plus body.
struct Frame {
    tag: u8,
    body: Bytes,
}

/// A message received while streaming in CopyBoth mode.
#[derive(Debug)]
pub enum StreamMessage {
    /// Primary keepalive; `wal_end` is the location up to which WAL was sent.
    Keepalive {
        wal_end: Lsn,
        timestamp: i64,
        reply_requested: bool,
    },
    /// A logical message payload.
    XLogData {
        wal_start: Lsn,
        wal_end: Lsn,
        timestamp: i64,
        data: Bytes,
    },
    /// The server ended the copy stream.
    Closed,
}

/// The replication connection.
pub struct ReplicationClient {
    stream: TcpStream,
    rbuf: BytesMut,
    parameters: HashMap<String, String>,
}

impl ReplicationClient {
    /// Connects in replication mode and authenticates.
    pub async fn connect(opts: &PgConnectOptions) -> Result<Self> {
        info!(host = %opts.host, port = opts.port, user = %opts.user, "connecting replication client");
        let stream = TcpStream::connect((opts.host.as_str(), opts.port)).await?;
        stream.set_nodelay(true)?;

        let mut client = Self {
            stream,
            rbuf: BytesMut::with_capacity(16 * 1024),
            parameters: HashMap::new(),
        };
        client.startup(opts).await?;
        Ok(client)
    }

    /// Run-time parameter reported by the server (`server_version`, ...).
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    /// Major version of the upstream server, if it could be parsed.
    pub fn server_major_version(&self) -> Option<u32> {
        let version = self.parameter("server_version")?;
        let digits: String = version.chars().take_while(char::is_ascii_digit).collect();
        digits.parse().ok()
    }

    async fn startup(&mut self, opts: &PgConnectOptions) -> Result<()> {
        let mut buf = BytesMut::new();
        let params = [
            ("user", opts.user.as_str()),
            ("database", opts.database.as_str()),
            ("replication", "database"),
            ("application_name", APPLICATION_NAME),
            ("client_encoding", "UTF8"),
        ];
        frontend::startup_message(params, &mut buf)
            .map_err(|e| Error::protocol(format!("encode startup message: {e}")))?;
        self.stream.write_all(&buf).await?;

        loop {
            let frame = self.recv_frame().await?;
            match frame.tag {
                b'R' => self.authenticate(frame, opts).await?,
                b'S' => self.record_parameter(&frame.body)?,
                b'K' => {} // backend key data, cancellation is not used
                b'N' => {} // notice
                b'Z' => {
                    debug!("replication connection ready");
                    return Ok(());
                }
                b'E' => return Err(backend_error(&frame.body)),
                t => {
                    return Err(Error::protocol(format!(
                        "unexpected message during startup: {:?}",
                        t as char
                    )))
                }
            }
        }
    }

    async fn authenticate(&mut self, frame: Frame, opts: &PgConnectOptions) -> Result<()> {
        let msg = parse_backend(frame)?;
        match msg {
            backend::Message::AuthenticationOk => {
                debug!("authentication successful");
                Ok(())
            }
            backend::Message::AuthenticationCleartextPassword => {
                let pass = required_password(opts)?;
                let mut buf = BytesMut::new();
                frontend::password_message(pass.as_bytes(), &mut buf)
                    .map_err(|e| Error::protocol(format!("encode password: {e}")))?;
                self.stream.write_all(&buf).await?;
                Ok(())
            }
            backend::Message::AuthenticationMd5Password(body) => {
                let pass = required_password(opts)?;
                let hashed = md5_password(&opts.user, pass, &body.salt());
                let mut buf = BytesMut::new();
                frontend::password_message(hashed.as_bytes(), &mut buf)
                    .map_err(|e| Error::protocol(format!("encode password: {e}")))?;
                self.stream.write_all(&buf).await?;
                Ok(())
            }
            backend::Message::AuthenticationSasl(body) => {
                let pass = required_password(opts)?.to_string();
                self.authenticate_scram(body, &pass).await
            }
            backend::Message::ErrorResponse(_) => {
                Err(Error::protocol("authentication rejected by server"))
            }
            _ => Err(Error::protocol("unexpected authentication message")),
        }
    }

    async fn authenticate_scram(
        &mut self,
        body: backend::AuthenticationSaslBody,
        password: &str,
    ) -> Result<()> {
        use fallible_iterator::FallibleIterator;

        let mut supported = false;
        let mut mechanisms = body.mechanisms();
        while let Some(mech) = mechanisms
            .next()
            .map_err(|e| Error::protocol(format!("parse sasl mechanisms: {e}")))?
        {
            if mech == ScramSha256::MECHANISM {
                supported = true;
            }
        }
        if !supported {
            return Err(Error::protocol(
                "server offers no supported SASL mechanism (need SCRAM-SHA-256)",
            ));
        }

        let mut scram = ScramSha256::new(password);
        let mut buf = BytesMut::new();
        frontend::sasl_initial_response(
            ScramSha256::MECHANISM,
            scram.client_first_message().as_bytes(),
            &mut buf,
        )
        .map_err(|e| Error::protocol(format!("encode sasl response: {e}")))?;
        self.stream.write_all(&buf).await?;

        // server-first
        let frame = self.expect_auth_frame().await?;
        let server_first = match parse_backend(frame)? {
            backend::Message::AuthenticationSaslContinue(body) => {
                String::from_utf8_lossy(body.data()).into_owned()
            }
            backend::Message::ErrorResponse(_) => {
                return Err(Error::protocol("scram exchange rejected"))
            }
            _ => return Err(Error::protocol("expected SASL continue")),
        };

        let client_final = scram.client_final_message(&server_first)?;
        let mut buf = BytesMut::new();
        frontend::sasl_response(client_final.as_bytes(), &mut buf)
            .map_err(|e| Error::protocol(format!("encode sasl response: {e}")))?;
        self.stream.write_all(&buf).await?;

        // server-final
        let frame = self.expect_auth_frame().await?;
        match parse_backend(frame)? {
            backend::Message::AuthenticationSaslFinal(body) => {
                scram.verify_server_final(&String::from_utf8_lossy(body.data()))?;
            }
            backend::Message::ErrorResponse(_) => {
                return Err(Error::protocol("scram proof rejected"))
            }
            _ => return Err(Error::protocol("expected SASL final")),
        }

        // AuthenticationOk follows
        let frame = self.expect_auth_frame().await?;
        match parse_backend(frame)? {
            backend::Message::AuthenticationOk => {
                debug!("scram authentication successful");
                Ok(())
            }
            _ => Err(Error::protocol("expected AuthenticationOk")),
        }
    }

    async fn expect_auth_frame(&mut self) -> Result<Frame> {
        loop {
            let frame = self.recv_frame().await?;
            match frame.tag {
                b'R' => return Ok(frame),
                b'E' => return Err(backend_error(&frame.body)),
                b'N' => continue,
                t => {
                    return Err(Error::protocol(format!(
                        "unexpected message during auth: {:?}",
                        t as char
                    )))
                }
            }
        }
    }

    fn record_parameter(&mut self, body: &Bytes) -> Result<()> {
        let mut parts = body.split(|&b| b == 0);
        let name = parts.next().unwrap_or_default();
        let value = parts.next().unwrap_or_default();
        self.parameters.insert(
            String::from_utf8_lossy(name).into_owned(),
            String::from_utf8_lossy(value).into_owned(),
        );
        Ok(())
    }

    /// Executes a command, discarding any rows, and returns once the server
    /// is ready again.
    pub async fn simple_query(&mut self, query: &str) -> Result<()> {
        debug!(sql = query, "replication simple query");
        let mut buf = BytesMut::new();
        frontend::query(query, &mut buf)
            .map_err(|e| Error::protocol(format!("encode query: {e}")))?;
        self.stream.write_all(&buf).await?;

        let mut error: Option<Error> = None;
        loop {
            let frame = self.recv_frame().await?;
            match frame.tag {
                b'Z' => {
                    return match error {
                        Some(err) => Err(err),
                        None => Ok(()),
                    }
                }
                b'E' => error = Some(backend_error(&frame.body)),
                // row description, data rows, command complete, notices
                b'T' | b'D' | b'C' | b'N' | b'S' | b'I' => {}
                t => {
                    return Err(Error::protocol(format!(
                        "unexpected message for simple query: {:?}",
                        t as char
                    )))
                }
            }
        }
    }

    /// Creates a logical replication slot with `pgoutput`, exporting the
    /// creation snapshot into the current transaction. Must run inside a
    /// `REPEATABLE READ` transaction so the initial copy sees exactly the
    /// slot's start position.
    pub async fn create_replication_slot(&mut self, slot: &str) -> Result<()> {
        validate_identifier(slot)?;
        self.simple_query(&format!(
            "CREATE_REPLICATION_SLOT {} LOGICAL pgoutput USE_SNAPSHOT",
            slot
        ))
        .await
    }

    /// Drops the slot, waiting until a concurrent user disconnects.
    pub async fn drop_replication_slot(&mut self, slot: &str) -> Result<()> {
        validate_identifier(slot)?;
        self.simple_query(&format!("DROP_REPLICATION_SLOT {} WAIT", slot))
            .await
    }

    pub async fn begin_snapshot_tx(&mut self) -> Result<()> {
        self.simple_query("BEGIN TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .await
    }

    pub async fn commit_tx(&mut self) -> Result<()> {
        self.simple_query("COMMIT").await
    }

    /// Starts a binary copy-out and returns a handle yielding data frames.
    pub async fn copy_out(&mut self, query: &str) -> Result<CopyOut<'_>> {
        let mut buf = BytesMut::new();
        frontend::query(query, &mut buf)
            .map_err(|e| Error::protocol(format!("encode query: {e}")))?;
        self.stream.write_all(&buf).await?;

        loop {
            let frame = self.recv_frame().await?;
            match frame.tag {
                b'H' => return Ok(CopyOut { client: self }),
                b'N' | b'S' => {}
                b'E' => {
                    let err = backend_error(&frame.body);
                    self.drain_until_ready().await?;
                    return Err(err);
                }
                t => {
                    return Err(Error::protocol(format!(
                        "unexpected response to COPY: {:?}",
                        t as char
                    )))
                }
            }
        }
    }

    async fn drain_until_ready(&mut self) -> Result<()> {
        loop {
            if self.recv_frame().await?.tag == b'Z' {
                return Ok(());
            }
        }
    }

    /// Switches the connection into CopyBoth mode and starts streaming from
    /// the given position (zero resumes from the slot's confirmed point).
    pub async fn start_replication(
        &mut self,
        slot: &str,
        at: Lsn,
        publication: &str,
        binary: bool,
    ) -> Result<()> {
        validate_identifier(slot)?;
        validate_identifier(publication)?;

        let mut options = format!(
            "proto_version '1', publication_names '{}'",
            publication
        );
        if binary {
            // binary streaming needs PG14+
            options.push_str(", binary 'true'");
        }
        let query = format!(
            "START_REPLICATION SLOT {} LOGICAL {} ({})",
            slot, at, options
        );
        debug!(sql = %query, "starting replication");

        let mut buf = BytesMut::new();
        frontend::query(&query, &mut buf)
            .map_err(|e| Error::protocol(format!("encode query: {e}")))?;
        self.stream.write_all(&buf).await?;

        loop {
            let frame = self.recv_frame().await?;
            match frame.tag {
                b'W' => {
                    info!("entered CopyBoth mode");
                    return Ok(());
                }
                b'N' | b'S' => {}
                b'E' => return Err(backend_error(&frame.body)),
                t => {
                    return Err(Error::protocol(format!(
                        "unexpected response to START_REPLICATION: {:?}",
                        t as char
                    )))
                }
            }
        }
    }

    /// Receives the next streaming message; `Ok(None)` when the deadline
    /// fires first.
    pub async fn recv_stream(&mut self, deadline: Instant) -> Result<Option<StreamMessage>> {
        loop {
            let frame = match self.recv_frame_deadline(deadline).await? {
                Some(frame) => frame,
                None => return Ok(None),
            };
            match frame.tag {
                b'd' => {
                    let mut body = frame.body;
                    if !body.has_remaining() {
                        continue;
                    }
                    match body.get_u8() {
                        b'k' => {
                            if body.remaining() < 8 + 8 + 1 {
                                return Err(Error::protocol("short keepalive message"));
                            }
                            return Ok(Some(StreamMessage::Keepalive {
                                wal_end: Lsn(body.get_u64()),
                                timestamp: body.get_i64(),
                                reply_requested: body.get_u8() != 0,
                            }));
                        }
                        b'w' => {
                            if body.remaining() < 8 + 8 + 8 {
                                return Err(Error::protocol("short xlogdata message"));
                            }
                            return Ok(Some(StreamMessage::XLogData {
                                wal_start: Lsn(body.get_u64()),
                                wal_end: Lsn(body.get_u64()),
                                timestamp: body.get_i64(),
                                data: body,
                            }));
                        }
                        t => {
                            return Err(Error::protocol(format!(
                                "unknown copy payload tag {:?}",
                                t as char
                            )))
                        }
                    }
                }
                b'c' => return Ok(Some(StreamMessage::Closed)),
                b'E' => return Err(backend_error(&frame.body)),
                b'N' | b'S' => {}
                t => {
                    return Err(Error::protocol(format!(
                        "unexpected message while streaming: {:?}",
                        t as char
                    )))
                }
            }
        }
    }

    /// Sends a standby status update acknowledging `lsn`.
    pub async fn standby_status(&mut self, lsn: Lsn) -> Result<()> {
        let mut payload = BytesMut::with_capacity(34);
        payload.put_u8(b'r');
        payload.put_u64(lsn.0); // written
        payload.put_u64(lsn.0); // flushed
        payload.put_u64(lsn.0); // applied
        payload.put_i64(pg_now_micros());
        payload.put_u8(0); // no reply requested

        let mut frame = BytesMut::with_capacity(payload.len() + 5);
        frame.put_u8(b'd');
        frame.put_i32((payload.len() + 4) as i32);
        frame.put_slice(&payload);
        self.stream.write_all(&frame).await?;
        Ok(())
    }

    fn try_frame(&mut self) -> Result<Option<Frame>> {
        if self.rbuf.len() < 5 {
            return Ok(None);
        }
        let len = i32::from_be_bytes(self.rbuf[1..5].try_into().unwrap());
        if len < 4 {
            return Err(Error::protocol(format!("invalid frame length {len}")));
        }
        let total = 1 + len as usize;
        if self.rbuf.len() < total {
            self.rbuf.reserve(total - self.rbuf.len());
            return Ok(None);
        }
        let mut frame = self.rbuf.split_to(total);
        let tag = frame[0];
        frame.advance(5);
        Ok(Some(Frame {
            tag,
            body: frame.freeze(),
        }))
    }

    /// Reads one frame without a deadline, buffering partials across calls.
    async fn recv_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = self.try_frame()? {
                return Ok(frame);
            }
            let n = self.stream.read_buf(&mut self.rbuf).await?;
            if n == 0 {
                return Err(Error::protocol("connection closed by server"));
            }
        }
    }

    /// Reads one frame with a deadline; `Ok(None)` if the deadline fires
    /// first. A partially received frame survives in the buffer.
    async fn recv_frame_deadline(&mut self, deadline: Instant) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.try_frame()? {
                return Ok(Some(frame));
            }
            let read = self.stream.read_buf(&mut self.rbuf);
            let n = match tokio::time::timeout_at(deadline, read).await {
                Ok(n) => n?,
                Err(_) => return Ok(None),
            };
            if n == 0 {
                return Err(Error::protocol("connection closed by server"));
            }
        }
    }
}

/// Frames fetched by [`ReplicationClient::copy_out`].
pub struct CopyOut<'a> {
    client: &'a mut ReplicationClient,
}

impl CopyOut<'_> {
    /// Next chunk of copy data; `None` when the copy completed.
    pub async fn next(&mut self) -> Result<Option<Bytes>> {
        loop {
            let frame = self.client.recv_frame().await?;
            match frame.tag {
                b'd' => return Ok(Some(frame.body)),
                b'c' => {
                    self.client.drain_until_ready().await?;
                    return Ok(None);
                }
                b'E' => {
                    let err = backend_error(&frame.body);
                    self.client.drain_until_ready().await?;
                    return Err(err);
                }
                b'N' | b'S' => {}
                t => {
                    return Err(Error::protocol(format!(
                        "unexpected message during copy: {:?}",
                        t as char
                    )))
                }
            }
        }
    }
}

fn required_password<'a>(opts: &'a PgConnectOptions) -> Result<&'a str> {
    opts.password
        .as_deref()
        .ok_or_else(|| Error::config("password required but not provided"))
}

/// Reconstructs a full wire message so postgres-protocol can parse it.
fn parse_backend(frame: Frame) -> Result<backend::Message> {
    let mut raw = BytesMut::with_capacity(frame.body.len() + 5);
    raw.put_u8(frame.tag);
    raw.put_i32((frame.body.len() + 4) as i32);
    raw.put_slice(&frame.body);
    backend::Message::parse(&mut raw)
        .map_err(|e| Error::protocol(format!("parse backend message: {e}")))?
        .ok_or_else(|| Error::protocol("incomplete backend message"))
}

/// Extracts severity, SQLSTATE and message from an ErrorResponse body.
fn backend_error(body: &Bytes) -> Error {
    let mut severity = "ERROR".to_string();
    let mut code = String::new();
    let mut message = "unknown error".to_string();

    let mut buf = &body[..];
    while let Some((&field, rest)) = buf.split_first() {
        if field == 0 {
            break;
        }
        let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        let value = String::from_utf8_lossy(&rest[..end]).into_owned();
        match field {
            b'S' => severity = value,
            b'C' => code = value,
            b'M' => message = value,
            _ => {}
        }
        buf = &rest[(end + 1).min(rest.len())..];
    }

    if code.is_empty() {
        Error::protocol(format!("{severity}: {message}"))
    } else {
        Error::protocol(format!("{severity}: {message} (SQLSTATE {code})"))
    }
}

fn md5_password(user: &str, pass: &str, salt: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(pass);
    hasher.update(user);
    let first = hex::encode(hasher.finalize());

    let mut hasher = Md5::new();
    hasher.update(first);
    hasher.update(salt);
    format!("md5{}", hex::encode(hasher.finalize()))
}

/// Microseconds since the Postgres epoch (2000-01-01 UTC).
fn pg_now_micros() -> i64 {
    let epoch = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
    (Utc::now() - epoch).num_microseconds().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_password() {
        // PostgreSQL computes concat('md5', md5(md5(pass || user) || salt));
        // vector produced with psql's encryption of user=foo pass=bar.
        let hash = md5_password("foo", "bar", &[0x01, 0x02, 0x03, 0x04]);
        assert!(hash.starts_with("md5"));
        assert_eq!(hash.len(), 35);
        assert!(hash[3..].chars().all(|c| c.is_ascii_hexdigit()));
        // deterministic
        assert_eq!(hash, md5_password("foo", "bar", &[0x01, 0x02, 0x03, 0x04]));
        // salt-sensitive
        assert_ne!(hash, md5_password("foo", "bar", &[0x04, 0x03, 0x02, 0x01]));
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("pg2es").is_ok());
        assert!(validate_identifier("slot_01").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("bad-name").is_err());
        assert!(validate_identifier("no'quotes").is_err());
        assert!(validate_identifier(&"x".repeat(64)).is_err());
    }

    #[test]
    fn test_backend_error_fields() {
        let mut body = BytesMut::new();
        for (tag, value) in [(b'S', "ERROR"), (b'C', "42P01"), (b'M', "missing table")] {
            body.put_u8(tag);
            body.put_slice(value.as_bytes());
            body.put_u8(0);
        }
        body.put_u8(0);
        let err = backend_error(&body.freeze());
        let text = err.to_string();
        assert!(text.contains("missing table"));
        assert!(text.contains("42P01"));
    }

    #[test]
    fn test_pg_now_micros_is_positive() {
        assert!(pg_now_micros() > 0);
    }

    #[test]
    fn test_connect_options_debug_redacts_password() {
        let opts = PgConnectOptions {
            host: "localhost".into(),
            port: 5432,
            database: "app".into(),
            user: "postgres".into(),
            password: Some("super_secret".into()),
        };
        let debug = format!("{:?}", opts);
        assert!(!debug.contains("super_secret"));
        assert!(debug.contains("REDACTED"));
    }
}
