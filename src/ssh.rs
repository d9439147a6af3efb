use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ssh2::{ErrorCode, Session};

use crate::error::{ConnectError, ConnectErrorKind, CredentialError, ExecError};
use crate::executor::{CommandOutput, NodeLocks, RemoteExecutor};
use crate::models::{Credential, Node};

// libssh2 error codes we classify on.
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;
const LIBSSH2_ERROR_AUTHENTICATION_FAILED: i32 = -18;
const LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED: i32 = -19;

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const DISCONNECT_TIMEOUT_MS: u32 = 2_000;

/// An authenticated session. Disconnects when dropped, including on unwind.
pub struct SshSession {
    session: Session,
    // Second handle on the session's socket, for shutting it down from another thread.
    socket: TcpStream,
    address: String,
}

impl SshSession {
    /// Blocking connect + handshake + auth.
    pub fn connect(node: &Node, connect_timeout: Duration) -> Result<Self, ExecError> {
        let credential = node.credential.as_ref().ok_or(CredentialError::Missing)?;
        let address = node.address();

        let addr = address
            .to_socket_addrs()
            .map_err(|e| ConnectError::new(ConnectErrorKind::Unreachable, &address, e.to_string()))?
            .next()
            .ok_or_else(|| {
                ConnectError::new(ConnectErrorKind::Unreachable, &address, "address did not resolve")
            })?;

        let tcp = TcpStream::connect_timeout(&addr, connect_timeout)
            .map_err(|e| ConnectError::new(classify_io(&e), &address, e.to_string()))?;

        let socket = tcp.try_clone().map_err(|e| ExecError::Channel(e.to_string()))?;
        let mut session = Session::new().map_err(|e| ExecError::Channel(e.to_string()))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(millis(connect_timeout));
        session
            .handshake()
            .map_err(|e| ConnectError::new(classify_ssh(&e), &address, e.to_string()))?;

        let auth = match credential {
            Credential::Password(password) => session.userauth_password(&node.username, password),
            Credential::PrivateKey(key) => {
                session.userauth_pubkey_memory(&node.username, None, key, None)
            }
        };
        if let Err(e) = auth {
            return Err(ConnectError::new(ConnectErrorKind::AuthFailed, &address, e.to_string()).into());
        }
        if !session.authenticated() {
            return Err(ConnectError::new(
                ConnectErrorKind::AuthFailed,
                &address,
                "server rejected credentials",
            )
            .into());
        }

        Ok(Self {
            session,
            socket,
            address,
        })
    }

    /// Run a command line and wait for it to exit.
    pub fn run(&self, command: &str, timeout: Duration) -> Result<CommandOutput, ExecError> {
        self.exec(command, None, timeout)
    }

    /// Feed a whole script to `bash -s` on stdin and wait for it to exit.
    pub fn run_script(&self, script: &str, timeout: Duration) -> Result<CommandOutput, ExecError> {
        self.exec("bash -s", Some(script), timeout)
    }

    /// Shut the socket down. Any call blocked on this session returns with an error.
    pub fn interrupt_handle(&self) -> io::Result<impl FnOnce() + Send + 'static> {
        let socket = self.socket.try_clone()?;
        Ok(move || {
            if let Err(e) = socket.shutdown(Shutdown::Both) {
                tracing::debug!("socket shutdown failed: {}", e);
            }
        })
    }

    /// `timeout` bounds the whole call, not each read.
    fn exec(
        &self,
        command: &str,
        stdin: Option<&str>,
        timeout: Duration,
    ) -> Result<CommandOutput, ExecError> {
        let deadline = Instant::now() + timeout;
        let map_err = |e: ssh2::Error| channel_error(e, timeout);

        self.session.set_blocking(true);
        self.session.set_timeout(millis(timeout));
        let mut channel = self.session.channel_session().map_err(map_err)?;
        channel.exec(command).map_err(map_err)?;

        if let Some(text) = stdin {
            self.session.set_timeout(millis(remaining(deadline, timeout)?));
            channel
                .write_all(text.as_bytes())
                .map_err(|e| io_error(e, timeout))?;
            channel.send_eof().map_err(map_err)?;
        }

        // Drain both streams together so neither can fill the channel window.
        self.session.set_blocking(false);
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut buf = [0u8; 16 * 1024];
        loop {
            let mut progressed = read_some(&mut channel, &mut buf, &mut stdout, timeout)?;
            progressed |= read_some(&mut channel.stderr(), &mut buf, &mut stderr, timeout)?;
            if !progressed && channel.eof() {
                break;
            }
            if Instant::now() >= deadline {
                tracing::warn!("{} timed out on {}", first_line(command), self.address);
                return Err(ExecError::Timeout { after: timeout });
            }
            if !progressed {
                std::thread::sleep(POLL_INTERVAL);
            }
        }

        self.session.set_blocking(true);
        self.session.set_timeout(millis(remaining(deadline, timeout)?));
        channel.wait_close().map_err(map_err)?;
        let exit_code = channel.exit_status().map_err(map_err)?;

        tracing::debug!("{} exited {} on {}", first_line(command), exit_code, self.address);
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        })
    }
}

/// One non-blocking read into `out`. Returns whether any bytes arrived.
fn read_some<R: Read>(
    reader: &mut R,
    buf: &mut [u8],
    out: &mut Vec<u8>,
    timeout: Duration,
) -> Result<bool, ExecError> {
    match reader.read(buf) {
        Ok(0) => Ok(false),
        Ok(n) => {
            out.extend_from_slice(&buf[..n]);
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
        Err(e) => Err(io_error(e, timeout)),
    }
}

fn remaining(deadline: Instant, timeout: Duration) -> Result<Duration, ExecError> {
    match deadline.checked_duration_since(Instant::now()) {
        Some(left) if !left.is_zero() => Ok(left),
        _ => Err(ExecError::Timeout { after: timeout }),
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        self.session.set_blocking(true);
        self.session.set_timeout(DISCONNECT_TIMEOUT_MS);
        if let Err(e) = self.session.disconnect(None, "session closed", None) {
            tracing::debug!("disconnect from {} failed: {}", self.address, e);
        }
    }
}

/// [`RemoteExecutor`] over ssh2. Each call opens a fresh session on a blocking thread;
/// calls against the same node wait for each other.
pub struct SshExecutor {
    connect_timeout: Duration,
    locks: NodeLocks,
}

impl SshExecutor {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            locks: NodeLocks::new(),
        }
    }

    async fn with_session<F>(
        &self,
        node: &Node,
        deadline: Duration,
        work: F,
    ) -> Result<CommandOutput, ExecError>
    where
        F: FnOnce(&SshSession) -> Result<CommandOutput, ExecError> + Send + 'static,
    {
        // Checked up front so no lock is taken and no thread is spawned.
        if node.credential.is_none() {
            return Err(CredentialError::Missing.into());
        }

        let id = node.id.clone();
        let node = node.clone();
        let connect_timeout = self.connect_timeout;
        // The session bounds itself; the outer limit only catches a wedged connect.
        let limit = deadline + connect_timeout * 2;
        self.locks
            .run_blocking(&id, limit, move |cancel| {
                let session = SshSession::connect(&node, connect_timeout)?;
                match session.interrupt_handle() {
                    Ok(interrupt) => cancel.on_cancel(interrupt),
                    Err(e) => tracing::debug!("no interrupt handle for {}: {}", node.name, e),
                }
                work(&session)
            })
            .await
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn check(&self, node: &Node) -> Result<(), ExecError> {
        let timeout = self.connect_timeout;
        self.with_session(node, timeout, move |session| session.run("true", timeout))
            .await
            .map(|_| ())
    }

    async fn run(&self, node: &Node, command: &str, timeout: Duration)
        -> Result<CommandOutput, ExecError> {
        let command = command.to_string();
        self.with_session(node, timeout, move |session| session.run(&command, timeout))
            .await
    }

    async fn run_script(&self, node: &Node, script: &str, timeout: Duration)
        -> Result<CommandOutput, ExecError> {
        let script = script.to_string();
        self.with_session(node, timeout, move |session| session.run_script(&script, timeout))
            .await
    }
}

fn millis(d: Duration) -> u32 {
    u32::try_from(d.as_millis()).unwrap_or(u32::MAX)
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or("")
}

fn classify_io(e: &io::Error) -> ConnectErrorKind {
    match e.kind() {
        io::ErrorKind::ConnectionRefused => ConnectErrorKind::Refused,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ConnectErrorKind::Timeout,
        _ => ConnectErrorKind::Unreachable,
    }
}

fn classify_ssh(e: &ssh2::Error) -> ConnectErrorKind {
    match e.code() {
        ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT) => ConnectErrorKind::Timeout,
        ErrorCode::Session(LIBSSH2_ERROR_AUTHENTICATION_FAILED)
        | ErrorCode::Session(LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED) => ConnectErrorKind::AuthFailed,
        _ => ConnectErrorKind::Unreachable,
    }
}

fn channel_error(e: ssh2::Error, timeout: Duration) -> ExecError {
    match e.code() {
        ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT) => ExecError::Timeout { after: timeout },
        _ => ExecError::Channel(e.to_string()),
    }
}

fn io_error(e: io::Error, timeout: Duration) -> ExecError {
    match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ExecError::Timeout { after: timeout },
        _ => ExecError::Channel(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NodeRole, NodeStatus};
    use chrono::Utc;
    use std::net::TcpListener;

    fn node(port: u16, credential: Option<Credential>) -> Node {
        let now = Utc::now();
        Node {
            id: "n1".into(),
            name: "n1".into(),
            ip: "127.0.0.1".into(),
            port,
            username: "root".into(),
            credential,
            distro: "ubuntu".into(),
            node_type: NodeRole::Worker,
            status: NodeStatus::Unknown,
            container_runtime: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn missing_credential_fails_before_connecting() {
        // Nothing listens here; a connect attempt would report refused, not credential.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let exec = SshExecutor::new(Duration::from_secs(1));
        let err = exec
            .run(&node(port, None), "uptime", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Credential(CredentialError::Missing)));

        let err = exec.check(&node(port, None)).await.unwrap_err();
        assert!(matches!(err, ExecError::Credential(_)));
    }

    #[tokio::test]
    async fn closed_port_is_classified_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let exec = SshExecutor::new(Duration::from_secs(2));
        let err = exec
            .check(&node(port, Some(Credential::Password("pw".into()))))
            .await
            .unwrap_err();
        match err {
            ExecError::Connect(c) => assert_eq!(c.kind, ConnectErrorKind::Refused),
            other => panic!("expected connect error, got {other:?}"),
        }
    }

    #[test]
    fn io_kinds_map_to_connect_kinds() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        let timed_out = io::Error::from(io::ErrorKind::TimedOut);
        let other = io::Error::from(io::ErrorKind::PermissionDenied);
        assert_eq!(classify_io(&refused), ConnectErrorKind::Refused);
        assert_eq!(classify_io(&timed_out), ConnectErrorKind::Timeout);
        assert_eq!(classify_io(&other), ConnectErrorKind::Unreachable);
    }

    #[test]
    fn spent_deadline_is_a_timeout() {
        let past = Instant::now() - Duration::from_millis(1);
        let err = remaining(past, Duration::from_secs(3)).unwrap_err();
        assert!(matches!(err, ExecError::Timeout { after } if after == Duration::from_secs(3)));
        assert!(remaining(Instant::now() + Duration::from_secs(60), Duration::from_secs(60)).is_ok());
    }

    struct Trickle(Vec<io::Result<&'static [u8]>>);

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.pop() {
                Some(Ok(bytes)) => {
                    buf[..bytes.len()].copy_from_slice(bytes);
                    Ok(bytes.len())
                }
                Some(Err(e)) => Err(e),
                None => Ok(0),
            }
        }
    }

    #[test]
    fn would_block_reads_are_not_errors() {
        let mut reader = Trickle(vec![
            Err(io::Error::from(io::ErrorKind::ConnectionReset)),
            Err(io::Error::from(io::ErrorKind::WouldBlock)),
            Ok(&b"progress 40%\n"[..]),
        ]);
        let mut buf = [0u8; 64];
        let mut out = Vec::new();
        let timeout = Duration::from_secs(1);

        assert!(read_some(&mut reader, &mut buf, &mut out, timeout).unwrap());
        assert!(!read_some(&mut reader, &mut buf, &mut out, timeout).unwrap());
        let err = read_some(&mut reader, &mut buf, &mut out, timeout).unwrap_err();
        assert!(matches!(err, ExecError::Channel(_)));
        assert_eq!(out, b"progress 40%\n");
    }
}
