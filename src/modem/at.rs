//! AT command modem over TCP
//!
//! Talks the text-mode subset of the GSM AT command set to a modem exposed on
//! a TCP socket (a serial-to-network bridge or a network-attached modem).
//!
//! Handshake: ESC (abandon any half-entered message), `ATZ`, `ATE0`,
//! `AT+CMGF=1`, each command answered by `OK`.
//! Send: `AT+CMGS="<mobile>"`, wait for the `>` prompt, write the body
//! followed by Ctrl-Z, wait for `OK`.
//!
//! A background task splits the byte stream into lines. When the peer hangs
//! up, the task ends, [`Link::closed`] resolves and every exchange in
//! progress fails with [`DeviceError::Closed`].
//!
//! An exchange that is abandoned half way (its future dropped, e.g. by a send
//! timeout) leaves the modem in an unknown state: the link is then reported
//! closed so the connection reopens it and handshakes again.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::dispatcher::message::is_valid_mobile;
use crate::modem::{Link, Modem};
use crate::utils::error::DeviceError;

const CTRL_Z: u8 = 0x1A;
const ESC: u8 = 0x1B;
const PROMPT: &str = ">";

/// Time the modem gets to answer an ESC before the handshake goes on.
const ESCAPE_SETTLE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct AtModem {
    address: String,
}

impl AtModem {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

#[async_trait]
impl Modem for AtModem {
    type Link = AtLink;

    async fn open(&self) -> Result<AtLink, DeviceError> {
        let stream = TcpStream::connect(&self.address).await?;
        stream.set_nodelay(true)?;
        debug!(address = %self.address, "modem socket open");
        Ok(AtLink::new(stream))
    }
}

struct Io {
    writer: OwnedWriteHalf,
    lines: mpsc::UnboundedReceiver<String>,
}

pub struct AtLink {
    io: Mutex<Io>,
    closed: CancellationToken,
    reader: JoinHandle<()>,
}

/// Marks the link closed unless the exchange it guards runs to completion.
struct Exchange<'a> {
    closed: &'a CancellationToken,
    finished: bool,
}

impl<'a> Exchange<'a> {
    fn begin(closed: &'a CancellationToken) -> Self {
        Self {
            closed,
            finished: false,
        }
    }

    fn finish<T>(mut self, result: T) -> T {
        self.finished = true;
        result
    }
}

impl Drop for Exchange<'_> {
    fn drop(&mut self) {
        if !self.finished && !self.closed.is_cancelled() {
            warn!("modem exchange abandoned, dropping link");
            self.closed.cancel();
        }
    }
}

impl AtLink {
    fn new(stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        let (tx, lines) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        let reader = tokio::spawn(read_lines(reader, tx, closed.clone()));
        Self {
            io: Mutex::new(Io { writer, lines }),
            closed,
            reader,
        }
    }

    /// Run one command and wait for its final result code.
    async fn command(&self, command: &str) -> Result<(), DeviceError> {
        let exchange = Exchange::begin(&self.closed);
        let mut io = self.io.lock().await;
        io.discard_unsolicited();
        let result = match self.write(&mut io, format!("{command}\r").as_bytes()).await {
            Ok(()) => io.final_result().await,
            Err(e) => Err(e),
        };
        exchange.finish(result)
    }

    /// Leave message entry mode if a previous session left the modem there.
    async fn escape(&self) -> Result<(), DeviceError> {
        let mut io = self.io.lock().await;
        self.write(&mut io, &[ESC]).await?;
        time::sleep(ESCAPE_SETTLE).await;
        io.discard_unsolicited();
        Ok(())
    }

    async fn submit(&self, mobile: &str, body: &str) -> Result<(), DeviceError> {
        let mut io = self.io.lock().await;
        io.discard_unsolicited();
        self.write(&mut io, format!("AT+CMGS=\"{mobile}\"\r").as_bytes())
            .await?;
        io.prompt().await?;

        let mut payload = body.as_bytes().to_vec();
        payload.push(CTRL_Z);
        self.write(&mut io, &payload).await?;
        io.final_result().await
    }

    async fn write(&self, io: &mut Io, bytes: &[u8]) -> Result<(), DeviceError> {
        if self.closed.is_cancelled() {
            return Err(DeviceError::Closed);
        }
        if let Err(e) = io.writer.write_all(bytes).await {
            debug!(error = %e, "modem write failed");
            self.closed.cancel();
            return Err(DeviceError::Closed);
        }
        Ok(())
    }
}

impl Io {
    /// Drop unsolicited result codes left over between exchanges.
    fn discard_unsolicited(&mut self) {
        while let Ok(line) = self.lines.try_recv() {
            trace!(%line, "discarding unsolicited line");
        }
    }

    async fn final_result(&mut self) -> Result<(), DeviceError> {
        loop {
            let line = self.lines.recv().await.ok_or(DeviceError::Closed)?;
            if line == "OK" {
                return Ok(());
            }
            if is_error(&line) {
                return Err(DeviceError::Protocol(line));
            }
            trace!(%line, "intermediate response");
        }
    }

    async fn prompt(&mut self) -> Result<(), DeviceError> {
        loop {
            let line = self.lines.recv().await.ok_or(DeviceError::Closed)?;
            if line == PROMPT {
                return Ok(());
            }
            if is_error(&line) {
                return Err(DeviceError::Protocol(line));
            }
        }
    }
}

#[async_trait]
impl Link for AtLink {
    async fn handshake(&self) -> Result<(), DeviceError> {
        self.escape().await?;
        self.command("ATZ").await?;
        self.command("ATE0").await?;
        self.command("AT+CMGF=1").await
    }

    async fn send(&self, mobile: &str, body: &str) -> Result<(), DeviceError> {
        if !is_valid_mobile(mobile) {
            return Err(DeviceError::Protocol(format!(
                "invalid destination {mobile:?}"
            )));
        }
        if body.bytes().any(|b| b == CTRL_Z || b == ESC) {
            return Err(DeviceError::Protocol(
                "message body contains a control character".to_string(),
            ));
        }

        let exchange = Exchange::begin(&self.closed);
        let result = self.submit(mobile, body).await;
        exchange.finish(result)
    }

    async fn closed(&self) {
        self.closed.cancelled().await;
    }
}

impl Drop for AtLink {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn is_error(line: &str) -> bool {
    line == "ERROR" || line.starts_with("+CMS ERROR") || line.starts_with("+CME ERROR")
}

/// Split the modem's output into trimmed, non-empty lines. The send prompt
/// is not newline terminated and is emitted on its own.
async fn read_lines(
    mut reader: OwnedReadHalf,
    lines: mpsc::UnboundedSender<String>,
    closed: CancellationToken,
) {
    let mut pending = Vec::new();
    let mut chunk = [0u8; 512];

    'read: loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "modem read failed");
                break;
            }
        };
        pending.extend_from_slice(&chunk[..n]);

        while let Some(end) = pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = pending.drain(..=end).collect();
            let line = String::from_utf8_lossy(&raw).trim().to_string();
            if !line.is_empty() && lines.send(line).is_err() {
                break 'read;
            }
        }
        if String::from_utf8_lossy(&pending).trim() == PROMPT {
            pending.clear();
            if lines.send(PROMPT.to_string()).is_err() {
                break;
            }
        }
    }

    debug!("modem link closed");
    closed.cancel();
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::Mutex as AsyncMutex;
    use tokio::time::timeout;

    use super::*;

    #[derive(Clone, Copy, PartialEq)]
    enum Answer {
        Accept,
        Reject,
        Silent,
    }

    /// Minimal modem emulator: answers the handshake, prompts for a body and
    /// then accepts it, rejects it with a CMS error or never answers. ESC
    /// leaves message entry with `OK`. Everything received is logged, ESC as
    /// `<ESC>`.
    async fn fake_modem(answer: Answer) -> (String, Arc<AsyncMutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let received = Arc::new(AsyncMutex::new(Vec::new()));
        let log = received.clone();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut current = Vec::new();
            let mut in_body = false;
            let mut byte = [0u8; 1];
            while socket.read(&mut byte).await.unwrap_or(0) == 1 {
                match byte[0] {
                    ESC => {
                        current.clear();
                        log.lock().await.push("<ESC>".to_string());
                        if in_body {
                            in_body = false;
                            socket.write_all(b"\r\nOK\r\n").await.unwrap();
                        }
                    }
                    CTRL_Z if in_body => {
                        in_body = false;
                        let body = String::from_utf8_lossy(&current).to_string();
                        current.clear();
                        log.lock().await.push(body);
                        let reply: &[u8] = match answer {
                            Answer::Accept => b"\r\n+CMGS: 7\r\n\r\nOK\r\n",
                            Answer::Reject => b"\r\n+CMS ERROR: 500\r\n",
                            Answer::Silent => b"",
                        };
                        socket.write_all(reply).await.unwrap();
                    }
                    b'\r' if !in_body => {
                        let command = String::from_utf8_lossy(&current).to_string();
                        current.clear();
                        let reply: &[u8] = if command.starts_with("AT+CMGS=") {
                            in_body = true;
                            b"\r\n> "
                        } else {
                            b"\r\nOK\r\n"
                        };
                        log.lock().await.push(command);
                        socket.write_all(reply).await.unwrap();
                    }
                    b => current.push(b),
                }
            }
        });

        (address, received)
    }

    #[tokio::test]
    async fn handshake_and_send() {
        let (address, received) = fake_modem(Answer::Accept).await;
        let link = AtModem::new(address).open().await.unwrap();

        link.handshake().await.unwrap();
        link.send("+15550100", "hello there").await.unwrap();

        let received = received.lock().await.clone();
        assert_eq!(
            received,
            vec![
                "<ESC>",
                "ATZ",
                "ATE0",
                "AT+CMGF=1",
                "AT+CMGS=\"+15550100\"",
                "hello there"
            ]
        );
    }

    #[tokio::test]
    async fn cms_error_is_a_protocol_error() {
        let (address, _) = fake_modem(Answer::Reject).await;
        let link = AtModem::new(address).open().await.unwrap();
        link.handshake().await.unwrap();

        let err = link.send("+15550100", "hi").await.unwrap_err();
        assert!(matches!(err, DeviceError::Protocol(ref line) if line.starts_with("+CMS ERROR")));
        // a completed exchange keeps the link usable
        assert!(!link.closed.is_cancelled());
    }

    #[tokio::test]
    async fn command_characters_never_reach_the_modem() {
        let (address, received) = fake_modem(Answer::Accept).await;
        let link = AtModem::new(address).open().await.unwrap();
        link.handshake().await.unwrap();

        let err = link
            .send("+1\"\rAT+CFUN=0\r", "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::Protocol(_)));
        let err = link
            .send("+15550100", "hi\u{1a}AT+CMGD=1,4\r")
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::Protocol(_)));
        let err = link.send("+15550100", "hi\u{1b}").await.unwrap_err();
        assert!(matches!(err, DeviceError::Protocol(_)));

        link.send("+15550100", "plain").await.unwrap();
        let received = received.lock().await.clone();
        assert!(!received.iter().any(|line| line.contains("CFUN") || line.contains("CMGD")));
        assert_eq!(&received[4..], ["AT+CMGS=\"+15550100\"", "plain"]);
    }

    #[tokio::test]
    async fn abandoned_send_drops_the_link() {
        let (address, received) = fake_modem(Answer::Silent).await;
        let link = AtModem::new(address).open().await.unwrap();
        link.handshake().await.unwrap();

        let abandoned = timeout(Duration::from_millis(200), link.send("+15550100", "first")).await;
        assert!(abandoned.is_err(), "send should not have completed");

        timeout(Duration::from_secs(2), link.closed())
            .await
            .expect("an abandoned exchange must close the link");
        assert!(matches!(
            link.send("+15550101", "second").await,
            Err(DeviceError::Closed)
        ));
        let received = received.lock().await.clone();
        assert_eq!(received.last().map(String::as_str), Some("first"));
        assert!(!received.iter().any(|line| line.contains("+15550101")));
    }

    #[tokio::test]
    async fn peer_hangup_closes_the_link() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let link = AtModem::new(address).open().await.unwrap();
        timeout(Duration::from_secs(2), link.closed())
            .await
            .expect("closed() should resolve after hangup");
        assert!(matches!(
            link.send("+15550100", "hi").await,
            Err(DeviceError::Closed)
        ));
    }

    #[tokio::test]
    async fn open_fails_without_a_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = AtModem::new(address).open().await.err().unwrap();
        assert!(matches!(err, DeviceError::Io(_)));
    }
}
