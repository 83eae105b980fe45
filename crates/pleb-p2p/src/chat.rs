//! Line-oriented chat over a dedicated `/chat/1.0.0` stream.
//!
//! Each chat stream is split into an inbound half that renders peer lines to
//! the operator and an outbound half that forwards operator lines to the
//! peer. The halves never share state and end independently.

use futures::StreamExt;
use libp2p::{PeerId, StreamProtocol};
use pleb_core::constants::CHAT_PROTOCOL;
use pleb_core::PeerRecord;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::P2pError;
use crate::handle::NetworkHandle;

pub const PROMPT: &str = "> ";

pub fn chat_protocol() -> StreamProtocol {
    StreamProtocol::new(CHAT_PROTOCOL)
}

/// Operator rendering of one inbound line.
pub fn render_line(text: &str) -> String {
    format!("\x1b[32m{text}\x1b[0m\n{PROMPT}")
}

/// Inbound half. Renders every line except a bare newline, lossily for
/// non-UTF-8 bytes, until the peer closes the stream or `cancel` fires.
/// Returns the number of lines rendered.
pub async fn read_lines<R, W>(reader: R, out: &mut W, cancel: &CancellationToken) -> usize
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    let mut rendered = 0;

    loop {
        line.clear();
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read_until(b'\n', &mut line) => read,
        };

        match read {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "chat read failed");
                break;
            }
        }

        if line == b"\n" {
            continue;
        }
        let bytes = line.strip_suffix(b"\n").unwrap_or(&line);
        let text = String::from_utf8_lossy(bytes);

        let written = async {
            out.write_all(render_line(&text).as_bytes()).await?;
            out.flush().await
        };
        if let Err(e) = written.await {
            warn!(error = %e, "failed to render chat line");
            break;
        }
        rendered += 1;
    }

    rendered
}

/// Outbound half. Writes each operator line plus a terminator to `writer`
/// until input closes, a write fails, or `cancel` fires. Returns the number
/// of lines sent.
pub async fn write_lines<S, W>(
    mut writer: S,
    mut input: broadcast::Receiver<String>,
    prompt: &mut W,
    cancel: &CancellationToken,
) -> u64
where
    S: AsyncWrite + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut sent = 0;

    loop {
        let _ = prompt.write_all(PROMPT.as_bytes()).await;
        let _ = prompt.flush().await;

        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = input.recv() => line,
        };

        let line = match line {
            Ok(line) => line,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "chat input lagged; lines dropped");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => {
                debug!("chat input closed");
                break;
            }
        };

        let mut frame = line.into_bytes();
        frame.push(b'\n');
        let written = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        };
        if let Err(e) = written.await {
            warn!(error = %e, "Error writing to buffer");
            break;
        }
        sent += 1;
    }

    let _ = writer.shutdown().await;
    sent
}

/// Both halves of one running chat stream.
pub struct ChatTasks {
    pub peer: PeerId,
    pub inbound: JoinHandle<usize>,
    pub outbound: JoinHandle<u64>,
}

impl ChatTasks {
    /// Wait for both halves. Returns `(lines rendered, lines sent)`.
    pub async fn wait(self) -> (usize, u64) {
        let rendered = self.inbound.await.unwrap_or_default();
        let sent = self.outbound.await.unwrap_or_default();
        debug!(peer = %self.peer, rendered, sent, "chat stream closed");
        (rendered, sent)
    }
}

/// Split `stream` and run its halves as two tasks. The inbound half renders
/// to `out`, the outbound half prompts on `prompt`.
pub fn spawn_chat<S, O, P>(
    peer: PeerId,
    stream: S,
    input: broadcast::Receiver<String>,
    (mut out, mut prompt): (O, P),
    cancel: CancellationToken,
) -> ChatTasks
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    O: AsyncWrite + Unpin + Send + 'static,
    P: AsyncWrite + Unpin + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);

    let inbound = {
        let cancel = cancel.clone();
        tokio::spawn(async move { read_lines(read_half, &mut out, &cancel).await })
    };
    let outbound =
        tokio::spawn(async move { write_lines(write_half, input, &mut prompt, &cancel).await });

    ChatTasks {
        peer,
        inbound,
        outbound,
    }
}

/// Listener role. Accepts chat streams until `cancel` fires and runs one
/// chat per stream, each with its own view of operator input.
/// `make_output` supplies the `(render, prompt)` writers for each stream.
///
/// Only receivers of `input` are handed out, so closing the console closes
/// input for every chat.
pub async fn serve_chat<N, F, O, P>(
    network: &N,
    input: broadcast::Receiver<String>,
    make_output: F,
    cancel: CancellationToken,
) -> Result<(), P2pError>
where
    N: NetworkHandle,
    F: Fn() -> (O, P),
    O: AsyncWrite + Unpin + Send + 'static,
    P: AsyncWrite + Unpin + Send + 'static,
{
    let mut incoming = network.accept_streams(chat_protocol())?;
    let mut chats = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(_) = chats.join_next(), if !chats.is_empty() => {}
            next = incoming.next() => {
                let Some((peer, stream)) = next else {
                    debug!("chat acceptor closed");
                    break;
                };
                info!(peer = %peer, "Got a new stream!");
                let chat =
                    spawn_chat(peer, stream, input.resubscribe(), make_output(), cancel.clone());
                chats.spawn(chat.wait());
            }
        }
    }

    while chats.join_next().await.is_some() {}
    Ok(())
}

/// Initiator role. Registers the peer's addresses permanently, opens exactly
/// one chat stream and starts it.
pub async fn open_chat<N, O, P>(
    network: &N,
    record: &PeerRecord,
    input: broadcast::Receiver<String>,
    output: (O, P),
    cancel: CancellationToken,
) -> Result<ChatTasks, P2pError>
where
    N: NetworkHandle,
    O: AsyncWrite + Unpin + Send + 'static,
    P: AsyncWrite + Unpin + Send + 'static,
{
    network
        .register_addresses(record.peer_id, record.addresses.clone(), None)
        .await?;
    let stream = network.open_stream(record.peer_id, chat_protocol()).await?;
    info!(peer = %record.peer_id, "Established connection to destination");
    Ok(spawn_chat(record.peer_id, stream, input, output, cancel))
}
