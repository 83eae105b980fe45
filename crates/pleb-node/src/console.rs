//! Operator input: one reader task fanning lines out to every consumer.

use pleb_core::constants::CONSOLE_CHANNEL_CAPACITY;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Read lines from `reader` and broadcast each one, newline included.
///
/// The sender lives only inside the reader task, so end of input (or
/// `cancel`) closes the channel for every receiver.
pub fn spawn_console<R>(reader: R, cancel: CancellationToken) -> broadcast::Receiver<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = broadcast::channel(CONSOLE_CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        loop {
            let mut line = String::new();
            let read = tokio::select! {
                _ = cancel.cancelled() => break,
                read = reader.read_line(&mut line) => read,
            };
            match read {
                Ok(0) => break,
                Ok(_) => {
                    // No receivers yet is fine; the line is simply dropped.
                    let _ = tx.send(line);
                }
                Err(e) => {
                    debug!(error = %e, "console read failed");
                    break;
                }
            }
        }
        debug!("console input closed");
    });

    rx
}

/// Console on the process's stdin.
pub fn spawn_stdin(cancel: CancellationToken) -> broadcast::Receiver<String> {
    spawn_console(tokio::io::stdin(), cancel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn lines_are_broadcast_then_closed() {
        let (mut input, reader) = tokio::io::duplex(64);
        let mut rx = spawn_console(reader, CancellationToken::new());
        let mut second = rx.resubscribe();

        input.write_all(b"hello\nworld\n").await.unwrap();
        drop(input);

        assert_eq!(rx.recv().await.unwrap(), "hello\n");
        assert_eq!(rx.recv().await.unwrap(), "world\n");
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
        assert_eq!(second.recv().await.unwrap(), "hello\n");
    }
}
