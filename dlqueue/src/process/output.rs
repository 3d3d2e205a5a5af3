//! Output reading for supervised processes.
//!
//! Download tools redraw progress lines with carriage returns (`\r`). When
//! stdout/stderr are piped those updates are not newline-delimited, so
//! `lines()` would hold them back until the transfer ends. Records here are
//! delimited by either `\n` or `\r`.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::trace;

/// Longest record kept; the tail of longer records is dropped.
const MAX_RECORD_LEN: usize = 16 * 1024;

/// Reads an async stream and yields text records delimited by `\n` or `\r`.
///
/// At most `MAX_RECORD_LEN` bytes of an unterminated record are buffered.
pub struct OutputRecordReader<R> {
    reader: BufReader<R>,
    pending: Vec<u8>,
    /// Bytes of `pending` already searched for a delimiter.
    scanned: usize,
    /// Dropping the overflow of a record until its delimiter shows up.
    discarding: bool,
    scratch: [u8; 4096],
}

impl<R> OutputRecordReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            pending: Vec::new(),
            scanned: 0,
            discarding: false,
            scratch: [0u8; 4096],
        }
    }

    /// Returns the next non-empty, trimmed record, or `None` at end of stream.
    pub async fn next_record(&mut self) -> io::Result<Option<String>> {
        loop {
            if let Some(offset) = self.pending[self.scanned..]
                .iter()
                .position(|&b| is_delimiter(b))
            {
                let idx = self.scanned + offset;
                let record = decode(&self.pending[..idx]);
                let consumed = idx
                    + self.pending[idx..]
                        .iter()
                        .take_while(|&&b| is_delimiter(b))
                        .count();
                self.pending.drain(..consumed);
                self.scanned = 0;
                self.discarding = false;

                if record.is_empty() {
                    continue;
                }
                return Ok(Some(record));
            }

            if self.pending.len() > MAX_RECORD_LEN {
                self.pending.truncate(MAX_RECORD_LEN);
                if !self.discarding {
                    trace!(limit = MAX_RECORD_LEN, "Output record too long, dropping its tail");
                    self.discarding = true;
                }
            }
            self.scanned = self.pending.len();

            let n = self.reader.read(&mut self.scratch).await?;
            if n == 0 {
                let record = decode(&self.pending);
                self.pending.clear();
                self.scanned = 0;
                self.discarding = false;
                return Ok((!record.is_empty()).then_some(record));
            }

            let chunk = &self.scratch[..n];
            if self.discarding {
                if let Some(pos) = chunk.iter().position(|&b| is_delimiter(b)) {
                    self.pending.extend_from_slice(&chunk[pos..]);
                }
            } else {
                self.pending.extend_from_slice(chunk);
            }
        }
    }
}

fn is_delimiter(b: u8) -> bool {
    matches!(b, b'\n' | b'\r')
}

fn decode(bytes: &[u8]) -> String {
    let bytes = &bytes[..bytes.len().min(MAX_RECORD_LEN)];
    String::from_utf8_lossy(bytes).trim().to_string()
}

/// Forward every record of `stream` into `tx` until the stream ends or the
/// receiver goes away.
pub(crate) fn spawn_record_pump<R>(stream: R, tx: mpsc::Sender<String>, label: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = OutputRecordReader::new(stream);
        loop {
            match reader.next_record().await {
                Ok(Some(record)) => {
                    if tx.send(record).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    trace!(stream = label, error = %e, "Output stream read failed");
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn splits_on_cr_and_lf() {
        let (mut tx, rx) = tokio::io::duplex(1024);

        tokio::spawn(async move {
            let _ = tx.write_all(b"one\rtwo\nthree\r\n\r\nfour").await;
        });

        let mut reader = OutputRecordReader::new(rx);
        let mut records = Vec::new();
        while let Some(line) = reader.next_record().await.unwrap() {
            records.push(line);
        }

        assert_eq!(records, vec!["one", "two", "three", "four"]);
    }

    #[tokio::test]
    async fn skips_whitespace_only_records() {
        let (mut tx, rx) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let _ = tx.write_all(b"   \n[download]  50.0%\n  ").await;
        });

        let mut reader = OutputRecordReader::new(rx);
        assert_eq!(
            reader.next_record().await.unwrap().as_deref(),
            Some("[download]  50.0%")
        );
        assert_eq!(reader.next_record().await.unwrap(), None);
    }

    #[tokio::test]
    async fn unterminated_output_stays_bounded() {
        let (mut tx, rx) = tokio::io::duplex(8 * 1024);
        let (written_tx, written_rx) = tokio::sync::oneshot::channel();
        let (finish_tx, finish_rx) = tokio::sync::oneshot::channel::<()>();

        tokio::spawn(async move {
            tx.write_all(&vec![b'x'; 512 * 1024]).await.unwrap();
            let _ = written_tx.send(());
            let _ = finish_rx.await;
            tx.write_all(b"\nnext\n").await.unwrap();
        });

        let mut reader = OutputRecordReader::new(rx);
        tokio::select! {
            record = reader.next_record() => panic!("record without delimiter: {record:?}"),
            _ = written_rx => {}
        }
        assert!(
            reader.pending.len() <= MAX_RECORD_LEN + reader.scratch.len(),
            "buffered {} bytes",
            reader.pending.len()
        );

        finish_tx.send(()).unwrap();
        let first = reader.next_record().await.unwrap().unwrap();
        assert_eq!(first.len(), MAX_RECORD_LEN);
        assert!(first.bytes().all(|b| b == b'x'));
        assert_eq!(reader.next_record().await.unwrap().as_deref(), Some("next"));
        assert_eq!(reader.next_record().await.unwrap(), None);
    }

    #[tokio::test]
    async fn delimiter_split_across_reads() {
        let (mut tx, rx) = tokio::io::duplex(16);
        tokio::spawn(async move {
            for part in [&b"alpha-be"[..], b"ta\r", b"\ngam", b"ma"] {
                tx.write_all(part).await.unwrap();
                tokio::task::yield_now().await;
            }
        });

        let mut reader = OutputRecordReader::new(rx);
        assert_eq!(reader.next_record().await.unwrap().as_deref(), Some("alpha-beta"));
        assert_eq!(reader.next_record().await.unwrap().as_deref(), Some("gamma"));
        assert_eq!(reader.next_record().await.unwrap(), None);
    }

    #[tokio::test]
    async fn pump_forwards_records() {
        let (mut writer, reader) = tokio::io::duplex(256);
        let (tx, mut rx) = mpsc::channel(8);
        spawn_record_pump(reader, tx, "stdout");

        writer.write_all(b"a\nb\n").await.unwrap();
        drop(writer);

        assert_eq!(rx.recv().await.as_deref(), Some("a"));
        assert_eq!(rx.recv().await.as_deref(), Some("b"));
        assert_eq!(rx.recv().await, None);
    }
}
