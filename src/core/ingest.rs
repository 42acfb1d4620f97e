//! Stream ingestion - one read loop per process output stream

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::log_entry::StreamKind;
use crate::persistence::LogStore;

/// Reads one output stream of a run line by line into the log store
pub struct StreamIngester {
    instance_name: String,
    start_id: i64,
    stream: StreamKind,
    store: Arc<LogStore>,
}

impl StreamIngester {
    pub fn new(
        instance_name: impl Into<String>,
        start_id: i64,
        stream: StreamKind,
        store: Arc<LogStore>,
    ) -> Self {
        Self {
            instance_name: instance_name.into(),
            start_id,
            stream,
            store,
        }
    }

    /// Run the read loop on its own task
    pub fn spawn<R>(self, reader: R) -> JoinHandle<u64>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(self.run(reader))
    }

    /// Read until end-of-stream, returning the number of stored lines.
    ///
    /// Storage failures are logged and skipped; only EOF or a read error ends the loop.
    pub async fn run<R>(self, reader: R) -> u64
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        let mut stored = 0u64;

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = decode_line(&buf);
                    if self.store_line(line).await {
                        stored += 1;
                    }
                }
                Err(e) => {
                    error!(
                        "Reading {} of '{}' (run #{}) failed: {}",
                        self.stream.label(),
                        self.instance_name,
                        self.start_id,
                        e
                    );
                    break;
                }
            }
        }

        debug!(
            "{} of '{}' (run #{}) closed after {} line(s)",
            self.stream.label(),
            self.instance_name,
            self.start_id,
            stored
        );
        stored
    }

    async fn store_line(&self, line: String) -> bool {
        let store = Arc::clone(&self.store);
        let name = self.instance_name.clone();
        let start_id = self.start_id;
        let stream = self.stream;

        let result =
            tokio::task::spawn_blocking(move || store.append(&name, start_id, &line, stream))
                .await;
        match result {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                warn!(
                    "Dropping {} line of '{}' (run #{}): {}",
                    self.stream.label(),
                    self.instance_name,
                    self.start_id,
                    e
                );
                false
            }
            Err(e) => {
                error!("Log append task for '{}' failed: {}", self.instance_name, e);
                false
            }
        }
    }
}

/// Lossy UTF-8 without the line terminator
fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{LogQuery, FALLBACK_THREAD};

    #[test]
    fn test_decode_line() {
        assert_eq!(decode_line(b"hello\r\n"), "hello");
        assert_eq!(decode_line(b"hello\n"), "hello");
        assert_eq!(decode_line(b"no terminator"), "no terminator");
        assert_eq!(decode_line(b"bad \xff byte\n"), "bad \u{fffd} byte");
    }

    #[tokio::test]
    async fn test_ingests_every_line_in_order() {
        let store = Arc::new(LogStore::open_in_memory().unwrap());
        let run = store.begin_run("lobby").unwrap();
        let input: &[u8] =
            b"[12:00:01] [Server/INFO]: Hello\r\nrandom unparseable text\n\n[12:00:02] [Server/WARN]: tail";

        let ingester = StreamIngester::new("lobby", run.start_id, StreamKind::Stdout, Arc::clone(&store));
        let stored = ingester.run(input).await;
        assert_eq!(stored, 4);

        let entries = store.query("lobby", &LogQuery::for_run(run.start_id)).unwrap();
        let messages: Vec<&str> = entries.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["Hello", "random unparseable text", "", "tail"]);
        assert_eq!(entries[0].thread, "Server");
        assert_eq!(entries[1].thread, FALLBACK_THREAD);
        assert_eq!(entries[3].level, "WARN");
    }

    #[tokio::test]
    async fn test_storage_failures_do_not_stop_the_loop() {
        let store = Arc::new(LogStore::open_in_memory().unwrap());
        let input: &[u8] = b"one\ntwo\nthree\n";

        // No such run: every append fails, every line is still consumed
        let ingester = StreamIngester::new("ghost", 9, StreamKind::Stderr, Arc::clone(&store));
        assert_eq!(ingester.run(input).await, 0);
    }

    #[tokio::test]
    async fn test_two_streams_of_one_run() {
        let store = Arc::new(LogStore::open_in_memory().unwrap());
        let run = store.begin_run("lobby").unwrap();

        let out = StreamIngester::new("lobby", run.start_id, StreamKind::Stdout, Arc::clone(&store))
            .spawn(&b"o1\no2\no3\n"[..]);
        let err = StreamIngester::new("lobby", run.start_id, StreamKind::Stderr, Arc::clone(&store))
            .spawn(&b"e1\ne2\n"[..]);
        assert_eq!(out.await.unwrap() + err.await.unwrap(), 5);

        let entries = store.query("lobby", &LogQuery::for_run(run.start_id)).unwrap();
        let sequences: Vec<i64> = entries.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4, 5]);

        let stdout: Vec<&str> = entries
            .iter()
            .filter(|e| e.stream == StreamKind::Stdout)
            .map(|e| e.message.as_str())
            .collect();
        assert_eq!(stdout, vec!["o1", "o2", "o3"]);
    }
}
