use std::sync::Arc;
use std::time::SystemTime;

use async_std::channel;
use async_std::channel::{ Sender, Receiver };
use async_std::io::{ BufReader, Read };
use async_std::io::prelude::BufReadExt;
use async_std::sync::{ Condvar, Mutex };
use async_std::task;

const INITIAL_HISTORY_CAPACITY: usize = 1024;
const CONSUMER_BUFFER: usize = 16;

/// A single line of server output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub text: String,
    /// Moment the line was read from the server output
    pub captured_at: SystemTime,
}

struct History {
    lines: Vec<LogLine>,
    /// Set once the server output is exhausted
    done: bool,
}

struct Shared {
    history: Mutex<History>,
    lines_available: Condvar,
}

/// The complete server output since startup.
///
/// A monitor task appends every line to the history. Each consumer created by
/// [`ServerLog::attach`] gets its own delivery task with its own cursor into the
/// history, so a consumer attaching late still sees everything from the first
/// line on, and a slow consumer never holds up the monitor or other consumers.
#[derive(Clone)]
pub struct ServerLog {
    shared: Arc<Shared>,
}

impl ServerLog {
    fn new() -> ServerLog {
        ServerLog {
            shared: Arc::new(Shared {
                history: Mutex::new(History {
                    lines: Vec::with_capacity(INITIAL_HISTORY_CAPACITY),
                    done: false,
                }),
                lines_available: Condvar::new(),
            }),
        }
    }

    /// Starts monitoring `output` until it is exhausted
    pub fn spawn<R>(output: R) -> ServerLog
        where R: Read + Unpin + Send + 'static
    {
        let server_log = ServerLog::new();

        let monitor = server_log.clone();
        task::spawn(async move {
            monitor.monitor(output).await
        });

        server_log
    }

    /// Creates a new consumer receiving every line since the start of the server.
    ///
    /// The receiver is closed once the server output is exhausted and all lines were delivered.
    pub fn attach(&self) -> Receiver<LogLine> {
        let (sender, receiver) = channel::bounded(CONSUMER_BUFFER);

        let server_log = self.clone();
        task::spawn(async move {
            server_log.feed(sender).await
        });

        receiver
    }

    /// Waits until the server output is exhausted
    pub async fn wait(&self) {
        let history = self.shared.history.lock().await;
        let _history = self.shared.lines_available
            .wait_until(history, |history| history.done)
            .await;
    }

    async fn monitor<R: Read + Unpin>(&self, output: R) {
        let mut reader = BufReader::new(output);
        let mut buffer = Vec::new();

        loop {
            buffer.clear();
            match reader.read_until(b'\n', &mut buffer).await {
                Ok(0) => break,
                Ok(_) => self.record(String::from_utf8_lossy(&buffer).trim()).await,
                Err(err) => {
                    error!("Error while reading server console: {}", err);
                    break;
                }
            }
        }

        self.finish().await;
    }

    async fn record(&self, text: &str) {
        let line = LogLine {
            text: text.to_string(),
            captured_at: SystemTime::now(),
        };

        self.shared.history.lock().await.lines.push(line);
        self.shared.lines_available.notify_all();
    }

    async fn finish(&self) {
        self.shared.history.lock().await.done = true;
        self.shared.lines_available.notify_all();
    }

    async fn feed(&self, sender: Sender<LogLine>) {
        let mut lines_sent = 0;

        loop {
            // Copy out the pending lines and release the lock before sending, a consumer
            // that is slow to receive must not block the history.
            let pending = {
                let history = self.shared.history.lock().await;
                let history = self.shared.lines_available
                    .wait_until(history, |history| history.done || history.lines.len() > lines_sent)
                    .await;

                let pending: Vec<LogLine> = history.lines.iter().skip(lines_sent).cloned().collect();
                if pending.is_empty() {
                    return;
                }
                pending
            };

            for line in pending {
                if sender.send(line).await.is_err() {
                    debug!("Server log consumer went away after {} lines", lines_sent);
                    return;
                }
                lines_sent += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use async_std::future::timeout;
    use async_std::io::Cursor;

    async fn next_text(consumer: &Receiver<LogLine>) -> String {
        timeout(Duration::from_secs(1), consumer.recv()).await
            .expect("no log line within 1 second")
            .expect("consumer closed unexpectedly")
            .text
    }

    async fn assert_closed(consumer: &Receiver<LogLine>) {
        let result = timeout(Duration::from_secs(1), consumer.recv()).await
            .expect("consumer not closed within 1 second");
        assert!(result.is_err(), "unexpected line {:?}", result);
    }

    #[async_std::test]
    async fn late_consumer_gets_history_then_live_lines() {
        let server_log = ServerLog::new();
        server_log.record("one").await;
        server_log.record("two").await;

        let consumer = server_log.attach();
        assert_eq!("one", next_text(&consumer).await);
        assert_eq!("two", next_text(&consumer).await);

        server_log.record("three").await;
        assert_eq!("three", next_text(&consumer).await);

        server_log.finish().await;
        assert_closed(&consumer).await;
    }

    #[async_std::test]
    async fn consumer_attached_after_finish_gets_everything() {
        let server_log = ServerLog::new();
        for i in 0..40 {
            server_log.record(&format!("line {}", i)).await;
        }
        server_log.finish().await;

        let consumer = server_log.attach();
        for i in 0..40 {
            assert_eq!(format!("line {}", i), next_text(&consumer).await);
        }
        assert_closed(&consumer).await;
    }

    #[async_std::test]
    async fn stalled_consumer_does_not_hold_up_others() {
        let server_log = ServerLog::new();
        let stalled = server_log.attach();
        let reader = server_log.attach();

        for i in 0..100 {
            server_log.record(&format!("line {}", i)).await;
        }
        server_log.finish().await;

        for i in 0..100 {
            assert_eq!(format!("line {}", i), next_text(&reader).await);
        }
        assert_closed(&reader).await;

        for i in 0..100 {
            assert_eq!(format!("line {}", i), next_text(&stalled).await);
        }
        assert_closed(&stalled).await;
    }

    #[async_std::test]
    async fn monitors_output_until_exhausted() {
        let output = Cursor::new(b"Server starting with version 255\r\n   Car 1024 Pos 1\nlast line".to_vec());
        let server_log = ServerLog::spawn(output);

        timeout(Duration::from_secs(1), server_log.wait()).await
            .expect("server log not done within 1 second");

        let consumer = server_log.attach();
        assert_eq!("Server starting with version 255", next_text(&consumer).await);
        assert_eq!("Car 1024 Pos 1", next_text(&consumer).await);
        assert_eq!("last line", next_text(&consumer).await);
        assert_closed(&consumer).await;
    }

    #[async_std::test]
    async fn invalid_utf8_is_replaced() {
        let server_log = ServerLog::spawn(Cursor::new(b"car \xff online\n".to_vec()));

        let consumer = server_log.attach();
        assert_eq!("car \u{fffd} online", next_text(&consumer).await);
        assert_closed(&consumer).await;
    }

    #[async_std::test]
    async fn lines_carry_capture_time() {
        let before = SystemTime::now();
        let server_log = ServerLog::new();
        server_log.record("stamped").await;

        let line = server_log.attach().recv().await.unwrap();
        assert!(line.captured_at >= before);
    }
}
