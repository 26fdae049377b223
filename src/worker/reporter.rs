//! Result reporter.
//!
//! Every outbound message goes through one channel into a single writer
//! thread, which owns the output stream. Each message is serialized to one
//! line, written with a single call and flushed before the next one, so
//! completions racing across pool threads can never interleave.

use std::io::{self, Write};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use log::{debug, error};
use vision_worker_protocol::{OutputMessage, TaskOutcome, TaskResult};

/// Cloneable sending side, handed to every component that emits messages.
#[derive(Clone, Debug)]
pub struct ReporterHandle {
    tx: Sender<OutputMessage>,
}

impl ReporterHandle {
    pub fn emit(&self, message: OutputMessage) {
        if let Err(e) = self.tx.send(message) {
            debug!("[REPORTER] Output closed, dropping message: {:?}", e.into_inner());
        }
    }

    pub fn log(&self, msg: impl Into<String>) {
        self.emit(OutputMessage::log(msg));
    }

    pub fn error(&self, msg: impl Into<String>) {
        self.emit(OutputMessage::error(msg));
    }

    pub fn init_succeeded(&self, elapsed: Duration) {
        self.emit(OutputMessage::init_ok(elapsed));
    }

    pub fn init_failed(&self, elapsed: Duration, reason: impl Into<String>) {
        self.emit(OutputMessage::init_failed(elapsed, reason));
    }

    pub fn task_accepted(&self, task_id: &str) {
        self.emit(OutputMessage::TaskAccepted {
            task_id: task_id.to_string(),
        });
    }

    /// Emit the single `result` line for a finished task.
    pub fn report(&self, task_id: String, outcome: TaskOutcome) {
        self.emit(OutputMessage::Result(TaskResult::new(task_id, outcome)));
    }
}

/// The writer thread. Finishes once every [`ReporterHandle`] is dropped.
#[derive(Debug)]
pub struct Reporter {
    thread: JoinHandle<io::Result<u64>>,
}

impl Reporter {
    pub fn spawn<W>(writer: W) -> io::Result<(ReporterHandle, Reporter)>
    where
        W: Write + Send + 'static,
    {
        let (tx, rx) = crossbeam_channel::unbounded();
        let thread = thread::Builder::new()
            .name("vision_reporter".to_string())
            .spawn(move || write_loop(rx, writer))?;
        Ok((ReporterHandle { tx }, Reporter { thread }))
    }

    /// Wait for the queue to empty. Returns the number of lines written.
    pub fn finish(self) -> io::Result<u64> {
        self.thread
            .join()
            .unwrap_or_else(|_| Err(io::Error::other("reporter thread panicked")))
    }
}

fn write_loop<W: Write>(rx: Receiver<OutputMessage>, mut writer: W) -> io::Result<u64> {
    let mut written = 0;
    for message in rx.iter() {
        if let Err(e) = write_line(&mut writer, &message) {
            // The host is gone; nothing else can be delivered.
            error!("[REPORTER] Failed to write output: {e}");
            return Err(e);
        }
        written += 1;
    }
    Ok(written)
}

fn write_line<W: Write>(writer: &mut W, message: &OutputMessage) -> io::Result<()> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    writer.write_all(&line)?;
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::testing::SharedBuffer;

    #[test]
    fn test_each_message_is_one_json_line() {
        let buffer = SharedBuffer::default();
        let (handle, reporter) = Reporter::spawn(buffer.clone()).unwrap();

        handle.log("hello");
        handle.task_accepted("t1");
        handle.report(
            "t1".to_string(),
            TaskOutcome::Succeeded {
                summary: "line one\nline two".into(),
                elapsed: Duration::from_millis(10),
            },
        );
        drop(handle);

        assert_eq!(reporter.finish().unwrap(), 3);
        let messages = buffer.messages();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0], OutputMessage::log("hello"));
        match &messages[2] {
            OutputMessage::Result(r) => {
                assert_eq!(r.task_id, "t1");
                assert_eq!(r.result.as_deref(), Some("line one\nline two"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(buffer.flushes(), 3);
    }

    #[test]
    fn test_concurrent_reports_do_not_interleave() {
        let buffer = SharedBuffer::default();
        let (handle, reporter) = Reporter::spawn(buffer.clone()).unwrap();

        let threads: Vec<_> = (0..8)
            .map(|t| {
                let handle = handle.clone();
                thread::spawn(move || {
                    for i in 0..50 {
                        handle.report(
                            format!("t{t}-{i}"),
                            TaskOutcome::Failed {
                                reason: "x".repeat(200),
                            },
                        );
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        drop(handle);

        assert_eq!(reporter.finish().unwrap(), 400);
        let messages = buffer.messages();
        assert_eq!(messages.len(), 400);
        assert!(messages
            .iter()
            .all(|m| matches!(m, OutputMessage::Result(r) if !r.success)));
    }

    #[test]
    fn test_writer_waits_for_every_handle() {
        let buffer = SharedBuffer::default();
        let (handle, reporter) = Reporter::spawn(buffer.clone()).unwrap();
        let late = handle.clone();
        drop(handle);

        late.error("still open");
        drop(late);
        assert_eq!(reporter.finish().unwrap(), 1);
        assert_eq!(buffer.messages(), vec![OutputMessage::error("still open")]);
    }

    #[test]
    fn test_write_failure_stops_writer() {
        struct Broken;
        impl Write for Broken {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "host closed pipe"))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let (handle, reporter) = Reporter::spawn(Broken).unwrap();
        handle.log("lost");
        let err = reporter.finish().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        // Sending after the writer died must not panic.
        handle.log("also lost");
    }
}
