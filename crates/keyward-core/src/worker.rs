//! Run long blocking operations off the caller's thread.
//!
//! Formatting a disk or waiting on a keyserver can take minutes. A job runs on
//! its own named thread and reports progress lines over a channel before
//! handing back its result.

use crate::error::{KeywardError, KeywardResult};
use log::debug;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Message emitted by a running job.
#[derive(Debug)]
pub enum JobEvent<T> {
    Progress(String),
    Finished(KeywardResult<T>),
}

/// Handle passed into the job body for reporting progress.
#[derive(Debug, Clone)]
pub struct Progress<T> {
    tx: Sender<JobEvent<T>>,
}

impl<T> Progress<T> {
    /// Send a progress line. A dropped receiver is ignored.
    pub fn report(&self, message: impl Into<String>) {
        let _ = self.tx.send(JobEvent::Progress(message.into()));
    }
}

#[derive(Debug)]
pub struct JobHandle<T> {
    label: String,
    rx: Receiver<JobEvent<T>>,
    thread: Option<JoinHandle<()>>,
}

/// Spawn `job` on a dedicated thread named after `label`.
pub fn spawn_job<T, F>(label: &str, job: F) -> KeywardResult<JobHandle<T>>
where
    T: Send + 'static,
    F: FnOnce(&Progress<T>) -> KeywardResult<T> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    let progress = Progress { tx };
    let name = format!("keyward-{label}");
    let thread = thread::Builder::new().name(name).spawn(move || {
        let result = job(&progress);
        let _ = progress.tx.send(JobEvent::Finished(result));
    })?;
    debug!("spawned job {label}");

    Ok(JobHandle {
        label: label.to_string(),
        rx,
        thread: Some(thread),
    })
}

impl<T> JobHandle<T> {
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Next event, waiting at most `timeout`. `None` on timeout.
    pub fn poll(&self, timeout: Duration) -> Option<JobEvent<T>> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(JobEvent::Finished(Err(
                KeywardError::Provider(format!("job {} exited without a result", self.label)),
            ))),
        }
    }

    /// Block until the job finishes, forwarding progress lines to `on_progress`.
    pub fn wait_with(mut self, mut on_progress: impl FnMut(&str)) -> KeywardResult<T> {
        let outcome = loop {
            match self.rx.recv() {
                Ok(JobEvent::Progress(message)) => on_progress(&message),
                Ok(JobEvent::Finished(result)) => break result,
                Err(_) => {
                    break Err(KeywardError::Provider(format!(
                        "job {} exited without a result",
                        self.label
                    )))
                }
            }
        };
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                return Err(KeywardError::Provider(format!(
                    "job {} panicked",
                    self.label
                )));
            }
        }
        outcome
    }

    pub fn wait(self) -> KeywardResult<T> {
        self.wait_with(|_| {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_arrives_before_result() {
        let handle = spawn_job("format", |progress| {
            progress.report("writing header");
            progress.report("creating filesystem");
            Ok(42u32)
        })
        .unwrap();
        assert_eq!(handle.label(), "format");

        let mut seen = Vec::new();
        let value = handle.wait_with(|line| seen.push(line.to_string())).unwrap();
        assert_eq!(value, 42);
        assert_eq!(seen, vec!["writing header", "creating filesystem"]);
    }

    #[test]
    fn job_errors_are_returned() {
        let handle = spawn_job::<(), _>("unlock", |_| {
            Err(KeywardError::NoUsableKey {
                device: "/dev/sdb1".into(),
            })
        })
        .unwrap();
        assert!(matches!(
            handle.wait(),
            Err(KeywardError::NoUsableKey { .. })
        ));
    }

    #[test]
    fn panicking_job_reports_failure() {
        let handle = spawn_job::<(), _>("boom", |_| panic!("job blew up")).unwrap();
        let event = handle.poll(Duration::from_secs(5));
        assert!(matches!(event, Some(JobEvent::Finished(Err(_)))));
    }
}
