//! Child process plumbing: spawn with piped output, collate lines on
//! watcher threads, bounded wait, guaranteed termination

use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use common::*;
use crossbeam_channel::Receiver;

use crate::{TexConvError, TexConvResult};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// A spawned child whose stdout/stderr are pumped by watcher threads. The
/// child is killed when the handle drops without a completed wait
pub struct ProcessHandle {
    child: Option<Child>,
    lines: Receiver<(OutputStream, String)>,
}

fn watch(stream: impl Read + Send + 'static, which: OutputStream, tx: crossbeam_channel::Sender<(OutputStream, String)>) {
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        debug!("subprocess output"; "stream" => ?which, "line" => &line);
        if tx.send((which, line)).is_err() {
            break;
        }
    }
}

impl ProcessHandle {
    pub fn spawn(command: &mut Command) -> TexConvResult<Self> {
        let mut child = command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .spawn()?;

        let (tx, rx) = crossbeam_channel::unbounded();

        if let Some(stdout) = child.stdout.take() {
            let tx = tx.clone();
            std::thread::Builder::new()
                .name("texconv-stdout".to_owned())
                .spawn(move || watch(stdout, OutputStream::Stdout, tx))
                .map_err(TexConvError::Io)?;
        }
        if let Some(stderr) = child.stderr.take() {
            std::thread::Builder::new()
                .name("texconv-stderr".to_owned())
                .spawn(move || watch(stderr, OutputStream::Stderr, tx))
                .map_err(TexConvError::Io)?;
        }

        Ok(Self {
            child: Some(child),
            lines: rx,
        })
    }

    /// Collected output lines so far, in arrival order
    pub fn drain_output(&self) -> Vec<(OutputStream, String)> {
        self.lines.try_iter().collect()
    }

    /// Waits for exit, polling so the timeout can interrupt. On timeout the
    /// child is terminated and an error returned
    pub fn wait_with_timeout(&mut self, timeout: Duration) -> TexConvResult<ExitStatus> {
        let child = self.child.as_mut().ok_or(TexConvError::AlreadyFinished)?;
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(status) = child.try_wait()? {
                self.child = None;
                return Ok(status);
            }

            if Instant::now() >= deadline {
                warn!("subprocess timed out, terminating");
                self.terminate(Duration::ZERO);
                return Err(TexConvError::Timeout);
            }

            std::thread::sleep(Duration::from_millis(20));
        }
    }

    /// Hard-kills the child, after giving it `grace` to exit on its own
    pub fn terminate(&mut self, grace: Duration) {
        let mut child = match self.child.take() {
            Some(c) => c,
            None => return,
        };

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if matches!(child.try_wait(), Ok(Some(_))) {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        if let Err(e) = child.kill() {
            debug!("kill on exited subprocess"; "error" => %e);
        }
        let _ = child.wait();
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.terminate(Duration::ZERO);
    }
}
