//! Progress channel between an update run and its consumer.
//!
//! A multi-producer single-consumer queue of textual messages with two
//! terminal states: *finished* and *failed*. The consumer iterates lazily;
//! iteration ends when the queue drains past the terminal event, and a
//! recorded failure is yielded exactly once as the final item.

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::error::EngineError;

enum Event {
    Message(String),
    Finished,
    Failed(EngineError),
}

/// Producer half, cloned into every worker.
#[derive(Clone)]
pub struct ProgressSender {
    tx: Sender<Event>,
}

impl ProgressSender {
    /// Push a message. Dropped silently if the consumer went away.
    pub fn log(&self, message: impl Into<String>) {
        let _ = self.tx.send(Event::Message(message.into()));
    }

    pub(crate) fn finish(self) {
        let _ = self.tx.send(Event::Finished);
    }

    pub(crate) fn fail(self, error: EngineError) {
        let _ = self.tx.send(Event::Failed(error));
    }
}

/// Consumer half: an iterator over progress messages.
///
/// Yields `Ok(message)` for every progress message; if the run failed, the
/// last item is the `Err`. A clean run just stops after the last message.
pub struct Progress {
    rx: Receiver<Event>,
    done: bool,
}

impl Iterator for Progress {
    type Item = Result<String, EngineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.rx.recv() {
            Ok(Event::Message(message)) => Some(Ok(message)),
            Ok(Event::Failed(error)) => {
                self.done = true;
                Some(Err(error))
            }
            // A dropped sender without a terminal event means the run
            // thread is gone; treat it as end of stream.
            Ok(Event::Finished) | Err(_) => {
                self.done = true;
                None
            }
        }
    }
}

impl Progress {
    /// Drain all messages and return the run's outcome.
    pub fn wait(self) -> Result<(), EngineError> {
        for item in self {
            item?;
        }
        Ok(())
    }
}

pub(crate) fn channel() -> (ProgressSender, Progress) {
    let (tx, rx) = unbounded();
    (ProgressSender { tx }, Progress { rx, done: false })
}
