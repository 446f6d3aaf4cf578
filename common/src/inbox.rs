//! Bounded hand-off of remote lock commands into the hardware loop.
//!
//! The network side pushes without blocking and drops the newest command when
//! the queue is full; the hardware side drains at most one command per
//! iteration.

use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError, TrySendError};

use thiserror::Error;

use crate::types::LockCommand;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InboxError {
    #[error("command inbox full, dropped request (locked={})", .0.locked)]
    Full(LockCommand),
    #[error("command inbox closed")]
    Closed,
}

pub fn command_inbox(capacity: usize) -> (CommandSender, CommandReceiver) {
    let (tx, rx) = mpsc::sync_channel(capacity.max(1));
    (CommandSender { tx }, CommandReceiver { rx })
}

#[derive(Debug, Clone)]
pub struct CommandSender {
    tx: SyncSender<LockCommand>,
}

impl CommandSender {
    pub fn push(&self, command: LockCommand) -> Result<(), InboxError> {
        self.tx.try_send(command).map_err(|err| match err {
            TrySendError::Full(dropped) => InboxError::Full(dropped),
            TrySendError::Disconnected(_) => InboxError::Closed,
        })
    }
}

#[derive(Debug)]
pub struct CommandReceiver {
    rx: Receiver<LockCommand>,
}

impl CommandReceiver {
    pub fn poll(&self) -> Option<LockCommand> {
        match self.rx.try_recv() {
            Ok(command) => Some(command),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn overflow_keeps_oldest_commands() {
        let (sender, receiver) = command_inbox(5);

        let results: Vec<_> = [true, false, true, false, true, false]
            .into_iter()
            .map(|locked| sender.push(LockCommand::new(locked)))
            .collect();

        assert!(results[..5].iter().all(Result::is_ok));
        assert_eq!(results[5], Err(InboxError::Full(LockCommand::new(false))));

        let drained: Vec<bool> = std::iter::from_fn(|| receiver.poll())
            .map(|command| command.locked)
            .collect();
        assert_eq!(drained, vec![true, false, true, false, true]);
    }

    #[test]
    fn empty_inbox_polls_none() {
        let (_sender, receiver) = command_inbox(5);
        assert_eq!(receiver.poll(), None);
    }

    #[test]
    fn dropped_receiver_closes_the_inbox() {
        let (sender, receiver) = command_inbox(5);
        drop(receiver);

        assert_eq!(sender.push(LockCommand::new(true)), Err(InboxError::Closed));
    }

    #[test]
    fn commands_cross_threads_in_order() {
        let (sender, receiver) = command_inbox(5);

        let producer = thread::spawn(move || {
            for locked in [true, false, true] {
                sender.push(LockCommand::new(locked)).unwrap();
            }
        });
        producer.join().unwrap();

        assert_eq!(receiver.poll(), Some(LockCommand::new(true)));
        assert_eq!(receiver.poll(), Some(LockCommand::new(false)));
        assert_eq!(receiver.poll(), Some(LockCommand::new(true)));
        assert_eq!(receiver.poll(), None);
    }
}
