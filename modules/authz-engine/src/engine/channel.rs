//! The bounded command channel feeding the single-writer loop.
//!
//! Producers (concurrent RPC handlers) enqueue envelopes and await a
//! oneshot reply handle; the processor is the only consumer. Enqueueing
//! back-pressures when the channel is full. FIFO order is preserved.

use std::time::Instant;

use tokio::sync::{mpsc, oneshot};

use crate::domain::command::{Command, CommandOutcome};
use crate::domain::error::DomainError;

/// Caller-supplied context travelling with a command.
#[derive(Debug, Default)]
pub struct SubmitMeta {
    /// Acting user, when the transport knows one. Recorded in the audit
    /// log.
    pub actor: Option<String>,
    pub correlation_id: String,
    /// Raw wire payload, recorded verbatim in the audit log.
    pub payload: Vec<u8>,
    /// Commands still queued past this point are discarded with
    /// `Cancelled` instead of being executed.
    pub deadline: Option<Instant>,
}

/// One queued command plus its reply handle.
#[derive(Debug)]
pub struct Envelope {
    pub command: Command,
    pub meta: SubmitMeta,
    pub reply: oneshot::Sender<Result<CommandOutcome, DomainError>>,
}

/// Producer half of the command channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CommandSender {
    tx: mpsc::Sender<Envelope>,
}

impl CommandSender {
    /// Enqueue a command and wait for its result.
    ///
    /// # Errors
    /// `Shutdown` when the engine is no longer accepting or processing
    /// commands; otherwise whatever the command itself produced.
    pub async fn submit(
        &self,
        command: Command,
        meta: SubmitMeta,
    ) -> Result<CommandOutcome, DomainError> {
        let (reply, reply_rx) = oneshot::channel();
        self.tx
            .send(Envelope {
                command,
                meta,
                reply,
            })
            .await
            .map_err(|_| DomainError::Shutdown)?;
        reply_rx.await.map_err(|_| DomainError::Shutdown)?
    }
}

/// Create the channel pair. `capacity` is clamped to at least 1.
#[must_use]
pub fn command_channel(capacity: usize) -> (CommandSender, mpsc::Receiver<Envelope>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (CommandSender { tx }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn submit_delivers_in_fifo_order() {
        let (sender, mut rx) = command_channel(16);

        let s = sender.clone();
        let producer = tokio::spawn(async move {
            for name in ["a", "b", "c"] {
                let _ = s
                    .submit(
                        Command::CreateUser {
                            name: name.to_owned(),
                        },
                        SubmitMeta::default(),
                    )
                    .await;
            }
        });

        let mut seen = Vec::new();
        for _ in 0..3 {
            let envelope = rx.recv().await.unwrap();
            if let Command::CreateUser { name } = &envelope.command {
                seen.push(name.clone());
            }
            let _ = envelope.reply.send(Ok(CommandOutcome::Unit));
        }
        producer.await.unwrap();
        assert_eq!(seen, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn submit_after_close_is_shutdown() {
        let (sender, rx) = command_channel(1);
        drop(rx);
        let err = sender
            .submit(Command::HealthCheck, SubmitMeta::default())
            .await
            .unwrap_err();
        assert_eq!(err, DomainError::Shutdown);
    }

    #[tokio::test]
    async fn dropped_reply_is_shutdown() {
        let (sender, mut rx) = command_channel(1);
        let consumer = tokio::spawn(async move {
            let envelope = rx.recv().await.unwrap();
            drop(envelope.reply);
        });
        let err = sender
            .submit(Command::HealthCheck, SubmitMeta::default())
            .await
            .unwrap_err();
        consumer.await.unwrap();
        assert_eq!(err, DomainError::Shutdown);
    }
}
