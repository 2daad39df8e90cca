//! Settlement of peek-locked deliveries.
//!
//! A [`LockControl`] is bound to the envelope one received message was
//! deserialized from. Completing, abandoning or rejecting it is single-use:
//! after the first successful settlement every further operation fails with
//! `AlreadyProcessed`. Renewing the lock can be repeated until then.
//!
//! All controls obtained for the same message share their settlement state.

use std::sync::Arc;

use tracing_error::SpanTrace;

use crate::{
    LockToken,
    association::AssociationTable,
    transport::{LockSession, TransportError},
};

/// Hands out lock controls for received messages.
#[derive(Clone)]
pub struct LockControlProvider {
    associations: Arc<AssociationTable>,
}

impl LockControlProvider {
    pub(crate) fn new(associations: Arc<AssociationTable>) -> Self {
        Self { associations }
    }

    /// Lock control of a message produced by a peek-lock source.
    pub fn control_for<L: ?Sized>(&self, message: &L) -> Result<LockControl, LockControlError> {
        let association = self
            .associations
            .get(message)
            .ok_or_else(|| LockControlError::new(LockControlErrorKind::NotAssociated))?;

        let (Some(session), Some(token)) = (
            association.session,
            association.envelope.headers.lock_token.clone(),
        ) else {
            return Err(LockControlError::new(LockControlErrorKind::NotPeekLock));
        };

        Ok(LockControl {
            session,
            token,
            processed: association.processed,
        })
    }
}

/// Single-use settlement handle of one delivery.
pub struct LockControl {
    session: Arc<dyn LockSession>,
    token: LockToken,
    processed: Arc<tokio::sync::Mutex<bool>>,
}

enum Settlement<'a> {
    Complete,
    Abandon,
    Reject {
        reason_code: &'a str,
        description: &'a str,
    },
}

impl LockControl {
    /// Remove the delivery from its entity.
    pub async fn complete(&self) -> Result<(), LockControlError> {
        self.settle(Settlement::Complete).await
    }

    /// Release the lock so the delivery can be received again.
    pub async fn abandon(&self) -> Result<(), LockControlError> {
        self.settle(Settlement::Abandon).await
    }

    /// Move the delivery to the dead-letter queue.
    pub async fn reject(&self, reason_code: &str, description: &str) -> Result<(), LockControlError> {
        self.settle(Settlement::Reject {
            reason_code,
            description,
        })
        .await
    }

    /// Extend the lock. Does not consume the control.
    pub async fn renew_lock(&self) -> Result<(), LockControlError> {
        let processed = self.processed.lock().await;
        if *processed {
            return Err(LockControlError::new(LockControlErrorKind::AlreadyProcessed));
        }

        self.session.renew_lock(&self.token).await?;
        Ok(())
    }

    pub fn lock_token(&self) -> &LockToken {
        &self.token
    }

    #[tracing::instrument(skip_all, fields(lock_token = %self.token))]
    async fn settle(&self, settlement: Settlement<'_>) -> Result<(), LockControlError> {
        let mut processed = self.processed.lock().await;
        if *processed {
            return Err(LockControlError::new(LockControlErrorKind::AlreadyProcessed));
        }

        match settlement {
            Settlement::Complete => self.session.complete(&self.token).await?,
            Settlement::Abandon => self.session.abandon(&self.token).await?,
            Settlement::Reject {
                reason_code,
                description,
            } => {
                self.session
                    .dead_letter(&self.token, reason_code, description)
                    .await?
            }
        }

        *processed = true;
        tracing::debug!("Delivery settled");
        Ok(())
    }
}

/// Error returned by lock control operations.
#[derive(Debug)]
pub struct LockControlError {
    context: SpanTrace,
    kind: LockControlErrorKind,
}

/// Lock control error kinds.
#[derive(Debug)]
pub enum LockControlErrorKind {
    /// The delivery was already completed, abandoned or rejected.
    AlreadyProcessed,
    /// The message was not produced by a source, or has been dropped.
    NotAssociated,
    /// The message was received without a lock.
    NotPeekLock,
    Transport(TransportError),
}

impl LockControlError {
    fn new(kind: LockControlErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub fn kind(&self) -> &LockControlErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for LockControlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            LockControlErrorKind::AlreadyProcessed => writeln!(
                f,
                "Already processed: the message has already been abandoned, completed or rejected"
            ),
            LockControlErrorKind::NotAssociated => {
                writeln!(f, "Not associated: the message was not received from a source")
            }
            LockControlErrorKind::NotPeekLock => {
                writeln!(f, "Not peek-locked: the message was received without a lock")
            }
            LockControlErrorKind::Transport(err) => writeln!(f, "Transport error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for LockControlError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            LockControlErrorKind::Transport(err) => Some(err),
            _ => None,
        }
    }
}

impl From<TransportError> for LockControlError {
    fn from(err: TransportError) -> Self {
        Self::new(LockControlErrorKind::Transport(err))
    }
}
