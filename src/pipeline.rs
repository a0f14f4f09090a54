//! Staged callbacks around a mutating operation.
//!
//! An operation owning a [`CallbackPipeline`] triggers it three times:
//! [`Checkpoint::Before`] ahead of validation, [`Checkpoint::Upon`] after
//! validation but ahead of persistence, and [`Checkpoint::After`] once the
//! change is committed. Handlers at the first two checkpoints can veto the
//! operation by returning [`Signal::Abort`]; at `After` nothing can be undone,
//! so aborts and failures there are only logged.
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Checkpoint {
    Before,
    Upon,
    After,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Continue,
    Abort(String),
}

/// A callback over the operation's context. Handlers may adjust the context
/// to influence the rest of the operation.
#[async_trait]
pub trait Handler<C: Send>: Send + Sync {
    async fn call(&self, ctx: &mut C) -> anyhow::Result<Signal>;
}

/// Adapts a plain closure into a [`Handler`].
pub struct FnHandler<F>(pub F);

impl<F> FnHandler<F> {
    pub fn new<C>(f: F) -> Self
    where
        F: Fn(&mut C) -> anyhow::Result<Signal>,
    {
        Self(f)
    }
}

#[async_trait]
impl<C, F> Handler<C> for FnHandler<F>
where
    C: Send,
    F: Fn(&mut C) -> anyhow::Result<Signal> + Send + Sync,
{
    async fn call(&self, ctx: &mut C) -> anyhow::Result<Signal> {
        (self.0)(ctx)
    }
}

type Registered<C> = Vec<(String, Arc<dyn Handler<C>>)>;

pub struct CallbackPipeline<C: Send> {
    before: Registered<C>,
    upon: Registered<C>,
    after: Registered<C>,
    disabled: bool,
}

impl Checkpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Checkpoint::Before => "before",
            Checkpoint::Upon => "upon",
            Checkpoint::After => "after",
        }
    }
}

impl<C: Send> Default for CallbackPipeline<C> {
    fn default() -> Self {
        Self {
            before: vec![],
            upon: vec![],
            after: vec![],
            disabled: false,
        }
    }
}

impl<C: Send> CallbackPipeline<C> {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, checkpoint: Checkpoint) -> &Registered<C> {
        match checkpoint {
            Checkpoint::Before => &self.before,
            Checkpoint::Upon => &self.upon,
            Checkpoint::After => &self.after,
        }
    }

    fn slot_mut(&mut self, checkpoint: Checkpoint) -> &mut Registered<C> {
        match checkpoint {
            Checkpoint::Before => &mut self.before,
            Checkpoint::Upon => &mut self.upon,
            Checkpoint::After => &mut self.after,
        }
    }

    /// Register `handler` under `key`. Keys are unique per checkpoint.
    pub fn add<H>(
        &mut self,
        checkpoint: Checkpoint,
        key: &str,
        handler: H,
    ) -> Result<(), PipelineError>
    where
        H: Handler<C> + 'static,
    {
        let slot = self.slot_mut(checkpoint);
        if slot.iter().any(|(k, _)| k == key) {
            return Err(PipelineError::DuplicateHandler(key.to_owned()));
        }
        slot.push((key.to_owned(), Arc::new(handler)));
        Ok(())
    }

    pub fn remove(&mut self, checkpoint: Checkpoint, key: &str) -> Result<(), PipelineError> {
        let slot = self.slot_mut(checkpoint);
        let Some(pos) = slot.iter().position(|(k, _)| k == key) else {
            return Err(PipelineError::HandlerNotFound(key.to_owned()));
        };
        slot.remove(pos);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.before.clear();
        self.upon.clear();
        self.after.clear();
    }

    pub fn set_disabled(&mut self, disabled: bool) {
        self.disabled = disabled;
    }

    pub fn len(&self, checkpoint: Checkpoint) -> usize {
        self.slot(checkpoint).len()
    }

    /// Run the handlers of `checkpoint` in registration order, awaiting each.
    ///
    /// At `Before`/`Upon` every handler runs even after a veto; the last veto
    /// is returned once the checkpoint is done. A failure stops the run
    /// immediately. At `After` every handler runs and nothing is returned.
    pub async fn trigger(&self, checkpoint: Checkpoint, ctx: &mut C) -> Result<(), PipelineError> {
        if self.disabled {
            return Ok(());
        }

        let mut veto = None;
        for (key, handler) in self.slot(checkpoint) {
            debug!(handler = %key, checkpoint = checkpoint.as_str(), "trigger callback");

            let outcome = handler.call(ctx).await;
            match (checkpoint, outcome) {
                (_, Ok(Signal::Continue)) => {}
                (Checkpoint::After, Ok(Signal::Abort(reason))) => {
                    error!(handler = %key, %reason, "abort signal received after commit, ignored");
                }
                (Checkpoint::After, Err(err)) => {
                    warn!(handler = %key, error = %err, "after handler failed");
                }
                (_, Ok(Signal::Abort(reason))) => {
                    debug!(handler = %key, %reason, "abort signal received");
                    veto = Some((key.clone(), reason));
                }
                (_, Err(source)) => {
                    return Err(PipelineError::HandlerFailed {
                        checkpoint: checkpoint.as_str(),
                        handler: key.clone(),
                        source,
                    });
                }
            }
        }

        match veto {
            Some((handler, reason)) => Err(PipelineError::Interrupted {
                checkpoint: checkpoint.as_str(),
                handler,
                reason,
            }),
            None => Ok(()),
        }
    }
}
