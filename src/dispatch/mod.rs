//! Routes accepted inbound messages to module handlers.
//!
//! Handlers are keyed by `(module, kind)`, the two halves of the message's
//! dotted handler key. A module may install the wildcard kind `"any"`; the
//! exact kind wins when both are present, and a message matching neither is
//! logged and dropped, never fatal. Handlers do not run inline: dispatch
//! submits them to the scheduler as tasks owned by the handling module, so
//! they execute during that module's phase.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{info, warn};

use crate::message::Message;
use crate::scheduler::{ModuleId, Scheduler, TimerOutcome};

/// The wildcard kind, matching any message for its module.
pub const ANY_KIND: &str = "any";

/// A module's message handler.
pub type Handler = Box<dyn FnMut(&Message) + Send>;

/// Whether a pre-handler consumed the message.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PreHandleOutcome {
    /// Pass the message on down the chain.
    Continue,
    /// The message is handled; do not invoke anything further.
    Handled,
}

/// A filter invoked ahead of a module's handler; may drop the message.
pub type PreHandler = Box<dyn FnMut(&Message) -> PreHandleOutcome + Send>;

/// What `handle` did with a message.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Dispatched {
    /// A handler task was queued; `wake` asks the caller to nudge the worker.
    Scheduled { wake: bool },
    /// No handler matched; the message was dropped.
    Unhandled,
}

#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<(ModuleId, String), Arc<Mutex<Handler>>>,
    pre_handlers: HashMap<ModuleId, Vec<Arc<Mutex<PreHandler>>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the handler for `(module, kind)`. Each pair has exactly one
    /// handler; a second registration replaces the first.
    pub fn register(
        &mut self,
        module: impl Into<ModuleId>,
        kind: impl Into<String>,
        handler: Handler,
    ) {
        let key = (module.into(), kind.into());
        if self
            .handlers
            .insert(key.clone(), Arc::new(Mutex::new(handler)))
            .is_some()
        {
            warn!("replacing handler for {}.{}", key.0, key.1);
        }
    }

    /// Installs a pre-handler for every message addressed to `module`,
    /// invoked before the real handler in registration order.
    pub fn register_pre_handler(&mut self, module: impl Into<ModuleId>, pre: PreHandler) {
        self.pre_handlers
            .entry(module.into())
            .or_default()
            .push(Arc::new(Mutex::new(pre)));
    }

    /// Looks up the handler for a message and queues it on the scheduler as
    /// a task owned by the handling module.
    pub fn handle(&self, msg: Message, scheduler: &mut Scheduler) -> Dispatched {
        let module = msg.module().to_string();
        let kind = msg.kind().to_string();

        let handler = self
            .handlers
            .get(&(module.clone(), kind.clone()))
            .or_else(|| self.handlers.get(&(module.clone(), ANY_KIND.to_string())));
        let handler = match handler {
            Some(handler) => Arc::clone(handler),
            None => {
                info!("no handler for message {}", msg.handler_key);
                return Dispatched::Unhandled;
            }
        };

        let chain: Vec<Arc<Mutex<PreHandler>>> = self
            .pre_handlers
            .get(&module)
            .map(|pres| pres.iter().map(Arc::clone).collect())
            .unwrap_or_default();

        let key = msg.handler_key.clone();
        let task = Box::new(move |_outcome: TimerOutcome| {
            for pre in &chain {
                let outcome = match pre.lock() {
                    Ok(mut pre) => pre(&msg),
                    Err(_) => {
                        warn!("pre-handler for {} is poisoned, skipping message", key);
                        return;
                    }
                };
                if outcome == PreHandleOutcome::Handled {
                    return;
                }
            }
            match handler.lock() {
                Ok(mut handler) => handler(&msg),
                Err(_) => warn!("handler for {} is poisoned, dropping message", key),
            }
        });

        match scheduler.schedule_now(module, task, true) {
            Ok(wake) => Dispatched::Scheduled { wake },
            Err(e) => {
                info!("dropping message: {}", e);
                Dispatched::Unhandled
            }
        }
    }
}
