//! Event handler registry and dispatch.
//!
//! Handlers are keyed by `(channel, event)` and kept in registration order.
//! Dispatch takes a snapshot of the matching handlers and releases the lock
//! before running any of them, so handlers may register, unregister or send
//! freely.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use eventwire_codec::Value;
use eventwire_transport::BoxFuture;
use tracing::{debug, trace};

/// Identifies one registration, for [`Dispatcher::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl HandlerId {
    pub fn get(self) -> u64 {
        self.0
    }
}

/// Conversion from a handler's return value to an optional ack reply.
///
/// `()` never replies; `Vec<Value>` always does; `Option<Vec<Value>>` decides
/// per call.
pub trait IntoReply {
    fn into_reply(self) -> Option<Vec<Value>>;
}

impl IntoReply for () {
    fn into_reply(self) -> Option<Vec<Value>> {
        None
    }
}

impl IntoReply for Vec<Value> {
    fn into_reply(self) -> Option<Vec<Value>> {
        Some(self)
    }
}

impl IntoReply for Option<Vec<Value>> {
    fn into_reply(self) -> Option<Vec<Value>> {
        self
    }
}

type SyncFn = dyn Fn(Vec<Value>) -> Option<Vec<Value>> + Send + Sync;
type AsyncFn = dyn Fn(Vec<Value>) -> BoxFuture<'static, Option<Vec<Value>>> + Send + Sync;

/// Sends an ack reply for the request being dispatched.
pub type ReplySender = Box<dyn FnOnce(Vec<Value>) + Send>;

/// A registered event handler.
#[derive(Clone)]
pub enum Handler {
    /// Runs inline on the reader loop.
    Sync(Arc<SyncFn>),
    /// Invoked inline; the returned future is spawned.
    Async(Arc<AsyncFn>),
}

impl Handler {
    pub fn sync<F, R>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> R + Send + Sync + 'static,
        R: IntoReply,
    {
        Handler::Sync(Arc::new(move |args: Vec<Value>| f(args).into_reply()))
    }

    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future + Send + 'static,
        Fut::Output: IntoReply,
    {
        Handler::Async(Arc::new(move |args: Vec<Value>| {
            let fut = f(args);
            Box::pin(async move { fut.await.into_reply() }) as BoxFuture<'static, Option<Vec<Value>>>
        }))
    }
}

type Key = (String, String);

#[derive(Default)]
pub struct Dispatcher {
    next_id: AtomicU64,
    handlers: Mutex<HashMap<Key, Vec<(HandlerId, Handler)>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Key, Vec<(HandlerId, Handler)>>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn on(&self, channel: &str, event: &str, handler: Handler) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.lock()
            .entry((channel.to_string(), event.to_string()))
            .or_default()
            .push((id, handler));
        debug!(channel, event, handler_id = id.0, "handler registered");
        id
    }

    /// Remove one registration. No-op (false) if it is not there.
    pub fn off(&self, channel: &str, event: &str, id: HandlerId) -> bool {
        let mut handlers = self.lock();
        let key = (channel.to_string(), event.to_string());
        let Some(list) = handlers.get_mut(&key) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(&key);
        }
        removed
    }

    /// Drop every registration on `channel`; returns how many were removed.
    pub fn remove_channel(&self, channel: &str) -> usize {
        let mut removed = 0;
        self.lock().retain(|(ch, _), list| {
            if ch == channel {
                removed += list.len();
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn handler_count(&self, channel: &str, event: &str) -> usize {
        self.lock()
            .get(&(channel.to_string(), event.to_string()))
            .map_or(0, Vec::len)
    }

    fn snapshot(&self, channel: &str, event: &str) -> Vec<Handler> {
        self.lock()
            .get(&(channel.to_string(), event.to_string()))
            .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default()
    }

    /// Run every handler for `(channel, event)` in registration order.
    ///
    /// Each handler gets its own copy of `args`. Only the first handler's
    /// reply goes to `reply`; async handlers reply when their future
    /// completes. Returns the number of handlers invoked.
    pub fn dispatch(
        &self,
        channel: &str,
        event: &str,
        args: Vec<Value>,
        reply: Option<ReplySender>,
    ) -> usize {
        let handlers = self.snapshot(channel, event);
        let count = handlers.len();
        trace!(channel, event, handlers = count, "dispatching");

        let mut reply = reply;
        for handler in handlers {
            let responder = reply.take();
            match handler {
                Handler::Sync(f) => {
                    if let (Some(responder), Some(payload)) = (responder, f(args.clone())) {
                        responder(payload);
                    }
                }
                Handler::Async(f) => {
                    let fut = f(args.clone());
                    tokio::spawn(async move {
                        if let (Some(responder), Some(payload)) = (responder, fut.await) {
                            responder(payload);
                        }
                    });
                }
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tokio::sync::oneshot;

    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Handler) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let make = {
            let log = log.clone();
            move |tag: &str| {
                let log = log.clone();
                let tag = tag.to_string();
                Handler::sync(move |args: Vec<Value>| {
                    log.lock().unwrap().push(format!("{tag}:{}", args.len()));
                })
            }
        };
        (log, make)
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let dispatcher = Dispatcher::new();
        let (log, make) = recorder();
        dispatcher.on("/", "tick", make("a"));
        dispatcher.on("/", "tick", make("b"));
        dispatcher.on("/other", "tick", make("c"));

        let invoked = dispatcher.dispatch("/", "tick", vec![Value::from(1)], None);
        assert_eq!(invoked, 2);
        assert_eq!(*log.lock().unwrap(), vec!["a:1", "b:1"]);
    }

    #[test]
    fn off_removes_only_that_registration() {
        let dispatcher = Dispatcher::new();
        let (log, make) = recorder();
        let first = dispatcher.on("/", "tick", make("a"));
        dispatcher.on("/", "tick", make("b"));
        assert!(dispatcher.off("/", "tick", first));
        assert!(!dispatcher.off("/", "tick", first));
        dispatcher.dispatch("/", "tick", Vec::new(), None);
        assert_eq!(*log.lock().unwrap(), vec!["b:0"]);
    }

    #[test]
    fn first_handler_reply_wins() {
        let dispatcher = Dispatcher::new();
        dispatcher.on("/", "ask", Handler::sync(|_args: Vec<Value>| vec![Value::from("first")]));
        dispatcher.on("/", "ask", Handler::sync(|_args: Vec<Value>| vec![Value::from("second")]));

        let replies = Arc::new(Mutex::new(Vec::new()));
        let sink = replies.clone();
        dispatcher.dispatch(
            "/",
            "ask",
            Vec::new(),
            Some(Box::new(move |payload| sink.lock().unwrap().push(payload))),
        );
        assert_eq!(*replies.lock().unwrap(), vec![vec![Value::from("first")]]);
    }

    #[test]
    fn no_handler_drops_request() {
        let dispatcher = Dispatcher::new();
        let called = Arc::new(Mutex::new(false));
        let flag = called.clone();
        let invoked = dispatcher.dispatch(
            "/",
            "nobody",
            Vec::new(),
            Some(Box::new(move |_| *flag.lock().unwrap() = true)),
        );
        assert_eq!(invoked, 0);
        assert!(!*called.lock().unwrap());
    }

    #[tokio::test]
    async fn async_handler_replies_when_done() {
        let dispatcher = Dispatcher::new();
        dispatcher.on(
            "/",
            "slow",
            Handler::from_async(|args: Vec<Value>| async move {
                tokio::task::yield_now().await;
                args
            }),
        );
        let (tx, rx) = oneshot::channel();
        dispatcher.dispatch(
            "/",
            "slow",
            vec![Value::from(7)],
            Some(Box::new(move |payload| {
                let _ = tx.send(payload);
            })),
        );
        assert_eq!(rx.await.unwrap(), vec![Value::from(7)]);
    }

    #[test]
    fn handlers_can_reenter_the_registry() {
        let dispatcher = Arc::new(Dispatcher::new());
        let inner = dispatcher.clone();
        dispatcher.on(
            "/",
            "grow",
            Handler::sync(move |_args: Vec<Value>| {
                inner.on("/", "grow", Handler::sync(|_args: Vec<Value>| ()));
            }),
        );
        dispatcher.dispatch("/", "grow", Vec::new(), None);
        assert_eq!(dispatcher.handler_count("/", "grow"), 2);
    }

    #[test]
    fn remove_channel_clears_all_events() {
        let dispatcher = Dispatcher::new();
        let (_log, make) = recorder();
        dispatcher.on("/chat", "a", make("x"));
        dispatcher.on("/chat", "b", make("y"));
        dispatcher.on("/", "a", make("z"));
        assert_eq!(dispatcher.remove_channel("/chat"), 2);
        assert_eq!(dispatcher.handler_count("/chat", "a"), 0);
        assert_eq!(dispatcher.handler_count("/", "a"), 1);
    }
}
