use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use log::{debug, info};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::routing::RoutingTable;

// A client's declared forward request, as decoded from `tcpip-forward`.
// Doubles as the key identifying the binding within its session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct BindInfo {
    pub(crate) address: String,
    pub(crate) port: u32,
}

// Notification line shown to interactive sessions for a granted binding.
pub(crate) fn binding_line(domain: &str, bind: &BindInfo) -> String {
    format!("{} forwarded to port {}", domain, bind.port)
}

#[derive(Default)]
struct SessionInfoInner {
    // Bindings owned by this session, mapped to their granted domain.
    binds: HashMap<BindInfo, String>,
    // Sink for notification lines; None until an interactive channel opens.
    sink: Option<UnboundedSender<String>>,
    // Set by cleanup; no bindings may be recorded afterwards.
    closed: bool,
}

// Per-session state: the bindings the session owns plus an optional sink for
// pushing notification lines to the interactive channel.
#[derive(Default)]
pub(crate) struct SessionInfo {
    inner: Mutex<SessionInfoInner>,
}

impl SessionInfo {
    // Record a granted binding. Fails if the session has already been torn
    // down, in which case the caller must undo its routing insertion.
    #[must_use]
    pub(crate) fn add_binding(&self, bind: BindInfo, domain: String) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return false;
        }
        inner.binds.insert(bind, domain);
        true
    }

    pub(crate) fn get_binding(&self, bind: &BindInfo) -> Option<String> {
        self.inner.lock().unwrap().binds.get(bind).cloned()
    }

    pub(crate) fn remove_binding(&self, bind: &BindInfo) -> Option<String> {
        self.inner.lock().unwrap().binds.remove(bind)
    }

    // Snapshot of the session's bindings, domain first.
    pub(crate) fn active_bindings(&self) -> Vec<(String, BindInfo)> {
        self.inner
            .lock()
            .unwrap()
            .binds
            .iter()
            .map(|(bind, domain)| (domain.clone(), bind.clone()))
            .collect()
    }

    pub(crate) fn set_message_sink(&self, sink: UnboundedSender<String>) {
        self.inner.lock().unwrap().sink = Some(sink);
    }

    // Push a notification line to the interactive session, if one is
    // listening. A no-op otherwise.
    pub(crate) fn send_message(&self, message: String) {
        let inner = self.inner.lock().unwrap();
        if let Some(ref sink) = inner.sink {
            let _ = sink.send(message);
        }
    }

    // Remove every binding this session owns from the routing table. The
    // session mutex is held throughout and the routing lock is taken inside
    // it, matching the session-before-routing lock order.
    pub(crate) fn cleanup<H: Clone>(&self, routing: &RoutingTable<H>) {
        let mut inner = self.inner.lock().unwrap();
        for (_, domain) in inner.binds.drain() {
            info!("Removing domain binding for {domain}");
            routing.remove(&domain);
        }
        inner.sink = None;
        inner.closed = true;
    }
}

// Process-wide registry of live sessions, keyed by session id.
pub(crate) struct SessionRegistry<H> {
    sessions: Arc<Mutex<HashMap<usize, Arc<SessionInfo>>>>,
    routing: Arc<RoutingTable<H>>,
}

impl<H: Clone + Send + Sync + 'static> SessionRegistry<H> {
    pub(crate) fn new(routing: Arc<RoutingTable<H>>) -> Self {
        SessionRegistry {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            routing,
        }
    }

    // Idempotent: the first call for a session id creates its state and
    // spawns a watcher that tears everything down once the session's
    // cancellation signal fires.
    pub(crate) fn ensure(
        &self,
        id: usize,
        cancellation_token: CancellationToken,
    ) -> Arc<SessionInfo> {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(info) = sessions.get(&id) {
            return Arc::clone(info);
        }
        debug!("Creating session {id}");
        let info = Arc::new(SessionInfo::default());
        sessions.insert(id, Arc::clone(&info));
        let watched = Arc::clone(&info);
        let session_map = Arc::clone(&self.sessions);
        let routing = Arc::clone(&self.routing);
        tokio::spawn(async move {
            cancellation_token.cancelled().await;
            debug!("Closing session {id}");
            // The sessions lock is taken alone and released before the
            // session's own mutex.
            session_map.lock().unwrap().remove(&id);
            watched.cleanup(&routing);
        });
        info
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: usize) -> bool {
        self.sessions.lock().unwrap().contains_key(&id)
    }
}
