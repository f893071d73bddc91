use std::{
    net::SocketAddr,
    sync::{Arc, atomic::Ordering},
};

use log::{debug, info, warn};
use russh::{
    Channel, ChannelId, MethodKind, MethodSet,
    keys::PublicKey,
    server::{Auth, Handler, Msg, Session},
};
use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    GatewayServer,
    sessions::{BindInfo, binding_line},
    tunnel::Tunnel,
};

// Task pumping notification lines into the interactive channel. It must not
// outlive its handler, so it is aborted on drop.
struct NotificationDrain {
    task: JoinHandle<()>,
}

impl Drop for NotificationDrain {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// Per-connection state for the SSH side of the gateway.
pub(crate) struct ServerHandler {
    // The unique id of this session.
    id: usize,
    // The IP and port of this connection.
    peer: SocketAddr,
    // The username from authentication, for logging.
    user: Option<String>,
    // Cancelling this token tears the session down.
    cancellation_token: CancellationToken,
    // ID of the open session channel, if any.
    channel_id: Option<ChannelId>,
    // Sender for notification lines shown on the interactive channel.
    tx: UnboundedSender<String>,
    rx: Option<UnboundedReceiver<String>>,
    // Drain task feeding the interactive channel. Initially None.
    notification_drain: Option<NotificationDrain>,
    // Reference to the shared gateway tables and configuration.
    server: Arc<GatewayServer>,
}

pub(crate) trait Server {
    fn new_client(
        &mut self,
        peer_address: SocketAddr,
        cancellation_token: CancellationToken,
    ) -> ServerHandler;
}

impl Server for Arc<GatewayServer> {
    // Create a new handler for an incoming SSH connection.
    fn new_client(
        &mut self,
        peer_address: SocketAddr,
        cancellation_token: CancellationToken,
    ) -> ServerHandler {
        let id = self.session_id.fetch_add(1, Ordering::AcqRel);
        info!("{peer_address} connected");
        let (tx, rx) = mpsc::unbounded_channel();
        ServerHandler {
            id,
            peer: peer_address,
            user: None,
            cancellation_token,
            channel_id: None,
            tx,
            rx: Some(rx),
            notification_drain: None,
            server: Arc::clone(self),
        }
    }
}

impl Handler for ServerHandler {
    type Error = russh::Error;

    // Accept everyone when no user table is configured; otherwise ask for
    // credentials.
    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        if self.server.users.is_none() {
            self.user = Some(user.into());
            info!("{} ({}) connected without authentication", user, self.peer);
            return Ok(Auth::Accept);
        }
        Ok(Auth::Reject {
            proceed_with_methods: Some(MethodSet::from(
                [MethodKind::Password, MethodKind::PublicKey].as_slice(),
            )),
            partial_success: false,
        })
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        let Some(ref users) = self.server.users else {
            self.user = Some(user.into());
            info!("{} ({}) connected without authentication", user, self.peer);
            return Ok(Auth::Accept);
        };
        if users.password_matches(user, password) {
            self.user = Some(user.into());
            info!("{} ({}) connected with password", user, self.peer);
            return Ok(Auth::Accept);
        }
        warn!("{} ({}) failed password authentication", user, self.peer);
        Ok(Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        })
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let Some(ref users) = self.server.users else {
            self.user = Some(user.into());
            info!("{} ({}) connected without authentication", user, self.peer);
            return Ok(Auth::Accept);
        };
        if users.key_matches(user, public_key) {
            self.user = Some(user.into());
            info!("{} ({}) connected with public key", user, self.peer);
            return Ok(Auth::Accept);
        }
        warn!("{} ({}) failed public key authentication", user, self.peer);
        Ok(Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        })
    }

    // Open the interactive channel and start draining notification lines
    // into it. Only the first session channel receives data.
    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(mut rx) = self.rx.take() else {
            return Ok(false);
        };
        self.channel_id = Some(channel.id());
        let cancellation_token = self.cancellation_token.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => break,
                    message = rx.recv() => {
                        let Some(message) = message else { break };
                        if channel
                            .data(format!("{message}\r\n").as_bytes())
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
        });
        self.notification_drain = Some(NotificationDrain { task });
        Ok(true)
    }

    // The interactive channel is informational only: report the current
    // bindings, then keep streaming notifications as they happen.
    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.channel_id.is_some_and(|channel_id| channel_id == channel) {
            let session_info = self
                .server
                .sessions
                .ensure(self.id, self.cancellation_token.clone());
            session_info.set_message_sink(self.tx.clone());
            for (domain, bind) in session_info.active_bindings() {
                let _ = self.tx.send(binding_line(&domain, &bind));
            }
            return session.channel_success(channel);
        }
        session.channel_failure(channel)
    }

    // Discard whatever the client types; stdin is not used for control.
    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.channel_id.is_some_and(|channel_id| channel_id == channel) {
            debug!("Discarding {} bytes of session input", data.len());
        }
        Ok(())
    }

    // The client closed its end; finish the interactive session cleanly.
    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.channel_id.is_some_and(|channel_id| channel_id == channel) {
            let _ = session.exit_status_request(channel, 0);
            let _ = session.close(channel);
        }
        Ok(())
    }

    // Handle a remote forwarding request: allocate a domain, install the
    // tunnel, record the binding, and notify the interactive session. The
    // positive reply is sent only after the route is visible.
    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if self.cancellation_token.is_cancelled() {
            return Ok(false);
        }
        let session_info = self
            .server
            .sessions
            .ensure(self.id, self.cancellation_token.clone());
        let bind = BindInfo {
            address: address.to_string(),
            port: *port,
        };
        // SSH clients tend to set "localhost" when no bind address was given.
        let subdomain = match bind.address.trim() {
            "" | "localhost" => None,
            hint => Some(hint),
        };
        let tunnel = Arc::new(Tunnel::new(session.handle(), bind.clone()));
        let domain = match self.server.routing.bind(subdomain, tunnel) {
            Ok(domain) => domain,
            Err(error) => {
                warn!("Refusing forwarding for {}: {}", self.peer, error);
                return Ok(false);
            }
        };
        if !session_info.add_binding(bind.clone(), domain.clone()) {
            // The session was torn down while we were binding.
            self.server.routing.remove(&domain);
            return Ok(false);
        }
        info!("Serving HTTP for {} ({})", domain, self.peer);
        session_info.send_message(binding_line(&domain, &bind));
        Ok(true)
    }

    // Handle closure of a remote forwarding request. An unknown binding is
    // logged but still acknowledged.
    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let session_info = self
            .server
            .sessions
            .ensure(self.id, self.cancellation_token.clone());
        let bind = BindInfo {
            address: address.to_string(),
            port,
        };
        match session_info.get_binding(&bind) {
            Some(domain) => {
                info!("Removing domain binding for {domain}");
                self.server.routing.remove(&domain);
                session_info.remove_binding(&bind);
            }
            None => {
                warn!(
                    "Cannot remove domain binding for {}: not found",
                    self.peer
                );
            }
        }
        Ok(true)
    }
}

impl Drop for ServerHandler {
    fn drop(&mut self) {
        let user = self.user.as_deref().unwrap_or("unknown");
        info!("{} ({}) disconnected", user, self.peer);
    }
}
