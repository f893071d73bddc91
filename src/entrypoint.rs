use std::{
    net::SocketAddr,
    sync::{Arc, atomic::AtomicUsize},
    time::Duration,
};

use anyhow::Context;
use hyper::{Request, body::Incoming, server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use log::{debug, info, warn};
use russh::keys::{
    decode_secret_key,
    ssh_key::{LineEnding, private::Ed25519Keypair},
};
use tokio::{
    fs,
    net::{TcpListener, TcpStream},
};
use tokio_util::sync::CancellationToken;

use crate::{
    GatewayServer,
    config::ApplicationConfig,
    error::ServerError,
    http::proxy_handler,
    routing::RoutingTable,
    sessions::SessionRegistry,
    ssh::Server,
    users::UserStore,
};

// Main entrypoint of the application. Runs until interrupted; any startup
// failure is returned as an error.
pub async fn entrypoint(config: ApplicationConfig) -> anyhow::Result<()> {
    info!("Serving domains under {}", config.base_domain);

    let users = match config.users_file {
        Some(ref path) => {
            Some(UserStore::load(path).with_context(|| "Cannot load users file")?)
        }
        None => None,
    };

    // Find the host key, or create a new one.
    let key = match fs::read_to_string(config.host_key.as_path()).await {
        Ok(key) => decode_secret_key(&key, None).with_context(|| "Error decoding host key")?,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            info!("Host key file not found. Creating...");
            let key = russh::keys::PrivateKey::from(Ed25519Keypair::from_seed(&rand::random()));
            let key_string = key
                .to_openssh(LineEnding::LF)
                .with_context(|| "Error encoding host key")?;
            let parent = config
                .host_key
                .as_path()
                .parent()
                .ok_or(ServerError::InvalidKeyPath)
                .with_context(|| "Error parsing host key path")?;
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| "Error creating host key directory")?;
            }
            fs::write(config.host_key.as_path(), key_string.as_bytes())
                .await
                .with_context(|| "Error saving host key to filesystem")?;
            key
        }
        Err(error) => return Err(error).with_context(|| "Error reading host key"),
    };
    let ssh_config = Arc::new(russh::server::Config {
        inactivity_timeout: Some(Duration::from_secs(3600)),
        auth_rejection_time: Duration::from_secs(3),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        keys: vec![key],
        ..Default::default()
    });

    let routing = Arc::new(RoutingTable::new(config.base_domain.clone()));
    let mut server = Arc::new(GatewayServer {
        session_id: AtomicUsize::new(0),
        sessions: SessionRegistry::new(Arc::clone(&routing)),
        routing,
        users,
    });

    // HTTP front door.
    let http_listener = TcpListener::bind((config.listen_address, config.http_port))
        .await
        .with_context(|| "Error listening to HTTP port and address")?;
    info!(
        "Listening for HTTP connections on port {}",
        config.http_port
    );
    let http_routing = Arc::clone(&server.routing);
    tokio::spawn(async move {
        loop {
            let (stream, address) = match http_listener.accept().await {
                Ok(accepted) => accepted,
                Err(error) => {
                    warn!("Error accepting HTTP connection: {error}");
                    continue;
                }
            };
            let routing = Arc::clone(&http_routing);
            let service = service_fn(move |req: Request<Incoming>| {
                proxy_handler(req, address, Arc::clone(&routing))
            });
            let io = TokioIo::new(stream);
            tokio::spawn(async move {
                let conn = http1::Builder::new()
                    .serve_connection(io, service)
                    .with_upgrades();
                let _ = conn.await;
            });
        }
    });

    // SSH listener.
    let ssh_listener = TcpListener::bind((config.listen_address, config.ssh_port))
        .await
        .with_context(|| "Error listening to SSH port and address")?;
    info!("Listening for SSH connections on port {}", config.ssh_port);
    loop {
        tokio::select! {
            result = ssh_listener.accept() => {
                let (stream, address) = result.with_context(|| "Error accepting SSH connection")?;
                handle_ssh_connection(stream, address, Arc::clone(&ssh_config), &mut server);
            }
            _ = shutdown_signal() => {
                info!("Shutting down.");
                return Ok(());
            }
        }
    }
}

// Resolves once the process receives SIGINT or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let interrupt = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut terminate =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = interrupt => debug!("Interrupt received."),
            _ = terminate.recv() => debug!("Termination requested."),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = interrupt.await;
        debug!("Interrupt received.");
    }
}

fn handle_ssh_connection(
    stream: TcpStream,
    address: SocketAddr,
    config: Arc<russh::server::Config>,
    server: &mut Arc<GatewayServer>,
) {
    let cancellation_token = CancellationToken::new();
    let handler = server.new_client(address, cancellation_token.clone());
    tokio::spawn(async move {
        let mut session = match russh::server::run_stream(config, stream, handler).await {
            Ok(session) => session,
            Err(error) => {
                warn!("SSH connection setup failed: {error}");
                return;
            }
        };
        tokio::select! {
            result = &mut session => {
                if let Err(error) = result {
                    warn!("SSH connection closed ({address}): {error}");
                }
            }
            _ = cancellation_token.cancelled() => {
                info!("Disconnecting client {address}...");
                let _ = session
                    .handle()
                    .disconnect(russh::Disconnect::ByApplication, "".into(), "English".into())
                    .await;
            }
        }
        // The connection is over either way; fire the teardown watcher.
        cancellation_token.cancel();
    });
}
