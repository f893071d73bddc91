use std::time::Duration;

use axum::{Router, routing::get};
use clap::Parser;
use hyper::{StatusCode, body::Incoming, service::service_fn};
use hyper_util::rt::{TokioExecutor, TokioIo};
use porthole::{ApplicationConfig, entrypoint};
use russh::{
    Channel, Disconnect,
    client::{Msg, Session},
};
use tokio::{
    net::TcpStream,
    time::{sleep, timeout},
};
use tower::Service;

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn session_teardown() {
    // 1. Initialize the gateway
    let config = ApplicationConfig::parse_from([
        "porthole",
        "--base-domain=foobar.tld",
        "--host-key",
        concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data/server_key"),
        "--listen-address=127.0.0.1",
        "--ssh-port=18222",
        "--http-port=18280",
    ]);
    tokio::spawn(async move { entrypoint(config).await });
    if timeout(Duration::from_secs(5), async {
        while TcpStream::connect("127.0.0.1:18222").await.is_err() {
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .is_err()
    {
        panic!("Timeout waiting for the gateway to start.")
    };

    // 2. Bind one explicit and one random subdomain on the same session
    let ssh_client = SshClient;
    let mut session = russh::client::connect(Default::default(), "127.0.0.1:18222", ssh_client)
        .await
        .expect("Failed to connect to SSH server");
    assert!(
        session
            .authenticate_none("tunneler")
            .await
            .expect("SSH authentication failed")
            .success(),
        "authentication didn't succeed"
    );
    let mut channel = session
        .channel_open_session()
        .await
        .expect("channel_open_session failed");
    channel
        .request_shell(true)
        .await
        .expect("request_shell failed");
    session
        .tcpip_forward("api", 80)
        .await
        .expect("tcpip_forward failed");
    // A bind address of "localhost" counts as no subdomain hint.
    session
        .tcpip_forward("localhost", 3000)
        .await
        .expect("tcpip_forward failed");

    // Pick the random domain out of the notification stream
    let regex =
        regex::Regex::new(r"^([a-z0-9]{10}\.foobar\.tld) forwarded to port 3000\r\n$").unwrap();
    let Ok(random_domain) = timeout(Duration::from_secs(3), async {
        while let Some(message) = channel.wait().await {
            match message {
                russh::ChannelMsg::Data { data } => {
                    let data =
                        String::from_utf8(data.to_vec()).expect("Invalid UTF-8 from message");
                    if let Some(captures) = regex.captures(&data) {
                        return captures.get(1).unwrap().as_str().to_string();
                    }
                }
                _ => continue,
            }
        }
        panic!("Unexpected end of channel");
    })
    .await
    else {
        panic!("Timed out waiting for subdomain allocation.");
    };

    assert_eq!(get_status("api.foobar.tld").await, StatusCode::OK);
    assert_eq!(get_status(&random_domain).await, StatusCode::OK);

    // 3. Closing the SSH connection removes every binding the session owned
    session
        .disconnect(Disconnect::ByApplication, "", "English")
        .await
        .expect("disconnect failed");
    let torn_down = timeout(Duration::from_secs(3), async {
        loop {
            if get_status("api.foobar.tld").await == StatusCode::NOT_IMPLEMENTED
                && get_status(&random_domain).await == StatusCode::NOT_IMPLEMENTED
            {
                break;
            }
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await;
    assert!(torn_down.is_ok(), "bindings should disappear on teardown");
}

async fn get_status(host: &str) -> StatusCode {
    let tcp_stream = TcpStream::connect("127.0.0.1:18280")
        .await
        .expect("TCP connection failed");
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tcp_stream))
        .await
        .expect("HTTP handshake failed");
    tokio::spawn(async move {
        if let Err(error) = conn.await {
            eprintln!("Connection failed: {error:?}");
        }
    });
    let request = hyper::Request::builder()
        .method("GET")
        .uri("/")
        .header("host", host)
        .body(http_body_util::Empty::<bytes::Bytes>::new())
        .unwrap();
    timeout(Duration::from_secs(5), sender.send_request(request))
        .await
        .expect("Timeout waiting for request to finish")
        .expect("Error sending HTTP request")
        .status()
}

struct SshClient;

impl russh::client::Handler for SshClient {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        _key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        _connected_address: &str,
        _connected_port: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let router = Router::new().route("/", get(async || "tunneled"));
        let service = service_fn(move |req: hyper::Request<Incoming>| router.clone().call(req));
        tokio::spawn(async move {
            hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                .serve_connection_with_upgrades(TokioIo::new(channel.into_stream()), service)
                .await
                .expect("Invalid request");
        });
        Ok(())
    }
}
