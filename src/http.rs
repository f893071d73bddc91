use std::{error::Error, net::SocketAddr, sync::Arc};

use axum::{body::Body as AxumBody, response::IntoResponse};
use hyper::{
    Request, Response, StatusCode,
    body::Body,
    header::{HOST, UPGRADE},
};
use hyper_util::rt::TokioIo;
use log::{info, warn};
use tokio::io::{AsyncRead, AsyncWrite, copy_bidirectional};

use crate::{error::ServerError, routing::RoutingTable, tunnel::TunnelHandler};

const X_FORWARDED_FOR: &str = "X-Forwarded-For";
const X_FORWARDED_HOST: &str = "X-Forwarded-Host";

// Front-door handler: route by the Host header into the owning tunnel and
// proxy the exchange over a freshly dialed SSH channel. Upstream failures
// surface as 502; a host with no tunnel yields 501.
pub(crate) async fn proxy_handler<B, H, T>(
    mut request: Request<B>,
    tcp_address: SocketAddr,
    routing: Arc<RoutingTable<Arc<H>>>,
) -> anyhow::Result<Response<AxumBody>>
where
    H: TunnelHandler<T>,
    T: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    B: Body + Send + 'static,
    <B as Body>::Data: Send + Sync + 'static,
    <B as Body>::Error: Error + Send + Sync + 'static,
{
    let host = request
        .headers()
        .get(HOST)
        .and_then(|header| header.to_str().ok())
        .and_then(|header| header.split(':').next())
        .unwrap_or_default()
        .to_owned();
    let Some(handler) = routing.get(&host) else {
        info!("No tunnel bound for host {host:?}");
        return Ok((StatusCode::NOT_IMPLEMENTED, "").into_response());
    };
    request.headers_mut().insert(
        X_FORWARDED_FOR,
        tcp_address.ip().to_string().parse().unwrap(),
    );
    request
        .headers_mut()
        .insert(X_FORWARDED_HOST, host.parse().unwrap());

    let io = match handler.tunneling_channel().await {
        Ok(io) => io,
        Err(error) => {
            warn!("Tunnel dial failed for {host}: {error}");
            return Ok((StatusCode::BAD_GATEWAY, "").into_response());
        }
    };
    let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
        Ok(handshake) => handshake,
        Err(error) => {
            warn!("Tunnel handshake failed for {host}: {error}");
            return Ok((StatusCode::BAD_GATEWAY, "").into_response());
        }
    };

    match request.headers().get(UPGRADE) {
        None => {
            tokio::spawn(async move {
                if let Err(error) = conn.await {
                    warn!("Tunnel connection failed: {error:?}");
                }
            });
            match sender.send_request(request).await {
                Ok(response) => Ok(response.into_response()),
                Err(error) => {
                    warn!("Proxied request failed for {host}: {error}");
                    Ok((StatusCode::BAD_GATEWAY, "").into_response())
                }
            }
        }

        Some(request_upgrade) => {
            tokio::spawn(async move {
                if let Err(error) = conn.with_upgrades().await {
                    warn!("Tunnel connection failed: {error:?}");
                }
            });
            let request_type = request_upgrade.to_str()?.to_string();
            let upgraded_request = hyper::upgrade::on(&mut request);
            let mut response = match sender.send_request(request).await {
                Ok(response) => response,
                Err(error) => {
                    warn!("Proxied request failed for {host}: {error}");
                    return Ok((StatusCode::BAD_GATEWAY, "").into_response());
                }
            };
            match response.status() {
                StatusCode::SWITCHING_PROTOCOLS => {
                    if request_type
                        == response
                            .headers()
                            .get(UPGRADE)
                            .ok_or(ServerError::MissingUpgradeHeader)?
                            .to_str()?
                    {
                        let upgraded_response = hyper::upgrade::on(&mut response).await?;
                        tokio::spawn(async move {
                            let Ok(upgraded_request) = upgraded_request.await else {
                                return;
                            };
                            let mut upgraded_request = TokioIo::new(upgraded_request);
                            let mut upgraded_response = TokioIo::new(upgraded_response);
                            let _ =
                                copy_bidirectional(&mut upgraded_response, &mut upgraded_request)
                                    .await;
                        });
                    }
                    Ok(response.into_response())
                }
                _ => Ok(response.into_response()),
            }
        }
    }
}
