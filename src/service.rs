//! The delivery service handlers.

use std::time::Duration;

use rpcmux::server::{Request, RpcServer};
use rpcmux::{RpcServerError, SessionHandle, Status, StreamSender, Streaming};
use tracing::{debug, info};

use crate::proto::{
    ADD_PACKAGES, AddPackageResponse, GET_NEW_PACKAGES, GET_PACKAGE_INFO, GET_PACKAGES,
    GetPackageInfoRequest, GetPackageInfoResponse, Package,
};

/// Packages sent by one `GetNewPackages` call.
pub const NEW_PACKAGES_PER_CALL: i32 = 3;

const DEFAULT_PACING: Duration = Duration::from_secs(1);

/// Serves `delivery.DeliveryService`.
///
/// The handlers are stateless. `pacing` is the pause between two streamed
/// `GetNewPackages` messages.
#[derive(Debug, Clone, Copy)]
pub struct DeliveryService {
    pacing: Duration,
}

impl Default for DeliveryService {
    fn default() -> Self {
        Self {
            pacing: DEFAULT_PACING,
        }
    }
}

impl DeliveryService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pacing(mut self, pacing: Duration) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn pacing(&self) -> Duration {
        self.pacing
    }

    /// Register the four methods on `server`.
    pub fn register(self, server: &mut RpcServer) -> Result<(), RpcServerError> {
        let pacing = self.pacing;
        server
            .unary(&GET_PACKAGE_INFO, |request| async move {
                Ok::<_, Status>(get_package_info(request.get_ref()))
            })?
            .server_streaming(&GET_NEW_PACKAGES, move |request, responses| {
                get_new_packages(request, responses, pacing)
            })?
            .client_streaming(&ADD_PACKAGES, add_packages)?
            .bidi_streaming(&GET_PACKAGES, get_packages)?;
        Ok(())
    }
}

fn get_package_info(request: &GetPackageInfoRequest) -> GetPackageInfoResponse {
    info!(id = request.id, "GetPackageInfo");
    GetPackageInfoResponse {
        package: Some(Package {
            id: request.id,
            description: "Sample package".to_owned(),
            weight_kg: 2.5,
            fragile_note: None,
            estimated_delivery_duration: Some(hours(9999)),
        }),
    }
}

async fn get_new_packages(
    request: Request<GetPackageInfoRequest>,
    mut responses: StreamSender<Package>,
    pacing: Duration,
) -> Result<(), Status> {
    let (request, session) = request.into_parts();
    info!(id = request.id, "GetNewPackages");

    for i in 1..=NEW_PACKAGES_PER_CALL {
        let id = request
            .id
            .checked_add(i)
            .ok_or_else(|| Status::invalid_argument("package id out of range"))?;
        responses
            .send(Package {
                id,
                description: "Streamed package".to_owned(),
                weight_kg: i as f32,
                fragile_note: None,
                estimated_delivery_duration: Some(minutes(i64::from(i) * 10)),
            })
            .await?;
        if i < NEW_PACKAGES_PER_CALL {
            pause(&session, pacing).await?;
        }
    }
    Ok(())
}

async fn add_packages(mut requests: Streaming<Package>) -> Result<AddPackageResponse, Status> {
    let mut added_count: i32 = 0;
    while let Some(package) = requests.message().await? {
        debug!(
            id = package.id,
            description = %package.description,
            weight_kg = package.weight_kg,
            "Received package"
        );
        added_count = added_count.saturating_add(1);
    }
    info!(added_count, "AddPackages");
    Ok(AddPackageResponse { added_count })
}

async fn get_packages(
    mut requests: Streaming<GetPackageInfoRequest>,
    mut responses: StreamSender<GetPackageInfoResponse>,
) -> Result<(), Status> {
    while let Some(request) = requests.message().await? {
        debug!(id = request.id, "GetPackages request");
        responses
            .send(GetPackageInfoResponse {
                package: Some(Package {
                    id: request.id,
                    description: "Bi-directional response".to_owned(),
                    weight_kg: 1.5,
                    fragile_note: None,
                    estimated_delivery_duration: Some(minutes(15)),
                }),
            })
            .await?;
    }
    Ok(())
}

/// Sleep for `pacing`, returning early if the call is cancelled.
async fn pause(session: &SessionHandle, pacing: Duration) -> Result<(), Status> {
    if pacing.is_zero() {
        return Ok(());
    }
    tokio::select! {
        _ = tokio::time::sleep(pacing) => Ok(()),
        _ = session.cancelled() => Err(Status::cancelled("call cancelled")),
    }
}

fn minutes(minutes: i64) -> prost_types::Duration {
    prost_types::Duration {
        seconds: minutes * 60,
        nanos: 0,
    }
}

fn hours(hours: i64) -> prost_types::Duration {
    minutes(hours * 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpcmux::client::{RpcClient, RpcClientConfig};
    use rpcmux::server::RpcServerConfig;
    use rpcmux::Code;

    fn connect(service: DeliveryService) -> RpcClient {
        let mut server = RpcServer::new(RpcServerConfig::default());
        service.register(&mut server).unwrap();
        let router = server.into_router();

        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move { router.serve_connection(server_io).await });
        RpcClient::from_io(client_io, RpcClientConfig::default())
    }

    fn package(id: i32) -> Package {
        Package {
            id,
            description: format!("Package {id}"),
            weight_kg: id as f32 * 1.1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_get_package_info() {
        let client = connect(DeliveryService::new());
        let response = client
            .unary(&GET_PACKAGE_INFO, GetPackageInfoRequest { id: 42 })
            .await
            .unwrap();
        let package = response.package.unwrap();
        assert_eq!(package.id, 42);
        assert_eq!(package.description, "Sample package");
        assert_eq!(package.weight_kg, 2.5);
        assert_eq!(package.fragile_note, None);
        assert_eq!(package.estimated_delivery_duration, Some(hours(9999)));
    }

    #[tokio::test]
    async fn test_get_package_info_rejects_invalid_id() {
        let client = connect(DeliveryService::new());
        let status = client
            .unary(&GET_PACKAGE_INFO, GetPackageInfoRequest { id: 0 })
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_get_new_packages_streams_in_order() {
        let client = connect(DeliveryService::new().with_pacing(Duration::ZERO));
        let mut stream = client
            .server_streaming(&GET_NEW_PACKAGES, GetPackageInfoRequest { id: 100 })
            .await
            .unwrap();

        let mut ids = Vec::new();
        while let Some(package) = stream.message().await.unwrap() {
            assert_eq!(package.description, "Streamed package");
            assert_eq!(package.weight_kg, (package.id - 100) as f32);
            ids.push(package.id);
        }
        assert_eq!(ids, vec![101, 102, 103]);
    }

    #[tokio::test]
    async fn test_get_new_packages_pacing() {
        let client = connect(DeliveryService::new().with_pacing(Duration::from_millis(50)));
        let started = tokio::time::Instant::now();
        let mut stream = client
            .server_streaming(&GET_NEW_PACKAGES, GetPackageInfoRequest { id: 1 })
            .await
            .unwrap();
        let mut count = 0;
        while stream.message().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 3);
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_get_new_packages_id_overflow() {
        let client = connect(DeliveryService::new().with_pacing(Duration::ZERO));
        let mut stream = client
            .server_streaming(&GET_NEW_PACKAGES, GetPackageInfoRequest { id: i32::MAX - 1 })
            .await
            .unwrap();
        assert_eq!(stream.message().await.unwrap().unwrap().id, i32::MAX);
        let status = stream.message().await.unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_add_packages_counts() {
        let client = connect(DeliveryService::new());
        let mut call = client.client_streaming(&ADD_PACKAGES).await.unwrap();
        for id in 1..=3 {
            call.send(package(id)).await.unwrap();
        }
        let response = call.close_and_recv().await.unwrap();
        assert_eq!(response.added_count, 3);
    }

    #[tokio::test]
    async fn test_add_packages_rejects_invalid_package() {
        let client = connect(DeliveryService::new());
        let mut call = client.client_streaming(&ADD_PACKAGES).await.unwrap();
        call.send(package(1)).await.unwrap();
        call.send(package(0)).await.unwrap();
        let status = call.close_and_recv().await.unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
        assert!(status.message().contains("id"));
    }

    #[tokio::test]
    async fn test_get_packages_echoes_each_request() {
        let client = connect(DeliveryService::new());
        let mut call = client.bidi_streaming(&GET_PACKAGES).await.unwrap();
        for id in [10, 20, 30] {
            call.send(GetPackageInfoRequest { id }).await.unwrap();
        }
        call.close_send().await.unwrap();

        let mut ids = Vec::new();
        while let Some(response) = call.message().await.unwrap() {
            let package = response.package.unwrap();
            assert_eq!(package.description, "Bi-directional response");
            assert_eq!(package.estimated_delivery_duration, Some(minutes(15)));
            ids.push(package.id);
        }
        assert_eq!(ids, vec![10, 20, 30]);
    }
}
