//! HTTP routes of the delivery service.
//!
//! | HTTP | RPC |
//! |---|---|
//! | `GET /v1/packages/{id}` | `GetPackageInfo` |
//! | `POST /v1/packages/lookup` with a `GetPackageInfoRequest` body | `GetPackageInfo` |
//! | `GET /v1/packages/{id}/new` | `GetNewPackages` |

use axum::http::Method;
use rpcmux::client::RpcClient;
use rpcmux::gateway::{BodyMapping, FieldKind, Gateway, GatewayConfig, GatewayError, GatewayRoute};

use crate::proto::{GET_NEW_PACKAGES, GET_PACKAGE_INFO};

pub fn routes() -> Result<Vec<GatewayRoute>, GatewayError> {
    Ok(vec![
        GatewayRoute::unary(Method::GET, "/v1/packages/{id}", &GET_PACKAGE_INFO)?
            .path_param("id", FieldKind::Integer),
        GatewayRoute::unary(Method::POST, "/v1/packages/lookup", &GET_PACKAGE_INFO)?
            .body(BodyMapping::Whole),
        GatewayRoute::server_streaming(Method::GET, "/v1/packages/{id}/new", &GET_NEW_PACKAGES)?
            .path_param("id", FieldKind::Integer),
    ])
}

/// A gateway serving every delivery route through `client`.
pub fn delivery_gateway(client: RpcClient, config: GatewayConfig) -> Result<Gateway, GatewayError> {
    routes()?
        .into_iter()
        .try_fold(Gateway::new(client, config), Gateway::route)
}
