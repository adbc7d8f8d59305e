//! Client-side types.
//!
//! An `RpcClient` owns one connection and multiplexes any number of
//! concurrent calls over it.
//!
//! # Example
//!
//! ```ignore
//! use rpcmux::client::{RpcClient, RpcClientConfig};
//!
//! let client = RpcClient::connect(RpcClientConfig::new("127.0.0.1:50051")).await?;
//!
//! // Unary
//! let info = client.unary(&GET_PACKAGE_INFO, GetPackageInfoRequest { id: 1 }).await?;
//!
//! // Server-streaming
//! let mut packages = client.server_streaming(&GET_NEW_PACKAGES, request).await?;
//! while let Some(package) = packages.message().await? {
//!     println!("{package:?}");
//! }
//!
//! // Bidi, with each direction on its own task
//! let (mut requests, mut responses) = client.bidi_streaming(&GET_PACKAGES).await?.split();
//! tokio::spawn(async move {
//!     requests.send(request).await?;
//!     requests.close().await
//! });
//! while let Some(response) = responses.message().await? {
//!     println!("{response:?}");
//! }
//! ```

mod call;
mod config;
mod rpc_client;

pub use call::{BidiCall, ClientStreamingCall};
pub use config::RpcClientConfig;
pub use rpc_client::RpcClient;
