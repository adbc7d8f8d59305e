//! Messages and method descriptors of the `delivery` package.
//!
//! The message structs have the shape `prost-build` emits for
//! `delivery.proto`, with serde derives added for the HTTP gateway. JSON field
//! names are the snake_case protobuf field names.

use std::collections::HashMap;

use rpcmux::{CallShape, MethodDescriptor};
use serde::{Deserialize, Serialize};

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Package {
    #[prost(int32, tag = "1")]
    pub id: i32,
    #[prost(string, tag = "2")]
    pub description: String,
    #[prost(float, tag = "3")]
    pub weight_kg: f32,
    #[prost(string, optional, tag = "4")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fragile_note: Option<String>,
    #[prost(message, optional, tag = "5")]
    #[serde(with = "json_duration", skip_serializing_if = "Option::is_none")]
    pub estimated_delivery_duration: Option<::prost_types::Duration>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Person {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub address: String,
    #[prost(oneof = "person::ContactMethod", tags = "3, 4")]
    #[serde(flatten)]
    pub contact_method: Option<person::ContactMethod>,
    #[prost(message, optional, tag = "5")]
    #[serde(with = "json_timestamp", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<::prost_types::Timestamp>,
    #[prost(message, repeated, tag = "6")]
    pub packages: Vec<Package>,
    #[prost(map = "string, string", tag = "7")]
    pub metadata: HashMap<String, String>,
}

pub mod person {
    use serde::{Deserialize, Serialize};

    /// At most one way to reach the person.
    #[derive(Clone, PartialEq, Eq, ::prost::Oneof, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum ContactMethod {
        #[prost(string, tag = "3")]
        TelegramHandle(String),
        #[prost(string, tag = "4")]
        WhatsappNumber(String),
    }
}

#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct GetPackageInfoRequest {
    #[prost(int32, tag = "1")]
    pub id: i32,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct GetPackageInfoResponse {
    #[prost(message, optional, tag = "1")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package: Option<Package>,
}

#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct AddPackageResponse {
    #[prost(int32, tag = "1")]
    pub added_count: i32,
}

pub const SERVICE: &str = "delivery.DeliveryService";

pub const GET_PACKAGE_INFO: MethodDescriptor<GetPackageInfoRequest, GetPackageInfoResponse> =
    MethodDescriptor::new(
        "delivery.DeliveryService/GetPackageInfo",
        CallShape::Unary,
        "delivery.GetPackageInfoRequest",
        "delivery.GetPackageInfoResponse",
    );

pub const GET_NEW_PACKAGES: MethodDescriptor<GetPackageInfoRequest, Package> =
    MethodDescriptor::new(
        "delivery.DeliveryService/GetNewPackages",
        CallShape::ServerStreaming,
        "delivery.GetPackageInfoRequest",
        "delivery.Package",
    );

pub const ADD_PACKAGES: MethodDescriptor<Package, AddPackageResponse> = MethodDescriptor::new(
    "delivery.DeliveryService/AddPackages",
    CallShape::ClientStreaming,
    "delivery.Package",
    "delivery.AddPackageResponse",
);

pub const GET_PACKAGES: MethodDescriptor<GetPackageInfoRequest, GetPackageInfoResponse> =
    MethodDescriptor::new(
        "delivery.DeliveryService/GetPackages",
        CallShape::BidiStreaming,
        "delivery.GetPackageInfoRequest",
        "delivery.GetPackageInfoResponse",
    );

/// `google.protobuf.Duration` in its JSON form, e.g. `"32400s"`.
mod json_duration {
    use prost_types::Duration;
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.collect_str(duration),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|text| text.parse::<Duration>().map_err(de::Error::custom))
            .transpose()
    }
}

/// `google.protobuf.Timestamp` as an RFC 3339 string.
mod json_timestamp {
    use prost_types::Timestamp;
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(
        value: &Option<Timestamp>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(timestamp) => serializer.collect_str(timestamp),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Timestamp>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|text| text.parse::<Timestamp>().map_err(de::Error::custom))
            .transpose()
    }
}
