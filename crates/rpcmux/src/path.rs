use crate::error::RpcPathError;

/// A parsed RPC method path: `{package}.{service}/{method}`
///
/// Example: `delivery.DeliveryService/GetPackageInfo`
/// - `package`: `delivery`
/// - `service`: `DeliveryService`
/// - `method`: `GetPackageInfo`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodPath {
    pub package: String,
    pub service: String,
    pub method: String,
}

impl MethodPath {
    /// Parse a method path string.
    ///
    /// Expected format: `{package}.{service}/{method}`, optionally with a
    /// leading slash.
    pub fn parse(path: &str) -> Result<Self, RpcPathError> {
        let path = path.strip_prefix('/').unwrap_or(path);

        let (service_path, method) = path
            .rsplit_once('/')
            .ok_or_else(|| RpcPathError::Invalid(format!("method path must contain '/': '{path}'")))?;

        let (package, service) = service_path.rsplit_once('.').ok_or_else(|| {
            RpcPathError::Invalid(format!(
                "service path must contain package.service: '{service_path}'"
            ))
        })?;

        if package.is_empty() || service.is_empty() || method.is_empty() {
            return Err(RpcPathError::Invalid(format!(
                "package, service, and method must all be non-empty: '{path}'"
            )));
        }

        if method.contains('.') || service_path.contains('/') {
            return Err(RpcPathError::Invalid(format!(
                "method name must be a single identifier: '{path}'"
            )));
        }

        Ok(MethodPath {
            package: package.to_owned(),
            service: service.to_owned(),
            method: method.to_owned(),
        })
    }

    /// Returns the full service name: `{package}.{service}`
    pub fn full_service(&self) -> String {
        format!("{}.{}", self.package, self.service)
    }

    /// Returns the full method path: `{package}.{service}/{method}`
    pub fn full_path(&self) -> String {
        format!("{}.{}/{}", self.package, self.service, self.method)
    }
}
