use std::fmt;
use std::marker::PhantomData;

/// The interaction shape of an RPC method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallShape {
    /// One request, one response.
    Unary,
    /// One request, a stream of responses.
    ServerStreaming,
    /// A stream of requests, one response.
    ClientStreaming,
    /// Independent request and response streams.
    BidiStreaming,
}

impl CallShape {
    /// Whether the client sends more than one message.
    pub const fn is_client_stream(self) -> bool {
        matches!(self, CallShape::ClientStreaming | CallShape::BidiStreaming)
    }

    /// Whether the server sends more than one message.
    pub const fn is_server_stream(self) -> bool {
        matches!(self, CallShape::ServerStreaming | CallShape::BidiStreaming)
    }
}

/// Static identity of one RPC method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallDescriptor {
    /// Full method path, `{package}.{service}/{method}`.
    pub path: &'static str,
    pub shape: CallShape,
    /// Fully qualified request message name.
    pub request_type: &'static str,
    /// Fully qualified response message name.
    pub response_type: &'static str,
}

impl fmt::Display for CallDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path)
    }
}

/// A [`CallDescriptor`] bound to its Rust request and response types.
///
/// Defined once per method as a `const`:
///
/// ```ignore
/// pub const GET_PACKAGE_INFO: MethodDescriptor<GetPackageInfoRequest, GetPackageInfoResponse> =
///     MethodDescriptor::new(
///         "delivery.DeliveryService/GetPackageInfo",
///         CallShape::Unary,
///         "delivery.GetPackageInfoRequest",
///         "delivery.GetPackageInfoResponse",
///     );
/// ```
pub struct MethodDescriptor<Req, Resp> {
    descriptor: CallDescriptor,
    _marker: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp> MethodDescriptor<Req, Resp> {
    pub const fn new(
        path: &'static str,
        shape: CallShape,
        request_type: &'static str,
        response_type: &'static str,
    ) -> Self {
        Self {
            descriptor: CallDescriptor {
                path,
                shape,
                request_type,
                response_type,
            },
            _marker: PhantomData,
        }
    }

    pub const fn descriptor(&self) -> &CallDescriptor {
        &self.descriptor
    }

    pub const fn path(&self) -> &'static str {
        self.descriptor.path
    }

    pub const fn shape(&self) -> CallShape {
        self.descriptor.shape
    }
}

impl<Req, Resp> Clone for MethodDescriptor<Req, Resp> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Req, Resp> Copy for MethodDescriptor<Req, Resp> {}

impl<Req, Resp> fmt::Debug for MethodDescriptor<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MethodDescriptor")
            .field(&self.descriptor)
            .finish()
    }
}
