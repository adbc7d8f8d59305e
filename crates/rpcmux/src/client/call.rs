use prost::Message;
use std::fmt;
use tonic::Status;

use crate::session::{SessionHandle, StreamSender, Streaming};

/// Read the single response of a call and wait for its final status.
pub(crate) async fn single_response<Resp>(responses: &mut Streaming<Resp>) -> Result<Resp, Status>
where
    Resp: Message + Default,
{
    let response = responses
        .message()
        .await?
        .ok_or_else(|| Status::internal("call completed without a response"))?;
    match responses.message().await? {
        None => Ok(response),
        Some(_) => Err(Status::internal("call returned more than one response")),
    }
}

/// An open client-streaming call.
///
/// Send any number of requests, then [`close_and_recv`] to half-close and
/// wait for the single response. Dropping the call before it completes
/// cancels it.
///
/// [`close_and_recv`]: ClientStreamingCall::close_and_recv
pub struct ClientStreamingCall<Req, Resp> {
    requests: StreamSender<Req>,
    response: Streaming<Resp>,
}

impl<Req, Resp> ClientStreamingCall<Req, Resp> {
    pub(crate) fn new(requests: StreamSender<Req>, response: Streaming<Resp>) -> Self {
        Self { requests, response }
    }

    pub async fn send(&mut self, request: Req) -> Result<(), Status>
    where
        Req: Message,
    {
        self.requests.send(request).await
    }

    /// Half-close the request stream and wait for the response.
    ///
    /// The server may answer before it has read every request; the response
    /// is returned even when the half-close could not be delivered.
    pub async fn close_and_recv(mut self) -> Result<Resp, Status>
    where
        Resp: Message + Default,
    {
        if let Err(status) = self.requests.close().await {
            tracing::debug!(
                code = ?status.code(),
                message = status.message(),
                "Half-close failed, reading the response"
            );
        }
        single_response(&mut self.response).await
    }

    pub fn session(&self) -> SessionHandle {
        self.requests.session()
    }
}

impl<Req, Resp> fmt::Debug for ClientStreamingCall<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientStreamingCall")
            .field("requests", &self.requests)
            .finish()
    }
}

/// An open bidirectional-streaming call.
///
/// The two directions are independent. Use [`split`](BidiCall::split) to
/// drive them from separate tasks.
pub struct BidiCall<Req, Resp> {
    requests: StreamSender<Req>,
    responses: Streaming<Resp>,
}

impl<Req, Resp> BidiCall<Req, Resp> {
    pub(crate) fn new(requests: StreamSender<Req>, responses: Streaming<Resp>) -> Self {
        Self {
            requests,
            responses,
        }
    }

    pub async fn send(&mut self, request: Req) -> Result<(), Status>
    where
        Req: Message,
    {
        self.requests.send(request).await
    }

    /// Half-close the request direction. Responses keep flowing.
    pub async fn close_send(&mut self) -> Result<(), Status> {
        self.requests.close().await
    }

    /// Receive the next response; `Ok(None)` once the server finished.
    pub async fn message(&mut self) -> Result<Option<Resp>, Status>
    where
        Resp: Message + Default,
    {
        self.responses.message().await
    }

    pub fn split(self) -> (StreamSender<Req>, Streaming<Resp>) {
        (self.requests, self.responses)
    }

    pub fn session(&self) -> SessionHandle {
        self.requests.session()
    }
}

impl<Req, Resp> fmt::Debug for BidiCall<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BidiCall")
            .field("requests", &self.requests)
            .field("responses", &self.responses)
            .finish()
    }
}
