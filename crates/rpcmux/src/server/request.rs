use crate::session::SessionHandle;

/// A request message together with the call it arrived on.
#[derive(Debug)]
pub struct Request<T> {
    message: T,
    session: SessionHandle,
}

impl<T> Request<T> {
    pub(crate) fn new(message: T, session: SessionHandle) -> Self {
        Self { message, session }
    }

    pub fn get_ref(&self) -> &T {
        &self.message
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.message
    }

    pub fn into_inner(self) -> T {
        self.message
    }

    /// The call this request belongs to. Handlers use it to observe
    /// cancellation.
    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    pub fn into_parts(self) -> (T, SessionHandle) {
        (self.message, self.session)
    }
}
