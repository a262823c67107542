use crate::codec::RpcMessage;
use crate::context::{ServicerContext, CLIENT_INACTIVE};
use crate::state::ServerRpcRead;
use std::fmt;
use std::marker::PhantomData;
use tonic::{Code, Status};
use tracing::error;

/// Responses produced by a streaming service implementation.
pub type ResponseStream<Resp> = Box<dyn Iterator<Item = Result<Resp, Status>> + Send>;

/// Box any iterator of responses into a [`ResponseStream`].
pub fn response_stream<Resp, I>(responses: I) -> ResponseStream<Resp>
where
    I: IntoIterator<Item = Result<Resp, Status>>,
    I::IntoIter: Send + 'static,
{
    Box::new(responses.into_iter())
}

/// Blocking iterator over the requests of a client-streaming call.
///
/// Ends when the client closes its request stream. If the client goes away
/// first, yields one `CANCELLED` error and then ends.
pub struct RequestIterator<Req> {
    context: ServicerContext,
    finished: bool,
    _req: PhantomData<fn() -> Req>,
}

impl<Req> RequestIterator<Req> {
    pub(crate) fn new(context: ServicerContext) -> Self {
        Self {
            context,
            finished: false,
            _req: PhantomData,
        }
    }
}

impl<Req: RpcMessage> Iterator for RequestIterator<Req> {
    type Item = Result<Req, Status>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.context.take_request() {
            ServerRpcRead::Request(request) => match Req::decode_message(request) {
                Ok(request) => Some(Ok(request)),
                Err(e) => {
                    self.finished = true;
                    let details = "Exception deserializing request!";
                    error!(call_id = %self.context.call_id(), error = %e, "{details}");
                    self.context.abort(Code::Unknown, details);
                    Some(Err(Status::unknown(details)))
                }
            },
            ServerRpcRead::NoMoreRequests => {
                self.finished = true;
                None
            }
            ServerRpcRead::Terminated => {
                self.finished = true;
                Some(Err(Status::cancelled(CLIENT_INACTIVE)))
            }
        }
    }
}

impl<Req> fmt::Debug for RequestIterator<Req> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestIterator")
            .field("call_id", &self.context.call_id())
            .field("finished", &self.finished)
            .finish()
    }
}
