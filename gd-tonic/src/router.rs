use crate::codec::RpcMessage;
use crate::context::ServicerContext;
use crate::descriptor::{full_method_name, Cardinality, Descriptors, MethodDescriptor};
use crate::error::FixtureError;
use crate::stream::{RequestIterator, ResponseStream};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tonic::Status;
use tracing::error;

pub(crate) type Responses = Box<dyn Iterator<Item = Result<Bytes, Status>> + Send>;

pub(crate) type UnaryUnaryHandler =
    Arc<dyn Fn(Bytes, &ServicerContext) -> Result<Bytes, Status> + Send + Sync + 'static>;
pub(crate) type UnaryStreamHandler =
    Arc<dyn Fn(Bytes, &ServicerContext) -> Result<Responses, Status> + Send + Sync + 'static>;
pub(crate) type StreamUnaryHandler =
    Arc<dyn Fn(&ServicerContext) -> Result<Bytes, Status> + Send + Sync + 'static>;
pub(crate) type StreamStreamHandler =
    Arc<dyn Fn(&ServicerContext) -> Result<Responses, Status> + Send + Sync + 'static>;

/// A registered implementation, tagged by cardinality. The tag decides how
/// the server composes request resolution and response driving.
#[derive(Clone)]
pub(crate) enum MethodHandler {
    UnaryUnary(UnaryUnaryHandler),
    UnaryStream(UnaryStreamHandler),
    StreamUnary(StreamUnaryHandler),
    StreamStream(StreamStreamHandler),
}

fn decode_request<Req: RpcMessage>(request: Bytes, context: &ServicerContext) -> Result<Req, Status> {
    Req::decode_message(request).map_err(|e| {
        let details = "Exception deserializing request!";
        error!(call_id = %context.call_id(), error = %e, "{details}");
        Status::unknown(details)
    })
}

fn encode_response<Resp: RpcMessage>(response: Resp) -> Result<Bytes, Status> {
    response.encode_message().map_err(|e| {
        let details = "Exception serializing response!";
        error!(error = %e, "{details}");
        Status::unknown(details)
    })
}

fn encode_responses<Resp: RpcMessage>(responses: ResponseStream<Resp>) -> Responses {
    Box::new(responses.map(|item| item.and_then(encode_response)))
}

/// Service implementations, keyed by `(service, method)`.
///
/// Registering a method also records its descriptor, so fixtures built from
/// a router know the shape of every method it serves.
#[derive(Clone, Default)]
pub struct Router {
    handlers: HashMap<String, MethodHandler>,
    descriptors: Descriptors,
}

impl Router {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a unary handler.
    ///
    /// Signature: `(Req, &ServicerContext) -> Result<Resp, Status>`.
    pub fn add_unary_unary<Req, Resp, F>(&mut self, service: &str, method: &str, handler: F) -> &mut Self
    where
        Req: RpcMessage,
        Resp: RpcMessage,
        F: Fn(Req, &ServicerContext) -> Result<Resp, Status> + Send + Sync + 'static,
    {
        let erased: UnaryUnaryHandler = Arc::new(move |request: Bytes, context: &ServicerContext| {
            let request = decode_request::<Req>(request, context)?;
            handler(request, context).and_then(encode_response)
        });
        self.insert::<Req, Resp>(service, method, Cardinality::UnaryUnary, MethodHandler::UnaryUnary(erased))
    }

    /// Register a server-streaming handler.
    ///
    /// Signature: `(Req, &ServicerContext) -> Result<ResponseStream<Resp>, Status>`.
    pub fn add_unary_stream<Req, Resp, F>(&mut self, service: &str, method: &str, handler: F) -> &mut Self
    where
        Req: RpcMessage,
        Resp: RpcMessage,
        F: Fn(Req, &ServicerContext) -> Result<ResponseStream<Resp>, Status> + Send + Sync + 'static,
    {
        let erased: UnaryStreamHandler = Arc::new(move |request: Bytes, context: &ServicerContext| {
            let request = decode_request::<Req>(request, context)?;
            handler(request, context).map(encode_responses)
        });
        self.insert::<Req, Resp>(service, method, Cardinality::UnaryStream, MethodHandler::UnaryStream(erased))
    }

    /// Register a client-streaming handler.
    ///
    /// Signature: `(RequestIterator<Req>, &ServicerContext) -> Result<Resp, Status>`.
    pub fn add_stream_unary<Req, Resp, F>(&mut self, service: &str, method: &str, handler: F) -> &mut Self
    where
        Req: RpcMessage,
        Resp: RpcMessage,
        F: Fn(RequestIterator<Req>, &ServicerContext) -> Result<Resp, Status> + Send + Sync + 'static,
    {
        let erased: StreamUnaryHandler = Arc::new(move |context: &ServicerContext| {
            handler(RequestIterator::new(context.clone()), context).and_then(encode_response)
        });
        self.insert::<Req, Resp>(service, method, Cardinality::StreamUnary, MethodHandler::StreamUnary(erased))
    }

    /// Register a bidirectional-streaming handler.
    ///
    /// Signature: `(RequestIterator<Req>, &ServicerContext) -> Result<ResponseStream<Resp>, Status>`.
    pub fn add_stream_stream<Req, Resp, F>(&mut self, service: &str, method: &str, handler: F) -> &mut Self
    where
        Req: RpcMessage,
        Resp: RpcMessage,
        F: Fn(RequestIterator<Req>, &ServicerContext) -> Result<ResponseStream<Resp>, Status>
            + Send
            + Sync
            + 'static,
    {
        let erased: StreamStreamHandler = Arc::new(move |context: &ServicerContext| {
            handler(RequestIterator::new(context.clone()), context).map(encode_responses)
        });
        self.insert::<Req, Resp>(service, method, Cardinality::StreamStream, MethodHandler::StreamStream(erased))
    }

    /// Take over every method of `other`, replacing same-named ones.
    pub fn merge(&mut self, other: Router) -> &mut Self {
        for service in other.descriptors.services() {
            for method in service.methods() {
                self.descriptors.add_method(&service.name, method.clone());
            }
        }
        self.handlers.extend(other.handlers);
        self
    }

    pub fn descriptors(&self) -> &Descriptors {
        &self.descriptors
    }

    /// Sorted `/service/method` paths of every registered method.
    pub fn list_methods(&self) -> Vec<String> {
        let mut v: Vec<_> = self.handlers.keys().cloned().collect();
        v.sort();
        v
    }

    pub(crate) fn handler(
        &self,
        service: &str,
        method: &str,
    ) -> Result<(&MethodDescriptor, &MethodHandler), FixtureError> {
        let descriptor = self.descriptors.method(service, method)?;
        let handler = self
            .handlers
            .get(&full_method_name(service, method))
            .ok_or_else(|| FixtureError::MethodNotFound {
                service: service.to_string(),
                method: method.to_string(),
            })?;
        Ok((descriptor, handler))
    }

    fn insert<Req, Resp>(
        &mut self,
        service: &str,
        method: &str,
        cardinality: Cardinality,
        handler: MethodHandler,
    ) -> &mut Self {
        self.descriptors
            .add_method(service, MethodDescriptor::typed::<Req, Resp>(method, cardinality));
        self.handlers.insert(full_method_name(service, method), handler);
        self
    }
}
