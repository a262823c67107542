//! Method and service descriptions.
//!
//! Fixtures need to know the shape of every method they may see: its name and
//! whether each side of the call carries exactly one message or a stream.
//! Descriptors are plain values assembled by test setup (or derived from a
//! [`Router`](crate::Router)) and looked up by `(service, method)`.

use crate::error::FixtureError;
use std::collections::BTreeMap;
use std::fmt;

/// Which sides of a call are constrained to exactly one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cardinality {
    UnaryUnary,
    UnaryStream,
    StreamUnary,
    StreamStream,
}

impl Cardinality {
    pub fn from_unary_flags(request_is_unary: bool, response_is_unary: bool) -> Self {
        match (request_is_unary, response_is_unary) {
            (true, true) => Cardinality::UnaryUnary,
            (true, false) => Cardinality::UnaryStream,
            (false, true) => Cardinality::StreamUnary,
            (false, false) => Cardinality::StreamStream,
        }
    }

    pub fn request_is_unary(self) -> bool {
        matches!(self, Cardinality::UnaryUnary | Cardinality::UnaryStream)
    }

    pub fn response_is_unary(self) -> bool {
        matches!(self, Cardinality::UnaryUnary | Cardinality::StreamUnary)
    }
}

impl fmt::Display for Cardinality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Cardinality::UnaryUnary => "unary-unary",
            Cardinality::UnaryStream => "unary-stream",
            Cardinality::StreamUnary => "stream-unary",
            Cardinality::StreamStream => "stream-stream",
        })
    }
}

/// Shape of one method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub name: String,
    /// Free-form name of the request message type, used in logs.
    pub request_type: String,
    /// Free-form name of the response message type, used in logs.
    pub response_type: String,
    pub request_is_unary: bool,
    pub response_is_unary: bool,
}

impl MethodDescriptor {
    pub fn new(
        name: impl Into<String>,
        request_type: impl Into<String>,
        response_type: impl Into<String>,
        cardinality: Cardinality,
    ) -> Self {
        Self {
            name: name.into(),
            request_type: request_type.into(),
            response_type: response_type.into(),
            request_is_unary: cardinality.request_is_unary(),
            response_is_unary: cardinality.response_is_unary(),
        }
    }

    /// A descriptor whose message type names come from the Rust types.
    pub fn typed<Req, Resp>(name: impl Into<String>, cardinality: Cardinality) -> Self {
        Self::new(
            name,
            std::any::type_name::<Req>(),
            std::any::type_name::<Resp>(),
            cardinality,
        )
    }

    pub fn cardinality(&self) -> Cardinality {
        Cardinality::from_unary_flags(self.request_is_unary, self.response_is_unary)
    }
}

/// A named service and the methods it offers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub name: String,
    methods: Vec<MethodDescriptor>,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_method(mut self, method: MethodDescriptor) -> Self {
        self.add_method(method);
        self
    }

    /// Add a method, replacing any earlier method of the same name.
    pub fn add_method(&mut self, method: MethodDescriptor) -> &mut Self {
        self.methods.retain(|m| m.name != method.name);
        self.methods.push(method);
        self
    }

    pub fn method(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn methods(&self) -> &[MethodDescriptor] {
        &self.methods
    }
}

/// Registry of every service a fixture knows about.
#[derive(Debug, Clone, Default)]
pub struct Descriptors {
    services: BTreeMap<String, ServiceDescriptor>,
}

impl Descriptors {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_service(mut self, service: ServiceDescriptor) -> Self {
        self.add_service(service);
        self
    }

    /// Register a service. Methods of a service registered twice are merged.
    pub fn add_service(&mut self, service: ServiceDescriptor) -> &mut Self {
        match self.services.get_mut(&service.name) {
            Some(existing) => {
                for method in service.methods {
                    existing.add_method(method);
                }
            }
            None => {
                self.services.insert(service.name.clone(), service);
            }
        }
        self
    }

    pub fn add_method(&mut self, service: &str, method: MethodDescriptor) -> &mut Self {
        self.services
            .entry(service.to_string())
            .or_insert_with(|| ServiceDescriptor::new(service))
            .add_method(method);
        self
    }

    pub fn service(&self, name: &str) -> Option<&ServiceDescriptor> {
        self.services.get(name)
    }

    pub fn services(&self) -> impl Iterator<Item = &ServiceDescriptor> {
        self.services.values()
    }

    pub fn method(&self, service: &str, method: &str) -> Result<&MethodDescriptor, FixtureError> {
        self.services
            .get(service)
            .and_then(|s| s.method(method))
            .ok_or_else(|| FixtureError::MethodNotFound {
                service: service.to_string(),
                method: method.to_string(),
            })
    }

    /// Look up a method by its `/service/method` path.
    pub fn method_by_full_name(&self, full_name: &str) -> Result<&MethodDescriptor, FixtureError> {
        let (service, method) =
            split_full_method_name(full_name).ok_or_else(|| FixtureError::MethodNotFound {
                service: String::new(),
                method: full_name.to_string(),
            })?;
        self.method(service, method)
    }

    /// Fail unless `(service, method)` exists and has `expected` cardinality.
    pub fn expect_cardinality(
        &self,
        service: &str,
        method: &str,
        expected: Cardinality,
    ) -> Result<&MethodDescriptor, FixtureError> {
        let descriptor = self.method(service, method)?;
        let actual = descriptor.cardinality();
        if actual != expected {
            return Err(FixtureError::CardinalityMismatch {
                method: full_method_name(service, method),
                expected,
                actual,
            });
        }
        Ok(descriptor)
    }
}

/// `"/{service}/{method}"`, the path a channel invokes.
pub fn full_method_name(service: &str, method: &str) -> String {
    format!("/{service}/{method}")
}

/// Inverse of [`full_method_name`]. `None` unless the path has exactly the
/// `/service/method` shape with both parts non-empty.
pub fn split_full_method_name(full_name: &str) -> Option<(&str, &str)> {
    let (service, method) = full_name.strip_prefix('/')?.split_once('/')?;
    if service.is_empty() || method.is_empty() || method.contains('/') {
        return None;
    }
    Some((service, method))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_descriptors() -> Descriptors {
        Descriptors::new().with_service(
            ServiceDescriptor::new("test.Echo")
                .with_method(MethodDescriptor::new("Unary", "Req", "Resp", Cardinality::UnaryUnary))
                .with_method(MethodDescriptor::new("Chat", "Req", "Resp", Cardinality::StreamStream)),
        )
    }

    #[test]
    fn cardinality_round_trips_through_flags() {
        for cardinality in [
            Cardinality::UnaryUnary,
            Cardinality::UnaryStream,
            Cardinality::StreamUnary,
            Cardinality::StreamStream,
        ] {
            let rebuilt = Cardinality::from_unary_flags(
                cardinality.request_is_unary(),
                cardinality.response_is_unary(),
            );
            assert_eq!(rebuilt, cardinality);
        }
    }

    #[test]
    fn lookup_by_names_and_path() {
        let descriptors = echo_descriptors();
        let unary = descriptors.method("test.Echo", "Unary").unwrap();
        assert_eq!(unary.cardinality(), Cardinality::UnaryUnary);

        let chat = descriptors.method_by_full_name("/test.Echo/Chat").unwrap();
        assert!(!chat.request_is_unary);

        let err = descriptors.method("test.Echo", "Missing").unwrap_err();
        assert!(matches!(err, FixtureError::MethodNotFound { .. }));
        assert!(descriptors.method_by_full_name("test.Echo/Chat").is_err());
    }

    #[test]
    fn cardinality_expectation() {
        let descriptors = echo_descriptors();
        assert!(descriptors
            .expect_cardinality("test.Echo", "Unary", Cardinality::UnaryUnary)
            .is_ok());
        let err = descriptors
            .expect_cardinality("test.Echo", "Chat", Cardinality::UnaryStream)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "method /test.Echo/Chat is stream-stream, not unary-stream"
        );
    }

    #[test]
    fn services_merge_methods() {
        let mut descriptors = echo_descriptors();
        descriptors.add_method(
            "test.Echo",
            MethodDescriptor::typed::<u32, u32>("Count", Cardinality::UnaryStream),
        );
        let service = descriptors.service("test.Echo").unwrap();
        assert_eq!(service.methods().len(), 3);
        assert_eq!(service.method("Count").unwrap().request_type, "u32");
    }

    #[test]
    fn full_names() {
        assert_eq!(full_method_name("pkg.Svc", "Do"), "/pkg.Svc/Do");
        assert_eq!(split_full_method_name("/pkg.Svc/Do"), Some(("pkg.Svc", "Do")));
        assert_eq!(split_full_method_name("/pkg.Svc/"), None);
        assert_eq!(split_full_method_name("/a/b/c"), None);
        assert_eq!(split_full_method_name("pkg.Svc/Do"), None);
    }
}
