//! RPC endpoint descriptors.
//!
//! An [`Endpoint`] identifies one operation of one service. It is cheap to
//! clone and is used as a key by per-endpoint statistics and queue fairness.

use std::{
    collections::BTreeMap,
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};

use http::Method;
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};

use crate::error::{CallError, Result};

/// Characters escaped when a value is substituted into a path segment.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// One segment of a [`PathTemplate`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    /// Fixed text copied verbatim.
    Literal(String),
    /// Named placeholder filled from the request's path parameters.
    Param(String),
}

/// Parsed URL path template such as `/catalog/{id}/items`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathTemplate {
    segments: Vec<PathSegment>,
}

impl PathTemplate {
    /// Parses a template. Segments of the form `{name}` become parameters.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::InvalidRequest`] if a segment has an unbalanced
    /// brace or an empty parameter name.
    pub fn parse(template: &str) -> Result<Self> {
        let mut segments = Vec::new();
        for raw in template.split('/').filter(|s| !s.is_empty()) {
            let segment = match (raw.strip_prefix('{'), raw.ends_with('}')) {
                (Some(rest), true) => {
                    let name = &rest[..rest.len() - 1];
                    if name.is_empty() || name.contains(['{', '}']) {
                        return Err(CallError::InvalidRequest {
                            message: format!("invalid path parameter segment: {raw}"),
                        });
                    }
                    PathSegment::Param(name.to_owned())
                },
                (None, false) if !raw.contains(['{', '}']) => PathSegment::Literal(raw.to_owned()),
                _ => {
                    return Err(CallError::InvalidRequest {
                        message: format!("unbalanced braces in path segment: {raw}"),
                    });
                },
            };
            segments.push(segment);
        }
        Ok(Self { segments })
    }

    /// Returns the parsed segments.
    #[must_use]
    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    /// Renders the template, percent-encoding each parameter value.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::InvalidRequest`] if a parameter has no value.
    pub fn render(&self, params: &BTreeMap<String, String>) -> Result<String> {
        if self.segments.is_empty() {
            return Ok("/".to_owned());
        }
        let mut path = String::new();
        for segment in &self.segments {
            path.push('/');
            match segment {
                PathSegment::Literal(text) => path.push_str(text),
                PathSegment::Param(name) => {
                    let value = params.get(name).ok_or_else(|| CallError::InvalidRequest {
                        message: format!("missing path parameter: {name}"),
                    })?;
                    path.extend(utf8_percent_encode(value, PATH_SEGMENT));
                },
            }
        }
        Ok(path)
    }
}

impl fmt::Display for PathTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.segments {
            match segment {
                PathSegment::Literal(text) => write!(f, "/{text}")?,
                PathSegment::Param(name) => write!(f, "/{{{name}}}")?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq, Hash)]
struct EndpointInner {
    service: String,
    name: String,
    version: String,
    method: Method,
    path: PathTemplate,
}

/// Immutable descriptor of one RPC operation.
///
/// Equality and hashing cover every field, so two descriptors built from the
/// same values are interchangeable as map keys.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

impl Endpoint {
    /// Creates an endpoint from a parsed path template.
    pub fn new(
        service: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
        method: Method,
        path: PathTemplate,
    ) -> Self {
        Self {
            inner: Arc::new(EndpointInner {
                service: service.into(),
                name: name.into(),
                version: version.into(),
                method,
                path,
            }),
        }
    }

    /// Creates an endpoint, parsing `path` as a [`PathTemplate`].
    ///
    /// # Errors
    ///
    /// Returns [`CallError::InvalidRequest`] if the template is malformed.
    pub fn parse(
        service: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
        method: Method,
        path: &str,
    ) -> Result<Self> {
        Ok(Self::new(service, name, version, method, PathTemplate::parse(path)?))
    }

    /// Service name.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.inner.service
    }

    /// Endpoint (operation) name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Service version.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.inner.version
    }

    /// HTTP method.
    #[must_use]
    pub fn method(&self) -> &Method {
        &self.inner.method
    }

    /// Path template.
    #[must_use]
    pub fn path(&self) -> &PathTemplate {
        &self.inner.path
    }

    /// Renders the path for the given path parameters.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::InvalidRequest`] if a parameter has no value.
    pub fn render_path(&self, params: &BTreeMap<String, String>) -> Result<String> {
        self.inner.path.render(params)
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) || self.inner == other.inner
    }
}

impl Eq for Endpoint {}

impl Hash for Endpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.hash(state);
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("service", &self.inner.service)
            .field("name", &self.inner.name)
            .field("version", &self.inner.version)
            .field("method", &self.inner.method)
            .field("path", &self.inner.path.to_string())
            .finish()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.inner.service, self.inner.name)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())).collect()
    }

    #[test]
    fn test_parse_literal_and_params() {
        let template = PathTemplate::parse("/catalog/{id}/items").unwrap();
        assert_eq!(
            template.segments(),
            &[
                PathSegment::Literal("catalog".to_owned()),
                PathSegment::Param("id".to_owned()),
                PathSegment::Literal("items".to_owned()),
            ]
        );
        assert_eq!(template.to_string(), "/catalog/{id}/items");
    }

    #[test]
    fn test_parse_rejects_unbalanced_braces() {
        assert!(PathTemplate::parse("/catalog/{id").is_err());
        assert!(PathTemplate::parse("/catalog/id}").is_err());
        assert!(PathTemplate::parse("/catalog/{}").is_err());
        assert!(PathTemplate::parse("/a{b}c").is_err());
    }

    #[test]
    fn test_render_percent_encodes_values() {
        let template = PathTemplate::parse("/files/{name}").unwrap();
        let rendered = template.render(&params(&[("name", "a b/c?")])).unwrap();
        assert_eq!(rendered, "/files/a%20b%2Fc%3F");
    }

    #[test]
    fn test_render_missing_param() {
        let template = PathTemplate::parse("/files/{name}").unwrap();
        let err = template.render(&BTreeMap::new()).unwrap_err();
        assert!(matches!(err, CallError::InvalidRequest { .. }));
    }

    #[test]
    fn test_render_root() {
        let template = PathTemplate::parse("/").unwrap();
        assert_eq!(template.render(&BTreeMap::new()).unwrap(), "/");
    }

    #[test]
    fn test_endpoint_identity_by_value() {
        let a = Endpoint::parse("catalog", "getItem", "1.0", Method::GET, "/items/{id}").unwrap();
        let b = Endpoint::parse("catalog", "getItem", "1.0", Method::GET, "/items/{id}").unwrap();
        let c = Endpoint::parse("catalog", "getItem", "1.0", Method::POST, "/items/{id}").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);

        let set: HashSet<_> = [a.clone(), b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
        assert_eq!(a.to_string(), "catalog.getItem");
    }
}
