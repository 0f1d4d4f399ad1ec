//! Path-addressed access to a GraphQL response.

use serde::de::DeserializeOwned;
use serde_json_bytes::Value;

use crate::error::FieldAccessError;
use crate::graphql;
use crate::json_ext::Path;
use crate::json_ext::PathParseError;
use crate::json_ext::ValueExt;

/// A [`graphql::Response`] as seen by a client, with path-addressed field
/// access on top of the raw `data`/`errors` pair.
#[derive(Clone, Debug)]
pub struct ClientResponse {
    response: graphql::Response,
}

impl ClientResponse {
    pub(crate) fn new(response: graphql::Response) -> Self {
        ClientResponse { response }
    }

    /// Whether the response carries data. `false` means the request failed
    /// before execution could produce any, and [`errors`](Self::errors)
    /// says why.
    pub fn is_valid(&self) -> bool {
        self.response.is_valid()
    }

    /// The errors reported by the server, in response order.
    pub fn errors(&self) -> &[graphql::Error] {
        &self.response.errors
    }

    pub fn response(&self) -> &graphql::Response {
        &self.response
    }

    pub fn into_response(self) -> graphql::Response {
        self.response
    }

    /// Whether `path` is addressable in the response data. A field whose
    /// value is null exists; a missing key or an index past the end of a
    /// list does not.
    pub fn path_exists(&self, path: &str) -> Result<bool, PathParseError> {
        Ok(self.field(path)?.exists())
    }

    /// A view over the field at `path`, e.g. `"me.friends[1].name"`. Only
    /// malformed path syntax fails; an absent field is a field that
    /// [`exists`](ResponseField::exists) not.
    pub fn field(&self, path: &str) -> Result<ResponseField<'_>, PathParseError> {
        Ok(ResponseField::new(&self.response, path.parse()?))
    }

    /// Shorthand for [`field`](Self::field) followed by
    /// [`ResponseField::to_entity`].
    pub fn to_entity<T>(&self, path: &str) -> Result<T, FieldAccessError>
    where
        T: DeserializeOwned,
    {
        self.field(path)?.to_entity()
    }
}

/// A view over one field of a response.
///
/// The field may be absent, null or carry a value, and it may have errors
/// associated with it: errors whose path points at the field, at one of its
/// ancestors, or below it.
#[derive(Clone, Debug)]
pub struct ResponseField<'a> {
    response: &'a graphql::Response,
    path: Path,
    value: Option<&'a Value>,
    errors: Vec<&'a graphql::Error>,
}

impl<'a> ResponseField<'a> {
    fn new(response: &'a graphql::Response, path: Path) -> Self {
        let value = response
            .data
            .as_ref()
            .and_then(|data| data.get_at_path(&path));
        let errors = response
            .errors
            .iter()
            .filter(|error| {
                matches!(&error.path, Some(error_path)
                    if error_path.is_prefix_of(&path) || path.is_prefix_of(error_path))
            })
            .collect();
        ResponseField {
            response,
            path,
            value,
            errors,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the path is addressable in the data, a null value included.
    pub fn exists(&self) -> bool {
        self.value.is_some()
    }

    /// Whether the field holds a non-null value.
    pub fn has_value(&self) -> bool {
        matches!(self.value, Some(value) if !value.is_null())
    }

    /// The raw value at the path. `None` when the path is absent from the
    /// data; an explicit null is `Some(&Value::Null)`.
    pub fn value(&self) -> Option<&'a Value> {
        self.value
    }

    /// The first error associated with this field, if any.
    pub fn error(&self) -> Option<&'a graphql::Error> {
        self.errors.first().copied()
    }

    /// All errors associated with this field: errors whose path matches the
    /// field path, one of its ancestors, or a path nested below it.
    pub fn errors(&self) -> &[&'a graphql::Error] {
        &self.errors
    }

    /// Decodes the field value into `T`.
    ///
    /// A field without a value decodes from null, so an `Option<T>` target
    /// yields `None` — unless an associated error explains the missing
    /// value, in which case this fails with
    /// [`FieldAccessError::Unresolved`] carrying that error and the full
    /// response. A present value is decoded even when errors are associated
    /// with paths below the field.
    pub fn to_entity<T>(&self) -> Result<T, FieldAccessError>
    where
        T: DeserializeOwned,
    {
        match self.value {
            Some(value) if !value.is_null() => serde_json_bytes::from_value(value.clone())
                .map_err(|err| FieldAccessError::Decode {
                    response: self.response.clone(),
                    path: self.path.clone(),
                    reason: err.to_string(),
                }),
            _ => match self.error() {
                Some(error) => Err(FieldAccessError::Unresolved {
                    response: self.response.clone(),
                    path: self.path.clone(),
                    error: error.clone(),
                }),
                None => serde_json_bytes::from_value(Value::Null).map_err(|err| {
                    FieldAccessError::Decode {
                        response: self.response.clone(),
                        path: self.path.clone(),
                        reason: err.to_string(),
                    }
                }),
            },
        }
    }
}
