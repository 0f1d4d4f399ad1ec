use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::ByteString;
use serde_json_bytes::Map as JsonMap;
use serde_json_bytes::Value;

use crate::graphql::Error;
use crate::json_ext::Object;

/// A GraphQL `Response` as returned by a server, carrying the result of
/// executing one request (or one event of a subscription).
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    /// The response data.
    ///
    /// Absent when the request failed before execution started; `null` when
    /// a field error propagated all the way to the operation root.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// The optional GraphQL errors encountered.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub errors: Vec<Error>,

    /// The optional GraphQL extensions.
    #[serde(skip_serializing_if = "Object::is_empty", default)]
    pub extensions: Object,
}

#[buildstructor::buildstructor]
impl Response {
    /// Constructs a new `Response` from the given attributes.
    #[builder(visibility = "pub")]
    fn new(
        data: Option<Value>,
        errors: Vec<Error>,
        // Skip the `Object` type alias in order to use buildstructor's map special-casing
        extensions: JsonMap<ByteString, Value>,
    ) -> Self {
        Self {
            data,
            errors,
            extensions,
        }
    }

    /// Constructs a `Response` from the supplied [`Bytes`], the way a
    /// transport decodes a payload received from a GraphQL server.
    ///
    /// Unknown top-level properties are dropped. A payload carrying neither
    /// `data` nor `errors` is rejected, as are errors without a `message`.
    pub fn from_bytes(b: Bytes) -> Result<Response, MalformedResponseError> {
        let value = Value::from_bytes(b).map_err(|error| MalformedResponseError {
            reason: error.to_string(),
        })?;
        let mut object = ensure_object!(value).map_err(|error| MalformedResponseError {
            reason: error.to_string(),
        })?;
        let data = object.remove("data");
        let errors = extract_key_value_from_object!(object, "errors", Value::Array(v) => v)
            .map_err(|err| MalformedResponseError {
                reason: format!("invalid `errors` property: {err}"),
            })?
            .into_iter()
            .flatten()
            .map(Error::from_value)
            .collect::<Result<Vec<Error>, MalformedResponseError>>()?;
        let extensions =
            extract_key_value_from_object!(object, "extensions", Value::Object(o) => o)
                .map_err(|err| MalformedResponseError {
                    reason: format!("invalid `extensions` property: {err}"),
                })?
                .unwrap_or_default();

        if data.is_none() && errors.is_empty() {
            return Err(MalformedResponseError {
                reason: "the response must contain `data` or `errors`".to_string(),
            });
        }

        Ok(Response {
            data,
            errors,
            extensions,
        })
    }

    /// Returns whether the request itself was executed: `data` is present
    /// and not `null`.
    ///
    /// When this returns `false` the request failed before or at the root of
    /// execution and [`Response::errors`] holds the reasons.
    pub fn is_valid(&self) -> bool {
        !matches!(self.data, None | Some(Value::Null))
    }
}

/// invalid GraphQL response: {reason}
#[derive(Clone, Debug, thiserror::Error, displaydoc::Display)]
pub struct MalformedResponseError {
    /// The reason the response could not be parsed.
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use serde_json_bytes::json as bjson;
    use test_log::test;

    use super::*;
    use crate::graphql::Location;
    use crate::json_ext::Path;

    #[test]
    fn test_from_bytes_parses_data_and_errors() {
        let response = Response::from_bytes(Bytes::from_static(
            br#"{
                "data": { "hero": { "name": null } },
                "errors": [{
                    "message": "name could not be fetched",
                    "locations": [{ "line": 2, "column": 5 }],
                    "path": ["hero", "name"],
                    "extensions": { "classification": "INTERNAL_ERROR" }
                }],
                "ignoredTopLevelProperty": true
            }"#,
        ))
        .expect("a valid payload");

        assert_eq!(response.data, Some(bjson!({ "hero": { "name": null } })));
        assert_eq!(
            response.errors,
            vec![
                Error::builder()
                    .message("name could not be fetched")
                    .location(Location { line: 2, column: 5 })
                    .path(Path::from_str("hero.name").unwrap())
                    .extension("classification", bjson!("INTERNAL_ERROR"))
                    .build()
            ]
        );
        assert!(response.is_valid());
    }

    #[test]
    fn test_from_bytes_rejects_empty_payload() {
        let err = Response::from_bytes(Bytes::from_static(b"{}")).unwrap_err();
        assert_eq!(
            err.reason,
            "the response must contain `data` or `errors`".to_string()
        );
    }

    #[test]
    fn test_from_bytes_rejects_invalid_errors() {
        let err =
            Response::from_bytes(Bytes::from_static(br#"{"errors": { "not": "an array" }}"#))
                .unwrap_err();
        assert!(err.reason.contains("invalid `errors` property"));
    }

    #[test]
    fn test_request_failures_are_not_valid() {
        let refused = Response::from_bytes(Bytes::from_static(
            br#"{"errors": [{ "message": "unknown operation" }]}"#,
        ))
        .expect("a valid payload");
        assert!(!refused.is_valid());

        let nulled = Response::builder().data(Value::Null).build();
        assert!(!nulled.is_valid());
    }

    #[test]
    fn test_serialization_omits_empty_fields() {
        let response = Response::builder().data(bjson!({ "me": null })).build();
        assert_eq!(
            serde_json::to_string(&response).unwrap(),
            r#"{"data":{"me":null}}"#
        );
    }
}
