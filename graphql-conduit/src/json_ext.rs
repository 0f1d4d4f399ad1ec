//! Addressing values inside GraphQL response data.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use serde::Serializer;
use serde::de;
use serde::de::Deserializer;
use serde_json_bytes::ByteString;
use serde_json_bytes::Map;
use serde_json_bytes::Value;

/// A JSON object as found in GraphQL requests and responses.
pub type Object = Map<ByteString, Value>;

/// Extract a JSON property from an object, removing it from the object.
///
/// The single-key form yields `Option<Value>`, treating `null` as absent.
/// The pattern form additionally requires the value to match the given
/// pattern and yields `Result<Option<_>, &'static str>`.
#[macro_export]
macro_rules! extract_key_value_from_object {
    ($object:expr, $key:literal, $pattern:pat => $var:expr) => {{
        match $object.remove($key) {
            Some(serde_json_bytes::Value::Null) | None => Ok(None),
            Some($pattern) => Ok(Some($var)),
            _ => Err(concat!("invalid type for key: ", $key)),
        }
    }};
    ($object:expr, $key:literal) => {{
        match $object.remove($key) {
            Some(serde_json_bytes::Value::Null) | None => None,
            Some(value) => Some(value),
        }
    }};
}

/// Assert that a JSON value is an object, and obtain a mutable handle to it.
#[macro_export]
macro_rules! ensure_object {
    ($value:expr) => {{
        match $value {
            serde_json_bytes::Value::Object(o) => Ok(o),
            _ => Err("invalid type, expected an object"),
        }
    }};
}

/// One segment of a [`Path`].
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum PathElement {
    /// An object member, addressed by key.
    Key(String),
    /// A list element, addressed by zero-based index.
    Index(usize),
}

impl Serialize for PathElement {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            PathElement::Key(key) => serializer.serialize_str(key),
            PathElement::Index(index) => serializer.serialize_u64(*index as u64),
        }
    }
}

impl<'de> Deserialize<'de> for PathElement {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(PathElementVisitor)
    }
}

struct PathElementVisitor;

impl de::Visitor<'_> for PathElementVisitor {
    type Value = PathElement;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a string key or an unsigned integer index")
    }

    fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(PathElement::Key(value.to_string()))
    }

    fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(PathElement::Index(value as usize))
    }

    fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        usize::try_from(value)
            .map(PathElement::Index)
            .map_err(|_| E::custom("path index cannot be negative"))
    }
}

/// A path addressing one value inside GraphQL response data, written in
/// dot/bracket form: `friends[1].name` is the `name` member of the second
/// element of the `friends` list.
///
/// Serialized as the GraphQL response-path array (`["friends", 1, "name"]`),
/// the representation servers use in `errors[].path`.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Path(pub Vec<PathElement>);

impl Path {
    /// The empty path, addressing the response data root.
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// A single-key path addressing a top-level field.
    pub fn from_key(key: impl Into<String>) -> Self {
        Self(vec![PathElement::Key(key.into())])
    }

    pub fn iter(&self) -> impl Iterator<Item = &PathElement> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether `self` addresses `other` or one of its ancestors.
    pub fn is_prefix_of(&self, other: &Path) -> bool {
        other.0.starts_with(&self.0)
    }
}

impl FromIterator<PathElement> for Path {
    fn from_iter<T: IntoIterator<Item = PathElement>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (position, element) in self.0.iter().enumerate() {
            match element {
                PathElement::Key(key) => {
                    if position > 0 {
                        f.write_str(".")?;
                    }
                    f.write_str(key)?;
                }
                PathElement::Index(index) => write!(f, "[{index}]")?,
            }
        }
        Ok(())
    }
}

/// Error produced when a dot/bracket path cannot be parsed.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error, displaydoc::Display)]
pub enum PathParseError {
    /// empty key at offset {offset}
    EmptyKey { offset: usize },
    /// invalid list index at offset {offset}
    InvalidIndex { offset: usize },
    /// unterminated list index at offset {offset}
    UnterminatedIndex { offset: usize },
    /// unexpected character '{character}' at offset {offset}
    UnexpectedCharacter { character: char, offset: usize },
}

impl FromStr for Path {
    type Err = PathParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        if input.is_empty() {
            return Err(PathParseError::EmptyKey { offset: 0 });
        }

        // The delimiters are all single-byte, so scanning bytes is UTF-8 safe.
        let bytes = input.as_bytes();
        let mut elements = Vec::new();
        let mut expect_key = true;
        let mut i = 0;
        while i < bytes.len() {
            match bytes[i] {
                b'.' => {
                    if expect_key {
                        return Err(PathParseError::EmptyKey { offset: i });
                    }
                    i += 1;
                    expect_key = true;
                }
                b'[' => {
                    if expect_key {
                        return Err(PathParseError::UnexpectedCharacter {
                            character: '[',
                            offset: i,
                        });
                    }
                    let start = i + 1;
                    let mut end = start;
                    while end < bytes.len() && bytes[end].is_ascii_digit() {
                        end += 1;
                    }
                    if end == bytes.len() {
                        return Err(PathParseError::UnterminatedIndex { offset: i });
                    }
                    if end == start || bytes[end] != b']' {
                        return Err(PathParseError::InvalidIndex { offset: start });
                    }
                    let index = input[start..end]
                        .parse::<usize>()
                        .map_err(|_| PathParseError::InvalidIndex { offset: start })?;
                    elements.push(PathElement::Index(index));
                    i = end + 1;
                }
                b']' => {
                    return Err(PathParseError::UnexpectedCharacter {
                        character: ']',
                        offset: i,
                    });
                }
                _ => {
                    let start = i;
                    while i < bytes.len() && !matches!(bytes[i], b'.' | b'[' | b']') {
                        i += 1;
                    }
                    if !expect_key {
                        return Err(PathParseError::UnexpectedCharacter {
                            character: input[start..].chars().next().unwrap_or('?'),
                            offset: start,
                        });
                    }
                    elements.push(PathElement::Key(input[start..i].to_string()));
                    expect_key = false;
                }
            }
        }
        if expect_key {
            return Err(PathParseError::EmptyKey {
                offset: input.len(),
            });
        }
        Ok(Path(elements))
    }
}

/// Extension trait for looking into [`Value`]s with [`Path`]s.
pub trait ValueExt {
    /// The value at `path`, or `None` when the path is not addressable.
    ///
    /// A present-but-null value is returned as `Some(&Value::Null)`; only a
    /// missing key, a list index out of range, or a non-container on the way
    /// down yields `None`.
    fn get_at_path<'a>(&'a self, path: &Path) -> Option<&'a Value>;
}

impl ValueExt for Value {
    fn get_at_path<'a>(&'a self, path: &Path) -> Option<&'a Value> {
        let mut current = self;
        for element in path.iter() {
            current = match element {
                PathElement::Key(key) => current.as_object()?.get(key.as_str())?,
                PathElement::Index(index) => current.as_array()?.get(*index)?,
            };
        }
        Some(current)
    }
}
