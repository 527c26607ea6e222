//! Method paths of the form `/{service}/{method}`.

use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid method path `{0}`: expected /{{service}}/{{method}}")]
pub struct InvalidMethodPath(String);

/// A validated method path.
///
/// ```
/// use wirecall_core::MethodPath;
///
/// let path: MethodPath = "/Greeter/SayHello".parse().unwrap();
/// assert_eq!(path.service(), "Greeter");
/// assert_eq!(path.method(), "SayHello");
/// assert!("Greeter/SayHello".parse::<MethodPath>().is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodPath {
    path: String,
    split: usize,
}

impl MethodPath {
    pub fn parse(path: &str) -> Result<Self, InvalidMethodPath> {
        let invalid = || InvalidMethodPath(path.to_owned());
        let rest = path.strip_prefix('/').ok_or_else(invalid)?;
        let (service, method) = rest.split_once('/').ok_or_else(invalid)?;
        let segment_ok = |s: &str| {
            !s.is_empty()
                && s
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        };
        if !segment_ok(service) || !segment_ok(method) {
            return Err(invalid());
        }
        Ok(Self {
            path: path.to_owned(),
            split: 1 + service.len(),
        })
    }

    pub fn service(&self) -> &str {
        &self.path[1..self.split]
    }

    pub fn method(&self) -> &str {
        &self.path[self.split + 1..]
    }

    pub fn as_str(&self) -> &str {
        &self.path
    }
}

impl FromStr for MethodPath {
    type Err = InvalidMethodPath;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for MethodPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

impl AsRef<str> for MethodPath {
    fn as_ref(&self) -> &str {
        &self.path
    }
}
