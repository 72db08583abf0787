//! HTTP method as a typed enum.
//!
//! Only the methods a route can be registered under. Requests carrying any
//! other method never match a route and fall through to `405` / not-found.

use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// A method a route can be registered under.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Method {
    Delete,
    Get,
    Head,
    Options,
    Patch,
    Post,
    Put,
}

impl Method {
    pub(crate) const ALL: [Method; 7] = [
        Self::Get,
        Self::Head,
        Self::Post,
        Self::Put,
        Self::Delete,
        Self::Patch,
        Self::Options,
    ];

    /// Returns the uppercase wire representation (e.g. `"GET"`).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Delete  => "DELETE",
            Self::Get     => "GET",
            Self::Head    => "HEAD",
            Self::Options => "OPTIONS",
            Self::Patch   => "PATCH",
            Self::Post    => "POST",
            Self::Put     => "PUT",
        }
    }

    /// Maps an incoming request method. `None` for methods no route can use.
    pub(crate) fn from_http(method: &http::Method) -> Option<Self> {
        match *method {
            http::Method::DELETE  => Some(Self::Delete),
            http::Method::GET     => Some(Self::Get),
            http::Method::HEAD    => Some(Self::Head),
            http::Method::OPTIONS => Some(Self::Options),
            http::Method::PATCH   => Some(Self::Patch),
            http::Method::POST    => Some(Self::Post),
            http::Method::PUT     => Some(Self::Put),
            _                     => None,
        }
    }
}

/// Parses an uppercase method name (e.g. `"GET"`). Case-sensitive per RFC 9110 §9.1.
impl FromStr for Method {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DELETE"  => Ok(Self::Delete),
            "GET"     => Ok(Self::Get),
            "HEAD"    => Ok(Self::Head),
            "OPTIONS" => Ok(Self::Options),
            "PATCH"   => Ok(Self::Patch),
            "POST"    => Ok(Self::Post),
            "PUT"     => Ok(Self::Put),
            _         => Err(ConfigError::UnknownMethod(s.to_owned())),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
