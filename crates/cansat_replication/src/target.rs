//! Target resolution.
//!
//! Turns a store name or URL plus credentials into the handle a sync engine
//! replicates to. Remote URLs without an explicit port get the conventional
//! port of the replication protocol: 6984 for `https`, 5984 otherwise.

use crate::error::{SyncError, SyncResult};
use std::fmt;
use std::sync::Arc;

/// Default port for TLS endpoints.
pub const DEFAULT_SECURE_PORT: u16 = 6984;

/// Default port for plain endpoints.
pub const DEFAULT_INSECURE_PORT: u16 = 5984;

/// Username and password for a remote store.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    username: Option<String>,
    password: Option<String>,
}

impl Credentials {
    /// Creates credentials. Empty strings count as absent.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        let username = username.into();
        let password = password.into();
        Self {
            username: (!username.is_empty()).then_some(username),
            password: (!password.is_empty()).then_some(password),
        }
    }

    /// No credentials.
    pub fn none() -> Self {
        Self::default()
    }

    /// Username, if any.
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Password, if any.
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// Returns true if neither username nor password is set.
    pub fn is_empty(&self) -> bool {
        self.username.is_none() && self.password.is_none()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// A resolved replication target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    url: String,
    credentials: Credentials,
}

impl RemoteTarget {
    /// Creates a target from an already normalized URL.
    pub fn new(url: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            url: url.into(),
            credentials,
        }
    }

    /// Normalized URL or local store name.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Credentials used against the target.
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Returns true if the target is a remote URL rather than a local name.
    pub fn is_remote(&self) -> bool {
        self.url.contains("//")
    }
}

impl fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

/// Resolves names or URLs into target handles.
///
/// Resolution is synchronous; the coordinator calls it from `replicate()`.
pub trait TargetResolver: Send + Sync + 'static {
    /// Handle produced by this resolver.
    type Target: Send + Sync + 'static;

    /// Resolves a target.
    fn resolve(&self, name: &str, credentials: &Credentials) -> SyncResult<Self::Target>;
}

impl<R: TargetResolver> TargetResolver for Arc<R> {
    type Target = R::Target;

    fn resolve(&self, name: &str, credentials: &Credentials) -> SyncResult<Self::Target> {
        (**self).resolve(name, credentials)
    }
}

/// Resolver producing [`RemoteTarget`]s.
///
/// Credentials embedded in the URL are used when none are passed explicitly.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoteTargetResolver;

impl RemoteTargetResolver {
    /// Creates a resolver.
    pub fn new() -> Self {
        Self
    }
}

impl TargetResolver for RemoteTargetResolver {
    type Target = RemoteTarget;

    fn resolve(&self, name: &str, credentials: &Credentials) -> SyncResult<RemoteTarget> {
        let name = name.trim();
        if name.is_empty() {
            return Err(SyncError::InvalidTarget("empty target name".into()));
        }

        if !name.contains("//") {
            return Ok(RemoteTarget::new(name, credentials.clone()));
        }

        let parsed = RemoteUrl::parse(name)?;
        let credentials = match (&parsed.userinfo, credentials.is_empty()) {
            (Some(userinfo), true) => userinfo.clone(),
            _ => credentials.clone(),
        };

        Ok(RemoteTarget::new(parsed.to_string(), credentials))
    }
}

/// Normalizes a store name or URL.
///
/// Names without `//` are returned unchanged. URLs lose their userinfo and
/// gain the default port if none is given; path and query are kept, and an
/// empty path becomes `/`.
pub fn normalize_remote_url(name: &str) -> SyncResult<String> {
    if !name.contains("//") {
        return Ok(name.to_string());
    }
    Ok(RemoteUrl::parse(name)?.to_string())
}

#[derive(Debug)]
struct RemoteUrl {
    scheme: String,
    host: String,
    port: u16,
    rest: String,
    userinfo: Option<Credentials>,
}

impl RemoteUrl {
    fn parse(input: &str) -> SyncResult<Self> {
        let (scheme, after) = input
            .split_once("//")
            .ok_or_else(|| SyncError::InvalidTarget(format!("not a url: {input}")))?;
        let scheme = scheme.trim_end_matches(':').to_ascii_lowercase();

        let authority_end = after
            .find(|c: char| matches!(c, '/' | '?' | '#'))
            .unwrap_or(after.len());
        let (authority, rest) = after.split_at(authority_end);

        let (userinfo, hostport) = match authority.rsplit_once('@') {
            Some((userinfo, hostport)) => (Some(parse_userinfo(userinfo)), hostport),
            None => (None, authority),
        };

        let (host, port) = split_host_port(hostport)
            .ok_or_else(|| SyncError::InvalidTarget(format!("bad port in {input}")))?;
        if host.is_empty() || host == "[]" {
            return Err(SyncError::InvalidTarget(format!("missing host in {input}")));
        }

        let port = port.unwrap_or(if scheme == "https" {
            DEFAULT_SECURE_PORT
        } else {
            DEFAULT_INSECURE_PORT
        });

        let rest = if rest.starts_with('/') {
            rest.to_string()
        } else {
            format!("/{rest}")
        };

        Ok(Self {
            scheme,
            host: host.to_ascii_lowercase(),
            port,
            rest,
            userinfo,
        })
    }
}

impl fmt::Display for RemoteUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scheme.is_empty() {
            write!(f, "//{}:{}{}", self.host, self.port, self.rest)
        } else {
            write!(f, "{}://{}:{}{}", self.scheme, self.host, self.port, self.rest)
        }
    }
}

fn parse_userinfo(userinfo: &str) -> Credentials {
    match userinfo.split_once(':') {
        Some((user, password)) => Credentials::new(user, password),
        None => Credentials::new(userinfo, ""),
    }
}

/// Splits `host[:port]`, handling bracketed IPv6 literals. Returns `None`
/// when a port is present but not a valid number.
fn split_host_port(hostport: &str) -> Option<(&str, Option<u16>)> {
    if hostport.starts_with('[') {
        let close = hostport.find(']')?;
        let (host, tail) = hostport.split_at(close + 1);
        return match tail.strip_prefix(':') {
            Some(port) => Some((host, Some(port.parse().ok()?))),
            None if tail.is_empty() => Some((host, None)),
            None => None,
        };
    }

    match hostport.rsplit_once(':') {
        Some((host, "")) => Some((host, None)),
        Some((host, port)) => Some((host, Some(port.parse().ok()?))),
        None => Some((hostport, None)),
    }
}
