//! Deterministic classification of failed transfer attempts.
//!
//! The transfer tool reports provider failures (S3, GCS, Azure, OCI, ...) as
//! free-form stderr text. [`classify`] maps that text onto a small,
//! provider-agnostic [`ErrorCode`] taxonomy. Retryability is a property of the
//! code ([`ErrorCode::is_retryable`]) so every consumer agrees on it.
//!
//! Matching runs over [`RULES`] in order and the first matching rule wins.
//! Some messages satisfy several heuristics (a 403 body that names a missing
//! bucket, a config error that says "not found"), so rule order is part of the
//! contract and is pinned by the golden corpus in `tests/fixtures/stderr`.
//! Adding a provider string is a table edit.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::types::AttemptError;

/// Normalized, provider-agnostic failure code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidConfig,
    SignatureMismatch,
    InvalidCredentials,
    AccessDenied,
    NotFound,
    RequestTimeSkewed,
    RateLimited,
    Conflict,
    UpstreamTimeout,
    EndpointUnreachable,
    NetworkError,
    Canceled,
    Unknown,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 13] = [
        ErrorCode::InvalidConfig,
        ErrorCode::SignatureMismatch,
        ErrorCode::InvalidCredentials,
        ErrorCode::AccessDenied,
        ErrorCode::NotFound,
        ErrorCode::RequestTimeSkewed,
        ErrorCode::RateLimited,
        ErrorCode::Conflict,
        ErrorCode::UpstreamTimeout,
        ErrorCode::EndpointUnreachable,
        ErrorCode::NetworkError,
        ErrorCode::Canceled,
        ErrorCode::Unknown,
    ];

    /// Whether failures with this code are transient and safe to retry.
    ///
    /// This table is a compatibility contract shared with the API layer and
    /// its clients.
    pub fn is_retryable(self) -> bool {
        match self {
            ErrorCode::RateLimited
            | ErrorCode::UpstreamTimeout
            | ErrorCode::EndpointUnreachable
            | ErrorCode::NetworkError => true,
            ErrorCode::InvalidConfig
            | ErrorCode::SignatureMismatch
            | ErrorCode::InvalidCredentials
            | ErrorCode::AccessDenied
            | ErrorCode::NotFound
            | ErrorCode::RequestTimeSkewed
            | ErrorCode::Conflict
            | ErrorCode::Canceled
            | ErrorCode::Unknown => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidConfig => "invalid_config",
            ErrorCode::SignatureMismatch => "signature_mismatch",
            ErrorCode::InvalidCredentials => "invalid_credentials",
            ErrorCode::AccessDenied => "access_denied",
            ErrorCode::NotFound => "not_found",
            ErrorCode::RequestTimeSkewed => "request_time_skewed",
            ErrorCode::RateLimited => "rate_limited",
            ErrorCode::Conflict => "conflict",
            ErrorCode::UpstreamTimeout => "upstream_timeout",
            ErrorCode::EndpointUnreachable => "endpoint_unreachable",
            ErrorCode::NetworkError => "network_error",
            ErrorCode::Canceled => "canceled",
            ErrorCode::Unknown => "unknown",
        }
    }

    pub fn parse(raw: &str) -> Option<ErrorCode> {
        ErrorCode::ALL
            .into_iter()
            .find(|code| code.as_str() == raw.trim())
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verdict for one failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub code: ErrorCode,
    pub retryable: bool,
    /// Human-readable message derived from the raw stderr.
    pub message: String,
}

impl Classification {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            retryable: code.is_retryable(),
            message: message.into(),
        }
    }

    /// Message prefixed with `[code]` unless it already names the code.
    pub fn display_message(&self) -> String {
        let msg = self.message.trim();
        let code = self.code.as_str();
        if msg.is_empty() {
            return format!("[{code}]");
        }
        if msg.contains(code) {
            return msg.to_string();
        }
        format!("[{code}] {msg}")
    }
}

/// One matching heuristic over the lowercased message.
#[derive(Debug, Clone, Copy)]
pub enum Pattern {
    /// Message contains the needle.
    Contains(&'static str),
    /// Message contains every needle.
    AllOf(&'static [&'static str]),
    /// Whole (trimmed) message equals the needle.
    Exactly(&'static str),
}

impl Pattern {
    fn matches(self, msg: &str) -> bool {
        match self {
            Pattern::Contains(needle) => msg.contains(needle),
            Pattern::AllOf(needles) => needles.iter().all(|needle| msg.contains(needle)),
            Pattern::Exactly(needle) => msg.trim() == needle,
        }
    }
}

/// A taxonomy code and the patterns that select it.
#[derive(Debug, Clone, Copy)]
pub struct Rule {
    pub code: ErrorCode,
    pub patterns: &'static [Pattern],
}

impl Rule {
    fn matches(&self, msg: &str) -> bool {
        self.patterns.iter().any(|pattern| pattern.matches(msg))
    }
}

use Pattern::{AllOf, Contains, Exactly};

/// Ordered rule table. First match wins.
///
/// Config errors come first because several backends say "not found" for a
/// missing remote section; credential and permission rules precede
/// `not_found` because 403 bodies often name the bucket that was denied.
pub const RULES: &[Rule] = &[
    Rule {
        code: ErrorCode::InvalidConfig,
        patterns: &[
            AllOf(&["didn't find section", "config"]),
            AllOf(&["did not find section", "config"]),
            AllOf(&["section", "not found", "config"]),
            Contains("unknown backend"),
            Contains("unknown remote"),
            AllOf(&["failed to configure", "backend"]),
            Contains("failed to create file system"),
            AllOf(&["config file", "not found"]),
            Contains("invalid configuration"),
            AllOf(&["couldn't parse", "config"]),
            Contains("bad configuration"),
            Contains("bad config"),
        ],
    },
    Rule {
        code: ErrorCode::SignatureMismatch,
        patterns: &[
            Contains("signaturedoesnotmatch"),
            Contains("signature does not match"),
            Contains("request signature we calculated does not match"),
            Contains("invalid signature"),
            Contains("authorizationheader malformed"),
        ],
    },
    Rule {
        code: ErrorCode::InvalidCredentials,
        patterns: &[
            // AWS/S3
            Contains("invalidaccesskeyid"),
            Contains("access key id you provided does not exist"),
            Contains("invalid access key"),
            Contains("invalidtoken"),
            Contains("expiredtoken"),
            AllOf(&["security token", "invalid"]),
            // Azure
            Contains("authenticationfailed"),
            Contains("invalidauthenticationinfo"),
            Contains("failed to authenticate"),
            // GCP OAuth
            Contains("invalid_grant"),
            AllOf(&["oauth2:", "token"]),
            // OCI
            Contains("notauthenticated"),
            // Generic 401
            Contains("unauthorized"),
            Contains("status 401"),
            Contains("error 401"),
        ],
    },
    Rule {
        code: ErrorCode::AccessDenied,
        patterns: &[
            Contains("accessdenied"),
            Contains("access denied"),
            Contains("permission denied"),
            Contains("forbidden"),
            Contains("authorizationpermissionmismatch"),
            Contains("notauthorizedornotfound"),
            Contains("not authorized"),
            Contains("authorizationfailure"),
            Contains("authorization failed"),
            Contains("account is disabled"),
            Contains("permissiondenied"),
            Contains("insufficientpermissions"),
            AllOf(&["does not have", " access"]),
            Contains("status 403"),
            Contains("error 403"),
        ],
    },
    Rule {
        code: ErrorCode::NotFound,
        patterns: &[
            Contains("nosuchkey"),
            Contains("no such key"),
            Contains("nosuchbucket"),
            Contains("no such bucket"),
            Contains("containernotfound"),
            Contains("container not found"),
            Contains("blobnotfound"),
            Contains("blob not found"),
            Contains("notfound"),
            Contains("the specified container does not exist"),
            Contains("the specified bucket does not exist"),
            Contains("not found"),
            Contains("no such file"),
            Contains("status 404"),
            Contains("error 404"),
            Contains(" 404"),
        ],
    },
    Rule {
        code: ErrorCode::RequestTimeSkewed,
        patterns: &[Contains("request time too skewed"), Contains("requesttime")],
    },
    Rule {
        code: ErrorCode::RateLimited,
        patterns: &[
            Contains("rate limit"),
            Contains("too many requests"),
            Contains("toomanyrequests"),
            Contains("status 429"),
            Contains("error 429"),
            // AWS/S3
            Contains("slowdown"),
            Contains("slow down"),
            Contains("requestlimitexceeded"),
            Contains("throttl"),
            // Azure
            Contains("serverbusy"),
            // GCP
            Contains("ratelimitexceeded"),
            Contains("resourceexhausted"),
            AllOf(&["quota", "exceed"]),
        ],
    },
    Rule {
        code: ErrorCode::Conflict,
        patterns: &[
            Contains("bucketnotempty"),
            Contains("bucket not empty"),
            Contains("directory not empty"),
            AllOf(&["not empty", "bucket"]),
            Contains("conflict"),
            Contains("already exists"),
            Contains("precondition failed"),
            Contains("status 409"),
            Contains("error 409"),
            Contains("status 412"),
            Contains("error 412"),
        ],
    },
    Rule {
        code: ErrorCode::UpstreamTimeout,
        patterns: &[
            Contains("timeout"),
            Contains("timed out"),
            Contains("context deadline exceeded"),
        ],
    },
    Rule {
        code: ErrorCode::EndpointUnreachable,
        patterns: &[
            Contains("no such host"),
            Contains("temporary failure in name resolution"),
            Contains("connection refused"),
            Contains("connection reset"),
            Contains("dial tcp"),
            Contains("tls:"),
            Contains("x509:"),
        ],
    },
    Rule {
        code: ErrorCode::NetworkError,
        patterns: &[
            Contains("broken pipe"),
            Contains("connection closed"),
            Contains("connection aborted"),
            Contains("unexpected eof"),
            Contains("network error"),
            Exactly("eof"),
        ],
    },
];

/// Message for a failed attempt: trimmed stderr, or the error text when the
/// tool wrote nothing.
pub fn failure_message(err: &AttemptError, stderr: &str) -> String {
    let trimmed = stderr.trim();
    if !trimmed.is_empty() {
        return trimmed.to_string();
    }
    err.to_string()
}

/// Classify a failed attempt.
///
/// - Cancellation is not a failure: it short-circuits to `canceled`.
/// - An attempt killed for exceeding its maximum duration is `upstream_timeout`.
/// - Otherwise the message is matched against [`RULES`]; no match (or an empty
///   message) yields `unknown`, which is not retried.
pub fn classify(err: &AttemptError, stderr: &str) -> Classification {
    let message = failure_message(err, stderr);
    match err {
        AttemptError::Canceled => return Classification::new(ErrorCode::Canceled, message),
        AttemptError::TimedOut(_) => {
            return Classification::new(ErrorCode::UpstreamTimeout, message);
        }
        AttemptError::Exited { .. } | AttemptError::Spawn(_) => {}
    }

    let lowered = message.to_lowercase();
    Classification::new(classify_message(&lowered), message)
}

/// Match an already-lowercased message against [`RULES`].
pub fn classify_message(msg_lower: &str) -> ErrorCode {
    if msg_lower.trim().is_empty() {
        return ErrorCode::Unknown;
    }
    RULES
        .iter()
        .find(|rule| rule.matches(msg_lower))
        .map_or(ErrorCode::Unknown, |rule| rule.code)
}
