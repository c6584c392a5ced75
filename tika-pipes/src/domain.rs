//! Domain types shared across the registry, worker, dispatcher, and stream
//! coordinator — decoupled from the generated gRPC types so the pipeline
//! core doesn't depend on wire shapes.

use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyStatus {
    ParseSuccess,
    ParseSuccessWithException,
    FetchException,
    ParseException,
    OversizeParse,
    Empty,
    Timeout,
    ClientUnavailable,
}

impl ReplyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplyStatus::ParseSuccess => "PARSE_SUCCESS",
            ReplyStatus::ParseSuccessWithException => "PARSE_SUCCESS_WITH_EXCEPTION",
            ReplyStatus::FetchException => "FETCH_EXCEPTION",
            ReplyStatus::ParseException => "PARSE_EXCEPTION",
            ReplyStatus::OversizeParse => "OVERSIZE_PARSE",
            ReplyStatus::Empty => "EMPTY",
            ReplyStatus::Timeout => "TIMEOUT",
            ReplyStatus::ClientUnavailable => "CLIENT_UNAVAILABLE",
        }
    }

    /// Parses the status a child process reported; an unrecognized value
    /// is itself a parser-side protocol violation, not something we should
    /// panic over.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PARSE_SUCCESS" => Some(ReplyStatus::ParseSuccess),
            "PARSE_SUCCESS_WITH_EXCEPTION" => Some(ReplyStatus::ParseSuccessWithException),
            "FETCH_EXCEPTION" => Some(ReplyStatus::FetchException),
            "PARSE_EXCEPTION" => Some(ReplyStatus::ParseException),
            "OVERSIZE_PARSE" => Some(ReplyStatus::OversizeParse),
            "EMPTY" => Some(ReplyStatus::Empty),
            "TIMEOUT" => Some(ReplyStatus::Timeout),
            "CLIENT_UNAVAILABLE" => Some(ReplyStatus::ClientUnavailable),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub fetcher_id: String,
    pub fetch_key: String,
    pub metadata: HashMap<String, String>,
    pub request_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchReply {
    pub fetch_key: String,
    pub status: ReplyStatus,
    pub fields: HashMap<String, String>,
    pub error_message: String,
    pub request_id: String,
}

impl FetchReply {
    pub fn error(request: &FetchRequest, status: ReplyStatus, error_message: impl Into<String>) -> Self {
        Self {
            fetch_key: request.fetch_key.clone(),
            status,
            fields: HashMap::new(),
            error_message: error_message.into(),
            request_id: request.request_id.clone(),
        }
    }
}
