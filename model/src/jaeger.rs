//! Facilities for pulling traces from Jaeger.

use anyhow::Error;
use async_trait::async_trait;
use clap::Args;
use derive_more::Into;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::time::Duration;
use strum::{Display, EnumIter, EnumString};
use surf::Url;

mod client;
mod dump;
mod local;

pub use client::Client;
pub use dump::{for_each_trace, json_file_name, read_dump, save_dump};
pub use local::LocalClient;

/// Number of traces fetched per service when no limit is given.
pub const DEFAULT_LIMIT: usize = 20;

/// How far back to search for traces when no lookback is given.
pub const DEFAULT_LOOKBACK: &str = "1h";

/// A source of traces.
#[async_trait]
pub trait Jaeger {
    /// List the services which have reported traces.
    async fn services(&self) -> Result<Vec<String>, Error>;

    /// List traces involving `service`.
    async fn traces(&self, service: &str, query: &TraceQuery) -> Result<Vec<Trace>, Error>;

    /// Load a single trace by ID.
    ///
    /// Returns [`None`] if there is no trace with this ID.
    async fn trace(&self, id: &str) -> Result<Option<Trace>, Error>;
}

/// Options for connecting to a Jaeger query service.
#[derive(Clone, Debug, Args)]
pub struct Options {
    /// URL of the Jaeger query service.
    #[clap(long, env = "JAEGER_URL", default_value = "http://localhost:16686")]
    pub jaeger_url: Url,
}

impl Options {
    /// Connect to the Jaeger query service.
    pub fn connect(&self) -> Result<Client, Error> {
        Client::new(self.jaeger_url.clone())
    }
}

/// Filters applied when listing traces for a service.
#[derive(Clone, Debug, Args)]
pub struct TraceQuery {
    /// Only fetch traces containing OPERATION.
    #[clap(long, env = "JAEGER_OPERATION", value_name = "OPERATION")]
    pub operation: Option<String>,

    /// Maximum number of traces to fetch per service, or 0 for no limit.
    #[clap(long, env = "JAEGER_LIMIT", default_value_t = DEFAULT_LIMIT)]
    pub limit: usize,

    /// How far back to search for traces, e.g. `30m`, `1h` or `2d`.
    #[clap(long, env = "JAEGER_LOOKBACK", default_value = DEFAULT_LOOKBACK)]
    pub lookback: Lookback,
}

impl Default for TraceQuery {
    fn default() -> Self {
        Self {
            operation: None,
            limit: DEFAULT_LIMIT,
            lookback: Lookback::default(),
        }
    }
}

impl TraceQuery {
    /// Does `trace` pass the operation filter of this query?
    pub fn matches(&self, trace: &Trace) -> bool {
        match &self.operation {
            Some(op) => trace.spans.iter().any(|span| &span.operation_name == op),
            None => true,
        }
    }
}

/// A search window, written as an integer followed by a unit (`s`, `m`, `h` or `d`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Into)]
pub struct Lookback(Duration);

impl Default for Lookback {
    fn default() -> Self {
        Self(Duration::from_secs(60 * 60))
    }
}

impl FromStr for Lookback {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let split = s
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| Error::msg(format!("lookback {s} has no unit")))?;
        let (n, unit) = s.split_at(split);
        let n: u64 = n
            .parse()
            .map_err(|err| Error::msg(format!("invalid lookback {s}: {err}")))?;
        let scale = match unit {
            "s" => 1,
            "m" => 60,
            "h" => 60 * 60,
            "d" => 60 * 60 * 24,
            _ => return Err(Error::msg(format!("invalid lookback unit {unit}"))),
        };
        let secs = n
            .checked_mul(scale)
            .ok_or_else(|| Error::msg(format!("lookback {s} is too long")))?;
        Ok(Self(Duration::from_secs(secs)))
    }
}

impl Display for Lookback {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let secs = self.0.as_secs();
        if secs != 0 && secs % (60 * 60 * 24) == 0 {
            write!(f, "{}d", secs / (60 * 60 * 24))
        } else if secs != 0 && secs % (60 * 60) == 0 {
            write!(f, "{}h", secs / (60 * 60))
        } else if secs != 0 && secs % 60 == 0 {
            write!(f, "{}m", secs / 60)
        } else {
            write!(f, "{secs}s")
        }
    }
}

/// A distributed trace, as returned by the Jaeger query API.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Trace {
    #[serde(rename = "traceID")]
    pub trace_id: String,
    pub spans: Vec<Span>,
    #[serde(default)]
    pub processes: BTreeMap<String, Process>,
    /// Fields we don't interpret, kept so that traces can be saved without loss.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Trace {
    /// The earliest start time of any span, in microseconds since the epoch.
    pub fn start_time(&self) -> Option<u64> {
        self.spans.iter().map(|span| span.start_time).min()
    }

    /// The latest end time of any span, in microseconds since the epoch.
    pub fn end_time(&self) -> Option<u64> {
        self.spans.iter().map(Span::end_time).max()
    }

    /// Did any span in this trace report an error?
    pub fn has_error(&self) -> bool {
        self.spans.iter().any(Span::has_error)
    }

    /// The process which emitted `span`.
    pub fn process_of(&self, span: &Span) -> Option<&Process> {
        self.processes.get(&span.process_id)
    }

    /// The name of the service which emitted `span`.
    pub fn service_of(&self, span: &Span) -> Option<&str> {
        self.process_of(span)
            .map(|process| process.service_name.as_str())
    }

    /// The names of all services involved in this trace, sorted and deduplicated.
    pub fn services(&self) -> Vec<String> {
        self.processes
            .values()
            .map(|process| process.service_name.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// A single timed operation within a trace.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Span {
    #[serde(rename = "traceID", default)]
    pub trace_id: String,
    #[serde(rename = "spanID")]
    pub span_id: String,
    pub operation_name: String,
    #[serde(default)]
    pub references: Vec<Reference>,
    /// Start time in microseconds since the epoch.
    pub start_time: u64,
    /// Duration in microseconds.
    pub duration: u64,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(rename = "processID")]
    pub process_id: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Span {
    /// End time in microseconds since the epoch.
    pub fn end_time(&self) -> u64 {
        self.start_time.saturating_add(self.duration)
    }

    /// Is this span tagged as an error?
    pub fn has_error(&self) -> bool {
        self.tags.iter().any(Tag::is_error)
    }

    /// The ID of the parent span, if this span has a `CHILD_OF` reference.
    pub fn parent(&self) -> Option<&str> {
        self.references
            .iter()
            .find(|reference| reference.ref_type == RefType::ChildOf)
            .map(|reference| reference.span_id.as_str())
    }
}

/// A causal relationship between two spans.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reference {
    pub ref_type: RefType,
    #[serde(rename = "traceID", default)]
    pub trace_id: String,
    #[serde(rename = "spanID")]
    pub span_id: String,
}

/// The kind of a [`Reference`].
#[derive(
    Clone, Copy, Debug, Display, PartialEq, Eq, Hash, EnumIter, EnumString, Deserialize, Serialize,
)]
pub enum RefType {
    #[serde(rename = "CHILD_OF")]
    #[strum(serialize = "CHILD_OF")]
    ChildOf,
    #[serde(rename = "FOLLOWS_FROM")]
    #[strum(serialize = "FOLLOWS_FROM")]
    FollowsFrom,
}

/// A key-value annotation on a span or process.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Tag {
    pub key: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub ty: Option<String>,
    #[serde(default)]
    pub value: Value,
}

impl Tag {
    /// Is this an `error` tag with a truthy value?
    pub fn is_error(&self) -> bool {
        self.key == "error"
            && match &self.value {
                Value::Bool(b) => *b,
                Value::String(s) => s.eq_ignore_ascii_case("true"),
                _ => false,
            }
    }
}

/// The process (service instance) which emitted a span.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Process {
    pub service_name: String,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

/// The envelope around every Jaeger query API response.
///
/// ```json
/// {
///     "data": ...,
///     "errors": [{ "code": 404, "msg": "trace not found" }]
/// }
/// ```
#[derive(Clone, Debug, Deserialize, Serialize)]
struct Response<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Option<Vec<ApiError>>,
}

/// An error reported in a Jaeger API response.
#[derive(Clone, Debug, Deserialize, Serialize)]
struct ApiError {
    #[serde(default)]
    code: u16,
    msg: String,
}

impl Display for ApiError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.msg, self.code)
    }
}
