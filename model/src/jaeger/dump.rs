//! Reading and writing raw Jaeger API dumps.
//!
//! A dump is a Jaeger query API response saved to a file:
//! ```json
//! {
//!     "data": [ { "traceID": ..., "spans": [...], "processes": {...} }, ... ],
//!     ...
//! }
//! ```
//! Dumps of a busy service can be large, so they are read incrementally: each element of `"data"`
//! is deserialized and handed to a callback before the next one is read.

use super::Trace;
use anyhow::{Context, Error};
use serde::{
    de::{self, DeserializeSeed, Deserializer, IgnoredAny, MapAccess, SeqAccess, Visitor},
    Serialize,
};
use serde_json::Value;
use std::fmt::{self, Formatter};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Call `f` on each trace in a dump, in order.
///
/// Traces which are not well-formed are logged and skipped. If `f` fails, reading stops and the
/// error is returned.
///
/// # Returns
///
/// The number of well-formed traces in the dump.
pub fn for_each_trace<R, F>(reader: R, f: F) -> Result<usize, Error>
where
    R: Read,
    F: FnMut(Trace) -> Result<(), Error>,
{
    let mut sink = Sink {
        f,
        count: 0,
        failure: None,
    };
    let mut de = serde_json::Deserializer::from_reader(BufReader::new(reader));
    let res = (&mut de)
        .deserialize_map(Envelope(&mut sink))
        .and_then(|()| de.end());
    match (res, sink.failure) {
        (_, Some(err)) => Err(err),
        (Err(err), None) => Err(Error::msg(format!("malformed trace dump: {err}"))),
        (Ok(()), None) => Ok(sink.count),
    }
}

/// Read all of the traces in a dump into memory.
pub fn read_dump(reader: impl Read) -> Result<Vec<Trace>, Error> {
    let mut traces = vec![];
    for_each_trace(reader, |trace| {
        traces.push(trace);
        Ok(())
    })?;
    Ok(traces)
}

/// Save `traces` collected for `service` as a dump in `dir`.
///
/// # Returns
///
/// The path of the new dump file.
pub fn save_dump(dir: impl AsRef<Path>, service: &str, traces: &[Trace]) -> Result<PathBuf, Error> {
    #[derive(Serialize)]
    struct Dump<'a> {
        data: &'a [Trace],
        total: usize,
    }

    let dir = dir.as_ref();
    fs::create_dir_all(dir)
        .with_context(|| format!("unable to create dump directory {}", dir.display()))?;
    let path = dir.join(json_file_name(service));
    let mut file = BufWriter::new(
        File::create(&path).with_context(|| format!("unable to create {}", path.display()))?,
    );
    serde_json::to_writer(
        &mut file,
        &Dump {
            data: traces,
            total: traces.len(),
        },
    )?;
    file.flush()?;
    tracing::info!("saved {} traces to {}", traces.len(), path.display());
    Ok(path)
}

/// The name of the JSON file for `name`, such as a service dump or a span tree.
///
/// Path separators in `name` are replaced so that the file lives directly in its directory.
pub fn json_file_name(name: &str) -> String {
    let name: String = name
        .chars()
        .map(|c| if matches!(c, '/' | '\\') { '_' } else { c })
        .collect();
    format!("{name}.json")
}

struct Sink<F> {
    f: F,
    count: usize,
    failure: Option<Error>,
}

/// Visits the top-level response object, streaming `"data"` and skipping everything else.
struct Envelope<'a, F>(&'a mut Sink<F>);

impl<'de, F: FnMut(Trace) -> Result<(), Error>> Visitor<'de> for Envelope<'_, F> {
    type Value = ();

    fn expecting(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "a Jaeger API response object")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<(), A::Error> {
        while let Some(key) = map.next_key::<String>()? {
            if key == "data" {
                map.next_value_seed(Data(&mut *self.0))?;
            } else {
                map.next_value::<IgnoredAny>()?;
            }
        }
        Ok(())
    }
}

/// Visits the `"data"` array of a response, which may be `null`.
struct Data<'a, F>(&'a mut Sink<F>);

impl<'de, F: FnMut(Trace) -> Result<(), Error>> DeserializeSeed<'de> for Data<'_, F> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, d: D) -> Result<(), D::Error> {
        d.deserialize_option(self)
    }
}

impl<'de, F: FnMut(Trace) -> Result<(), Error>> Visitor<'de> for Data<'_, F> {
    type Value = ();

    fn expecting(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "an array of traces")
    }

    fn visit_none<E: de::Error>(self) -> Result<(), E> {
        Ok(())
    }

    fn visit_unit<E: de::Error>(self) -> Result<(), E> {
        Ok(())
    }

    fn visit_some<D: Deserializer<'de>>(self, d: D) -> Result<(), D::Error> {
        d.deserialize_seq(self)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<(), A::Error> {
        let sink = self.0;
        let mut index = 0;
        while let Some(value) = seq.next_element::<Value>()? {
            let trace: Trace = match serde_json::from_value(value) {
                Ok(trace) => trace,
                Err(err) => {
                    tracing::error!("trace {index} is malformed, skipping: {err}");
                    index += 1;
                    continue;
                }
            };
            index += 1;
            sink.count += 1;
            if let Err(err) = (sink.f)(trace) {
                sink.failure = Some(err);
                return Err(de::Error::custom("aborted"));
            }
        }
        Ok(())
    }
}
