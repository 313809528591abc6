//! Export of per-trace summaries to CSV.
//!
//! Each exported trace becomes one row of
//!
//! | traceID | duration-ms | startTime | endTime | rpcErrors | operation | processes |
//!
//! Data files carry no header; the column names are written once to `header.csv` in the output
//! directory instead, so that data files from several services can be concatenated directly.
//!
//! The output directory also holds a cache of the IDs of all traces exported so far. A trace
//! which appears in the cache is never exported again, even when it is collected a second time
//! under a different service.

use super::{
    jaeger::{for_each_trace, save_dump, Jaeger, Trace, TraceQuery},
    tree,
};
use anyhow::{Context, Error};
use clap::Args;
use flate2::{write::GzEncoder, Compression};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Column names of an exported summary, in order.
pub const COLUMNS: [&str; 7] = [
    "traceID",
    "duration-ms",
    "startTime",
    "endTime",
    "rpcErrors",
    "operation",
    "processes",
];

/// File name of the column header in the output directory.
pub const HEADER_FILE: &str = "header.csv";

/// File name of the trace ID cache in the output directory.
pub const CACHE_FILE: &str = ".traceIDs.json";

/// How often to report progress, in written traces.
const PROGRESS_INTERVAL: usize = 100;

/// Export options.
#[derive(Clone, Debug, Default, Args)]
pub struct Options {
    /// Write plain CSV instead of gzip-compressed CSV.
    #[clap(long, env = "TRACES_NO_COMPRESS")]
    pub no_compress: bool,

    /// Keep the exported rows in the returned report.
    #[clap(skip)]
    pub keep_rows: bool,
}

/// A one-line summary of a trace.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Summary {
    #[serde(rename = "traceID")]
    pub trace_id: String,
    /// End-to-end latency of the trace in milliseconds.
    #[serde(rename = "duration-ms")]
    pub duration_ms: f64,
    #[serde(rename = "startTime")]
    pub start_time: u64,
    #[serde(rename = "endTime")]
    pub end_time: u64,
    /// Did any span in the trace report an error?
    #[serde(rename = "rpcErrors")]
    pub rpc_errors: bool,
    /// Operation of the first span reported for the trace.
    pub operation: String,
    /// Services involved in the trace, sorted and separated by `;`.
    pub processes: String,
}

impl TryFrom<&Trace> for Summary {
    type Error = Error;

    fn try_from(trace: &Trace) -> Result<Self, Self::Error> {
        let (Some(start_time), Some(end_time), Some(first)) =
            (trace.start_time(), trace.end_time(), trace.spans.first())
        else {
            return Err(Error::msg(format!("trace {} has no spans", trace.trace_id)));
        };
        Ok(Self {
            trace_id: trace.trace_id.clone(),
            duration_ms: (end_time - start_time) as f64 / 1000.,
            start_time,
            end_time,
            rpc_errors: trace.has_error(),
            operation: first.operation_name.clone(),
            processes: trace.services().join(";"),
        })
    }
}

/// The set of trace IDs which have already been exported to a directory.
#[derive(Clone, Debug)]
pub struct TraceIdCache {
    path: PathBuf,
    ids: HashSet<String>,
}

impl TraceIdCache {
    /// Load the cache for `dir`.
    ///
    /// A missing or unreadable cache is treated as empty.
    pub fn load(dir: impl AsRef<Path>) -> Self {
        let path = dir.as_ref().join(CACHE_FILE);
        let ids = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<HashSet<String>>(&bytes) {
                Ok(ids) => {
                    tracing::info!("using {} cached trace IDs from {}", ids.len(), path.display());
                    ids
                }
                Err(err) => {
                    tracing::warn!("ignoring malformed cache {}: {err}", path.display());
                    Default::default()
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::info!("no cached trace IDs found in {}", path.display());
                Default::default()
            }
            Err(err) => {
                tracing::warn!("unable to read cache {}: {err}", path.display());
                Default::default()
            }
        };
        Self { path, ids }
    }

    /// Has the trace `id` already been exported?
    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Record that the trace `id` has been exported.
    ///
    /// Returns `false` if it was already in the cache.
    pub fn insert(&mut self, id: impl Into<String>) -> bool {
        self.ids.insert(id.into())
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Persist the cache.
    pub fn save(&self) -> Result<(), Error> {
        tracing::info!(
            "rewriting cache of size {} to {}",
            self.ids.len(),
            self.path.display()
        );
        let ids: BTreeSet<_> = self.ids.iter().collect();
        let bytes = serde_json::to_vec(&ids)?;
        fs::write(&self.path, bytes)
            .with_context(|| format!("unable to write cache {}", self.path.display()))
    }
}

/// The outcome of exporting one batch of traces.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Report {
    /// The data file the batch was written to.
    pub path: PathBuf,
    /// Number of new traces written.
    pub written: usize,
    /// Number of traces in the batch, including those skipped.
    pub total: usize,
    /// Traces which were written, if [`Options::keep_rows`] is set.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rows: Vec<Summary>,
}

/// Writes trace summaries to data files in a single output directory.
pub struct Exporter {
    dir: PathBuf,
    cache: TraceIdCache,
    options: Options,
}

impl Exporter {
    /// Prepare to export into `dir`, creating it if necessary.
    pub fn new(dir: impl Into<PathBuf>, options: Options) -> Result<Self, Error> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("unable to create output directory {}", dir.display()))?;
        let cache = TraceIdCache::load(&dir);
        Ok(Self {
            dir,
            cache,
            options,
        })
    }

    /// The trace IDs exported so far.
    pub fn cache(&self) -> &TraceIdCache {
        &self.cache
    }

    /// The path of the data file called `name`.
    pub fn data_file(&self, name: &str) -> PathBuf {
        let ext = if self.options.no_compress {
            "csv"
        } else {
            "csv.gz"
        };
        let name = name.replace(['/', '\\'], "_");
        self.dir.join(format!("{name}.{ext}"))
    }

    /// Export the summaries of `traces` to the data file called `name`.
    ///
    /// The data file is replaced if it exists.
    pub fn export(&mut self, name: &str, traces: &[Trace]) -> Result<Report, Error> {
        let mut batch = self.begin(name)?;
        for trace in traces {
            batch.write(&mut self.cache, trace)?;
        }
        self.end(batch)
    }

    /// Export the summaries of all traces in a dump to the data file called `name`.
    pub fn export_dump(&mut self, name: &str, dump: impl Read) -> Result<Report, Error> {
        let mut batch = self.begin(name)?;
        let cache = &mut self.cache;
        for_each_trace(dump, |trace| batch.write(cache, &trace))?;
        self.end(batch)
    }

    fn begin(&self, name: &str) -> Result<Batch, Error> {
        let path = self.data_file(name);
        let file = BufWriter::new(
            File::create(&path).with_context(|| format!("unable to create {}", path.display()))?,
        );
        let output = if self.options.no_compress {
            Output::Plain(file)
        } else {
            Output::Gzip(GzEncoder::new(file, Compression::best()))
        };
        Ok(Batch {
            writer: csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(output),
            report: Report {
                path,
                ..Default::default()
            },
            keep_rows: self.options.keep_rows,
        })
    }

    fn end(&mut self, batch: Batch) -> Result<Report, Error> {
        let Batch { writer, report, .. } = batch;
        writer
            .into_inner()
            .map_err(|err| Error::msg(format!("unable to flush {}: {err}", report.path.display())))?
            .finish()
            .with_context(|| format!("unable to finish {}", report.path.display()))?;
        tracing::info!(
            "{}/{} traces written to {}",
            report.written,
            report.total,
            report.path.display()
        );

        self.cache.save()?;
        let mut header = csv::Writer::from_path(self.dir.join(HEADER_FILE))?;
        header.write_record(COLUMNS)?;
        header.flush()?;

        Ok(report)
    }
}

/// A data file being written.
struct Batch {
    writer: csv::Writer<Output>,
    report: Report,
    keep_rows: bool,
}

impl Batch {
    fn write(&mut self, cache: &mut TraceIdCache, trace: &Trace) -> Result<(), Error> {
        self.report.total += 1;
        if cache.contains(&trace.trace_id) {
            tracing::debug!("trace {} already exported, skipping", trace.trace_id);
            return Ok(());
        }
        let summary = match Summary::try_from(trace) {
            Ok(summary) => summary,
            Err(err) => {
                tracing::warn!("{err}, skipping");
                return Ok(());
            }
        };
        self.writer.serialize(&summary)?;
        cache.insert(summary.trace_id.clone());

        self.report.written += 1;
        if self.report.written % PROGRESS_INTERVAL == 0 {
            tracing::info!(
                "{} traces written to {}",
                self.report.written,
                self.report.path.display()
            );
        }
        if self.keep_rows {
            self.report.rows.push(summary);
        }
        Ok(())
    }
}

/// A data file, optionally compressed.
enum Output {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl Output {
    fn finish(self) -> io::Result<()> {
        match self {
            Self::Plain(mut file) => file.flush(),
            Self::Gzip(encoder) => encoder.finish()?.flush(),
        }
    }
}

impl Write for Output {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(file) => file.write(buf),
            Self::Gzip(encoder) => encoder.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(file) => file.flush(),
            Self::Gzip(encoder) => encoder.flush(),
        }
    }
}

/// Pull the latest traces for each of `services` and export them.
///
/// Each service is exported to its own data file, named after the service. If `raw` is provided,
/// the traces pulled for each service are also saved there as a dump. If `trees` is provided, a
/// span tree for each pulled trace is written there.
pub async fn update<J: Jaeger + Sync>(
    exporter: &mut Exporter,
    jaeger: &J,
    services: Vec<String>,
    query: &TraceQuery,
    raw: Option<&Path>,
    trees: Option<&Path>,
) -> Result<Vec<Report>, Error> {
    let mut reports = vec![];
    for service in services {
        tracing::info!("pulling traces for service {service}");
        let traces = jaeger.traces(&service, query).await?;
        tracing::info!("{} traces available for {service}", traces.len());

        if let Some(raw) = raw {
            save_dump(raw, &service, &traces)?;
        }
        if let Some(trees) = trees {
            tree::write_trees(&traces, trees)?;
        }
        reports.push(exporter.export(&service, &traces)?);
    }
    Ok(reports)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jaeger::{
        read_dump,
        test::{trace, trace_json},
        LocalClient,
    };
    use flate2::read::GzDecoder;
    use serde_json::json;
    use tempfile::TempDir;

    fn read_rows(path: &Path) -> Vec<Summary> {
        let file = File::open(path).unwrap();
        let reader: Box<dyn Read> = if path.extension().unwrap() == "gz" {
            Box::new(GzDecoder::new(file))
        } else {
            Box::new(file)
        };
        csv::ReaderBuilder::new()
            .has_headers(false)
            .from_reader(reader)
            .deserialize()
            .collect::<Result<_, _>>()
            .unwrap()
    }

    fn plain() -> Options {
        Options {
            no_compress: true,
            keep_rows: true,
        }
    }

    #[test]
    fn test_summary() {
        let summary = Summary::try_from(&trace("t1", 1_000)).unwrap();
        assert_eq!(
            summary,
            Summary {
                trace_id: "t1".into(),
                duration_ms: 2.,
                start_time: 1_000,
                end_time: 3_000,
                rpc_errors: true,
                operation: "GET /item".into(),
                processes: "backend;frontend".into(),
            }
        );
    }

    #[test]
    fn test_summary_without_spans() {
        let trace: Trace =
            serde_json::from_value(json!({ "traceID": "t", "spans": [], "processes": {} }))
                .unwrap();
        Summary::try_from(&trace).unwrap_err();
    }

    #[test]
    fn test_export_plain() {
        let tmp = TempDir::new().unwrap();
        let mut exporter = Exporter::new(tmp.path(), plain()).unwrap();
        let report = exporter
            .export("frontend", &[trace("t1", 0), trace("t2", 1_500), trace("t1", 0)])
            .unwrap();
        assert_eq!(report.path, tmp.path().join("frontend.csv"));
        assert_eq!(report.written, 2);
        assert_eq!(report.total, 3);
        assert_eq!(read_rows(&report.path), report.rows);
        assert_eq!(
            fs::read_to_string(&report.path).unwrap().lines().next(),
            Some("t1,2.0,0,2000,true,GET /item,backend;frontend")
        );
        assert_eq!(
            fs::read_to_string(tmp.path().join(HEADER_FILE)).unwrap(),
            "traceID,duration-ms,startTime,endTime,rpcErrors,operation,processes\n"
        );
    }

    #[test]
    fn test_export_gzip() {
        let tmp = TempDir::new().unwrap();
        let mut exporter = Exporter::new(
            tmp.path(),
            Options {
                no_compress: false,
                keep_rows: true,
            },
        )
        .unwrap();
        let report = exporter.export("frontend", &[trace("t1", 0)]).unwrap();
        assert_eq!(report.path, tmp.path().join("frontend.csv.gz"));
        assert_eq!(read_rows(&report.path), report.rows);
        assert_eq!(report.rows.len(), 1);
    }

    #[test]
    fn test_cache_persists_across_exporters() {
        let tmp = TempDir::new().unwrap();
        Exporter::new(tmp.path(), plain())
            .unwrap()
            .export("frontend", &[trace("t1", 0)])
            .unwrap();

        let cache = TraceIdCache::load(tmp.path());
        assert!(cache.contains("t1"));
        assert_eq!(cache.len(), 1);

        let mut exporter = Exporter::new(tmp.path(), plain()).unwrap();
        let report = exporter
            .export("backend", &[trace("t1", 0), trace("t2", 0)])
            .unwrap();
        assert_eq!(report.written, 1);
        assert_eq!(report.rows[0].trace_id, "t2");
        assert_eq!(
            fs::read_to_string(tmp.path().join(CACHE_FILE)).unwrap(),
            r#"["t1","t2"]"#
        );
    }

    #[test]
    fn test_malformed_cache_is_ignored() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(CACHE_FILE), "not json").unwrap();
        assert!(TraceIdCache::load(tmp.path()).is_empty());
    }

    #[test]
    fn test_export_dump() {
        let tmp = TempDir::new().unwrap();
        let dump = serde_json::to_vec(&json!({
            "data": [
                trace_json("t1", 0),
                { "traceID": "empty", "spans": [], "processes": {} },
                trace_json("t2", 0),
            ]
        }))
        .unwrap();
        let mut exporter = Exporter::new(tmp.path().join("out"), plain()).unwrap();
        let report = exporter.export_dump("dump", dump.as_slice()).unwrap();
        assert_eq!(report.written, 2);
        assert_eq!(report.total, 3);
        assert!(!exporter.cache().contains("empty"));
    }

    #[async_std::test]
    async fn test_update() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("source");
        save_dump(&source, "frontend", &[trace("t1", 0), trace("t2", 0)]).unwrap();
        save_dump(&source, "backend", &[trace("t2", 0), trace("t3", 0)]).unwrap();
        let jaeger = LocalClient::open(source);

        let raw = tmp.path().join("raw");
        let trees = tmp.path().join("trees");
        let mut exporter = Exporter::new(tmp.path().join("out"), plain()).unwrap();
        let services = jaeger.services().await.unwrap();
        let reports = update(
            &mut exporter,
            &jaeger,
            services,
            &TraceQuery::default(),
            Some(&raw),
            Some(&trees),
        )
        .await
        .unwrap();

        assert_eq!(
            reports
                .iter()
                .map(|report| (report.written, report.total))
                .collect::<Vec<_>>(),
            [(2, 2), (1, 2)]
        );
        assert_eq!(
            read_dump(File::open(raw.join("frontend.json")).unwrap()).unwrap(),
            [trace("t1", 0), trace("t2", 0)]
        );
        for id in ["t1", "t2", "t3"] {
            assert!(trees.join(format!("{id}.json")).is_file());
        }
    }
}
