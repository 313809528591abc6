//! Span trees: a nested representation of a trace following its `CHILD_OF` references.

use super::jaeger::{for_each_trace, json_file_name, RefType, Trace};
use anyhow::{Context, Error};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// How often to report progress, in written trees.
const PROGRESS_INTERVAL: usize = 100;

/// A trace arranged as a tree of spans.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct TraceTree {
    #[serde(rename = "traceID")]
    pub trace_id: String,
    #[serde(rename = "rootSpan")]
    pub root_span: SpanNode,
}

/// A span and the spans it caused.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct SpanNode {
    #[serde(rename = "spanID")]
    pub span_id: String,
    pub operation: String,
    pub service: String,
    #[serde(rename = "startTime")]
    pub start_time: u64,
    #[serde(rename = "endTime")]
    pub end_time: u64,
    pub duration: u64,
    pub error: bool,
    /// Child spans, ordered by start time.
    pub children: Vec<SpanNode>,
}

impl SpanNode {
    /// The number of spans in the subtree rooted at this node.
    pub fn size(&self) -> usize {
        1 + self.children.iter().map(SpanNode::size).sum::<usize>()
    }

    /// The number of levels in the subtree rooted at this node.
    pub fn depth(&self) -> usize {
        1 + self.children.iter().map(SpanNode::depth).max().unwrap_or(0)
    }
}

impl TraceTree {
    /// Arrange the spans of `trace` into a tree.
    ///
    /// The root is the earliest span in the trace. Spans are linked to their parents through
    /// `CHILD_OF` references; spans which are not descendants of the root are left out. A span
    /// with several parents appears once, under the first parent reached from the root.
    pub fn build(trace: &Trace) -> Result<Self, Error> {
        if trace.spans.is_empty() {
            return Err(Error::msg(format!("trace {} has no spans", trace.trace_id)));
        }

        // Flat nodes with no children yet, in the same order as `trace.spans`.
        let nodes = trace
            .spans
            .iter()
            .map(|span| {
                let service = trace.service_of(span).ok_or_else(|| {
                    Error::msg(format!(
                        "span {} in trace {} refers to unknown process {}",
                        span.span_id, trace.trace_id, span.process_id
                    ))
                })?;
                Ok(SpanNode {
                    span_id: span.span_id.clone(),
                    operation: span.operation_name.clone(),
                    service: service.into(),
                    start_time: span.start_time,
                    end_time: span.end_time(),
                    duration: span.duration,
                    error: span.has_error(),
                    children: vec![],
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;

        let index = trace
            .spans
            .iter()
            .enumerate()
            .map(|(i, span)| (span.span_id.as_str(), i))
            .collect::<HashMap<_, _>>();
        let mut children = vec![vec![]; nodes.len()];
        for (i, span) in trace.spans.iter().enumerate() {
            for reference in &span.references {
                if reference.ref_type != RefType::ChildOf {
                    continue;
                }
                match index.get(reference.span_id.as_str()) {
                    Some(&parent) => children[parent].push(i),
                    None => tracing::warn!(
                        "span {} in trace {} refers to missing parent {}",
                        span.span_id,
                        trace.trace_id,
                        reference.span_id
                    ),
                }
            }
        }

        let root = trace
            .spans
            .iter()
            .enumerate()
            .min_by_key(|(_, span)| span.start_time)
            .map(|(i, _)| i)
            .ok_or_else(|| Error::msg(format!("trace {} has no spans", trace.trace_id)))?;
        let builder = Builder {
            trace_id: &trace.trace_id,
            nodes: &nodes,
            children: &children,
        };
        Ok(Self {
            trace_id: trace.trace_id.clone(),
            root_span: builder.build(root, &mut vec![false; nodes.len()]),
        })
    }

    /// Write this tree to `dir/<traceID>.json`.
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<PathBuf, Error> {
        let path = dir.as_ref().join(json_file_name(&self.trace_id));
        let mut file = BufWriter::new(
            File::create(&path).with_context(|| format!("unable to create {}", path.display()))?,
        );
        serde_json::to_writer_pretty(&mut file, self)?;
        file.flush()?;
        Ok(path)
    }
}

struct Builder<'a> {
    trace_id: &'a str,
    nodes: &'a [SpanNode],
    children: &'a [Vec<usize>],
}

impl Builder<'_> {
    /// Build the subtree rooted at `i`.
    ///
    /// `visited` marks spans already placed in the tree. Each span is expanded at most once.
    fn build(&self, i: usize, visited: &mut [bool]) -> SpanNode {
        visited[i] = true;
        let mut children = vec![];
        for &child in &self.children[i] {
            if visited[child] {
                tracing::warn!(
                    "span {} in trace {} is already in the tree, ignoring reference from {}",
                    self.nodes[child].span_id,
                    self.trace_id,
                    self.nodes[i].span_id
                );
                continue;
            }
            children.push(self.build(child, visited));
        }

        children.sort_by_key(|child| child.start_time);
        SpanNode {
            children,
            ..self.nodes[i].clone()
        }
    }
}

/// Write a span tree for each of `traces` to `dir`.
///
/// Traces which cannot be arranged into a tree are logged and skipped.
///
/// # Returns
///
/// The number of trees written.
pub fn write_trees(traces: &[Trace], dir: impl AsRef<Path>) -> Result<usize, Error> {
    let mut writer = TreeWriter::new(dir.as_ref())?;
    for trace in traces {
        writer.write(trace)?;
    }
    Ok(writer.finish())
}

/// Write a span tree for each trace in a dump to `dir`.
pub fn write_dump_trees(dump: impl Read, dir: impl AsRef<Path>) -> Result<usize, Error> {
    let mut writer = TreeWriter::new(dir.as_ref())?;
    for_each_trace(dump, |trace| writer.write(&trace))?;
    Ok(writer.finish())
}

struct TreeWriter<'a> {
    dir: &'a Path,
    written: usize,
}

impl<'a> TreeWriter<'a> {
    fn new(dir: &'a Path) -> Result<Self, Error> {
        fs::create_dir_all(dir)
            .with_context(|| format!("unable to create directory {}", dir.display()))?;
        Ok(Self { dir, written: 0 })
    }

    fn write(&mut self, trace: &Trace) -> Result<(), Error> {
        let tree = match TraceTree::build(trace) {
            Ok(tree) => tree,
            Err(err) => {
                tracing::error!("{err}, skipping");
                return Ok(());
            }
        };
        tree.save(self.dir)?;
        self.written += 1;
        if self.written % PROGRESS_INTERVAL == 0 {
            tracing::info!("processed {} traces", self.written);
        }
        Ok(())
    }

    fn finish(self) -> usize {
        tracing::info!(
            "wrote {} span trees to {}",
            self.written,
            self.dir.display()
        );
        self.written
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jaeger::test::{trace, trace_json};
    use serde_json::{json, Value};
    use tempfile::TempDir;

    fn span(id: &str, parent: Option<&str>, start: u64, process: &str) -> Value {
        let references = match parent {
            Some(parent) => json!([{ "refType": "CHILD_OF", "traceID": "t", "spanID": parent }]),
            None => json!([]),
        };
        json!({
            "traceID": "t",
            "spanID": id,
            "operationName": format!("op-{id}"),
            "references": references,
            "startTime": start,
            "duration": 10,
            "tags": [],
            "processID": process,
        })
    }

    fn trace_of(spans: Vec<Value>) -> Trace {
        serde_json::from_value(json!({
            "traceID": "t",
            "spans": spans,
            "processes": {
                "p1": { "serviceName": "frontend" },
                "p2": { "serviceName": "backend" },
            },
        }))
        .unwrap()
    }

    fn ids(node: &SpanNode) -> Vec<&str> {
        node.children.iter().map(|c| c.span_id.as_str()).collect()
    }

    #[test]
    fn test_build_simple() {
        let tree = TraceTree::build(&trace("t1", 1_000)).unwrap();
        assert_eq!(
            serde_json::to_value(&tree).unwrap(),
            json!({
                "traceID": "t1",
                "rootSpan": {
                    "spanID": "a",
                    "operation": "HTTP GET",
                    "service": "frontend",
                    "startTime": 1_000,
                    "endTime": 3_000,
                    "duration": 2_000,
                    "error": false,
                    "children": [{
                        "spanID": "b",
                        "operation": "GET /item",
                        "service": "backend",
                        "startTime": 1_100,
                        "endTime": 1_600,
                        "duration": 500,
                        "error": true,
                        "children": [],
                    }],
                },
            })
        );
    }

    #[test]
    fn test_children_sorted_recursively() {
        let tree = TraceTree::build(&trace_of(vec![
            span("c", Some("a"), 30, "p2"),
            span("a", None, 0, "p1"),
            span("b", Some("a"), 10, "p2"),
            span("d", Some("c"), 50, "p2"),
            span("e", Some("c"), 40, "p1"),
            span("f", Some("a"), 10, "p1"),
        ]))
        .unwrap();
        let root = &tree.root_span;
        assert_eq!(root.span_id, "a");
        // `b` and `f` start together and keep their original order.
        assert_eq!(ids(root), ["b", "f", "c"]);
        assert_eq!(ids(&root.children[2]), ["e", "d"]);
        assert_eq!(root.size(), 6);
        assert_eq!(root.depth(), 3);
    }

    #[test]
    fn test_root_ties_pick_first() {
        let tree = TraceTree::build(&trace_of(vec![
            span("x", None, 5, "p1"),
            span("y", None, 5, "p1"),
        ]))
        .unwrap();
        assert_eq!(tree.root_span.span_id, "x");
        assert!(tree.root_span.children.is_empty());
    }

    #[test]
    fn test_missing_parent_and_unreachable_spans() {
        let tree = TraceTree::build(&trace_of(vec![
            span("a", None, 0, "p1"),
            span("b", Some("gone"), 10, "p1"),
            span("c", Some("b"), 20, "p1"),
        ]))
        .unwrap();
        assert_eq!(tree.root_span.size(), 1);
    }

    #[test]
    fn test_follows_from_ignored() {
        let mut follows = span("b", None, 10, "p2");
        follows["references"] = json!([{ "refType": "FOLLOWS_FROM", "traceID": "t", "spanID": "a" }]);
        let tree = TraceTree::build(&trace_of(vec![span("a", None, 0, "p1"), follows])).unwrap();
        assert!(tree.root_span.children.is_empty());
    }

    #[test]
    fn test_cycle_terminates() {
        let tree = TraceTree::build(&trace_of(vec![
            span("a", Some("b"), 0, "p1"),
            span("b", Some("a"), 10, "p1"),
        ]))
        .unwrap();
        assert_eq!(tree.root_span.span_id, "a");
        assert_eq!(ids(&tree.root_span), ["b"]);
        assert!(tree.root_span.children[0].children.is_empty());
    }

    #[test]
    fn test_dense_references_place_each_span_once() {
        let n = 12;
        let spans = (0..n)
            .map(|i| {
                let references = (0..n)
                    .filter(|&j| j != i)
                    .map(|j| {
                        json!({ "refType": "CHILD_OF", "traceID": "t", "spanID": format!("s{j}") })
                    })
                    .collect::<Vec<_>>();
                let mut value = span(&format!("s{i}"), None, i as u64, "p1");
                value["references"] = json!(references);
                value
            })
            .collect::<Vec<_>>();
        let tree = TraceTree::build(&trace_of(spans)).unwrap();
        assert_eq!(tree.root_span.span_id, "s0");
        assert_eq!(tree.root_span.size(), n);
    }

    #[test]
    fn test_multiple_parents() {
        let mut c = span("c", Some("a"), 20, "p1");
        c["references"]
            .as_array_mut()
            .unwrap()
            .push(json!({ "refType": "CHILD_OF", "traceID": "t", "spanID": "b" }));
        let tree = TraceTree::build(&trace_of(vec![
            span("a", None, 0, "p1"),
            span("b", Some("a"), 10, "p1"),
            c,
        ]))
        .unwrap();
        assert_eq!(tree.root_span.size(), 3);
    }

    #[test]
    fn test_save_stays_in_dir() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("trees");
        fs::create_dir(&dir).unwrap();
        let mut trace = trace("t1", 0);
        trace.trace_id = "../escape".into();
        let path = TraceTree::build(&trace).unwrap().save(&dir).unwrap();
        assert_eq!(path, dir.join(".._escape.json"));
        assert!(path.is_file());
        assert!(!tmp.path().join("escape.json").exists());
    }

    #[test]
    fn test_unknown_process() {
        TraceTree::build(&trace_of(vec![span("a", None, 0, "p9")])).unwrap_err();
    }

    #[test]
    fn test_empty_trace() {
        TraceTree::build(&trace_of(vec![])).unwrap_err();
    }

    #[test]
    fn test_write_trees() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("trees");
        let bad = trace_of(vec![span("a", None, 0, "p9")]);
        let written = write_trees(&[trace("t1", 0), bad, trace("t2", 0)], &dir).unwrap();
        assert_eq!(written, 2);

        let saved: TraceTree =
            serde_json::from_reader(File::open(dir.join("t1.json")).unwrap()).unwrap();
        assert_eq!(saved, TraceTree::build(&trace("t1", 0)).unwrap());
        assert!(fs::read_to_string(dir.join("t2.json"))
            .unwrap()
            .starts_with("{\n  \"traceID\": \"t2\""));
    }

    #[test]
    fn test_write_dump_trees() {
        let tmp = TempDir::new().unwrap();
        let dump =
            serde_json::to_vec(&json!({ "data": [trace_json("t1", 0), trace_json("t2", 0)] }))
                .unwrap();
        assert_eq!(write_dump_trees(dump.as_slice(), tmp.path()).unwrap(), 2);
        assert!(tmp.path().join("t2.json").is_file());
    }
}
