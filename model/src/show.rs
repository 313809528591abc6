//! Printing traces by ID.

use super::{
    jaeger::{Jaeger, Trace},
    tree::TraceTree,
};
use anyhow::Error;
use futures::future::try_join_all;
use std::io::Write;

/// Fetch the traces `ids` from `jaeger` concurrently and print them to `out`, in order.
///
/// Each trace is printed as pretty JSON, either raw or as a span tree if `tree` is set. Traces
/// which do not exist, or which cannot be arranged into a tree, are logged and skipped; once every
/// other trace has been printed, they are reported together as an error.
pub async fn show<J: Jaeger + Sync>(
    jaeger: &J,
    ids: &[String],
    tree: bool,
    mut out: impl Write,
) -> Result<(), Error> {
    let traces = try_join_all(ids.iter().map(|id| jaeger.trace(id))).await?;
    let mut missing = vec![];
    let mut malformed = vec![];
    for (id, trace) in ids.iter().zip(traces) {
        let Some(trace) = trace else {
            tracing::error!("trace {id} not found");
            missing.push(id.as_str());
            continue;
        };
        match render(&trace, tree) {
            Ok(json) => writeln!(out, "{json}")?,
            Err(err) => {
                tracing::error!("{err}, skipping");
                malformed.push(id.as_str());
            }
        }
    }
    out.flush()?;

    let mut problems = vec![];
    if !missing.is_empty() {
        problems.push(format!("traces not found: {}", missing.join(", ")));
    }
    if !malformed.is_empty() {
        problems.push(format!(
            "unable to build span trees for: {}",
            malformed.join(", ")
        ));
    }
    if problems.is_empty() {
        Ok(())
    } else {
        Err(Error::msg(problems.join("; ")))
    }
}

fn render(trace: &Trace, tree: bool) -> Result<String, Error> {
    Ok(if tree {
        serde_json::to_string_pretty(&TraceTree::build(trace)?)?
    } else {
        serde_json::to_string_pretty(trace)?
    })
}
