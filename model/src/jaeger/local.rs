//! A trace source which reads dumps from the local file system instead of the Jaeger API.

use super::{dump::for_each_trace, json_file_name, Jaeger, Trace, TraceQuery};
use anyhow::{Context, Error};
use async_trait::async_trait;
use std::fs::File;
use std::path::{Path, PathBuf};

/// A trace source which reads dumps from the local file system instead of the Jaeger API.
///
/// The dumps live in a single directory, one per service:
///
/// ```text
/// DIR/
///     <service>.json
/// ```
///
/// Each dump is a saved response from the Jaeger `api/traces` endpoint.
#[derive(Clone, Debug)]
pub struct LocalClient {
    root: PathBuf,
}

impl LocalClient {
    /// Open a directory of local dumps.
    pub fn open(root: PathBuf) -> Self {
        Self { root }
    }

    /// The directory containing the dumps.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// All dump files in this directory.
    pub fn dumps(&self) -> Result<Vec<PathBuf>, Error> {
        let mut dumps: Vec<_> = self
            .root
            .read_dir()
            .with_context(|| format!("unable to read directory {}", self.root.display()))?
            .filter_map(|dirent| match dirent {
                Ok(de) => Some(de.path()),
                Err(err) => {
                    tracing::error!("unable to read directory {}: {err}", self.root.display());
                    None
                }
            })
            .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        dumps.sort();
        Ok(dumps)
    }
}

#[async_trait]
impl Jaeger for LocalClient {
    async fn services(&self) -> Result<Vec<String>, Error> {
        Ok(self
            .dumps()?
            .iter()
            .filter_map(|path| Some(path.file_stem()?.to_string_lossy().into_owned()))
            .collect())
    }

    async fn traces(&self, service: &str, query: &TraceQuery) -> Result<Vec<Trace>, Error> {
        let path = self.root.join(json_file_name(service));
        let file =
            File::open(&path).with_context(|| format!("unable to open {}", path.display()))?;
        let mut traces = vec![];
        for_each_trace(file, |trace| {
            if (query.limit == 0 || traces.len() < query.limit) && query.matches(&trace) {
                traces.push(trace);
            }
            Ok(())
        })?;
        Ok(traces)
    }

    async fn trace(&self, id: &str) -> Result<Option<Trace>, Error> {
        for path in self.dumps()? {
            let file = match File::open(&path) {
                Ok(file) => file,
                Err(err) => {
                    tracing::error!("unable to open {}: {err}", path.display());
                    continue;
                }
            };
            let mut found = None;
            let res = for_each_trace(file, |trace| {
                if found.is_none() && trace.trace_id == id {
                    found = Some(trace);
                }
                Ok(())
            });
            if let Err(err) = res {
                tracing::error!("dump {} is malformed: {err}", path.display());
                continue;
            }
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jaeger::{save_dump, test::trace};
    use std::fs;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, LocalClient) {
        let tmp = TempDir::new().unwrap();
        save_dump(tmp.path(), "frontend", &[trace("t1", 0), trace("t2", 10)]).unwrap();
        save_dump(tmp.path(), "backend", &[trace("t3", 20)]).unwrap();
        fs::write(tmp.path().join("notes.txt"), "not a dump").unwrap();
        fs::create_dir(tmp.path().join("nested.json")).unwrap();
        let client = LocalClient::open(tmp.path().into());
        (tmp, client)
    }

    #[async_std::test]
    async fn test_services() {
        let (_tmp, client) = fixture();
        assert_eq!(client.services().await.unwrap(), ["backend", "frontend"]);
    }

    #[async_std::test]
    async fn test_traces_limit_and_operation() {
        let (_tmp, client) = fixture();

        let all = client
            .traces(
                "frontend",
                &TraceQuery {
                    limit: 0,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(all, [trace("t1", 0), trace("t2", 10)]);

        let limited = client
            .traces(
                "frontend",
                &TraceQuery {
                    limit: 1,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(limited, [trace("t1", 0)]);

        let none = client
            .traces(
                "frontend",
                &TraceQuery {
                    operation: Some("not an operation".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[async_std::test]
    async fn test_missing_service() {
        let (_tmp, client) = fixture();
        client
            .traces("cart", &TraceQuery::default())
            .await
            .unwrap_err();
    }

    #[async_std::test]
    async fn test_trace_by_id() {
        let (tmp, client) = fixture();
        fs::write(tmp.path().join("corrupt.json"), "{\"data\": [").unwrap();
        assert_eq!(client.trace("t3").await.unwrap(), Some(trace("t3", 20)));
        assert_eq!(client.trace("t2").await.unwrap(), Some(trace("t2", 10)));
        assert_eq!(client.trace("t9").await.unwrap(), None);
    }
}
