//! Playground examples: directories of traces collected from a blueprint application.
//!
//! Each example is a leaf directory named
//!
//! ```text
//! {application}_{fault}_{representation}
//! ```
//!
//! where `fault` is `f` if a fault was injected into the application while the traces were
//! collected and `nf` otherwise, and `representation` is `orig` for raw Jaeger dumps collected at
//! the baseline or `tree` for span trees derived from them.

use super::{jaeger::LocalClient, tree};
use anyhow::{Context, Error};
use copy_dir::copy_dir;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use strum::{Display, EnumIter, EnumString};

/// Whether a fault was injected while collecting an example.
#[derive(
    Clone,
    Copy,
    Debug,
    Display,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    EnumIter,
    EnumString,
    Deserialize,
    Serialize,
)]
pub enum Fault {
    #[strum(serialize = "f")]
    #[serde(rename = "f")]
    Faulty,
    #[strum(serialize = "nf")]
    #[serde(rename = "nf")]
    NonFaulty,
}

/// How the traces in an example are represented.
#[derive(
    Clone,
    Copy,
    Debug,
    Display,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    EnumIter,
    EnumString,
    Deserialize,
    Serialize,
)]
pub enum Representation {
    /// Raw Jaeger API dumps, as collected.
    #[strum(serialize = "orig")]
    #[serde(rename = "orig")]
    Original,
    /// Span trees built from the raw dumps.
    #[strum(serialize = "tree")]
    #[serde(rename = "tree")]
    Tree,
}

/// A playground example.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub struct Example {
    pub application: String,
    pub fault: Fault,
    pub representation: Representation,
}

impl Example {
    pub fn new(
        application: impl Into<String>,
        fault: Fault,
        representation: Representation,
    ) -> Self {
        Self {
            application: application.into(),
            fault,
            representation,
        }
    }

    /// The same application and fault, in a different representation.
    pub fn with_representation(&self, representation: Representation) -> Self {
        Self {
            representation,
            ..self.clone()
        }
    }

    /// The directory of this example under the playground `root`.
    pub fn path(&self, root: impl AsRef<Path>) -> PathBuf {
        root.as_ref().join(self.to_string())
    }
}

impl Display for Example {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}",
            self.application, self.fault, self.representation
        )
    }
}

impl FromStr for Example {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // The application name may itself contain underscores, so split from the right.
        let mut parts = s.rsplitn(3, '_');
        let (Some(representation), Some(fault), Some(application)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::msg(format!(
                "{s} is not of the form {{application}}_{{f|nf}}_{{orig|tree}}"
            )));
        };
        if application.is_empty() {
            return Err(Error::msg(format!("{s} has an empty application name")));
        }
        Ok(Self {
            application: application.into(),
            fault: fault
                .parse()
                .map_err(|_| Error::msg(format!("invalid fault {fault} in {s}")))?,
            representation: representation
                .parse()
                .map_err(|_| Error::msg(format!("invalid representation {representation} in {s}")))?,
        })
    }
}

/// Find all examples under `root`.
///
/// Directories whose names are not example names are searched recursively. The results are sorted
/// by path.
pub fn discover(root: impl AsRef<Path>) -> Result<Vec<(PathBuf, Example)>, Error> {
    let root = root.as_ref();
    let mut examples = vec![];
    let mut dirs = vec![root.to_path_buf()];
    while let Some(dir) = dirs.pop() {
        let entries = match dir.read_dir() {
            Ok(entries) => entries,
            Err(err) if dir == root => {
                return Err(Error::msg(format!(
                    "unable to read playground {}: {err}",
                    root.display()
                )));
            }
            Err(err) => {
                tracing::error!("unable to read directory {}: {err}", dir.display());
                continue;
            }
        };
        for dirent in entries {
            let path = match dirent {
                Ok(de) => de.path(),
                Err(err) => {
                    tracing::error!("unable to read directory {}: {err}", dir.display());
                    continue;
                }
            };
            if !path.is_dir() {
                continue;
            }
            match path
                .file_name()
                .and_then(|name| name.to_str())
                .map(str::parse::<Example>)
            {
                Some(Ok(example)) => examples.push((path, example)),
                _ => dirs.push(path),
            }
        }
    }
    examples.sort();
    Ok(examples)
}

/// The examples written by [`create`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Created {
    /// Directory of raw dumps.
    pub orig: PathBuf,
    /// Directory of span trees.
    pub tree: PathBuf,
    /// Number of span trees written.
    pub trees: usize,
}

/// Create the `orig` and `tree` examples for `application` from a directory of dumps.
///
/// Fails if either example already exists. If creation fails part way, both examples are removed
/// again.
pub fn create(
    root: impl AsRef<Path>,
    application: &str,
    fault: Fault,
    dumps: impl AsRef<Path>,
) -> Result<Created, Error> {
    let root = root.as_ref();
    let orig = Example::new(application, fault, Representation::Original);
    let tree = orig.with_representation(Representation::Tree);
    let (orig_dir, tree_dir) = (orig.path(root), tree.path(root));
    for dir in [&orig_dir, &tree_dir] {
        if dir.exists() {
            return Err(Error::msg(format!(
                "example {} already exists",
                dir.display()
            )));
        }
    }

    fs::create_dir_all(root)
        .with_context(|| format!("unable to create playground {}", root.display()))?;
    match populate(dumps.as_ref(), &orig_dir, &tree_dir) {
        Ok(trees) => {
            tracing::info!("created examples {orig} and {tree} with {trees} span trees");
            Ok(Created {
                orig: orig_dir,
                tree: tree_dir,
                trees,
            })
        }
        Err(err) => {
            for dir in [&orig_dir, &tree_dir] {
                if let Err(err) = remove_if_exists(dir) {
                    tracing::error!("unable to remove {}: {err}", dir.display());
                }
            }
            Err(err)
        }
    }
}

/// Copy `dumps` into `orig_dir` and write span trees for every dump into `tree_dir`.
fn populate(dumps: &Path, orig_dir: &Path, tree_dir: &Path) -> Result<usize, Error> {
    for err in copy_dir(dumps, orig_dir)
        .with_context(|| format!("unable to copy {} to {}", dumps.display(), orig_dir.display()))?
    {
        tracing::error!("error copying {}: {err}", dumps.display());
    }

    fs::create_dir_all(tree_dir)
        .with_context(|| format!("unable to create {}", tree_dir.display()))?;
    let mut trees = 0;
    for dump in LocalClient::open(orig_dir.to_path_buf()).dumps()? {
        let file =
            File::open(&dump).with_context(|| format!("unable to open {}", dump.display()))?;
        trees += tree::write_dump_trees(file, tree_dir)
            .with_context(|| format!("unable to build span trees from {}", dump.display()))?;
    }
    Ok(trees)
}

fn remove_if_exists(dir: &Path) -> io::Result<()> {
    match fs::remove_dir_all(dir) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        res => res,
    }
}
