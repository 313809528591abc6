use anyhow::{Context, Error};
use clap::{Args, Parser, Subcommand};
use std::fs::File;
use std::io;
use std::path::PathBuf;
use trace_model::{
    export::{self, Exporter},
    init_logging,
    jaeger::{self, Jaeger, LocalClient, TraceQuery},
    playground::{self, Fault},
    show::show,
    tree,
};

/// Collect traces from Jaeger and turn them into summaries and span trees.
#[derive(Parser)]
enum Command {
    /// Pull the latest traces from a Jaeger query service and export their summaries.
    Pull {
        #[clap(flatten)]
        jaeger: jaeger::Options,

        /// Save the raw responses for each service to DIR.
        #[clap(long, env = "TRACES_RAW", value_name = "DIR")]
        raw: Option<PathBuf>,

        #[clap(flatten)]
        target: Target,
    },
    /// Export summaries of traces saved in local dumps.
    Read {
        /// The directory containing the dumps.
        ///
        /// This should be a directory with the structure
        ///
        ///     DIR/
        ///         <service>.json
        ///
        /// such as the one written by `pull --raw DIR`.
        #[clap(short, long, env = "TRACES_DATA_DIR", value_name = "DIR")]
        dir: PathBuf,

        #[clap(flatten)]
        target: Target,
    },
    /// Export summaries of every trace in a single dump file.
    Summarize {
        /// The dump to read.
        dump: PathBuf,

        /// Name of the data file to write, without extension. Defaults to the name of the dump.
        #[clap(short, long)]
        name: Option<String>,

        /// Write summaries to DIR.
        #[clap(short, long, env = "TRACES_OUT", value_name = "DIR", default_value = "traces")]
        out: PathBuf,

        #[clap(flatten)]
        export: export::Options,
    },
    /// Write a span tree for every trace in a dump file.
    Tree {
        /// The dump to read.
        dump: PathBuf,

        /// Write one `<traceID>.json` file per trace to DIR.
        #[clap(short, long, env = "TRACES_TREES", value_name = "DIR")]
        out: PathBuf,
    },
    /// Print traces by ID.
    Show {
        /// IDs of the traces to print.
        #[clap(required = true)]
        ids: Vec<String>,

        /// Print span trees instead of raw traces.
        #[clap(long)]
        tree: bool,

        /// Look the traces up in local dumps in DIR instead of the Jaeger API.
        #[clap(short, long, env = "TRACES_DATA_DIR", value_name = "DIR")]
        dir: Option<PathBuf>,

        #[clap(flatten)]
        jaeger: jaeger::Options,
    },
    /// Manage playground examples.
    #[clap(subcommand)]
    Playground(PlaygroundCommand),
}

#[derive(Subcommand)]
enum PlaygroundCommand {
    /// List the examples in a playground.
    List {
        /// The root directory of the playground.
        #[clap(short, long, env = "PLAYGROUND_ROOT", value_name = "DIR")]
        root: PathBuf,
    },
    /// Create the `orig` and `tree` examples for an application from a directory of dumps.
    Create {
        /// The root directory of the playground.
        #[clap(short, long, env = "PLAYGROUND_ROOT", value_name = "DIR")]
        root: PathBuf,

        /// The blueprint application the traces were collected from.
        #[clap(short, long, value_name = "APP")]
        application: String,

        /// Whether a fault was injected (`f`) or not (`nf`).
        #[clap(short, long)]
        fault: Fault,

        /// The directory of dumps to copy into the example.
        #[clap(short, long, value_name = "DIR")]
        dumps: PathBuf,
    },
}

/// Which traces to pull and where to put them.
#[derive(Args)]
struct Target {
    /// Only pull traces for SERVICE. May be repeated; defaults to every service.
    #[clap(
        short,
        long = "service",
        env = "JAEGER_SERVICES",
        value_name = "SERVICE",
        value_delimiter = ','
    )]
    services: Vec<String>,

    #[clap(flatten)]
    query: TraceQuery,

    /// Write summaries to DIR.
    #[clap(short, long, env = "TRACES_OUT", value_name = "DIR", default_value = "traces")]
    out: PathBuf,

    /// Also write a span tree for every trace to DIR.
    #[clap(long, env = "TRACES_TREES", value_name = "DIR")]
    trees: Option<PathBuf>,

    #[clap(flatten)]
    export: export::Options,
}

#[async_std::main]
async fn main() -> Result<(), Error> {
    init_logging();

    match Command::parse() {
        Command::Pull {
            jaeger,
            raw,
            target,
        } => {
            let client = jaeger.connect()?;
            pull(&client, target, raw).await?;
        }
        Command::Read { dir, target } => {
            let client = LocalClient::open(dir);
            pull(&client, target, None).await?;
        }
        Command::Summarize {
            dump,
            name,
            out,
            export,
        } => {
            let name = match name {
                Some(name) => name,
                None => dump
                    .file_stem()
                    .ok_or_else(|| Error::msg(format!("{} has no file name", dump.display())))?
                    .to_string_lossy()
                    .into_owned(),
            };
            let file =
                File::open(&dump).with_context(|| format!("unable to open {}", dump.display()))?;
            let mut exporter = Exporter::new(out, export)?;
            exporter.export_dump(&name, file)?;
        }
        Command::Tree { dump, out } => {
            let file =
                File::open(&dump).with_context(|| format!("unable to open {}", dump.display()))?;
            tree::write_dump_trees(file, out)?;
        }
        Command::Show {
            ids,
            tree,
            dir,
            jaeger,
        } => match dir {
            Some(dir) => show(&LocalClient::open(dir), &ids, tree, io::stdout()).await?,
            None => show(&jaeger.connect()?, &ids, tree, io::stdout()).await?,
        },
        Command::Playground(PlaygroundCommand::List { root }) => {
            for (path, example) in playground::discover(&root)? {
                println!(
                    "{}\t{}\t{}\t{}",
                    example.application,
                    example.fault,
                    example.representation,
                    path.display()
                );
            }
        }
        Command::Playground(PlaygroundCommand::Create {
            root,
            application,
            fault,
            dumps,
        }) => {
            let created = playground::create(&root, &application, fault, &dumps)?;
            println!("{}", serde_json::to_string_pretty(&created)?);
        }
    }

    Ok(())
}

async fn pull<J: Jaeger + Sync>(
    jaeger: &J,
    target: Target,
    raw: Option<PathBuf>,
) -> Result<(), Error> {
    let services = if target.services.is_empty() {
        jaeger.services().await?
    } else {
        target.services
    };
    tracing::info!("{} services to pull", services.len());

    let mut exporter = Exporter::new(target.out, target.export)?;
    let reports = export::update(
        &mut exporter,
        jaeger,
        services,
        &target.query,
        raw.as_deref(),
        target.trees.as_deref(),
    )
    .await?;
    let written: usize = reports.iter().map(|report| report.written).sum();
    let total: usize = reports.iter().map(|report| report.total).sum();
    tracing::info!(
        "{written}/{total} traces written; {} traces cached",
        exporter.cache().len()
    );
    Ok(())
}
