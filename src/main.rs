//! defscan CLI: assessment definition evaluator.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};

use defscan::directives::DirectiveTable;
use defscan::error::ProbeError;
use defscan::model::{
    CriteriaNode, Definition, DefinitionModel, Entity, Object, ObjectContent, SubtypeId, Test,
    Variable, VariableKind,
};
use defscan::registry::{self, ListOptions, SUBTYPE_SYSINFO};
use defscan::session::{ProbeHandler, ProbeSession, QueryStatus};
use defscan::syschar::{Item, Sysinfo};
use defscan::worker::{
    self, IpcProbeHandler, WorkerOptions, WorkerProbe, channel_pair,
};

#[derive(Parser)]
#[command(name = "defscan", version, about = "Assessment definition evaluator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the compiled-in probe table.
    Probes {
        /// Also print numeric subtype ids and resolved executable paths.
        #[arg(long)]
        verbose: bool,

        /// Only list probes whose executable is present and executable.
        #[arg(long)]
        check: bool,
    },

    /// Evaluate a built-in demonstration definition against this host.
    Demo {
        /// File whose presence the demo definition checks.
        #[arg(long, default_value = "/etc/hostname")]
        path: PathBuf,
    },

    /// Parse a directives file, report its slots, and echo the canonical form.
    Directives {
        /// Path to a directives XML fragment.
        file: PathBuf,
    },
}

/// Demo collection backend: stats the path named by the object.
struct FileProbe;

impl WorkerProbe for FileProbe {
    fn evaluate(&self, _subtype: SubtypeId, object: &Object) -> Result<Vec<Item>, ProbeError> {
        let mut items = Vec::new();
        for content in &object.contents {
            let ObjectContent::Entity(Entity { name, value }) = content else {
                continue;
            };
            if name != "path" {
                continue;
            }
            let path = match value {
                defscan::model::EntityValue::Literal(p) => p.clone(),
                defscan::model::EntityValue::VarRef(_) => continue,
            };
            let meta = std::fs::metadata(&path).map_err(|e| ProbeError::Collect {
                message: format!("cannot stat {path}: {e}"),
            })?;
            items.push(Item::new(vec![
                ("path".into(), path),
                ("size".into(), meta.len().to_string()),
                (
                    "type".into(),
                    if meta.is_dir() { "directory" } else { "regular" }.into(),
                ),
            ]));
        }
        Ok(items)
    }

    fn sysinfo(&self) -> Result<Sysinfo, ProbeError> {
        let host = std::fs::read_to_string("/etc/hostname")
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| "localhost".into());
        Ok(Sysinfo {
            os_name: std::env::consts::OS.into(),
            os_version: String::new(),
            architecture: std::env::consts::ARCH.into(),
            primary_host_name: host,
        })
    }
}

/// One definition checking that a file exists, with a variable-derived path.
fn demo_model(path: &std::path::Path) -> DefinitionModel {
    let mut model = DefinitionModel::new();

    model.add_variable(Variable {
        id: "var:path".into(),
        kind: VariableKind::External {
            values: vec![path.display().to_string()],
        },
    });
    model.add_object(Object {
        id: "obj:target".into(),
        subtype: SubtypeId(30),
        contents: vec![ObjectContent::Entity(Entity::literal(
            "path",
            path.display().to_string(),
        ))],
    });
    model.add_test(Test {
        id: "tst:exists".into(),
        object_ref: Some("obj:target".into()),
        state_refs: vec![],
    });
    let leaf = model.add_node(CriteriaNode::Criterion {
        test_ref: "tst:exists".into(),
    });
    let root = model.add_node(CriteriaNode::Criteria { children: vec![leaf] });
    model.add_definition(Definition {
        id: "def:demo".into(),
        title: "target file is present".into(),
        criteria: Some(root),
    });
    model
}

fn run_demo(path: PathBuf) -> Result<()> {
    let (session_end, worker_end) = channel_pair();
    let worker_thread = std::thread::spawn(move || {
        worker::run(worker_end, Arc::new(FileProbe), WorkerOptions::default())
    });

    let model = Arc::new(demo_model(&path));
    let mut session = ProbeSession::new(model);
    let handler: Arc<dyn ProbeHandler> = Arc::new(IpcProbeHandler::new(session_end));
    session.register_handler(SubtypeId(30), Arc::clone(&handler));
    session.register_handler(SUBTYPE_SYSINFO, handler);

    let sysinfo = session.query_sysinfo().into_diagnostic()?;
    println!(
        "host: {} ({} {})",
        sysinfo.primary_host_name, sysinfo.os_name, sysinfo.architecture
    );

    let status = session.query_definition("def:demo").into_diagnostic()?;
    match status {
        QueryStatus::Success => println!("def:demo: evaluated"),
        QueryStatus::Warning => println!("def:demo: evaluated with warnings"),
    }

    if let Some(syschar) = session.syschars().get("obj:target") {
        println!("obj:target: {} ({} items)", syschar.flag, syschar.items.len());
        for item in &syschar.items {
            for (name, value) in &item.fields {
                println!("  {name} = {value}");
            }
        }
        for (text, severity) in &syschar.messages {
            println!("  [{severity:?}] {text}");
        }
    }

    // Session side drops first; the worker sees the hangup and exits.
    drop(session);
    match worker_thread.join() {
        Ok(result) => {
            let code = result.into_diagnostic()?;
            tracing::debug!(code, "worker finished");
        }
        Err(_) => miette::bail!("worker thread panicked"),
    }
    Ok(())
}

fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(3)
                .build(),
        )
    }))
    .ok(); // Ignore error if hook already set (e.g., in tests)

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Probes { verbose, check } => {
            let mut stdout = std::io::stdout().lock();
            registry::list_probes(
                &mut stdout,
                ListOptions {
                    verbose,
                    check_access: check,
                },
            )
            .into_diagnostic()?;
        }

        Commands::Demo { path } => run_demo(path)?,

        Commands::Directives { file } => {
            let content = std::fs::read_to_string(&file).into_diagnostic()?;
            let (table, warnings) = DirectiveTable::parse(&content).into_diagnostic()?;
            for warning in &warnings {
                tracing::warn!("{warning}");
            }
            for category in defscan::directives::ALL_CATEGORIES {
                println!(
                    "{:<28} reported={:<5} content={:?}",
                    category.element_name(),
                    table.reported(category),
                    table.content(category),
                );
            }
            println!("{}", table.serialize().into_diagnostic()?);
        }
    }

    Ok(())
}
