//! Replay every class of a jar through the planner and print statistics.
//!
//! Uses a pass-through editor (probes are zero bytes long), so the numbers
//! measure parsing and planning, not bytecode generation.

use std::fs::File;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use log::{LevelFilter, Metadata, Record};
use zip::ZipArchive;

use probeplan::classpath::ClasspathProvider;
use probeplan::{
    BytecodeEditor, ClassRecord, EditedMethod, EditorVeto, InjKind, LoadSnapshot, Planner,
    PlannerSettings, RootSet,
};

#[derive(Parser, Debug)]
#[command(
    name = "jar_plan_bench",
    about = "Replay a jar through the instrumentation planner and report timing.",
    version
)]
struct Cli {
    /// Jar file to replay.
    jar: PathBuf,
    /// Root class patterns (slash or dot form, terminal `*` allowed).
    /// With none given, the implicit-root heuristics apply.
    #[arg(long)]
    root: Vec<String>,
    /// Treat roots as markers instead.
    #[arg(long)]
    marker: bool,
    /// Log planner debug output to stderr.
    #[arg(long)]
    verbose: bool,
}

/// Editor that "rewrites" a method to its original bytes. Good enough to
/// drive the planner's bookkeeping without generating code.
struct PassThroughEditor;

impl BytecodeEditor for PassThroughEditor {
    fn instrument(
        &mut self,
        class: &mut ClassRecord,
        method_idx: usize,
        _kind: InjKind,
        _method_id: u16,
    ) -> Result<EditedMethod, EditorVeto> {
        Ok(EditedMethod {
            method_info: class.orig_method_info(method_idx).to_vec(),
            appended_cp_entries: 0,
        })
    }
}

struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("{:>5} {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

fn main() -> Result<()> {
    let cli = Cli::parse();

    log::set_logger(&LOGGER).ok();
    log::set_max_level(if cli.verbose { LevelFilter::Debug } else { LevelFilter::Warn });

    let mut provider = ClasspathProvider::new();
    provider
        .add_jar(&cli.jar)
        .with_context(|| format!("failed to open {}", cli.jar.display()))?;

    let mut planner =
        Planner::new(Box::new(provider), Box::new(PassThroughEditor), PlannerSettings::default());

    let mut roots = RootSet::new();
    for pattern in &cli.root {
        if cli.marker {
            roots.add_marker(pattern, "*", "");
        } else {
            roots.add_root(pattern, "*", "");
        }
    }

    let file = File::open(&cli.jar).with_context(|| format!("failed to open {}", cli.jar.display()))?;
    let mut archive =
        ZipArchive::new(file).with_context(|| format!("failed to read {}", cli.jar.display()))?;

    let mut class_names = Vec::new();
    for i in 0..archive.len() {
        let entry = archive.by_index(i).context("failed to read jar entry")?;
        let name = entry.name();
        if let Some(stripped) = name.strip_suffix(".class") {
            if !stripped.ends_with("module-info") {
                class_names.push(stripped.to_string());
            }
        }
    }

    let start = Instant::now();
    let initial_pack = planner.initial(&LoadSnapshot::default(), roots);
    let mut planned: u64 = initial_pack.len() as u64;
    let mut skipped: u64 = 0;

    for name in &class_names {
        let pack = planner.on_class_load(name, 0);
        planned += pack.len() as u64;
    }
    for fault in planner.take_faults() {
        skipped += 1;
        eprintln!("skipped {}: {}", fault.class_name, fault.error);
    }
    let dur = start.elapsed();

    let secs = dur.as_secs_f64();
    let ns_per = if class_names.is_empty() {
        0.0
    } else {
        dur.as_nanos() as f64 / class_names.len() as f64
    };

    println!("jar_path={}", cli.jar.display());
    println!("class_files={}", class_names.len());
    println!("classes_in_repo={}", planner.repository().class_count());
    println!("methods_planned={planned} classes_skipped={skipped}");
    println!("plan_time_ms={:.3}", secs * 1000.0);
    println!("ns_per_class={ns_per:.1}");

    Ok(())
}
