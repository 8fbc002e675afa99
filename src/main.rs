use anyhow::{bail, Context, Result};
use clap::Parser;
use linescope::cli::{Cli, Command};
use linescope::config::Config;
use linescope::filter::ClassFilter;
use linescope::method::{ClassFile, ValueKind};
use linescope::planner::DispatchMode;
use linescope::registry::{
    DeltaListener, LineIndex, ListenerError, Registry, RegistryError, SourceCounts, MAX_LINES,
};
use linescope::source::{
    annotate, ChainedSourceProvider, FilesystemSourceProvider, SourceProvider,
};
use linescope::transformer::{ClassTransformer, Loader};
use linescope::update_loop::UpdateLoop;
use linescope::vm::{Machine, Value};
use linescope::wire;
use rand::Rng;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber; `--debug` forces TRACE, otherwise RUST_LOG
/// (default `warn`)
fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn read_class(path: &Path) -> Result<ClassFile> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse class JSON in {}", path.display()))
}

/// Print each method's plan followed by its rewritten listing
fn instrument_class(path: &Path, dispatch: DispatchMode) -> Result<()> {
    let class = read_class(path)?;
    let registry = Arc::new(Registry::new());
    let transformer = ClassTransformer::new(ClassFilter::none(), registry, dispatch);

    let Some(instrumented) = transformer.instrument(&class)? else {
        bail!("Class {} has no source file; lines cannot be attributed", class.name);
    };

    println!(
        "class {} (source {}, {} lines)",
        class.name,
        instrumented.source_path,
        instrumented.line_count()
    );
    for (name, plan) in &instrumented.plans {
        println!();
        println!("method {name}: {plan}");
        if let Some(method) = instrumented.class.method(name) {
            print!("{}", method.listing());
        }
    }
    Ok(())
}

/// Convert CLI integers to arguments matching the method's parameters
fn method_args(class: &ClassFile, method: &str, raw: &[i64]) -> Result<(bool, Vec<Value>)> {
    let body = class
        .method(method)
        .with_context(|| format!("Method {method} not found in {}", class.name))?;
    let params = body.parsed_descriptor()?.params;
    if params.len() != raw.len() {
        bail!(
            "Method {method} takes {} argument(s), {} given",
            params.len(),
            raw.len()
        );
    }

    let mut args = Vec::with_capacity(raw.len());
    for (param, &n) in params.iter().zip(raw) {
        let value = match param.kind() {
            ValueKind::Int => Value::Int(
                i32::try_from(n).with_context(|| format!("Argument {n} does not fit in int"))?,
            ),
            ValueKind::Long => Value::Long(n),
            other => bail!("Parameters of kind {other:?} cannot be passed from the command line"),
        };
        args.push(value);
    }
    Ok((body.is_static, args))
}

/// Source lookup: `--source-root` first, then the configured path
fn source_provider(config: &Config, source_root: Option<PathBuf>) -> ChainedSourceProvider {
    let mut provider = ChainedSourceProvider::new();
    if let Some(root) = source_root {
        provider = provider.with(FilesystemSourceProvider::new(root));
    }
    provider.with(FilesystemSourceProvider::new(config.source.root()))
}

/// Instrument, load and invoke one method, then print coverage
fn run_method(
    mut config: Config,
    path: &Path,
    method: &str,
    raw_args: &[i64],
    source_root: Option<PathBuf>,
    compact: bool,
) -> Result<()> {
    let class = read_class(path)?;
    if config.instrumentation.include.is_empty() && config.instrumentation.class_regex.is_none() {
        config.instrumentation.include = vec![class.name.clone()];
    }
    let provider = source_provider(&config, source_root);
    debug!(providers = provider.len(), "Source lookup");

    let registry = Arc::new(Registry::new());
    let transformer = ClassTransformer::from_config(&config, registry.clone())?;
    let (is_static, mut args) = method_args(&class, method, raw_args)?;

    let class_name = class.name.clone();
    let source_path = class.source_path();
    let rewritten = transformer.transform(Loader::Application, class);

    let mut machine = Machine::new(registry.clone());
    machine
        .load(rewritten)
        .with_context(|| format!("Failed to load {class_name}"))?;
    if !is_static {
        let receiver = machine.construct(&class_name)?;
        args.insert(0, receiver);
    }

    let outcome = machine.invoke(&class_name, method, args);
    let mut delta = SourceCounts::new();
    let changed = registry.update_listeners(&mut delta);
    debug!(lines = changed, "Collected visits");

    match &outcome {
        Ok(Some(value)) => eprintln!("{class_name}.{method} returned {value}"),
        Ok(None) => eprintln!("{class_name}.{method} returned"),
        Err(_) => {}
    }

    let totals = registry.accumulated();
    let rendered = match &source_path {
        Some(source_path) => provider
            .source(source_path)
            .with_context(|| format!("Failed to read source {source_path}"))?
            .map(|text| {
                let counts = totals.get(source_path).cloned().unwrap_or_default();
                annotate(&text, &counts)
            }),
        None => None,
    };

    match rendered {
        Some(text) => print!("{text}"),
        None => println!("{}", wire::coverage_json_string(&totals, !compact)),
    }

    outcome
        .map(|_| ())
        .with_context(|| format!("{class_name}.{method} failed"))
}

/// Registers, visits and updates concurrently, then checks that the
/// snapshot plus every delivered delta equals the visits made
fn stress(config: &Config, seconds: u64, threads: usize, lines: u32, files: u32) -> Result<()> {
    if threads == 0 || lines == 0 || files == 0 {
        bail!("--threads, --lines and --files must be greater than zero");
    }
    // Shared lines plus up to `lines` per worker
    let shared_lines = (files as usize)
        .checked_mul(lines as usize)
        .context("--files times --lines overflows")?;
    let needed = threads
        .checked_mul(lines as usize)
        .and_then(|own| own.checked_add(shared_lines))
        .filter(|&needed| needed <= MAX_LINES)
        .with_context(|| {
            format!("(--files + --threads) * --lines must not exceed {MAX_LINES} registered lines")
        })?;
    debug!(lines = needed, "Stress line budget");

    let registry = Arc::new(Registry::new());
    let mut shared = Vec::with_capacity(shared_lines);
    for file in 0..files {
        for line in 1..=lines {
            let path = format!("stress/File{file}.java");
            let index = registry
                .try_register_line(&path, line)
                .with_context(|| format!("Failed to register {path}:{line}"))?;
            shared.push(index);
        }
    }

    let delivered = Arc::new(Mutex::new(SourceCounts::new()));
    let sink = delivered.clone();
    let listener: Arc<dyn DeltaListener> =
        Arc::new(move |delta: &SourceCounts| -> Result<(), ListenerError> {
            let mut sink = sink.lock().map_err(|e| e.to_string())?;
            for (path, counts) in delta {
                let lines = sink.entry(path.clone()).or_default();
                for (&line, &count) in counts {
                    *lines.entry(line).or_default() += count;
                }
            }
            Ok(())
        });
    let snapshot = registry.current_snapshot(listener);

    let updater = UpdateLoop::spawn(registry.clone(), config.registry.update_interval())?;
    let stop = Arc::new(AtomicBool::new(false));
    let shared = Arc::new(shared);

    let mut workers = Vec::with_capacity(threads);
    for worker in 0..threads {
        let registry = registry.clone();
        let shared = shared.clone();
        let stop = stop.clone();
        let handle = thread::Builder::new()
            .name(format!("linescope-stress-{worker}"))
            .spawn(move || {
                let mut rng = rand::thread_rng();
                let mut own: Vec<LineIndex> = Vec::new();
                let mut visits: HashMap<LineIndex, u64> = HashMap::new();
                while !stop.load(Ordering::Relaxed) {
                    if own.len() < lines as usize && rng.gen_ratio(1, 256) {
                        let line = own.len() as u32 + 1;
                        let path = format!("stress/Worker{worker}.java");
                        own.push(registry.try_register_line(&path, line)?);
                    }
                    let index = if !own.is_empty() && rng.gen_bool(0.1) {
                        own[rng.gen_range(0..own.len())]
                    } else {
                        shared[rng.gen_range(0..shared.len())]
                    };
                    if rng.gen_bool(0.05) {
                        let count = rng.gen_range(0..16);
                        registry.add_visits(index, count);
                        *visits.entry(index).or_default() += count;
                    } else {
                        registry.visit_line(index);
                        *visits.entry(index).or_default() += 1;
                    }
                }
                Ok::<_, RegistryError>(visits)
            })?;
        workers.push(handle);
    }

    let started = Instant::now();
    thread::sleep(Duration::from_secs(seconds));
    stop.store(true, Ordering::Relaxed);

    let mut expected: HashMap<LineIndex, u64> = HashMap::new();
    for handle in workers {
        let visits = handle
            .join()
            .map_err(|_| anyhow::anyhow!("Stress worker panicked"))?
            .context("Stress worker failed to register a line")?;
        for (index, count) in visits {
            *expected.entry(index).or_default() += count;
        }
    }
    updater.stop();
    registry.update_listeners(&mut SourceCounts::new());

    let delivered = delivered
        .lock()
        .map_err(|_| anyhow::anyhow!("Delta sink poisoned"))?;
    let mut mismatches = 0usize;
    let mut total = 0u64;
    for (index, &count) in &expected {
        total += count;
        let Some((path, line)) = registry.line_identity(*index) else {
            bail!("Visited line {index} has no identity");
        };
        let seen = snapshot
            .get(&path)
            .and_then(|lines| lines.get(&line))
            .copied()
            .unwrap_or(0)
            + delivered
                .get(&path)
                .and_then(|lines| lines.get(&line))
                .copied()
                .unwrap_or(0);
        if seen != count {
            mismatches += 1;
            eprintln!("{path}:{line}: visited {count}, delivered {seen}");
        }
    }

    println!(
        "{} visits over {} lines by {} threads in {:.2}s, {} mismatch(es)",
        total,
        registry.line_count(),
        threads,
        started.elapsed().as_secs_f64(),
        mismatches
    );
    if mismatches > 0 {
        bail!("{mismatches} line(s) delivered a count different from the visits made");
    }
    info!(visits = total, "Stress run exact");
    Ok(())
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.debug);

    let config = Config::load(args.config.as_deref())?;

    match args.command {
        Command::Instrument { class, dispatch } => {
            instrument_class(&class, dispatch.unwrap_or(config.instrumentation.dispatch))
        }
        Command::Run {
            class,
            method,
            args: raw_args,
            dispatch,
            source_root,
            compact,
        } => {
            let mut config = config;
            if let Some(dispatch) = dispatch {
                config.instrumentation.dispatch = dispatch;
            }
            run_method(config, &class, &method, &raw_args, source_root, compact)
        }
        Command::Stress {
            seconds,
            threads,
            lines,
            files,
        } => stress(&config, seconds, threads, lines, files),
    }
}
