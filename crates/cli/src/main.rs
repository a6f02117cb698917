use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use oplive_core::{ChangedFields, Document, QueryDescriptor};
use oplive_driver::{DriverConfig, DriverContext, LiveQueries, ObserveHandle, ObserverEvent, OplogDriver, QueryPlan, StatsSnapshot, WriteFence};
use oplive_store::{MemoryDb, Tailer, TailerConfig};
use serde::Serialize;
use tracing::{info, warn};

mod scenario;

use scenario::Step;

#[derive(Parser, Debug)]
#[command(name = "oplivectl", version, about = "oplive live query tools")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a scenario against an in-memory store and print what observers see
    Replay {
        /// Scenario file (YAML)
        scenario: PathBuf,
    },
    /// Report whether a query descriptor can be served from the change stream
    Check {
        /// Query descriptor file (JSON)
        query: PathBuf,
    },
}

fn init_tracing() {
    let env = std::env::var("OPLIVE_LOG").unwrap_or_else(|_| "warn".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("OPLIVE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid OPLIVE_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Replay { scenario } => replay(&scenario, cli.output).await?,
        Commands::Check { query } => check(&query, cli.output)?,
    }
    Ok(())
}

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum EventRow {
    Added { id: String, fields: Document },
    Changed { id: String, fields: ChangedFields },
    Removed { id: String },
    Ready,
    Error { message: String },
}

impl From<ObserverEvent> for EventRow {
    fn from(ev: ObserverEvent) -> Self {
        match ev {
            ObserverEvent::Added { id, fields } => EventRow::Added { id, fields },
            ObserverEvent::Changed { id, fields } => EventRow::Changed { id, fields },
            ObserverEvent::Removed { id } => EventRow::Removed { id },
            ObserverEvent::Ready => EventRow::Ready,
            ObserverEvent::Error(message) => EventRow::Error { message },
        }
    }
}

impl EventRow {
    fn render(&self) -> String {
        match self {
            EventRow::Added { id, fields } => format!("+ {} {}", id, serde_json::Value::Object(fields.clone())),
            EventRow::Changed { id, fields } => format!("~ {} {}", id, serde_json::to_string(fields).unwrap_or_default()),
            EventRow::Removed { id } => format!("- {}", id),
            EventRow::Ready => "ready".to_string(),
            EventRow::Error { message } => format!("! {}", message),
        }
    }
}

#[derive(Serialize)]
struct StepReport {
    step: String,
    events: Vec<EventRow>,
    phase: &'static str,
    published: Vec<String>,
    buffer: Vec<String>,
    elapsed_ms: f64,
}

#[derive(Serialize)]
struct ReplayReport {
    query: QueryDescriptor,
    steps: Vec<StepReport>,
    stats: StatsSnapshot,
}

fn wait_secs() -> u64 {
    std::env::var("OPLIVE_WAIT_SECS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(5)
}

async fn replay(path: &PathBuf, output: Output) -> Result<()> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let sc = scenario::parse(&text).with_context(|| format!("parsing {}", path.display()))?;
    let collection = sc.query.collection.clone();
    info!(file = %path.display(), collection = %collection, steps = sc.steps.len(), "replay invoked");

    let tailer = Tailer::spawn(TailerConfig::from_env());
    let db = Arc::new(MemoryDb::with_encoding(sc.database.clone(), tailer.clone(), sc.encoding.into()));
    for doc in sc.seed {
        db.seed(&collection, doc)?;
    }
    let live = LiveQueries::new(DriverContext::new(db.clone(), tailer.clone(), DriverConfig::from_env()));
    let wait = Duration::from_secs(wait_secs());

    let t0 = Instant::now();
    let mut handle = live.observe_changes(sc.query.clone())?;
    let mut initial = Vec::new();
    loop {
        let ev = tokio::time::timeout(wait, handle.recv())
            .await
            .map_err(|_| anyhow!("no ready signal within {:?}", wait))?
            .ok_or_else(|| anyhow!("live query closed before ready"))?;
        let done = matches!(ev, ObserverEvent::Ready | ObserverEvent::Error(_));
        initial.push(EventRow::from(ev));
        if done {
            break;
        }
    }
    let mut reports = vec![report("initial".to_string(), initial, &handle, t0)];
    emit_step(output, &reports[0]);

    for step in &sc.steps {
        let t0 = Instant::now();
        match step {
            Step::Insert { doc } => {
                db.insert(&collection, doc.clone())?;
            }
            Step::Update { id, modifier } => {
                if !db.update(&collection, id, modifier)? {
                    warn!(id = %id, "update matched nothing");
                }
            }
            Step::Replace { id, doc } => {
                if !db.replace(&collection, id, doc.clone())? {
                    warn!(id = %id, "replace matched nothing");
                }
            }
            Step::Remove { id } => {
                db.remove(&collection, id)?;
            }
            Step::Drop { collection: target } => db.drop_collection(target.as_deref().unwrap_or(&collection)),
            Step::Gap => tailer.signal_gap(),
            Step::Failover => tailer.signal_failover(),
            Step::Fence => {}
        }
        let fence = WriteFence::new();
        live.notify_write(&collection, &fence)?;
        tokio::time::timeout(wait, fence.arm_and_wait())
            .await
            .map_err(|_| anyhow!("step {:?} did not settle within {:?}", step.label(), wait))?;
        let mut events = Vec::new();
        while let Some(ev) = handle.try_recv() {
            events.push(EventRow::from(ev));
        }
        let r = report(step.label(), events, &handle, t0);
        emit_step(output, &r);
        reports.push(r);
    }

    let stats = handle.driver().stats();
    match output {
        Output::Human => {
            println!(
                "stats: entries={} patched={} fetched={} queries={} requeries={} breaches={}",
                stats.entries, stats.direct_patches, stats.fetches, stats.queries, stats.requeries, stats.invariant_breaches
            );
        }
        Output::Json => {
            let out = ReplayReport { query: sc.query, steps: reports, stats };
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
    }
    handle.stop();
    Ok(())
}

fn report(step: String, events: Vec<EventRow>, handle: &ObserveHandle, t0: Instant) -> StepReport {
    let snap = handle.driver().snapshot();
    StepReport {
        step,
        events,
        phase: snap.phase.as_str(),
        published: snap.published_ids().into_iter().map(str::to_string).collect(),
        buffer: snap.buffer_ids().into_iter().map(str::to_string).collect(),
        elapsed_ms: t0.elapsed().as_secs_f64() * 1000.0,
    }
}

fn emit_step(output: Output, r: &StepReport) {
    if output != Output::Human {
        return;
    }
    println!("== {} ({:.1} ms)", r.step, r.elapsed_ms);
    for ev in &r.events {
        println!("  {}", ev.render());
    }
    println!("  [{}] published: {}  buffer: {}", r.phase, r.published.join(", "), r.buffer.join(", "));
}

fn check(path: &PathBuf, output: Output) -> Result<()> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let desc: QueryDescriptor = serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    let reason = match QueryPlan::compile("check", &desc) {
        Ok(plan) => OplogDriver::unsupported_reason(&desc, &plan.matcher).map(str::to_string),
        Err(e) => Some(e.to_string()),
    };
    match output {
        Output::Human => match &reason {
            None => println!("{}: supported", desc.collection),
            Some(r) => println!("{}: not supported ({})", desc.collection, r),
        },
        Output::Json => {
            #[derive(Serialize)]
            struct Verdict<'a> { collection: &'a str, supported: bool, reason: Option<String> }
            let v = Verdict { collection: &desc.collection, supported: reason.is_none(), reason };
            println!("{}", serde_json::to_string_pretty(&v)?);
        }
    }
    Ok(())
}
