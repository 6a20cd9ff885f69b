use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use sluice_api::{EngineConfig, ReplayTransport, SearchDriver, TransportEvent};
use sluice_core::{QueryFacts, RequestDescriptor, RequestKind, StreamMessage, TraceId};
use sluice_store::ViewSnapshot;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "sluicectl", version, about = "Sluice CLI")]
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
    /// Feed recorded frames through the engine and print the final view
    Replay {
        /// Request descriptor (JSON); trace_id and facts are filled in when missing
        descriptor: PathBuf,
        /// One frame per line; `"request"` picks the stream (search|histogram|pageCount)
        frames: PathBuf,
    },
    /// Page-count estimate for a returned row count
    Estimate {
        #[arg(long = "rows-per-page")]
        rows_per_page: u64,
        /// 1-based page
        #[arg(long = "page", default_value_t = 1)]
        page: u64,
        /// Rows returned by the probe fetch
        #[arg(long = "returned")]
        returned: usize,
        /// Page size asked for (defaults to rows per page)
        #[arg(long = "size")]
        size: Option<u64>,
    },
    /// Classify every frame of a recording
    Decode {
        frames: PathBuf,
    },
}

fn init_tracing() {
    let env = std::env::var("SLUICE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("SLUICE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid SLUICE_METRICS_ADDR; expected host:port");
        }
    }
}

/// One parsed line of a recording.
#[derive(Debug, PartialEq)]
enum Frame {
    Event(RequestKind, TransportEvent),
    /// Well-formed frame of a kind the engine does not know.
    Unknown(RequestKind),
}

/// Lines are server envelopes, optionally tagged with `"request"`. `{"event": "reset"}`
/// and `{"event": "complete"}` stand in for transport signals.
fn parse_frame(line: &str) -> Result<Option<Frame>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let v: Value = serde_json::from_str(line).context("frame is not JSON")?;
    let kind = match v.get("request") {
        Some(k) => serde_json::from_value::<RequestKind>(k.clone()).context("unknown request kind")?,
        None => RequestKind::Search,
    };
    match v.get("event").and_then(Value::as_str) {
        Some("reset") => return Ok(Some(Frame::Event(kind, TransportEvent::Reset))),
        Some("complete") => return Ok(Some(Frame::Event(kind, TransportEvent::Complete))),
        Some(other) => anyhow::bail!("unknown transport event {other:?}"),
        None => {}
    }
    Ok(Some(match StreamMessage::from_value(v)? {
        Some(msg) => Frame::Event(kind, TransportEvent::Data(msg)),
        None => Frame::Unknown(kind),
    }))
}

fn read_lines(path: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(text.lines().map(str::to_string).collect())
}

fn load_scripts(path: &Path) -> Result<HashMap<RequestKind, Vec<TransportEvent>>> {
    let mut scripts: HashMap<RequestKind, Vec<TransportEvent>> = HashMap::new();
    for (n, line) in read_lines(path)?.iter().enumerate() {
        match parse_frame(line).with_context(|| format!("{}:{}", path.display(), n + 1))? {
            Some(Frame::Event(kind, ev)) => scripts.entry(kind).or_default().push(ev),
            Some(Frame::Unknown(_)) => warn!(line = n + 1, "skipping frame of unknown kind"),
            None => {}
        }
    }
    Ok(scripts)
}

fn load_descriptor(path: &Path) -> Result<RequestDescriptor> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut v: Value = serde_json::from_str(&text).context("descriptor is not JSON")?;
    let has_facts = v.get("facts").is_some();
    if let Some(obj) = v.as_object_mut() {
        obj.entry("trace_id").or_insert_with(|| Value::String(TraceId::generate().to_string()));
        obj.entry("kind").or_insert_with(|| Value::String(RequestKind::Search.as_str().to_string()));
    }
    let mut desc: RequestDescriptor = serde_json::from_value(v).context("invalid descriptor")?;
    if !has_facts {
        desc.facts = QueryFacts::sniff(&desc.query.sql);
    }
    Ok(desc)
}

fn print_snapshot(snap: &ViewSnapshot, notices: &[String]) {
    for (idx, q) in &snap.queries {
        let r = &q.results;
        let pages = r.page_count_total.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());
        println!(
            "query {}: hits={} total={} took={}ms scan={} page_count={} partial={} cancelled={}",
            idx,
            r.hits.len(),
            r.total,
            r.took,
            r.scan_size,
            pages,
            r.is_partial,
            r.cancelled
        );
        if !r.fields.is_empty() {
            let names: Vec<_> = r.fields.iter().map(|f| format!("{}({})", f.name, f.count)).collect();
            println!("  fields: {}", names.join(", "));
        }
        if let Some(e) = &r.error {
            println!("  error: {}", e.display);
        }
        let h = &q.histogram;
        if !h.is_empty() || h.error.is_some() {
            println!("  histogram: {} buckets, {} events, {:?}", h.len(), h.total(), h.state);
            if !h.chart_title.is_empty() {
                println!("  {}", h.chart_title);
            }
            if let Some(e) = &h.error {
                println!("  histogram error: {}", e.message);
            }
        }
    }
    for n in notices {
        println!("notice: {}", n.replace('\n', " "));
    }
    if snap.cancelled {
        println!("(cancelled)");
    }
}

async fn replay(descriptor: &Path, frames: &Path, output: Output) -> Result<()> {
    let config = EngineConfig::from_env();
    config.validate()?;
    let desc = load_descriptor(descriptor)?;
    let scripts = load_scripts(frames)?;
    info!(trace = %desc.trace_id, streams = scripts.len(), "replay invoked");

    let want_histogram = desc.meta.show_histogram && scripts.contains_key(&RequestKind::Histogram);
    let mut transport = ReplayTransport::new().with_queue_cap(config.queue_cap);
    for (kind, events) in scripts {
        transport = transport.with_script(kind, events);
    }
    let (mut driver, _handle) = SearchDriver::new(Arc::new(transport), config);

    let t0 = Instant::now();
    let histogram = want_histogram.then(|| desc.derive(RequestKind::Histogram));
    driver.start(desc).await?;
    if let Some(h) = histogram {
        driver.start(h).await?;
    }

    let token = driver.cancel_token();
    let ctrl_c = tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received; cancelling replay");
            token.cancel();
        }
    });
    let snap = driver.run().await?;
    ctrl_c.abort();
    info!(epoch = snap.epoch, took_ms = %t0.elapsed().as_millis(), "replay finished");

    match output {
        Output::Human => print_snapshot(&snap, driver.notices()),
        Output::Json => {
            #[derive(serde::Serialize)]
            struct Report<'a> { snapshot: &'a ViewSnapshot, notices: &'a [String] }
            println!("{}", serde_json::to_string_pretty(&Report { snapshot: &snap, notices: driver.notices() })?);
        }
    }
    Ok(())
}

fn decode(frames: &Path, output: Output) -> Result<()> {
    #[derive(serde::Serialize)]
    struct Row {
        line: usize,
        request: &'static str,
        kind: String,
        route: String,
    }
    let mut rows = Vec::new();
    for (n, line) in read_lines(frames)?.iter().enumerate() {
        let (request, kind, route) = match parse_frame(line) {
            Ok(None) => continue,
            Ok(Some(Frame::Event(k, TransportEvent::Data(msg)))) => {
                metrics::counter!("sluicectl_frames_decoded_total", 1u64, "kind" => msg.kind_label());
                (k.as_str(), msg.kind_label().to_string(), format!("{:?}", sluice_search::route(k, &msg)))
            }
            Ok(Some(Frame::Event(k, ev))) => (k.as_str(), format!("{ev:?}").to_lowercase(), "Transport".to_string()),
            Ok(Some(Frame::Unknown(k))) => (k.as_str(), "unknown".to_string(), "Drop".to_string()),
            Err(e) => ("-", format!("invalid: {e:#}"), "Drop".to_string()),
        };
        rows.push(Row { line: n + 1, request, kind, route });
    }
    match output {
        Output::Human => {
            println!("LINE  REQUEST    KIND          ROUTE");
            for r in &rows {
                println!("{:<5} {:<10} {:<13} {}", r.line, r.request, r.kind, r.route);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Replay { descriptor, frames } => replay(&descriptor, &frames, cli.output).await?,
        Commands::Estimate { rows_per_page, page, returned, size } => {
            let size = size.unwrap_or(rows_per_page);
            let est = sluice_search::page_count::estimate(rows_per_page, page, size, returned);
            match cli.output {
                Output::Human => {
                    println!("page_count_total: {}", est.page_count_total);
                    match est.trim_to {
                        Some(n) => println!("more pages: yes (trim to {n})"),
                        None => println!("more pages: no"),
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&est)?),
            }
        }
        Commands::Decode { frames } => decode(&frames, cli.output)?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_defaults_to_search_stream() {
        let f = parse_frame(r#"{"type":"search_response_hits","content":{"results":{"hits":[{"a":1}]}}}"#).unwrap();
        assert!(matches!(f, Some(Frame::Event(RequestKind::Search, TransportEvent::Data(StreamMessage::Hits(_))))));
    }

    #[test]
    fn request_tag_and_transport_events() {
        let f = parse_frame(r#"{"request":"pageCount","event":"reset"}"#).unwrap();
        assert_eq!(f, Some(Frame::Event(RequestKind::PageCount, TransportEvent::Reset)));
        assert!(parse_frame(r#"{"event":"explode"}"#).is_err());
    }

    #[test]
    fn blank_comment_and_unknown_lines() {
        assert_eq!(parse_frame("   ").unwrap(), None);
        assert_eq!(parse_frame("# recorded 2024-05-01").unwrap(), None);
        assert_eq!(parse_frame(r#"{"request":"histogram","type":"heartbeat"}"#).unwrap(), Some(Frame::Unknown(RequestKind::Histogram)));
        assert!(parse_frame("not json").is_err());
    }
}
