//! overflow_report - fetch and print a report from a running overflowd.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::time::Duration;

use overflow_monitor::Report;

const BANNER: &str = "==================== OVERFLOW REPORT ====================";

#[derive(Parser, Debug)]
#[command(author, version, about = "Print the current overflow report")]
struct Args {
    /// Address of the overflowd API.
    #[arg(long, env = "OVERFLOW_API_ADDR", default_value = "127.0.0.1:8800")]
    addr: String,

    /// Print the raw detection log instead of the aggregate report.
    #[arg(long)]
    detections: bool,

    /// Print raw JSON only.
    #[arg(long)]
    json: bool,

    /// Request timeout in seconds.
    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    if args.timeout_secs == 0 {
        return Err(anyhow!("--timeout-secs must be greater than zero"));
    }

    let agent = ureq::AgentBuilder::new()
        .timeout(Duration::from_secs(args.timeout_secs))
        .build();
    let path = if args.detections { "detections" } else { "report" };
    let url = format!("http://{}/{}", args.addr, path);
    let body: serde_json::Value = agent
        .get(&url)
        .call()
        .with_context(|| format!("request {}", url))?
        .into_json()
        .with_context(|| format!("decode response from {}", url))?;

    if args.json || args.detections {
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    let report: Report = serde_json::from_value(body).context("unexpected report shape")?;
    println!("{}", BANNER);
    println!("{}", serde_json::to_string_pretty(&report)?);
    println!("{}", BANNER);

    let summary = &report.detection_summary;
    println!("status:            {}", summary.status.as_str());
    println!("overflow score:    {:.2}", summary.overflow_score);
    println!(
        "detections:        {} across {} events",
        summary.total_detections, summary.detection_frequency
    );
    match &report.gps_location {
        Some(gps) => println!(
            "gps:               {:?}, {:?} ({})",
            gps.latitude, gps.longitude, gps.accuracy
        ),
        None => println!("gps:               none"),
    }
    Ok(())
}
