//! callguard CLI — exercise the middleware stack from the terminal.
//!
//! Usage:
//! ```bash
//! # Drive 200 calls through a client stack whose dependency fails 70% of the time
//! callguard simulate --calls 200 --failure-rate 0.7
//!
//! # Same, with idempotency tokens so transient failures are retried
//! callguard simulate --calls 200 --failure-rate 0.3 --idempotent
//!
//! # Print the configuration derived from the environment
//! callguard config
//! ```

use std::collections::BTreeMap;
use std::env;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use callguard_core::{endpoint_fn, CallContext, Code, Request, Response, Status};
use callguard_stack::{ClientStack, MiddlewareConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "simulate" => cmd_simulate(&args[2..]).await,
        "config" => cmd_config(),
        "version" | "--version" | "-V" => {
            println!("callguard {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn print_usage() {
    println!("callguard {}", env!("CARGO_PKG_VERSION"));
    println!("Resilient call middleware: rate limiter, circuit breaker, retry, recovery\n");
    println!("USAGE:");
    println!("    callguard <COMMAND>\n");
    println!("COMMANDS:");
    println!("    simulate   Drive calls through a client stack against a flaky dependency");
    println!("    config     Print the effective configuration (from environment)");
    println!("    version    Print version");
    println!("    help       Print this help\n");
    println!("SIMULATE FLAGS:");
    println!("    --calls <N>            Number of calls  [default: 100]");
    println!("    --failure-rate <F>     Fraction of transport attempts that fail  [default: 0.5]");
    println!("    --idempotent           Attach an idempotency token to every call");
    println!("\nSet RUST_LOG=info to watch breaker transitions and retries.");
}

async fn cmd_simulate(args: &[String]) -> Result<(), String> {
    let calls: u64 = parse_flag(args, "--calls")
        .map(|v| v.parse().map_err(|_| format!("invalid --calls: {v}")))
        .transpose()?
        .unwrap_or(100);
    let failure_rate: f64 = parse_flag(args, "--failure-rate")
        .map(|v| v.parse().map_err(|_| format!("invalid --failure-rate: {v}")))
        .transpose()?
        .unwrap_or(0.5);
    if !(0.0..=1.0).contains(&failure_rate) {
        return Err(format!("--failure-rate must be within [0, 1], got {failure_rate}"));
    }
    let idempotent = args.iter().any(|a| a == "--idempotent");

    let config = MiddlewareConfig::from_env().map_err(|e| e.to_string())?;
    tracing::info!(calls, failure_rate, idempotent, "starting simulation");

    let attempts = Arc::new(AtomicU64::new(0));
    let seen = attempts.clone();
    // Failures are spread evenly: attempt n fails when it crosses a multiple of 1/rate.
    let transport = endpoint_fn(move |_ctx, _req| {
        let n = seen.fetch_add(1, Ordering::SeqCst) as f64;
        let fails = (n * failure_rate).floor() != ((n + 1.0) * failure_rate).floor();
        async move {
            if fails {
                Err(Status::unavailable("simulated outage"))
            } else {
                Ok(Response::default())
            }
        }
    });
    let stack = ClientStack::from_config(transport, &config.client);

    let mut outcomes: BTreeMap<Code, u64> = BTreeMap::new();
    for i in 0..calls {
        let mut ctx = CallContext::new();
        if idempotent {
            ctx = ctx.with_idempotency_token(format!("sim-{i}"));
        }
        let code = match stack.call(&ctx, Request::empty("/simulated.v1/Call")).await {
            Ok(_) => Code::Ok,
            Err(status) => status.code(),
        };
        *outcomes.entry(code).or_default() += 1;
    }
    tracing::info!(
        calls,
        attempts = attempts.load(Ordering::SeqCst),
        "simulation finished"
    );

    println!("Calls:              {calls}");
    println!("Transport attempts: {}", attempts.load(Ordering::SeqCst));
    println!("Outcomes:");
    for (code, count) in &outcomes {
        println!("  {code:<20} {count}");
    }
    if let Some(breaker) = stack.breaker() {
        println!("Breaker:            {} ({})", breaker.state(), breaker.name());
    }

    Ok(())
}

fn cmd_config() -> Result<(), String> {
    let config = MiddlewareConfig::from_env().map_err(|e| e.to_string())?;
    let json = serde_json::to_string_pretty(&config).map_err(|e| e.to_string())?;
    println!("{json}");
    Ok(())
}

fn parse_flag(args: &[String], flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    args.get(pos + 1).cloned()
}
