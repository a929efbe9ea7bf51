//! Two workers bouncing a counter between their processes.
//!
//! ```text
//! procpool-demo [--direct] [--rounds <n>]
//! ```
//!
//! Stop with Ctrl-C; both workers drain and exit, then the master returns.

use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use procpool::{PoolConfig, PoolRole, ProcessPool, ProcessTable, SubProcess, WorkerContext};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

struct Ping {
    rounds: u64,
}

#[async_trait::async_trait]
impl SubProcess for Ping {
    fn name(&self) -> String {
        "ping".into()
    }

    async fn run(&self, ctx: WorkerContext) -> anyhow::Result<()> {
        // The peer may not have bound its socket yet.
        while ctx.is_running() {
            match ctx.send_message(&json!({ "n": 0 }), "pong").await {
                Ok(()) => break,
                Err(procpool::WorkerError::AddressUnavailable { .. }) => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(e) => return Err(e).context("first ping failed"),
            }
        }
        Ok(())
    }

    async fn on_pipe_message(&self, ctx: &WorkerContext, data: Value, from: Option<&str>) -> bool {
        let Some(n) = data["n"].as_u64() else {
            return false;
        };
        tracing::info!(n, from, "ping got");
        if n >= self.rounds {
            tracing::info!("All rounds done");
            return true;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        if let Err(e) = ctx.send_message(&json!({ "n": n + 1 }), "pong").await {
            tracing::warn!(error = %e, "Failed to ping");
        }
        true
    }

    async fn on_exit(&self, _ctx: &WorkerContext) {
        tracing::info!("ping leaving");
    }
}

struct Pong;

#[async_trait::async_trait]
impl SubProcess for Pong {
    fn name(&self) -> String {
        "pong".into()
    }

    async fn run(&self, ctx: WorkerContext) -> anyhow::Result<()> {
        let token = ctx.cancellation_token();
        ctx.spawn("uptime", async move {
            let mut ticks = 0u64;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(5)) => {
                        ticks += 1;
                        tracing::debug!(seconds = ticks * 5, "pong alive");
                    }
                }
            }
        });
        Ok(())
    }

    async fn on_pipe_message(&self, ctx: &WorkerContext, data: Value, from: Option<&str>) -> bool {
        let (Some(n), Some(from)) = (data["n"].as_u64(), from) else {
            return false;
        };
        tracing::info!(n, from, "pong got");
        if let Err(e) = ctx.send_message(&json!({ "n": n + 1 }), from).await {
            tracing::warn!(error = %e, "Failed to pong");
        }
        true
    }

    fn wait_for_tasks(&self) -> bool {
        true
    }
}

struct Args {
    direct: bool,
    rounds: u64,
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut parsed = Args {
        direct: false,
        rounds: 10,
    };
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--direct" => parsed.direct = true,
            "--rounds" => {
                i += 1;
                let raw = args.get(i).ok_or("--rounds requires a value")?;
                parsed.rounds = raw
                    .parse()
                    .map_err(|_| format!("invalid round count: {raw}"))?;
            }
            "--help" | "-h" => return Err(String::new()),
            other => return Err(format!("unknown argument: {other}")),
        }
        i += 1;
    }
    Ok(parsed)
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    procpool::logging::init_tracing();

    let argv: Vec<String> = std::env::args().collect();
    let args = match parse_args(&argv) {
        Ok(args) => args,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: procpool-demo [--direct] [--rounds <n>]");
            process::exit(2);
        }
    };

    if let Err(e) = run(args).await {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = PoolConfig::from_env();

    if !args.direct {
        let mut pool = ProcessPool::native(config);
        register(&mut pool, args.rounds)?;
        pool.serve().await.context("native pool failed")?;
        return Ok(());
    }

    let table = Arc::new(ProcessTable::new());
    let mut pool = ProcessPool::direct(config, table.clone());
    register(&mut pool, args.rounds)?;

    match pool.start().await.context("direct pool failed")? {
        PoolRole::Worker(id) => {
            tracing::info!(worker_id = %id, "Worker process exiting");
            process::exit(0);
        }
        PoolRole::Master => {
            let shutdown = CancellationToken::new();
            let trigger = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    trigger.cancel();
                }
            });
            table.run(shutdown).await.context("process table failed")?;
        }
    }
    Ok(())
}

fn register(pool: &mut ProcessPool, rounds: u64) -> anyhow::Result<()> {
    pool.add(Ping { rounds })?;
    pool.add(Pong)?;
    pool.on_pool_start(|directory| async move {
        let names: Vec<&str> = directory.names().collect();
        tracing::info!(?names, master_pid = directory.master_pid(), "Pool started");
    });
    Ok(())
}
