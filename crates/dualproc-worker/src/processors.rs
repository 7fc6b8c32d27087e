//! Built-in processors.

use std::thread;
use std::time::Duration;

use dualproc::CallArgs;
use dualproc::worker::{Operations, Processor, WorkerRegistry};
use serde::Deserialize;
use serde_json::Value;

/// Registry of every processor this executable can host.
pub fn registry() -> WorkerRegistry {
    WorkerRegistry::new()
        .register("echo", |_: ()| Ok(Echo))
        .register("counter", |args: Option<CounterArgs>| {
            Counter::new(args.unwrap_or_default())
        })
}

/// Stateless processor for exercising the call path.
pub struct Echo;

impl Processor for Echo {
    fn operations() -> Operations<Self> {
        Operations::new()
            .register("echo", |_: &mut Self, args: &CallArgs| {
                let x: Value = args.get(0, "x")?;
                Ok(x)
            })
            .register("uppercase", |_: &mut Self, args: &CallArgs| {
                let text: String = args.get(0, "text")?;
                Ok(text.to_uppercase())
            })
            .register("slow", |_: &mut Self, args: &CallArgs| {
                let ms: u64 = args.get_opt(0, "ms")?.unwrap_or(200);
                thread::sleep(Duration::from_millis(ms));
                Ok("slow")
            })
            .register("fast", |_: &mut Self, _: &CallArgs| Ok("fast"))
            .register("fail", |_: &mut Self, args: &CallArgs| -> anyhow::Result<()> {
                let message: String = args
                    .get_opt(0, "message")?
                    .unwrap_or_else(|| "requested failure".to_string());
                anyhow::bail!(message)
            })
            .register("panic", |_: &mut Self, _: &CallArgs| -> anyhow::Result<()> {
                panic!("requested panic")
            })
            .register("crash", |_: &mut Self, args: &CallArgs| -> anyhow::Result<()> {
                let code: i32 = args.get_opt(0, "code")?.unwrap_or(3);
                tracing::warn!(code, "exiting on request");
                std::process::exit(code)
            })
    }
}

/// Factory arguments of [`Counter`]. Omitting them starts at zero.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CounterArgs {
    pub start: i64,
}

/// Stateful processor: a single counter kept across calls.
#[derive(Debug)]
pub struct Counter {
    value: i64,
    calls: u64,
}

impl Counter {
    pub fn new(args: CounterArgs) -> anyhow::Result<Self> {
        anyhow::ensure!(args.start >= 0, "start must be non-negative, got {}", args.start);
        Ok(Self {
            value: args.start,
            calls: 0,
        })
    }
}

impl Processor for Counter {
    fn operations() -> Operations<Self> {
        Operations::new()
            .register("incr", |c: &mut Self, args: &CallArgs| {
                let by: i64 = args.get_opt(0, "by")?.unwrap_or(1);
                c.value = c
                    .value
                    .checked_add(by)
                    .ok_or_else(|| anyhow::anyhow!("counter overflow"))?;
                c.calls += 1;
                Ok(c.value)
            })
            .register("get", |c: &mut Self, _: &CallArgs| {
                c.calls += 1;
                Ok(c.value)
            })
            .register("stats", |c: &mut Self, _: &CallArgs| {
                c.calls += 1;
                Ok(serde_json::json!({ "value": c.value, "calls": c.calls }))
            })
            .register("reset", |c: &mut Self, _: &CallArgs| {
                c.value = 0;
                c.calls += 1;
                Ok(())
            })
    }
}
