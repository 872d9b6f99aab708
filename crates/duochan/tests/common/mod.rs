//! Types and helpers shared by the channel suites.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::Ordering;
use std::time::Duration;

use duochan::Call;
use duochan::Channel;
use duochan::Class;
use duochan::Fault;
use duochan::Module;
use duochan::Remote;
use duochan::RemoteProxy;
use tokio::sync::watch;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn unique_name() -> String {
    format!("duochan-{:016x}", rand::random::<u64>())
}

pub fn module() -> Arc<Module> {
    Module::builder("suite")
        .register::<Counter>()
        .register::<Greeter>()
        .register::<Gate>()
        .register::<Hub>()
        .register::<Named>()
        .build()
}

/// Opens the owner end, then the guest end, of a fresh channel.
pub fn open_pair(module: Arc<Module>) -> anyhow::Result<(Channel, Channel)> {
    init_tracing();
    let name = unique_name();
    let owner = Channel::builder(&name).owner(true).module(module.clone()).open()?;
    let guest = Channel::builder(&name).module(module).open()?;
    Ok((owner, guest))
}

/// Polls `condition` for up to two seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

// ============================================================================
//  REMOTE TYPES
// ============================================================================

/// Marker interface implemented by `Counter`.
pub struct Named;

impl Remote for Named {
    const TYPE_NAME: &'static str = "suite.Named";
}

#[derive(Default)]
pub struct Counter {
    count: AtomicI32,
}

impl Counter {
    pub fn get(&self) -> i32 {
        self.count.load(Ordering::SeqCst)
    }

    fn increment(&self) -> Result<i32, Fault> {
        Ok(self.count.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn add(&self, n: i32) -> Result<i32, Fault> {
        Ok(self.count.fetch_add(n, Ordering::SeqCst) + n)
    }

    fn merge(&self, other: Arc<Counter>) -> Result<i32, Fault> {
        Ok(self.get() + other.get())
    }

    fn fail(&self) -> Result<(), Fault> {
        Err(Fault::invocation("counter refused"))
    }
}

impl Remote for Counter {
    const TYPE_NAME: &'static str = "suite.Counter";

    fn describe(class: &mut Class<Self>) {
        class
            .constructor(Counter::default)
            .implements::<Named>()
            .method("increment", Counter::increment)
            .method("add", Counter::add)
            .method("merge", Counter::merge)
            .method("fail", Counter::fail)
            .property("count", Counter::get);
    }
}

pub struct Greeter {
    prefix: String,
}

impl Greeter {
    pub fn new(prefix: &str) -> Self {
        Self { prefix: prefix.to_string() }
    }

    fn greet(&self, who: String) -> Result<String, Fault> {
        Ok(format!("{}, {}!", self.prefix, who))
    }
}

impl Remote for Greeter {
    const TYPE_NAME: &'static str = "suite.Greeter";

    fn describe(class: &mut Class<Self>) {
        class
            .constructor(|| Greeter::new("Hello"))
            .method("greet", Greeter::greet);
    }
}

/// Holds `wait` calls until `release` is called.
pub struct Gate {
    released: watch::Sender<bool>,
}

impl Default for Gate {
    fn default() -> Self {
        Self { released: watch::channel(false).0 }
    }
}

impl Gate {
    fn release(&self) -> Result<(), Fault> {
        self.released.send_replace(true);
        Ok(())
    }

    fn ping(&self) -> Result<i32, Fault> {
        Ok(1)
    }
}

async fn wait(gate: Arc<Gate>) -> Result<String, Fault> {
    let mut rx = gate.released.subscribe();
    rx.wait_for(|open| *open)
        .await
        .map_err(|_| Fault::invocation("gate dropped"))?;
    Ok("released".to_string())
}

/// Fails once the gate opens.
async fn refuse(gate: Arc<Gate>) -> Result<String, Fault> {
    wait(gate).await?;
    Err(Fault::invocation("gate refused"))
}

impl Remote for Gate {
    const TYPE_NAME: &'static str = "suite.Gate";

    fn describe(class: &mut Class<Self>) {
        class
            .constructor(Gate::default)
            .method_async("wait", wait)
            .method_async("refuse", refuse)
            .method("release", Gate::release)
            .method("ping", Gate::ping);
    }
}

/// Hands out one shared counter and calls back into greeters it is given.
#[derive(Default)]
pub struct Hub {
    counter: Arc<Counter>,
}

impl Hub {
    fn counter(&self) -> Result<Arc<Counter>, Fault> {
        Ok(self.counter.clone())
    }
}

async fn relay(_hub: Arc<Hub>, greeter: RemoteProxy<Greeter>, who: String) -> Result<String, Fault> {
    greeter
        .eval(Call::method("greet").arg(who))
        .await
        .map_err(|e| Fault::invocation(e.to_string()))
}

impl Remote for Hub {
    const TYPE_NAME: &'static str = "suite.Hub";

    fn describe(class: &mut Class<Self>) {
        class
            .constructor(Hub::default)
            .method("counter", Hub::counter)
            .method_async("relay", relay);
    }
}
