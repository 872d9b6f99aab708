//! Two channel ends in one process, talking over real shared memory.

mod common;

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use duochan::Call;
use duochan::Channel;
use duochan::Class;
use duochan::Error;
use duochan::FaultKind;
use duochan::Module;
use duochan::Remote;
use duochan::RemoteProxy;

use common::Counter;
use common::Gate;
use common::Greeter;
use common::Hub;
use common::Named;
use common::eventually;
use common::module;
use common::open_pair;

// ============================================================================
//  ACTIVATION
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remote_counter_increments() -> anyhow::Result<()> {
    let (owner, guest) = open_pair(module())?;

    let counter = guest.activate::<Counter>()?.await?;
    assert!(!counter.is_local());
    assert!(counter.assert_remote().is_ok());
    assert_eq!(counter.endpoint(), Some(owner.endpoint()));
    assert_eq!(counter.object_type(), Counter::TYPE_NAME);

    for expected in 1..=3 {
        let n: i32 = counter.eval(Call::method("increment")).await?;
        assert_eq!(n, expected);
    }
    let count: i32 = counter.eval(Call::property("count")).await?;
    assert_eq!(count, 3);
    assert_eq!(owner.registered_count(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_activations_get_distinct_handles() -> anyhow::Result<()> {
    let (_owner, guest) = open_pair(module())?;

    let a = guest.activate::<Counter>()?.await?;
    let b = guest.activate::<Counter>()?.await?;
    assert_ne!(a.handle(), b.handle());

    a.eval::<i32>(Call::method("add").arg(5)).await?;
    let b_count: i32 = b.eval(Call::property("count")).await?;
    assert_eq!(b_count, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_both_ends_can_activate() -> anyhow::Result<()> {
    let (owner, guest) = open_pair(module())?;

    let greeter = owner.activate::<Greeter>()?.await?;
    let text: String = greeter.eval(Call::method("greet").arg("owner")).await?;
    assert_eq!(text, "Hello, owner!");
    assert_eq!(guest.registered_count(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_activation_without_constructor_fails() -> anyhow::Result<()> {
    let (_owner, guest) = open_pair(module())?;

    let err = guest.activate::<Named>()?.await.unwrap_err();
    assert_eq!(err.fault().map(|f| f.kind), Some(FaultKind::Activation));
    Ok(())
}

struct Stranger;

impl Remote for Stranger {
    const TYPE_NAME: &'static str = "suite.Stranger";

    fn describe(class: &mut Class<Self>) {
        class.constructor(|| Stranger);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_activation_of_unknown_type_fails() -> anyhow::Result<()> {
    common::init_tracing();
    let name = common::unique_name();
    let owner_module = Module::builder("owner").register::<Counter>().build();
    let guest_module = Module::builder("guest")
        .register::<Counter>()
        .register_extern::<Stranger>()
        .build();
    let _owner = Channel::builder(&name).owner(true).module(owner_module).open()?;
    let guest = Channel::builder(&name).module(guest_module).open()?;

    let err = guest.activate::<Stranger>()?.await.unwrap_err();
    let fault = err.fault().cloned().expect("fault");
    assert_eq!(fault.kind, FaultKind::UnknownType);
    assert_eq!(fault.type_name.as_deref(), Some(Stranger::TYPE_NAME));

    // The channel is still usable afterwards.
    let counter = guest.activate::<Counter>()?.await?;
    assert_eq!(counter.eval::<i32>(Call::method("increment")).await?, 1);
    Ok(())
}

// ============================================================================
//  CALLS
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_replies_complete_out_of_order() -> anyhow::Result<()> {
    let (_owner, guest) = open_pair(module())?;
    let gate = guest.activate::<Gate>()?.await?;

    let held = gate.eval_async::<String>(Call::method("wait"));
    let pinged: i32 = gate.eval(Call::method("ping")).await?;
    assert_eq!(pinged, 1);
    assert_eq!(guest.pending_count(), 1);

    gate.run(Call::method("release")).await?;
    assert_eq!(held.await?, "released");
    assert_eq!(guest.pending_count(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remote_fault_propagates() -> anyhow::Result<()> {
    let (_owner, guest) = open_pair(module())?;
    let counter = guest.activate::<Counter>()?.await?;

    let err = counter.run(Call::method("fail")).await.unwrap_err();
    let fault = err.fault().expect("fault");
    assert_eq!(fault.kind, FaultKind::Invocation);
    assert_eq!(fault.message, "counter refused");

    let err = counter.eval::<i32>(Call::method("add").arg("ten")).await.unwrap_err();
    assert_eq!(err.fault().map(|f| f.kind), Some(FaultKind::Argument));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_async_failure_is_forwarded_after_it_settles() -> anyhow::Result<()> {
    let (_owner, guest) = open_pair(module())?;
    let gate = guest.activate::<Gate>()?.await?;

    let held = gate.eval_async::<String>(Call::method("refuse"));
    assert_eq!(gate.eval::<i32>(Call::method("ping")).await?, 1);
    assert_eq!(guest.pending_count(), 1);

    gate.run(Call::method("release")).await?;
    let err = held.await.unwrap_err();
    let fault = err.fault().expect("fault");
    assert_eq!(fault.kind, FaultKind::Invocation);
    assert_eq!(fault.message, "gate refused");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sync_method_with_await_flag() -> anyhow::Result<()> {
    let (_owner, guest) = open_pair(module())?;
    let counter = guest.activate::<Counter>()?.await?;

    assert_eq!(counter.eval_async::<i32>(Call::method("increment")).await?, 1);
    counter.run_async(Call::method("add").arg(2)).await?;
    assert_eq!(counter.eval_async::<i32>(Call::property("count")).await?, 3);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unserializable_calls_send_nothing() -> anyhow::Result<()> {
    let (_owner, guest) = open_pair(module())?;
    let counter = guest.activate::<Counter>()?.await?;
    let gate = guest.activate::<Gate>()?.await?;
    let sent = guest.messages_sent();

    let err = counter.eval::<i32>(Call::inline(|c: &Counter| c.get())).await.unwrap_err();
    assert!(matches!(err, Error::Contract(_)));

    let err = gate.eval::<String>(Call::method("wait")).await.unwrap_err();
    assert!(matches!(err, Error::Contract(_)));

    let err = counter.run(Call::method("missing")).await.unwrap_err();
    assert_eq!(err.fault().map(|f| f.kind), Some(FaultKind::UnknownMember));

    assert_eq!(guest.messages_sent(), sent);
    assert_eq!(guest.pending_count(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_local_proxy_skips_channel() -> anyhow::Result<()> {
    let (_owner, guest) = open_pair(module())?;
    let local = RemoteProxy::new(Arc::new(Counter::default()));
    let sent = guest.messages_sent();

    for expected in 1..=3 {
        assert_eq!(local.eval::<i32>(Call::method("increment")).await?, expected);
    }
    assert_eq!(local.eval::<i32>(Call::inline(|c: &Counter| c.get() * 10)).await?, 30);
    assert_eq!(guest.messages_sent(), sent);
    assert!(matches!(local.assert_remote(), Err(Error::NotRemote { .. })));
    Ok(())
}

// ============================================================================
//  PASSING PROXIES
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_proxy_passed_home_is_unwrapped() -> anyhow::Result<()> {
    let (_owner, guest) = open_pair(module())?;
    let a = guest.activate::<Counter>()?.await?;
    let b = guest.activate::<Counter>()?.await?;

    a.eval::<i32>(Call::method("add").arg(2)).await?;
    b.eval::<i32>(Call::method("add").arg(1)).await?;

    // `merge` takes an `Arc<Counter>`, which only decodes from a local instance.
    let merged: i32 = a.eval(Call::method("merge").arg(b.clone())).await?;
    assert_eq!(merged, 3);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_same_object_returns_same_proxy() -> anyhow::Result<()> {
    let (owner, guest) = open_pair(module())?;
    let hub = guest.activate::<Hub>()?.await?;

    let first: RemoteProxy<Counter> = hub.eval(Call::method("counter")).await?;
    let second: RemoteProxy<Counter> = hub.eval(Call::method("counter")).await?;
    assert_eq!(first.handle(), second.handle());
    assert!(first.clone().into_any().same_proxy(&second.clone().into_any()));
    assert_eq!(owner.registered_count(), 2);

    first.eval::<i32>(Call::method("increment")).await?;
    assert_eq!(second.eval::<i32>(Call::property("count")).await?, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_callback_into_caller() -> anyhow::Result<()> {
    let (_owner, guest) = open_pair(module())?;
    let hub = guest.activate::<Hub>()?.await?;
    let greeter = RemoteProxy::new(Arc::new(Greeter::new("Hi")));

    let text: String = hub
        .eval_async(Call::method("relay").arg(greeter.clone()).arg("guest"))
        .await?;
    assert_eq!(text, "Hi, guest!");

    // The owner drops its proxy once the call is done.
    assert!(eventually(|| guest.registered_count() == 0).await);
    assert!(greeter.is_local());
    assert!(!greeter.is_disconnected());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remote_cast() -> anyhow::Result<()> {
    let (_owner, guest) = open_pair(module())?;
    let counter = guest.activate::<Counter>()?.await?;

    let named = counter.cast_to::<Named>()?;
    assert_eq!(named.handle(), counter.handle());
    assert_eq!(named.eval::<i32>(Call::method("increment")).await?, 1);

    assert!(matches!(counter.cast_to::<Greeter>(), Err(Error::Cast { .. })));
    Ok(())
}

// ============================================================================
//  LIFECYCLE
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disconnect_sends_one_deactivation() -> anyhow::Result<()> {
    let (owner, guest) = open_pair(module())?;
    let counter = guest.activate::<Counter>()?.await?;
    let handle = counter.handle().expect("handle");

    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    counter.on_disconnect(move || {
        seen.fetch_add(1, Ordering::SeqCst);
    });

    let sent = guest.messages_sent();
    counter.disconnect();
    counter.disconnect();
    assert_eq!(guest.messages_sent(), sent + 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(counter.is_disconnected());
    assert!(matches!(counter.run(Call::method("increment")).await, Err(Error::Disconnected { .. })));

    assert!(eventually(|| owner.registered_count() == 0).await);
    assert!(owner.find_proxy(handle).is_none());
    drop(counter);
    assert_eq!(guest.messages_sent(), sent + 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_deactivated_handle_is_disposed() -> anyhow::Result<()> {
    let (_owner, guest) = open_pair(module())?;
    let counter = guest.activate::<Counter>()?.await?;
    let handle = counter.handle().expect("handle");
    counter.disconnect();

    let err = guest
        .send_method_call::<Counter, i32>(handle, Call::method("increment"), false)?
        .await
        .unwrap_err();
    assert!(err.is_disposed());
    assert!(err.to_string().contains(Counter::TYPE_NAME));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dropped_proxy_is_deactivated() -> anyhow::Result<()> {
    let (owner, guest) = open_pair(module())?;
    let counter = guest.activate::<Counter>()?.await?;
    let other = guest.activate::<Counter>()?.await?;
    assert_eq!(owner.registered_count(), 2);

    drop(counter);
    assert!(eventually(|| owner.registered_count() == 1).await);
    assert_eq!(other.eval::<i32>(Call::method("increment")).await?, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dispose_fails_pending_calls() -> anyhow::Result<()> {
    let (_owner, guest) = open_pair(module())?;
    let gate = guest.activate::<Gate>()?.await?;

    let held = gate.eval_async::<String>(Call::method("wait"));
    assert_eq!(guest.pending_count(), 1);

    guest.dispose();
    guest.dispose();
    assert!(guest.is_disposed());
    assert!(matches!(held.await, Err(Error::ChannelDisposed)));
    assert_eq!(guest.pending_count(), 0);

    assert!(matches!(gate.eval::<i32>(Call::method("ping")).await, Err(Error::ChannelDisposed)));
    assert!(matches!(guest.activate::<Counter>(), Err(Error::ChannelDisposed)));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dropped_channel_fails_calls() -> anyhow::Result<()> {
    let (_owner, guest) = open_pair(module())?;
    let counter = guest.activate::<Counter>()?.await?;
    drop(guest);

    assert!(matches!(counter.run(Call::method("increment")).await, Err(Error::ChannelDisposed)));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disconnected_local_proxy_is_unregistered() -> anyhow::Result<()> {
    let (_owner, guest) = open_pair(module())?;
    let counter = RemoteProxy::new(Arc::new(Counter::default()));
    let handle = guest.register_local_proxy(&counter)?;
    assert_eq!(counter.handle(), Some(handle));

    counter.disconnect();
    assert!(counter.is_disconnected());
    assert!(!counter.is_local());
    assert_eq!(guest.registered_count(), 0);
    assert!(guest.find_proxy(handle).is_none());
    assert!(matches!(counter.run(Call::method("increment")).await, Err(Error::Disconnected { .. })));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wrappers_of_one_instance_share_registration() -> anyhow::Result<()> {
    let (_owner, guest) = open_pair(module())?;
    let counter = Arc::new(Counter::default());
    let first = RemoteProxy::new(counter.clone());
    let second = RemoteProxy::new(counter);

    let handle = guest.register_local_proxy(&first)?;
    assert_eq!(guest.register_local_proxy(&second)?, handle);
    assert_eq!(second.handle(), Some(handle));
    assert_eq!(guest.registered_count(), 1);

    second.disconnect();
    assert_eq!(guest.registered_count(), 0);
    assert!(first.is_local());
    assert_eq!(first.eval::<i32>(Call::method("increment")).await?, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dispose_during_calls_never_hangs() -> anyhow::Result<()> {
    let (_owner, guest) = open_pair(module())?;
    let gate = guest.activate::<Gate>()?.await?;

    let mut callers = Vec::new();
    for _ in 0..8 {
        let gate = gate.clone();
        callers.push(tokio::spawn(async move {
            loop {
                if let Err(e) = gate.eval::<i32>(Call::method("ping")).await {
                    return e;
                }
            }
        }));
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    guest.dispose();

    for caller in callers {
        let err = tokio::time::timeout(Duration::from_secs(5), caller).await??;
        assert!(matches!(err, Error::ChannelDisposed));
    }
    assert_eq!(guest.pending_count(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unreadable_pipe_disposes_channel() -> anyhow::Result<()> {
    common::init_tracing();
    let name = common::unique_name();
    let _owner = Channel::builder(&name).owner(true).module(module()).open()?;
    let guest = Channel::builder(&name).module(module()).open()?;
    let gate = guest.activate::<Gate>()?.await?;
    let held = gate.eval_async::<String>(Call::method("wait"));

    // A sequence number published with nothing behind it on the pipe the
    // guest reads leaves its reader nowhere to go.
    let view = duopipe::Segment::open(&duopipe::segment_name(&format!("{}.A", name), 0))?;
    view.sequence().fetch_add(1, Ordering::Release);

    let outcome = tokio::time::timeout(Duration::from_secs(5), held).await?;
    assert!(matches!(outcome, Err(Error::ChannelDisposed)));
    assert!(guest.is_disposed());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_guest_without_owner_fails() {
    common::init_tracing();
    let err = Channel::builder(common::unique_name()).open().unwrap_err();
    assert!(matches!(err, Error::Pipe(duopipe::Error::NotFound(_))));
}
