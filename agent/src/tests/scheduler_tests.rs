//! Tests for the scheduler loop handlers and the public handle
//!
//! Most tests drive the Manager's handlers directly with synthetic
//! instants instead of running the 1 Hz loop, which keeps the timing
//! deterministic. Worker completions are real: dispatched tasks run on
//! blocking workers and their finish events are pulled from the input
//! channel with `finish_next`.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use metricd_core::plugin::MetricRegistry;
use metricd_core::SchedulerError;

use crate::client::{LOCAL_CHECKS_CLIENT_ID, PASSIVE_CHECKS_CLIENT_ID, TESTRUN_CLIENT_ID};
use crate::config::AgentConfig;
use crate::scheduler::Manager;
use crate::userparams;

use super::test_utils::*;

#[tokio::test]
async fn single_recurring_exporter_fires_once_per_delay() {
    let (plugin, dynamic) = plugin_pair(TestPlugin::new("cpu").with_capacity(1));
    let (mut m, _h) = manager_with(&[("cpu.load", dynamic)]).await;
    let sink = CollectingSink::shared(100);

    let t0 = ts(BASE);
    m.process_update_request(update(42, sink.clone(), vec![request(1, "cpu.load", "10")]), t0);
    assert!(m.check_queue_membership());

    // the first grid slot (phase offset 1 on the 10 s grid) is in the future
    m.process_queue(t0);
    assert_eq!(m.active_task_count(), 0);

    let t1 = ts(BASE + 1);
    m.process_queue(t1);
    assert_eq!(m.active_task_count(), 1);
    let pid = m.plugin_id("cpu.load").unwrap();
    assert_eq!(m.plugin_state(pid).used_capacity(), 1);
    // never simultaneously in the heap and in flight
    assert_eq!(m.plugin_state(pid).task_count(), 0);

    finish_next(&mut m, t1).await;
    assert_eq!(m.active_task_count(), 0);
    assert_eq!(m.plugin_state(pid).used_capacity(), 0);
    assert_eq!(sink.values(), vec!["0.12"]);
    assert!(m.check_queue_membership());

    // nothing fires until the next grid point
    for sec in 2..=10 {
        m.process_queue(ts(BASE + sec));
        assert_eq!(m.active_task_count(), 0);
    }
    m.process_queue(ts(BASE + 11));
    assert_eq!(m.active_task_count(), 1);
    finish_next(&mut m, ts(BASE + 11)).await;
    assert_eq!(sink.values().len(), 2);
    assert_eq!(plugin.exported.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn capacity_limits_concurrent_dispatches() {
    let (plugin, dynamic) = plugin_pair(TestPlugin::new("bulk").with_capacity(3));
    let (mut m, _h) = manager_with(&[("bulk.value", dynamic)]).await;
    let sink = CollectingSink::shared(100);

    let requests = (1..=10).map(|i| request(i, "bulk.value", "10")).collect();
    m.process_update_request(update(42, sink.clone(), requests), ts(BASE));
    let pid = m.plugin_id("bulk.value").unwrap();
    assert_eq!(m.plugin_state(pid).max_capacity(), 3);

    // everything is overdue by BASE+20; drain in capacity-sized waves
    let due = ts(BASE + 20);
    let mut completed = 0;
    let mut rounds = 0;
    loop {
        m.process_queue(due);
        assert!(m.active_task_count() <= 3);
        assert!(m.check_queue_membership());
        let in_flight = m.active_task_count();
        if in_flight == 0 {
            break;
        }
        for _ in 0..in_flight {
            finish_next(&mut m, due).await;
            completed += 1;
        }
        rounds += 1;
        assert!(rounds <= 10, "dispatch waves never drained");
    }
    assert_eq!(completed, 10);
    assert!(rounds <= 4); // ceil(10 / 3) waves
    assert_eq!(plugin.exported.load(Ordering::SeqCst), 10);
}

#[tokio::test]
async fn dropping_subscriptions_stops_runner_plugin() {
    let (plugin, dynamic) = plugin_pair(TestPlugin::new("db").with_runner().with_capacity(2));
    let (mut m, _h) = manager_with(&[("db.ping", dynamic)]).await;
    let sink = CollectingSink::shared(100);

    let t0 = ts(BASE);
    m.process_update_request(update(42, sink.clone(), vec![request(1, "db.ping", "10")]), t0);
    let pid = m.plugin_id("db.ping").unwrap();
    assert_eq!(m.plugin_state(pid).refcount(), 1);

    // the starter runs on the current second, before the first export
    m.process_queue(t0);
    assert_eq!(m.active_task_count(), 1);
    finish_next(&mut m, t0).await;
    assert_eq!(plugin.started.load(Ordering::SeqCst), 1);

    m.process_queue(ts(BASE + 1));
    finish_next(&mut m, ts(BASE + 1)).await;
    assert_eq!(plugin.exported.load(Ordering::SeqCst), 1);

    // the client walks away: refcount 1 -> 0, a stopper is queued
    let t2 = ts(BASE + 2);
    m.process_update_request(update(42, sink.clone(), Vec::new()), t2);
    assert_eq!(m.plugin_state(pid).refcount(), 0);
    let kinds: Vec<&str> = m.plugin_state(pid).tasks().map(|t| t.kind_name()).collect();
    assert_eq!(kinds, vec!["stopper"]);

    m.process_queue(t2);
    assert_eq!(m.active_task_count(), 1);
    finish_next(&mut m, t2).await;
    assert_eq!(plugin.stopped.load(Ordering::SeqCst), 1);
    assert!(!m.plugin_state(pid).queued());
    assert_eq!(m.plugin_state(pid).task_count(), 0);

    // no further work for the deactivated plugin
    m.process_queue(ts(BASE + 60));
    assert_eq!(m.active_task_count(), 0);
    assert_eq!(plugin.exported.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn clock_jump_rebuilds_queue() {
    let (_plugin, dynamic) = plugin_pair(TestPlugin::new("cpu"));
    let (mut m, _h) = manager_with(&[("cpu.load", dynamic)]).await;
    let sink = CollectingSink::shared(100);

    m.process_update_request(
        update(
            42,
            sink.clone(),
            vec![request(1, "cpu.load", "10"), request(2, "cpu.load", "10")],
        ),
        ts(BASE),
    );
    let pid = m.plugin_id("cpu.load").unwrap();

    // wall clock leaps 30 seconds between ticks
    let jumped = ts(BASE + 30);
    m.reschedule_queue(jumped);
    for task in m.plugin_state(pid).tasks() {
        assert!(task.scheduled() > jumped);
    }

    // nothing from the skipped window fires retroactively
    m.process_queue(jumped);
    assert_eq!(m.active_task_count(), 0);

    // one fire per item on the rebuilt grid
    m.process_queue(ts(BASE + 32));
    assert_eq!(m.active_task_count(), 2);
    finish_next(&mut m, ts(BASE + 32)).await;
    finish_next(&mut m, ts(BASE + 32)).await;
    assert_eq!(sink.values().len(), 2);
}

#[tokio::test]
async fn shutdown_drains_and_rejects_direct_checks() {
    let (plugin, dynamic) = plugin_pair(TestPlugin::new("db").with_runner().with_capacity(2));
    let (mut m, _h) = manager_with(&[("db.ping", dynamic)]).await;
    let sink = CollectingSink::shared(100);

    let t0 = ts(BASE);
    m.process_update_request(
        update(
            42,
            sink.clone(),
            vec![request(1, "db.ping", "10"), request(2, "db.ping", "10")],
        ),
        t0,
    );
    m.process_queue(t0); // starter
    assert_eq!(m.active_task_count(), 1);
    finish_next(&mut m, t0).await;

    // both exporters in flight when the shutdown lands
    m.process_queue(ts(BASE + 2));
    assert_eq!(m.active_task_count(), 2);
    m.deactivate_plugins(ts(BASE + 2));
    assert!(m.is_shutting_down());
    let pid = m.plugin_id("db.ping").unwrap();
    assert_eq!(m.plugin_state(pid).refcount(), 0);

    // direct single-item checks answer with an immediate error
    let direct_sink = CollectingSink::shared(1);
    m.process_update_request(
        update(TESTRUN_CLIENT_ID, direct_sink.clone(), vec![request(0, "db.ping", "")]),
        ts(BASE + 2),
    );
    assert_eq!(
        direct_sink.errors(),
        vec![SchedulerError::Shutdown.to_string()]
    );

    // bulk updates are silently dropped
    m.process_update_request(
        update(42, sink.clone(), vec![request(3, "db.ping", "10")]),
        ts(BASE + 2),
    );

    // in-flight tasks drain, the stopper runs, nothing new dispatches
    let exported_before = plugin.exported.load(Ordering::SeqCst);
    finish_next(&mut m, ts(BASE + 3)).await;
    m.process_queue(ts(BASE + 3));
    finish_next(&mut m, ts(BASE + 3)).await;
    m.process_queue(ts(BASE + 3));
    finish_next(&mut m, ts(BASE + 3)).await;
    assert_eq!(plugin.stopped.load(Ordering::SeqCst), 1);
    assert_eq!(plugin.exported.load(Ordering::SeqCst), exported_before);
    // the loop's exit condition
    assert_eq!(m.active_task_count() + m.queued_plugin_count(), 0);
}

#[tokio::test]
async fn user_param_reload_rebinds_pending_tasks() {
    let config = AgentConfig {
        user_parameters: vec!["up.one,echo 1".to_string()],
        ..AgentConfig::default()
    };
    let mut registry = MetricRegistry::new();
    for metric in userparams::compile(&config.user_parameters, false).unwrap() {
        registry.register_user_param(metric.plugin, metric.key, metric.description);
    }
    let shared = Arc::new(RwLock::new(config));
    let (mut m, _h) = Manager::new(&registry, shared.clone()).await.unwrap();
    let sink = CollectingSink::shared(100);

    m.process_update_request(
        update(42, sink.clone(), vec![request(1, "up.one", "10")]),
        ts(BASE),
    );
    let old_pid = m.plugin_id("up.one").unwrap();
    assert_eq!(m.plugin_state(old_pid).task_count(), 1);

    shared.write().await.user_parameters =
        vec!["up.one,echo 2".to_string(), "up.two,echo 3".to_string()];
    let response = m.process_user_param_reload(ts(BASE)).await;
    assert_eq!(response, "ok");

    let new_pid = m.plugin_id("up.one").unwrap();
    assert_ne!(new_pid, old_pid);
    // the pending task moved to the fresh agent, none were lost
    assert_eq!(m.plugin_state(new_pid).task_count(), 1);
    assert_eq!(m.plugin_state(old_pid).task_count(), 0);
    assert!(m.plugin_id("up.two").is_some());
    // the owning client's subscription follows the rebind
    let sub = m.client_state(42).unwrap().exporter_sub(1).unwrap();
    assert_eq!(sub.plugin, new_pid);
    assert!(m.check_queue_membership());

    // the rebound task still fires
    m.process_queue(ts(BASE + 11));
    assert_eq!(m.active_task_count(), 1);
    finish_next(&mut m, ts(BASE + 11)).await;
    assert_eq!(sink.values().len(), 1);
}

#[tokio::test]
async fn user_param_reload_failure_keeps_previous_metrics() {
    let config = AgentConfig {
        user_parameters: vec!["up.one,echo 1".to_string()],
        ..AgentConfig::default()
    };
    let mut registry = MetricRegistry::new();
    for metric in userparams::compile(&config.user_parameters, false).unwrap() {
        registry.register_user_param(metric.plugin, metric.key, metric.description);
    }
    let shared = Arc::new(RwLock::new(config));
    let (mut m, _h) = Manager::new(&registry, shared.clone()).await.unwrap();
    let sink = CollectingSink::shared(100);
    m.process_update_request(
        update(42, sink.clone(), vec![request(1, "up.one", "10")]),
        ts(BASE),
    );
    let pid = m.plugin_id("up.one").unwrap();

    shared.write().await.user_parameters = vec!["missing-the-command".to_string()];
    let response = m.process_user_param_reload(ts(BASE)).await;
    assert!(response.contains("cannot process user parameters request"));

    // previous metrics and their tasks are untouched
    assert_eq!(m.plugin_id("up.one"), Some(pid));
    assert_eq!(m.plugin_state(pid).task_count(), 1);
}

#[tokio::test]
async fn repeated_subscribe_is_idempotent() {
    let (_plugin, dynamic) = plugin_pair(TestPlugin::new("cpu"));
    let (mut m, _h) = manager_with(&[("cpu.load", dynamic)]).await;
    let sink = CollectingSink::shared(100);
    let pid_requests = vec![request(1, "cpu.load", "10"), request(2, "cpu.load", "30")];

    m.process_update_request(update(42, sink.clone(), pid_requests.clone()), ts(BASE));
    let pid = m.plugin_id("cpu.load").unwrap();
    assert_eq!(m.plugin_state(pid).refcount(), 1);
    assert_eq!(m.plugin_state(pid).task_count(), 2);

    // identical refresh: no refcount growth, no new tasks
    m.process_update_request(update(42, sink.clone(), pid_requests), ts(BASE + 5));
    assert_eq!(m.plugin_state(pid).refcount(), 1);
    assert_eq!(m.plugin_state(pid).task_count(), 2);
    assert_eq!(m.client_state(42).unwrap().subscription_count(), 1);
}

#[tokio::test]
async fn emptying_requests_releases_all_refcounts() {
    let (_a, dyn_a) = plugin_pair(TestPlugin::new("cpu"));
    let (_b, dyn_b) = plugin_pair(TestPlugin::new("mem"));
    let (mut m, _h) = manager_with(&[("cpu.load", dyn_a), ("mem.free", dyn_b)]).await;
    let sink = CollectingSink::shared(100);

    m.process_update_request(
        update(
            42,
            sink.clone(),
            vec![request(1, "cpu.load", "10"), request(2, "mem.free", "10")],
        ),
        ts(BASE),
    );
    let cpu = m.plugin_id("cpu.load").unwrap();
    let mem = m.plugin_id("mem.free").unwrap();
    assert_eq!(m.plugin_state(cpu).refcount(), 1);
    assert_eq!(m.plugin_state(mem).refcount(), 1);

    m.process_update_request(update(42, sink.clone(), Vec::new()), ts(BASE + 5));
    assert_eq!(m.plugin_state(cpu).refcount(), 0);
    assert_eq!(m.plugin_state(mem).refcount(), 0);
    assert_eq!(m.plugin_state(cpu).task_count(), 0);
    assert_eq!(m.plugin_state(mem).task_count(), 0);
    assert!(m.check_queue_membership());
}

#[tokio::test]
async fn stop_twice_is_equivalent_to_once() {
    let (_plugin, dynamic) = plugin_pair(TestPlugin::new("cpu"));
    let (m, h) = manager_with(&[("cpu.load", dynamic)]).await;
    let scheduler_loop = tokio::spawn(m.run());

    h.stop().await;
    h.stop().await;
    tokio::time::timeout(Duration::from_secs(5), scheduler_loop)
        .await
        .expect("loop exits after stop")
        .unwrap();
    // stops after exit are harmless as well
    h.stop().await;
}

#[tokio::test]
async fn handle_queries_round_trip_through_the_loop() {
    let (_plugin, dynamic) = plugin_pair(TestPlugin::new("cpu"));
    let (m, h) = manager_with(&[("cpu.load", dynamic)]).await;
    let scheduler_loop = tokio::spawn(m.run());

    let status = h.query("status").await;
    assert!(status.contains("active tasks: 0"));
    let metrics = h.query("metrics").await;
    assert!(metrics.contains("cpu.load"));
    // reloading an empty user-parameter set is a no-op
    assert_eq!(h.query_user_params().await, "ok");

    h.stop().await;
    let _ = scheduler_loop.await;
}

#[tokio::test]
async fn perform_task_returns_value() {
    let (_plugin, dynamic) = plugin_pair(TestPlugin::new("cpu").with_value("0.42"));
    let (m, h) = manager_with(&[("cpu.load", dynamic)]).await;
    let scheduler_loop = tokio::spawn(m.run());

    let value = h
        .perform_task("cpu.load", Duration::from_secs(5), TESTRUN_CLIENT_ID)
        .await
        .unwrap();
    assert_eq!(value, "0.42");

    h.stop().await;
    let _ = scheduler_loop.await;
}

#[tokio::test]
async fn perform_task_reports_unknown_metric() {
    let (_plugin, dynamic) = plugin_pair(TestPlugin::new("cpu"));
    let (m, h) = manager_with(&[("cpu.load", dynamic)]).await;
    let scheduler_loop = tokio::spawn(m.run());

    let err = h
        .perform_task("no.such.key", Duration::from_secs(5), TESTRUN_CLIENT_ID)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Unknown metric"));

    h.stop().await;
    let _ = scheduler_loop.await;
}

#[tokio::test]
async fn perform_task_times_out_but_check_survives() {
    let (_plugin, dynamic) =
        plugin_pair(TestPlugin::new("slow").with_export_delay(Duration::from_secs(2)));
    let (m, h) = manager_with(&[("slow.value", dynamic)]).await;
    let scheduler_loop = tokio::spawn(m.run());

    let err = h
        .perform_task("slow.value", Duration::from_millis(200), TESTRUN_CLIENT_ID)
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::Timeout));
    assert_eq!(err.to_string(), "Timeout occurred while gathering data.");

    h.stop().await;
    let _ = scheduler_loop.await;
}

#[tokio::test]
async fn worker_panic_is_isolated() {
    let (_plugin, dynamic) = plugin_pair(TestPlugin::new("bad").panicking());
    let (mut m, _h) = manager_with(&[("bad.value", dynamic)]).await;
    let sink = CollectingSink::shared(10);

    m.process_update_request(
        update(TESTRUN_CLIENT_ID, sink.clone(), vec![request(0, "bad.value", "")]),
        ts(BASE),
    );
    m.process_queue(ts(BASE));
    assert_eq!(m.active_task_count(), 1);
    finish_next(&mut m, ts(BASE)).await;

    let errors = sink.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("terminated unexpectedly"));
    // the loop state survived the panic
    assert_eq!(m.active_task_count(), 0);
    assert!(m.check_queue_membership());
}

#[tokio::test]
async fn plugin_error_keeps_task_scheduled() {
    let (plugin, dynamic) = plugin_pair(TestPlugin::new("flaky").with_export_error("boom"));
    let (mut m, _h) = manager_with(&[("flaky.value", dynamic)]).await;
    let sink = CollectingSink::shared(10);

    m.process_update_request(
        update(42, sink.clone(), vec![request(1, "flaky.value", "10")]),
        ts(BASE),
    );
    let pid = m.plugin_id("flaky.value").unwrap();
    m.process_queue(ts(BASE + 1));
    finish_next(&mut m, ts(BASE + 1)).await;

    assert_eq!(sink.errors(), vec!["boom".to_string()]);
    // a plugin error taints only this result, the task reschedules
    assert_eq!(m.plugin_state(pid).task_count(), 1);
    assert_eq!(plugin.exported.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn per_item_errors_do_not_block_the_batch() {
    let (_plugin, dynamic) = plugin_pair(TestPlugin::new("cpu"));
    let config = AgentConfig {
        deny_keys: vec!["secret.data".to_string()],
        ..AgentConfig::default()
    };
    let (mut m, _h) = manager_with_config(
        &[("cpu.load", dynamic.clone()), ("secret.data", dynamic)],
        config,
    )
    .await;
    let sink = CollectingSink::shared(10);

    m.process_update_request(
        update(
            42,
            sink.clone(),
            vec![
                request(1, "cpu.load", "10"),
                request(2, "no.such.key", "10"),
                request(3, "secret.data", "10"),
                request(4, "mangled[", "10"),
            ],
        ),
        ts(BASE),
    );

    let errors = sink.errors();
    assert_eq!(errors.len(), 3);
    assert!(errors.iter().any(|e| e.contains("Unknown metric no.such.key")));
    // denied keys are indistinguishable from unknown ones
    assert!(errors.iter().any(|e| e.contains("Unknown metric secret.data")));
    let pid = m.plugin_id("cpu.load").unwrap();
    assert_eq!(m.plugin_state(pid).task_count(), 1);
}

#[tokio::test]
async fn local_checks_bypass_key_access_rules() {
    let (_plugin, dynamic) = plugin_pair(TestPlugin::new("cpu"));
    let config = AgentConfig {
        deny_keys: vec!["cpu.load".to_string()],
        ..AgentConfig::default()
    };
    let (mut m, _h) = manager_with_config(&[("cpu.load", dynamic)], config).await;
    let sink = CollectingSink::shared(10);

    m.process_update_request(
        update(LOCAL_CHECKS_CLIENT_ID, sink.clone(), vec![request(1, "cpu.load", "10")]),
        ts(BASE),
    );
    assert!(sink.errors().is_empty());
    let pid = m.plugin_id("cpu.load").unwrap();
    assert_eq!(m.plugin_state(pid).task_count(), 1);
}

#[tokio::test]
async fn watcher_receives_item_batches() {
    let (plugin, dynamic) = plugin_pair(TestPlugin::new("logs").with_watcher().without_exporter());
    let (mut m, _h) = manager_with(&[("log.test", dynamic)]).await;
    let sink = CollectingSink::shared(10);

    m.process_update_request(
        update(
            42,
            sink.clone(),
            vec![
                request(1, "log.test[/var/log/a]", ""),
                request(2, "log.test[/var/log/b]", ""),
            ],
        ),
        ts(BASE),
    );
    let pid = m.plugin_id("log.test").unwrap();
    assert_eq!(m.plugin_state(pid).refcount(), 1);

    m.process_queue(ts(BASE));
    assert_eq!(m.active_task_count(), 1);
    finish_next(&mut m, ts(BASE)).await;
    // one batch with both items, not one task per item
    assert_eq!(*plugin.watched.lock().unwrap(), vec![2]);
    // watcher tasks are not recurring in the scheduler
    assert_eq!(m.plugin_state(pid).task_count(), 0);
}

#[tokio::test]
async fn collector_task_accompanies_plugin_activation() {
    let (plugin, dynamic) = plugin_pair(TestPlugin::new("net").with_collector(30));
    let (mut m, _h) = manager_with(&[("net.rate", dynamic)]).await;
    let sink = CollectingSink::shared(10);

    m.process_update_request(
        update(42, sink.clone(), vec![request(1, "net.rate", "10")]),
        ts(BASE),
    );
    let pid = m.plugin_id("net.rate").unwrap();
    // exporter task plus one collector task for the plugin
    assert_eq!(m.plugin_state(pid).task_count(), 2);

    // everything is due within one collector period
    m.process_queue(ts(BASE + 30));
    assert_eq!(m.active_task_count(), 2);
    finish_next(&mut m, ts(BASE + 30)).await;
    finish_next(&mut m, ts(BASE + 30)).await;
    assert_eq!(plugin.collected.load(Ordering::SeqCst), 1);
    // the collector is recurring and came back for the next period
    assert_eq!(m.plugin_state(pid).task_count(), 2);
}

#[tokio::test]
async fn hourly_maintenance_reclaims_passive_plugins() {
    let (_plugin, dynamic) = plugin_pair(TestPlugin::new("cpu"));
    let (mut m, _h) = manager_with(&[("cpu.load", dynamic)]).await;
    let sink = CollectingSink::shared(10);

    m.process_update_request(
        update(PASSIVE_CHECKS_CLIENT_ID, sink.clone(), vec![request(0, "cpu.load", "")]),
        ts(BASE),
    );
    let pid = m.plugin_id("cpu.load").unwrap();
    assert_eq!(m.plugin_state(pid).refcount(), 1);
    m.process_queue(ts(BASE));
    finish_next(&mut m, ts(BASE)).await;
    assert_eq!(sink.len(), 1);

    // an hour later the one-shot usage expires and the client goes away
    m.hourly_maintenance(ts(BASE + 3_601));
    assert_eq!(m.plugin_state(pid).refcount(), 0);
    assert!(m.client_state(PASSIVE_CHECKS_CLIENT_ID).is_none());
    assert_eq!(m.client_count(), 0);
}

#[tokio::test]
async fn query_reports_status_and_metrics() {
    let (_plugin, dynamic) = plugin_pair(TestPlugin::new("cpu").with_capacity(7));
    let (mut m, _h) = manager_with(&[("cpu.load", dynamic)]).await;
    let sink = CollectingSink::shared(10);
    m.process_update_request(
        update(42, sink.clone(), vec![request(1, "cpu.load", "10")]),
        ts(BASE),
    );

    let metrics = m.process_query("metrics");
    assert!(metrics.contains("cpu.load"));
    assert!(metrics.contains("capacity 0/7"));
    assert!(metrics.contains("refcount 1"));

    let status = m.process_query("status");
    assert!(status.contains("clients: 1"));
    assert!(status.contains("shutting down: false"));

    assert!(m.process_query("bogus").contains("unknown command"));
}

#[tokio::test]
async fn delay_change_moves_the_task_to_its_new_grid() {
    let (_plugin, dynamic) = plugin_pair(TestPlugin::new("cpu"));
    let (mut m, _h) = manager_with(&[("cpu.load", dynamic)]).await;
    let sink = CollectingSink::shared(10);

    m.process_update_request(
        update(42, sink.clone(), vec![request(1, "cpu.load", "300")]),
        ts(BASE),
    );
    let pid = m.plugin_id("cpu.load").unwrap();
    let before = m.plugin_state(pid).peek_scheduled().unwrap();
    assert!(before.timestamp() > BASE + 10);

    // the consumer shortens the interval on refresh
    m.process_update_request(
        update(42, sink.clone(), vec![request(1, "cpu.load", "10")]),
        ts(BASE + 1),
    );
    assert_eq!(m.plugin_state(pid).task_count(), 1);
    let after = m.plugin_state(pid).peek_scheduled().unwrap();
    assert!(after.timestamp() <= BASE + 11);
    assert!(m.check_queue_membership());
}

#[tokio::test]
async fn force_active_checks_fire_before_the_first_refresh() {
    let (_plugin, dynamic) = plugin_pair(TestPlugin::new("cpu"));
    let mut config = AgentConfig::default();
    config.plugins.insert(
        "cpu".to_string(),
        crate::config::PluginSystemOptions {
            force_active_checks_on_start: Some(true),
            ..Default::default()
        },
    );
    let (mut m, _h) = manager_with_config(&[("cpu.load", dynamic)], config).await;
    let sink = CollectingSink::shared(10);

    // before the first active-checks refresh the new task fires at once
    m.process_update_request(
        update(42, sink.clone(), vec![request(1, "cpu.load", "300")]),
        ts(BASE),
    );
    let pid = m.plugin_id("cpu.load").unwrap();
    assert_eq!(m.plugin_state(pid).peek_scheduled().unwrap().timestamp(), BASE);

    // once refreshed, new tasks wait for their grid slot
    let mut refreshed = update(42, sink.clone(), vec![request(2, "cpu.load", "300")]);
    refreshed.first_active_checks_refreshed = true;
    m.process_update_request(refreshed, ts(BASE));
    let scheduled: Vec<i64> = m
        .plugin_state(pid)
        .tasks()
        .map(|t| t.scheduled().timestamp())
        .collect();
    assert!(scheduled.contains(&BASE));
    assert!(scheduled.iter().any(|&s| s > BASE));
}

#[tokio::test]
async fn invalid_delay_is_a_schedule_error() {
    let (_plugin, dynamic) = plugin_pair(TestPlugin::new("cpu"));
    let (mut m, _h) = manager_with(&[("cpu.load", dynamic)]).await;
    let sink = CollectingSink::shared(10);

    m.process_update_request(
        update(42, sink.clone(), vec![request(1, "cpu.load", "0")]),
        ts(BASE),
    );
    let errors = sink.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("cannot compute next scheduled time"));
    let pid = m.plugin_id("cpu.load").unwrap();
    assert_eq!(m.plugin_state(pid).task_count(), 0);
    assert_eq!(m.plugin_state(pid).refcount(), 0);
}
