//! End-to-end dispatch through routing, cache, breaker, chunking and the
//! admission queue, against scripted providers.

mod common;

use std::time::Duration;

use plume::breaker::CircuitState;
use plume::chunking::MergeStrategy;
use plume::config::ProviderRole;
use plume::dispatcher::{RequestOptions, Task};
use plume::error::DispatchError;
use plume::events::DispatchEvent;
use plume::queue::{Priority, RequestStatus};
use plume::router::{Policy, TaskCategory};

use common::{ScriptedProvider, Trio, sentences, test_config};

fn bypass() -> RequestOptions {
    RequestOptions {
        bypass_cache: true,
        ..RequestOptions::default()
    }
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn route_classifies_and_prefers_live_secondary() {
    let trio = Trio::healthy();
    let d = trio.dispatcher(&test_config());

    let result = d.route(&Task::new("outline the thesis", "Write it.")).await.unwrap();

    assert_eq!(result.category, TaskCategory::Structure);
    assert_eq!(result.provider, "deepseek");
    assert_eq!(result.content, "deepseek: Write it.");
    assert!(!result.cached);
    assert_eq!(result.chunks, 1);
    assert_eq!(trio.anthropic.calls(), 0);
}

#[tokio::test]
async fn unavailable_secondary_routes_to_primary() {
    let trio = Trio::new(
        ScriptedProvider::new("anthropic"),
        ScriptedProvider::new("deepseek").unavailable(),
        ScriptedProvider::new("ollama"),
    );
    let d = trio.dispatcher(&test_config());

    let result = d.route(&Task::new("outline the thesis", "x")).await.unwrap();
    assert_eq!(result.provider, "anthropic");
    assert_eq!(trio.deepseek.calls(), 0);
}

#[tokio::test]
async fn policy_override_changes_preference() {
    let trio = Trio::healthy();
    let d = trio.dispatcher(&test_config());

    let options = RequestOptions {
        policy: Some(Policy::Cost),
        ..RequestOptions::default()
    };
    let task = Task::new("polish the prose", "x").with_options(options);
    assert_eq!(d.route(&task).await.unwrap().provider, "ollama");

    let options = RequestOptions {
        policy: Some(Policy::High),
        ..RequestOptions::default()
    };
    let task = Task::new("polish the prose", "y").with_options(options);
    assert_eq!(d.route(&task).await.unwrap().provider, "anthropic");
}

#[tokio::test]
async fn explicit_category_skips_classification() {
    let trio = Trio::healthy();
    let d = trio.dispatcher(&test_config());

    let task = Task::new("outline the thesis", "x").with_category(TaskCategory::Hypothesis);
    let result = d.route(&task).await.unwrap();
    assert_eq!(result.category, TaskCategory::Hypothesis);
    assert_eq!(result.provider, "anthropic");
}

#[tokio::test]
async fn forced_provider_bypasses_policy_and_probe() {
    let trio = Trio::new(
        ScriptedProvider::new("anthropic"),
        ScriptedProvider::new("deepseek"),
        ScriptedProvider::new("ollama").unavailable(),
    );
    let d = trio.dispatcher(&test_config());

    let options = RequestOptions {
        force_provider: Some("ollama".into()),
        ..RequestOptions::default()
    };
    let task = Task::new("debug the script", "x").with_options(options);
    assert_eq!(d.route(&task).await.unwrap().provider, "ollama");

    let options = RequestOptions {
        force_provider: Some("nobody".into()),
        ..RequestOptions::default()
    };
    let task = Task::new("debug the script", "x").with_options(options);
    let err = d.route(&task).await.unwrap_err();
    assert!(matches!(err, DispatchError::UnknownProvider(ref p) if p == "nobody"));
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[tokio::test]
async fn identical_calls_hit_the_cache() {
    let trio = Trio::healthy();
    let d = trio.dispatcher(&test_config());
    let task = Task::new("outline the thesis", "same prompt");

    let first = d.route(&task).await.unwrap();
    let second = d.route(&task).await.unwrap();

    assert!(!first.cached);
    assert!(second.cached);
    assert_eq!(first.content, second.content);
    assert_eq!(second.provider, "deepseek");
    assert_eq!(trio.deepseek.calls(), 1);
    assert_eq!(d.cache_stats().hits, 1);
}

#[tokio::test]
async fn bypass_skips_cache_read_and_write() {
    let trio = Trio::healthy();
    let d = trio.dispatcher(&test_config());
    let task = Task::new("outline the thesis", "p").with_options(bypass());

    d.route(&task).await.unwrap();
    let again = d.route(&task).await.unwrap();
    assert!(!again.cached);
    assert_eq!(trio.deepseek.calls(), 2);
    assert_eq!(d.cache_stats().entries, 0);
}

#[tokio::test(start_paused = true)]
async fn expired_entry_triggers_fresh_call() {
    let trio = Trio::healthy();
    let d = trio.dispatcher(&test_config());
    let task = Task::new("outline the thesis", "p");

    d.route(&task).await.unwrap();
    tokio::time::advance(Duration::from_secs(301)).await;
    let again = d.route(&task).await.unwrap();

    assert!(!again.cached);
    assert_eq!(trio.deepseek.calls(), 2);
}

#[tokio::test]
async fn temperature_is_part_of_the_cache_key() {
    let trio = Trio::healthy();
    let d = trio.dispatcher(&test_config());

    let cold = Task::new("outline the thesis", "p").with_options(RequestOptions {
        temperature: 0.0,
        ..RequestOptions::default()
    });
    d.route(&cold).await.unwrap();
    d.route(&Task::new("outline the thesis", "p")).await.unwrap();
    assert_eq!(trio.deepseek.calls(), 2);
}

// ---------------------------------------------------------------------------
// Breaker and fallback
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failing_secondary_falls_back_to_primary() {
    let trio = Trio::new(
        ScriptedProvider::new("anthropic"),
        ScriptedProvider::failing("deepseek"),
        ScriptedProvider::new("ollama"),
    );
    let d = trio.dispatcher(&test_config());
    let task = Task::new("outline the thesis", "p").with_options(bypass());

    // Default threshold is 5.
    for _ in 0..5 {
        let result = d.route(&task).await.unwrap();
        assert_eq!(result.provider, "anthropic");
    }
    assert_eq!(d.circuit_state("deepseek"), CircuitState::Open);
    assert_eq!(trio.deepseek.calls(), 5);

    // Open: deepseek is no longer invoked, primary still answers.
    let result = d.route(&task).await.unwrap();
    assert_eq!(result.provider, "anthropic");
    assert_eq!(trio.deepseek.calls(), 5);
}

#[tokio::test]
async fn secondary_and_primary_failing_report_both() {
    let trio = Trio::new(
        ScriptedProvider::failing("anthropic"),
        ScriptedProvider::failing("deepseek"),
        ScriptedProvider::new("ollama"),
    );
    let d = trio.dispatcher(&test_config());

    let err = d.route(&Task::new("outline the thesis", "p")).await.unwrap_err();
    match err {
        DispatchError::CircuitBreaker { name, primary, fallback } => {
            assert_eq!(name, "deepseek");
            assert_eq!(primary.provider(), Some("deepseek"));
            assert_eq!(fallback.provider(), Some("anthropic"));
        }
        other => panic!("expected CircuitBreaker, got {other:?}"),
    }
    assert_eq!(d.cache_stats().entries, 0, "failures are never cached");
}

#[tokio::test]
async fn primary_choice_has_no_fallback() {
    let trio = Trio::new(
        ScriptedProvider::failing("anthropic"),
        ScriptedProvider::new("deepseek"),
        ScriptedProvider::new("ollama"),
    );
    let d = trio.dispatcher(&test_config());

    let err = d
        .route(&Task::new("refine the hypothesis", "p"))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::ProviderInvocation { ref provider, .. } if provider == "anthropic"));
    assert_eq!(trio.deepseek.calls(), 0);
}

#[tokio::test]
async fn reset_circuit_restores_secondary() {
    let trio = Trio::new(
        ScriptedProvider::new("anthropic"),
        ScriptedProvider::new("deepseek").fail_times(5),
        ScriptedProvider::new("ollama"),
    );
    let d = trio.dispatcher(&test_config());
    let task = Task::new("outline the thesis", "p").with_options(bypass());

    for _ in 0..5 {
        d.route(&task).await.unwrap();
    }
    assert_eq!(d.circuit_state("deepseek"), CircuitState::Open);

    assert!(d.reset_circuit("deepseek"));
    assert_eq!(d.route(&task).await.unwrap().provider, "deepseek");
    let names: Vec<String> = d.circuit_states().into_iter().map(|s| s.name).collect();
    assert!(names.contains(&"deepseek".to_string()));
}

// ---------------------------------------------------------------------------
// Chunking
// ---------------------------------------------------------------------------

fn long_code_task() -> Task {
    // ~7000 estimated tokens, over the 6000 ceiling for code.
    Task::new("debug the script", sentences(800).join(" ")).with_options(RequestOptions {
        merge_strategy: Some(MergeStrategy::Sequential),
        ..RequestOptions::default()
    })
}

#[tokio::test(start_paused = true)]
async fn oversized_payload_is_chunked_and_merged() {
    let trio = Trio::healthy();
    let mut config = test_config();
    config.chunking.overlap = 0;
    let d = trio.dispatcher(&config);
    let mut events = d.subscribe();

    let result = d.route_with_chunking(&long_code_task()).await.unwrap();

    assert_eq!(result.chunks, 2);
    assert_eq!(result.category, TaskCategory::Code);
    assert_eq!(result.provider, "deepseek");
    assert_eq!(result.usage.input_tokens, 20);
    assert_eq!(result.usage.output_tokens, 10);
    assert!(result.content.starts_with("deepseek: [Part 1 of 2]\n\n"));
    assert!(result.content.contains("\n\ndeepseek: [Part 2 of 2]\n\n"));

    let prompts = trio.deepseek.prompts();
    assert_eq!(prompts.len(), 2);
    assert!(prompts[1].starts_with("[Part 2 of 2]"));

    let mut progress = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let DispatchEvent::ChunkProgress { current, total, .. } = event {
            progress.push((current, total));
        }
    }
    assert_eq!(progress, vec![(1, 2), (2, 2)]);
}

#[tokio::test]
async fn payload_under_ceiling_is_single_shot() {
    let trio = Trio::healthy();
    let d = trio.dispatcher(&test_config());

    let result = d
        .route_with_chunking(&Task::new("debug the script", "short"))
        .await
        .unwrap();
    assert_eq!(result.chunks, 1);
    assert_eq!(trio.deepseek.prompts(), vec!["short".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn chunk_that_keeps_failing_aborts_the_run() {
    let trio = Trio::new(
        ScriptedProvider::new("anthropic"),
        ScriptedProvider::failing("deepseek"),
        ScriptedProvider::new("ollama"),
    );
    let d = trio.dispatcher(&test_config());

    let mut task = long_code_task();
    task.options.force_provider = Some("deepseek".into());
    let err = d.route_with_chunking(&task).await.unwrap_err();

    assert!(
        matches!(err, DispatchError::ChunkProcessing { index: 0, attempts: 3, .. }),
        "got {err:?}"
    );
    assert_eq!(trio.deepseek.calls(), 3);
    assert_eq!(trio.anthropic.calls(), 0, "forced provider has no fallback");
}

#[tokio::test(start_paused = true)]
async fn concurrent_chunked_requests_tag_their_progress() {
    let trio = Trio::new(
        ScriptedProvider::new("anthropic"),
        ScriptedProvider::new("deepseek").with_delay(Duration::from_millis(100)),
        ScriptedProvider::new("ollama"),
    );
    let mut config = test_config();
    config.chunking.overlap = 0;
    let d = trio.dispatcher(&config);
    let mut events = d.subscribe();

    let task = |marker: &str| {
        let payload = format!("{marker}. {}", sentences(800).join(" "));
        Task::new("debug the script", payload).with_options(RequestOptions {
            bypass_cache: true,
            ..RequestOptions::default()
        })
    };
    let alpha = d.submit(task("Alpha")).unwrap();
    let beta = d.submit(task("Beta")).unwrap();
    let (alpha_id, beta_id) = (alpha.id, beta.id);

    let (a, b) = tokio::join!(alpha.wait(), beta.wait());
    assert_eq!(a.unwrap().chunks, 2);
    assert_eq!(b.unwrap().chunks, 2);

    let mut alpha_seen = Vec::new();
    let mut beta_seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let DispatchEvent::ChunkProgress {
            id, current, result, ..
        } = event
        {
            let content = result["content"].as_str().unwrap_or_default().to_string();
            match id {
                Some(got) if got == alpha_id => alpha_seen.push((current, content)),
                Some(got) if got == beta_id => beta_seen.push((current, content)),
                other => panic!("progress for unexpected request {other:?}"),
            }
        }
    }

    assert_eq!(alpha_seen.len(), 2);
    assert_eq!(beta_seen.len(), 2);
    assert_eq!((alpha_seen[0].0, alpha_seen[1].0), (1, 2));
    assert!(alpha_seen[0].1.starts_with("deepseek: [Part 1 of 2]\n\nAlpha."));
    assert!(beta_seen[0].1.starts_with("deepseek: [Part 1 of 2]\n\nBeta."));
}

#[tokio::test]
async fn direct_chunked_route_has_no_request_id() {
    let trio = Trio::healthy();
    let mut config = test_config();
    config.chunking.overlap = 0;
    config.chunking.retry_delay_ms = 0;
    let d = trio.dispatcher(&config);
    let mut events = d.subscribe();

    d.route_with_chunking(&long_code_task()).await.unwrap();

    let mut ids = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let DispatchEvent::ChunkProgress { id, .. } = event {
            ids.push(id);
        }
    }
    assert_eq!(ids, vec![None, None]);
}

#[tokio::test(start_paused = true)]
async fn chunking_can_be_turned_off_for_queued_tasks() {
    let trio = Trio::healthy();
    let d = trio.dispatcher(&test_config());

    let mut task = long_code_task();
    task.options.chunking = false;
    let result = d.submit(task).unwrap().wait().await.unwrap();

    assert_eq!(result.chunks, 1);
    let prompts = trio.deepseek.prompts();
    assert_eq!(prompts.len(), 1);
    assert!(!prompts[0].starts_with("[Part"), "payload is sent whole");
}

// ---------------------------------------------------------------------------
// Admission queue
// ---------------------------------------------------------------------------

#[tokio::test]
async fn submitted_request_resolves_with_lifecycle_events() {
    let trio = Trio::healthy();
    let d = trio.dispatcher(&test_config());
    let mut events = d.subscribe();

    let handle = d.submit(Task::new("outline the thesis", "queued")).unwrap();
    let id = handle.id;
    let result = handle.wait().await.unwrap();
    assert_eq!(result.content, "deepseek: queued");
    assert_eq!(d.status(id).unwrap().status, RequestStatus::Completed);

    let mut statuses = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let DispatchEvent::Request { id: got, status } = event {
            assert_eq!(got, id);
            statuses.push(status);
        }
    }
    assert_eq!(
        statuses,
        vec![
            RequestStatus::Queued,
            RequestStatus::Processing,
            RequestStatus::Completed
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn queued_requests_run_in_priority_order() {
    let trio = Trio::new(
        ScriptedProvider::new("anthropic"),
        ScriptedProvider::new("deepseek").with_delay(Duration::from_millis(100)),
        ScriptedProvider::new("ollama"),
    );
    let mut config = test_config();
    config.queue.max_concurrent = 1;
    let d = trio.dispatcher(&config);

    let submit = |payload: &str, priority: Priority| {
        let task = Task::new("outline the thesis", payload).with_options(RequestOptions {
            priority: Some(priority),
            ..RequestOptions::default()
        });
        d.submit(task).unwrap()
    };
    let a = submit("a", Priority::NORMAL);
    let b = submit("b", Priority::NORMAL);
    let c = submit("c", Priority::CRITICAL);

    for handle in [a, b, c] {
        handle.wait().await.unwrap();
    }
    assert_eq!(trio.deepseek.prompts(), vec!["a", "c", "b"]);
    assert_eq!(d.queue_snapshot().stats.total_completed, 3);
}

#[tokio::test(start_paused = true)]
async fn cancelling_a_waiting_request_resolves_its_handle() {
    let trio = Trio::new(
        ScriptedProvider::new("anthropic"),
        ScriptedProvider::new("deepseek").with_delay(Duration::from_secs(1)),
        ScriptedProvider::new("ollama"),
    );
    let mut config = test_config();
    config.queue.max_concurrent = 1;
    let d = trio.dispatcher(&config);

    let running = d.submit(Task::new("outline the thesis", "first")).unwrap();
    let waiting = d.submit(Task::new("outline the thesis", "second")).unwrap();

    assert!(matches!(d.cancel(running.id), Err(DispatchError::NotQueued(_))));
    d.cancel(waiting.id).unwrap();

    let waiting_id = waiting.id;
    let err = waiting.wait().await.unwrap_err();
    assert!(matches!(err, DispatchError::Cancelled(id) if id == waiting_id));
    assert_eq!(d.status(waiting_id).unwrap().status, RequestStatus::Cancelled);

    running.wait().await.unwrap();
    assert_eq!(trio.deepseek.prompts(), vec!["first"]);
}

#[tokio::test(start_paused = true)]
async fn prioritize_and_estimate_through_the_dispatcher() {
    let trio = Trio::new(
        ScriptedProvider::new("anthropic"),
        ScriptedProvider::new("deepseek").with_delay(Duration::from_millis(100)),
        ScriptedProvider::new("ollama"),
    );
    let mut config = test_config();
    config.queue.max_concurrent = 1;
    let d = trio.dispatcher(&config);

    let first = d.submit(Task::new("outline the thesis", "1")).unwrap();
    let second = d.submit(Task::new("outline the thesis", "2")).unwrap();
    let third = d.submit(Task::new("outline the thesis", "3")).unwrap();

    d.prioritize(third.id, Priority::HIGH).unwrap();
    assert_eq!(d.status(third.id).unwrap().position, Some(0));
    // No completions yet, so no average to scale by.
    assert_eq!(d.estimate_wait(second.id).unwrap(), Duration::ZERO);

    for handle in [first, second, third] {
        handle.wait().await.unwrap();
    }
    assert_eq!(trio.deepseek.prompts(), vec!["1", "3", "2"]);
}

#[tokio::test]
async fn panicking_provider_fails_the_request_and_frees_its_slot() {
    let trio = Trio::new(
        ScriptedProvider::new("anthropic"),
        ScriptedProvider::new("deepseek").panicking(),
        ScriptedProvider::new("ollama"),
    );
    let mut config = test_config();
    config.queue.max_concurrent = 1;
    let d = trio.dispatcher(&config);

    let doomed = d.submit(Task::new("outline the thesis", "boom")).unwrap();
    let doomed_id = doomed.id;
    let err = doomed.wait().await.unwrap_err();
    assert!(err.to_string().contains("panicked"), "got {err}");
    assert_eq!(d.status(doomed_id).unwrap().status, RequestStatus::Failed);

    let next = Task::new("outline the thesis", "after").with_options(RequestOptions {
        force_provider: Some("anthropic".into()),
        ..RequestOptions::default()
    });
    let result = d.submit(next).unwrap().wait().await.unwrap();
    assert_eq!(result.content, "anthropic: after");
    let snapshot = d.queue_snapshot();
    assert!(snapshot.processing.is_empty());
    assert_eq!(snapshot.stats.total_failed, 1);
}

#[tokio::test(start_paused = true)]
async fn full_queue_rejects_synchronously() {
    let trio = Trio::new(
        ScriptedProvider::new("anthropic"),
        ScriptedProvider::new("deepseek").with_delay(Duration::from_secs(1)),
        ScriptedProvider::new("ollama"),
    );
    let mut config = test_config();
    config.queue.max_concurrent = 1;
    config.queue.max_queue_size = 1;
    let d = trio.dispatcher(&config);

    let _running = d.submit(Task::new("outline the thesis", "a")).unwrap();
    let _waiting = d.submit(Task::new("outline the thesis", "b")).unwrap();
    let err = d.submit(Task::new("outline the thesis", "c")).err().unwrap();
    assert!(matches!(err, DispatchError::QueueFull { max: 1, .. }));
}

#[tokio::test(start_paused = true)]
async fn slow_request_times_out_and_is_failed() {
    let trio = Trio::new(
        ScriptedProvider::new("anthropic"),
        ScriptedProvider::new("deepseek").with_delay(Duration::from_secs(5)),
        ScriptedProvider::new("ollama"),
    );
    let mut config = test_config();
    config.queue.processing_timeout_ms = 500;
    let d = trio.dispatcher(&config);

    let handle = d.submit(Task::new("outline the thesis", "slow")).unwrap();
    let id = handle.id;
    let err = handle.wait().await.unwrap_err();

    assert!(matches!(err, DispatchError::Timeout(500)));
    let snap = d.status(id).unwrap();
    assert_eq!(snap.status, RequestStatus::Failed);
    assert_eq!(d.queue_snapshot().stats.total_failed, 1);
}

// ---------------------------------------------------------------------------
// Provider listing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn providers_report_role_and_availability() {
    let trio = Trio::new(
        ScriptedProvider::new("anthropic"),
        ScriptedProvider::new("deepseek"),
        ScriptedProvider::new("ollama").unavailable(),
    );
    let d = trio.dispatcher(&test_config());

    let listed = d.providers().await;
    assert_eq!(
        listed,
        vec![
            ("anthropic".to_string(), ProviderRole::Primary, true),
            ("deepseek".to_string(), ProviderRole::Secondary, true),
            ("ollama".to_string(), ProviderRole::Secondary, false),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn probe_results_are_cached_for_the_window() {
    let trio = Trio::new(
        ScriptedProvider::new("anthropic"),
        ScriptedProvider::new("deepseek").unavailable(),
        ScriptedProvider::new("ollama"),
    );
    let d = trio.dispatcher(&test_config());
    let task = Task::new("outline the thesis", "p").with_options(bypass());

    assert_eq!(d.route(&task).await.unwrap().provider, "anthropic");

    trio.deepseek.set_available(true);
    assert_eq!(
        d.route(&task).await.unwrap().provider,
        "anthropic",
        "stale probe still in window"
    );

    tokio::time::advance(Duration::from_secs(61)).await;
    assert_eq!(d.route(&task).await.unwrap().provider, "deepseek");
}

#[tokio::test]
async fn custom_policy_table_replaces_defaults() {
    use plume::dispatcher::Dispatcher;
    use plume::router::PolicyTable;
    use std::sync::Arc;

    let trio = Trio::healthy();
    let mut table = PolicyTable::empty();
    table.set(Policy::Balanced, TaskCategory::Code, &["ollama", "anthropic"]);
    let d = Arc::new(Dispatcher::new(&test_config(), trio.registry()).with_policy_table(table));

    assert_eq!(d.registry().primary(), "anthropic");
    let code = d.route(&Task::new("debug the script", "x")).await.unwrap();
    assert_eq!(code.provider, "ollama");
    // No row for style: primary.
    let style = d.route(&Task::new("polish the prose", "x")).await.unwrap();
    assert_eq!(style.provider, "anthropic");

    d.clear_cache();
    assert_eq!(d.cache_stats().entries, 0);
}
