use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use vigil_core::{CircuitBreakerConfig, ErrorCategory, VigilConfig, VigilError};
use vigil_resilience::{
    CircuitState, ErrorRecoveryManager, GracefulDegradationRegistry, RecoveryContext,
    RecoveryOutcome, ResilientInvoker, RetryPolicy,
};

fn fast_invoker(threshold: u32) -> Arc<ResilientInvoker> {
    let policy = RetryPolicy {
        max_attempts: 2,
        base_delay: Duration::from_millis(5),
        jitter: false,
        ..RetryPolicy::default()
    };
    Arc::new(ResilientInvoker::new(
        policy,
        CircuitBreakerConfig {
            failure_threshold: threshold,
            recovery_timeout_secs: 30.0,
        },
    ))
}

#[tokio::test(start_paused = true)]
async fn open_circuit_switches_feature_to_degraded_mode() {
    let invoker = fast_invoker(2);
    let registry = GracefulDegradationRegistry::new();
    let breakers = Arc::clone(&invoker);
    registry.register_degradable(
        "review_generation",
        move || breakers.circuit_state("llm") != CircuitState::Open,
        |unit: &u64| Ok(format!("heuristic review for {unit}")),
    );

    let _: Result<(), _> = invoker
        .invoke("llm", || async { Err(VigilError::Timeout("llm".into())) })
        .await;
    assert_eq!(invoker.circuit_state("llm"), CircuitState::Open);

    let review = registry
        .use_feature("review_generation", &5_u64, async {
            Ok::<_, VigilError>("llm review".to_string())
        })
        .await
        .unwrap();
    assert_eq!(review, "heuristic review for 5");

    tokio::time::advance(Duration::from_secs(30)).await;
    let recovered = invoker
        .invoke("llm", || async { Ok::<_, VigilError>("pong") })
        .await
        .unwrap();
    assert_eq!(recovered, "pong");

    let review = registry
        .use_feature("review_generation", &5_u64, async {
            Ok::<_, VigilError>("llm review".to_string())
        })
        .await
        .unwrap();
    assert_eq!(review, "llm review");
    assert_eq!(registry.system_health().overall_health, 1.0);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_flow_into_recovery() {
    let invoker = fast_invoker(10);
    let recovery = ErrorRecoveryManager::new();
    recovery.register_fallback("fetch_changes", |_err, event| {
        Ok(format!("empty change set after {}", event.category))
    });

    let counter = AtomicU32::new(0);
    let calls = &counter;
    let result: Result<String, _> = invoker
        .invoke("gitlab", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(VigilError::Http {
                status: 502,
                message: "bad gateway".into(),
            })
        })
        .await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let err = result.unwrap_err();
    let value: String = recovery
        .handle(err, "fetch_changes", "gitlab", RecoveryContext::new(2, 2))
        .unwrap();
    assert_eq!(value, "empty change set after server_error");

    let stats = recovery.statistics();
    assert_eq!(stats.total_errors, 1);
    assert_eq!(stats.by_outcome["fallback-succeeded"], 1);
    assert_eq!(recovery.history()[0].category, ErrorCategory::ServerError);
}

#[tokio::test(start_paused = true)]
async fn concurrent_callers_share_one_failure_count() {
    let invoker = Arc::new(ResilientInvoker::new(
        RetryPolicy::no_retry(),
        CircuitBreakerConfig {
            failure_threshold: 4,
            recovery_timeout_secs: 60.0,
        },
    ));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let invoker = Arc::clone(&invoker);
        handles.push(tokio::spawn(async move {
            invoker
                .invoke("gitlab", || async {
                    Err::<(), _>(VigilError::Connection("refused".into()))
                })
                .await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_err());
    }

    assert_eq!(invoker.circuit_state("gitlab"), CircuitState::Open);
    assert_eq!(invoker.breaker("gitlab").failure_count(), 4);
}

#[test]
fn invoker_reads_config_sections() {
    let config = VigilConfig::from_toml(
        r#"
[retry]
max_attempts = 5
jitter = false

[circuit_breaker]
failure_threshold = 2
"#,
    )
    .unwrap();
    let invoker = ResilientInvoker::from_config(&config);
    assert_eq!(invoker.policy().max_attempts, 5);
    assert!(!invoker.policy().jitter);
    assert_eq!(invoker.circuit_state("anything"), CircuitState::Closed);
}

#[test]
fn none_available_when_nothing_matches() {
    let recovery = ErrorRecoveryManager::new();
    recovery.register_strategy(ErrorCategory::RateLimited, |_, _| Ok(1_u8));
    let err = recovery
        .handle::<u8>(
            VigilError::InvalidInput("bad diff".into()),
            "analyze",
            "analyzer",
            RecoveryContext::default(),
        )
        .unwrap_err();
    assert!(matches!(err, VigilError::InvalidInput(_)));
    assert_eq!(
        recovery.history()[0].outcome,
        Some(RecoveryOutcome::NoneAvailable)
    );
}
