use anyhow::{Result, anyhow};
use events_service::{models::retry::RetryConfig, utils::retry_with_backoff};
use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};
use tokio::time::Instant;

/// Test: A successful connect attempt completes without backing off
#[tokio::test]
async fn test_successful_attempt_skips_backoff() -> Result<()> {
    let config = RetryConfig {
        max_attempts: 3,
        initial_delay_ms: 100,
        max_delay_ms: 1000,
        backoff_multiplier: 2,
    };

    let attempt_count = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempt_count);

    let result = retry_with_backoff(&config, || {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>("connected")
        }
    })
    .await?;

    assert_eq!(result, "connected");
    assert_eq!(
        attempt_count.load(Ordering::SeqCst),
        1,
        "Should only attempt once"
    );

    Ok(())
}

/// Test: Transient broker failures are retried until the connect succeeds
#[tokio::test]
async fn test_transient_failures_are_retried() -> Result<()> {
    let config = RetryConfig {
        max_attempts: 5,
        initial_delay_ms: 20,
        max_delay_ms: 200,
        backoff_multiplier: 2,
    };

    let attempt_count = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempt_count);

    let result = retry_with_backoff(&config, || {
        let counter = Arc::clone(&counter);
        async move {
            let attempts = counter.fetch_add(1, Ordering::SeqCst);

            if attempts < 2 {
                Err(anyhow!("connection refused"))
            } else {
                Ok("connected")
            }
        }
    })
    .await?;

    assert_eq!(result, "connected");
    assert_eq!(
        attempt_count.load(Ordering::SeqCst),
        3,
        "Should retry twice then succeed"
    );

    Ok(())
}

/// Test: A dead endpoint exhausts the attempt budget and surfaces the error
#[tokio::test]
async fn test_exhausted_attempts_surface_the_error() -> Result<()> {
    let config = RetryConfig {
        max_attempts: 4,
        initial_delay_ms: 10,
        max_delay_ms: 100,
        backoff_multiplier: 2,
    };

    let attempt_count = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempt_count);

    let result = retry_with_backoff(&config, || {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<String, _>(anyhow!("no route to host"))
        }
    })
    .await;

    assert!(result.is_err());
    assert_eq!(
        attempt_count.load(Ordering::SeqCst),
        4,
        "Should attempt exactly max_attempts times"
    );

    Ok(())
}

/// Test: Delay growth is capped by max_delay_ms
#[tokio::test]
async fn test_delay_growth_is_capped() -> Result<()> {
    let config = RetryConfig {
        max_attempts: 5,
        initial_delay_ms: 50,
        max_delay_ms: 100,
        backoff_multiplier: 2,
    };

    // Four sleeps: ~50 then ~100 capped thereafter, each jittered by ±10%.
    let started = Instant::now();
    let _ = retry_with_backoff(&config, || async {
        Err::<String, _>(anyhow!("still down"))
    })
    .await;
    let elapsed = started.elapsed().as_millis();

    assert!(elapsed >= 300, "Delays should accumulate (got {elapsed}ms)");
    assert!(
        elapsed < 1500,
        "Uncapped growth would sleep far longer (got {elapsed}ms)"
    );

    Ok(())
}

/// Test: Concurrent operations keep independent retry state
#[tokio::test]
async fn test_operations_retry_independently() -> Result<()> {
    let config = Arc::new(RetryConfig {
        max_attempts: 5,
        initial_delay_ms: 10,
        max_delay_ms: 100,
        backoff_multiplier: 2,
    });

    let config1 = Arc::clone(&config);
    let handle1 = tokio::spawn(async move {
        retry_with_backoff(&config1, || async {
            Err::<String, _>(anyhow!("always down"))
        })
        .await
    });

    let config2 = Arc::clone(&config);
    let counter2 = Arc::new(AtomicU32::new(0));
    let counter2_clone = Arc::clone(&counter2);
    let handle2 = tokio::spawn(async move {
        retry_with_backoff(&config2, || {
            let counter = Arc::clone(&counter2_clone);
            async move {
                let attempts = counter.fetch_add(1, Ordering::SeqCst);
                if attempts < 2 {
                    Err(anyhow!("warming up"))
                } else {
                    Ok("connected")
                }
            }
        })
        .await
    });

    let (result1, result2) = tokio::join!(handle1, handle2);

    assert!(result1?.is_err(), "First operation should exhaust retries");
    assert!(result2?.is_ok(), "Second operation should succeed");
    assert_eq!(counter2.load(Ordering::SeqCst), 3);

    Ok(())
}
