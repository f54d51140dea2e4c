use crate::infrastructure::ScriptHarness;
use eyre::Result;
use proctest::{dump_on_error, wait_for_strings, HarnessConfig, Waiter};
use std::time::{Duration, Instant};

const STARTUP: &str = "echo 'booting'\nsleep 0.2\necho 'config loaded from /etc/app.toml' >&2\n\
                       sleep 0.2\necho 'listening on 127.0.0.1:8080'; echo 'ready'\nexec sleep 30";

/// Startup lines written over time, across stdout and stderr, are found in order
#[test]
fn test_wait_for_startup_sequence() -> Result<()> {
    proctest::logging::init();

    let harness = ScriptHarness::new()?;
    let mut process = harness.spawn_script("startup.sh", STARTUP)?;

    let start = Instant::now();
    wait_for_strings(
        || process.read().to_string(),
        Duration::from_secs(10),
        &["booting", "config loaded", "listening on", "ready"],
    )?;
    assert!(start.elapsed() < Duration::from_secs(5), "should not wait for the full timeout");
    Ok(())
}

/// Strings that show up in the wrong order fail after the timeout
#[test]
fn test_wrong_order_times_out() -> Result<()> {
    let harness = ScriptHarness::new()?;
    let mut process = harness.spawn_script("reversed.sh", "echo 'B then A'\nexec sleep 30")?;

    let start = Instant::now();
    let err = wait_for_strings(
        || process.read().to_string(),
        Duration::from_millis(500),
        &["A", "B"],
    )
    .unwrap_err();

    assert!(start.elapsed() >= Duration::from_millis(500));
    assert_eq!(err.targets, vec!["A".to_string(), "B".to_string()]);
    assert!(err.to_string().starts_with("Waited 0.50secs"));
    Ok(())
}

/// After a reset, only output produced afterwards counts
#[test]
fn test_reset_between_phases() -> Result<()> {
    let harness = ScriptHarness::new()?;
    let mut process = harness.spawn_script(
        "phases.sh",
        "echo 'phase one done'\nsleep 0.5\necho 'phase two done'\nexec sleep 30",
    )?;
    let waiter = Waiter::from_config(&HarnessConfig::default());

    waiter.wait_for(&mut process, Duration::from_secs(5), &["phase one done"])?;
    process.reset();
    waiter.wait_for(&mut process, Duration::from_secs(5), &["phase two done"])?;
    assert!(!process.output().contains("phase one"));
    Ok(())
}

/// The dump scope hands the original error back
#[test]
fn test_dump_on_error_with_process() -> Result<()> {
    let harness = ScriptHarness::new()?;
    let mut process = harness.spawn_script("chatty.sh", "echo 'something unexpected'\nexec sleep 30")?;

    let result = dump_on_error(&mut process, |process| {
        Waiter::default().wait_for(process, Duration::from_millis(300), &["never printed"])
    });

    let err = result.unwrap_err();
    assert_eq!(err.targets, vec!["never printed".to_string()]);
    assert!(process.read().contains("something unexpected"));
    Ok(())
}

/// Large outputs are drained completely, in chunks
#[test]
fn test_large_output() -> Result<()> {
    let harness = ScriptHarness::new()?;
    let mut process = harness.spawn_script(
        "large.sh",
        "i=0\nwhile [ $i -lt 2000 ]; do echo \"line $i of output\"; i=$((i+1)); done\necho finished\nexec sleep 30",
    )?;

    wait_for_strings(
        || process.read().to_string(),
        Duration::from_secs(10),
        &["line 0 of output", "line 1999 of output", "finished"],
    )?;
    assert_eq!(process.output().lines().count(), 2001);
    Ok(())
}

/// The async waiter drives the same polling from a tokio test
#[tokio::test]
async fn test_wait_async_on_process() -> Result<()> {
    let harness = ScriptHarness::new()?;
    let mut process = harness.spawn_script("async.sh", "sleep 0.2\necho 'async ready'\nexec sleep 30")?;

    Waiter::default()
        .wait_async(|| process.read().to_string(), Duration::from_secs(5), &["async ready"])
        .await?;
    Ok(())
}

/// Harness environment and working directory reach the script
#[test]
fn test_environment_and_directory() -> Result<()> {
    let mut harness = ScriptHarness::new()?;
    harness.set_environment("PROCTEST_GREETING", "hi there");
    std::fs::write(harness.temp_path().join("marker.txt"), "marker contents\n")?;

    let mut process = harness.spawn_script("env.sh", "echo \"$PROCTEST_GREETING\"\ncat marker.txt\nexec sleep 30")?;
    wait_for_strings(
        || process.read().to_string(),
        Duration::from_secs(5),
        &["hi there", "marker contents"],
    )?;
    Ok(())
}
