use serial_test::serial;

use super::availability::{probe_runtimes, RuntimeSelector};
use crate::config::RuntimeConfig;

#[tokio::test]
async fn blank_input_is_rejected_before_any_backend() {
    let selector = RuntimeSelector::new(RuntimeConfig::default());
    for blank in ["", "   ", " \n\t \n"] {
        let result = selector.execute(blank).await.unwrap();
        assert_eq!(result.stdout, "");
        assert!(result.stderr.contains("no code provided"));
        assert_eq!(result.exit_code, Some(1));
    }
}

#[tokio::test]
#[serial]
async fn probe_is_computed_once_and_cached() {
    let first = probe_runtimes(&RuntimeConfig::default()).await;

    // A different config on a later probe must not re-run initialization;
    // the cached record is returned as-is.
    let mut other = RuntimeConfig::default();
    other.resource_root = Some(std::path::PathBuf::from("/nonexistent/bundle"));
    let second = probe_runtimes(&other).await;

    assert!(std::ptr::eq(first, second));
    assert_eq!(first.native_detail, second.native_detail);
    assert_eq!(first.sandbox_detail, second.sandbox_detail);
}
