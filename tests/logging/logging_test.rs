//! Tests for `src/logging.rs`.

use clinic_kernel::logging::LoggingGuard;

#[test]
fn logging_guard_is_send() {
    fn assert_send<T: Send>() {}
    assert_send::<LoggingGuard>();
}

#[test]
fn init_production_creates_logs_dir() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let logs_dir = tmp.path().join("nested").join("logs");
    assert!(!logs_dir.exists());

    // Another test in this binary may have installed the global subscriber
    // first, in which case this returns an error after creating the dir.
    let _result = clinic_kernel::logging::init_production(&logs_dir);
    assert!(logs_dir.exists(), "logs directory should be created");
}

#[test]
fn init_cli_tolerates_repeat_calls() {
    clinic_kernel::logging::init_cli();
    clinic_kernel::logging::init_cli();
}

#[test]
fn init_production_opens_main_and_security_logs() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let _result = clinic_kernel::logging::init_production(tmp.path());

    let names: Vec<String> = std::fs::read_dir(tmp.path())
        .expect("read logs dir")
        .map(|entry| entry.expect("dir entry").file_name().to_string_lossy().into_owned())
        .collect();
    assert!(names
        .iter()
        .any(|n| n.starts_with(&format!("{}.", clinic_kernel::logging::LOG_FILE_NAME))));
    assert!(names
        .iter()
        .any(|n| n.starts_with(clinic_kernel::logging::SECURITY_LOG_FILE_NAME)));
}

#[test]
fn only_marked_events_are_security_events() {
    use std::sync::{Arc, Mutex};

    use tracing::{Event, Subscriber};
    use tracing_subscriber::layer::{Context, SubscriberExt};
    use tracing_subscriber::Layer;

    struct Marks(Arc<Mutex<Vec<bool>>>);

    impl<S: Subscriber> Layer<S> for Marks {
        fn on_event(&self, event: &Event<'_>, _: Context<'_, S>) {
            let marked = clinic_kernel::logging::is_security_event(event.metadata());
            self.0.lock().expect("lock").push(marked);
        }
    }

    let marks = Arc::new(Mutex::new(Vec::new()));
    let subscriber = tracing_subscriber::registry().with(Marks(Arc::clone(&marks)));
    tracing::subscriber::with_default(subscriber, || {
        tracing::warn!(security_event = true, "cross-tenant reference rejected");
        tracing::info!(tenant_id = 1, "mutation committed");
    });

    assert_eq!(*marks.lock().expect("lock"), vec![true, false]);
}
