use std::{fs, sync::Arc, thread, time::Duration};

use reqprof::{
    config::{OutputFormat, ProfilerConfig},
    profiler::{RawFrame, StaticThreads, ThreadSnapshot},
    report::json,
    AnalysisMode, Profiler,
};

fn config(dir: &std::path::Path) -> ProfilerConfig {
    ProfilerConfig {
        enabled: true,
        save_path: dir.to_path_buf(),
        sampling_interval: Duration::from_millis(10),
        sampling_duration: Duration::from_secs(30),
        format: OutputFormat::Json,
        min_samples: 1,
        ..Default::default()
    }
}

fn two_workers() -> StaticThreads {
    StaticThreads::new(vec![
        ThreadSnapshot::running(
            "worker-1",
            vec![
                RawFrame::new("app::db", "query", Some(40)),
                RawFrame::new("app::handler", "index", Some(12)),
            ],
        ),
        ThreadSnapshot::blocked(
            "worker-2",
            vec![
                RawFrame::new("parking_lot::mutex", "lock", None),
                RawFrame::new("app::handler", "update", Some(30)),
            ],
        ),
    ])
}

#[test]
fn samples_accumulate_at_least_ticks_times_threads() {
    let dir = tempfile::tempdir().unwrap();
    let profiler = Profiler::new(config(dir.path()), Arc::new(two_workers())).unwrap();

    profiler.start_profiling("req-1", None);
    thread::sleep(Duration::from_millis(150));

    let stats = profiler.session_stats("req-1").unwrap();
    assert!(stats.ticks >= 2, "only {} ticks", stats.ticks);
    assert!(stats.total_samples >= stats.ticks * 2);
    assert_eq!(stats.distinct_stacks, 2);

    let later = {
        thread::sleep(Duration::from_millis(50));
        profiler.session_stats("req-1").unwrap()
    };
    assert!(later.total_samples >= stats.total_samples);

    let path = profiler.stop_profiling("req-1").unwrap();
    let stacks = json::read_stacks(&fs::read(path).unwrap()).unwrap();
    assert_eq!(stacks.len(), 2);
    assert!(stacks.get("worker-1;app::handler::index:12;app::db::query:40").unwrap() >= 2);
}

#[test]
fn second_stop_returns_none() {
    let dir = tempfile::tempdir().unwrap();
    let profiler = Profiler::new(config(dir.path()), Arc::new(two_workers())).unwrap();

    profiler.start_profiling("req-1", Some("GET /orders"));
    thread::sleep(Duration::from_millis(50));

    assert!(profiler.stop_profiling("req-1").is_some());
    assert_eq!(profiler.stop_profiling("req-1"), None);
    assert_eq!(profiler.stop_profiling("never-started"), None);
}

#[test]
fn duplicate_start_keeps_first_session() {
    let dir = tempfile::tempdir().unwrap();
    let profiler = Profiler::new(config(dir.path()), Arc::new(two_workers())).unwrap();

    profiler.start_profiling("req-1", None);
    thread::sleep(Duration::from_millis(60));
    let before = profiler.session_stats("req-1").unwrap();

    profiler.start_profiling("req-1", Some("again"));
    assert_eq!(profiler.active_sessions(), 1);
    let after = profiler.session_stats("req-1").unwrap();
    assert!(after.ticks >= before.ticks);
    assert!(after.total_samples >= before.total_samples);

    let path = profiler.stop_profiling("req-1").unwrap();
    // the label of the rejected start never reaches the report
    assert!(!path.to_string_lossy().contains("again"));
}

#[test]
fn concurrent_starts_have_one_winner() {
    let dir = tempfile::tempdir().unwrap();
    let profiler = Profiler::new(config(dir.path()), Arc::new(two_workers())).unwrap();

    thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| profiler.start_profiling("shared", None));
        }
    });
    assert_eq!(profiler.active_sessions(), 1);
    profiler.shutdown(Duration::from_secs(1));
}

#[test]
fn lock_mode_only_sees_blocked_threads() {
    let dir = tempfile::tempdir().unwrap();
    let config = ProfilerConfig {
        analysis_mode: AnalysisMode::Lock,
        ..config(dir.path())
    };
    let profiler = Profiler::new(config, Arc::new(two_workers())).unwrap();

    profiler.start_profiling("req-1", None);
    thread::sleep(Duration::from_millis(60));
    let path = profiler.stop_profiling("req-1").unwrap();

    let stacks = json::read_stacks(&fs::read(path).unwrap()).unwrap();
    assert_eq!(stacks.len(), 1);
    let (key, count) = stacks.iter().next().unwrap();
    assert_eq!(key, "LOCK|worker-2;app::handler::update:30;parking_lot::mutex::lock");
    assert_eq!(count % 3, 0);
}

#[test]
fn under_threshold_session_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("reports");
    let config = ProfilerConfig {
        min_samples: 1_000_000,
        ..config(&out)
    };
    let profiler = Profiler::new(config, Arc::new(two_workers())).unwrap();

    profiler.start_profiling("req-1", None);
    thread::sleep(Duration::from_millis(30));
    assert_eq!(profiler.stop_profiling("req-1"), None);
    assert!(!out.exists());
}

#[test]
fn expired_session_is_still_collected() {
    let dir = tempfile::tempdir().unwrap();
    let config = ProfilerConfig {
        sampling_duration: Duration::from_millis(40),
        ..config(dir.path())
    };
    let profiler = Profiler::new(config, Arc::new(two_workers())).unwrap();

    profiler.start_profiling("req-1", None);
    thread::sleep(Duration::from_millis(150));

    let ticks = profiler.session_stats("req-1").unwrap().ticks;
    thread::sleep(Duration::from_millis(50));
    assert_eq!(profiler.session_stats("req-1").unwrap().ticks, ticks);

    assert!(profiler.is_active("req-1"));
    assert!(profiler.stop_profiling("req-1").is_some());
}

#[test]
fn disabled_profiler_never_starts() {
    let dir = tempfile::tempdir().unwrap();
    let config = ProfilerConfig {
        enabled: false,
        ..config(dir.path())
    };
    let profiler = Profiler::new(config, Arc::new(two_workers())).unwrap();

    profiler.start_profiling("req-1", None);
    assert!(!profiler.is_active("req-1"));
    assert_eq!(profiler.stop_profiling("req-1"), None);
}

#[test]
fn unsupported_platform_never_starts() {
    let dir = tempfile::tempdir().unwrap();
    let mut threads = two_workers();
    threads.timing_unsupported = true;
    let profiler = Profiler::new(config(dir.path()), Arc::new(threads)).unwrap();

    for _ in 0..3 {
        profiler.start_profiling("req-1", None);
    }
    assert_eq!(profiler.active_sessions(), 0);
}

#[test]
fn shutdown_drains_and_refuses_new_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let profiler = Profiler::new(config(dir.path()), Arc::new(two_workers())).unwrap();

    profiler.start_profiling("a", None);
    profiler.start_profiling("b", None);
    assert_eq!(profiler.active_sessions(), 2);

    profiler.shutdown(Duration::from_secs(1));
    profiler.shutdown(Duration::from_secs(1));
    assert_eq!(profiler.active_sessions(), 0);
    assert_eq!(profiler.stop_profiling("a"), None);

    profiler.start_profiling("c", None);
    assert!(!profiler.is_active("c"));
}
