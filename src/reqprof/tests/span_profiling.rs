use std::{
    fs,
    hint::black_box,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use reqprof::{
    config::{OutputFormat, ProfilerConfig},
    report::json,
    AnalysisMode, FoldedStacks, FrameHierarchy, Profiler, SpanStackLayer,
};
use tracing::info_span;
use tracing_subscriber::{layer::SubscriberExt, registry};

fn busy_work(n: u64) -> u64 {
    let span = info_span!("busy_work");
    let _span = span.enter();
    (0..n).fold(0u64, |acc, i| black_box(acc.wrapping_mul(31).wrapping_add(i)))
}

#[test]
fn profiles_spans_entered_on_another_thread() {
    let dir = tempfile::tempdir().unwrap();
    let layer = SpanStackLayer::new();
    let config = ProfilerConfig {
        enabled: true,
        save_path: dir.path().to_path_buf(),
        sampling_interval: Duration::from_millis(10),
        sampling_duration: Duration::from_millis(200),
        format: OutputFormat::Json,
        analysis_mode: AnalysisMode::Cpu,
        min_samples: 1,
        ..Default::default()
    };
    let profiler = Profiler::new(config, Arc::new(layer.clone())).unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let worker = {
        let done = done.clone();
        let subscriber = registry().with(layer);
        thread::Builder::new()
            .name("api-worker".to_string())
            .spawn(move || {
                let _default = tracing::subscriber::set_default(subscriber);
                let request = info_span!("handle_request", path = "/orders");
                let _request = request.enter();
                while !done.load(Ordering::Relaxed) {
                    busy_work(10_000);
                }
            })
            .unwrap()
    };

    profiler.start_profiling("e2e", Some("orders"));
    thread::sleep(Duration::from_millis(250));
    let path = profiler.stop_profiling("e2e").unwrap();

    done.store(true, Ordering::Relaxed);
    worker.join().unwrap();

    assert!(path.exists());
    let stacks = json::read_stacks(&fs::read(&path).unwrap()).unwrap();
    assert!(!stacks.is_empty());

    let raw = fs::read_to_string(path.with_extension("txt")).unwrap();
    assert!(!raw.trim().is_empty());
    let raw = FoldedStacks::parse_folded_text(&raw).unwrap();
    assert!(raw.iter().all(|(key, _)| key.starts_with("api-worker;")));
    assert!(raw
        .iter()
        .any(|(key, _)| key.contains("handle_request") && key.contains("busy_work")));

    let tree = FrameHierarchy::build(&stacks);
    assert_eq!(tree.roots().len(), 1);
    let root = &tree.roots()[0];
    assert_eq!(root.label, "api-worker");
    assert_eq!(root.count, root.children_total());
}
