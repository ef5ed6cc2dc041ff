//! End-to-end exports through `ScriptHost`.

mod common;

use std::cell::Cell;
use std::path::PathBuf;
use std::rc::Rc;

use common::harness;
use sketchbox::delegate::{ExportEvent, NullDelegate};
use sketchbox::diagnostics::ErrorKind;
use sketchbox::export::{ExportOptions, ExportTarget};
use sketchbox::scheduler::Pump;
use sketchbox::ScriptHost;

fn range(first: u32, last: u32) -> ExportOptions {
    ExportOptions {
        first,
        last: Some(last),
        ..ExportOptions::default()
    }
}

#[test]
fn test_every_page_rendered_once_in_order() {
    let mut h = harness(4);
    assert!(h.host.compile("print(PAGENUM); rect(0, 0, 2, 2);").ok);
    assert!(h.host.export(ExportTarget::Image, "/tmp/pages.png", &range(3, 20)).ok);
    h.host.run_until_idle();

    let expected: Vec<String> = (3..=20).map(|i| format!("{}\n", i)).collect();
    assert_eq!(h.delegate.borrow().frame_output, expected);
    assert_eq!(h.writes.borrow().frames, 18);
    assert_eq!(h.writes.borrow().closed, 1);
    assert_eq!(h.delegate.borrow().events, vec![ExportEvent::Complete]);
}

#[test]
fn test_export_yields_between_batches() {
    let mut h = harness(2);
    assert!(h.host.compile("rect(0, 0, 2, 2);").ok);
    assert!(h.host.export(ExportTarget::Image, "/tmp/yield.png", &range(1, 6)).ok);
    assert_eq!(h.host.pump(), Pump::Busy);
    assert_eq!(h.writes.borrow().frames, 2);
    assert_eq!(h.host.pump(), Pump::Busy);
    assert_eq!(h.writes.borrow().frames, 4);
    h.host.run_until_idle();
    assert_eq!(h.writes.borrow().frames, 6);
    assert!(!h.host.is_exporting());
}

#[test]
fn test_written_is_monotonic_and_bounded() {
    let mut h = harness(3);
    assert!(h.host.compile("fn draw() { rect(FRAME, 0, 2, 2); }").ok);
    assert!(h.host.export(ExportTarget::Image, "/tmp/anim.png", &range(1, 10)).ok);
    h.host.run_until_idle();

    let delegate = h.delegate.borrow();
    assert!(!delegate.progress.is_empty());
    let mut last = 0;
    for &(written, total, cancelled) in &delegate.progress {
        assert!(written >= last);
        assert!(written <= total);
        assert_eq!(total, 10);
        assert!(!cancelled);
        last = written;
    }
    assert_eq!(last, 10);
}

#[test]
fn test_cancel_after_three_of_ten() {
    let mut h = harness(1);
    assert!(h.host.compile("rect(0, 0, 2, 2);").ok);
    assert!(h.host.export(ExportTarget::Image, "/tmp/cancel.png", &range(1, 10)).ok);

    let completed = Rc::new(Cell::new(0));
    let c = completed.clone();
    assert!(h.host.on_export_complete(move || c.set(c.get() + 1)));

    while h.writes.borrow().frames < 3 {
        assert_eq!(h.host.pump(), Pump::Busy);
    }
    h.host.cancel_export();
    h.host.run_until_idle();

    let writes = h.writes.borrow();
    assert_eq!(writes.frames, 3);
    assert_eq!(writes.closed, 1);
    assert_eq!(completed.get(), 1);

    let delegate = h.delegate.borrow();
    assert_eq!(delegate.progress.last(), Some(&(3, 3, true)));
    assert!(delegate
        .progress
        .iter()
        .filter(|p| p.2)
        .all(|&(_, total, _)| total == 3));
    assert_eq!(
        delegate.events,
        vec![ExportEvent::Cancelled { added: 3 }, ExportEvent::Complete]
    );
}

#[test]
fn test_single_page_uses_requested_filename() {
    let mut h = harness(8);
    assert!(h.host.compile("rect(0, 0, 2, 2);").ok);
    assert!(h.host.export(ExportTarget::Image, "/tmp/out/cover.png", &range(1, 1)).ok);
    h.host.run_until_idle();
    assert_eq!(h.writes.borrow().pages, vec![PathBuf::from("/tmp/out/cover.png")]);
}

#[test]
fn test_page_sequence_is_zero_padded() {
    let mut h = harness(8);
    assert!(h.host.compile("rect(0, 0, 2, 2);").ok);
    assert!(h.host.export(ExportTarget::Image, "/tmp/out/page.png", &range(1, 5)).ok);
    h.host.run_until_idle();
    let expected: Vec<PathBuf> = (1..=5)
        .map(|i| PathBuf::from(format!("/tmp/out/page-{:05}.png", i)))
        .collect();
    assert_eq!(h.writes.borrow().pages, expected);
}

#[test]
fn test_script_failure_aborts_export() {
    let mut h = harness(4);
    let src = "fn draw() {\n  if FRAME == 4 { throw \"bad frame\"; }\n  rect(0, 0, 2, 2);\n}\nfn stop() { print(\"stopped\"); }";
    assert!(h.host.compile(src).ok);
    assert!(h.host.export(ExportTarget::Image, "/tmp/fail.png", &range(1, 10)).ok);
    h.host.run_until_idle();

    assert_eq!(h.writes.borrow().frames, 3);
    let delegate = h.delegate.borrow();
    assert!(matches!(delegate.events.as_slice(), [ExportEvent::Failed { .. }]));
    let failed = delegate.statuses.iter().find(|o| !o.ok).unwrap();
    assert_eq!(failed.kind(), Some(ErrorKind::RuntimeError));
    assert!(delegate.statuses.iter().all(|o| !o.stdout_text().contains("stopped")));
}

#[test]
fn test_vector_format_is_a_write_error() {
    let mut h = harness(4);
    assert!(h.host.compile("rect(0, 0, 2, 2);").ok);
    assert!(h.host.export(ExportTarget::Image, "/tmp/doc.pdf", &range(1, 1)).ok);
    h.host.run_until_idle();

    let delegate = h.delegate.borrow();
    assert!(delegate
        .statuses
        .iter()
        .any(|o| o.kind() == Some(ErrorKind::ExportWriteError)));
    assert!(matches!(delegate.events.as_slice(), [ExportEvent::Failed { .. }]));
    assert_eq!(h.writes.borrow().frames, 0);
}

#[test]
fn test_halt_keeps_frame_and_finishes() {
    let mut h = harness(4);
    let src = "fn draw() { rect(0, 0, 2, 2); if FRAME == 3 { halt(); } }";
    assert!(h.host.compile(src).ok);
    assert!(h.host.export(ExportTarget::Image, "/tmp/halt.png", &range(1, 10)).ok);
    h.host.run_until_idle();

    assert_eq!(h.writes.borrow().frames, 3);
    assert_eq!(
        h.delegate.borrow().events,
        vec![ExportEvent::Cancelled { added: 3 }, ExportEvent::Complete]
    );
}

#[test]
fn test_movie_encoder_created_from_first_frame() {
    let mut h = harness(8);
    let src = "size(32, 24); speed(12); fn draw() { rect(FRAME, 0, 4, 4); }";
    assert!(h.host.compile(src).ok);
    let opts = ExportOptions {
        last: Some(5),
        fps: 12.0,
        loop_count: -1,
        ..ExportOptions::default()
    };
    assert!(h.host.export(ExportTarget::Movie, "/tmp/clip.mp4", &opts).ok);
    h.host.run_until_idle();

    let writes = h.writes.borrow();
    assert_eq!(writes.movies.len(), 1);
    assert_eq!((writes.movies[0].width, writes.movies[0].height), (32, 24));
    assert_eq!(writes.frames, 5);
    assert!(writes.pages.is_empty());
}

#[test]
fn test_png_sequence_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let mut host = ScriptHost::new(Rc::new(std::cell::RefCell::new(NullDelegate)));
    assert!(host.compile("size(20, 10); background(1); fill(0); rect(0, 0, 5, 5);").ok);
    let target = dir.path().join("frame-###.png");
    assert!(host.export(ExportTarget::Image, &target, &range(1, 3)).ok);
    host.run_until_idle();

    for i in 1..=3 {
        let path = dir.path().join(format!("frame-{:03}.png", i));
        let img = image::open(&path).unwrap();
        assert_eq!((img.width(), img.height()), (20, 10));
    }
}

#[test]
fn test_animated_gif_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let mut host = ScriptHost::new(Rc::new(std::cell::RefCell::new(NullDelegate)));
    assert!(host.compile("size(16, 16); fn draw() { rect(FRAME, 0, 4, 4); }").ok);
    let target = dir.path().join("anim.gif");
    let opts = ExportOptions {
        last: Some(4),
        fps: 10.0,
        ..ExportOptions::default()
    };
    assert!(host.export(ExportTarget::Movie, &target, &opts).ok);
    host.run_until_idle();

    let bytes = std::fs::read(&target).unwrap();
    assert_eq!(&bytes[..3], b"GIF");
}

#[test]
fn test_failing_stop_hook_keeps_every_frame() {
    let mut h = harness(2);
    let src = r#"fn draw() { rect(0, 0, 2, 2); } fn stop() { throw "cleanup"; }"#;
    assert!(h.host.compile(src).ok);
    assert!(h.host.export(ExportTarget::Image, "/tmp/stop.png", &range(1, 3)).ok);
    h.host.run_until_idle();

    assert_eq!(h.writes.borrow().frames, 3);
    assert_eq!(h.writes.borrow().closed, 1);
    let delegate = h.delegate.borrow();
    assert_eq!(delegate.events, vec![ExportEvent::Complete]);
    // the stop failure is still reported, after the last frame
    let last = delegate.statuses.last().unwrap();
    assert_eq!(last.kind(), Some(ErrorKind::RuntimeError));
    assert!(last.stderr_text().contains("cleanup"));
}

#[test]
fn test_stop_hook_runs_after_last_frame() {
    let mut h = harness(4);
    let src = r#"fn draw() { rect(0, 0, 2, 2); print(FRAME); } fn stop() { print("stopped"); }"#;
    assert!(h.host.compile(src).ok);
    assert!(h.host.export(ExportTarget::Image, "/tmp/stopped.png", &range(1, 3)).ok);
    h.host.run_until_idle();

    let delegate = h.delegate.borrow();
    assert_eq!(delegate.frame_output, vec!["1\n", "2\n", "3\n"]);
    assert_eq!(delegate.statuses.last().unwrap().stdout_text(), "stopped\n");
}

#[test]
fn test_clock_stopping_early_cancels_export() {
    let mut h = harness(4);
    let src = "speed(0); fn draw() { rect(FRAME, 0, 2, 2); }";
    assert!(h.host.compile(src).ok);
    assert!(h.host.export(ExportTarget::Image, "/tmp/still.png", &range(1, 5)).ok);
    h.host.run_until_idle();

    assert_eq!(h.writes.borrow().frames, 1);
    assert_eq!(
        h.delegate.borrow().events,
        vec![ExportEvent::Cancelled { added: 1 }, ExportEvent::Complete]
    );
}

#[test]
fn test_hooks_with_state_argument_export() {
    let mut h = harness(4);
    let src = "fn setup(anim) { anim.n = 0; }\nfn draw(anim) { anim.n += 1; print(anim.n); rect(0, 0, 2, 2); }";
    assert!(h.host.compile(src).ok);
    assert!(h.host.export(ExportTarget::Image, "/tmp/state.png", &range(1, 3)).ok);
    h.host.run_until_idle();

    assert_eq!(h.writes.borrow().frames, 3);
    assert_eq!(h.delegate.borrow().frame_output, vec!["1\n", "2\n", "3\n"]);
    assert_eq!(h.delegate.borrow().events, vec![ExportEvent::Complete]);
}
