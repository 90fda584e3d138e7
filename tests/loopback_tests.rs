//! End-to-end runs against the in-process loopback server

use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use calloop::EventLoop;
use parking_lot::Mutex;

use qxl_bridge::display::ReleaseListener;
use qxl_bridge::{
    BridgeConfig, CalloopCore, Damage, DisplayContext, LoopbackServer, OutputGeometry,
    PatternRenderer, QxlBackend, ReleaseId, ReleaseNotice, RepaintOutcome, RepaintQueue,
};

#[test]
fn test_frames_flow_through_loopback_server() {
    let seen: Arc<Mutex<Vec<ReleaseNotice>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let listener: ReleaseListener = Arc::new(move |notice: &ReleaseNotice| sink.lock().push(*notice));

    let config = BridgeConfig::default();
    let display = DisplayContext::with_release_listener(&config.display, listener).unwrap();
    let mut event_loop: EventLoop<'static, QxlBackend> = EventLoop::try_new().unwrap();
    let core = Rc::new(CalloopCore::new(event_loop.handle()));
    let queue = RepaintQueue::new();
    let mut backend = QxlBackend::new(
        config,
        display,
        core,
        Box::new(PatternRenderer::new(64, 32)),
        Box::new(queue.clone()),
    )
    .unwrap();

    let server = LoopbackServer::start(Arc::clone(backend.facade())).unwrap();
    let output = backend.create_output(OutputGeometry::new(0, 0, 64, 32)).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut sent = 0;
    while sent < 5 && Instant::now() < deadline {
        for id in queue.take_pending() {
            if let RepaintOutcome::Sent(_) = backend.repaint_output(id, &Damage::full(64, 32)).unwrap() {
                sent += 1;
            }
        }
        event_loop
            .dispatch(Some(Duration::from_millis(10)), &mut backend)
            .unwrap();
    }
    assert_eq!(sent, 5);
    assert!(queue.finished_frames() >= 4);

    // Fill plus five blits
    while server.stats().commands < 6 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }

    let stats = backend.output(output).unwrap().stats();
    assert_eq!(stats.frames_sent, 5);
    assert_eq!(stats.frames_dropped, 0);

    let at_shutdown = backend.shutdown().unwrap();
    let served = server.stop().unwrap();
    assert_eq!(served.surfaces_created, 1);
    assert_eq!(served.memslots, 1);
    assert_eq!(served.commands, 6);
    assert_eq!(served.fills, 1);
    assert_eq!(served.blits, 5);
    assert_eq!(served.pixels, 5 * 64 * 32);
    assert!(at_shutdown.len() <= 1);

    // Surface, background and five frames: each released exactly once
    let mut ids: Vec<ReleaseId> = seen.lock().iter().map(|n| n.id).collect();
    ids.sort();
    assert_eq!(ids, (1..=7).map(ReleaseId).collect::<Vec<_>>());
}
