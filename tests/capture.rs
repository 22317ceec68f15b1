use claritylayer::capture::simulated::{SimulatedCapture, TeardownStep};
use claritylayer::capture::{FrameHandle, FrameSource};
use claritylayer::gpu::software::{SoftTexture, SoftwareDevice};
use claritylayer::gpu::{DeviceSlot, Extent};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn source(capture: &SimulatedCapture) -> (FrameSource<SimulatedCapture>, DeviceSlot<SoftwareDevice>) {
    let slot = DeviceSlot::new();
    slot.publish(Arc::new(SoftwareDevice::new()));
    let source = FrameSource::new(capture.clone());
    source.initialize(slot.handle()).unwrap();
    (source, slot)
}

fn frame() -> SoftTexture {
    SoftTexture::filled(Extent::new(4, 4), [0.2, 0.4, 0.6, 1.0])
}

#[test]
fn stop_then_start_recreates_one_session_per_monitor() {
    let capture = SimulatedCapture::with_monitors(3);
    let (source, _slot) = source(&capture);

    assert_eq!(source.start().unwrap(), 3);
    source.stop();
    assert_eq!(source.session_count(), 0);
    assert_eq!(source.start().unwrap(), 3);
    assert_eq!(source.session_count(), 3);
    assert_eq!(capture.active_streams(), 3);
}

#[test]
fn unplugged_monitor_is_dropped_on_display_change() {
    let capture = SimulatedCapture::with_monitors(2);
    let (source, _slot) = source(&capture);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    source.set_frame_callback(Arc::new(move |frame: &FrameHandle<'_, SoftTexture>| {
        sink.lock().push(frame.monitor());
    }));

    assert_eq!(source.start().unwrap(), 2);
    let frame = frame();
    assert_eq!(capture.emit(2, Some(&frame)), 1);

    capture.disconnect(2);
    assert_eq!(source.on_display_change().unwrap(), 1);
    assert_eq!(source.monitors().len(), 1);

    // Frames still queued against the removed monitor's torn-down stream
    assert_eq!(capture.emit_late(2, &frame), 0);
    assert_eq!(capture.emit(2, Some(&frame)), 0);
    assert_eq!(capture.emit(1, Some(&frame)), 1);

    assert_eq!(*seen.lock(), vec![2, 1]);
}

#[test]
fn every_session_is_torn_down_in_order() {
    let capture = SimulatedCapture::with_monitors(2);
    let (source, _slot) = source(&capture);
    source.start().unwrap();
    source.restart().unwrap();

    let log = capture.teardown_log();
    assert_eq!(log.len(), 6);
    for chunk in log.chunks(3) {
        assert!(matches!(chunk[0], TeardownStep::Unsubscribe(_)));
        assert!(matches!(chunk[1], TeardownStep::CloseSession(_)));
        assert!(matches!(chunk[2], TeardownStep::ClosePool(_)));
    }
    assert_eq!(source.session_count(), 2);
}

#[test]
fn monitors_deliver_concurrently() {
    let capture = SimulatedCapture::with_monitors(4);
    let (source, _slot) = source(&capture);
    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&delivered);
    source.set_frame_callback(Arc::new(move |_: &FrameHandle<'_, SoftTexture>| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    source.start().unwrap();

    let workers: Vec<_> = (1..=4)
        .map(|handle| {
            let capture = capture.clone();
            std::thread::spawn(move || {
                let frame = frame();
                for _ in 0..25 {
                    capture.emit(handle, Some(&frame));
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(delivered.load(Ordering::SeqCst), 100);
}

#[test]
fn dropping_the_source_closes_every_session() {
    let capture = SimulatedCapture::with_monitors(2);
    {
        let (source, _slot) = source(&capture);
        source.start().unwrap();
    }
    assert_eq!(capture.active_streams(), 0);
    assert_eq!(capture.teardown_log().len(), 6);
}
