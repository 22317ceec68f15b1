// In-process capture service: monitors are plugged and frames are pushed by hand
use super::{CaptureBackend, CaptureStream, FrameSink, MonitorDescriptor, Rect, DEFAULT_DPI};
use crate::error::CaptureError;
use crate::gpu::software::{SoftTexture, SoftwareDevice};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStep {
    Unsubscribe(isize),
    CloseSession(isize),
    ClosePool(isize),
}

struct StreamEntry {
    id: u64,
    sink: FrameSink<SoftTexture>,
    subscribed: bool,
}

#[derive(Default)]
struct SimState {
    supported: bool,
    monitors: Vec<MonitorDescriptor>,
    failing: HashSet<isize>,
    active: Vec<StreamEntry>,
    retired: Vec<FrameSink<SoftTexture>>,
    teardown: Vec<TeardownStep>,
    next_id: u64,
    opened: usize,
}

#[derive(Clone)]
pub struct SimulatedCapture {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedCapture {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                supported: true,
                ..SimState::default()
            })),
        }
    }

    /// `count` 1920x1080 monitors laid out left to right, handles starting at 1.
    pub fn with_monitors(count: usize) -> Self {
        let capture = Self::new();
        for i in 0..count {
            capture.connect(Self::monitor(i as isize + 1));
        }
        capture
    }

    pub fn monitor(handle: isize) -> MonitorDescriptor {
        let left = (handle as i32 - 1) * 1920;
        MonitorDescriptor {
            handle,
            name: format!("\\\\.\\DISPLAY{}", handle),
            bounds: Rect::new(left, 0, left + 1920, 1080),
            dpi: DEFAULT_DPI,
            is_primary: handle == 1,
        }
    }

    pub fn connect(&self, monitor: MonitorDescriptor) {
        self.state.lock().monitors.push(monitor);
    }

    pub fn disconnect(&self, handle: isize) {
        self.state.lock().monitors.retain(|m| m.handle != handle);
    }

    pub fn set_supported(&self, supported: bool) {
        self.state.lock().supported = supported;
    }

    pub fn fail_monitor(&self, handle: isize) {
        self.state.lock().failing.insert(handle);
    }

    /// Pushes one frame through every subscribed stream of `handle`.
    pub fn emit(&self, handle: isize, frame: Option<&SoftTexture>) -> usize {
        let sinks: Vec<_> = {
            let state = self.state.lock();
            state
                .active
                .iter()
                .filter(|e| e.subscribed && e.sink.monitor() == handle)
                .map(|e| e.sink.clone())
                .collect()
        };
        sinks.iter().filter(|sink| sink.deliver(frame)).count()
    }

    /// Replays a frame that was already in flight when its stream was torn down.
    pub fn emit_late(&self, handle: isize, frame: &SoftTexture) -> usize {
        let sinks: Vec<_> = {
            let state = self.state.lock();
            state
                .retired
                .iter()
                .filter(|sink| sink.monitor() == handle)
                .cloned()
                .collect()
        };
        sinks.iter().filter(|sink| sink.deliver(Some(frame))).count()
    }

    pub fn teardown_log(&self) -> Vec<TeardownStep> {
        self.state.lock().teardown.clone()
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().opened
    }

    pub fn active_streams(&self) -> usize {
        self.state.lock().active.len()
    }
}

impl CaptureBackend for SimulatedCapture {
    type Device = SoftwareDevice;
    type Stream = SimulatedStream;

    fn is_supported(&self) -> bool {
        self.state.lock().supported
    }

    fn enumerate_monitors(&self) -> Result<Vec<MonitorDescriptor>, CaptureError> {
        Ok(self.state.lock().monitors.clone())
    }

    fn open(
        &self,
        _device: &Arc<SoftwareDevice>,
        monitor: &MonitorDescriptor,
        sink: FrameSink<SoftTexture>,
    ) -> Result<SimulatedStream, CaptureError> {
        let mut state = self.state.lock();
        if state.failing.contains(&monitor.handle) {
            return Err(CaptureError::Open {
                monitor: monitor.name.clone(),
                message: "simulated failure".to_string(),
            });
        }
        if !state.monitors.iter().any(|m| m.handle == monitor.handle) {
            return Err(CaptureError::Open {
                monitor: monitor.name.clone(),
                message: "monitor is not connected".to_string(),
            });
        }

        let id = state.next_id;
        state.next_id += 1;
        state.opened += 1;
        state.active.push(StreamEntry {
            id,
            sink,
            subscribed: true,
        });

        Ok(SimulatedStream {
            id,
            monitor: monitor.handle,
            state: Arc::clone(&self.state),
        })
    }
}

pub struct SimulatedStream {
    id: u64,
    monitor: isize,
    state: Arc<Mutex<SimState>>,
}

impl CaptureStream for SimulatedStream {
    fn unsubscribe(&mut self) {
        let mut state = self.state.lock();
        let id = self.id;
        let mut retired = None;
        if let Some(entry) = state.active.iter_mut().find(|e| e.id == id) {
            entry.subscribed = false;
            retired = Some(entry.sink.clone());
        }
        if let Some(sink) = retired {
            state.retired.push(sink);
        }
        state.teardown.push(TeardownStep::Unsubscribe(self.monitor));
    }

    fn close_session(&mut self) {
        self.state
            .lock()
            .teardown
            .push(TeardownStep::CloseSession(self.monitor));
    }

    fn close_pool(&mut self) {
        let mut state = self.state.lock();
        let id = self.id;
        state.active.retain(|e| e.id != id);
        state.teardown.push(TeardownStep::ClosePool(self.monitor));
    }
}
