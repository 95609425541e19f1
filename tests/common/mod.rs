//! A scripted in-memory driver for integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use penflow::driver::{
    CommHandle, CursorInfo, DeviceKind, Driver, DriverError, EventKind, Geometry, LockToken,
    NativeContext, PacketDescription, PacketProperty, PropertyKind, RawEvent, Size, TabletInfo,
    TargetId, WaitOutcome, WakeEvent,
};
use penflow::events::{EventSink, PenEvent, PenEventKind};
use penflow::util::Tick;

pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug"))
        .is_test(true)
        .try_init();
}

#[derive(Default)]
struct MockState {
    tablets: Vec<TabletInfo>,
    next_handle: usize,
    open: HashSet<CommHandle>,
    events: HashMap<CommHandle, VecDeque<RawEvent>>,
    raised: HashSet<WakeEvent>,
    next_wake: usize,
    acquired: HashMap<LockToken, u32>,
    released: HashMap<LockToken, u32>,
    closed: HashMap<CommHandle, u32>,
    description_queries: u32,
}

/// Counts every native lock and channel operation, and replays scripted events.
#[derive(Default)]
pub struct MockDriver {
    state: Mutex<MockState>,
    signal: Condvar,
}

impl MockDriver {
    /// A driver reporting `tablets` pen tablets.
    pub fn with_tablets(tablets: usize) -> Arc<Self> {
        let driver = Self::default();
        driver.state().tablets = (0..tablets).map(tablet).collect();
        Arc::new(driver)
    }
    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
    /// Queue `events` on `comm` all at once, so the worker sees them back to back.
    pub fn script(&self, comm: CommHandle, events: impl IntoIterator<Item = RawEvent>) {
        self.state().events.entry(comm).or_default().extend(events);
        self.signal.notify_all();
    }
    pub fn acquired(&self, lock: LockToken) -> u32 {
        self.state().acquired.get(&lock).copied().unwrap_or(0)
    }
    pub fn released(&self, lock: LockToken) -> u32 {
        self.state().released.get(&lock).copied().unwrap_or(0)
    }
    pub fn closed(&self, comm: CommHandle) -> u32 {
        self.state().closed.get(&comm).copied().unwrap_or(0)
    }
    /// Scripted events not yet read by a worker.
    pub fn backlog(&self) -> usize {
        self.state().events.values().map(VecDeque::len).sum()
    }
    pub fn description_queries(&self) -> u32 {
        self.state().description_queries
    }
    /// Every lock acquired was released exactly once.
    pub fn locks_balanced(&self) -> bool {
        let state = self.state();
        state.acquired == state.released
    }
}

fn tablet(index: usize) -> TabletInfo {
    TabletInfo {
        index,
        id: 100 + u32::try_from(index).unwrap(),
        name: format!("Mock Tablet {index}"),
        plug_and_play_id: format!("MOCK{index:04}"),
        kind: DeviceKind::Pen,
        max_contacts: 1,
        lock: LockToken(9000 + index as u64),
    }
}

fn property(kind: PropertyKind) -> PacketProperty {
    PacketProperty {
        kind,
        min: 0,
        max: 0xFFFF,
        resolution: 1.0,
    }
}

impl Driver for MockDriver {
    fn enumerate_tablets(&self) -> Result<Vec<TabletInfo>, DriverError> {
        Ok(self.state().tablets.clone())
    }
    fn tablet_info(&self, index: usize) -> Result<TabletInfo, DriverError> {
        self.state()
            .tablets
            .get(index)
            .cloned()
            .ok_or(DriverError::InvalidArgument)
    }
    fn create_context(&self, _: TargetId, tablet: usize) -> Result<NativeContext, DriverError> {
        let mut state = self.state();
        if tablet >= state.tablets.len() {
            return Err(DriverError::InvalidArgument);
        }
        state.next_handle += 1;
        let comm = CommHandle(state.next_handle);
        state.open.insert(comm);
        Ok(NativeContext {
            id: u32::try_from(comm.0).unwrap(),
            comm,
            lock: LockToken(comm.0 as u64),
        })
    }
    fn close_context(&self, comm: CommHandle) -> Result<(), DriverError> {
        let mut state = self.state();
        *state.closed.entry(comm).or_default() += 1;
        if state.open.remove(&comm) {
            Ok(())
        } else {
            Err(DriverError::InvalidArgument)
        }
    }
    fn packet_description(&self, _: CommHandle) -> Result<PacketDescription, DriverError> {
        self.state().description_queries += 1;
        Ok(PacketDescription {
            properties: [
                property(PropertyKind::X),
                property(PropertyKind::Y),
                property(PropertyKind::PacketStatus),
            ]
            .into_iter()
            .collect(),
            buttons: 0,
        })
    }
    fn acquire_lock(&self, token: LockToken) -> Result<(), DriverError> {
        *self.state().acquired.entry(token).or_default() += 1;
        Ok(())
    }
    fn release_lock(&self, token: LockToken) -> Result<(), DriverError> {
        *self.state().released.entry(token).or_default() += 1;
        Ok(())
    }
    fn refresh_cursors(&self, _: usize) -> Result<Vec<CursorInfo>, DriverError> {
        Ok(vec![
            CursorInfo {
                id: 1,
                name: "Pen".into(),
                inverted: false,
            },
            CursorInfo {
                id: 2,
                name: "Eraser".into(),
                inverted: true,
            },
        ])
    }
    fn updated_geometry(&self, _: usize) -> Result<Geometry, DriverError> {
        Ok(Geometry {
            tablet: Size {
                width: 15200,
                height: 9500,
            },
            display: Size {
                width: 1920,
                height: 1080,
            },
        })
    }
    fn create_wake_event(&self) -> Result<WakeEvent, DriverError> {
        let mut state = self.state();
        state.next_wake += 1;
        Ok(WakeEvent(state.next_wake))
    }
    fn destroy_wake_event(&self, wake: WakeEvent) {
        self.state().raised.remove(&wake);
    }
    fn raise_wake_event(&self, wake: WakeEvent) {
        self.state().raised.insert(wake);
        self.signal.notify_all();
    }
    fn wait_for_event(
        &self,
        handles: &[CommHandle],
        wake: WakeEvent,
        timeout: Duration,
    ) -> Result<WaitOutcome, DriverError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state();
        loop {
            if state.raised.remove(&wake) {
                return Ok(WaitOutcome::Woken);
            }
            for (index, handle) in handles.iter().enumerate() {
                if let Some(event) = state.events.get_mut(handle).and_then(VecDeque::pop_front) {
                    return Ok(WaitOutcome::Event { index, event });
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(WaitOutcome::Timeout);
            }
            state = self
                .signal
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

/// Native-endian packet buffer for `packets` of `[x, y, status]`.
pub fn packet_bytes(packets: &[[i32; 3]]) -> Vec<u8> {
    packets
        .iter()
        .flatten()
        .flat_map(|word| word.to_ne_bytes())
        .collect()
}

pub fn event(kind: EventKind, pointer_id: u32, timestamp: i32, packets: &[[i32; 3]]) -> RawEvent {
    RawEvent {
        kind,
        pointer_id,
        timestamp: Tick(timestamp),
        packet_count: u32::try_from(packets.len()).unwrap(),
        bytes_per_packet: if packets.is_empty() { 0 } else { 12 },
        buffer: packet_bytes(packets),
    }
}

/// Poll `condition` until it holds, or panic after `timeout`.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met within {timeout:?}");
        std::thread::sleep(Duration::from_millis(2));
    }
}

/// Sink that keeps everything it's given.
#[derive(Clone, Default)]
pub struct Recorder(Arc<Mutex<Vec<PenEvent>>>);
impl Recorder {
    pub fn sink(&self) -> Arc<dyn EventSink> {
        let recorder = self.clone();
        Arc::new(move |event: PenEvent| recorder.events().push(event))
    }
    fn events(&self) -> MutexGuard<'_, Vec<PenEvent>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
    pub fn len(&self) -> usize {
        self.events().len()
    }
    pub fn take(&self) -> Vec<PenEvent> {
        std::mem::take(&mut *self.events())
    }
    /// `(kind, pointer, timestamp)` of everything so far, without consuming it.
    pub fn summary(&self) -> Vec<(PenEventKind, u32, i32)> {
        self.events()
            .iter()
            .map(|event| (event.kind, event.pointer_id, event.timestamp.get()))
            .collect()
    }
}
