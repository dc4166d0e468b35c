//! Resource access serializer
//!
//! Owns one PLC driver handle and runs every call against it on a single
//! dedicated thread, one work item at a time, in submission order. Callers
//! enqueue a [`WorkItem`] carrying a oneshot reply slot and await the answer
//! under a bounded timeout.
//!
//! # Lifecycle
//!
//! ```text
//! spawn ──► [worker thread: create driver] ──► loop { recv item ──► execute } ──► close driver
//!                                                     ▲
//!                                          shutdown: cancel + wake
//! ```
//!
//! On shutdown the item currently executing completes; items still queued are
//! dropped, which resolves their callers with [`DeviceError::WorkerStopped`].

use super::driver::{DriverFactory, PlcDriver, STATUS_OK};
use super::{ConnectionState, DeviceError, Operation, StationId};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Serializer settings
#[derive(Clone, Debug)]
pub struct SerializerSettings {
    /// Upper bound a caller waits for its reply, queueing time included.
    pub operation_timeout: Duration,
}

impl Default for SerializerSettings {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(5),
        }
    }
}

/// A queued hardware operation and its single-use reply slot.
#[derive(Debug)]
enum WorkItem {
    Connect {
        response_tx: oneshot::Sender<bool>,
    },
    Disconnect {
        response_tx: oneshot::Sender<()>,
    },
    ReadBlock {
        address: String,
        count: usize,
        response_tx: oneshot::Sender<Result<Vec<i16>, DeviceError>>,
    },
    WriteBlock {
        address: String,
        values: Vec<i16>,
        response_tx: oneshot::Sender<Result<(), DeviceError>>,
    },
    Stop,
}

macro_rules! reply {
    ($response_tx:expr, $value:expr, $station:expr) => {
        if $response_tx.send($value).is_err() {
            debug!("Station {}: caller gave up before the reply", $station);
        }
    };
}

/// State living on the worker thread.
struct StationWorker {
    station: StationId,
    driver: Box<dyn PlcDriver>,
    connected: bool,
    state_tx: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
}

impl StationWorker {
    fn run(mut self, mut work_rx: mpsc::UnboundedReceiver<WorkItem>) {
        info!("Station {}: worker started", self.station);

        while let Some(item) = work_rx.blocking_recv() {
            if self.cancel.is_cancelled() {
                debug!("Station {}: dropping work item after cancellation", self.station);
                break;
            }
            if matches!(item, WorkItem::Stop) {
                break;
            }
            self.execute(item);
        }

        work_rx.close();
        let mut abandoned = 0usize;
        while work_rx.try_recv().is_ok() {
            abandoned += 1;
        }
        if abandoned > 0 {
            warn!(
                "Station {}: abandoned {} queued work items on shutdown",
                self.station, abandoned
            );
        }

        self.release();
        info!("Station {}: worker finished", self.station);
    }

    fn execute(&mut self, item: WorkItem) {
        match item {
            WorkItem::Connect { response_tx } => {
                let connected = self.connect();
                reply!(response_tx, connected, self.station);
            }
            WorkItem::Disconnect { response_tx } => {
                self.disconnect();
                reply!(response_tx, (), self.station);
            }
            WorkItem::ReadBlock {
                address,
                count,
                response_tx,
            } => {
                let result = self.read_block(&address, count);
                reply!(response_tx, result, self.station);
            }
            WorkItem::WriteBlock {
                address,
                values,
                response_tx,
            } => {
                let result = self.write_block(&address, &values);
                reply!(response_tx, result, self.station);
            }
            WorkItem::Stop => {}
        }
    }

    fn connect(&mut self) -> bool {
        if self.connected {
            return true;
        }
        self.state_tx.send_replace(ConnectionState::Connecting);
        let code = self.driver.open(self.station);
        self.connected = code == STATUS_OK;
        if self.connected {
            info!("Station {}: connected", self.station);
            self.state_tx.send_replace(ConnectionState::Connected);
        } else {
            warn!("Station {}: open failed with code 0x{:X}", self.station, code);
            self.state_tx.send_replace(ConnectionState::Disconnected);
        }
        self.connected
    }

    fn disconnect(&mut self) {
        if !self.connected {
            return;
        }
        let code = self.driver.close();
        if code != STATUS_OK {
            warn!("Station {}: close returned code 0x{:X}", self.station, code);
        }
        self.connected = false;
        self.state_tx.send_replace(ConnectionState::Disconnected);
        info!("Station {}: disconnected", self.station);
    }

    fn read_block(&mut self, address: &str, count: usize) -> Result<Vec<i16>, DeviceError> {
        if !self.connected {
            return Err(DeviceError::NotConnected(self.station));
        }
        self.driver
            .read_block(address, count)
            .map_err(|code| DeviceError::OperationFailed {
                station: self.station,
                code,
            })
    }

    fn write_block(&mut self, address: &str, values: &[i16]) -> Result<(), DeviceError> {
        if !self.connected {
            return Err(DeviceError::NotConnected(self.station));
        }
        match self.driver.write_block(address, values) {
            STATUS_OK => Ok(()),
            code => Err(DeviceError::OperationFailed {
                station: self.station,
                code,
            }),
        }
    }

    fn release(&mut self) {
        if self.connected {
            let code = self.driver.close();
            debug!("Station {}: closed on exit with code 0x{:X}", self.station, code);
            self.connected = false;
        }
        self.state_tx.send_replace(ConnectionState::Disconnected);
    }
}

/// Handle to one station's worker thread.
///
/// Every method enqueues its work item synchronously, before the returned
/// future is first polled, so the call order on one handle is the order the
/// driver observes.
pub struct Serializer {
    station: StationId,
    work_tx: mpsc::UnboundedSender<WorkItem>,
    state_rx: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    settings: SerializerSettings,
}

impl Serializer {
    /// Starts the worker thread. The driver is created on that thread.
    pub fn spawn(
        station: StationId,
        factory: Arc<dyn DriverFactory>,
        settings: SerializerSettings,
    ) -> Result<Self, DeviceError> {
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let cancel = CancellationToken::new();
        let worker_cancel = cancel.clone();

        let worker = std::thread::Builder::new()
            .name(format!("plc-station-{}", station))
            .spawn(move || {
                let worker = StationWorker {
                    station,
                    driver: factory.create(station),
                    connected: false,
                    state_tx,
                    cancel: worker_cancel,
                };
                worker.run(work_rx);
            })
            .map_err(|e| DeviceError::Spawn(e.to_string()))?;

        debug!("Station {}: serializer spawned", station);
        Ok(Self {
            station,
            work_tx,
            state_rx,
            cancel,
            worker: Mutex::new(Some(worker)),
            settings,
        })
    }

    pub fn station(&self) -> StationId {
        self.station
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Opens the link. Idempotent; a driver error yields `Ok(false)`.
    pub fn connect(&self) -> impl Future<Output = Result<bool, DeviceError>> + Send + 'static {
        let (response_tx, response_rx) = oneshot::channel();
        self.submit(Operation::Connect, WorkItem::Connect { response_tx }, response_rx)
    }

    /// Closes the link. No-op when already disconnected.
    pub fn disconnect(&self) -> impl Future<Output = Result<(), DeviceError>> + Send + 'static {
        let (response_tx, response_rx) = oneshot::channel();
        self.submit(
            Operation::Disconnect,
            WorkItem::Disconnect { response_tx },
            response_rx,
        )
    }

    pub fn read_block(
        &self,
        address: &str,
        count: usize,
    ) -> impl Future<Output = Result<Vec<i16>, DeviceError>> + Send + 'static {
        let (response_tx, response_rx) = oneshot::channel();
        let reply = self.submit(
            Operation::ReadBlock,
            WorkItem::ReadBlock {
                address: address.to_string(),
                count,
                response_tx,
            },
            response_rx,
        );
        async move { reply.await? }
    }

    pub fn write_block(
        &self,
        address: &str,
        values: Vec<i16>,
    ) -> impl Future<Output = Result<(), DeviceError>> + Send + 'static {
        let (response_tx, response_rx) = oneshot::channel();
        let reply = self.submit(
            Operation::WriteBlock,
            WorkItem::WriteBlock {
                address: address.to_string(),
                values,
                response_tx,
            },
            response_rx,
        );
        async move { reply.await? }
    }

    fn submit<T: Send + 'static>(
        &self,
        operation: Operation,
        item: WorkItem,
        response_rx: oneshot::Receiver<T>,
    ) -> impl Future<Output = Result<T, DeviceError>> + Send + 'static {
        let station = self.station;
        let timeout = self.settings.operation_timeout;
        let queued = if self.cancel.is_cancelled() {
            false
        } else {
            self.work_tx.send(item).is_ok()
        };

        async move {
            if !queued {
                return Err(DeviceError::WorkerStopped(station));
            }
            match tokio::time::timeout(timeout, response_rx).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(_)) => Err(DeviceError::WorkerStopped(station)),
                Err(_) => {
                    warn!("Station {}: {} exceeded {:?}", station, operation, timeout);
                    Err(DeviceError::Timeout { station, operation })
                }
            }
        }
    }

    /// Stops the worker after its current item and waits for the thread.
    pub async fn shutdown(&self) -> Result<(), DeviceError> {
        info!("Station {}: shutting down serializer", self.station);
        self.cancel.cancel();
        let _ = self.work_tx.send(WorkItem::Stop);

        let handle = match self.worker.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(handle) = handle else {
            debug!("Station {}: serializer already shut down", self.station);
            return Ok(());
        };

        match tokio::task::spawn_blocking(move || handle.join()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => {
                error!("Station {}: worker thread panicked", self.station);
                Err(DeviceError::WorkerStopped(self.station))
            }
            Err(e) => {
                error!("Station {}: failed to join worker: {}", self.station, e);
                Err(DeviceError::WorkerStopped(self.station))
            }
        }
    }
}

impl Drop for Serializer {
    fn drop(&mut self) {
        self.cancel.cancel();
        let _ = self.work_tx.send(WorkItem::Stop);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::driver::testing::{CallLog, RecordingPlc};
    use crate::device::driver::{SimulatedPlcFactory, STATUS_BAD_DEVICE};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingFactory {
        log: CallLog,
        overlaps: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
        read_delay: Duration,
        read_code: i32,
    }

    impl RecordingFactory {
        fn new(log: CallLog) -> Self {
            Self {
                log,
                overlaps: Default::default(),
                closes: Default::default(),
                read_delay: Duration::ZERO,
                read_code: STATUS_OK,
            }
        }
    }

    impl DriverFactory for RecordingFactory {
        fn create(&self, _station: StationId) -> Box<dyn PlcDriver> {
            let mut plc = RecordingPlc::new(self.log.clone());
            plc.overlaps = self.overlaps.clone();
            plc.closes = self.closes.clone();
            plc.read_delay = self.read_delay;
            plc.read_code = self.read_code;
            Box::new(plc)
        }
    }

    fn spawn_recording(factory: RecordingFactory, timeout: Duration) -> Serializer {
        Serializer::spawn(
            StationId(1),
            Arc::new(factory),
            SerializerSettings {
                operation_timeout: timeout,
            },
        )
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn driver_sees_operations_in_submission_order() {
        let log = CallLog::default();
        let factory = RecordingFactory::new(log.clone());
        let overlaps = factory.overlaps.clone();
        let serializer = spawn_recording(factory, Duration::from_secs(5));
        assert!(serializer.connect().await.unwrap());

        let mut tasks = Vec::new();
        for i in 0..50i16 {
            let pending = if i % 2 == 0 {
                let fut = serializer.write_block(&format!("D{}", i), vec![i]);
                tokio::spawn(async move { fut.await.map(|_| ()) })
            } else {
                let fut = serializer.read_block(&format!("D{}", i), 1);
                tokio::spawn(async move { fut.await.map(|_| ()) })
            };
            tasks.push(pending);
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let expected: Vec<String> = std::iter::once("open:1".to_string())
            .chain((0..50i16).map(|i| {
                if i % 2 == 0 {
                    format!("write:D{}:[{}]", i, i)
                } else {
                    format!("read:D{}:1", i)
                }
            }))
            .collect();
        assert_eq!(log.calls(), expected);
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let log = CallLog::default();
        let serializer = spawn_recording(RecordingFactory::new(log.clone()), Duration::from_secs(5));
        assert_eq!(serializer.state(), ConnectionState::Disconnected);
        assert!(serializer.connect().await.unwrap());
        assert!(serializer.connect().await.unwrap());
        assert_eq!(serializer.state(), ConnectionState::Connected);
        assert_eq!(log.calls(), vec!["open:1".to_string()]);
    }

    #[tokio::test]
    async fn failed_open_returns_false() {
        let factory = SimulatedPlcFactory::new().with_unreachable(StationId(4));
        let serializer =
            Serializer::spawn(StationId(4), Arc::new(factory), SerializerSettings::default())
                .unwrap();
        assert!(!serializer.connect().await.unwrap());
        assert_eq!(serializer.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn disconnect_when_disconnected_is_a_noop() {
        let log = CallLog::default();
        let serializer = spawn_recording(RecordingFactory::new(log.clone()), Duration::from_secs(5));
        serializer.disconnect().await.unwrap();
        assert!(log.calls().is_empty());
        assert_eq!(
            serializer.read_block("D0", 1).await,
            Err(DeviceError::NotConnected(StationId(1)))
        );
    }

    #[tokio::test]
    async fn driver_error_surfaces_raw_code() {
        let mut factory = RecordingFactory::new(CallLog::default());
        factory.read_code = STATUS_BAD_DEVICE;
        let serializer = spawn_recording(factory, Duration::from_secs(5));
        serializer.connect().await.unwrap();
        let err = serializer.read_block("D0", 1).await.unwrap_err();
        assert_eq!(err.driver_code(), Some(STATUS_BAD_DEVICE));
    }

    #[tokio::test]
    async fn stalled_call_times_out() {
        let mut factory = RecordingFactory::new(CallLog::default());
        factory.read_delay = Duration::from_millis(400);
        let serializer = spawn_recording(factory, Duration::from_millis(50));
        serializer.connect().await.unwrap();
        let err = serializer.read_block("D0", 1).await.unwrap_err();
        assert_eq!(
            err,
            DeviceError::Timeout {
                station: StationId(1),
                operation: Operation::ReadBlock
            }
        );
    }

    #[tokio::test]
    async fn shutdown_finishes_in_flight_item_and_closes_once() {
        let log = CallLog::default();
        let mut factory = RecordingFactory::new(log.clone());
        factory.read_delay = Duration::from_millis(100);
        let closes = factory.closes.clone();
        let serializer = spawn_recording(factory, Duration::from_secs(5));
        serializer.connect().await.unwrap();

        let in_flight = tokio::spawn(serializer.read_block("D0", 1));
        tokio::time::sleep(Duration::from_millis(20)).await;
        serializer.shutdown().await.unwrap();

        assert_eq!(in_flight.await.unwrap(), Ok(vec![7]));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(serializer.state(), ConnectionState::Disconnected);
        assert_eq!(
            serializer.write_block("D0", vec![1]).await,
            Err(DeviceError::WorkerStopped(StationId(1)))
        );
        serializer.shutdown().await.unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
