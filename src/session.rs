//! Session engine: a single-threaded cooperative event loop that owns the
//! record store, the session clock, and the RACP controller, and republishes
//! an immutable snapshot after every mutation.
//!
//! The engine is one spawned task. Consumers talk to it through a
//! [`SessionHandle`]: commands travel over an mpsc channel and are answered
//! synchronously with a oneshot; state travels back as [`SessionSnapshot`]
//! values on a watch channel, so a late subscriber starts from the current
//! state.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot, watch};

use crate::clock::SessionClock;
use crate::controller::{Action, RacpController};
use crate::error::{SessionError, TransportError};
use crate::gatt::{GattTransport, SubscribeMode};
use crate::models::{ConnectionEvent, Record, RequestStatus, RetrievalRequest, SessionSnapshot};
use crate::profile::ProfileDescriptor;
use crate::storage::RecordStore;
use crate::wire::measurement::decode_measurements;
use crate::wire::ops::{self, SocpResult};
use crate::wire::racp;

/// Engine tunables. The defaults match the minimal design: no write timeout,
/// battery tracking on when the profile exposes the channel.
#[derive(Clone, Debug, Default)]
pub struct SessionConfig {
    /// Fail a pending retrieval with [`RequestStatus::Failed`] when the
    /// control-point response does not arrive in time. `None` waits
    /// indefinitely.
    pub racp_timeout: Option<Duration>,
    /// Skip the battery channel even when the profile has one.
    pub skip_battery: bool,
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

enum Command {
    Submit(RetrievalRequest, oneshot::Sender<Result<(), SessionError>>),
    Abort(oneshot::Sender<Result<(), SessionError>>),
    StartSession(oneshot::Sender<Result<(), SessionError>>),
    StopSession(oneshot::Sender<Result<(), SessionError>>),
}

/// Consumer-facing handle to a running session engine.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    /// Submit a retrieval request. Rejected with
    /// [`SessionError::OperationInProgress`] while another retrieval is
    /// pending; the outcome itself arrives through the snapshot stream.
    pub async fn submit(&self, request: RetrievalRequest) -> Result<(), SessionError> {
        self.round_trip(|reply| Command::Submit(request, reply)).await
    }

    /// Abort the pending retrieval. A no-op when nothing is pending.
    pub async fn abort(&self) -> Result<(), SessionError> {
        self.round_trip(Command::Abort).await
    }

    /// Ask the peripheral to start a new sensor session.
    pub async fn start_session(&self) -> Result<(), SessionError> {
        self.round_trip(Command::StartSession).await
    }

    /// Ask the peripheral to stop the running sensor session.
    pub async fn stop_session(&self) -> Result<(), SessionError> {
        self.round_trip(Command::StopSession).await
    }

    /// The snapshot stream: current value plus every subsequent change.
    pub fn snapshots(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    pub fn current_status(&self) -> RequestStatus {
        self.snapshots.borrow().request_status
    }

    async fn round_trip(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<(), SessionError>>) -> Command,
    ) -> Result<(), SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(make(reply_tx))
            .await
            .map_err(|_| SessionError::Closed)?;
        reply_rx.await.map_err(|_| SessionError::Closed)?
    }
}

/// Connect the engine to one peripheral through `transport` and spawn its
/// event loop.
///
/// Discovery failures and rejected reads of required channels fail the
/// connect; optional channels (battery) degrade gracefully. The session clock
/// is established here when the status read reports an already-running
/// session.
pub async fn connect(
    transport: Arc<dyn GattTransport>,
    profile: ProfileDescriptor,
    config: SessionConfig,
) -> Result<SessionHandle, SessionError> {
    transport.discover(&profile.required_channels()).await?;

    let events = transport.connection_events().await?;
    let measurements = transport
        .subscribe(profile.measurement, SubscribeMode::Notify)
        .await?;

    // The feature read decides whether every payload carries an E2E-CRC.
    let e2e = match ops::decode_feature(&transport.read(profile.feature).await?) {
        Ok(features) => {
            debug!(
                "sensor features 0x{:06x}, e2e crc: {}",
                features.features,
                features.e2e_crc_supported()
            );
            features.e2e_crc_supported()
        }
        Err(err) => {
            warn!("feature read undecodable, assuming no e2e crc: {err}");
            false
        }
    };

    let mut clock = SessionClock::new();
    match ops::decode_status(&transport.read(profile.status).await?, e2e) {
        Ok(status) if status.session_running() => {
            clock.establish(i32::from(status.time_offset), now_unix());
            info!(
                "session already running, {} minutes in",
                status.time_offset
            );
        }
        Ok(_) => debug!("no sensor session running at connect"),
        Err(err) => warn!("status read undecodable: {err}"),
    }

    let mut battery = None;
    let battery_rx = match profile.battery.filter(|_| !config.skip_battery) {
        Some(channel) => {
            if let Ok(payload) = transport.read(channel).await {
                match ops::decode_battery_level(&payload) {
                    Ok(level) => battery = Some(level),
                    Err(err) => warn!("battery read undecodable: {err}"),
                }
            }
            match transport.subscribe(channel, SubscribeMode::Notify).await {
                Ok(rx) => rx,
                Err(err) => {
                    debug!("battery notifications unavailable: {err}");
                    closed_receiver()
                }
            }
        }
        None => closed_receiver(),
    };

    let (commands_tx, commands_rx) = mpsc::channel(16);
    let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot {
        records: Vec::new(),
        battery_percent: battery,
        request_status: RequestStatus::Idle,
    });

    info!("session engine connected ({} profile)", profile.name);
    let engine = Engine {
        transport,
        profile,
        config,
        store: RecordStore::new(),
        clock,
        controller: RacpController::new(e2e),
        e2e,
        battery,
        snapshot_tx,
    };
    tokio::spawn(engine.run(measurements, battery_rx, events, commands_rx));

    Ok(SessionHandle {
        commands: commands_tx,
        snapshots: snapshot_rx,
    })
}

fn closed_receiver() -> mpsc::Receiver<Vec<u8>> {
    let (_tx, rx) = mpsc::channel(1);
    rx
}

#[derive(Clone, Copy, Debug)]
enum ControlChannel {
    Racp,
    Ops,
}

type ControlOutcome = (ControlChannel, Result<Vec<u8>, TransportError>);
type Inflight = FuturesUnordered<BoxFuture<'static, ControlOutcome>>;

struct Engine {
    transport: Arc<dyn GattTransport>,
    profile: ProfileDescriptor,
    config: SessionConfig,
    store: RecordStore,
    clock: SessionClock,
    controller: RacpController,
    e2e: bool,
    battery: Option<u8>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
}

impl Engine {
    async fn run(
        mut self,
        mut measurements: mpsc::Receiver<Vec<u8>>,
        mut battery_rx: mpsc::Receiver<Vec<u8>>,
        mut events: mpsc::Receiver<ConnectionEvent>,
        mut commands: mpsc::Receiver<Command>,
    ) {
        let mut inflight: Inflight = FuturesUnordered::new();
        loop {
            tokio::select! {
                // Measurements drain ahead of control-point completions so a
                // final response never classifies before records the
                // peripheral delivered ahead of it.
                biased;

                Some(payload) = measurements.recv() => {
                    self.on_measurement(&payload);
                }
                Some(payload) = battery_rx.recv() => {
                    self.on_battery(&payload);
                }
                Some(event) = events.recv() => {
                    self.on_connection_event(event);
                }
                Some((channel, result)) = inflight.next(), if !inflight.is_empty() => {
                    self.on_control_outcome(channel, result, &mut inflight);
                }
                command = commands.recv() => {
                    match command {
                        Some(command) => self.on_command(command, &mut inflight),
                        // Every handle is gone; stop the engine.
                        None => break,
                    }
                }
            }
        }

        // Best-effort cleanup; the peripheral may already be gone.
        let _ = self.transport.unsubscribe(self.profile.measurement).await;
        if let Some(channel) = self.profile.battery {
            let _ = self.transport.unsubscribe(channel).await;
        }
        debug!("session engine stopped");
    }

    fn on_command(&mut self, command: Command, inflight: &mut Inflight) {
        match command {
            Command::Submit(request, reply) => match self.controller.begin(request) {
                Ok(bytes) => {
                    // The cleared store and the Pending status land in the
                    // same snapshot, published before the request is written.
                    self.store.clear();
                    self.publish();
                    info!("retrieval submitted: {request:?}");
                    self.dispatch_control(ControlChannel::Racp, bytes, inflight);
                    let _ = reply.send(Ok(()));
                }
                Err(err) => {
                    let _ = reply.send(Err(err));
                }
            },
            Command::Abort(reply) => {
                if let Some(bytes) = self.controller.abort() {
                    info!("aborting pending retrieval");
                    self.dispatch_control(ControlChannel::Racp, bytes, inflight);
                }
                let _ = reply.send(Ok(()));
            }
            Command::StartSession(reply) => {
                let _ = reply.send(self.dispatch_ops(ops::start_session(self.e2e), inflight));
            }
            Command::StopSession(reply) => {
                let _ = reply.send(self.dispatch_ops(ops::stop_session(self.e2e), inflight));
            }
        }
    }

    fn dispatch_ops(&self, bytes: Vec<u8>, inflight: &mut Inflight) -> Result<(), SessionError> {
        if self.profile.specific_ops.is_none() {
            return Err(SessionError::SessionControlUnavailable);
        }
        self.dispatch_control(ControlChannel::Ops, bytes, inflight);
        Ok(())
    }

    fn dispatch_control(&self, channel: ControlChannel, bytes: Vec<u8>, inflight: &mut Inflight) {
        let uuid = match channel {
            ControlChannel::Racp => self.profile.racp,
            // Guarded by dispatch_ops.
            ControlChannel::Ops => self.profile.specific_ops.unwrap_or(self.profile.racp),
        };
        let transport = Arc::clone(&self.transport);
        let timeout = self.config.racp_timeout;
        inflight.push(Box::pin(async move {
            let result = match timeout {
                Some(limit) => match tokio::time::timeout(limit, transport.write(uuid, bytes)).await
                {
                    Ok(result) => result,
                    Err(_) => Err(TransportError::Timeout),
                },
                None => transport.write(uuid, bytes).await,
            };
            (channel, result)
        }));
    }

    fn on_measurement(&mut self, payload: &[u8]) {
        let items = match decode_measurements(payload, self.e2e) {
            Ok(items) => items,
            Err(err) => {
                warn!("dropping measurement notification: {err}");
                return;
            }
        };
        for item in items {
            let offset = i32::from(item.time_offset);
            // Live data anchors an unset clock; historical delivery must not,
            // because its offsets are arbitrarily old.
            if !self.controller.is_pending() && !self.clock.is_established() {
                self.clock.establish(offset, now_unix());
                info!("session clock established at offset {offset} min");
            }
            match self.clock.resolve(offset) {
                Ok(timestamp_unix) => self.store.upsert(Record {
                    sequence_number: item.time_offset,
                    concentration_mg_dl: item.concentration_mg_dl,
                    trend_mg_dl_min: item.trend_mg_dl_min,
                    quality_percent: item.quality_percent,
                    offset_minutes: offset,
                    timestamp_unix,
                }),
                Err(_) => {
                    warn!("dropping record at offset {offset}: session clock not established");
                }
            }
        }
        self.publish();
    }

    fn on_battery(&mut self, payload: &[u8]) {
        match ops::decode_battery_level(payload) {
            Ok(level) => {
                self.battery = Some(level);
                self.publish();
            }
            Err(err) => warn!("dropping battery notification: {err}"),
        }
    }

    fn on_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Disconnected(reason) => {
                warn!("peripheral disconnected: {reason}");
                self.controller.on_disconnect();
                self.publish();
            }
            ConnectionEvent::ServicesInvalidated => {
                // The channel handles are stale; whatever was pending cannot
                // complete on them.
                warn!("peripheral services invalidated");
                self.controller.on_disconnect();
                self.publish();
            }
            ConnectionEvent::Connecting | ConnectionEvent::Connected => {
                debug!("connection event: {event:?}");
            }
        }
    }

    fn on_control_outcome(
        &mut self,
        channel: ControlChannel,
        result: Result<Vec<u8>, TransportError>,
        inflight: &mut Inflight,
    ) {
        match channel {
            ControlChannel::Racp => self.on_racp_outcome(result, inflight),
            ControlChannel::Ops => self.on_ops_outcome(result),
        }
    }

    fn on_racp_outcome(&mut self, result: Result<Vec<u8>, TransportError>, inflight: &mut Inflight) {
        let payload = match result {
            Ok(payload) => payload,
            Err(err) => {
                warn!("control-point write failed: {err}");
                self.controller.fail();
                self.publish();
                return;
            }
        };
        let response = match racp::decode_response(&payload, self.e2e) {
            Ok(response) => response,
            Err(err) => {
                // Data loss for this response only; the retrieval stays
                // pending until another response, a timeout, or a disconnect.
                warn!("undecodable control-point response: {err}");
                return;
            }
        };
        match self.controller.on_response(&response, self.store.max_sequence()) {
            Action::Send(bytes) => self.dispatch_control(ControlChannel::Racp, bytes, inflight),
            Action::Complete(status) => {
                info!("retrieval finished: {status:?}");
                self.publish();
            }
            Action::Ignore => debug!("control-point response outside a retrieval: {response:?}"),
        }
    }

    fn on_ops_outcome(&mut self, result: Result<Vec<u8>, TransportError>) {
        let payload = match result {
            Ok(payload) => payload,
            Err(err) => {
                warn!("specific-ops write failed: {err}");
                return;
            }
        };
        match ops::decode_socp_response(&payload, self.e2e) {
            Ok(response) => self.on_socp_response(response),
            Err(err) => warn!("undecodable specific-ops response: {err}"),
        }
    }

    fn on_socp_response(&mut self, response: ops::SocpResponse) {
        match (response.request, response.result) {
            (ops::OP_START_SESSION, SocpResult::Success) => {
                self.clock.on_session_started(now_unix());
                info!("sensor session started");
            }
            (ops::OP_START_SESSION, SocpResult::ProcedureNotCompleted) => {
                // A half-started session leaves no trustworthy anchor.
                self.clock.on_session_stopped();
                warn!("session start did not complete");
            }
            (ops::OP_STOP_SESSION, SocpResult::Success) => {
                self.clock.on_session_stopped();
                info!("sensor session stopped");
            }
            (request, result) => {
                warn!("specific-ops request 0x{request:02x} answered {result:?}");
            }
        }
    }

    fn publish(&self) {
        let _ = self.snapshot_tx.send(SessionSnapshot {
            records: self.store.to_vec(),
            battery_percent: self.battery,
            request_status: self.controller.status(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatt_mock::{MockExchange, MockTransport};
    use crate::profile::CGM_PROFILE;

    fn measurement(offset: u16, raw_mg_dl: u16) -> Vec<u8> {
        let mut record = vec![0x06, 0x00];
        record.extend_from_slice(&raw_mg_dl.to_le_bytes());
        record.extend_from_slice(&offset.to_le_bytes());
        record
    }

    fn number_of_records(count: u16) -> Vec<u8> {
        let mut payload = vec![0x05, 0x00];
        payload.extend_from_slice(&count.to_le_bytes());
        payload
    }

    fn report_success() -> Vec<u8> {
        vec![0x06, 0x00, 0x01, 0x01]
    }

    fn no_records_found() -> Vec<u8> {
        vec![0x06, 0x00, 0x01, 0x06]
    }

    async fn connect_mock(mock: &Arc<MockTransport>) -> SessionHandle {
        connect(
            mock.clone() as Arc<dyn GattTransport>,
            CGM_PROFILE,
            SessionConfig::default(),
        )
        .await
        .unwrap()
    }

    async fn wait_for_status(handle: &SessionHandle, status: RequestStatus) -> SessionSnapshot {
        let mut snapshots = handle.snapshots();
        let snapshot = snapshots
            .wait_for(|snapshot| snapshot.request_status == status)
            .await
            .unwrap()
            .clone();
        snapshot
    }

    #[tokio::test]
    async fn test_connect_fails_when_required_channel_missing() {
        let mock = Arc::new(MockTransport::with_cgm_defaults());
        mock.expose_channels(&[CGM_PROFILE.measurement, CGM_PROFILE.status, CGM_PROFILE.feature]);
        let result = connect(
            mock as Arc<dyn GattTransport>,
            CGM_PROFILE,
            SessionConfig::default(),
        )
        .await;
        assert_eq!(
            result.err(),
            Some(SessionError::Transport(TransportError::ServiceUnsupported(
                CGM_PROFILE.racp
            )))
        );
    }

    #[tokio::test]
    async fn test_live_measurements_flow_into_snapshots() {
        let mock = Arc::new(MockTransport::with_cgm_defaults());
        let handle = connect_mock(&mock).await;
        let mut snapshots = handle.snapshots();

        mock.push_notification(CGM_PROFILE.measurement, measurement(1, 0x0064));
        mock.push_notification(CGM_PROFILE.measurement, measurement(2, 0x0065));
        let snapshot = snapshots
            .wait_for(|snapshot| snapshot.records.len() == 2)
            .await
            .unwrap()
            .clone();
        assert_eq!(snapshot.records[0].concentration_mg_dl, 100.0);
        assert_eq!(snapshot.battery_percent, Some(100));

        // A resend of sequence 2 overwrites, never duplicates.
        mock.push_notification(CGM_PROFILE.measurement, measurement(2, 0x0070));
        let snapshot = snapshots
            .wait_for(|snapshot| {
                snapshot.records.len() == 2 && snapshot.records[1].concentration_mg_dl == 112.0
            })
            .await
            .unwrap()
            .clone();
        assert_eq!(snapshot.records[1].sequence_number, 2);
    }

    #[tokio::test]
    async fn test_submit_publishes_cleared_store_before_any_response() {
        let mock = Arc::new(MockTransport::with_cgm_defaults());
        let handle = connect_mock(&mock).await;
        let mut snapshots = handle.snapshots();

        // Live records 1..=3 are on screen when the retrieval starts.
        for seq in 1..=3u16 {
            mock.push_notification(CGM_PROFILE.measurement, measurement(seq, 0x0064));
        }
        snapshots
            .wait_for(|snapshot| snapshot.records.len() == 3)
            .await
            .unwrap();

        // The count request never completes, freezing the engine mid-retrieval.
        mock.script_exchange(MockExchange::hang());
        handle.submit(RetrievalRequest::All).await.unwrap();

        let snapshot = wait_for_status(&handle, RequestStatus::Pending).await;
        assert!(snapshot.records.is_empty());
    }

    #[tokio::test]
    async fn test_submit_while_pending_is_rejected() {
        let mock = Arc::new(MockTransport::with_cgm_defaults());
        let handle = connect_mock(&mock).await;

        mock.script_exchange(MockExchange::hang());
        handle.submit(RetrievalRequest::All).await.unwrap();
        wait_for_status(&handle, RequestStatus::Pending).await;

        assert_eq!(
            handle.submit(RetrievalRequest::Last).await,
            Err(SessionError::OperationInProgress)
        );
        assert_eq!(handle.current_status(), RequestStatus::Pending);
        // Exactly one write went out: the first retrieval's count request.
        assert_eq!(mock.writes().len(), 1);
    }

    #[tokio::test]
    async fn test_paging_scenario_resumes_from_next_unseen_sequence() {
        let mock = Arc::new(MockTransport::with_cgm_defaults());
        let handle = connect_mock(&mock).await;

        // Count says five records, but the first page delivers only 1..=3.
        mock.script_exchange(MockExchange::respond(number_of_records(5)));
        mock.script_exchange(MockExchange::deliver_then_respond(
            vec![
                (CGM_PROFILE.measurement, measurement(1, 0x0064)),
                (CGM_PROFILE.measurement, measurement(2, 0x0065)),
                (CGM_PROFILE.measurement, measurement(3, 0x0066)),
            ],
            report_success(),
        ));
        mock.script_exchange(MockExchange::respond(no_records_found()));

        handle.submit(RetrievalRequest::All).await.unwrap();
        let snapshot = wait_for_status(&handle, RequestStatus::Success).await;

        let sequences: Vec<u16> = snapshot
            .records
            .iter()
            .map(|record| record.sequence_number)
            .collect();
        assert_eq!(sequences, vec![1, 2, 3]);

        let writes = mock.writes();
        let payloads: Vec<&[u8]> = writes.iter().map(|(_, payload)| payload.as_slice()).collect();
        assert_eq!(
            payloads,
            vec![
                &[0x04, 0x01][..],             // report number of all records
                &[0x01, 0x01][..],             // report all records
                &[0x01, 0x03, 0x01, 0x04, 0x00][..], // resume at sequence 4
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_peripheral_reports_success_with_empty_store() {
        let mock = Arc::new(MockTransport::with_cgm_defaults());
        let handle = connect_mock(&mock).await;
        let mut snapshots = handle.snapshots();

        mock.push_notification(CGM_PROFILE.measurement, measurement(9, 0x0064));
        snapshots
            .wait_for(|snapshot| snapshot.records.len() == 1)
            .await
            .unwrap();

        mock.script_exchange(MockExchange::respond(number_of_records(0)));
        handle.submit(RetrievalRequest::All).await.unwrap();

        let snapshot = wait_for_status(&handle, RequestStatus::Success).await;
        assert!(snapshot.records.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_while_pending_keeps_partial_records() {
        let mock = Arc::new(MockTransport::with_cgm_defaults());
        let handle = connect_mock(&mock).await;

        mock.script_exchange(MockExchange::respond(number_of_records(5)));
        // The report page delivers two records and then stalls forever.
        mock.script_exchange(MockExchange {
            notify_before_response: vec![
                (CGM_PROFILE.measurement, measurement(1, 0x0064)),
                (CGM_PROFILE.measurement, measurement(2, 0x0065)),
            ],
            response: Ok(Vec::new()),
            hang: true,
        });

        handle.submit(RetrievalRequest::All).await.unwrap();
        let mut snapshots = handle.snapshots();
        snapshots
            .wait_for(|snapshot| snapshot.records.len() == 2)
            .await
            .unwrap();

        mock.emit(ConnectionEvent::Disconnected("link lost".to_string()));
        let snapshot = wait_for_status(&handle, RequestStatus::Idle).await;
        assert_eq!(snapshot.records.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails_the_pending_retrieval() {
        let mock = Arc::new(MockTransport::with_cgm_defaults());
        mock.script_exchange(MockExchange::hang());
        let handle = connect(
            mock.clone() as Arc<dyn GattTransport>,
            CGM_PROFILE,
            SessionConfig {
                racp_timeout: Some(Duration::from_secs(5)),
                ..SessionConfig::default()
            },
        )
        .await
        .unwrap();

        handle.submit(RetrievalRequest::All).await.unwrap();
        let snapshot = wait_for_status(&handle, RequestStatus::Failed).await;
        assert!(snapshot.records.is_empty());

        // The controller is usable again after the failure.
        mock.script_exchange(MockExchange::respond(number_of_records(0)));
        handle.submit(RetrievalRequest::All).await.unwrap();
        wait_for_status(&handle, RequestStatus::Success).await;
    }

    #[tokio::test]
    async fn test_rejected_write_fails_the_retrieval() {
        let mock = Arc::new(MockTransport::with_cgm_defaults());
        let handle = connect_mock(&mock).await;

        mock.script_exchange(MockExchange::fail(TransportError::NotConnected));
        handle.submit(RetrievalRequest::All).await.unwrap();
        wait_for_status(&handle, RequestStatus::Failed).await;
    }

    #[tokio::test]
    async fn test_abort_completes_with_aborted_status() {
        let mock = Arc::new(MockTransport::with_cgm_defaults());
        let handle = connect_mock(&mock).await;

        mock.script_exchange(MockExchange::hang());
        // The abort write is answered with an abort-success response code.
        mock.script_exchange(MockExchange::respond(vec![0x06, 0x00, 0x03, 0x01]));

        handle.submit(RetrievalRequest::All).await.unwrap();
        wait_for_status(&handle, RequestStatus::Pending).await;
        handle.abort().await.unwrap();

        wait_for_status(&handle, RequestStatus::Aborted).await;
    }

    #[tokio::test]
    async fn test_unsupported_op_code_surfaces_as_not_supported() {
        let mock = Arc::new(MockTransport::with_cgm_defaults());
        let handle = connect_mock(&mock).await;

        mock.script_exchange(MockExchange::respond(vec![0x06, 0x00, 0x04, 0x02]));
        handle.submit(RetrievalRequest::All).await.unwrap();
        wait_for_status(&handle, RequestStatus::NotSupported).await;
    }

    #[tokio::test]
    async fn test_first_record_retrieval() {
        let mock = Arc::new(MockTransport::with_cgm_defaults());
        let handle = connect_mock(&mock).await;

        mock.script_exchange(MockExchange::deliver_then_respond(
            vec![(CGM_PROFILE.measurement, measurement(1, 0x0064))],
            report_success(),
        ));
        handle.submit(RetrievalRequest::First).await.unwrap();

        let snapshot = wait_for_status(&handle, RequestStatus::Success).await;
        assert_eq!(snapshot.records.len(), 1);
        assert_eq!(mock.writes().len(), 1);
        assert_eq!(mock.writes()[0].1, vec![0x01, 0x05]);
    }

    #[tokio::test]
    async fn test_battery_notification_updates_snapshot() {
        let mock = Arc::new(MockTransport::with_cgm_defaults());
        let handle = connect_mock(&mock).await;
        let mut snapshots = handle.snapshots();
        assert_eq!(snapshots.borrow().battery_percent, Some(100));

        mock.push_notification(CGM_PROFILE.battery.unwrap(), vec![87]);
        snapshots
            .wait_for(|snapshot| snapshot.battery_percent == Some(87))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_clock_from_status_read_anchors_historical_records() {
        let mock = Arc::new(MockTransport::with_cgm_defaults());
        // The peripheral reports a session already 10 minutes in.
        let mut status = Vec::new();
        status.extend_from_slice(&10u16.to_le_bytes());
        status.extend_from_slice(&[0x00, 0x00, 0x00]);
        mock.set_read(CGM_PROFILE.status, status);

        let handle = connect_mock(&mock).await;
        let mut snapshots = handle.snapshots();
        let connect_time = now_unix();

        mock.push_notification(CGM_PROFILE.measurement, measurement(12, 0x0064));
        let snapshot = snapshots
            .wait_for(|snapshot| snapshot.records.len() == 1)
            .await
            .unwrap()
            .clone();

        // start = now - 10 min, record at offset 12 min => now + 2 min.
        let expected = connect_time + 2 * 60;
        assert!((snapshot.records[0].timestamp_unix - expected).abs() <= 5);
    }

    #[tokio::test]
    async fn test_records_without_a_clock_are_dropped_during_retrieval() {
        let mock = Arc::new(MockTransport::with_cgm_defaults());
        // No session running: the clock stays unset at connect.
        mock.set_read(CGM_PROFILE.status, vec![0x00, 0x00, 0x01, 0x00, 0x00]);

        let handle = connect_mock(&mock).await;

        mock.script_exchange(MockExchange::respond(number_of_records(2)));
        mock.script_exchange(MockExchange::deliver_then_respond(
            vec![(CGM_PROFILE.measurement, measurement(3, 0x0064))],
            report_success(),
        ));

        handle.submit(RetrievalRequest::All).await.unwrap();
        let snapshot = wait_for_status(&handle, RequestStatus::Success).await;
        // The historical record could not be resolved and was not stored.
        assert!(snapshot.records.is_empty());
    }

    #[tokio::test]
    async fn test_session_stop_clears_the_clock() {
        let mock = Arc::new(MockTransport::with_cgm_defaults());
        // A session already 10 minutes in anchors the clock in the past.
        let mut status = Vec::new();
        status.extend_from_slice(&10u16.to_le_bytes());
        status.extend_from_slice(&[0x00, 0x00, 0x00]);
        mock.set_read(CGM_PROFILE.status, status);

        let handle = connect_mock(&mock).await;
        let mut snapshots = handle.snapshots();

        // Stop the running session, then stream a live record: the clock must
        // re-anchor from that record rather than the stale session start.
        mock.script_exchange(MockExchange::respond(vec![0x1C, 0x1B, 0x01]));
        handle.stop_session().await.unwrap();
        // A no-op command round trip; the loop polls in-flight writes ahead
        // of commands, so the stop response has been applied once it returns.
        handle.abort().await.unwrap();

        mock.push_notification(CGM_PROFILE.measurement, measurement(0, 0x0064));
        let snapshot = snapshots
            .wait_for(|snapshot| snapshot.records.len() == 1)
            .await
            .unwrap()
            .clone();
        // Re-anchored: offset 0 resolves to roughly now, not now - 10 min.
        assert!((snapshot.records[0].timestamp_unix - now_unix()).abs() <= 5);
    }
}
