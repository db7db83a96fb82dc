//! Async driver for the admin state machine.
//!
//! Owns the admin fiber, translates between wire messages and
//! [`AdminSession`] actions, runs the keep-alive timer, and (on the
//! server) executes service lifecycle actions against the
//! [`ServiceManager`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use ssf_proto::admin::AdminHeader;
use ssf_proto::AdminMessage;

use crate::admin::session::{AdminAction, AdminSession, UserServiceSpec};
use crate::demux::{Fiber, FiberDemux, FiberReader, FiberWriter};
use crate::error::{AdminError, DemuxError};
use crate::services::ServiceManager;

/// Reserved fiber port the admin service runs on.
pub const ADMIN_PORT: u32 = 1;

/// Keep-alive period.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(120);

/// Admin fiber connect retry budget.
const CONNECT_RETRIES: u32 = 50;
/// First retry delay; doubles per attempt.
const CONNECT_BACKOFF_INITIAL: Duration = Duration::from_millis(200);
/// Retry delay ceiling.
const CONNECT_BACKOFF_CAP: Duration = Duration::from_secs(2);

/// Events the client driver reports to its owner.
#[derive(Debug)]
pub enum AdminEvent {
    /// Every `CreateService` request has been acknowledged
    Initialized(Result<(), AdminError>),
    /// One user service reached an outcome (remote instance id on success)
    UserService {
        /// Configuration name of the service
        name: String,
        /// Remote instance id, or the failure
        result: Result<u32, AdminError>,
    },
    /// The admin channel is gone; the connection is being torn down
    Closed(AdminError),
}

/// Handle to the running client-side admin driver.
#[derive(Debug)]
pub struct AdminClient {
    task: JoinHandle<()>,
}

impl AdminClient {
    /// Stop the driver without tearing down the demux.
    pub fn abort(&self) {
        self.task.abort();
    }
}

impl Drop for AdminClient {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Handle to the running server-side admin driver.
pub struct AdminServer {
    task: JoinHandle<()>,
}

impl AdminServer {
    /// Stop the driver without tearing down the demux.
    pub fn abort(&self) {
        self.task.abort();
    }
}

impl Drop for AdminServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Connect the admin fiber and start the client driver.
///
/// Retries the connect up to 50 times with doubling backoff (200 ms
/// initial, 2 s cap) — the server may still be setting up its acceptors.
///
/// # Errors
///
/// [`AdminError::AdminUnreachable`] when the retry budget is exhausted,
/// or the demux failure that ended the attempts early.
pub async fn start_client(
    demux: Arc<FiberDemux>,
    user_services: Vec<UserServiceSpec>,
    events: mpsc::UnboundedSender<AdminEvent>,
) -> Result<AdminClient, AdminError> {
    let fiber = connect_with_retries(&demux).await?;
    tracing::debug!(port = ADMIN_PORT, "admin fiber connected");

    let names: Vec<String> = user_services.iter().map(|s| s.name.clone()).collect();
    let session = AdminSession::client(user_services);
    let task = tokio::spawn(run_client(demux, fiber, session, names, events));
    Ok(AdminClient { task })
}

/// Start the server driver: listen on the admin port and serve the peer.
///
/// # Errors
///
/// Demux failures binding the admin port.
pub fn start_server(
    demux: Arc<FiberDemux>,
    manager: Arc<ServiceManager>,
) -> Result<AdminServer, AdminError> {
    let mut listener = demux.listen(ADMIN_PORT)?;
    let task = tokio::spawn(async move {
        let fiber = match listener.accept().await {
            Ok(fiber) => fiber,
            Err(err) => {
                tracing::debug!(error = %err, "admin accept ended");
                return;
            }
        };
        drop(listener); // one admin fiber per connection
        tracing::debug!(port = ADMIN_PORT, "admin fiber accepted");
        run_server(demux, fiber, manager).await;
    });
    Ok(AdminServer { task })
}

async fn connect_with_retries(demux: &FiberDemux) -> Result<Fiber, AdminError> {
    let mut backoff = CONNECT_BACKOFF_INITIAL;
    for attempt in 1..=CONNECT_RETRIES {
        match demux.connect(ADMIN_PORT).await {
            Ok(fiber) => return Ok(fiber),
            Err(DemuxError::Refused) => {
                tracing::debug!(attempt, "admin fiber refused, retrying");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(CONNECT_BACKOFF_CAP);
            }
            Err(err) => return Err(err.into()),
        }
    }
    Err(AdminError::AdminUnreachable { attempts: CONNECT_RETRIES })
}

async fn run_client(
    demux: Arc<FiberDemux>,
    fiber: Fiber,
    mut session: AdminSession,
    names: Vec<String>,
    events: mpsc::UnboundedSender<AdminEvent>,
) {
    let (mut reader, mut writer) = fiber.split();

    // A mid-frame read cannot be dropped and resumed, so inbound messages
    // arrive through a dedicated task; the channel recv below is safe to
    // race against the keep-alive timer.
    let (message_tx, mut message_rx) = mpsc::channel::<Result<AdminMessage, AdminError>>(16);
    let read_task = tokio::spawn(async move {
        loop {
            let message = read_message(&mut reader).await;
            let failed = message.is_err();
            if message_tx.send(message).await.is_err() || failed {
                return;
            }
        }
    });

    let open_actions = match session.on_open() {
        Ok(actions) => actions,
        Err(err) => {
            read_task.abort();
            let _ = events.send(AdminEvent::Closed(err));
            return;
        }
    };

    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut step = Ok(open_actions);
    let reason = loop {
        match step {
            Ok(actions) => {
                if let Err(reason) =
                    execute_client_actions(actions, &mut writer, &names, &events).await
                {
                    break reason;
                }
            }
            Err(reason) => break reason,
        }

        step = tokio::select! {
            _ = keepalive.tick() => session.tick(Instant::now()),
            message = message_rx.recv() => match message {
                Some(Ok(message)) => session.handle_message(&message),
                Some(Err(err)) => Err(err),
                None => Err(AdminError::Fiber("admin fiber closed".to_string())),
            },
        };
    };

    read_task.abort();
    finish_client(&mut session, reason, &names, &events, &demux);
}

/// Execute client-side actions; a returned error is the teardown reason.
async fn execute_client_actions(
    actions: Vec<AdminAction>,
    writer: &mut FiberWriter,
    names: &[String],
    events: &mpsc::UnboundedSender<AdminEvent>,
) -> Result<(), AdminError> {
    for action in actions {
        match action {
            AdminAction::Send(message) => write_message(writer, &message).await?,
            AdminAction::UserService { index, result } => {
                let name = names.get(index).cloned().unwrap_or_else(|| index.to_string());
                let _ = events.send(AdminEvent::UserService { name, result });
            }
            AdminAction::Initialized(result) => {
                let _ = events.send(AdminEvent::Initialized(result));
            }
            AdminAction::Teardown(reason) => return Err(reason),
            other => {
                tracing::warn!(action = ?other, "server-side action on client session");
            }
        }
    }
    Ok(())
}

fn finish_client(
    session: &mut AdminSession,
    reason: AdminError,
    names: &[String],
    events: &mpsc::UnboundedSender<AdminEvent>,
    demux: &Arc<FiberDemux>,
) {
    tracing::info!(%reason, "admin client closing");
    for action in session.cancel_all(&reason) {
        match action {
            AdminAction::UserService { index, result } => {
                let name = names.get(index).cloned().unwrap_or_else(|| index.to_string());
                let _ = events.send(AdminEvent::UserService { name, result });
            }
            AdminAction::Initialized(result) => {
                let _ = events.send(AdminEvent::Initialized(result));
            }
            _ => {}
        }
    }
    let _ = events.send(AdminEvent::Closed(reason));
    demux.close();
}

async fn run_server(demux: Arc<FiberDemux>, fiber: Fiber, manager: Arc<ServiceManager>) {
    let (mut reader, mut writer) = fiber.split();
    let mut session = AdminSession::server();

    loop {
        let message = match read_message(&mut reader).await {
            Ok(message) => message,
            Err(err) => {
                tracing::debug!(error = %err, "admin server channel ended");
                manager.stop_all().await;
                return;
            }
        };

        let actions = match session.handle_message(&message) {
            Ok(actions) => actions,
            Err(err) => {
                tracing::warn!(error = %err, "admin server protocol failure");
                manager.stop_all().await;
                demux.close();
                return;
            }
        };

        if execute_server_actions(actions, &mut session, &mut writer, &manager, &demux)
            .await
            .is_err()
        {
            manager.stop_all().await;
            return;
        }
    }
}

async fn execute_server_actions(
    actions: Vec<AdminAction>,
    session: &mut AdminSession,
    writer: &mut FiberWriter,
    manager: &Arc<ServiceManager>,
    demux: &Arc<FiberDemux>,
) -> Result<(), AdminError> {
    let mut queue: std::collections::VecDeque<AdminAction> = actions.into();

    while let Some(action) = queue.pop_front() {
        match action {
            AdminAction::Send(message) => write_message(writer, &message).await?,
            AdminAction::StartService { serial, factory_id, parameters } => {
                let (instance_id, status) = manager.create(factory_id, &parameters).await;
                queue.extend(session.local_create_done(serial, instance_id, status)?);
            }
            AdminAction::StopService { serial, instance_id } => {
                let status = manager.stop(instance_id).await;
                queue.extend(session.local_stop_done(serial, instance_id, status)?);
            }
            AdminAction::QueryStatus { serial, instance_id } => {
                let status = manager.status(instance_id);
                queue.extend(session.local_status_done(serial, instance_id, status)?);
            }
            AdminAction::Teardown(reason) => {
                tracing::info!(%reason, "admin server tearing down");
                demux.close();
                return Err(reason);
            }
            other => {
                tracing::warn!(action = ?other, "client-side action on server session");
            }
        }
    }
    Ok(())
}

async fn read_message(reader: &mut FiberReader) -> Result<AdminMessage, AdminError> {
    let mut header_buf = [0u8; AdminHeader::SIZE];
    reader.read_exact(&mut header_buf).await?;
    let header = *AdminHeader::from_bytes(&header_buf)?;

    let mut payload = vec![0u8; header.payload_len() as usize];
    if !payload.is_empty() {
        reader.read_exact(&mut payload).await?;
    }

    Ok(AdminMessage {
        serial: header.serial(),
        command_id: header.command_id(),
        payload: payload.into(),
    })
}

async fn write_message(writer: &mut FiberWriter, message: &AdminMessage) -> Result<(), AdminError> {
    let mut buf = Vec::with_capacity(AdminHeader::SIZE + message.payload.len());
    message.encode(&mut buf)?;
    writer.write_all(&buf).await?;
    Ok(())
}
