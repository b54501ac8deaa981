// The hub facade: registers connections, orchestrates bus subscriptions,
// fans invocations out locally and across servers, and coordinates
// cross-server group membership with acks.
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use backplane_bus::{Bus, BusEvent, BusHandler, Channels};
use backplane_proto::{HubProtocol, InvocationMessage};
use backplane_wire::{AckFrame, GroupAction, GroupCommandFrame, InvocationFrame, PayloadCache};
use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::broadcast;

use crate::ack::AckCoordinator;
use crate::config::HubManagerConfig;
use crate::connection::ClientConnection;
use crate::groups::GroupRegistry;
use crate::registry::{ConnectionRegistry, ConnectionState, RegisteredConnection};
use crate::{HubError, Result};

/// Routes invocations from any server in the cluster to any subset of
/// connected clients, coordinating over a pub/sub bus.
///
/// Every server process runs one manager per hub. A send is serialized at
/// most once per configured protocol and published once; the servers
/// holding targeted connections deliver the pre-encoded bytes. Group
/// membership changes for remote connections are confirmed end-to-end with
/// an ack before the call returns.
///
/// All operations are safe to call concurrently from any task.
///
/// ```
/// use std::sync::Arc;
/// use backplane_bus::{Bus, LocalFabric};
/// use backplane_hub::{HubManager, HubManagerConfig};
/// use backplane_proto::{HubProtocol, JsonProtocol};
///
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let fabric = LocalFabric::new();
///     let bus: Arc<dyn Bus> = fabric.connect();
///     let protocols: Vec<Arc<dyn HubProtocol>> = vec![Arc::new(JsonProtocol::new())];
///     let manager = HubManager::start(bus, protocols, HubManagerConfig::new("chat"))
///         .await
///         .expect("start");
///     manager
///         .send_all("Hello", vec!["World".into()])
///         .await
///         .expect("send");
/// });
/// ```
pub struct HubManager {
    bus: Arc<dyn Bus>,
    protocols: Vec<Arc<dyn HubProtocol>>,
    channels: Channels,
    server_name: String,
    connections: ConnectionRegistry,
    groups: GroupRegistry,
    acks: AckCoordinator,
    next_command_id: AtomicU32,
}

impl HubManager {
    /// Construct the manager and install the standing subscriptions
    /// (broadcast, group management, this server's ack channel).
    pub async fn start(
        bus: Arc<dyn Bus>,
        protocols: Vec<Arc<dyn HubProtocol>>,
        config: HubManagerConfig,
    ) -> Result<Arc<Self>> {
        let manager = Arc::new(Self {
            channels: Channels::new(config.hub_name),
            server_name: config.server_name,
            acks: AckCoordinator::new(config.ack_timeout),
            connections: ConnectionRegistry::new(),
            groups: GroupRegistry::new(),
            next_command_id: AtomicU32::new(0),
            protocols,
            bus,
        });

        let all = manager.channels.all();
        let handler = manager.bus_handler(|manager, payload| async move {
            manager.handle_all(payload).await;
        });
        manager.bus.subscribe(&all, handler).await?;

        let group_management = manager.channels.group_management();
        let handler = manager.bus_handler(|manager, payload| async move {
            manager.handle_group_command(payload).await;
        });
        manager.bus.subscribe(&group_management, handler).await?;

        let ack = manager.channels.ack(&manager.server_name);
        let handler = manager.bus_handler(|manager, payload| async move {
            manager.handle_ack(payload);
        });
        manager.bus.subscribe(&ack, handler).await?;

        tokio::spawn(log_bus_events(manager.bus.events()));
        Ok(manager)
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Register a connection and subscribe its direct channel, plus the
    /// user channel when the connection carries a user identity. Completes
    /// only after the subscriptions are established.
    pub async fn on_connected(
        self: &Arc<Self>,
        connection: Arc<dyn ClientConnection>,
    ) -> Result<()> {
        let connection_id = connection.connection_id().to_string();
        let registered = self.connections.insert(Arc::clone(&connection));

        let channel = self.channels.connection(&connection_id);
        self.bus
            .subscribe(&channel, self.direct_handler(connection_id.clone()))
            .await?;
        registered.state.record_subscription(channel).await;

        let user_id = connection
            .user_id()
            .filter(|user| !user.is_empty())
            .map(str::to_string);
        if let Some(user_id) = user_id {
            let channel = self.channels.user(&user_id);
            self.bus
                .subscribe(&channel, self.direct_handler(connection_id.clone()))
                .await?;
            registered.state.record_subscription(channel).await;
        }

        metrics::counter!("backplane_hub_connections_total").increment(1);
        Ok(())
    }

    /// Deregister a connection, release its channel subscriptions, and drop
    /// its group memberships. Cleanup runs in parallel; individual failures
    /// are logged and never surfaced.
    pub async fn on_disconnected(&self, connection: Arc<dyn ClientConnection>) {
        let Some(registered) = self.connections.remove(connection.connection_id()) else {
            return;
        };
        let subscriptions = registered.state.take_subscriptions().await;
        let groups = registered.state.groups_snapshot().await;
        let connection_id = connection.connection_id().to_string();

        let mut cleanups: Vec<BoxFuture<'_, ()>> = Vec::new();
        for channel in subscriptions {
            cleanups.push(Box::pin(async move {
                if let Err(err) = self.bus.unsubscribe(&channel).await {
                    tracing::warn!(
                        channel = %channel,
                        error = %err,
                        "unsubscribe failed during disconnect"
                    );
                }
            }));
        }
        for group_name in groups {
            let connection_id = connection_id.clone();
            let state = Arc::clone(&registered.state);
            cleanups.push(Box::pin(async move {
                // Local removal only: the connection is about to vanish, so
                // no cross-server command is issued.
                if let Err(err) = self
                    .remove_group_core(&connection_id, &state, &group_name)
                    .await
                {
                    tracing::warn!(
                        group = %group_name,
                        error = %err,
                        "group removal failed during disconnect"
                    );
                }
            }));
        }
        futures::future::join_all(cleanups).await;
    }

    /// Invoke `target` on every connection in the cluster.
    pub async fn send_all(&self, target: &str, arguments: Vec<serde_json::Value>) -> Result<()> {
        self.send_all_except(target, arguments, &[]).await
    }

    /// Invoke `target` on every connection except the listed ones.
    pub async fn send_all_except(
        &self,
        target: &str,
        arguments: Vec<serde_json::Value>,
        excluded: &[String],
    ) -> Result<()> {
        let payload = self.invocation_bytes(target, arguments, excluded)?;
        self.publish(self.channels.all(), payload).await
    }

    /// Invoke `target` on one connection, writing directly when it is
    /// local and skipping serialization entirely.
    pub async fn send_connection(
        &self,
        connection_id: &str,
        target: &str,
        arguments: Vec<serde_json::Value>,
    ) -> Result<()> {
        if connection_id.is_empty() {
            return Err(HubError::InvalidArgument("connection id must not be empty"));
        }
        if let Some(registered) = self.connections.get(connection_id) {
            let message = InvocationMessage::new(target, arguments);
            self.safe_write_message(&registered.handle, &message).await;
            return Ok(());
        }
        let payload = self.invocation_bytes(target, arguments, &[])?;
        self.publish(self.channels.connection(connection_id), payload)
            .await
    }

    /// Invoke `target` on every member of a group. Always published: the
    /// group may span servers, so there is no local short-circuit.
    pub async fn send_group(
        &self,
        group_name: &str,
        target: &str,
        arguments: Vec<serde_json::Value>,
    ) -> Result<()> {
        self.send_group_except(group_name, target, arguments, &[])
            .await
    }

    pub async fn send_group_except(
        &self,
        group_name: &str,
        target: &str,
        arguments: Vec<serde_json::Value>,
        excluded: &[String],
    ) -> Result<()> {
        if group_name.is_empty() {
            return Err(HubError::InvalidArgument("group name must not be empty"));
        }
        let payload = self.invocation_bytes(target, arguments, excluded)?;
        self.publish(self.channels.group(group_name), payload).await
    }

    /// Invoke `target` on every connection belonging to a user.
    pub async fn send_user(
        &self,
        user_id: &str,
        target: &str,
        arguments: Vec<serde_json::Value>,
    ) -> Result<()> {
        let payload = self.invocation_bytes(target, arguments, &[])?;
        self.publish(self.channels.user(user_id), payload).await
    }

    /// Batch variant of [`HubManager::send_connection`]; the payload is
    /// serialized at most once no matter how many targets are remote.
    pub async fn send_connections(
        &self,
        connection_ids: &[String],
        target: &str,
        arguments: Vec<serde_json::Value>,
    ) -> Result<()> {
        if connection_ids.iter().any(|id| id.is_empty()) {
            return Err(HubError::InvalidArgument("connection id must not be empty"));
        }
        let message = InvocationMessage::new(target, arguments);
        let frame = InvocationFrame::new(PayloadCache::from_message(message.clone()), Vec::new());
        let mut encoded: Option<Bytes> = None;
        for connection_id in connection_ids {
            if let Some(registered) = self.connections.get(connection_id) {
                self.safe_write_message(&registered.handle, &message).await;
                continue;
            }
            let payload = match &encoded {
                Some(payload) => payload.clone(),
                None => {
                    let payload = frame.encode(&self.protocols)?;
                    encoded = Some(payload.clone());
                    payload
                }
            };
            self.publish(self.channels.connection(connection_id), payload)
                .await?;
        }
        Ok(())
    }

    /// Batch variant of [`HubManager::send_group`].
    pub async fn send_groups(
        &self,
        group_names: &[String],
        target: &str,
        arguments: Vec<serde_json::Value>,
    ) -> Result<()> {
        if group_names.iter().any(|name| name.is_empty()) {
            return Err(HubError::InvalidArgument("group name must not be empty"));
        }
        if group_names.is_empty() {
            return Ok(());
        }
        let payload = self.invocation_bytes(target, arguments, &[])?;
        for group_name in group_names {
            self.publish(self.channels.group(group_name), payload.clone())
                .await?;
        }
        Ok(())
    }

    /// Batch variant of [`HubManager::send_user`].
    pub async fn send_users(
        &self,
        user_ids: &[String],
        target: &str,
        arguments: Vec<serde_json::Value>,
    ) -> Result<()> {
        if user_ids.iter().any(|id| id.is_empty()) {
            return Err(HubError::InvalidArgument("user id must not be empty"));
        }
        if user_ids.is_empty() {
            return Ok(());
        }
        let payload = self.invocation_bytes(target, arguments, &[])?;
        for user_id in user_ids {
            self.publish(self.channels.user(user_id), payload.clone())
                .await?;
        }
        Ok(())
    }

    /// Add a connection to a group. Applied directly when the connection is
    /// local; otherwise a group command is published and the call waits for
    /// the owning server's ack.
    pub async fn add_group(self: &Arc<Self>, connection_id: &str, group_name: &str) -> Result<()> {
        validate_membership_args(connection_id, group_name)?;
        if let Some(registered) = self.connections.get(connection_id) {
            return self.add_group_core(&registered, group_name).await;
        }
        self.send_group_command(GroupAction::Add, connection_id, group_name)
            .await
    }

    /// Remove a connection from a group, with the same local/remote split
    /// as [`HubManager::add_group`].
    pub async fn remove_group(
        self: &Arc<Self>,
        connection_id: &str,
        group_name: &str,
    ) -> Result<()> {
        validate_membership_args(connection_id, group_name)?;
        if let Some(registered) = self.connections.get(connection_id) {
            return self
                .remove_group_core(connection_id, &registered.state, group_name)
                .await;
        }
        self.send_group_command(GroupAction::Remove, connection_id, group_name)
            .await
    }

    /// Fail outstanding group-command waiters and release the standing
    /// subscriptions.
    pub async fn shutdown(&self) {
        self.acks.shutdown();
        let standing = [
            self.channels.all(),
            self.channels.group_management(),
            self.channels.ack(&self.server_name),
        ];
        for channel in standing {
            if let Err(err) = self.bus.unsubscribe(&channel).await {
                tracing::debug!(
                    channel = %channel,
                    error = %err,
                    "unsubscribe failed during shutdown"
                );
            }
        }
    }

    async fn add_group_core(
        self: &Arc<Self>,
        registered: &RegisteredConnection,
        group_name: &str,
    ) -> Result<()> {
        if !registered.state.add_group(group_name).await {
            return Ok(());
        }
        let channel = self.channels.group(group_name);
        let entry = self.groups.get_or_create(&channel);
        // The entry lock is held across the subscribe so membership changes
        // for this group serialize against the subscription transition.
        let mut members = entry.members.lock().await;
        members
            .connections
            .insert(registered.handle.connection_id().to_string());
        if !members.subscribed {
            self.bus
                .subscribe(&channel, self.group_handler(channel.clone()))
                .await?;
            members.subscribed = true;
        }
        Ok(())
    }

    async fn remove_group_core(
        &self,
        connection_id: &str,
        state: &Arc<ConnectionState>,
        group_name: &str,
    ) -> Result<()> {
        let channel = self.channels.group(group_name);
        let Some(entry) = self.groups.get(&channel) else {
            return Ok(());
        };
        state.remove_group(group_name).await;
        let mut members = entry.members.lock().await;
        if members.connections.remove(connection_id)
            && members.connections.is_empty()
            && members.subscribed
        {
            members.subscribed = false;
            self.bus.unsubscribe(&channel).await?;
        }
        Ok(())
    }

    async fn send_group_command(
        &self,
        action: GroupAction,
        connection_id: &str,
        group_name: &str,
    ) -> Result<()> {
        let id = self.next_command_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let receiver = self.acks.create(id);
        let frame = GroupCommandFrame {
            id,
            server: self.server_name.clone(),
            action,
            group: group_name.to_string(),
            connection: connection_id.to_string(),
        };
        if let Err(err) = self
            .bus
            .publish(&self.channels.group_management(), frame.encode())
            .await
        {
            self.acks.discard(id);
            return Err(err.into());
        }
        metrics::counter!("backplane_hub_group_commands_total").increment(1);
        self.acks.wait(id, receiver).await
    }

    async fn handle_all(&self, payload: Bytes) {
        let Some(frame) = decode_invocation(payload) else {
            return;
        };
        for registered in self.connections.snapshot() {
            if frame.excludes(registered.handle.connection_id()) {
                continue;
            }
            self.deliver(&frame.cache, &registered.handle).await;
        }
    }

    async fn handle_direct(&self, connection_id: &str, payload: Bytes) {
        let Some(frame) = decode_invocation(payload) else {
            return;
        };
        if let Some(registered) = self.connections.get(connection_id) {
            self.deliver(&frame.cache, &registered.handle).await;
        }
    }

    async fn handle_group(&self, channel: &str, payload: Bytes) {
        let Some(frame) = decode_invocation(payload) else {
            return;
        };
        let Some(entry) = self.groups.get(channel) else {
            return;
        };
        let members: Vec<String> = {
            let members = entry.members.lock().await;
            members.connections.iter().cloned().collect()
        };
        for connection_id in members {
            if frame.excludes(&connection_id) {
                continue;
            }
            if let Some(registered) = self.connections.get(&connection_id) {
                self.deliver(&frame.cache, &registered.handle).await;
            }
        }
    }

    async fn handle_group_command(self: &Arc<Self>, payload: Bytes) {
        let frame = match GroupCommandFrame::decode(payload) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(error = %err, "dropping malformed group command");
                return;
            }
        };
        // Only the server holding the connection applies and acks; everyone
        // else ignores the command.
        let Some(registered) = self.connections.get(&frame.connection) else {
            return;
        };
        let result = match frame.action {
            GroupAction::Add => self.add_group_core(&registered, &frame.group).await,
            GroupAction::Remove => {
                self.remove_group_core(&frame.connection, &registered.state, &frame.group)
                    .await
            }
        };
        if let Err(err) = result {
            tracing::warn!(
                group = %frame.group,
                connection = %frame.connection,
                error = %err,
                "group command failed; not acking"
            );
            return;
        }
        metrics::counter!("backplane_hub_group_commands_handled_total").increment(1);
        let ack = AckFrame { id: frame.id }.encode();
        if let Err(err) = self.bus.publish(&self.channels.ack(&frame.server), ack).await {
            tracing::warn!(server = %frame.server, error = %err, "failed to publish ack");
        }
    }

    fn handle_ack(&self, payload: Bytes) {
        match AckFrame::decode(payload) {
            Ok(frame) => self.acks.trigger(frame.id),
            Err(err) => tracing::warn!(error = %err, "dropping malformed ack"),
        }
    }

    /// Write the cached encoding matching the connection's protocol. A miss
    /// or a failed write is logged and swallowed so one connection never
    /// stalls the rest of a fan-out.
    async fn deliver(&self, cache: &PayloadCache, connection: &Arc<dyn ClientConnection>) {
        let protocol_name = connection.protocol();
        let encoded = match self.protocol_by_name(protocol_name) {
            Some(protocol) => cache.encoded_for(protocol.as_ref()),
            None => cache.encoded_for_name(protocol_name),
        };
        match encoded {
            Ok(payload) => {
                if let Err(err) = connection.write_payload(payload).await {
                    self.note_write_failure(connection.connection_id(), &err);
                } else {
                    metrics::counter!("backplane_hub_local_deliveries_total").increment(1);
                }
            }
            Err(err) => {
                tracing::warn!(
                    connection = connection.connection_id(),
                    protocol = protocol_name,
                    error = %err,
                    "no payload available for connection protocol"
                );
                metrics::counter!("backplane_hub_dropped_deliveries_total").increment(1);
            }
        }
    }

    async fn safe_write_message(
        &self,
        connection: &Arc<dyn ClientConnection>,
        message: &InvocationMessage,
    ) {
        if let Err(err) = connection.write_message(message).await {
            self.note_write_failure(connection.connection_id(), &err);
        } else {
            metrics::counter!("backplane_hub_local_deliveries_total").increment(1);
        }
    }

    fn note_write_failure(&self, connection_id: &str, err: &anyhow::Error) {
        tracing::warn!(
            connection = connection_id,
            error = %err,
            "connection write failed; continuing fan-out"
        );
        metrics::counter!("backplane_hub_write_failures_total").increment(1);
    }

    fn invocation_bytes(
        &self,
        target: &str,
        arguments: Vec<serde_json::Value>,
        excluded: &[String],
    ) -> Result<Bytes> {
        let cache = PayloadCache::from_message(InvocationMessage::new(target, arguments));
        let frame = InvocationFrame::new(cache, excluded.to_vec());
        Ok(frame.encode(&self.protocols)?)
    }

    async fn publish(&self, channel: String, payload: Bytes) -> Result<()> {
        self.bus.publish(&channel, payload).await?;
        metrics::counter!("backplane_hub_publish_total").increment(1);
        Ok(())
    }

    fn protocol_by_name(&self, name: &str) -> Option<&Arc<dyn HubProtocol>> {
        self.protocols
            .iter()
            .find(|protocol| protocol.name() == name)
    }

    fn bus_handler<F, Fut>(self: &Arc<Self>, handle: F) -> BusHandler
    where
        F: Fn(Arc<Self>, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let weak = Arc::downgrade(self);
        Arc::new(move |payload: Bytes| -> BoxFuture<'static, ()> {
            match weak.upgrade() {
                Some(manager) => Box::pin(handle(manager, payload)),
                None => Box::pin(async {}),
            }
        })
    }

    fn direct_handler(self: &Arc<Self>, connection_id: String) -> BusHandler {
        let weak = Arc::downgrade(self);
        Arc::new(move |payload: Bytes| -> BoxFuture<'static, ()> {
            let connection_id = connection_id.clone();
            match weak.upgrade() {
                Some(manager) => Box::pin(async move {
                    manager.handle_direct(&connection_id, payload).await;
                }),
                None => Box::pin(async {}),
            }
        })
    }

    fn group_handler(self: &Arc<Self>, channel: String) -> BusHandler {
        let weak = Arc::downgrade(self);
        Arc::new(move |payload: Bytes| -> BoxFuture<'static, ()> {
            let channel = channel.clone();
            match weak.upgrade() {
                Some(manager) => Box::pin(async move {
                    manager.handle_group(&channel, payload).await;
                }),
                None => Box::pin(async {}),
            }
        })
    }
}

fn validate_membership_args(connection_id: &str, group_name: &str) -> Result<()> {
    if connection_id.is_empty() {
        return Err(HubError::InvalidArgument("connection id must not be empty"));
    }
    if group_name.is_empty() {
        return Err(HubError::InvalidArgument("group name must not be empty"));
    }
    Ok(())
}

fn decode_invocation(payload: Bytes) -> Option<InvocationFrame> {
    match InvocationFrame::decode(payload) {
        Ok(frame) => Some(frame),
        Err(err) => {
            tracing::warn!(error = %err, "dropping malformed invocation frame");
            None
        }
    }
}

async fn log_bus_events(mut events: broadcast::Receiver<BusEvent>) {
    loop {
        match events.recv().await {
            Ok(BusEvent::Restored) => tracing::info!("bus connection restored"),
            Ok(BusEvent::Failed { reason }) => {
                tracing::warn!(reason = %reason, "bus connection failed");
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "missed bus connection events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
