//! # Purpose
//! Demonstrate cluster fan-out end-to-end using real backplane components
//! on the in-process fabric.
//!
//! # What this demo proves
//! - A broadcast from one server reaches connections held by another.
//! - Exclusion lists suppress delivery to the listed connections.
//! - A cross-server group add completes only after the owning server acks,
//!   and a subsequent group send reaches the new member.
//! - A user send fans out to every connection of that user.
//!
//! # Flow summary
//! 1. Open one fabric and start two hub managers on it.
//! 2. Register two console connections on each server.
//! 3. Broadcast, then broadcast with an exclusion.
//! 4. Add a remote connection to a group and send to the group.
//! 5. Send to a user with connections on both servers.
//! 6. Print a delivery summary and exit non-zero on any mismatch.
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Result, bail};
use async_trait::async_trait;
use backplane_bus::{Bus, LocalFabric};
use backplane_hub::{ClientConnection, HubManager, HubManagerConfig};
use backplane_proto::{HubProtocol, InvocationMessage, JsonProtocol};
use bytes::Bytes;
use serde_json::json;

struct ConsoleConnection {
    id: String,
    user: Option<String>,
    delivered: AtomicUsize,
}

impl ConsoleConnection {
    fn new(id: &str, user: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            user: user.map(str::to_string),
            delivered: AtomicUsize::new(0),
        })
    }

    fn delivered(&self) -> usize {
        self.delivered.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ClientConnection for ConsoleConnection {
    fn connection_id(&self) -> &str {
        &self.id
    }

    fn user_id(&self) -> Option<&str> {
        self.user.as_deref()
    }

    fn protocol(&self) -> &str {
        "json"
    }

    async fn write_message(&self, message: &InvocationMessage) -> Result<()> {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        println!("  [{}] <- {} {:?}", self.id, message.target, message.arguments);
        Ok(())
    }

    async fn write_payload(&self, payload: Bytes) -> Result<()> {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        let decoded = JsonProtocol::new().decode(&payload)?;
        println!("  [{}] <- {} {:?}", self.id, decoded.target, decoded.arguments);
        Ok(())
    }
}

async fn start_server(fabric: &Arc<LocalFabric>, name: &str) -> Result<Arc<HubManager>> {
    let bus: Arc<dyn Bus> = fabric.connect();
    let protocols: Vec<Arc<dyn HubProtocol>> = vec![Arc::new(JsonProtocol::new())];
    let config = HubManagerConfig::from_env("demo").with_server_name(name);
    Ok(HubManager::start(bus, protocols, config).await?)
}

fn check(label: &str, actual: usize, expected: usize, failures: &mut usize) {
    let status = if actual == expected { "ok" } else { "FAIL" };
    if actual != expected {
        *failures += 1;
    }
    println!("{status:>4}  {label}: delivered {actual}, expected {expected}");
}

#[tokio::main]
async fn main() -> Result<()> {
    let fabric = LocalFabric::new();
    let s1 = start_server(&fabric, "s1").await?;
    let s2 = start_server(&fabric, "s2").await?;

    let c1 = ConsoleConnection::new("c1", Some("alice"));
    let c2 = ConsoleConnection::new("c2", None);
    let c3 = ConsoleConnection::new("c3", Some("alice"));
    let c4 = ConsoleConnection::new("c4", None);
    s1.on_connected(c1.clone()).await?;
    s1.on_connected(c2.clone()).await?;
    s2.on_connected(c3.clone()).await?;
    s2.on_connected(c4.clone()).await?;

    println!("broadcast from s1:");
    s1.send_all("Welcome", vec![json!("everyone")]).await?;

    println!("broadcast from s2, excluding c4:");
    s2.send_all_except("Welcome", vec![json!("most")], &["c4".to_string()])
        .await?;

    println!("cross-server group add (s1 commands, s2 owns c3):");
    s1.add_group("c3", "ops").await?;
    s1.send_group("ops", "Deploy", vec![json!({"Version": "1.2.3"})])
        .await?;

    println!("user send to alice (connections on both servers):");
    s2.send_user("alice", "Ping", vec![]).await?;

    let mut failures = 0;
    check("c1 (all, all, user)", c1.delivered(), 3, &mut failures);
    check("c2 (all, all)", c2.delivered(), 2, &mut failures);
    check("c3 (all, all, group, user)", c3.delivered(), 4, &mut failures);
    check("c4 (all, excluded)", c4.delivered(), 1, &mut failures);

    s1.shutdown().await;
    s2.shutdown().await;
    if failures > 0 {
        bail!("{failures} delivery checks failed");
    }
    println!("all delivery checks passed");
    Ok(())
}
