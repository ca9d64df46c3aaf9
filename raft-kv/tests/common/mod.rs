//! Test harness for running a cluster of real servers over localhost TCP.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use raft_kv::client::Client;
use raft_kv::consensus::Role;
use raft_kv::observer::CountingObserver;
use raft_kv::server::{Server, ServerConfig};
use raft_kv::storage::MapStorage;

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub struct TestCluster {
    servers: Vec<Option<Server>>,
    ids: Vec<String>,
    addrs: Vec<String>,
    pub observers: Vec<Arc<CountingObserver>>,
}

impl TestCluster {
    /// Binds `n` servers on ephemeral ports, connects every pair and enables
    /// elections.
    pub async fn spawn(n: usize) -> Result<Self> {
        let mut servers = Vec::new();
        let mut observers = Vec::new();
        for _ in 0..n {
            let observer = Arc::new(CountingObserver::new());
            let server = Server::bind(
                ServerConfig::new("127.0.0.1:0"),
                Arc::new(MapStorage::new()),
                observer.clone(),
            )
            .await?;
            servers.push(server);
            observers.push(observer);
        }

        let ids: Vec<String> = servers.iter().map(|s| s.id().to_string()).collect();
        let addrs: Vec<String> = servers
            .iter()
            .map(|s| s.listen_addr().to_string())
            .collect();

        for server in &servers {
            for (id, addr) in ids.iter().zip(&addrs) {
                server.connect_to_peer(id, addr).await?;
            }
        }
        for server in &servers {
            server.start();
        }

        Ok(Self {
            servers: servers.into_iter().map(Some).collect(),
            ids,
            addrs,
            observers,
        })
    }

    /// Node by 1-indexed position. Panics if it was stopped.
    pub fn node(&self, n: usize) -> &Server {
        self.servers[n - 1].as_ref().expect("node was stopped")
    }

    pub fn id(&self, n: usize) -> &str {
        &self.ids[n - 1]
    }

    pub fn addr(&self, n: usize) -> &str {
        &self.addrs[n - 1]
    }

    pub fn size(&self) -> usize {
        self.servers.len()
    }

    pub fn live(&self) -> Vec<usize> {
        (1..=self.size())
            .filter(|n| self.servers[n - 1].is_some())
            .collect()
    }

    /// Client seeded with the given nodes.
    pub fn client(&self, nodes: &[usize]) -> Result<Client> {
        let seeds: Vec<String> = nodes.iter().map(|n| self.addr(*n).to_string()).collect();
        Ok(Client::new(seeds)?.with_backoff(Duration::from_millis(100)))
    }

    pub fn leaders_among(&self, nodes: &[usize]) -> Vec<usize> {
        nodes
            .iter()
            .copied()
            .filter(|n| self.node(*n).status().role == Role::Leader)
            .collect()
    }

    /// Waits until exactly one of `nodes` is leader.
    pub async fn wait_for_leader_among(&self, nodes: &[usize]) -> Result<usize> {
        let start = Instant::now();
        loop {
            let leaders = self.leaders_among(nodes);
            if leaders.len() == 1 {
                return Ok(leaders[0]);
            }
            if start.elapsed() > TIMEOUT {
                bail!("no single leader among {nodes:?}, saw {leaders:?}");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn wait_for_leader(&self) -> Result<usize> {
        self.wait_for_leader_among(&self.live()).await
    }

    /// Waits until node `n` has applied `key = value`.
    pub async fn wait_for_value(&self, n: usize, key: &str, value: &str) -> Result<()> {
        let start = Instant::now();
        loop {
            if self.node(n).kv().get(key).as_deref() == Some(value) {
                return Ok(());
            }
            if start.elapsed() > TIMEOUT {
                bail!(
                    "node {n} has {key} = {:?}, expected {value}",
                    self.node(n).kv().get(key)
                );
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn wait_for_value_everywhere(&self, key: &str, value: &str) -> Result<()> {
        for n in self.live() {
            self.wait_for_value(n, key, value).await?;
        }
        Ok(())
    }

    /// Cuts node `n` off from every other node in both directions.
    pub fn isolate(&self, n: usize) {
        for other in self.live().into_iter().filter(|other| *other != n) {
            self.node(n).disconnect_peer(self.id(other));
            self.node(other).disconnect_peer(self.id(n));
        }
    }

    pub async fn rejoin(&self, n: usize) -> Result<()> {
        for other in self.live().into_iter().filter(|other| *other != n) {
            self.node(n)
                .connect_to_peer(self.id(other), self.addr(other))
                .await?;
            self.node(other)
                .connect_to_peer(self.id(n), self.addr(n))
                .await?;
        }
        Ok(())
    }

    pub async fn stop(&mut self, n: usize) -> Result<()> {
        if let Some(server) = self.servers[n - 1].take() {
            server.shutdown().await?;
        }
        Ok(())
    }

    pub async fn shutdown(mut self) -> Result<()> {
        for n in 1..=self.size() {
            self.stop(n).await?;
        }
        Ok(())
    }
}

/// Retries a client write until the cluster accepts it or the harness
/// timeout passes. Used where a write may race an election.
pub async fn set_eventually(client: &mut Client, key: &str, value: &str) -> Result<()> {
    let start = Instant::now();
    loop {
        match client.set(key, value).await {
            Ok(()) => return Ok(()),
            Err(err) if start.elapsed() > TIMEOUT => return Err(err.into()),
            Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
}
