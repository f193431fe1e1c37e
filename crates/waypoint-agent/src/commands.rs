//! Subcommand implementations

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use waypoint_common::{Discovery, DiscoveryError, ServiceInstance, with_timeout};
use waypoint_kv::{KvClient, MemoryKv};
use waypoint_registry::Registry;
use waypoint_resolver::{FnUpdateSink, Picker, ResolverBuilder, ResolverState, WatchSink};

use crate::config::{AgentConfig, Command, RegisterArgs};

/// Budget for removing the registration once the agent is interrupted
const DEREGISTER_TIMEOUT: Duration = Duration::from_secs(5);

fn addresses_json(state: &ResolverState) -> Value {
    Value::from(
        state
            .addresses
            .iter()
            .map(|a| a.addr.clone())
            .collect::<Vec<_>>(),
    )
}

pub struct Agent {
    config: AgentConfig,
    registry: Arc<Registry>,
    token: CancellationToken,
}

impl Agent {
    pub fn new(config: AgentConfig, client: Arc<dyn KvClient>, token: CancellationToken) -> Self {
        let registry = Arc::new(Registry::new(client, config.registry.clone()));
        Self {
            config,
            registry,
            token,
        }
    }

    pub async fn run(&self, command: Command) -> anyhow::Result<()> {
        match command {
            Command::Register(args) => self.register(args).await,
            Command::List { name } => self.list(&name).await,
            Command::Watch { name, resolve } if resolve => self.resolve(&name).await,
            Command::Watch { name, .. } => self.watch(&name).await,
            Command::Demo { name, instances } => {
                let report = run_demo(&self.config, &self.token, &name, instances).await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
                Ok(())
            }
        }
    }

    async fn register(&self, args: RegisterArgs) -> anyhow::Result<()> {
        let mut instance = ServiceInstance::new(&args.name, args.endpoints).with_version(args.version);
        if let Some(id) = args.id {
            instance = instance.with_id(id);
        }
        for (key, value) in args.metadata {
            instance = instance.with_metadata(key, value);
        }
        if let Some(weight) = args.weight {
            instance = instance.with_weight(weight);
        }

        self.registry
            .register(&self.token, &instance)
            .await
            .with_context(|| format!("failed to register {}/{}", instance.name, instance.id))?;
        println!("{}", serde_json::to_string(&instance)?);

        if let Some(mut status) = self.registry.subscribe_heartbeat(&instance) {
            loop {
                tokio::select! {
                    _ = self.token.cancelled() => break,
                    changed = status.changed() => {
                        if changed.is_err() {
                            self.token.cancelled().await;
                            break;
                        }
                        let status = status.borrow_and_update().clone();
                        match &status.last_error {
                            Some(e) => warn!(
                                state = %status.state,
                                lease_id = status.lease_id,
                                "Heartbeat state changed: {}", e
                            ),
                            None => info!(
                                state = %status.state,
                                lease_id = status.lease_id,
                                recoveries = status.recoveries,
                                "Heartbeat state changed"
                            ),
                        }
                    }
                }
            }
        } else {
            self.token.cancelled().await;
        }

        // The root token is gone; removal runs on its own budget
        let cleanup = CancellationToken::new();
        match with_timeout(DEREGISTER_TIMEOUT, self.registry.deregister(&cleanup, &instance)).await {
            Ok(()) => info!(service = %instance.name, id = %instance.id, "Instance deregistered"),
            Err(e) => warn!(
                service = %instance.name,
                id = %instance.id,
                "Failed to deregister, the lease will expire on its own: {}", e
            ),
        }
        Ok(())
    }

    async fn list(&self, name: &str) -> anyhow::Result<()> {
        let instances = self.registry.get_service(&self.token, name).await?;
        println!("{}", serde_json::to_string_pretty(&instances)?);
        Ok(())
    }

    async fn watch(&self, name: &str) -> anyhow::Result<()> {
        let watcher = self.registry.watch(&self.token, name).await?;
        let result: anyhow::Result<()> = loop {
            match watcher.next().await {
                Ok(snapshot) => match serde_json::to_string(&snapshot) {
                    Ok(line) => println!("{}", line),
                    Err(e) => break Err(e.into()),
                },
                Err(DiscoveryError::Cancelled | DiscoveryError::Stopped) => break Ok(()),
                Err(e) => break Err(e.into()),
            }
        };
        let _ = watcher.stop();
        result
    }

    async fn resolve(&self, name: &str) -> anyhow::Result<()> {
        let discovery: Arc<dyn Discovery> = self.registry.clone();
        let sink = FnUpdateSink::new(|state: ResolverState| {
            println!("{}", addresses_json(&state));
        });
        let handle = ResolverBuilder::new(discovery, self.config.resolver.clone())
            .build(&self.token, name, Arc::new(sink))
            .await?;

        self.token.cancelled().await;
        handle.stop().await;
        Ok(())
    }
}

async fn wait_for_len(
    state: &watch::Receiver<ResolverState>,
    expected: usize,
    budget: Duration,
) -> anyhow::Result<ResolverState> {
    let mut state = state.clone();
    let ready = tokio::time::timeout(budget, state.wait_for(|s| s.len() == expected))
        .await
        .context("timed out waiting for the resolver")?
        .context("resolver stopped")?;
    Ok(ready.clone())
}

/// Outcome of `run_demo`
#[derive(Debug, serde::Serialize)]
pub struct DemoReport {
    pub service: String,
    /// Addresses resolved once every instance was registered
    pub resolved: Vec<String>,
    /// Addresses resolved after the first instance left
    pub after_deregister: Vec<String>,
    /// Weighted picks per address
    pub picks: BTreeMap<String, usize>,
}

/// Register `instances` copies of `name` in a private in-memory store,
/// follow them with a resolver, pick from the result and deregister one.
pub async fn run_demo(
    config: &AgentConfig,
    token: &CancellationToken,
    name: &str,
    instances: u16,
) -> anyhow::Result<DemoReport> {
    anyhow::ensure!(instances > 0, "demo needs at least one instance");

    let registry = Arc::new(Registry::new(
        Arc::new(MemoryKv::with_reaper(Duration::from_millis(200))),
        config.registry.clone(),
    ));
    let options = config.resolver.clone();
    let scheme = options.endpoint_scheme();

    let members: Vec<ServiceInstance> = (0..instances)
        .map(|i| {
            ServiceInstance::new(name, vec![format!("{}://127.0.0.1:{}", scheme, 9000 + u32::from(i))])
                .with_id(format!("{}-{}", name, i))
                .with_weight(f64::from(i + 1))
        })
        .collect();
    for instance in &members {
        registry.register(token, instance).await?;
    }

    let (sink, state) = WatchSink::new();
    let handle = ResolverBuilder::new(registry.clone(), options.clone())
        .build(token, name, Arc::new(sink))
        .await?;

    let resolved = wait_for_len(&state, members.len(), options.timeout).await?;
    let mut picks = BTreeMap::new();
    for _ in 0..100 {
        if let Some(address) = Picker::pick(&resolved) {
            *picks.entry(address.addr.clone()).or_insert(0) += 1;
        }
    }
    info!(service = %name, resolved = resolved.len(), "Demo resolved every instance");

    registry.deregister(token, &members[0]).await?;
    let after = if members.len() > 1 {
        wait_for_len(&state, members.len() - 1, options.timeout).await?
    } else {
        // An empty set is never published after the seed
        warn!(service = %name, "Last instance left, resolver keeps the previous address");
        resolved.clone()
    };

    handle.stop().await;
    registry.shutdown().await;

    Ok(DemoReport {
        service: name.to_string(),
        resolved: resolved.endpoint_set().into_iter().collect(),
        after_deregister: after.endpoint_set().into_iter().collect(),
        picks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use waypoint_registry::RegistryConfig;
    use waypoint_resolver::ResolverOptions;

    fn demo_config() -> AgentConfig {
        AgentConfig {
            registry: RegistryConfig::default().with_register_ttl(Duration::from_secs(5)),
            resolver: ResolverOptions::default().with_insecure(true),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_demo_follows_membership() {
        let token = CancellationToken::new();
        let report = run_demo(&demo_config(), &token, "demo", 3).await.unwrap();

        assert_eq!(
            report.resolved,
            vec!["127.0.0.1:9000", "127.0.0.1:9001", "127.0.0.1:9002"]
        );
        assert_eq!(report.after_deregister, vec!["127.0.0.1:9001", "127.0.0.1:9002"]);
        assert_eq!(report.picks.values().sum::<usize>(), 100);
        assert!(report.picks.keys().all(|addr| report.resolved.contains(addr)));
    }

    #[tokio::test]
    async fn test_demo_rejects_zero_instances() {
        let token = CancellationToken::new();
        assert!(run_demo(&demo_config(), &token, "demo", 0).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_and_register_share_store() {
        let client: Arc<dyn KvClient> = Arc::new(MemoryKv::new());
        let token = CancellationToken::new();
        let agent = Agent::new(demo_config(), client.clone(), token.clone());

        let instance = ServiceInstance::new("user", vec!["grpc://10.0.0.1:9090".to_string()]);
        agent.registry.register(&token, &instance).await.unwrap();
        agent.list("user").await.unwrap();

        let other = Registry::new(client, RegistryConfig::default());
        let listed = other.get_service(&token, "user").await.unwrap();
        assert_eq!(listed, vec![instance]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_deregisters_on_shutdown() {
        let client = MemoryKv::new();
        let token = CancellationToken::new();
        let agent = Agent::new(demo_config(), Arc::new(client.clone()), token.clone());

        let args = RegisterArgs {
            name: "user".to_string(),
            endpoints: vec!["grpc://10.0.0.1:9090".to_string()],
            id: Some("u1".to_string()),
            version: "1.0".to_string(),
            metadata: vec![("zone".to_string(), "a".to_string())],
            weight: None,
        };
        let running = tokio::spawn(async move { agent.register(args).await });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(client.lease_of("/microservices/user/u1").is_some());

        token.cancel();
        running.await.unwrap().unwrap();
        assert!(client.lease_of("/microservices/user/u1").is_none());
        assert!(client.lease_ids().is_empty());
    }
}
