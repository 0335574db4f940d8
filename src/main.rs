//! JMeter Operator - distributed load-test clusters on Kubernetes

use std::collections::HashMap;
use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use kube::runtime::watcher::{watcher, Config as WatcherConfig, Event};
use kube::{Api, Client, CustomResourceExt, ResourceExt};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use jmeter_operator::config::OperatorConfig;
use jmeter_operator::controller::Context;
use jmeter_operator::crd::Jmeter;
use jmeter_operator::platform::{EventPoster, KubeResourceStore, PodExecDispatch, FIELD_MANAGER};
use jmeter_operator::{HEALTH_PROBE_INITIAL_DELAY, HEALTH_PROBE_INTERVAL};

/// JMeter Operator - declarative JMeter load-test clusters
#[derive(Parser, Debug)]
#[command(name = "jmeter-operator", version, about, long_about = None)]
struct Cli {
    /// Generate the CRD manifest and exit
    #[arg(long)]
    crd: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&Jmeter::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    run_controller().await
}

/// Ensure the Jmeter CRD is installed
///
/// The operator installs its own CRD on startup using server-side apply,
/// so the installed schema always matches the operator version.
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    info!("Installing Jmeter CRD...");
    crds.patch(
        "jmeters.jmeter.zs.com",
        &params,
        &Patch::Apply(&Jmeter::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install Jmeter CRD: {}", e))?;
    Ok(())
}

/// Run the controller until the process is told to stop
async fn run_controller() -> anyhow::Result<()> {
    let client = Client::try_default().await?;
    ensure_crd_installed(&client).await?;

    let config = OperatorConfig::from_env();
    config.log_banner();

    let store = Arc::new(KubeResourceStore::new(client.clone()));
    let dispatch = Arc::new(PodExecDispatch::new(client.clone()));
    let events = Arc::new(EventPoster::new(client.clone()));
    let ctx = Arc::new(Context::new(store, dispatch, events, config));

    tokio::spawn(run_health_timer(ctx.clone()));

    tokio::select! {
        result = run_watch(client, ctx) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }
    info!("jmeter operator stopped");
    Ok(())
}

/// Periodic health probe over every known cluster
async fn run_health_timer(ctx: Arc<Context>) {
    tokio::time::sleep(HEALTH_PROBE_INITIAL_DELAY).await;
    let mut ticker = tokio::time::interval(HEALTH_PROBE_INTERVAL);
    loop {
        ticker.tick().await;
        let clusters = match ctx.store().list_clusters().await {
            Ok(clusters) => clusters,
            Err(e) => {
                warn!(error = %e, "failed to list clusters for health probe");
                continue;
            }
        };
        for cluster in &clusters {
            if let Err(e) = ctx.on_timer(cluster).await {
                warn!(cluster = %cluster.name_any(), error = %e, "health probe failed");
            }
        }
    }
}

/// The last spec fields we acted on for a cluster, used to synthesize
/// field-change triggers from watch deliveries
#[derive(Clone, PartialEq)]
struct Observed {
    instances: Option<i32>,
    command: Option<String>,
}

impl Observed {
    fn of(cluster: &Jmeter) -> Self {
        Self {
            instances: cluster.spec.instances,
            command: cluster.spec.command.clone(),
        }
    }
}

enum Trigger {
    Create,
    Command(String),
    Instances(Option<i32>),
    Delete,
}

/// Watch the cluster resources and turn deliveries into handler triggers
async fn run_watch(client: Client, ctx: Arc<Context>) -> anyhow::Result<()> {
    let api: Api<Jmeter> = Api::all(client);
    let mut cache: HashMap<String, Observed> = HashMap::new();
    let mut stream = watcher(api, WatcherConfig::default()).boxed();

    info!("watching jmeter clusters");
    while let Some(event) = stream.next().await {
        match event {
            Ok(Event::Apply(cluster)) | Ok(Event::InitApply(cluster)) => {
                handle_apply(&ctx, &mut cache, cluster);
            }
            Ok(Event::Delete(cluster)) => {
                let key = cache_key(&cluster);
                cache.remove(&key);
                tokio::spawn(deliver(ctx.clone(), cluster, Trigger::Delete));
            }
            Ok(Event::Init) | Ok(Event::InitDone) => {}
            Err(e) => {
                // the watcher restarts itself; deliveries resume after Init
                warn!(error = %e, "watch stream error");
            }
        }
    }
    Ok(())
}

fn cache_key(cluster: &Jmeter) -> String {
    format!(
        "{}/{}",
        cluster.namespace().unwrap_or_default(),
        cluster.name_any()
    )
}

/// Diff a delivered document against the last observed spec fields and
/// spawn the matching triggers
fn handle_apply(ctx: &Arc<Context>, cache: &mut HashMap<String, Observed>, cluster: Jmeter) {
    let observed = Observed::of(&cluster);
    let previous = cache.insert(cache_key(&cluster), observed.clone());

    if cluster.create_time().is_none() {
        tokio::spawn(deliver(ctx.clone(), cluster.clone(), Trigger::Create));
    }

    let Some(previous) = previous else {
        // first sighting, nothing to diff against
        return;
    };
    if previous.instances != observed.instances {
        tokio::spawn(deliver(
            ctx.clone(),
            cluster.clone(),
            Trigger::Instances(previous.instances),
        ));
    }
    if previous.command != observed.command {
        if let Some(command) = observed.command {
            tokio::spawn(deliver(ctx.clone(), cluster, Trigger::Command(command)));
        }
    }
}

/// Re-derive a trigger against a freshly fetched document before a retry
///
/// A command edited during the backoff window must be dispatched with its
/// latest value; a command cleared in the meantime drops the delivery.
/// Other trigger kinds read everything they need from the document itself.
fn refresh_trigger(trigger: Trigger, current: &Jmeter) -> Option<Trigger> {
    match trigger {
        Trigger::Command(_) => match &current.spec.command {
            Some(command) if !command.trim().is_empty() => {
                Some(Trigger::Command(command.clone()))
            }
            _ => None,
        },
        other => Some(other),
    }
}

/// Run one trigger, re-fetching and re-delivering after the backoff for
/// retryable failures; fatal failures are logged and dropped
async fn deliver(ctx: Arc<Context>, cluster: Jmeter, trigger: Trigger) {
    let name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_default();
    let mut current = cluster;
    let mut trigger = trigger;
    loop {
        let result = match &trigger {
            Trigger::Create => ctx.on_create(&current).await,
            Trigger::Command(command) => ctx.on_command_change(&current, command).await,
            Trigger::Instances(previous) => ctx.on_instances_change(&current, *previous).await,
            Trigger::Delete => ctx.on_delete(&current).await,
        };
        let error = match result {
            Ok(()) => return,
            Err(e) => e,
        };
        let Some(delay) = error.retry_after() else {
            error!(cluster = %name, error = %error, "trigger failed");
            return;
        };
        warn!(
            cluster = %name,
            error = %error,
            delay_secs = delay.as_secs(),
            "trigger failed, retrying"
        );
        tokio::time::sleep(delay).await;
        current = match ctx.store().get_cluster(&name, &namespace).await {
            Ok(cluster) => cluster,
            Err(e) => {
                debug!(cluster = %name, error = %e, "cluster gone before retry");
                return;
            }
        };
        trigger = match refresh_trigger(trigger, &current) {
            Some(trigger) => trigger,
            None => {
                debug!(cluster = %name, "command cleared during backoff, dropping delivery");
                return;
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cluster_with_command(command: Option<&str>) -> Jmeter {
        let mut doc = json!({
            "apiVersion": "jmeter.zs.com/v1",
            "kind": "Jmeter",
            "metadata": { "name": "perf-a", "namespace": "load" },
            "spec": { "instances": 2 },
        });
        if let Some(command) = command {
            doc["spec"]["command"] = json!(command);
        }
        serde_json::from_value(doc).unwrap()
    }

    /// A command edited during the backoff window is retried with its
    /// latest value, not the one captured at delivery time.
    #[test]
    fn test_retry_picks_up_edited_command() {
        let current = cluster_with_command(Some("sh /opt/config/v2.sh"));
        let refreshed =
            refresh_trigger(Trigger::Command("sh /opt/config/v1.sh".to_string()), &current);
        match refreshed {
            Some(Trigger::Command(command)) => assert_eq!(command, "sh /opt/config/v2.sh"),
            _ => panic!("expected refreshed command trigger"),
        }
    }

    /// A command cleared during the backoff window drops the delivery.
    #[test]
    fn test_retry_drops_cleared_command() {
        for gone in [cluster_with_command(None), cluster_with_command(Some("  "))] {
            let refreshed = refresh_trigger(Trigger::Command("sh run.sh".to_string()), &gone);
            assert!(refreshed.is_none());
        }
    }

    /// Non-command triggers pass through the refresh unchanged.
    #[test]
    fn test_retry_keeps_other_triggers() {
        let current = cluster_with_command(None);
        assert!(matches!(
            refresh_trigger(Trigger::Create, &current),
            Some(Trigger::Create)
        ));
        assert!(matches!(
            refresh_trigger(Trigger::Instances(Some(2)), &current),
            Some(Trigger::Instances(Some(2)))
        ));
        assert!(matches!(
            refresh_trigger(Trigger::Delete, &current),
            Some(Trigger::Delete)
        ));
    }
}
