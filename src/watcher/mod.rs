//! Cluster side of the controller: watches Ingresses, Services and Secrets
//! and hands a fresh payload to the server after every burst of changes.

use crate::debounce::Debouncer;
use crate::server::Server;
use futures_util::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, ListParams, WatchEvent};
use kube::{Client, Error, Resource};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

mod state;

pub use state::{build_payload, SecretError};

const REWATCH_DELAY: Duration = Duration::from_secs(5);

pub struct Watcher {
    client: Client,
}

impl Watcher {
    pub async fn connect() -> Result<Self, Error> {
        let client = Client::try_default().await?;

        Ok(Watcher { client })
    }

    /// Keeps `server` up to date until `shutdown` is cancelled.
    ///
    /// If listing the cluster fails, the server keeps its last snapshot and
    /// the next change triggers another attempt.
    pub async fn run(&self, server: Arc<Server>, debounce: Duration, shutdown: CancellationToken) {
        let debouncer = Debouncer::new(debounce);
        // Build the first snapshot without waiting for an event.
        debouncer.trigger();

        let rebuild = debouncer.run(|| {
            let server = server.clone();
            async move {
                match self.payload().await {
                    Ok(payload) => {
                        if let Err(e) = server.update_payload(payload) {
                            error!("Rejected cluster state, keeping the current snapshot: {}", e);
                        }
                    }
                    Err(e) => error!("Failed to list cluster state: {}", e),
                }
            }
        });

        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = rebuild => {}
            _ = self.watch::<Ingress>(&debouncer) => {}
            _ = self.watch::<Service>(&debouncer) => {}
            _ = self.watch::<Secret>(&debouncer) => {}
        }

        debug!("Watcher stopped.");
    }

    async fn payload(&self) -> Result<crate::payload::Payload, Error> {
        let ingresses = self.list::<Ingress>().await?;
        let services = self.list::<Service>().await?;
        let secrets = self.list::<Secret>().await?;

        debug!(
            "Listed {} ingress(es), {} service(s) and {} secret(s).",
            ingresses.len(),
            services.len(),
            secrets.len()
        );

        Ok(build_payload(ingresses, &services, &secrets))
    }

    async fn list<K>(&self) -> Result<Vec<K>, Error>
    where
        K: Resource + Clone + DeserializeOwned + Debug,
        <K as Resource>::DynamicType: Default,
    {
        let api: Api<K> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    /// Triggers `debouncer` on every change to objects of kind `K`. Watches
    /// that end or fail are started again after a pause.
    async fn watch<K>(&self, debouncer: &Debouncer)
    where
        K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
        <K as Resource>::DynamicType: Default,
    {
        let api: Api<K> = Api::all(self.client.clone());
        let kind = K::kind(&Default::default()).to_string();

        loop {
            match api.watch(&ListParams::default(), "0").await {
                Ok(stream) => {
                    let mut stream = stream.boxed();
                    loop {
                        match stream.try_next().await {
                            Ok(Some(WatchEvent::Error(e))) => {
                                warn!("{} watch error: {}", kind, e);
                                break;
                            }
                            Ok(Some(_)) => debouncer.trigger(),
                            Ok(None) => break,
                            Err(e) => {
                                warn!("{} watch failed: {}", kind, e);
                                break;
                            }
                        }
                    }
                }
                Err(e) => warn!("Failed to watch {}: {}", kind, e),
            }

            debug!("Restarting {} watch in {:?}.", kind, REWATCH_DELAY);
            tokio::time::sleep(REWATCH_DELAY).await;
        }
    }
}
