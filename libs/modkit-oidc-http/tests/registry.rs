#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Caching, single-flight and expiry behaviour of the client registry.

mod common;

use common::{CountingPrimary, ok_service};
use modkit_oidc_http::{
    ClientConfiguration, ClientName, ClientRegistry, ConfigError, HandlerService,
    NamedClientPipeline, OptionsMonitor, PrimaryHandler, RegistryConfig, TransportKind,
};
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Duration;

fn counting(primary: CountingPrimary) -> ClientConfiguration {
    ClientConfiguration::new().with_handler_action(move |handler| {
        handler.set_primary(primary.clone());
        Ok(())
    })
}

fn registry_for(name: &ClientName, configuration: ClientConfiguration) -> ClientRegistry {
    ClientRegistry::new(RegistryConfig::default())
        .with_provider(NamedClientPipeline::new(name.clone(), OptionsMonitor::new(configuration)))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_access_builds_once() {
    let builds = Arc::new(AtomicUsize::new(0));
    let primary = CountingPrimary {
        build_delay: Duration::from_millis(100),
        ..CountingPrimary::new(&builds)
    };
    let name = ClientName::new("idp");
    let registry = Arc::new(registry_for(&name, counting(primary)));

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let name = name.clone();
            tokio::spawn(async move { registry.get_or_create(&name).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(builds.load(Ordering::SeqCst), 1);
    assert_eq!(registry.active_names(), vec![name]);
}

/// Primary whose build blocks until released, or gives up after a while.
#[derive(Clone)]
struct GatedPrimary {
    started: Arc<AtomicBool>,
    release: Arc<Mutex<mpsc::Receiver<()>>>,
    released: Arc<AtomicBool>,
}

impl PrimaryHandler for GatedPrimary {
    fn kind(&self) -> TransportKind {
        TransportKind::Custom("gated")
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_service(self: Box<Self>) -> Result<HandlerService, ConfigError> {
        self.started.store(true, Ordering::SeqCst);
        let signal = self
            .release
            .lock()
            .unwrap()
            .recv_timeout(Duration::from_secs(5));
        self.released.store(signal.is_ok(), Ordering::SeqCst);
        Ok(ok_service())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_build_does_not_block_other_names() {
    let (release_tx, release_rx) = mpsc::channel();
    let gated = GatedPrimary {
        started: Arc::new(AtomicBool::new(false)),
        release: Arc::new(Mutex::new(release_rx)),
        released: Arc::new(AtomicBool::new(false)),
    };
    let builds = Arc::new(AtomicUsize::new(0));
    let slow = ClientName::new("slow");
    let fast = ClientName::new("fast");

    let slow_configuration = {
        let gated = gated.clone();
        ClientConfiguration::new().with_handler_action(move |handler| {
            handler.set_primary(gated.clone());
            Ok(())
        })
    };
    let registry = Arc::new(
        registry_for(&slow, slow_configuration).with_provider(NamedClientPipeline::new(
            fast.clone(),
            OptionsMonitor::new(counting(CountingPrimary::new(&builds))),
        )),
    );

    let slow_task = {
        let registry = Arc::clone(&registry);
        let slow = slow.clone();
        tokio::spawn(async move { registry.get_or_create(&slow).await })
    };
    while !gated.started.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    registry.get_or_create(&fast).await.unwrap();
    assert_eq!(builds.load(Ordering::SeqCst), 1);

    release_tx.send(()).unwrap();
    slow_task.await.unwrap().unwrap();
    assert!(
        gated.released.load(Ordering::SeqCst),
        "slow build finished only after the fast one"
    );
}

#[tokio::test]
async fn expired_handler_is_rebuilt_and_old_client_keeps_working() {
    let builds = Arc::new(AtomicUsize::new(0));
    let name = ClientName::new("idp");
    let registry = ClientRegistry::new(RegistryConfig {
        handler_lifetime: Duration::from_millis(50),
        ..RegistryConfig::default()
    })
    .with_provider(NamedClientPipeline::new(
        name.clone(),
        OptionsMonitor::new(counting(CountingPrimary::new(&builds))),
    ));

    let old = registry.get_or_create(&name).await.unwrap();
    registry.get_or_create(&name).await.unwrap();
    assert_eq!(builds.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(registry.active_names().is_empty());

    registry.get_or_create(&name).await.unwrap();
    assert_eq!(builds.load(Ordering::SeqCst), 2);

    let body = old
        .get("http://x.test/")
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "ok");
}

#[tokio::test]
async fn updated_options_apply_to_the_next_build() {
    let builds = Arc::new(AtomicUsize::new(0));
    let with_timeout = |secs: u64| {
        counting(CountingPrimary::new(&builds)).with_client_action(move |settings| {
            settings.timeout = Duration::from_secs(secs);
            Ok(())
        })
    };
    let name = ClientName::new("idp");
    let options = OptionsMonitor::new(with_timeout(10));
    let registry = ClientRegistry::new(RegistryConfig::default())
        .with_provider(NamedClientPipeline::new(name.clone(), options.clone()));

    let client = registry.get_or_create(&name).await.unwrap();
    assert_eq!(client.timeout(), Duration::from_secs(10));

    options.update(with_timeout(20));
    let cached = registry.get_or_create(&name).await.unwrap();
    assert_eq!(cached.timeout(), Duration::from_secs(10));

    assert!(registry.evict(&name));
    let rebuilt = registry.get_or_create(&name).await.unwrap();
    assert_eq!(rebuilt.timeout(), Duration::from_secs(20));
    assert_eq!(builds.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn active_names_lists_built_clients_only() {
    let builds = Arc::new(AtomicUsize::new(0));
    let idp = ClientName::new("idp");
    let broken = ClientName::new("broken");
    let registry = registry_for(&idp, counting(CountingPrimary::new(&builds))).with_provider(
        NamedClientPipeline::new(
            broken.clone(),
            OptionsMonitor::new(ClientConfiguration::new().with_client_action(|_| {
                Err(ConfigError::Invalid("missing issuer".to_owned()))
            })),
        ),
    );

    registry.get_or_create(&idp).await.unwrap();
    let err = registry.get_or_create(&broken).await.unwrap_err();

    assert!(matches!(err, ConfigError::Invalid(_)));
    assert_eq!(registry.active_names(), vec![idp]);
}
